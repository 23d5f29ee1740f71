//! Image sources for the capture loop.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::capture::ImageSource;
use crate::error::{BridgeError, Result};
use crate::frame::Image;

/// Replays a fixed set of frames in a loop.
///
/// Stands in for a camera when running the capture loop from the command
/// line or in tests.
pub struct FrameDirectory {
    frames: Vec<Image>,
    next: AtomicUsize,
}

impl FrameDirectory {
    /// Load every PNG in `dir`, ordered by file name.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(BridgeError::FileNotFound(dir.to_path_buf()));
        }

        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("png"))
            })
            .collect();
        paths.sort();

        let frames = paths
            .iter()
            .map(|path| {
                debug!(path = %path.display(), "Loading frame");
                Image::load(path)
            })
            .collect::<Result<Vec<_>>>()?;

        info!(dir = %dir.display(), frames = frames.len(), "Opened frame directory");
        Self::from_frames(frames)
            .map_err(|_| BridgeError::config(format!("No PNG frames in {}", dir.display())))
    }

    pub fn from_frames(frames: Vec<Image>) -> Result<Self> {
        if frames.is_empty() {
            return Err(BridgeError::config("Frame source needs at least one frame"));
        }
        Ok(Self {
            frames,
            next: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The next frame, wrapping around after the last one.
    pub fn next_frame(&self) -> Image {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.frames.len();
        self.frames[index].clone()
    }
}

impl ImageSource for FrameDirectory {
    fn request_frame(&self, reply: oneshot::Sender<Image>) {
        // The tick may already have been cancelled.
        let _ = reply.send(self.next_frame());
    }
}
