//! Pixel images exchanged with the capture pipeline.

use image::{ImageBuffer, Rgb, Rgba, RgbImage, RgbaImage};
use std::path::Path;

use crate::error::{BridgeError, Result};

/// Channel layout of an 8-bit image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelLayout {
    /// 3 channels, R G B byte order.
    Rgb,
    /// 4 channels, R G B A byte order.
    Rgba,
}

impl PixelLayout {
    /// Number of bytes per pixel.
    pub fn channels(self) -> usize {
        match self {
            Self::Rgb => 3,
            Self::Rgba => 4,
        }
    }

    /// Layout for a channel count, if supported.
    pub fn from_channels(channels: usize) -> Option<Self> {
        match channels {
            3 => Some(Self::Rgb),
            4 => Some(Self::Rgba),
            _ => None,
        }
    }
}

/// An 8-bit image stored row-major as `[height, width, channels]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    width: u32,
    height: u32,
    layout: PixelLayout,
    data: Vec<u8>,
}

impl Image {
    /// Create an image, checking that the buffer matches the dimensions.
    pub fn new(width: u32, height: u32, layout: PixelLayout, data: Vec<u8>) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|px| px.checked_mul(layout.channels()))
            .ok_or_else(|| BridgeError::decode("Image dimensions overflow"))?;
        if data.len() != expected {
            return Err(BridgeError::decode(format!(
                "{}x{} image with {} channels needs {} bytes, got {}",
                width,
                height,
                layout.channels(),
                expected,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            layout,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    /// Raw pixel bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Load a PNG (or any format the image crate was built with) as RGBA.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(BridgeError::FileNotFound(path.to_path_buf()));
        }
        let rgba = image::open(path)?.into_rgba8();
        Ok(Self::from(rgba))
    }

    /// Save the image, format chosen from the file extension.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        match self.layout {
            PixelLayout::Rgb => self.to_rgb_buffer()?.save(path)?,
            PixelLayout::Rgba => self.to_rgba_buffer()?.save(path)?,
        }
        Ok(())
    }

    pub(crate) fn to_rgb_buffer(&self) -> Result<RgbImage> {
        ImageBuffer::<Rgb<u8>, _>::from_raw(self.width, self.height, self.data.clone())
            .ok_or_else(|| BridgeError::decode("Pixel buffer does not match RGB layout"))
    }

    pub(crate) fn to_rgba_buffer(&self) -> Result<RgbaImage> {
        ImageBuffer::<Rgba<u8>, _>::from_raw(self.width, self.height, self.data.clone())
            .ok_or_else(|| BridgeError::decode("Pixel buffer does not match RGBA layout"))
    }
}

impl From<RgbaImage> for Image {
    fn from(buffer: RgbaImage) -> Self {
        let (width, height) = buffer.dimensions();
        Self {
            width,
            height,
            layout: PixelLayout::Rgba,
            data: buffer.into_raw(),
        }
    }
}

impl From<RgbImage> for Image {
    fn from(buffer: RgbImage) -> Self {
        let (width, height) = buffer.dimensions();
        Self {
            width,
            height,
            layout: PixelLayout::Rgb,
            data: buffer.into_raw(),
        }
    }
}
