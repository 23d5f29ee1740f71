//! The bridge's current device.
//!
//! Devices are handed out as `Arc<BoundDevice>`: swapping in a new device
//! never invalidates a call already running on the old one, and the old
//! native handle is released when the last such call drops its reference.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use super::Engine;
use crate::error::Result;

/// A created device together with the URI and slot version it was bound at.
pub struct BoundDevice<E: Engine> {
    uri: String,
    version: u64,
    device: E::Device,
}

impl<E: Engine> BoundDevice<E> {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Slot version at which this device was bound.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn device(&self) -> &E::Device {
        &self.device
    }
}

impl<E: Engine> fmt::Debug for BoundDevice<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundDevice")
            .field("uri", &self.uri)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

struct SlotState<E: Engine> {
    current: Option<Arc<BoundDevice<E>>>,
    version: u64,
}

/// Holds at most one live device; replacements are serialized.
pub struct DeviceSlot<E: Engine> {
    state: Mutex<SlotState<E>>,
}

impl<E: Engine> Default for DeviceSlot<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Engine> DeviceSlot<E> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                current: None,
                version: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState<E>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a device for `uri` and make it current.
    ///
    /// The new device is created before the old one is let go. If creation
    /// fails the slot is left empty, so nothing keeps running against a
    /// device the caller asked to move away from.
    pub fn replace(&self, engine: &E, uri: &str) -> Result<Arc<BoundDevice<E>>> {
        let mut state = self.lock();
        state.version += 1;
        let version = state.version;

        match engine.create_device(uri) {
            Ok(device) => {
                let bound = Arc::new(BoundDevice {
                    uri: uri.to_string(),
                    version,
                    device,
                });
                if let Some(old) = state.current.replace(bound.clone()) {
                    debug!(
                        uri = old.uri(),
                        in_flight = Arc::strong_count(&old) - 1,
                        "Superseded device"
                    );
                }
                info!(uri, version, "Device selected");
                Ok(bound)
            }
            Err(e) => {
                state.current = None;
                Err(e)
            }
        }
    }

    /// Drop the current device, returning it if one was bound.
    pub fn clear(&self) -> Option<Arc<BoundDevice<E>>> {
        let mut state = self.lock();
        state.version += 1;
        state.current.take()
    }

    pub fn current(&self) -> Option<Arc<BoundDevice<E>>> {
        self.lock().current.clone()
    }

    pub fn version(&self) -> u64 {
        self.lock().version
    }
}
