//! Bridge context.
//!
//! A [`Bridge`] owns everything one UI mount needs: the shared engine, the
//! current device, and the channel that carries events back up to the UI
//! layer. Attribute bindings ([`FunctionBinding`], [`CameraBinding`]) hold a
//! clone of the bridge and turn attribute changes into invocations.

mod camera;
mod function;

pub use camera::CameraBinding;
pub use function::FunctionBinding;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{info, warn};

use crate::capture::CaptureLoop;
use crate::codec::BytecodeModule;
use crate::dispatch::{Dispatcher, InvocationResult};
use crate::engine::{BoundDevice, DeviceDirectory, DeviceSlot, Engine};
use crate::error::{BridgeError, Result, Stage};
use crate::frame::Image;
use crate::tensor::Tensor;

/// Events emitted upward to the UI layer.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// Device URIs found at mount time.
    DevicesListed(Vec<String>),
    /// A tensor-mode invocation finished; outputs are transport encoded.
    Executed {
        outputs: Vec<String>,
        latency_ms: f64,
    },
    /// An image-mode invocation finished.
    ImageReady(Image),
    /// An operation failed at the given stage.
    Failed { stage: Stage, message: String },
}

impl BridgeEvent {
    pub fn failed(err: &BridgeError) -> Self {
        Self::Failed {
            stage: err.stage(),
            message: err.to_string(),
        }
    }
}

/// Anything that must be cancelled when the bridge unmounts.
trait Cancellable: Send + Sync {
    fn cancel(&self);
}

impl<E: Engine> Cancellable for CaptureLoop<E> {
    fn cancel(&self) {
        self.stop();
    }
}

// Fields drop in order: the device slot goes before the engine it was
// created from.
struct Inner<E: Engine> {
    slot: DeviceSlot<E>,
    dispatcher: Dispatcher<E>,
    events: UnboundedSender<BridgeEvent>,
    sessions: Mutex<Vec<Weak<dyn Cancellable>>>,
    mounted: AtomicBool,
    unmounted: AtomicBool,
}

/// Explicit context for one UI mount.
///
/// Cloning is cheap; clones share the engine, device and event channel.
pub struct Bridge<E: Engine> {
    inner: Arc<Inner<E>>,
}

impl<E: Engine> Clone for Bridge<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: Engine> Bridge<E> {
    /// Create a bridge and the receiving end of its event channel.
    pub fn new(engine: E) -> (Self, UnboundedReceiver<BridgeEvent>) {
        Self::with_engine(Arc::new(engine))
    }

    /// Create a bridge over an engine shared with other bridges.
    pub fn with_engine(engine: Arc<E>) -> (Self, UnboundedReceiver<BridgeEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let bridge = Self {
            inner: Arc::new(Inner {
                dispatcher: Dispatcher::new(engine),
                slot: DeviceSlot::new(),
                events,
                sessions: Mutex::new(Vec::new()),
                mounted: AtomicBool::new(false),
                unmounted: AtomicBool::new(false),
            }),
        };
        (bridge, rx)
    }

    pub fn engine(&self) -> &Arc<E> {
        self.inner.dispatcher.engine()
    }

    pub fn dispatcher(&self) -> Dispatcher<E> {
        self.inner.dispatcher.clone()
    }

    pub fn is_mounted(&self) -> bool {
        self.inner.mounted.load(Ordering::Acquire) && !self.is_unmounted()
    }

    fn is_unmounted(&self) -> bool {
        self.inner.unmounted.load(Ordering::Acquire)
    }

    /// Fail with `ResourceLifecycle` once the bridge has been unmounted.
    pub fn ensure_live(&self) -> Result<()> {
        if self.is_unmounted() {
            Err(BridgeError::lifecycle("Bridge already unmounted"))
        } else {
            Ok(())
        }
    }

    /// Query the device directory and publish it.
    pub fn mount(&self) -> Result<DeviceDirectory> {
        self.ensure_live()?;
        let directory = DeviceDirectory::query(self.engine().as_ref());
        self.inner.mounted.store(true, Ordering::Release);
        info!(devices = directory.len(), "Bridge mounted");
        self.emit(BridgeEvent::DevicesListed(directory.uris().to_vec()));
        Ok(directory)
    }

    /// Cancel every capture session and release the device.
    ///
    /// Calls still in flight keep their device alive until they return.
    pub fn unmount(&self) {
        if self.inner.unmounted.swap(true, Ordering::AcqRel) {
            return;
        }

        let sessions = std::mem::take(
            &mut *self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for session in sessions.iter().filter_map(Weak::upgrade) {
            session.cancel();
        }

        self.inner.slot.clear();
        self.inner.mounted.store(false, Ordering::Release);
        info!("Bridge unmounted");
    }

    /// Create a device for `uri` and make it current.
    ///
    /// On failure the previous device is released as well and no invocation
    /// can run until a device is selected successfully.
    pub fn select_device(&self, uri: &str) -> Result<Arc<BoundDevice<E>>> {
        self.ensure_live()?;
        self.inner
            .slot
            .replace(self.engine().as_ref(), uri)
            .inspect_err(|e| self.report(e))
    }

    pub fn current_device(&self) -> Option<Arc<BoundDevice<E>>> {
        self.inner.slot.current()
    }

    /// The current device, or `NoDevice`.
    pub fn require_device(&self) -> Result<Arc<BoundDevice<E>>> {
        self.ensure_live()?;
        self.current_device().ok_or(BridgeError::NoDevice)
    }

    /// Run a tensor-mode invocation on the current device and emit the
    /// outcome.
    pub fn invoke(
        &self,
        module: &BytecodeModule,
        inputs: &[Tensor],
        num_outputs: usize,
    ) -> Result<InvocationResult> {
        let outcome = self.require_device().and_then(|device| {
            self.inner
                .dispatcher
                .call(&device, module, inputs, num_outputs)
        });

        match outcome {
            Ok(result) => {
                self.emit(BridgeEvent::Executed {
                    outputs: result.encode(),
                    latency_ms: result.latency_ms,
                });
                Ok(result)
            }
            Err(e) => {
                self.report(&e);
                Err(e)
            }
        }
    }

    /// Run an image-mode invocation on the current device and emit the
    /// resulting image.
    pub fn invoke_image(
        &self,
        module: &BytecodeModule,
        input: &Image,
        seed: u32,
        noise_amount: f32,
    ) -> Result<Image> {
        let outcome = self.require_device().and_then(|device| {
            self.inner
                .dispatcher
                .image_call(&device, module, input, seed, noise_amount)
        });

        match outcome {
            Ok(image) => {
                self.emit(BridgeEvent::ImageReady(image.clone()));
                Ok(image)
            }
            Err(e) => {
                self.report(&e);
                Err(e)
            }
        }
    }

    /// Emit an event. Events are dropped once the receiver is gone.
    pub fn emit(&self, event: BridgeEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Log a failure and emit it upward.
    pub fn report(&self, err: &BridgeError) {
        warn!(stage = %err.stage(), "{}", err);
        self.emit(BridgeEvent::failed(err));
    }

    /// Register a capture loop to be stopped on unmount.
    pub(crate) fn register_capture(&self, capture: &Arc<CaptureLoop<E>>) {
        let capture: Arc<dyn Cancellable> = capture.clone();
        let mut sessions = self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.retain(|s| s.strong_count() > 0);
        sessions.push(Arc::downgrade(&capture));
    }
}
