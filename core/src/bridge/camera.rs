//! Capture-mode attribute binding.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info};

use super::Bridge;
use crate::capture::{
    CaptureLoop, CapturePipeline, CaptureState, CaptureStats, ImageSource, NoiseControl, SeedPolicy,
};
use crate::codec::{self, BytecodeModule};
use crate::config::CaptureConfig;
use crate::engine::Engine;
use crate::error::{BridgeError, Result};
use crate::frame::Image;

/// Attributes of one camera view, driving a [`CaptureLoop`].
///
/// The loop runs while bytecode and a device are both present. Changing the
/// bytecode, device or target size restarts it; the noise amount is read
/// live on every tick.
pub struct CameraBinding<E: Engine> {
    bridge: Bridge<E>,
    capture: Arc<CaptureLoop<E>>,
    source: Arc<dyn ImageSource>,
    module: Option<Arc<BytecodeModule>>,
    width: u32,
    height: u32,
    interval: Duration,
    noise: NoiseControl,
    seed: SeedPolicy,
    output: Arc<watch::Sender<Option<Image>>>,
    loaded: watch::Sender<bool>,
}

impl<E: Engine> CameraBinding<E> {
    pub fn new(
        bridge: Bridge<E>,
        runtime: Handle,
        source: Arc<dyn ImageSource>,
        settings: &CaptureConfig,
    ) -> Result<Self> {
        bridge.ensure_live()?;

        let capture = Arc::new(CaptureLoop::new(runtime).with_frame_timeout(settings.frame_timeout()));
        bridge.register_capture(&capture);

        let (output, _) = watch::channel(None);
        let (loaded, _) = watch::channel(false);

        Ok(Self {
            bridge,
            capture,
            source,
            module: None,
            width: settings.width,
            height: settings.height,
            interval: settings.tick_interval(),
            noise: NoiseControl::new(settings.noise_amount),
            seed: settings.seed_policy(),
            output: Arc::new(output),
            loaded,
        })
    }

    /// Observe the most recently published image.
    pub fn subscribe(&self) -> watch::Receiver<Option<Image>> {
        self.output.subscribe()
    }

    /// Observe whether bytecode is loaded.
    pub fn load_state(&self) -> watch::Receiver<bool> {
        self.loaded.subscribe()
    }

    pub fn state(&self) -> CaptureState {
        self.capture.state()
    }

    pub fn stats(&self) -> CaptureStats {
        self.capture.stats()
    }

    pub fn noise(&self) -> &NoiseControl {
        &self.noise
    }

    /// Set the base64 bytecode payload and restart capture.
    pub fn set_bytecode(&mut self, text: &str) -> Result<()> {
        let module = codec::decode_bytecode(text).inspect_err(|e| self.bridge.report(e))?;
        self.set_module(module)
    }

    /// Set already decoded bytecode and restart capture.
    pub fn set_module(&mut self, module: BytecodeModule) -> Result<()> {
        self.module = Some(Arc::new(module));
        self.loaded.send_replace(true);
        self.restart()
    }

    /// Remove the bytecode and stop capture.
    pub fn clear_bytecode(&mut self) {
        self.module = None;
        self.loaded.send_replace(false);
        self.capture.stop();
    }

    /// Select the device on the bridge and restart capture.
    pub fn set_device(&mut self, uri: &str) -> Result<()> {
        match self.bridge.select_device(uri) {
            Ok(_) => self.restart(),
            Err(e) => {
                self.capture.stop();
                Err(e)
            }
        }
    }

    /// Change the size frames are resized to and restart capture.
    pub fn set_size(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            let err = BridgeError::invalid_invocation(format!(
                "Capture size must be positive, got {}x{}",
                width, height
            ));
            self.bridge.report(&err);
            return Err(err);
        }
        self.width = width;
        self.height = height;
        self.restart()
    }

    /// Change the noise amount without restarting capture.
    pub fn set_noise_amount(&self, amount: f32) {
        self.noise.set(amount);
        debug!(noise_amount = self.noise.get(), "Noise amount changed");
    }

    pub fn set_seed_policy(&mut self, seed: SeedPolicy) -> Result<()> {
        self.seed = seed;
        self.restart()
    }

    /// Start or restart capture with the current attributes, or stop it if
    /// bytecode or a device is missing.
    pub fn restart(&self) -> Result<()> {
        self.bridge.ensure_live()?;

        let (Some(module), Some(device)) = (&self.module, self.bridge.current_device()) else {
            self.capture.stop();
            return Ok(());
        };

        let pipeline = CapturePipeline::new(
            self.bridge.dispatcher(),
            device,
            module.clone(),
            self.width,
            self.height,
        )
        .with_noise(self.noise.clone())
        .with_seed(self.seed);

        let output = self.output.clone();
        self.capture.start(
            Arc::new(pipeline),
            self.interval,
            self.source.clone(),
            move |image| {
                output.send_replace(Some(image));
            },
        )?;
        info!(width = self.width, height = self.height, "Camera capture running");
        Ok(())
    }

    /// Stop capture. Attributes are kept; [`CameraBinding::restart`]
    /// resumes.
    pub fn stop(&self) {
        self.capture.stop();
    }
}

impl<E: Engine> Drop for CameraBinding<E> {
    fn drop(&mut self) {
        self.capture.stop();
    }
}
