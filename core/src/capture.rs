//! Capture-execute loop.
//!
//! A session ticks at a fixed interval. Each tick asks an [`ImageSource`] for
//! one frame, runs it through the [`CapturePipeline`] on a blocking thread,
//! and publishes the resulting image.
//!
//! At most one tick is in flight at a time, across sessions as well as
//! within one: a tick that fires while the previous one is still running is
//! dropped. A new session therefore never overlaps a call still running
//! against the previous session's device.
//!
//! Every session carries a generation number. [`CaptureLoop::stop`] bumps
//! the generation while holding the publication lock, so once it returns no
//! result from the stopped session can reach the callback. The callback runs
//! under that lock and must not call back into the loop.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{self, BytecodeModule};
use crate::dispatch::Dispatcher;
use crate::engine::{BoundDevice, Engine};
use crate::error::{BridgeError, Result};
use crate::frame::Image;

/// Default time a source gets to answer a frame request.
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_millis(1000);

/// Producer of camera frames.
///
/// The frame may be delivered from any thread, at any later time. Dropping
/// `reply` without sending aborts the tick.
pub trait ImageSource: Send + Sync + 'static {
    fn request_frame(&self, reply: oneshot::Sender<Image>);
}

/// Callback receiving each published image.
pub type ResultCallback = Arc<dyn Fn(Image) + Send + Sync>;

/// Lifecycle state of a [`CaptureLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Running,
    Cancelling,
}

/// How the per-call noise seed is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeedPolicy {
    /// A fresh random seed for every call.
    #[default]
    Random,
    /// The same seed for every call, for reproducible output.
    Fixed(u32),
}

impl SeedPolicy {
    pub fn next_seed(&self) -> u32 {
        match self {
            Self::Random => rand::random::<u32>(),
            Self::Fixed(seed) => *seed,
        }
    }
}

/// Noise amount shared between a running pipeline and its owner.
///
/// Updates take effect on the next tick without restarting the session.
#[derive(Debug, Clone, Default)]
pub struct NoiseControl {
    bits: Arc<AtomicU32>,
}

impl NoiseControl {
    pub fn new(amount: f32) -> Self {
        let control = Self::default();
        control.set(amount);
        control
    }

    /// Set the noise amount, clamped to `[0, 1]`. NaN is treated as 0.
    pub fn set(&self, amount: f32) {
        let amount = if amount.is_nan() {
            0.0
        } else {
            amount.clamp(0.0, 1.0)
        };
        self.bits.store(amount.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// The per-frame work of a session: resize, image call, decode.
pub struct CapturePipeline<E: Engine> {
    device: Arc<BoundDevice<E>>,
    dispatcher: Dispatcher<E>,
    module: Arc<BytecodeModule>,
    width: u32,
    height: u32,
    noise: NoiseControl,
    seed: SeedPolicy,
}

impl<E: Engine> CapturePipeline<E> {
    pub fn new(
        dispatcher: Dispatcher<E>,
        device: Arc<BoundDevice<E>>,
        module: Arc<BytecodeModule>,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            dispatcher,
            device,
            module,
            width,
            height,
            noise: NoiseControl::default(),
            seed: SeedPolicy::default(),
        }
    }

    pub fn with_noise(mut self, noise: NoiseControl) -> Self {
        self.noise = noise;
        self
    }

    pub fn with_seed(mut self, seed: SeedPolicy) -> Self {
        self.seed = seed;
        self
    }

    pub fn noise(&self) -> &NoiseControl {
        &self.noise
    }

    pub fn device(&self) -> &Arc<BoundDevice<E>> {
        &self.device
    }

    /// Target size as `(width, height)`.
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Run one frame through the engine. Blocks for the engine call.
    pub fn process(&self, frame: &Image) -> Result<Image> {
        let input = codec::image_to_tensor(frame, self.width, self.height)?;
        let output = self.dispatcher.image_call_tensor(
            &self.device,
            &self.module,
            &input,
            self.seed.next_seed(),
            self.noise.get(),
        )?;
        codec::tensor_to_image(&output, self.width, self.height)
    }
}

/// Point-in-time capture counters, cumulative over the loop's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Timer ticks observed.
    pub ticks: u64,
    /// Results handed to the callback.
    pub completed: u64,
    /// Ticks aborted by a source, decode or engine failure.
    pub failed: u64,
    /// Ticks dropped because another tick was in flight.
    pub skipped: u64,
    /// Results dropped because their session had been stopped.
    pub discarded: u64,
}

#[derive(Default)]
struct Counters {
    ticks: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    discarded: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

struct Shared {
    generation: Mutex<u64>,
    state: Mutex<CaptureState>,
    in_flight: AtomicBool,
    counters: Counters,
}

impl Shared {
    fn generation(&self) -> MutexGuard<'_, u64> {
        self.generation.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: CaptureState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn state(&self) -> CaptureState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hand `image` to the callback if `generation` is still current.
    fn publish(&self, generation: u64, image: Image, on_result: &ResultCallback) {
        let current = self.generation();
        if *current != generation {
            Counters::bump(&self.counters.discarded);
            debug!(generation, current = *current, "Discarded result from stopped session");
            return;
        }
        on_result(image);
        Counters::bump(&self.counters.completed);
    }
}

/// Clears the in-flight flag when a tick ends, however it ends.
struct InFlight(Arc<Shared>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::Release);
    }
}

struct SessionConfig<E: Engine> {
    pipeline: Arc<CapturePipeline<E>>,
    interval: Duration,
    source: Arc<dyn ImageSource>,
    on_result: ResultCallback,
}

impl<E: Engine> Clone for SessionConfig<E> {
    fn clone(&self) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
            interval: self.interval,
            source: self.source.clone(),
            on_result: self.on_result.clone(),
        }
    }
}

struct Session<E: Engine> {
    generation: u64,
    cancel: CancellationToken,
    ticker: JoinHandle<()>,
    config: SessionConfig<E>,
}

/// Cancellable periodic scheduler driving a [`CapturePipeline`].
pub struct CaptureLoop<E: Engine> {
    runtime: Handle,
    frame_timeout: Duration,
    shared: Arc<Shared>,
    session: Mutex<Option<Session<E>>>,
}

impl<E: Engine> CaptureLoop<E> {
    /// Create an idle loop whose tasks run on `runtime`.
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            frame_timeout: DEFAULT_FRAME_TIMEOUT,
            shared: Arc::new(Shared {
                generation: Mutex::new(0),
                state: Mutex::new(CaptureState::Idle),
                in_flight: AtomicBool::new(false),
                counters: Counters::default(),
            }),
            session: Mutex::new(None),
        }
    }

    pub fn with_frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout = timeout;
        self
    }

    fn session(&self) -> MutexGuard<'_, Option<Session<E>>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> CaptureState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == CaptureState::Running
    }

    pub fn stats(&self) -> CaptureStats {
        self.shared.counters.snapshot()
    }

    /// Start a session, stopping the current one first.
    ///
    /// The first tick fires one `interval` after this call.
    pub fn start(
        &self,
        pipeline: Arc<CapturePipeline<E>>,
        interval: Duration,
        source: Arc<dyn ImageSource>,
        on_result: impl Fn(Image) + Send + Sync + 'static,
    ) -> Result<()> {
        self.start_session(SessionConfig {
            pipeline,
            interval,
            source,
            on_result: Arc::new(on_result),
        })
    }

    /// Restart the running session with a new pipeline, keeping its
    /// interval, source and callback.
    pub fn reconfigure(&self, pipeline: Arc<CapturePipeline<E>>) -> Result<()> {
        let config = self
            .session()
            .as_ref()
            .map(|session| session.config.clone())
            .ok_or_else(|| BridgeError::lifecycle("Capture loop is not running"))?;
        self.start_session(SessionConfig { pipeline, ..config })
    }

    /// Restart the running session unchanged.
    pub fn restart(&self) -> Result<()> {
        let config = self
            .session()
            .as_ref()
            .map(|session| session.config.clone())
            .ok_or_else(|| BridgeError::lifecycle("Capture loop is not running"))?;
        self.start_session(config)
    }

    /// Cancel the session. No result is published after this returns; a
    /// tick already running finishes in the background and is discarded.
    pub fn stop(&self) {
        let mut session = self.session();
        self.stop_locked(&mut session);
    }

    fn stop_locked(&self, slot: &mut Option<Session<E>>) {
        let Some(session) = slot.take() else {
            return;
        };

        self.shared.set_state(CaptureState::Cancelling);
        *self.shared.generation() += 1;
        session.cancel.cancel();
        session.ticker.abort();
        self.shared.set_state(CaptureState::Idle);

        info!(generation = session.generation, "Capture stopped");
    }

    fn start_session(&self, config: SessionConfig<E>) -> Result<()> {
        if config.interval.is_zero() {
            return Err(BridgeError::config("Tick interval must be non-zero"));
        }

        let mut slot = self.session();
        self.stop_locked(&mut slot);

        let generation = *self.shared.generation();
        let cancel = CancellationToken::new();
        let ticker = self.runtime.spawn(run_ticker(
            generation,
            config.clone(),
            self.frame_timeout,
            cancel.clone(),
            self.shared.clone(),
        ));

        *slot = Some(Session {
            generation,
            cancel,
            ticker,
            config,
        });
        self.shared.set_state(CaptureState::Running);

        info!(generation, "Capture started");
        Ok(())
    }
}

impl<E: Engine> Drop for CaptureLoop<E> {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_ticker<E: Engine>(
    generation: u64,
    config: SessionConfig<E>,
    frame_timeout: Duration,
    cancel: CancellationToken,
    shared: Arc<Shared>,
) {
    let mut ticker = time::interval_at(Instant::now() + config.interval, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        Counters::bump(&shared.counters.ticks);
        if shared
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            Counters::bump(&shared.counters.skipped);
            debug!(generation, "Tick skipped, previous tick still running");
            continue;
        }

        let guard = InFlight(shared.clone());
        tokio::spawn(run_tick(
            generation,
            config.clone(),
            frame_timeout,
            cancel.clone(),
            guard,
        ));
    }
}

async fn run_tick<E: Engine>(
    generation: u64,
    config: SessionConfig<E>,
    frame_timeout: Duration,
    cancel: CancellationToken,
    guard: InFlight,
) {
    let shared = guard.0.clone();
    if cancel.is_cancelled() {
        return;
    }

    let (reply, frame) = oneshot::channel();
    config.source.request_frame(reply);

    let frame = tokio::select! {
        _ = cancel.cancelled() => return,
        frame = time::timeout(frame_timeout, frame) => frame,
    };
    let frame = match frame {
        Ok(Ok(frame)) => frame,
        Ok(Err(_)) => {
            Counters::bump(&shared.counters.failed);
            warn!(generation, "Image source dropped the frame request");
            return;
        }
        Err(_) => {
            Counters::bump(&shared.counters.failed);
            warn!(generation, timeout_ms = frame_timeout.as_millis() as u64, "Frame request timed out");
            return;
        }
    };

    let pipeline = config.pipeline.clone();
    let outcome = tokio::task::spawn_blocking(move || pipeline.process(&frame)).await;

    match outcome {
        Ok(Ok(image)) => shared.publish(generation, image, &config.on_result),
        Ok(Err(e)) => {
            Counters::bump(&shared.counters.failed);
            warn!(generation, stage = %e.stage(), "Capture tick failed: {}", e);
        }
        Err(e) => {
            Counters::bump(&shared.counters.failed);
            warn!(generation, "Capture tick panicked: {}", e);
        }
    }

    drop(guard);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noise_control_clamps() {
        let noise = NoiseControl::new(0.25);
        assert_eq!(noise.get(), 0.25);
        noise.set(3.0);
        assert_eq!(noise.get(), 1.0);
        noise.set(-1.0);
        assert_eq!(noise.get(), 0.0);
        noise.set(f32::NAN);
        assert_eq!(noise.get(), 0.0);
    }

    #[test]
    fn test_noise_control_is_shared() {
        let noise = NoiseControl::default();
        let other = noise.clone();
        other.set(0.5);
        assert_eq!(noise.get(), 0.5);
    }

    #[test]
    fn test_fixed_seed() {
        let seed = SeedPolicy::Fixed(42);
        assert_eq!(seed.next_seed(), 42);
        assert_eq!(seed.next_seed(), 42);
        assert_eq!(SeedPolicy::default(), SeedPolicy::Random);
    }
}
