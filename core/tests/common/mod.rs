//! Scripted in-process engine shared by the integration tests.
//!
//! Programs are selected by the bytecode text:
//!
//! | bytecode   | `call`                          | `image_call`            |
//! |------------|---------------------------------|-------------------------|
//! | `add`      | elementwise sum of two f32s     | -                       |
//! | `identity` | returns the inputs              | returns the input       |
//! | `invert`   | -                               | `255 - v` on every byte |
//! | `fail`     | engine failure                  | engine failure          |

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use live_nx_iree::capture::ImageSource;
use live_nx_iree::codec;
use live_nx_iree::{BridgeError, BytecodeModule, Engine, Image, PixelLayout, Result, Tensor};
use tokio::sync::oneshot;

pub const MOCK_FAILURE: &str = "INVALID_ARGUMENT; mock program failed";

#[derive(Debug, Default)]
pub struct Counters {
    pub calls: AtomicUsize,
    pub image_calls: AtomicUsize,
    pub devices_created: AtomicUsize,
    pub devices_released: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub last_seed: AtomicU32,
    pub last_noise: AtomicU32,
    /// Native release calls in the order they happened.
    pub teardown: Mutex<Vec<&'static str>>,
}

impl Counters {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn image_calls(&self) -> usize {
        self.image_calls.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.devices_released.load(Ordering::SeqCst)
    }

    pub fn last_noise(&self) -> f32 {
        f32::from_bits(self.last_noise.load(Ordering::SeqCst))
    }

    pub fn teardown(&self) -> Vec<&'static str> {
        self.teardown.lock().unwrap().clone()
    }
}

pub struct MockDevice {
    pub uri: String,
    counters: Arc<Counters>,
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.counters.devices_released.fetch_add(1, Ordering::SeqCst);
        self.counters.teardown.lock().unwrap().push("release_device");
    }
}

pub struct MockEngine {
    devices: Vec<String>,
    delay: Duration,
    pub counters: Arc<Counters>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            devices: vec!["local-sync://".to_string(), "local-task://".to_string()],
            delay: Duration::ZERO,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_devices(mut self, devices: &[&str]) -> Self {
        self.devices = devices.iter().map(|d| d.to_string()).collect();
        self
    }

    /// Make every call block for `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn enter(&self) -> ActiveGuard<'_> {
        let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_active.fetch_max(active, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        ActiveGuard(&self.counters)
    }
}

impl Drop for MockEngine {
    fn drop(&mut self) {
        self.counters.teardown.lock().unwrap().push("release_instance");
    }
}

struct ActiveGuard<'a>(&'a Counters);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Engine for MockEngine {
    type Device = MockDevice;

    fn list_devices(&self) -> Vec<String> {
        self.devices.clone()
    }

    fn create_device(&self, uri: &str) -> Result<MockDevice> {
        if !self.devices.iter().any(|d| d == uri) {
            return Err(BridgeError::device_creation(uri, "no such device"));
        }
        self.counters.devices_created.fetch_add(1, Ordering::SeqCst);
        Ok(MockDevice {
            uri: uri.to_string(),
            counters: self.counters.clone(),
        })
    }

    fn call(
        &self,
        _device: &MockDevice,
        module: &BytecodeModule,
        inputs: &[Tensor],
        _num_outputs: usize,
    ) -> Result<Vec<Tensor>> {
        self.counters.calls.fetch_add(1, Ordering::SeqCst);
        let _active = self.enter();

        match module.as_bytes() {
            b"add" => {
                let [lhs, rhs] = inputs else {
                    return Err(BridgeError::engine_failure("add expects 2 inputs"));
                };
                let lhs = lhs.to_vec::<f32>()?;
                let rhs = rhs.to_vec::<f32>()?;
                let sum: Vec<f32> = lhs.iter().zip(&rhs).map(|(a, b)| a + b).collect();
                Ok(vec![Tensor::from_values(vec![sum.len()], &sum)?])
            }
            b"identity" => Ok(inputs.to_vec()),
            b"fail" => Err(BridgeError::engine_failure(MOCK_FAILURE)),
            other => Err(BridgeError::engine_failure(format!(
                "unknown program {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    fn image_call(
        &self,
        _device: &MockDevice,
        module: &BytecodeModule,
        input: &Tensor,
        seed: u32,
        noise_amount: f32,
    ) -> Result<Tensor> {
        self.counters.image_calls.fetch_add(1, Ordering::SeqCst);
        self.counters.last_seed.store(seed, Ordering::SeqCst);
        self.counters
            .last_noise
            .store(noise_amount.to_bits(), Ordering::SeqCst);
        let _active = self.enter();

        match module.as_bytes() {
            b"invert" => {
                let data = input.data().iter().map(|v| 255 - v).collect();
                Tensor::new(input.element_type(), input.shape().to_vec(), data)
            }
            b"identity" => Ok(input.clone()),
            b"fail" => Err(BridgeError::engine_failure(MOCK_FAILURE)),
            other => Err(BridgeError::engine_failure(format!(
                "unknown program {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

/// Bytecode for one of the scripted programs.
pub fn module(name: &str) -> BytecodeModule {
    BytecodeModule::new(name.as_bytes().to_vec())
}

/// Transport encoding of a scripted program.
pub fn encoded_module(name: &str) -> String {
    codec::encode_bytes(name.as_bytes())
}

pub fn solid_image(width: u32, height: u32, value: u8) -> Image {
    let len = (width * height * 4) as usize;
    Image::new(width, height, PixelLayout::Rgba, vec![value; len]).unwrap()
}

/// Answers every request immediately with the same frame.
pub struct SolidSource {
    frame: Image,
    pub requests: AtomicUsize,
}

impl SolidSource {
    pub fn new(width: u32, height: u32, value: u8) -> Self {
        Self {
            frame: solid_image(width, height, value),
            requests: AtomicUsize::new(0),
        }
    }
}

impl ImageSource for SolidSource {
    fn request_frame(&self, reply: oneshot::Sender<Image>) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let _ = reply.send(self.frame.clone());
    }
}

/// Accepts requests and never answers them.
#[derive(Default)]
pub struct SilentSource {
    pending: Mutex<Vec<oneshot::Sender<Image>>>,
}

impl ImageSource for SilentSource {
    fn request_frame(&self, reply: oneshot::Sender<Image>) {
        self.pending.lock().unwrap().push(reply);
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
