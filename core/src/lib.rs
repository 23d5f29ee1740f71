//! live-nx-iree: Bridge a reactive UI layer to a native IREE tensor engine.
//!
//! This crate loads compiled bytecode, selects an execution device, marshals
//! tensors and camera images into the engine's buffer format, and invokes
//! the engine either once per attribute change or continuously from a
//! timer-driven capture loop. Native resources (engine instance, devices,
//! returned buffers) are owned by Rust values and released on drop.
//!
//! The engine is a shared library exporting the `nx_iree_*` C ABI. It is
//! opened at runtime, so the crate builds without the engine present.
//!
//! # Example
//!
//! ```ignore
//! use live_nx_iree::{Bridge, FunctionBinding, NativeEngine};
//!
//! let engine = NativeEngine::load("libnx_iree.so")?;
//! let (bridge, mut events) = Bridge::new(engine);
//! let devices = bridge.mount()?;
//!
//! let mut function = FunctionBinding::new(bridge.clone());
//! function.set_device("local-sync://")?;
//! function.set_bytecode(&bytecode_base64)?;
//! let result = function.set_inputs(&[lhs_base64, rhs_base64])?;
//! ```

pub mod bridge;
pub mod capture;
pub mod cli;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod frame;
pub mod source;
pub mod tensor;

// Re-export commonly used types
pub use bridge::{Bridge, BridgeEvent, CameraBinding, FunctionBinding};
pub use capture::{CaptureLoop, CapturePipeline, CaptureState, ImageSource, SeedPolicy};
pub use codec::BytecodeModule;
pub use dispatch::{Dispatcher, InvocationResult};
pub use engine::{DeviceDirectory, Engine, NativeDevice, NativeEngine};
pub use error::{BridgeError, Result, Stage};
pub use frame::{Image, PixelLayout};
pub use tensor::{ElementType, Tensor};
