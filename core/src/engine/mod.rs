//! Native engine boundary.
//!
//! [`Engine`] is the contract the rest of the crate programs against. The
//! production implementation, [`NativeEngine`], resolves the engine's C ABI
//! from a shared library at runtime and wraps every native resource in an
//! owning type.

mod directory;
mod ffi;
mod native;
mod slot;

pub use directory::DeviceDirectory;
pub use native::{NativeDevice, NativeEngine};
pub use slot::{BoundDevice, DeviceSlot};

use crate::codec::BytecodeModule;
use crate::error::Result;
use crate::tensor::Tensor;

/// A bytecode execution engine.
///
/// Implementations are shared call-only across every invocation issued by a
/// bridge, so all methods take `&self`. Devices are released by dropping
/// them; a device value can only be dropped once.
pub trait Engine: Send + Sync + 'static {
    /// Owned device handle. Dropping it releases the native device.
    type Device: Send + Sync + 'static;

    /// Enumerate device URIs. Never fails; an engine with no devices
    /// returns an empty list.
    fn list_devices(&self) -> Vec<String>;

    /// Create a device for a URI.
    fn create_device(&self, uri: &str) -> Result<Self::Device>;

    /// Invoke the module's entry function with serialized tensor inputs.
    ///
    /// Blocks until the engine returns.
    fn call(
        &self,
        device: &Self::Device,
        module: &BytecodeModule,
        inputs: &[Tensor],
        num_outputs: usize,
    ) -> Result<Vec<Tensor>>;

    /// Invoke the module's image entry point on one `[h, w, c]` u8 tensor.
    ///
    /// Blocks until the engine returns. The output has the input's shape.
    fn image_call(
        &self,
        device: &Self::Device,
        module: &BytecodeModule,
        input: &Tensor,
        seed: u32,
        noise_amount: f32,
    ) -> Result<Tensor>;
}
