//! FFI declarations for the native engine library.
//!
//! This module contains the raw C ABI, resolved from the shared library at
//! load time. Use the safe wrappers in the `native` module instead of
//! calling these directly.
//!
//! Every buffer the engine returns (device lists, output arrays, output
//! pixel buffers) is allocated with `malloc` and owned by the caller.

use libloading::Library;
use std::ffi::c_void;
use std::os::raw::c_char;
use std::path::Path;

use crate::error::Result;

/// Opaque handle to the VM instance.
pub type InstanceHandle = *const c_void;

/// Opaque handle to a HAL device.
pub type DeviceHandle = *const c_void;

/// Capacity of the caller-owned error message buffer.
pub const ERROR_MESSAGE_CAPACITY: usize = 256;

pub type CreateInstanceFn = unsafe extern "C" fn() -> InstanceHandle;
pub type ReleaseInstanceFn = unsafe extern "C" fn(instance: InstanceHandle);
pub type ListAllDevicesFn = unsafe extern "C" fn(count: *mut u64) -> *mut *mut c_char;
pub type CreateDeviceFn = unsafe extern "C" fn(uri: *const c_char) -> DeviceHandle;
pub type ReleaseDeviceFn = unsafe extern "C" fn(device: DeviceHandle);

pub type CallFn = unsafe extern "C" fn(
    instance: InstanceHandle,
    device: DeviceHandle,
    bytecode_size: u64,
    bytecode: *const u8,
    num_inputs: u64,
    serialized_inputs: *const *const c_char,
    num_outputs: u64,
    error_message: *mut c_char,
    output_byte_sizes: *mut u64,
) -> *mut *mut c_char;

pub type ImageCallFn = unsafe extern "C" fn(
    instance: InstanceHandle,
    device: DeviceHandle,
    bytecode_size: u64,
    bytecode: *const u8,
    input_dims: *const u64,
    input_pixels: *const u8,
    error_message: *mut c_char,
    seed: u32,
    noise_amount: f32,
) -> *mut u8;

/// Engine entry points resolved from the shared library.
///
/// The library, when there is one, is kept loaded for as long as this table
/// is alive.
pub struct EngineApi {
    _library: Option<Library>,
    pub create_instance: CreateInstanceFn,
    pub release_instance: Option<ReleaseInstanceFn>,
    pub list_all_devices: ListAllDevicesFn,
    pub create_device: CreateDeviceFn,
    pub release_device: ReleaseDeviceFn,
    pub call: CallFn,
    pub image_call: ImageCallFn,
}

impl EngineApi {
    /// Open the library and resolve every entry point.
    ///
    /// # Safety
    ///
    /// The library's initializers run on load, and the resolved symbols
    /// must have the signatures declared above.
    pub unsafe fn load(path: &Path) -> Result<Self> {
        let library = Library::new(path)?;

        let create_instance = *library.get::<CreateInstanceFn>(b"nx_iree_create_instance\0")?;
        let release_instance = library
            .get::<ReleaseInstanceFn>(b"nx_iree_release_instance\0")
            .ok()
            .map(|symbol| *symbol);
        let list_all_devices = *library.get::<ListAllDevicesFn>(b"nx_iree_list_all_devices\0")?;
        let create_device = *library.get::<CreateDeviceFn>(b"nx_iree_create_device\0")?;
        let release_device = *library.get::<ReleaseDeviceFn>(b"nx_iree_release_device\0")?;
        let call = *library.get::<CallFn>(b"nx_iree_call\0")?;
        let image_call = *library.get::<ImageCallFn>(b"nx_iree_image_call\0")?;

        Ok(Self {
            _library: Some(library),
            create_instance,
            release_instance,
            list_all_devices,
            create_device,
            release_device,
            call,
            image_call,
        })
    }

    /// Table over entry points already linked into the process.
    #[cfg(test)]
    pub(crate) fn from_symbols(
        create_instance: CreateInstanceFn,
        release_instance: Option<ReleaseInstanceFn>,
        list_all_devices: ListAllDevicesFn,
        create_device: CreateDeviceFn,
        release_device: ReleaseDeviceFn,
        call: CallFn,
        image_call: ImageCallFn,
    ) -> Self {
        Self {
            _library: None,
            create_instance,
            release_instance,
            list_all_devices,
            create_device,
            release_device,
            call,
            image_call,
        }
    }
}
