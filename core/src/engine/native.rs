//! Safe wrappers for the native engine library.
//!
//! This module provides owning Rust types around the FFI handles: the
//! engine instance, devices, and the buffers the engine hands back. Every
//! native allocation is released by a `Drop` impl, so early returns on error
//! paths cannot leak.

use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_char;
use std::path::Path;
use std::slice;
use std::sync::Arc;

use tracing::{debug, info};

use super::ffi::{DeviceHandle, EngineApi, InstanceHandle, ERROR_MESSAGE_CAPACITY};
use super::Engine;
use crate::codec::BytecodeModule;
use crate::error::{BridgeError, Result};
use crate::tensor::{ElementType, Tensor};

/// Engine instance backed by the native shared library.
///
/// The instance is created once in [`NativeEngine::load`] and, when the
/// library exports a release entry point, released once on drop.
pub struct NativeEngine {
    api: Arc<EngineApi>,
    instance: InstanceHandle,
}

// SAFETY: The VM instance is only used for call dispatch, which the engine
// supports from any thread.
unsafe impl Send for NativeEngine {}
unsafe impl Sync for NativeEngine {}

impl NativeEngine {
    /// Load the engine library and create the VM instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the library is missing, lacks an entry point, or
    /// fails to create an instance.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(BridgeError::FileNotFound(path.to_path_buf()));
        }

        // SAFETY: The library is the engine build exporting the nx_iree ABI.
        let api = unsafe { EngineApi::load(path)? };
        let engine = Self::from_api(api)?;
        info!(library = %path.display(), "Engine instance created");
        Ok(engine)
    }

    /// Create the VM instance through a resolved entry point table.
    fn from_api(api: EngineApi) -> Result<Self> {
        let instance = unsafe { (api.create_instance)() };
        if instance.is_null() {
            return Err(BridgeError::EngineInit(
                "engine could not create a VM instance".to_string(),
            ));
        }
        Ok(Self {
            api: Arc::new(api),
            instance,
        })
    }
}

impl Drop for NativeEngine {
    fn drop(&mut self) {
        if let Some(release) = self.api.release_instance {
            unsafe { release(self.instance) };
        }
    }
}

/// A device created by a [`NativeEngine`].
///
/// Move-only; the handle is released exactly once when the value is dropped.
pub struct NativeDevice {
    api: Arc<EngineApi>,
    handle: DeviceHandle,
    uri: String,
}

// SAFETY: HAL devices are internally synchronized.
unsafe impl Send for NativeDevice {}
unsafe impl Sync for NativeDevice {}

impl Drop for NativeDevice {
    fn drop(&mut self) {
        debug!(uri = %self.uri, "Releasing device");
        unsafe { (self.api.release_device)(self.handle) };
    }
}

/// A `malloc`ed buffer handed over by the engine.
struct EngineBuffer<T> {
    ptr: *mut T,
}

impl<T> Drop for EngineBuffer<T> {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { libc::free(self.ptr as *mut c_void) };
        }
    }
}

/// A `malloc`ed array of `len` `malloc`ed byte buffers.
struct EngineArray {
    ptr: *mut *mut c_char,
    len: usize,
}

impl EngineArray {
    /// Entry `index`, or null.
    fn entry(&self, index: usize) -> *const c_char {
        debug_assert!(index < self.len);
        unsafe { *self.ptr.add(index) }
    }
}

impl Drop for EngineArray {
    fn drop(&mut self) {
        if self.ptr.is_null() {
            return;
        }
        for i in 0..self.len {
            let entry = self.entry(i);
            if !entry.is_null() {
                unsafe { libc::free(entry as *mut c_void) };
            }
        }
        unsafe { libc::free(self.ptr as *mut c_void) };
    }
}

/// Caller-owned error message buffer.
struct ErrorMessage {
    buf: [u8; ERROR_MESSAGE_CAPACITY],
}

impl ErrorMessage {
    fn new() -> Self {
        Self {
            buf: [0; ERROR_MESSAGE_CAPACITY],
        }
    }

    fn as_mut_ptr(&mut self) -> *mut c_char {
        self.buf.as_mut_ptr().cast()
    }

    /// Read the message. The engine copies with `strncpy`, so a message that
    /// fills the buffer carries no terminator.
    fn read(&self) -> String {
        let end = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(ERROR_MESSAGE_CAPACITY);
        if end == 0 {
            return "Unknown error".to_string();
        }
        String::from_utf8_lossy(&self.buf[..end]).into_owned()
    }
}

impl Engine for NativeEngine {
    type Device = NativeDevice;

    fn list_devices(&self) -> Vec<String> {
        let mut count: u64 = 0;
        let ptr = unsafe { (self.api.list_all_devices)(&mut count) };
        if ptr.is_null() {
            return Vec::new();
        }

        let list = EngineArray {
            ptr,
            len: count as usize,
        };
        (0..list.len)
            .filter_map(|i| {
                let entry = list.entry(i);
                if entry.is_null() {
                    None
                } else {
                    // SAFETY: Non-null entries are NUL-terminated URIs.
                    Some(unsafe { CStr::from_ptr(entry) }.to_string_lossy().into_owned())
                }
            })
            .collect()
    }

    fn create_device(&self, uri: &str) -> Result<NativeDevice> {
        let uri_cstr = CString::new(uri)
            .map_err(|_| BridgeError::device_creation(uri, "URI contains a NUL byte"))?;

        let handle = unsafe { (self.api.create_device)(uri_cstr.as_ptr()) };

        if handle.is_null() {
            Err(BridgeError::device_creation(
                uri,
                "engine could not create a device for this URI",
            ))
        } else {
            debug!(uri, "Device created");
            Ok(NativeDevice {
                api: self.api.clone(),
                handle,
                uri: uri.to_string(),
            })
        }
    }

    fn call(
        &self,
        device: &NativeDevice,
        module: &BytecodeModule,
        inputs: &[Tensor],
        num_outputs: usize,
    ) -> Result<Vec<Tensor>> {
        // Serialized inputs must outlive the call; the engine only borrows them.
        let serialized: Vec<Vec<u8>> = inputs.iter().map(Tensor::serialize).collect();
        let input_ptrs: Vec<*const c_char> =
            serialized.iter().map(|bytes| bytes.as_ptr().cast()).collect();

        let mut error = ErrorMessage::new();
        let mut sizes = vec![0u64; num_outputs];
        let bytecode = module.as_bytes();

        let ptr = unsafe {
            (self.api.call)(
                self.instance,
                device.handle,
                bytecode.len() as u64,
                bytecode.as_ptr(),
                input_ptrs.len() as u64,
                input_ptrs.as_ptr(),
                num_outputs as u64,
                error.as_mut_ptr(),
                sizes.as_mut_ptr(),
            )
        };

        if ptr.is_null() {
            return Err(BridgeError::engine_failure(error.read()));
        }

        let outputs = EngineArray {
            ptr,
            len: num_outputs,
        };
        (0..num_outputs)
            .map(|i| {
                let entry = outputs.entry(i);
                if entry.is_null() {
                    return Err(BridgeError::engine_failure(format!(
                        "Engine returned no buffer for output {}",
                        i
                    )));
                }
                // SAFETY: The engine reports the byte size of every output it returns.
                let bytes = unsafe { slice::from_raw_parts(entry as *const u8, sizes[i] as usize) };
                Tensor::deserialize(bytes)
                    .map_err(|e| BridgeError::decode(format!("output {}: {}", i, e)))
            })
            .collect()
    }

    fn image_call(
        &self,
        device: &NativeDevice,
        module: &BytecodeModule,
        input: &Tensor,
        seed: u32,
        noise_amount: f32,
    ) -> Result<Tensor> {
        if input.element_type() != ElementType::U8 {
            return Err(BridgeError::invalid_invocation(format!(
                "Image input must be u8, got {}",
                input.element_type()
            )));
        }
        let dims: [u64; 3] = match input.shape() {
            [h, w, c] => [*h as u64, *w as u64, *c as u64],
            other => {
                return Err(BridgeError::invalid_invocation(format!(
                    "Image input must have shape [h, w, c], got {:?}",
                    other
                )))
            }
        };

        let mut error = ErrorMessage::new();
        let bytecode = module.as_bytes();

        let ptr = unsafe {
            (self.api.image_call)(
                self.instance,
                device.handle,
                bytecode.len() as u64,
                bytecode.as_ptr(),
                dims.as_ptr(),
                input.data().as_ptr(),
                error.as_mut_ptr(),
                seed,
                noise_amount,
            )
        };

        if ptr.is_null() {
            return Err(BridgeError::engine_failure(error.read()));
        }

        let output = EngineBuffer { ptr };
        // SAFETY: The output buffer has the same shape as the input.
        let pixels = unsafe { slice::from_raw_parts(output.ptr as *const u8, input.byte_len()) };
        Tensor::new(ElementType::U8, input.shape().to_vec(), pixels.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::mem::size_of;
    use std::ptr;

    use crate::engine::ffi::ListAllDevicesFn;

    const FAKE_FAILURE: &str = "  INVALID_ARGUMENT; function expected 2 inputs\n";

    static INSTANCE: u8 = 0;
    static DEVICE: u8 = 0;

    thread_local! {
        static RELEASES: RefCell<Vec<&'static str>> = RefCell::new(Vec::new());
        static LAST_IMAGE_ARGS: RefCell<Option<(u32, f32)>> = RefCell::new(None);
    }

    fn releases() -> Vec<&'static str> {
        RELEASES.with(|log| log.borrow().clone())
    }

    unsafe fn malloc_copy(bytes: &[u8], terminate: bool) -> *mut c_char {
        let len = bytes.len() + usize::from(terminate);
        let ptr = unsafe { libc::malloc(len.max(1)) } as *mut u8;
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
            if terminate {
                *ptr.add(bytes.len()) = 0;
            }
        }
        ptr.cast()
    }

    /// Copies like `strncpy`: no terminator once the buffer is full.
    unsafe fn write_error(buf: *mut c_char, msg: &[u8]) {
        let len = msg.len().min(ERROR_MESSAGE_CAPACITY);
        unsafe { ptr::copy_nonoverlapping(msg.as_ptr(), buf as *mut u8, len) };
    }

    unsafe extern "C" fn fake_create_instance() -> InstanceHandle {
        ptr::addr_of!(INSTANCE).cast()
    }

    unsafe extern "C" fn fake_null_instance() -> InstanceHandle {
        ptr::null()
    }

    unsafe extern "C" fn fake_release_instance(_instance: InstanceHandle) {
        RELEASES.with(|log| log.borrow_mut().push("release_instance"));
    }

    unsafe extern "C" fn fake_list_devices(count: *mut u64) -> *mut *mut c_char {
        let uris = [Some("local-sync://"), None, Some("cuda://0")];
        unsafe {
            let list = libc::malloc(uris.len() * size_of::<*mut c_char>()) as *mut *mut c_char;
            for (i, uri) in uris.iter().enumerate() {
                *list.add(i) = match uri {
                    Some(uri) => malloc_copy(uri.as_bytes(), true),
                    None => ptr::null_mut(),
                };
            }
            *count = uris.len() as u64;
            list
        }
    }

    unsafe extern "C" fn fake_no_devices(count: *mut u64) -> *mut *mut c_char {
        unsafe { *count = 0 };
        ptr::null_mut()
    }

    unsafe extern "C" fn fake_create_device(uri: *const c_char) -> DeviceHandle {
        if unsafe { CStr::from_ptr(uri) }.to_bytes().starts_with(b"local-") {
            ptr::addr_of!(DEVICE).cast()
        } else {
            ptr::null()
        }
    }

    unsafe extern "C" fn fake_release_device(_device: DeviceHandle) {
        RELEASES.with(|log| log.borrow_mut().push("release_device"));
    }

    /// Output `i` is the s64 tensor `[i, num_inputs, type code of input 0]`.
    /// `hole` leaves the last output null, `fail` and `overflow` fail.
    unsafe extern "C" fn fake_call(
        _instance: InstanceHandle,
        _device: DeviceHandle,
        bytecode_size: u64,
        bytecode: *const u8,
        num_inputs: u64,
        serialized_inputs: *const *const c_char,
        num_outputs: u64,
        error_message: *mut c_char,
        output_byte_sizes: *mut u64,
    ) -> *mut *mut c_char {
        let program = unsafe { slice::from_raw_parts(bytecode, bytecode_size as usize) };
        match program {
            b"fail" => {
                unsafe { write_error(error_message, FAKE_FAILURE.as_bytes()) };
                return ptr::null_mut();
            }
            b"overflow" => {
                unsafe { write_error(error_message, &[b'e'; ERROR_MESSAGE_CAPACITY + 8]) };
                return ptr::null_mut();
            }
            _ => {}
        }

        let first_code = if num_inputs > 0 {
            let header = unsafe { slice::from_raw_parts(*serialized_inputs as *const u8, 4) };
            u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as i64
        } else {
            -1
        };

        let count = num_outputs as usize;
        unsafe {
            let list = libc::malloc(count.max(1) * size_of::<*mut c_char>()) as *mut *mut c_char;
            for i in 0..count {
                if program == b"hole" && i + 1 == count {
                    *list.add(i) = ptr::null_mut();
                    continue;
                }
                let bytes = Tensor::from_values(vec![3], &[i as i64, num_inputs as i64, first_code])
                    .map(|t| t.serialize())
                    .unwrap_or_default();
                *output_byte_sizes.add(i) = bytes.len() as u64;
                *list.add(i) = malloc_copy(&bytes, false);
            }
            list
        }
    }

    unsafe extern "C" fn fake_image_call(
        _instance: InstanceHandle,
        _device: DeviceHandle,
        bytecode_size: u64,
        bytecode: *const u8,
        input_dims: *const u64,
        input_pixels: *const u8,
        error_message: *mut c_char,
        seed: u32,
        noise_amount: f32,
    ) -> *mut u8 {
        LAST_IMAGE_ARGS.with(|args| *args.borrow_mut() = Some((seed, noise_amount)));
        let program = unsafe { slice::from_raw_parts(bytecode, bytecode_size as usize) };
        if program == b"fail" {
            unsafe { write_error(error_message, FAKE_FAILURE.as_bytes()) };
            return ptr::null_mut();
        }
        unsafe {
            let dims = slice::from_raw_parts(input_dims, 3);
            let len = (dims[0] * dims[1] * dims[2]) as usize;
            let pixels = slice::from_raw_parts(input_pixels, len);
            let inverted: Vec<u8> = pixels.iter().map(|v| 255 - v).collect();
            malloc_copy(&inverted, false).cast()
        }
    }

    fn fake_engine(list_all_devices: ListAllDevicesFn) -> NativeEngine {
        let api = EngineApi::from_symbols(
            fake_create_instance,
            Some(fake_release_instance),
            list_all_devices,
            fake_create_device,
            fake_release_device,
            fake_call,
            fake_image_call,
        );
        NativeEngine::from_api(api).unwrap()
    }

    fn module(name: &str) -> BytecodeModule {
        BytecodeModule::new(name.as_bytes().to_vec())
    }

    #[test]
    fn test_error_message_terminated() {
        let mut msg = ErrorMessage::new();
        let text = b"Failed to execute IREE runtime due to error: INVALID_ARGUMENT";
        msg.buf[..text.len()].copy_from_slice(text);
        assert_eq!(
            msg.read(),
            "Failed to execute IREE runtime due to error: INVALID_ARGUMENT"
        );
    }

    #[test]
    fn test_error_message_unterminated() {
        let mut msg = ErrorMessage::new();
        msg.buf.fill(b'x');
        assert_eq!(msg.read().len(), ERROR_MESSAGE_CAPACITY);
    }

    #[test]
    fn test_error_message_keeps_whitespace() {
        let mut msg = ErrorMessage::new();
        msg.buf[..5].copy_from_slice(b" a b\n");
        assert_eq!(msg.read(), " a b\n");
    }

    #[test]
    fn test_error_message_empty() {
        assert_eq!(ErrorMessage::new().read(), "Unknown error");
    }

    #[test]
    fn test_load_missing_library() {
        let result = NativeEngine::load("/nonexistent/libnx_iree.so");
        assert!(matches!(result, Err(BridgeError::FileNotFound(_))));
    }

    #[test]
    fn test_null_instance_fails_init() {
        let api = EngineApi::from_symbols(
            fake_null_instance,
            None,
            fake_no_devices,
            fake_create_device,
            fake_release_device,
            fake_call,
            fake_image_call,
        );
        assert!(matches!(
            NativeEngine::from_api(api),
            Err(BridgeError::EngineInit(_))
        ));
    }

    #[test]
    fn test_list_devices_skips_null_entries() {
        let engine = fake_engine(fake_list_devices);
        assert_eq!(engine.list_devices(), vec!["local-sync://", "cuda://0"]);
    }

    #[test]
    fn test_list_devices_null_list() {
        assert!(fake_engine(fake_no_devices).list_devices().is_empty());
    }

    #[test]
    fn test_devices_released_before_instance() {
        let engine = fake_engine(fake_no_devices);
        let device = engine.create_device("local-sync://").unwrap();
        assert_eq!(device.uri, "local-sync://");

        assert!(matches!(
            engine.create_device("cuda://0"),
            Err(BridgeError::DeviceCreation { .. })
        ));
        assert!(matches!(
            engine.create_device("local-\0sync://"),
            Err(BridgeError::DeviceCreation { .. })
        ));
        assert!(releases().is_empty());

        drop(device);
        drop(engine);
        assert_eq!(releases(), vec!["release_device", "release_instance"]);
    }

    #[test]
    fn test_call_reads_sized_outputs() {
        let engine = fake_engine(fake_no_devices);
        let device = engine.create_device("local-sync://").unwrap();
        let inputs = [
            Tensor::from_values(vec![2], &[1.0f32, 2.0]).unwrap(),
            Tensor::from_values(vec![1], &[3u8]).unwrap(),
        ];

        let outputs = engine.call(&device, &module("echo"), &inputs, 3).unwrap();
        assert_eq!(outputs.len(), 3);
        let f32_code = ElementType::F32.code() as i64;
        for (i, output) in outputs.iter().enumerate() {
            assert_eq!(output.shape(), &[3]);
            assert_eq!(output.to_vec::<i64>().unwrap(), vec![i as i64, 2, f32_code]);
        }
    }

    #[test]
    fn test_call_missing_output_buffer() {
        let engine = fake_engine(fake_no_devices);
        let device = engine.create_device("local-sync://").unwrap();
        let err = engine.call(&device, &module("hole"), &[], 2).unwrap_err();
        assert!(matches!(err, BridgeError::EngineFailure(_)));
        assert!(err.to_string().contains("output 1"));
    }

    #[test]
    fn test_call_failure_message_verbatim() {
        let engine = fake_engine(fake_no_devices);
        let device = engine.create_device("local-sync://").unwrap();

        match engine.call(&device, &module("fail"), &[], 1) {
            Err(BridgeError::EngineFailure(message)) => assert_eq!(message, FAKE_FAILURE),
            other => panic!("expected engine failure, got {:?}", other),
        }
        match engine.call(&device, &module("overflow"), &[], 1) {
            Err(BridgeError::EngineFailure(message)) => {
                assert_eq!(message, "e".repeat(ERROR_MESSAGE_CAPACITY))
            }
            other => panic!("expected engine failure, got {:?}", other),
        }
    }

    #[test]
    fn test_image_call_copies_output_pixels() {
        let engine = fake_engine(fake_no_devices);
        let device = engine.create_device("local-sync://").unwrap();
        let input = Tensor::new(ElementType::U8, vec![2, 3, 4], vec![10; 24]).unwrap();

        let output = engine
            .image_call(&device, &module("invert"), &input, 42, 0.25)
            .unwrap();
        assert_eq!(output.shape(), input.shape());
        assert!(output.data().iter().all(|&v| v == 245));
        assert_eq!(LAST_IMAGE_ARGS.with(|args| *args.borrow()), Some((42, 0.25)));

        match engine.image_call(&device, &module("fail"), &input, 0, 0.0) {
            Err(BridgeError::EngineFailure(message)) => assert_eq!(message, FAKE_FAILURE),
            other => panic!("expected engine failure, got {:?}", other),
        }
    }

    #[test]
    fn test_image_call_rejects_bad_input_before_engine() {
        let engine = fake_engine(fake_no_devices);
        let device = engine.create_device("local-sync://").unwrap();

        let floats = Tensor::from_values(vec![1, 1, 4], &[0.0f32; 4]).unwrap();
        let flat = Tensor::new(ElementType::U8, vec![12], vec![0; 12]).unwrap();
        for input in [floats, flat] {
            let err = engine
                .image_call(&device, &module("invert"), &input, 0, 0.0)
                .unwrap_err();
            assert!(matches!(err, BridgeError::InvalidInvocation(_)));
        }
        assert_eq!(LAST_IMAGE_ARGS.with(|args| *args.borrow()), None);
    }
}
