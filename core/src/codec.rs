//! Transport and pixel codecs.
//!
//! Every payload that reaches the bridge from the UI layer is base64 text.
//! This module is the only place that knows that encoding, and the only
//! place that converts between images and pixel tensors.

use base64::engine::general_purpose::STANDARD as BASE64_ENGINE;
use base64::Engine as _;
use image::imageops::{self, FilterType};

use crate::error::{BridgeError, Result};
use crate::frame::{Image, PixelLayout};
use crate::tensor::{ElementType, Tensor};

/// Compiled program bytes consumed by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytecodeModule {
    bytes: Vec<u8>,
}

impl BytecodeModule {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Encode raw bytes for transport.
pub fn encode_bytes(bytes: &[u8]) -> String {
    BASE64_ENGINE.encode(bytes)
}

/// Decode a transport payload to raw bytes.
///
/// Surrounding whitespace is ignored; anything else that is not valid
/// padded base64 is rejected.
pub fn decode_bytes(text: &str) -> Result<Vec<u8>> {
    BASE64_ENGINE
        .decode(text.trim())
        .map_err(|e| BridgeError::decode(format!("Invalid base64 payload: {}", e)))
}

/// Decode a bytecode payload.
pub fn decode_bytecode(text: &str) -> Result<BytecodeModule> {
    decode_bytes(text).map(BytecodeModule::new)
}

/// Decode serialized tensors, failing if any element fails.
pub fn decode_tensor_list<S: AsRef<str>>(texts: &[S]) -> Result<Vec<Tensor>> {
    texts
        .iter()
        .enumerate()
        .map(|(i, text)| {
            decode_bytes(text.as_ref())
                .and_then(|bytes| Tensor::deserialize(&bytes))
                .map_err(|e| BridgeError::decode(format!("input {}: {}", i, e)))
        })
        .collect()
}

/// Decode a payload of bare element bytes using caller-supplied metadata.
pub fn decode_raw_tensor(text: &str, element_type: ElementType, shape: Vec<usize>) -> Result<Tensor> {
    Tensor::new(element_type, shape, decode_bytes(text)?)
}

/// Encode tensors for transport.
pub fn encode_tensor_list(tensors: &[Tensor]) -> Vec<String> {
    tensors.iter().map(|t| encode_bytes(&t.serialize())).collect()
}

/// Resize an image to the target size and flatten it to a `[h, w, c]` u8 tensor.
///
/// Images already at the target size are passed through untouched.
pub fn image_to_tensor(image: &Image, target_width: u32, target_height: u32) -> Result<Tensor> {
    if target_width == 0 || target_height == 0 {
        return Err(BridgeError::decode(format!(
            "Invalid target size {}x{}",
            target_width, target_height
        )));
    }

    if image.width() == 0 || image.height() == 0 {
        return Err(BridgeError::decode(format!(
            "Empty source image {}x{}",
            image.width(),
            image.height()
        )));
    }

    let layout = image.layout();
    let pixels = if image.width() == target_width && image.height() == target_height {
        image.data().to_vec()
    } else {
        match layout {
            PixelLayout::Rgb => imageops::resize(
                &image.to_rgb_buffer()?,
                target_width,
                target_height,
                FilterType::Triangle,
            )
            .into_raw(),
            PixelLayout::Rgba => imageops::resize(
                &image.to_rgba_buffer()?,
                target_width,
                target_height,
                FilterType::Triangle,
            )
            .into_raw(),
        }
    };

    Tensor::new(
        ElementType::U8,
        vec![
            target_height as usize,
            target_width as usize,
            layout.channels(),
        ],
        pixels,
    )
}

/// Interpret a u8 pixel tensor as an image of the given size.
///
/// The channel count comes from the last dimension of a rank-3 tensor and
/// defaults to RGBA otherwise.
pub fn tensor_to_image(tensor: &Tensor, width: u32, height: u32) -> Result<Image> {
    if width == 0 || height == 0 {
        return Err(BridgeError::decode(format!(
            "Invalid image size {}x{}",
            width, height
        )));
    }
    if tensor.element_type() != ElementType::U8 {
        return Err(BridgeError::decode(format!(
            "Pixel tensor must be u8, got {}",
            tensor.element_type()
        )));
    }

    let layout = match tensor.shape() {
        [_, _, channels] => PixelLayout::from_channels(*channels).ok_or_else(|| {
            BridgeError::decode(format!("Unsupported channel count: {}", channels))
        })?,
        _ => PixelLayout::Rgba,
    };

    Image::new(width, height, layout, tensor.data().to_vec())
}
