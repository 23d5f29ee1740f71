//! Single request/response calls into the engine.
//!
//! The dispatcher validates everything it can before crossing into native
//! code, so a rejected invocation never reaches the engine.

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::codec::{self, BytecodeModule};
use crate::engine::{BoundDevice, Engine};
use crate::error::{BridgeError, Result};
use crate::frame::{Image, PixelLayout};
use crate::tensor::{ElementType, Tensor};

/// Outputs of one tensor-mode invocation.
#[derive(Debug, Clone)]
pub struct InvocationResult {
    /// Output tensors, in the order the entry function returns them.
    pub outputs: Vec<Tensor>,
    /// Wall-clock time spent in the engine call, in milliseconds.
    pub latency_ms: f64,
}

impl InvocationResult {
    /// Byte size of each output's element data.
    pub fn output_byte_sizes(&self) -> Vec<usize> {
        self.outputs.iter().map(Tensor::byte_len).collect()
    }

    /// Transport encoding of each output.
    pub fn encode(&self) -> Vec<String> {
        codec::encode_tensor_list(&self.outputs)
    }
}

/// Issues invocations against one shared engine.
pub struct Dispatcher<E: Engine> {
    engine: Arc<E>,
}

impl<E: Engine> Clone for Dispatcher<E> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
        }
    }
}

impl<E: Engine> Dispatcher<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// Run the module's entry function on `inputs`.
    ///
    /// Blocks for the duration of the engine call; async callers should run
    /// this on a blocking thread.
    ///
    /// # Errors
    ///
    /// `InvalidInvocation` for an empty module or a zero output count,
    /// `EngineFailure` with the engine's message otherwise.
    pub fn call(
        &self,
        device: &BoundDevice<E>,
        module: &BytecodeModule,
        inputs: &[Tensor],
        num_outputs: usize,
    ) -> Result<InvocationResult> {
        if module.is_empty() {
            return Err(BridgeError::invalid_invocation("Bytecode module is empty"));
        }
        if num_outputs == 0 {
            return Err(BridgeError::invalid_invocation(
                "Expected output count must be at least 1",
            ));
        }

        let start = Instant::now();
        let outputs = self
            .engine
            .call(device.device(), module, inputs, num_outputs)?;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        if outputs.len() != num_outputs {
            return Err(BridgeError::engine_failure(format!(
                "Expected {} outputs, engine returned {}",
                num_outputs,
                outputs.len()
            )));
        }

        debug!(
            device = device.uri(),
            inputs = inputs.len(),
            outputs = outputs.len(),
            latency_ms,
            "Invocation complete"
        );
        Ok(InvocationResult {
            outputs,
            latency_ms,
        })
    }

    /// Run the module's image entry point on a `[h, w, c]` u8 pixel tensor.
    ///
    /// The output has the same shape as the input.
    pub fn image_call_tensor(
        &self,
        device: &BoundDevice<E>,
        module: &BytecodeModule,
        input: &Tensor,
        seed: u32,
        noise_amount: f32,
    ) -> Result<Tensor> {
        if module.is_empty() {
            return Err(BridgeError::invalid_invocation("Bytecode module is empty"));
        }
        if !(0.0..=1.0).contains(&noise_amount) {
            return Err(BridgeError::invalid_invocation(format!(
                "Noise amount must be in [0, 1], got {}",
                noise_amount
            )));
        }
        validate_pixel_tensor(input)?;

        let start = Instant::now();
        let output = self
            .engine
            .image_call(device.device(), module, input, seed, noise_amount)?;

        if output.element_type() != ElementType::U8 || output.shape() != input.shape() {
            return Err(BridgeError::engine_failure(format!(
                "Image output {} {:?} does not match input {} {:?}",
                output.element_type(),
                output.shape(),
                input.element_type(),
                input.shape()
            )));
        }

        debug!(
            device = device.uri(),
            seed,
            noise_amount,
            latency_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Image invocation complete"
        );
        Ok(output)
    }

    /// Run the module's image entry point on an image at its own size.
    pub fn image_call(
        &self,
        device: &BoundDevice<E>,
        module: &BytecodeModule,
        input: &Image,
        seed: u32,
        noise_amount: f32,
    ) -> Result<Image> {
        let tensor = codec::image_to_tensor(input, input.width(), input.height())?;
        let output = self.image_call_tensor(device, module, &tensor, seed, noise_amount)?;
        codec::tensor_to_image(&output, input.width(), input.height())
    }
}

fn validate_pixel_tensor(tensor: &Tensor) -> Result<()> {
    if tensor.element_type() != ElementType::U8 {
        return Err(BridgeError::invalid_invocation(format!(
            "Pixel tensor must be u8, got {}",
            tensor.element_type()
        )));
    }
    match tensor.shape() {
        [h, w, c] if *h > 0 && *w > 0 && PixelLayout::from_channels(*c).is_some() => Ok(()),
        other => Err(BridgeError::invalid_invocation(format!(
            "Pixel tensor must have shape [h, w, 3|4], got {:?}",
            other
        ))),
    }
}
