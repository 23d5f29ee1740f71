//! Tensor-mode attribute binding.

use std::sync::Arc;

use tracing::debug;

use super::Bridge;
use crate::codec::{self, BytecodeModule};
use crate::dispatch::InvocationResult;
use crate::engine::Engine;
use crate::error::{BridgeError, Result};
use crate::tensor::Tensor;

/// Attributes of one function view.
///
/// Every setter is a trigger: once bytecode, a device and inputs are all
/// present, each change re-runs the invocation and emits `Executed`.
/// A setter whose payload fails to decode leaves the previous value in place.
pub struct FunctionBinding<E: Engine> {
    bridge: Bridge<E>,
    module: Option<Arc<BytecodeModule>>,
    signature: Option<String>,
    inputs: Option<Vec<Tensor>>,
    num_outputs: usize,
}

impl<E: Engine> FunctionBinding<E> {
    pub fn new(bridge: Bridge<E>) -> Self {
        Self {
            bridge,
            module: None,
            signature: None,
            inputs: None,
            num_outputs: 1,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.module.is_some()
    }

    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    /// Set the base64 bytecode payload.
    pub fn set_bytecode(&mut self, text: &str) -> Result<Option<InvocationResult>> {
        let module = self.decode(codec::decode_bytecode(text))?;
        self.set_module(module)
    }

    /// Set already decoded bytecode.
    pub fn set_module(&mut self, module: BytecodeModule) -> Result<Option<InvocationResult>> {
        self.module = Some(Arc::new(module));
        self.run()
    }

    /// Set the function signature. Informational only.
    pub fn set_signature(&mut self, signature: impl Into<String>) -> Result<Option<InvocationResult>> {
        self.signature = Some(signature.into());
        self.run()
    }

    /// Select the device on the bridge.
    pub fn set_device(&mut self, uri: &str) -> Result<Option<InvocationResult>> {
        self.bridge.select_device(uri)?;
        self.run()
    }

    /// Set the inputs from self-describing transport payloads.
    pub fn set_inputs<S: AsRef<str>>(&mut self, texts: &[S]) -> Result<Option<InvocationResult>> {
        let inputs = self.decode(codec::decode_tensor_list(texts))?;
        self.set_input_tensors(inputs)
    }

    /// Set already decoded inputs.
    pub fn set_input_tensors(&mut self, inputs: Vec<Tensor>) -> Result<Option<InvocationResult>> {
        self.inputs = Some(inputs);
        self.run()
    }

    pub fn set_num_outputs(&mut self, num_outputs: usize) -> Result<Option<InvocationResult>> {
        self.num_outputs = num_outputs;
        self.run()
    }

    /// Invoke if every attribute is present. Returns `None` otherwise.
    pub fn run(&self) -> Result<Option<InvocationResult>> {
        self.bridge.ensure_live()?;

        let (Some(module), Some(inputs)) = (&self.module, &self.inputs) else {
            return Ok(None);
        };
        if self.bridge.current_device().is_none() {
            return Ok(None);
        }

        debug!(
            signature = self.signature.as_deref().unwrap_or("<unknown>"),
            inputs = inputs.len(),
            num_outputs = self.num_outputs,
            "Running function"
        );
        self.bridge
            .invoke(module, inputs, self.num_outputs)
            .map(Some)
    }

    fn decode<T>(&self, decoded: Result<T>) -> Result<T> {
        decoded.inspect_err(|e: &BridgeError| self.bridge.report(e))
    }
}
