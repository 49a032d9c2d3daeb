//! Inference sessions over serialized model graphs.
//!
//! Every checkpoint (text encoder, unet, vae decoder) is a TorchScript module
//! called with a fixed set of named tensor inputs and producing one tensor.
use std::path::Path;

use tch::{CModule, Device, IValue, Tensor};

use crate::error::{Error, Result};

/// A tensor passed to a session under the name the graph declares for it.
#[derive(Debug)]
pub struct NamedInput<'a> {
    pub name: &'static str,
    pub value: &'a Tensor,
}

impl<'a> NamedInput<'a> {
    pub fn new(name: &'static str, value: &'a Tensor) -> Self {
        Self { name, value }
    }
}

/// The inference runtime boundary. Outputs are returned on the CPU.
pub trait InferenceSession: Send {
    fn run(&self, inputs: &[NamedInput<'_>]) -> Result<Tensor>;
}

/// A TorchScript module, called with its inputs in the declared order.
pub struct TorchScriptSession {
    module: CModule,
    input_names: Vec<&'static str>,
    device: Device,
    name: String,
}

impl TorchScriptSession {
    pub fn load<P: AsRef<Path>>(
        path: P,
        input_names: &[&'static str],
        device: Device,
    ) -> Result<Self> {
        let path = path.as_ref();
        let mut module = CModule::load_on_device(path, device)?;
        module.set_eval();
        let name = path.file_name().map_or_else(
            || path.to_string_lossy().into_owned(),
            |f| f.to_string_lossy().into_owned(),
        );
        tracing::info!(session = %name, ?device, "loaded torchscript module");
        Ok(Self { module, input_names: input_names.to_vec(), device, name })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl InferenceSession for TorchScriptSession {
    fn run(&self, inputs: &[NamedInput<'_>]) -> Result<Tensor> {
        let args = order_inputs(&self.name, &self.input_names, inputs)?
            .into_iter()
            .map(|t| IValue::Tensor(t.to_device(self.device)))
            .collect::<Vec<_>>();
        let output = self.module.forward_is(&args)?;
        Ok(first_tensor(&self.name, output)?.to_device(Device::Cpu))
    }
}

/// Arranges `inputs` in the `expected` order, failing on missing or
/// unexpected names.
fn order_inputs<'a>(
    session: &str,
    expected: &[&'static str],
    inputs: &[NamedInput<'a>],
) -> Result<Vec<&'a Tensor>> {
    if let Some(extra) = inputs.iter().find(|i| !expected.contains(&i.name)) {
        return Err(Error::config(format!("{session} has no input named {}", extra.name)));
    }
    expected
        .iter()
        .map(|name| {
            inputs
                .iter()
                .find(|i| i.name == *name)
                .map(|i| i.value)
                .ok_or_else(|| Error::config(format!("{session} is missing input {name}")))
        })
        .collect()
}

// Graphs exported from Hugging Face models usually return a tuple, the
// first element of which is the prediction.
fn first_tensor(session: &str, value: IValue) -> Result<Tensor> {
    match value {
        IValue::Tensor(tensor) => Ok(tensor),
        IValue::Tuple(values) | IValue::GenericList(values) => match values.into_iter().next() {
            Some(value) => first_tensor(session, value),
            None => Err(Error::UnsupportedOperation(format!("{session} returned an empty tuple"))),
        },
        IValue::TensorList(tensors) => tensors.into_iter().next().ok_or_else(|| {
            Error::UnsupportedOperation(format!("{session} returned an empty tensor list"))
        }),
        _ => Err(Error::UnsupportedOperation(format!("{session} did not return a tensor"))),
    }
}
