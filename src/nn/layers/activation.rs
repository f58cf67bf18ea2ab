use super::{Activation, prepare, require_training, scratch};
use crate::backend::GpuContext;
use crate::error::Result;
use crate::nn::ops::dispatch::CommandStream;
use crate::nn::ops::kernels::{Kernel, KernelKind};
use crate::nn::tensors::{DeviceTensor, Shape};
use alloc::sync::Arc;

impl Activation {
    pub(crate) const fn forward_kernel(self) -> Option<KernelKind> {
        match self {
            Self::Sigmoid => Some(KernelKind::SigmoidForward),
            Self::Tanh => Some(KernelKind::TanhForward),
            Self::Relu => Some(KernelKind::ReluForward),
            Self::Linear => None,
        }
    }

    pub(crate) const fn backward_kernel(self) -> Option<KernelKind> {
        match self {
            Self::Sigmoid => Some(KernelKind::SigmoidBackward),
            Self::Tanh => Some(KernelKind::TanhBackward),
            Self::Relu => Some(KernelKind::ReluBackward),
            Self::Linear => None,
        }
    }

    /// Kernel turning `actual - expected` into the gradient at the
    /// activation's input, for squared-error outputs.
    pub(crate) const fn loss_kernel(self) -> KernelKind {
        match self {
            Self::Sigmoid => KernelKind::LossSigmoid,
            Self::Tanh => KernelKind::LossTanh,
            Self::Relu => KernelKind::LossRelu,
            Self::Linear => KernelKind::LossDifference,
        }
    }

    /// Applies the function on the host.
    #[must_use]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Self::Tanh => x.tanh(),
            Self::Relu => x.max(0.0),
            Self::Linear => x,
        }
    }
}

/// Element-wise nonlinearity.
///
/// Linear activations hold no tensors: forward returns the input and backward
/// the incoming gradient, both unchanged.
#[derive(Debug)]
pub struct ActivationLayer {
    shape: Shape,
    activation: Activation,
    active: Option<Active>,
}

#[derive(Debug)]
struct Active {
    output: DeviceTensor,
    forward: Kernel,
    training: Option<Training>,
}

#[derive(Debug)]
struct Training {
    gradient: DeviceTensor,
    backward: Kernel,
}

impl ActivationLayer {
    pub(super) fn new(
        ctx: &Arc<GpuContext>,
        shape: Shape,
        activation: Activation,
        trainable: bool,
    ) -> Result<Self> {
        let kernels = (activation.forward_kernel(), activation.backward_kernel());
        let (Some(forward), Some(backward)) = kernels else {
            return Ok(Self {
                shape,
                activation,
                active: None,
            });
        };

        let training = if trainable {
            Some(Training {
                gradient: scratch(ctx, shape, "activation gradient")?,
                backward: prepare(ctx, backward, shape.extent())?,
            })
        } else {
            None
        };

        Ok(Self {
            shape,
            activation,
            active: Some(Active {
                output: scratch(ctx, shape, "activation output")?,
                forward: prepare(ctx, forward, shape.extent())?,
                training,
            }),
        })
    }

    /// Input and output extent.
    #[must_use]
    pub const fn shape(&self) -> Shape {
        self.shape
    }

    /// Function applied.
    #[must_use]
    pub const fn activation(&self) -> Activation {
        self.activation
    }

    pub(super) fn forward(
        &mut self,
        stream: &mut CommandStream<'_>,
        input: &DeviceTensor,
    ) -> Result<DeviceTensor> {
        let Some(active) = &self.active else {
            return Ok(input.clone());
        };
        stream.dispatch(
            &active.forward,
            &[active.output.descriptor(), input.values(), active.output.values()],
            self.shape.extent(),
        )?;
        Ok(active.output.clone())
    }

    pub(super) fn backward(
        &mut self,
        stream: &mut CommandStream<'_>,
        next_gradient: &DeviceTensor,
    ) -> Result<DeviceTensor> {
        let Some(active) = &self.active else {
            return Ok(next_gradient.clone());
        };
        let training = require_training(active.training.as_ref(), "activation")?;
        stream.dispatch(
            &training.backward,
            &[
                active.output.descriptor(),
                active.output.values(),
                next_gradient.values(),
                training.gradient.values(),
            ],
            self.shape.extent(),
        )?;
        Ok(training.gradient.clone())
    }
}
