use super::{Activation, OutputSpec, expect_shape, prepare, require_training, scratch};
use crate::backend::GpuContext;
use crate::error::Result;
use crate::nn::ops::dispatch::CommandStream;
use crate::nn::ops::kernels::{Kernel, KernelKind};
use crate::nn::tensors::{DeviceTensor, Shape};
use alloc::sync::Arc;

/// Terminal layer: produces the network output and, during training, the
/// gradient of the loss with respect to its own input.
///
/// Softmax outputs pair with cross-entropy and activation outputs with
/// squared error; in both cases the gradient at the input reduces to
/// `actual - expected`, scaled by the activation derivative where there is
/// one.
#[derive(Debug)]
pub struct OutputLayer {
    spec: OutputSpec,
    stage: Stage,
    loss: Option<Loss>,
}

#[derive(Debug)]
enum Stage {
    Softmax {
        exponentials: DeviceTensor,
        output: DeviceTensor,
        exponentiate: Kernel,
        normalize: Kernel,
    },
    Activation {
        output: DeviceTensor,
        forward: Kernel,
    },
    Identity,
}

#[derive(Debug)]
struct Loss {
    gradient: DeviceTensor,
    kernel: Kernel,
}

impl OutputLayer {
    /// Builds the output stage; the loss gradient is only allocated when
    /// `trainable` is set.
    ///
    /// # Errors
    ///
    /// Kernel compilation and allocation failures.
    pub fn build(ctx: &Arc<GpuContext>, spec: &OutputSpec, trainable: bool) -> Result<Self> {
        let shape = spec.shape();
        let extent = shape.extent();

        let (stage, loss_kind) = match *spec {
            OutputSpec::Softmax { .. } => (
                Stage::Softmax {
                    exponentials: scratch(ctx, shape, "softmax exponentials")?,
                    output: scratch(ctx, shape, "softmax output")?,
                    exponentiate: prepare(ctx, KernelKind::SoftmaxExponentiate, extent)?,
                    normalize: prepare(ctx, KernelKind::SoftmaxNormalize, extent)?,
                },
                KernelKind::LossDifference,
            ),
            OutputSpec::Activation { activation, .. } => {
                let stage = match activation.forward_kernel() {
                    Some(kind) => Stage::Activation {
                        output: scratch(ctx, shape, "output activation")?,
                        forward: prepare(ctx, kind, extent)?,
                    },
                    None => Stage::Identity,
                };
                (stage, activation.loss_kernel())
            }
        };

        let loss = if trainable {
            Some(Loss {
                gradient: scratch(ctx, shape, "loss gradient")?,
                kernel: prepare(ctx, loss_kind, extent)?,
            })
        } else {
            None
        };

        Ok(Self {
            spec: *spec,
            stage,
            loss,
        })
    }

    /// Description this layer was built from.
    #[must_use]
    pub const fn spec(&self) -> &OutputSpec {
        &self.spec
    }

    /// Input and output extent.
    #[must_use]
    pub const fn shape(&self) -> Shape {
        self.spec.shape()
    }

    /// Activation applied, if this is an activation output.
    #[must_use]
    pub const fn activation(&self) -> Option<Activation> {
        match self.spec {
            OutputSpec::Softmax { .. } => None,
            OutputSpec::Activation { activation, .. } => Some(activation),
        }
    }

    /// Records the output computation and returns the network output.
    ///
    /// # Errors
    ///
    /// Shape and dispatch failures.
    pub fn forward(
        &mut self,
        stream: &mut CommandStream<'_>,
        input: &DeviceTensor,
    ) -> Result<DeviceTensor> {
        expect_shape(self.shape(), input)?;
        let extent = self.shape().extent();
        match &self.stage {
            Stage::Softmax {
                exponentials,
                output,
                exponentiate,
                normalize,
            } => {
                stream.dispatch(
                    exponentiate,
                    &[output.descriptor(), input.values(), exponentials.values()],
                    extent,
                )?;
                stream.dispatch(
                    normalize,
                    &[output.descriptor(), exponentials.values(), output.values()],
                    extent,
                )?;
                Ok(output.clone())
            }
            Stage::Activation { output, forward } => {
                stream.dispatch(
                    forward,
                    &[output.descriptor(), input.values(), output.values()],
                    extent,
                )?;
                Ok(output.clone())
            }
            Stage::Identity => Ok(input.clone()),
        }
    }

    /// Records the loss gradient of `actual` against `expected`.
    ///
    /// `actual` must be the tensor returned by the matching
    /// [`forward`](Self::forward).
    ///
    /// # Errors
    ///
    /// [`Error::BackwardUnavailable`](crate::Error::BackwardUnavailable) for
    /// layers built for inference; shape and dispatch failures.
    pub fn loss(
        &mut self,
        stream: &mut CommandStream<'_>,
        expected: &DeviceTensor,
        actual: &DeviceTensor,
    ) -> Result<DeviceTensor> {
        expect_shape(self.shape(), expected)?;
        expect_shape(self.shape(), actual)?;
        let loss = require_training(self.loss.as_ref(), "output")?;
        stream.dispatch(
            &loss.kernel,
            &[
                loss.gradient.descriptor(),
                actual.values(),
                expected.values(),
                loss.gradient.values(),
            ],
            self.shape().extent(),
        )?;
        Ok(loss.gradient.clone())
    }

    /// Host-side loss of one sample; see [`OutputSpec::loss_value`].
    #[must_use]
    pub fn loss_value(&self, expected: &[f32], actual: &[f32]) -> f32 {
        self.spec.loss_value(expected, actual)
    }
}
