//! Layers.
//!
//! A network is described by a list of [`LayerSpec`]s and one [`OutputSpec`].
//! Specs are plain values: their shapes can be computed and checked without a
//! device, and only after the whole chain has been validated are they turned
//! into [`Layer`]s, which compile their kernels and allocate their tensors.
//!
//! Every layer follows the same two-phase protocol:
//!
//! - `forward(input)` records its kernels on the stream and returns its output
//!   tensor. The output is scratch owned by the layer and is overwritten by the
//!   next forward pass.
//! - `backward(next_gradient, input)` records the gradient with respect to its
//!   input and, for weight-adjustable layers, adds this sample's contribution
//!   to the weight gradients. Weight gradients are only ever accumulated; the
//!   optimizer clears them after consuming them.

use crate::backend::GpuContext;
use crate::error::{Error, Result};
use crate::nn::ops::dispatch::{CommandStream, WorkSize};
use crate::nn::ops::kernels::{Kernel, KernelKind};
use crate::nn::tensors::{DeviceTensor, Shape, Storage};
use alloc::{format, sync::Arc, vec::Vec};
use rand::Rng;
use rayon::prelude::*;

mod activation;
mod convolution;
mod dense;
mod output;
mod pooling;
mod reshape;

pub use activation::ActivationLayer;
pub use convolution::ConvolutionLayer;
pub use dense::DenseLayer;
pub use output::OutputLayer;
pub use pooling::PoolingLayer;
pub use reshape::ReshapeLayer;

/// Element-wise nonlinearity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Activation {
    /// `1 / (1 + e^-x)`.
    Sigmoid,
    /// `tanh(x)`.
    Tanh,
    /// `max(x, 0)`.
    #[default]
    Relu,
    /// Identity; layers using it dispatch nothing.
    Linear,
}

/// Description of a hidden layer.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LayerSpec {
    /// Fully-connected layer from `inputs` to `outputs` values.
    ///
    /// Weights are `outputs` rows of `inputs + 1` columns, bias last.
    Dense {
        /// Input vector length.
        inputs: u32,
        /// Output vector length.
        outputs: u32,
        /// Initial weights, row-major; random when absent.
        weights: Option<Vec<f32>>,
    },
    /// 2D convolution over every input slice.
    Convolution {
        /// Input extent.
        input: Shape,
        /// Number of kernels, which is the output depth.
        kernels: u32,
        /// Kernel width.
        kernel_width: u32,
        /// Kernel height.
        kernel_height: u32,
        /// Horizontal and vertical stride.
        stride: (u32, u32),
        /// Offset of the first window; negative values pad with zeros.
        inset: (i32, i32),
        /// Initial kernels, shaped `kernel_width × kernel_height × kernels·input.depth`.
        weights: Option<Vec<f32>>,
        /// Initial bias, one per kernel.
        bias: Option<Vec<f32>>,
    },
    /// Max pooling from `input` down to `output`.
    Pooling {
        /// Input extent.
        input: Shape,
        /// Output extent; each input dimension must be a multiple of it.
        output: Shape,
    },
    /// Element-wise nonlinearity.
    Activation {
        /// Input and output extent.
        shape: Shape,
        /// Function to apply.
        activation: Activation,
    },
    /// Reinterprets the shape without moving data.
    Reshape {
        /// Input extent.
        input: Shape,
        /// Output extent, same element count.
        output: Shape,
    },
}

impl LayerSpec {
    /// Dense layer with random initial weights.
    #[must_use]
    pub const fn dense(inputs: u32, outputs: u32) -> Self {
        Self::Dense {
            inputs,
            outputs,
            weights: None,
        }
    }

    /// Unit-stride, unpadded convolution with random initial weights.
    #[must_use]
    pub const fn convolution(
        input: Shape,
        kernels: u32,
        kernel_width: u32,
        kernel_height: u32,
    ) -> Self {
        Self::Convolution {
            input,
            kernels,
            kernel_width,
            kernel_height,
            stride: (1, 1),
            inset: (0, 0),
            weights: None,
            bias: None,
        }
    }

    /// Name of the layer kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Dense { .. } => "dense",
            Self::Convolution { .. } => "convolution",
            Self::Pooling { .. } => "pooling",
            Self::Activation { .. } => "activation",
            Self::Reshape { .. } => "reshape",
        }
    }

    /// Shape the layer accepts.
    #[must_use]
    pub const fn input_shape(&self) -> Shape {
        match self {
            Self::Dense { inputs, .. } => Shape::vector(*inputs),
            Self::Convolution { input, .. }
            | Self::Pooling { input, .. }
            | Self::Reshape { input, .. } => *input,
            Self::Activation { shape, .. } => *shape,
        }
    }

    /// Shape the layer produces, after checking its parameters.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] for inconsistent parameters and
    /// [`Error::ShapeMismatch`] for a reshape changing the element count.
    pub fn output_shape(&self) -> Result<Shape> {
        let input = self.input_shape();
        if input.is_empty() {
            return Err(Error::EmptyShape(input));
        }

        match self {
            Self::Dense {
                inputs,
                outputs,
                weights,
            } => {
                if *outputs == 0 {
                    return Err(invalid("dense layer needs at least one output"));
                }
                let expected = (*inputs as usize + 1) * *outputs as usize;
                check_initial(weights.as_deref(), expected, "dense weights")?;
                Ok(Shape::vector(*outputs))
            }
            Self::Convolution {
                input,
                kernels,
                kernel_width,
                kernel_height,
                stride,
                inset,
                weights,
                bias,
            } => {
                if *kernels == 0 || *kernel_width == 0 || *kernel_height == 0 {
                    return Err(invalid("convolution kernels must be non-empty"));
                }
                if stride.0 == 0 || stride.1 == 0 {
                    return Err(invalid("convolution stride must be positive"));
                }
                let width = convolved_extent(input.width, *kernel_width, stride.0, inset.0)?;
                let height = convolved_extent(input.height, *kernel_height, stride.1, inset.1)?;
                let kernel_shape =
                    convolution_kernel_shape(*input, *kernels, *kernel_width, *kernel_height);
                check_initial(weights.as_deref(), kernel_shape.len(), "convolution kernels")?;
                check_initial(bias.as_deref(), *kernels as usize, "convolution bias")?;
                Ok(Shape::new(width, height, *kernels))
            }
            Self::Pooling { input, output } => {
                if output.is_empty() {
                    return Err(Error::EmptyShape(*output));
                }
                let divides = input.width % output.width == 0
                    && input.height % output.height == 0
                    && input.depth % output.depth == 0;
                if !divides {
                    return Err(invalid(&format!(
                        "pooling input {input} is not a multiple of output {output}"
                    )));
                }
                Ok(*output)
            }
            Self::Activation { shape, .. } => Ok(*shape),
            Self::Reshape { input, output } => {
                if input.can_reshape_to(output) {
                    Ok(*output)
                } else {
                    Err(Error::ShapeMismatch {
                        expected: *input,
                        found: *output,
                    })
                }
            }
        }
    }
}

/// Description of the terminal layer, which also produces the loss gradient.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OutputSpec {
    /// Softmax over the whole volume, trained with cross-entropy.
    Softmax {
        /// Input and output extent.
        shape: Shape,
    },
    /// Element-wise nonlinearity, trained with squared error.
    Activation {
        /// Input and output extent.
        shape: Shape,
        /// Function to apply.
        activation: Activation,
    },
}

impl OutputSpec {
    /// Shape consumed and produced.
    #[must_use]
    pub const fn shape(&self) -> Shape {
        match self {
            Self::Softmax { shape } | Self::Activation { shape, .. } => *shape,
        }
    }

    /// Loss of one sample, computed on the host for progress reporting.
    ///
    /// Cross-entropy for softmax outputs, half the squared error otherwise.
    #[must_use]
    pub fn loss_value(&self, expected: &[f32], actual: &[f32]) -> f32 {
        match self {
            Self::Softmax { .. } => expected
                .iter()
                .zip(actual)
                .map(|(&e, &a)| -e * a.max(1e-7).ln())
                .sum(),
            Self::Activation { .. } => {
                0.5 * expected
                    .iter()
                    .zip(actual)
                    .map(|(&e, &a)| (a - e) * (a - e))
                    .sum::<f32>()
            }
        }
    }
}

/// A weight tensor paired with its accumulated gradient.
#[derive(Debug, Clone, Copy)]
pub struct Parameter<'a> {
    /// Values the optimizer updates.
    pub weights: &'a DeviceTensor,
    /// Gradient accumulated over the current batch.
    pub gradient: &'a DeviceTensor,
}

/// A hidden layer built on a device.
#[derive(Debug)]
pub enum Layer {
    /// See [`DenseLayer`].
    Dense(DenseLayer),
    /// See [`ConvolutionLayer`].
    Convolution(ConvolutionLayer),
    /// See [`PoolingLayer`].
    Pooling(PoolingLayer),
    /// See [`ActivationLayer`].
    Activation(ActivationLayer),
    /// See [`ReshapeLayer`].
    Reshape(ReshapeLayer),
}

impl Layer {
    /// Compiles kernels and allocates tensors for `spec`.
    ///
    /// With `trainable` unset no gradient tensors are allocated and
    /// [`backward`](Self::backward) fails.
    ///
    /// # Errors
    ///
    /// Configuration errors from the spec, kernel compilation and allocation
    /// failures.
    pub fn build(ctx: &Arc<GpuContext>, spec: &LayerSpec, trainable: bool) -> Result<Self> {
        let output_shape = spec.output_shape()?;
        Ok(match spec {
            LayerSpec::Dense {
                inputs,
                outputs,
                weights,
            } => Self::Dense(DenseLayer::new(
                ctx,
                *inputs,
                *outputs,
                weights.as_deref(),
                trainable,
            )?),
            LayerSpec::Convolution {
                input,
                kernels,
                kernel_width,
                kernel_height,
                stride,
                inset,
                weights,
                bias,
            } => Self::Convolution(ConvolutionLayer::new(
                ctx,
                &convolution::Geometry {
                    input: *input,
                    output: output_shape,
                    kernel: convolution_kernel_shape(
                        *input,
                        *kernels,
                        *kernel_width,
                        *kernel_height,
                    ),
                    stride: *stride,
                    inset: *inset,
                },
                weights.as_deref(),
                bias.as_deref(),
                trainable,
            )?),
            LayerSpec::Pooling { input, output } => {
                Self::Pooling(PoolingLayer::new(ctx, *input, *output, trainable)?)
            }
            LayerSpec::Activation { shape, activation } => {
                Self::Activation(ActivationLayer::new(ctx, *shape, *activation, trainable)?)
            }
            LayerSpec::Reshape { input, output } => {
                Self::Reshape(ReshapeLayer::new(*input, *output))
            }
        })
    }

    /// Name of the layer kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Dense(_) => "dense",
            Self::Convolution(_) => "convolution",
            Self::Pooling(_) => "pooling",
            Self::Activation(_) => "activation",
            Self::Reshape(_) => "reshape",
        }
    }

    /// Shape accepted by [`forward`](Self::forward).
    #[must_use]
    pub const fn input_shape(&self) -> Shape {
        match self {
            Self::Dense(l) => l.input_shape(),
            Self::Convolution(l) => l.input_shape(),
            Self::Pooling(l) => l.input_shape(),
            Self::Activation(l) => l.shape(),
            Self::Reshape(l) => l.input_shape(),
        }
    }

    /// Shape returned by [`forward`](Self::forward).
    #[must_use]
    pub const fn output_shape(&self) -> Shape {
        match self {
            Self::Dense(l) => l.output_shape(),
            Self::Convolution(l) => l.output_shape(),
            Self::Pooling(l) => l.output_shape(),
            Self::Activation(l) => l.shape(),
            Self::Reshape(l) => l.output_shape(),
        }
    }

    /// Records the forward pass.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] for a wrong input shape; dispatch failures.
    pub fn forward(
        &mut self,
        stream: &mut CommandStream<'_>,
        input: &DeviceTensor,
    ) -> Result<DeviceTensor> {
        expect_shape(self.input_shape(), input)?;
        match self {
            Self::Dense(l) => l.forward(stream, input),
            Self::Convolution(l) => l.forward(stream, input),
            Self::Pooling(l) => l.forward(stream, input),
            Self::Activation(l) => l.forward(stream, input),
            Self::Reshape(l) => l.forward(input),
        }
    }

    /// Records the backward pass and returns the gradient for the previous layer.
    ///
    /// `input` must be the tensor this layer consumed in the matching forward
    /// pass.
    ///
    /// # Errors
    ///
    /// [`Error::BackwardUnavailable`] for layers built without gradient
    /// tensors; shape and dispatch failures.
    pub fn backward(
        &mut self,
        stream: &mut CommandStream<'_>,
        next_gradient: &DeviceTensor,
        input: &DeviceTensor,
    ) -> Result<DeviceTensor> {
        expect_shape(self.output_shape(), next_gradient)?;
        expect_shape(self.input_shape(), input)?;
        match self {
            Self::Dense(l) => l.backward(stream, next_gradient, input),
            Self::Convolution(l) => l.backward(stream, next_gradient, input),
            Self::Pooling(l) => l.backward(stream, next_gradient, input),
            Self::Activation(l) => l.backward(stream, next_gradient),
            Self::Reshape(l) => l.backward(next_gradient),
        }
    }

    /// Weight/gradient pairs in a stable order; empty for layers without weights.
    #[must_use]
    pub fn parameters(&self) -> Vec<Parameter<'_>> {
        match self {
            Self::Dense(l) => l.parameters(),
            Self::Convolution(l) => l.parameters(),
            Self::Pooling(_) | Self::Activation(_) | Self::Reshape(_) => Vec::new(),
        }
    }

    /// Weight tensors in the same order as [`parameters`](Self::parameters).
    #[must_use]
    pub fn weights(&self) -> Vec<&DeviceTensor> {
        match self {
            Self::Dense(l) => alloc::vec![l.weights()],
            Self::Convolution(l) => alloc::vec![l.kernels(), l.bias()],
            Self::Pooling(_) | Self::Activation(_) | Self::Reshape(_) => Vec::new(),
        }
    }
}

pub(crate) fn expect_shape(expected: Shape, tensor: &DeviceTensor) -> Result<()> {
    if tensor.shape() == expected {
        Ok(())
    } else {
        Err(Error::ShapeMismatch {
            expected,
            found: tensor.shape(),
        })
    }
}

/// Gradient tensor, or the loud failure for layers built for inference.
pub(crate) fn require_training<'a, T>(
    training: Option<&'a T>,
    layer: &'static str,
) -> Result<&'a T> {
    training.ok_or(Error::BackwardUnavailable {
        layer,
        reason: "built without gradient tensors",
    })
}

/// Allocates a tensor holding `initial`, or Glorot-uniform values.
pub(crate) fn weight_tensor(
    ctx: &Arc<GpuContext>,
    shape: Shape,
    initial: Option<&[f32]>,
    fan: (u32, u32),
    label: &str,
) -> Result<DeviceTensor> {
    let random;
    let values = match initial {
        Some(values) => values,
        None => {
            random = glorot_uniform(shape.len(), fan);
            &random
        }
    };
    DeviceTensor::from_values(ctx, shape, values, Storage::Private, label)
}

/// Compiles `kind` and builds its pipeline for the group `extent` will be
/// dispatched with, so compilation failures surface at construction.
pub(crate) fn prepare(ctx: &GpuContext, kind: KernelKind, extent: [u32; 3]) -> Result<Kernel> {
    let kernel = ctx.kernel(kind)?;
    let work = WorkSize::plan(extent, ctx.limits())?;
    kernel.pipeline(ctx.device(), work.group)?;
    Ok(kernel)
}

/// Allocates a zeroed scratch tensor.
pub(crate) fn scratch(ctx: &Arc<GpuContext>, shape: Shape, label: &str) -> Result<DeviceTensor> {
    DeviceTensor::allocate(ctx, shape, Storage::Private, label)
}

#[allow(clippy::cast_precision_loss)]
fn glorot_uniform(len: usize, (fan_in, fan_out): (u32, u32)) -> Vec<f32> {
    let bound = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
    let mut values = alloc::vec![0.0f32; len];
    values
        .par_iter_mut()
        .for_each_init(rand::rng, |rng, v| *v = rng.random_range(-bound..=bound));
    values
}

fn convolved_extent(input: u32, kernel: u32, stride: u32, inset: i32) -> Result<u32> {
    let span = i64::from(input) - i64::from(kernel) - 2 * i64::from(inset);
    if span < 0 {
        return Err(invalid(&format!(
            "kernel extent {kernel} with inset {inset} does not fit input extent {input}"
        )));
    }
    u32::try_from(span / i64::from(stride) + 1).map_err(|_| invalid("convolution output too large"))
}

const fn convolution_kernel_shape(input: Shape, kernels: u32, width: u32, height: u32) -> Shape {
    Shape::new(width, height, kernels * input.depth)
}

fn check_initial(values: Option<&[f32]>, expected: usize, what: &str) -> Result<()> {
    match values {
        Some(values) if values.len() != expected => Err(invalid(&format!(
            "{what}: expected {expected} values, got {}",
            values.len()
        ))),
        _ => Ok(()),
    }
}

fn invalid(message: &str) -> Error {
    Error::InvalidConfig(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_shapes() {
        let spec = LayerSpec::dense(3, 2);
        assert_eq!(spec.input_shape(), Shape::vector(3));
        assert_eq!(spec.output_shape().unwrap(), Shape::vector(2));

        let bad = LayerSpec::Dense {
            inputs: 1,
            outputs: 1,
            weights: Some(alloc::vec![0.5]),
        };
        assert!(matches!(bad.output_shape(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn convolution_output_extent() {
        let valid = LayerSpec::convolution(Shape::new(5, 5, 2), 4, 3, 3);
        assert_eq!(valid.output_shape().unwrap(), Shape::new(3, 3, 4));

        let padded = LayerSpec::Convolution {
            input: Shape::new(5, 5, 1),
            kernels: 1,
            kernel_width: 3,
            kernel_height: 3,
            stride: (1, 1),
            inset: (-1, -1),
            weights: None,
            bias: None,
        };
        assert_eq!(padded.output_shape().unwrap(), Shape::new(5, 5, 1));

        let strided = LayerSpec::Convolution {
            input: Shape::new(8, 6, 1),
            kernels: 2,
            kernel_width: 2,
            kernel_height: 2,
            stride: (2, 2),
            inset: (0, 0),
            weights: None,
            bias: None,
        };
        assert_eq!(strided.output_shape().unwrap(), Shape::new(4, 3, 2));
    }

    #[test]
    fn convolution_rejects_oversized_kernel() {
        let spec = LayerSpec::convolution(Shape::new(2, 2, 1), 1, 3, 3);
        assert!(matches!(spec.output_shape(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn pooling_requires_divisible_extents() {
        let ok = LayerSpec::Pooling {
            input: Shape::new(4, 4, 1),
            output: Shape::new(2, 2, 1),
        };
        assert_eq!(ok.output_shape().unwrap(), Shape::new(2, 2, 1));

        let bad = LayerSpec::Pooling {
            input: Shape::new(5, 4, 1),
            output: Shape::new(2, 2, 1),
        };
        assert!(bad.output_shape().is_err());
    }

    #[test]
    fn reshape_keeps_element_count() {
        let ok = LayerSpec::Reshape {
            input: Shape::new(2, 2, 3),
            output: Shape::vector(12),
        };
        assert_eq!(ok.output_shape().unwrap(), Shape::vector(12));

        let bad = LayerSpec::Reshape {
            input: Shape::new(2, 2, 3),
            output: Shape::vector(11),
        };
        assert!(matches!(bad.output_shape(), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn loss_values() {
        let softmax = OutputSpec::Softmax {
            shape: Shape::vector(2),
        };
        let ce = softmax.loss_value(&[1.0, 0.0], &[0.5, 0.5]);
        assert!((ce - core::f32::consts::LN_2).abs() < 1e-6);

        let linear = OutputSpec::Activation {
            shape: Shape::vector(2),
            activation: Activation::Linear,
        };
        assert!((linear.loss_value(&[1.0, 2.0], &[2.0, 0.0]) - 2.5).abs() < 1e-6);
    }

    #[test]
    fn glorot_values_stay_in_bounds() {
        let values = glorot_uniform(1000, (10, 5));
        let bound = (6.0f32 / 15.0).sqrt();
        assert!(values.iter().all(|v| v.abs() <= bound));
        assert!(values.iter().any(|&v| v != 0.0));
    }
}
