use super::{Parameter, prepare, require_training, scratch, weight_tensor};
use crate::backend::GpuContext;
use crate::error::Result;
use crate::nn::ops::dispatch::CommandStream;
use crate::nn::ops::kernels::{Kernel, KernelKind};
use crate::nn::tensors::{DeviceTensor, Shape};
use alloc::{sync::Arc, vec, vec::Vec};

/// Fully-connected layer with a bias column.
#[derive(Debug)]
pub struct DenseLayer {
    inputs: u32,
    outputs: u32,
    weights: DeviceTensor,
    output: DeviceTensor,
    forward: Kernel,
    training: Option<Training>,
}

#[derive(Debug)]
struct Training {
    weight_gradient: DeviceTensor,
    input_gradient: DeviceTensor,
    backward_input: Kernel,
    accumulate: Kernel,
}

impl DenseLayer {
    pub(super) fn new(
        ctx: &Arc<GpuContext>,
        inputs: u32,
        outputs: u32,
        initial: Option<&[f32]>,
        trainable: bool,
    ) -> Result<Self> {
        let weight_shape = Shape::matrix(inputs + 1, outputs);
        let weights =
            weight_tensor(ctx, weight_shape, initial, (inputs, outputs), "dense weights")?;
        let output = scratch(ctx, Shape::vector(outputs), "dense output")?;
        let forward = prepare(ctx, KernelKind::DenseForward, output.shape().extent())?;

        let training = if trainable {
            Some(Training {
                weight_gradient: scratch(ctx, weight_shape, "dense weight gradient")?,
                input_gradient: scratch(ctx, Shape::vector(inputs), "dense input gradient")?,
                backward_input: prepare(ctx, KernelKind::DenseBackwardInput, [inputs, 1, 1])?,
                accumulate: prepare(ctx, KernelKind::DenseWeightGradient, weight_shape.extent())?,
            })
        } else {
            None
        };

        log::debug!("dense layer {inputs} -> {outputs}");
        Ok(Self {
            inputs,
            outputs,
            weights,
            output,
            forward,
            training,
        })
    }

    /// Input vector shape.
    #[must_use]
    pub const fn input_shape(&self) -> Shape {
        Shape::vector(self.inputs)
    }

    /// Output vector shape.
    #[must_use]
    pub const fn output_shape(&self) -> Shape {
        Shape::vector(self.outputs)
    }

    /// Weight matrix, `outputs` rows of `inputs + 1` columns.
    #[must_use]
    pub const fn weights(&self) -> &DeviceTensor {
        &self.weights
    }

    pub(super) fn forward(
        &mut self,
        stream: &mut CommandStream<'_>,
        input: &DeviceTensor,
    ) -> Result<DeviceTensor> {
        stream.dispatch(
            &self.forward,
            &[
                self.weights.descriptor(),
                self.weights.values(),
                input.values(),
                self.output.descriptor(),
                self.output.values(),
            ],
            self.output.shape().extent(),
        )?;
        Ok(self.output.clone())
    }

    pub(super) fn backward(
        &mut self,
        stream: &mut CommandStream<'_>,
        next_gradient: &DeviceTensor,
        input: &DeviceTensor,
    ) -> Result<DeviceTensor> {
        let training = require_training(self.training.as_ref(), "dense")?;

        stream.dispatch(
            &training.accumulate,
            &[
                self.weights.descriptor(),
                input.values(),
                next_gradient.values(),
                training.weight_gradient.values(),
            ],
            self.weights.shape().extent(),
        )?;
        stream.dispatch(
            &training.backward_input,
            &[
                self.weights.descriptor(),
                self.weights.values(),
                training.input_gradient.descriptor(),
                next_gradient.values(),
                training.input_gradient.values(),
            ],
            training.input_gradient.shape().extent(),
        )?;
        Ok(training.input_gradient.clone())
    }

    pub(super) fn parameters(&self) -> Vec<Parameter<'_>> {
        self.training.as_ref().map_or_else(Vec::new, |training| {
            vec![Parameter {
                weights: &self.weights,
                gradient: &training.weight_gradient,
            }]
        })
    }
}
