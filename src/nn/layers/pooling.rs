use super::{prepare, require_training, scratch};
use crate::backend::GpuContext;
use crate::error::Result;
use crate::nn::ops::dispatch::CommandStream;
use crate::nn::ops::kernels::{Kernel, KernelKind};
use crate::nn::tensors::{DeviceTensor, Shape};
use alloc::sync::Arc;

/// Max pooling over non-overlapping blocks.
///
/// The block extent along each axis is the input extent divided by the
/// output extent. Backward routes each output gradient to the first position
/// holding its block's maximum; every other input position gets zero.
#[derive(Debug)]
pub struct PoolingLayer {
    input: Shape,
    output: DeviceTensor,
    forward: Kernel,
    training: Option<Training>,
}

#[derive(Debug)]
struct Training {
    input_gradient: DeviceTensor,
    backward: Kernel,
}

impl PoolingLayer {
    pub(super) fn new(
        ctx: &Arc<GpuContext>,
        input: Shape,
        output: Shape,
        trainable: bool,
    ) -> Result<Self> {
        let forward = prepare(ctx, KernelKind::MaxPoolForward, output.extent())?;
        let training = if trainable {
            Some(Training {
                input_gradient: scratch(ctx, input, "pooling input gradient")?,
                backward: prepare(ctx, KernelKind::MaxPoolBackward, input.extent())?,
            })
        } else {
            None
        };

        Ok(Self {
            input,
            output: scratch(ctx, output, "pooling output")?,
            forward,
            training,
        })
    }

    /// Input extent.
    #[must_use]
    pub const fn input_shape(&self) -> Shape {
        self.input
    }

    /// Output extent.
    #[must_use]
    pub const fn output_shape(&self) -> Shape {
        self.output.shape()
    }

    pub(super) fn forward(
        &mut self,
        stream: &mut CommandStream<'_>,
        input: &DeviceTensor,
    ) -> Result<DeviceTensor> {
        stream.dispatch(
            &self.forward,
            &[
                input.descriptor(),
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
        let training = require_training(self.training.as_ref(), "pooling")?;
        stream.dispatch(
            &training.backward,
            &[
                input.descriptor(),
                input.values(),
                self.output.descriptor(),
                next_gradient.values(),
                training.input_gradient.values(),
            ],
            self.input.extent(),
        )?;
        Ok(training.input_gradient.clone())
    }
}
