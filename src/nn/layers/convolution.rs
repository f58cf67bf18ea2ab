use super::{Parameter, prepare, require_training, scratch, weight_tensor};
use crate::backend::GpuContext;
use crate::error::Result;
use crate::nn::ops::dispatch::CommandStream;
use crate::nn::ops::kernels::{Kernel, KernelKind};
use crate::nn::tensors::{DeviceTensor, Shape};
use alloc::{sync::Arc, vec, vec::Vec};
use bytemuck::{Pod, Zeroable};
use wgpu::util::DeviceExt;

/// Resolved extents of a convolution.
#[derive(Debug, Clone, Copy)]
pub(super) struct Geometry {
    pub input: Shape,
    pub output: Shape,
    pub kernel: Shape,
    pub stride: (u32, u32),
    pub inset: (i32, i32),
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Params {
    stride_x: u32,
    stride_y: u32,
    inset_x: i32,
    inset_y: i32,
}

/// 2D convolution: `kernels` output slices, each correlating its own
/// `input.depth` kernel slices with every input slice, plus a bias.
#[derive(Debug)]
pub struct ConvolutionLayer {
    geometry: Geometry,
    kernels: DeviceTensor,
    bias: DeviceTensor,
    output: DeviceTensor,
    params: wgpu::Buffer,
    forward: Kernel,
    training: Option<Training>,
}

#[derive(Debug)]
struct Training {
    kernel_gradient: DeviceTensor,
    bias_gradient: DeviceTensor,
    input_gradient: DeviceTensor,
    backward_input: Kernel,
    kernel_accumulate: Kernel,
    bias_accumulate: Kernel,
}

impl ConvolutionLayer {
    pub(super) fn new(
        ctx: &Arc<GpuContext>,
        geometry: &Geometry,
        initial_kernels: Option<&[f32]>,
        initial_bias: Option<&[f32]>,
        trainable: bool,
    ) -> Result<Self> {
        let Geometry {
            input,
            output,
            kernel,
            stride,
            inset,
        } = *geometry;

        let window = kernel.width * kernel.height;
        let fan = (window * input.depth, window * output.depth);
        let kernels = weight_tensor(ctx, kernel, initial_kernels, fan, "convolution kernels")?;
        let bias_shape = Shape::vector(output.depth);
        let bias = match initial_bias {
            Some(values) => weight_tensor(ctx, bias_shape, Some(values), fan, "convolution bias")?,
            None => scratch(ctx, bias_shape, "convolution bias")?,
        };
        let output_tensor = scratch(ctx, output, "convolution output")?;

        let params = ctx
            .device()
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("convolution params"),
                contents: bytemuck::bytes_of(&Params {
                    stride_x: stride.0,
                    stride_y: stride.1,
                    inset_x: inset.0,
                    inset_y: inset.1,
                }),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let forward = prepare(ctx, KernelKind::ConvolutionForward, output.extent())?;
        let training = if trainable {
            Some(Training {
                kernel_gradient: scratch(ctx, kernel, "convolution kernel gradient")?,
                bias_gradient: scratch(ctx, bias_shape, "convolution bias gradient")?,
                input_gradient: scratch(ctx, input, "convolution input gradient")?,
                backward_input: prepare(
                    ctx,
                    KernelKind::ConvolutionBackwardInput,
                    input.extent(),
                )?,
                kernel_accumulate: prepare(
                    ctx,
                    KernelKind::ConvolutionKernelGradient,
                    kernel.extent(),
                )?,
                bias_accumulate: prepare(
                    ctx,
                    KernelKind::ConvolutionBiasGradient,
                    bias_shape.extent(),
                )?,
            })
        } else {
            None
        };

        log::debug!(
            "convolution layer {input} -> {output}, kernels {kernel}, stride {stride:?}, inset {inset:?}"
        );
        Ok(Self {
            geometry: *geometry,
            kernels,
            bias,
            output: output_tensor,
            params,
            forward,
            training,
        })
    }

    /// Input extent.
    #[must_use]
    pub const fn input_shape(&self) -> Shape {
        self.geometry.input
    }

    /// Output extent.
    #[must_use]
    pub const fn output_shape(&self) -> Shape {
        self.geometry.output
    }

    /// Kernel tensor.
    #[must_use]
    pub const fn kernels(&self) -> &DeviceTensor {
        &self.kernels
    }

    /// Bias, one value per kernel.
    #[must_use]
    pub const fn bias(&self) -> &DeviceTensor {
        &self.bias
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
                self.kernels.descriptor(),
                self.kernels.values(),
                self.bias.values(),
                self.output.descriptor(),
                self.output.values(),
                &self.params,
            ],
            self.geometry.output.extent(),
        )?;
        Ok(self.output.clone())
    }

    pub(super) fn backward(
        &mut self,
        stream: &mut CommandStream<'_>,
        next_gradient: &DeviceTensor,
        input: &DeviceTensor,
    ) -> Result<DeviceTensor> {
        let training = require_training(self.training.as_ref(), "convolution")?;

        stream.dispatch(
            &training.kernel_accumulate,
            &[
                input.descriptor(),
                input.values(),
                self.kernels.descriptor(),
                self.output.descriptor(),
                &self.params,
                next_gradient.values(),
                training.kernel_gradient.values(),
            ],
            self.geometry.kernel.extent(),
        )?;
        stream.dispatch(
            &training.bias_accumulate,
            &[
                self.output.descriptor(),
                next_gradient.values(),
                training.bias_gradient.values(),
            ],
            training.bias_gradient.shape().extent(),
        )?;
        stream.dispatch(
            &training.backward_input,
            &[
                training.input_gradient.descriptor(),
                self.kernels.descriptor(),
                self.kernels.values(),
                self.output.descriptor(),
                &self.params,
                next_gradient.values(),
                training.input_gradient.values(),
            ],
            self.geometry.input.extent(),
        )?;
        Ok(training.input_gradient.clone())
    }

    pub(super) fn parameters(&self) -> Vec<Parameter<'_>> {
        self.training.as_ref().map_or_else(Vec::new, |training| {
            vec![
                Parameter {
                    weights: &self.kernels,
                    gradient: &training.kernel_gradient,
                },
                Parameter {
                    weights: &self.bias,
                    gradient: &training.bias_gradient,
                },
            ]
        })
    }
}
