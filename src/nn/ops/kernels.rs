//! Compiled kernel handles.
//!
//! Kernels are grouped into families, one WGSL source each. Every source is
//! prefixed with a shared prelude holding the shape descriptor. The group size
//! is written into the source as constants, so a family compiles into one
//! module per group size the dispatcher asks for.

use crate::error::{Error, Result};
use alloc::{format, string::String, sync::Arc, vec::Vec};
use parking_lot::Mutex;
use std::collections::HashMap;

const PRELUDE: &str = include_str!("shaders/prelude.wgsl");
const DENSE: &str = include_str!("shaders/dense.wgsl");
const CONVOLUTION: &str = include_str!("shaders/convolution.wgsl");
const POOLING: &str = include_str!("shaders/pooling.wgsl");
const ACTIVATION: &str = include_str!("shaders/activation.wgsl");
const SOFTMAX: &str = include_str!("shaders/softmax.wgsl");
const LOSS: &str = include_str!("shaders/loss.wgsl");
const OPTIMIZER: &str = include_str!("shaders/optimizer.wgsl");

lazy_static::lazy_static! {
    static ref SOURCES: HashMap<Family, String> = [
        (Family::Dense, DENSE),
        (Family::Convolution, CONVOLUTION),
        (Family::Pooling, POOLING),
        (Family::Activation, ACTIVATION),
        (Family::Softmax, SOFTMAX),
        (Family::Loss, LOSS),
        (Family::Optimizer, OPTIMIZER),
    ]
    .into_iter()
    .map(|(family, body)| (family, format!("{PRELUDE}\n{body}")))
    .collect();
}

/// A WGSL module grouping related entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// Fully-connected layers.
    Dense,
    /// Convolution layers.
    Convolution,
    /// Max pooling.
    Pooling,
    /// Element-wise nonlinearities.
    Activation,
    /// Softmax output.
    Softmax,
    /// Output loss gradients.
    Loss,
    /// Weight updates and regularization.
    Optimizer,
}

impl Family {
    fn source(self) -> &'static str {
        SOURCES.get(&self).map_or("", String::as_str)
    }

    /// The family source with its group size fixed.
    fn specialized(self, group: [u32; 3]) -> String {
        let [x, y, z] = group;
        format!(
            "const group_x: u32 = {x}u;\n\
             const group_y: u32 = {y}u;\n\
             const group_z: u32 = {z}u;\n{}",
            self.source()
        )
    }

    const fn label(self) -> &'static str {
        match self {
            Self::Dense => "dense",
            Self::Convolution => "convolution",
            Self::Pooling => "pooling",
            Self::Activation => "activation",
            Self::Softmax => "softmax",
            Self::Loss => "loss",
            Self::Optimizer => "optimizer",
        }
    }
}

/// How a kernel accesses one binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Uniform parameters (shape descriptors, hyperparameters).
    Uniform,
    /// Read-only storage.
    Read,
    /// Read-write storage.
    ReadWrite,
}

/// A binding slot: WGSL binding number and access.
pub type Slot = (u32, Access);

use Access::{Read, ReadWrite, Uniform};

/// Every kernel in the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelKind {
    /// `out = W · [in, 1]`.
    DenseForward,
    /// `grad_in = Wᵀ · grad_out`.
    DenseBackwardInput,
    /// `dW += grad_out ⊗ [in, 1]`.
    DenseWeightGradient,
    /// Strided, inset correlation plus bias.
    ConvolutionForward,
    /// Gradient with respect to the convolution input.
    ConvolutionBackwardInput,
    /// Accumulated gradient of the convolution kernels.
    ConvolutionKernelGradient,
    /// Accumulated gradient of the convolution bias.
    ConvolutionBiasGradient,
    /// Block maximum.
    MaxPoolForward,
    /// Routes gradients to each block's maximum.
    MaxPoolBackward,
    /// Logistic function.
    SigmoidForward,
    /// Hyperbolic tangent.
    TanhForward,
    /// Rectifier.
    ReluForward,
    /// Gradient through the logistic function.
    SigmoidBackward,
    /// Gradient through tanh.
    TanhBackward,
    /// Gradient through the rectifier.
    ReluBackward,
    /// First softmax pass: shifted exponentials.
    SoftmaxExponentiate,
    /// Second softmax pass: normalization by the total.
    SoftmaxNormalize,
    /// `grad = actual - expected`.
    LossDifference,
    /// Difference scaled by the logistic derivative.
    LossSigmoid,
    /// Difference scaled by the tanh derivative.
    LossTanh,
    /// Difference scaled by the rectifier derivative.
    LossRelu,
    /// Plain gradient descent step.
    SgdUpdate,
    /// Momentum step.
    MomentumUpdate,
    /// Gradient-sum adaptive step.
    AdaGradUpdate,
    /// Decayed adaptive step.
    RmsPropUpdate,
    /// Parameter-free adaptive step.
    AdaDeltaUpdate,
    /// Adds L1/L2 terms to an accumulated gradient.
    Regularize,
}

impl KernelKind {
    /// WGSL entry point, also used as the kernel's label.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::DenseForward => "dense_forward",
            Self::DenseBackwardInput => "dense_backward_input",
            Self::DenseWeightGradient => "dense_weight_gradient",
            Self::ConvolutionForward => "convolution_forward",
            Self::ConvolutionBackwardInput => "convolution_backward_input",
            Self::ConvolutionKernelGradient => "convolution_kernel_gradient",
            Self::ConvolutionBiasGradient => "convolution_bias_gradient",
            Self::MaxPoolForward => "max_pool_forward",
            Self::MaxPoolBackward => "max_pool_backward",
            Self::SigmoidForward => "sigmoid_forward",
            Self::TanhForward => "tanh_forward",
            Self::ReluForward => "relu_forward",
            Self::SigmoidBackward => "sigmoid_backward",
            Self::TanhBackward => "tanh_backward",
            Self::ReluBackward => "relu_backward",
            Self::SoftmaxExponentiate => "softmax_exponentiate",
            Self::SoftmaxNormalize => "softmax_normalize",
            Self::LossDifference => "loss_difference",
            Self::LossSigmoid => "loss_sigmoid",
            Self::LossTanh => "loss_tanh",
            Self::LossRelu => "loss_relu",
            Self::SgdUpdate => "sgd_update",
            Self::MomentumUpdate => "momentum_update",
            Self::AdaGradUpdate => "adagrad_update",
            Self::RmsPropUpdate => "rmsprop_update",
            Self::AdaDeltaUpdate => "adadelta_update",
            Self::Regularize => "regularize",
        }
    }

    /// The module defining this entry point.
    #[must_use]
    pub const fn family(self) -> Family {
        match self {
            Self::DenseForward | Self::DenseBackwardInput | Self::DenseWeightGradient => {
                Family::Dense
            }
            Self::ConvolutionForward
            | Self::ConvolutionBackwardInput
            | Self::ConvolutionKernelGradient
            | Self::ConvolutionBiasGradient => Family::Convolution,
            Self::MaxPoolForward | Self::MaxPoolBackward => Family::Pooling,
            Self::SigmoidForward
            | Self::TanhForward
            | Self::ReluForward
            | Self::SigmoidBackward
            | Self::TanhBackward
            | Self::ReluBackward => Family::Activation,
            Self::SoftmaxExponentiate | Self::SoftmaxNormalize => Family::Softmax,
            Self::LossDifference | Self::LossSigmoid | Self::LossTanh | Self::LossRelu => {
                Family::Loss
            }
            Self::SgdUpdate
            | Self::MomentumUpdate
            | Self::AdaGradUpdate
            | Self::RmsPropUpdate
            | Self::AdaDeltaUpdate
            | Self::Regularize => Family::Optimizer,
        }
    }

    /// Binding slots in the order buffers are passed to a dispatch.
    #[must_use]
    pub const fn slots(self) -> &'static [Slot] {
        match self {
            // weights_shape, weights, input, output_shape, output
            Self::DenseForward => &[
                (0, Uniform),
                (1, Read),
                (3, Read),
                (4, Uniform),
                (5, ReadWrite),
            ],
            // weights_shape, weights, input_shape, next_gradient, input_gradient
            Self::DenseBackwardInput => &[
                (0, Uniform),
                (1, Read),
                (2, Uniform),
                (7, Read),
                (9, ReadWrite),
            ],
            // weights_shape, input, next_gradient, weight_gradient
            Self::DenseWeightGradient => &[(0, Uniform), (3, Read), (7, Read), (8, ReadWrite)],
            // input_shape, input, kernel_shape, kernels, bias, output_shape, output, params
            Self::ConvolutionForward => &[
                (0, Uniform),
                (1, Read),
                (2, Uniform),
                (3, Read),
                (4, Read),
                (5, Uniform),
                (6, ReadWrite),
                (7, Uniform),
            ],
            // input_shape, kernel_shape, kernels, output_shape, params,
            // next_gradient, input_gradient
            Self::ConvolutionBackwardInput => &[
                (0, Uniform),
                (2, Uniform),
                (3, Read),
                (5, Uniform),
                (7, Uniform),
                (8, Read),
                (9, ReadWrite),
            ],
            // input_shape, input, kernel_shape, output_shape, params,
            // next_gradient, kernel_gradient
            Self::ConvolutionKernelGradient => &[
                (0, Uniform),
                (1, Read),
                (2, Uniform),
                (5, Uniform),
                (7, Uniform),
                (8, Read),
                (10, ReadWrite),
            ],
            // output_shape, next_gradient, bias_gradient
            Self::ConvolutionBiasGradient => &[(5, Uniform), (8, Read), (11, ReadWrite)],
            // input_shape, input, output_shape, output
            Self::MaxPoolForward => &[(0, Uniform), (1, Read), (2, Uniform), (3, ReadWrite)],
            // input_shape, input, output_shape, next_gradient, input_gradient
            Self::MaxPoolBackward => &[
                (0, Uniform),
                (1, Read),
                (2, Uniform),
                (4, Read),
                (5, ReadWrite),
            ],
            // shape, values, output
            Self::SigmoidForward | Self::TanhForward | Self::ReluForward => {
                &[(0, Uniform), (1, Read), (2, ReadWrite)]
            }
            // shape, values (forward output), next_gradient, gradient
            Self::SigmoidBackward | Self::TanhBackward | Self::ReluBackward => {
                &[(0, Uniform), (1, Read), (3, Read), (4, ReadWrite)]
            }
            // shape, input, exponentials
            Self::SoftmaxExponentiate => &[(0, Uniform), (1, Read), (2, ReadWrite)],
            // shape, exponentials, output
            Self::SoftmaxNormalize => &[(0, Uniform), (3, Read), (4, ReadWrite)],
            // shape, actual, expected, gradient
            Self::LossDifference | Self::LossSigmoid | Self::LossTanh | Self::LossRelu => {
                &[(0, Uniform), (1, Read), (2, Read), (3, ReadWrite)]
            }
            // shape, weights, gradient, params
            Self::SgdUpdate => &[(0, Uniform), (1, ReadWrite), (2, ReadWrite), (5, Uniform)],
            // shape, weights, gradient, accumulator, params
            Self::MomentumUpdate | Self::AdaGradUpdate | Self::RmsPropUpdate => &[
                (0, Uniform),
                (1, ReadWrite),
                (2, ReadWrite),
                (3, ReadWrite),
                (5, Uniform),
            ],
            // shape, weights, gradient, accumulator, second accumulator, params
            Self::AdaDeltaUpdate => &[
                (0, Uniform),
                (1, ReadWrite),
                (2, ReadWrite),
                (3, ReadWrite),
                (4, ReadWrite),
                (5, Uniform),
            ],
            // shape, weights, gradient, regularization
            Self::Regularize => &[(0, Uniform), (1, ReadWrite), (2, ReadWrite), (6, Uniform)],
        }
    }
}

/// A compiled kernel: bind-group layout and per-group-size pipelines.
///
/// Cloning is cheap; clones share the pipeline cache.
#[derive(Clone)]
pub struct Kernel {
    inner: Arc<KernelInner>,
}

struct KernelInner {
    kind: KernelKind,
    modules: Arc<ModuleCache>,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    pipelines: Mutex<HashMap<[u32; 3], Arc<wgpu::ComputePipeline>>>,
}

impl Kernel {
    /// Which kernel this is.
    #[must_use]
    pub fn kind(&self) -> KernelKind {
        self.inner.kind
    }

    /// Entry point name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.inner.kind.name()
    }

    /// Returns the pipeline specialized for `group`, building it on first use.
    ///
    /// # Errors
    ///
    /// [`Error::KernelCompilation`] if the device rejects the pipeline.
    pub fn pipeline(
        &self,
        device: &wgpu::Device,
        group: [u32; 3],
    ) -> Result<Arc<wgpu::ComputePipeline>> {
        let mut pipelines = self.inner.pipelines.lock();
        if let Some(pipeline) = pipelines.get(&group) {
            return Ok(Arc::clone(pipeline));
        }

        let name = self.name();
        let module = self
            .inner
            .modules
            .get_or_compile(device, self.inner.kind.family(), group, name)?;
        let pipeline = validated(device, name, || {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(name),
                layout: Some(&self.inner.pipeline_layout),
                module: &module,
                entry_point: Some(name),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            })
        })?;
        log::debug!("built pipeline {name} for group {group:?}");

        let pipeline = Arc::new(pipeline);
        pipelines.insert(group, Arc::clone(&pipeline));
        Ok(pipeline)
    }

    /// Binds `buffers` to this kernel's slots, in order.
    ///
    /// # Errors
    ///
    /// [`Error::Binding`] if the number of buffers does not match the slots.
    pub fn bind_group(
        &self,
        device: &wgpu::Device,
        buffers: &[&wgpu::Buffer],
    ) -> Result<wgpu::BindGroup> {
        let slots = self.inner.kind.slots();
        if slots.len() != buffers.len() {
            return Err(Error::Binding {
                kernel: self.name(),
                expected: slots.len(),
                found: buffers.len(),
            });
        }

        let entries: Vec<wgpu::BindGroupEntry<'_>> = slots
            .iter()
            .zip(buffers)
            .map(|(&(binding, _), buffer)| wgpu::BindGroupEntry {
                binding,
                resource: buffer.as_entire_binding(),
            })
            .collect();

        Ok(device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(self.name()),
            layout: &self.inner.bind_group_layout,
            entries: &entries,
        }))
    }
}

impl core::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Kernel")
            .field("kind", &self.inner.kind)
            .field("pipelines", &self.inner.pipelines.lock().len())
            .finish_non_exhaustive()
    }
}

/// Compiled modules keyed by family and group size.
#[derive(Default)]
struct ModuleCache(Mutex<HashMap<(Family, [u32; 3]), Arc<wgpu::ShaderModule>>>);

impl ModuleCache {
    fn get_or_compile(
        &self,
        device: &wgpu::Device,
        family: Family,
        group: [u32; 3],
        requested_by: &'static str,
    ) -> Result<Arc<wgpu::ShaderModule>> {
        let mut modules = self.0.lock();
        if let Some(module) = modules.get(&(family, group)) {
            return Ok(Arc::clone(module));
        }

        let source = family.specialized(group);
        let module = validated(device, requested_by, || {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(family.label()),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            })
        })?;
        log::debug!("compiled {} kernels for group {group:?}", family.label());

        let module = Arc::new(module);
        modules.insert((family, group), Arc::clone(&module));
        Ok(module)
    }

    fn len(&self) -> usize {
        self.0.lock().len()
    }
}

/// Per-device cache of compiled modules and kernels.
#[derive(Default)]
pub(crate) struct KernelCache {
    modules: Arc<ModuleCache>,
    kernels: Mutex<HashMap<KernelKind, Kernel>>,
}

impl KernelCache {
    pub(crate) fn get_or_compile(&self, device: &wgpu::Device, kind: KernelKind) -> Result<Kernel> {
        let mut kernels = self.kernels.lock();
        if let Some(kernel) = kernels.get(&kind) {
            return Ok(kernel.clone());
        }

        let entries: Vec<wgpu::BindGroupLayoutEntry> = kind
            .slots()
            .iter()
            .map(|&(binding, access)| layout_entry(binding, access))
            .collect();

        let bind_group_layout = validated(device, kind.name(), || {
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(kind.name()),
                entries: &entries,
            })
        })?;
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(kind.name()),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let kernel = Kernel {
            inner: Arc::new(KernelInner {
                kind,
                modules: Arc::clone(&self.modules),
                bind_group_layout,
                pipeline_layout,
                pipelines: Mutex::new(HashMap::new()),
            }),
        };
        kernels.insert(kind, kernel.clone());
        Ok(kernel)
    }

    pub(crate) fn kernel_count(&self) -> usize {
        self.kernels.lock().len()
    }

    pub(crate) fn module_count(&self) -> usize {
        self.modules.len()
    }
}

fn layout_entry(binding: u32, access: Access) -> wgpu::BindGroupLayoutEntry {
    let ty = match access {
        Access::Uniform => wgpu::BufferBindingType::Uniform,
        Access::Read => wgpu::BufferBindingType::Storage { read_only: true },
        Access::ReadWrite => wgpu::BufferBindingType::Storage { read_only: false },
    };
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Runs `create` inside a validation error scope.
fn validated<T>(
    device: &wgpu::Device,
    kernel: &'static str,
    create: impl FnOnce() -> T,
) -> Result<T> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let value = create();
    match pollster::block_on(device.pop_error_scope()) {
        None => Ok(value),
        Some(err) => Err(Error::KernelCompilation {
            kernel,
            message: err.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [KernelKind; 27] = [
        KernelKind::DenseForward,
        KernelKind::DenseBackwardInput,
        KernelKind::DenseWeightGradient,
        KernelKind::ConvolutionForward,
        KernelKind::ConvolutionBackwardInput,
        KernelKind::ConvolutionKernelGradient,
        KernelKind::ConvolutionBiasGradient,
        KernelKind::MaxPoolForward,
        KernelKind::MaxPoolBackward,
        KernelKind::SigmoidForward,
        KernelKind::TanhForward,
        KernelKind::ReluForward,
        KernelKind::SigmoidBackward,
        KernelKind::TanhBackward,
        KernelKind::ReluBackward,
        KernelKind::SoftmaxExponentiate,
        KernelKind::SoftmaxNormalize,
        KernelKind::LossDifference,
        KernelKind::LossSigmoid,
        KernelKind::LossTanh,
        KernelKind::LossRelu,
        KernelKind::SgdUpdate,
        KernelKind::MomentumUpdate,
        KernelKind::AdaGradUpdate,
        KernelKind::RmsPropUpdate,
        KernelKind::AdaDeltaUpdate,
        KernelKind::Regularize,
    ];

    #[test]
    fn every_entry_point_exists_in_its_module() {
        for kind in ALL {
            let source = kind.family().source();
            assert!(
                source.contains(&format!("fn {}(", kind.name())),
                "{} missing from {} module",
                kind.name(),
                kind.family().label()
            );
        }
    }

    #[test]
    fn every_slot_is_declared_with_matching_access() {
        for kind in ALL {
            let source = kind.family().source();
            for &(binding, access) in kind.slots() {
                let declaration = format!("@binding({binding}) var<");
                let line = source
                    .lines()
                    .find(|line| line.contains(&declaration))
                    .unwrap_or_else(|| panic!("{}: binding {binding} undeclared", kind.name()));
                let expected = match access {
                    Access::Uniform => "var<uniform>",
                    Access::Read => "var<storage, read>",
                    Access::ReadWrite => "var<storage, read_write>",
                };
                assert!(line.contains(expected), "{}: {line}", kind.name());
            }
        }
    }

    #[test]
    fn slots_are_unique_per_kernel() {
        for kind in ALL {
            let mut bindings: Vec<u32> = kind.slots().iter().map(|&(b, _)| b).collect();
            bindings.sort_unstable();
            bindings.dedup();
            assert_eq!(bindings.len(), kind.slots().len(), "{}", kind.name());
        }
    }

    #[test]
    fn sources_share_the_prelude() {
        for kind in ALL {
            assert!(kind.family().source().starts_with(PRELUDE));
        }
    }

    #[test]
    fn group_size_is_written_into_the_source() {
        let source = Family::Dense.specialized([64, 2, 1]);
        assert!(source.contains("const group_x: u32 = 64u;"));
        assert!(source.contains("const group_y: u32 = 2u;"));
        assert!(source.contains("const group_z: u32 = 1u;"));
        assert!(source.ends_with(Family::Dense.source()));
        assert!(!source.contains("override"));
    }
}
