//! Work-size planning and command streams.
//!
//! Every kernel guards itself with a bounds check against the shape it is
//! covering, so dispatching past the logical extent is harmless. Planning only
//! has to keep each execution group within the device's invocation limit and
//! cover the whole extent.

use crate::backend::{DeviceLimits, GpuContext};
use crate::error::{Error, Result};
use crate::nn::ops::kernels::Kernel;
use crate::nn::tensors::DeviceTensor;

/// Dimension order in which ties are broken when shrinking a group.
const SHRINK_PRIORITY: [usize; 3] = [2, 1, 0];

/// A planned dispatch: group extent and group count per dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkSize {
    /// Invocations per group along x, y, z.
    pub group: [u32; 3],
    /// Groups along x, y, z.
    pub groups: [u32; 3],
}

impl WorkSize {
    /// Plans a dispatch covering `extent` under `limits`.
    ///
    /// The group starts as the extent clamped to the per-dimension maximum and
    /// is halved along its largest dimension (ties: depth, height, width)
    /// until its volume fits.
    ///
    /// # Errors
    ///
    /// [`Error::WorkSizeInvariant`] if a `1×1×1` group still exceeds the
    /// invocation limit, which only a zero limit can cause.
    pub fn plan(extent: [u32; 3], limits: &DeviceLimits) -> Result<Self> {
        let mut group = [0u32; 3];
        for (axis, size) in group.iter_mut().enumerate() {
            *size = extent[axis].min(limits.max_group_size[axis]).max(1);
        }

        let limit = u64::from(limits.max_group_invocations);
        while volume(group) > limit {
            let axis = largest_axis(group);
            if group[axis] == 1 {
                return Err(Error::WorkSizeInvariant {
                    group,
                    limit: limits.max_group_invocations,
                });
            }
            group[axis] /= 2;
        }

        let mut groups = [0u32; 3];
        for (axis, count) in groups.iter_mut().enumerate() {
            *count = extent[axis].div_ceil(group[axis]);
        }

        Ok(Self { group, groups })
    }

    /// Whether the extent was empty and nothing needs to run.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.contains(&0)
    }

    /// Total invocations launched, including the over-dispatch.
    #[must_use]
    pub fn invocations(&self) -> u64 {
        volume(self.group) * volume(self.groups)
    }
}

fn volume(v: [u32; 3]) -> u64 {
    v.iter().map(|&d| u64::from(d)).product()
}

fn largest_axis(group: [u32; 3]) -> usize {
    let mut best = SHRINK_PRIORITY[0];
    for &axis in &SHRINK_PRIORITY[1..] {
        if group[axis] > group[best] {
            best = axis;
        }
    }
    best
}

/// An ordered batch of kernel dispatches submitted and awaited as a unit.
pub struct CommandStream<'a> {
    ctx: &'a GpuContext,
    encoder: wgpu::CommandEncoder,
    dispatches: usize,
}

impl<'a> CommandStream<'a> {
    pub(crate) fn new(ctx: &'a GpuContext, label: &str) -> Self {
        let encoder = ctx
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
        Self {
            ctx,
            encoder,
            dispatches: 0,
        }
    }

    /// The context this stream records for.
    #[must_use]
    pub const fn context(&self) -> &'a GpuContext {
        self.ctx
    }

    /// Number of kernel dispatches recorded so far.
    #[must_use]
    pub const fn dispatches(&self) -> usize {
        self.dispatches
    }

    /// Records `kernel` over `extent` with `buffers` bound in slot order.
    ///
    /// # Errors
    ///
    /// Fails if the binding count is wrong, the planned group count exceeds the
    /// device limit, or the pipeline for the planned group size cannot be built.
    pub fn dispatch(
        &mut self,
        kernel: &Kernel,
        buffers: &[&wgpu::Buffer],
        extent: [u32; 3],
    ) -> Result<()> {
        let work = WorkSize::plan(extent, self.ctx.limits())?;
        if work.is_empty() {
            return Ok(());
        }

        let limit = self.ctx.limits().max_groups_per_dimension;
        if work.groups.iter().any(|&g| g > limit) {
            return Err(Error::DispatchTooLarge {
                kernel: kernel.name(),
                groups: work.groups,
                limit,
            });
        }

        let bind_group = kernel.bind_group(self.ctx.device(), buffers)?;
        let pipeline = kernel.pipeline(self.ctx.device(), work.group)?;

        log::trace!(
            "dispatch {} extent {:?} group {:?} groups {:?}",
            kernel.name(),
            extent,
            work.group,
            work.groups
        );

        {
            let mut pass = self
                .encoder
                .begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(kernel.name()),
                    timestamp_writes: None,
                });
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(work.groups[0], work.groups[1], work.groups[2]);
        }
        self.dispatches += 1;
        Ok(())
    }

    /// Records zeroing of every value of `tensor`.
    pub fn clear(&mut self, tensor: &DeviceTensor) {
        self.encoder.clear_buffer(tensor.values(), 0, None);
    }

    /// Records a device-side copy of `src`'s values into `dst`.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] if element counts differ.
    pub fn copy(&mut self, src: &DeviceTensor, dst: &DeviceTensor) -> Result<()> {
        if src.len() != dst.len() {
            return Err(Error::ShapeMismatch {
                expected: dst.shape(),
                found: src.shape(),
            });
        }
        self.encoder
            .copy_buffer_to_buffer(src.values(), 0, dst.values(), 0, src.shape().byte_len());
        Ok(())
    }

    /// Submits everything recorded and blocks until the device is done.
    ///
    /// # Errors
    ///
    /// Propagates device poll failures.
    pub fn commit_and_wait(self) -> Result<()> {
        let Self {
            ctx,
            encoder,
            dispatches,
        } = self;
        ctx.queue().submit(Some(encoder.finish()));
        ctx.device().poll(wgpu::PollType::Wait)?;
        log::trace!("stream completed ({dispatches} dispatches)");
        Ok(())
    }
}
