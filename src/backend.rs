//! Accelerator context.
//!
//! A [`GpuContext`] owns the `wgpu` device and queue together with the cache
//! of compiled kernels. It is created explicitly and handed to every tensor,
//! layer and network as an `Arc`, so two contexts (two devices, or a software
//! adapter in tests) can coexist in one process.
//!
//! # Example
//!
//! ```no_run
//! use accel_nn::backend::{ContextOptions, GpuContext};
//!
//! let ctx = GpuContext::new(&ContextOptions::default()).unwrap();
//! println!("running on {}", ctx.adapter_name());
//! ```

use crate::error::Result;
use crate::nn::ops::dispatch::CommandStream;
use crate::nn::ops::kernels::{Kernel, KernelCache, KernelKind};
use alloc::sync::Arc;
use alloc::string::String;

/// Options used to pick and open a device.
#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// Preferred adapter class.
    pub power_preference: wgpu::PowerPreference,
    /// Only accept a software (fallback) adapter.
    pub force_fallback_adapter: bool,
    /// Request host-mappable storage buffers when the adapter offers them.
    pub shared_storage: bool,
    /// Debug label for the device.
    pub label: Option<String>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            shared_storage: true,
            label: None,
        }
    }
}

/// Hardware limits the dispatcher and allocator consult.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Largest group extent per dimension.
    pub max_group_size: [u32; 3],
    /// Largest group volume.
    pub max_group_invocations: u32,
    /// Largest group count per dimension of a single dispatch.
    pub max_groups_per_dimension: u32,
    /// Largest storage buffer binding in bytes.
    pub max_buffer_size: u64,
}

impl DeviceLimits {
    /// Extracts the relevant fields from `wgpu` limits.
    #[must_use]
    pub fn from_wgpu(limits: &wgpu::Limits) -> Self {
        Self {
            max_group_size: [
                limits.max_compute_workgroup_size_x,
                limits.max_compute_workgroup_size_y,
                limits.max_compute_workgroup_size_z,
            ],
            max_group_invocations: limits.max_compute_invocations_per_workgroup,
            max_groups_per_dimension: limits.max_compute_workgroups_per_dimension,
            max_buffer_size: limits
                .max_buffer_size
                .min(u64::from(limits.max_storage_buffer_binding_size)),
        }
    }
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self::from_wgpu(&wgpu::Limits::default())
    }
}

/// Device, queue and kernel cache.
pub struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    limits: DeviceLimits,
    shared_storage: bool,
    adapter_name: String,
    kernels: KernelCache,
}

impl GpuContext {
    /// Selects an adapter and opens a device on it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Adapter`](crate::Error::Adapter) when no adapter matches
    /// the options and [`Error::Device`](crate::Error::Device) when the device
    /// cannot be opened.
    pub fn new(options: &ContextOptions) -> Result<Arc<Self>> {
        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: options.power_preference,
            force_fallback_adapter: options.force_fallback_adapter,
            compatible_surface: None,
        }))?;

        let shared_storage = options.shared_storage
            && adapter
                .features()
                .contains(wgpu::Features::MAPPABLE_PRIMARY_BUFFERS);
        let required_features = if shared_storage {
            wgpu::Features::MAPPABLE_PRIMARY_BUFFERS
        } else {
            wgpu::Features::empty()
        };

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: options.label.as_deref(),
            required_features,
            required_limits: adapter.limits(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))?;

        let info = adapter.get_info();
        log::info!(
            "opened {} ({:?}, {:?}), shared storage: {}",
            info.name,
            info.device_type,
            info.backend,
            shared_storage
        );

        Ok(Arc::new(Self::with_parts(device, queue, shared_storage, info.name)))
    }

    /// Wraps a device opened elsewhere.
    ///
    /// Shared storage is enabled only when the device was opened with
    /// `MAPPABLE_PRIMARY_BUFFERS`.
    #[must_use]
    pub fn from_device(device: wgpu::Device, queue: wgpu::Queue) -> Arc<Self> {
        let shared_storage = device
            .features()
            .contains(wgpu::Features::MAPPABLE_PRIMARY_BUFFERS);
        Arc::new(Self::with_parts(
            device,
            queue,
            shared_storage,
            String::from("external device"),
        ))
    }

    fn with_parts(
        device: wgpu::Device,
        queue: wgpu::Queue,
        shared_storage: bool,
        adapter_name: String,
    ) -> Self {
        let limits = DeviceLimits::from_wgpu(&device.limits());
        Self {
            device,
            queue,
            limits,
            shared_storage,
            adapter_name,
            kernels: KernelCache::default(),
        }
    }

    /// The underlying device.
    #[must_use]
    pub const fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// The queue all streams submit to.
    #[must_use]
    pub const fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Limits consulted by the dispatcher.
    #[must_use]
    pub const fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    /// Whether [`Storage::Shared`](crate::nn::tensors::Storage::Shared) buffers can be
    /// mapped directly.
    #[must_use]
    pub const fn supports_shared_storage(&self) -> bool {
        self.shared_storage
    }

    /// Name reported by the adapter.
    #[must_use]
    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    /// Returns the compiled handle for `kind`, compiling it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KernelCompilation`](crate::Error::KernelCompilation) if
    /// the kernel's module or layout fails validation.
    pub fn kernel(&self, kind: KernelKind) -> Result<Kernel> {
        self.kernels.get_or_compile(&self.device, kind)
    }

    /// Number of kernels compiled on this context so far.
    #[must_use]
    pub fn cached_kernels(&self) -> usize {
        self.kernels.kernel_count()
    }

    /// Number of shader modules compiled so far, one per kernel family and
    /// group size.
    #[must_use]
    pub fn compiled_modules(&self) -> usize {
        self.kernels.module_count()
    }

    /// Opens a command stream; nothing reaches the device until it is committed.
    #[must_use]
    pub fn command_stream(&self, label: &str) -> CommandStream<'_> {
        CommandStream::new(self, label)
    }

    /// Blocks until all submitted work has finished.
    ///
    /// # Errors
    ///
    /// Propagates device poll failures.
    pub fn wait_idle(&self) -> Result<()> {
        self.device.poll(wgpu::PollType::Wait)?;
        Ok(())
    }
}

impl core::fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GpuContext")
            .field("adapter", &self.adapter_name)
            .field("limits", &self.limits)
            .field("shared_storage", &self.shared_storage)
            .finish_non_exhaustive()
    }
}
