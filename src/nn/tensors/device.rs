use super::{Descriptor, Shape, Storage};
use crate::backend::GpuContext;
use crate::error::{Error, Result};
use alloc::{format, string::ToString, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};
use wgpu::util::DeviceExt;

static NEXT_STORAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a value buffer, shared by every reshaped view of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageId(u64);

struct Values {
    id: StorageId,
    buffer: wgpu::Buffer,
}

/// A tensor resident on the accelerator.
///
/// The value buffer is reference counted: views created by
/// [`reshaped`](Self::reshaped) share it and keep it alive, so a view can
/// never outlive its storage. Each view owns its own descriptor buffer.
///
/// Cloning yields another handle to the same storage and descriptor.
#[derive(Clone)]
pub struct DeviceTensor {
    ctx: Arc<GpuContext>,
    values: Arc<Values>,
    descriptor: Arc<wgpu::Buffer>,
    shape: Shape,
    storage: Storage,
}

impl DeviceTensor {
    /// Allocates a zero-filled tensor.
    ///
    /// `Shared` storage degrades to `Private` on devices without mappable
    /// storage buffers.
    ///
    /// # Errors
    ///
    /// [`Error::EmptyShape`] for a zero-sized dimension and
    /// [`Error::Allocation`] when the buffer exceeds device limits or the
    /// device runs out of memory.
    pub fn allocate(
        ctx: &Arc<GpuContext>,
        shape: Shape,
        storage: Storage,
        label: &str,
    ) -> Result<Self> {
        if shape.is_empty() {
            return Err(Error::EmptyShape(shape));
        }

        let bytes = shape.byte_len();
        let limit = ctx.limits().max_buffer_size;
        if bytes > limit {
            return Err(Error::Allocation {
                label: label.to_string(),
                bytes,
                message: format!("exceeds the device limit of {limit} bytes"),
            });
        }

        let storage = if storage == Storage::Shared && !ctx.supports_shared_storage() {
            log::debug!("`{label}`: shared storage unavailable, using private storage");
            Storage::Private
        } else {
            storage
        };

        let mut usage = wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_SRC
            | wgpu::BufferUsages::COPY_DST;
        if storage == Storage::Shared {
            usage |= wgpu::BufferUsages::MAP_READ;
        }

        let device = ctx.device();
        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: bytes,
            usage,
            mapped_at_creation: false,
        });
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(Error::Allocation {
                label: label.to_string(),
                bytes,
                message: err.to_string(),
            });
        }

        let values = Arc::new(Values {
            id: StorageId(NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed)),
            buffer,
        });
        Ok(Self {
            descriptor: Arc::new(create_descriptor(device, shape, label)),
            ctx: Arc::clone(ctx),
            values,
            shape,
            storage,
        })
    }

    /// Allocates a tensor and uploads `values` into it.
    ///
    /// # Errors
    ///
    /// As [`allocate`](Self::allocate), plus [`Error::ValueCount`] when
    /// `values` does not match the shape.
    pub fn from_values(
        ctx: &Arc<GpuContext>,
        shape: Shape,
        values: &[f32],
        storage: Storage,
        label: &str,
    ) -> Result<Self> {
        check_count(shape, values)?;
        let tensor = Self::allocate(ctx, shape, storage, label)?;
        tensor.upload(values)?;
        Ok(tensor)
    }

    /// Overwrites every value from the host.
    ///
    /// The write is staged on the queue and lands before the next submitted
    /// command stream runs.
    ///
    /// # Errors
    ///
    /// [`Error::ValueCount`] when `values` does not match the shape.
    pub fn upload(&self, values: &[f32]) -> Result<()> {
        check_count(self.shape, values)?;
        self.ctx
            .queue()
            .write_buffer(&self.values.buffer, 0, bytemuck::cast_slice(values));
        Ok(())
    }

    /// Copies every value to the host, blocking until the device is done.
    ///
    /// Private storage is first blitted into a staging buffer; shared storage
    /// is mapped in place.
    ///
    /// # Errors
    ///
    /// Propagates poll and map failures.
    pub fn download(&self) -> Result<Vec<f32>> {
        let device = self.ctx.device();
        match self.storage {
            Storage::Shared => {
                self.ctx.queue().submit(None);
                read_mapped(device, &self.values.buffer)
            }
            Storage::Private => {
                let bytes = self.shape.byte_len();
                let staging = device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("download staging"),
                    size: bytes,
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                let mut encoder =
                    device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                        label: Some("download"),
                    });
                encoder.copy_buffer_to_buffer(&self.values.buffer, 0, &staging, 0, bytes);
                self.ctx.queue().submit(Some(encoder.finish()));
                read_mapped(device, &staging)
            }
        }
    }

    /// A view of the same values under `shape`, in O(1).
    ///
    /// The view aliases this tensor's storage: writes through either are
    /// visible through both. A fresh descriptor buffer is created for it.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] when the element counts differ.
    pub fn reshaped(&self, shape: Shape) -> Result<Self> {
        if !self.shape.can_reshape_to(&shape) {
            return Err(Error::ShapeMismatch {
                expected: self.shape,
                found: shape,
            });
        }
        Ok(Self {
            ctx: Arc::clone(&self.ctx),
            values: Arc::clone(&self.values),
            descriptor: Arc::new(create_descriptor(self.ctx.device(), shape, "reshaped")),
            shape,
            storage: self.storage,
        })
    }

    /// Shape of this view.
    #[must_use]
    pub const fn shape(&self) -> Shape {
        self.shape
    }

    /// Number of elements.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.shape.len()
    }

    /// Always false: empty tensors cannot be allocated.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.shape.is_empty()
    }

    /// Storage mode actually in use.
    #[must_use]
    pub const fn storage(&self) -> Storage {
        self.storage
    }

    /// Identity of the underlying value buffer.
    #[must_use]
    pub fn storage_id(&self) -> StorageId {
        self.values.id
    }

    /// Whether both tensors view the same value buffer.
    #[must_use]
    pub fn aliases(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.values, &other.values)
    }

    /// The context this tensor lives on.
    #[must_use]
    pub const fn context(&self) -> &Arc<GpuContext> {
        &self.ctx
    }

    /// Buffer holding the values, for binding to a kernel.
    #[must_use]
    pub fn values(&self) -> &wgpu::Buffer {
        &self.values.buffer
    }

    /// Uniform buffer holding this view's shape descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &wgpu::Buffer {
        &self.descriptor
    }
}

impl core::fmt::Debug for DeviceTensor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeviceTensor")
            .field("shape", &self.shape)
            .field("storage", &self.storage)
            .field("id", &self.values.id)
            .finish_non_exhaustive()
    }
}

fn check_count(shape: Shape, values: &[f32]) -> Result<()> {
    if values.len() == shape.len() {
        Ok(())
    } else {
        Err(Error::ValueCount {
            shape,
            expected: shape.len(),
            found: values.len(),
        })
    }
}

fn create_descriptor(device: &wgpu::Device, shape: Shape, label: &str) -> wgpu::Buffer {
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(&format!("{label} descriptor")),
        contents: bytemuck::bytes_of(&Descriptor::from(shape)),
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
    })
}

/// Maps `buffer` for reading, waits, and copies it out.
fn read_mapped(device: &wgpu::Device, buffer: &wgpu::Buffer) -> Result<Vec<f32>> {
    let slice = buffer.slice(..);
    let (sender, receiver) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = sender.send(result);
    });
    device.poll(wgpu::PollType::Wait)?;
    receiver.recv().map_err(|_| Error::MapAbandoned)??;

    let values = {
        let view = slice.get_mapped_range();
        bytemuck::cast_slice::<u8, f32>(&view).to_vec()
    };
    buffer.unmap();
    Ok(values)
}
