//! Error taxonomy for the accelerator engine.
//!
//! Every fallible operation in this crate returns [`Result`]. Configuration
//! errors (bad shapes, bad hyperparameters) are raised at construction or call
//! time, resource errors (adapter, kernel compilation, allocation) are raised
//! where the resource is requested, and nothing is retried.

use crate::nn::tensors::Shape;

/// Errors produced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Two shapes that must agree (or hold the same element count) do not.
    #[error("shape mismatch: expected {expected}, found {found}")]
    ShapeMismatch {
        /// The shape that was required.
        expected: Shape,
        /// The shape that was supplied.
        found: Shape,
    },

    /// Adjacent layers of a network disagree on the shape passed between them.
    #[error("layer {index} produces {output} but the next stage ({kind}) expects {input}")]
    LayerChain {
        /// Position of the producing layer.
        index: usize,
        /// Kind of the consuming stage, or `"output"`.
        kind: &'static str,
        /// Shape the producing layer outputs.
        output: Shape,
        /// Shape the consuming stage accepts.
        input: Shape,
    },

    /// A host slice does not hold exactly one value per tensor element.
    #[error("{shape} holds {expected} values, got {found}")]
    ValueCount {
        /// Target shape.
        shape: Shape,
        /// Element count of the shape.
        expected: usize,
        /// Length of the supplied slice.
        found: usize,
    },

    /// A tensor with a zero-sized dimension was requested.
    #[error("cannot allocate a tensor with empty shape {0}")]
    EmptyShape(Shape),

    /// A hyperparameter or layer parameter is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No adapter matched the requested options.
    #[error("no suitable adapter: {0}")]
    Adapter(#[from] wgpu::RequestAdapterError),

    /// The adapter refused to open a device.
    #[error("failed to open device: {0}")]
    Device(#[from] wgpu::RequestDeviceError),

    /// A kernel failed to compile or link into a pipeline.
    #[error("failed to build kernel `{kernel}`: {message}")]
    KernelCompilation {
        /// Entry point of the kernel.
        kernel: &'static str,
        /// Validation message reported by the device.
        message: String,
    },

    /// A device buffer could not be created.
    #[error("failed to allocate `{label}` ({bytes} bytes): {message}")]
    Allocation {
        /// Debug label of the buffer.
        label: String,
        /// Requested size.
        bytes: u64,
        /// Reason reported by the device or limit check.
        message: String,
    },

    /// A kernel was bound with the wrong number of buffers.
    #[error("kernel `{kernel}` takes {expected} bindings, got {found}")]
    Binding {
        /// Entry point of the kernel.
        kernel: &'static str,
        /// Bindings declared by the kernel.
        expected: usize,
        /// Buffers supplied.
        found: usize,
    },

    /// The planned execution-group count exceeds what the device accepts.
    #[error(
        "kernel `{kernel}` needs {groups:?} execution groups, device allows {limit} per dimension"
    )]
    DispatchTooLarge {
        /// Entry point of the kernel.
        kernel: &'static str,
        /// Planned group counts.
        groups: [u32; 3],
        /// Per-dimension maximum.
        limit: u32,
    },

    /// The work-size planner could not shrink a group below the device bound.
    #[error("work size invariant violated: group {group:?} cannot fit {limit} invocations")]
    WorkSizeInvariant {
        /// Group size reached when shrinking stopped.
        group: [u32; 3],
        /// Reported maximum invocations per group.
        limit: u32,
    },

    /// A layer was asked for gradients it was not built to produce.
    #[error("backward pass unavailable for {layer}: {reason}")]
    BackwardUnavailable {
        /// Name of the layer kind.
        layer: &'static str,
        /// What is missing.
        reason: &'static str,
    },

    /// Waiting on submitted work failed.
    #[error("device poll failed: {0}")]
    Poll(#[from] wgpu::PollError),

    /// Mapping a buffer for host access failed.
    #[error("buffer map failed: {0}")]
    Map(#[from] wgpu::BufferAsyncError),

    /// The mapping callback was dropped without reporting.
    #[error("buffer map was abandoned by the device")]
    MapAbandoned,

    /// The training worker panicked; the network it owned is lost.
    #[error("training worker panicked")]
    WorkerPanicked,
}

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;
