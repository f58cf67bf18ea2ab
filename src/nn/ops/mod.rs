//! # Kernel dispatch
//!
//! - [`kernels`]: the WGSL kernel library, compiled once per device and
//!   specialized per execution-group size.
//! - [`dispatch`]: work-size planning and the command stream that records
//!   dispatches and submits them as a unit.
//!
//! ## Adding a kernel
//!
//! 1. Write the entry point in the family's `.wgsl` file, guarding every
//!    invocation with a bounds check against the shape it covers.
//! 2. Add a [`KernelKind`](kernels::KernelKind) variant with its name, family
//!    and binding slots.
//! 3. Dispatch it from a layer or optimizer with buffers in slot order.

pub mod dispatch;
pub mod kernels;
