//! accel_nn: accelerator-resident tensors, layers and optimizers for training
//! small feed-forward networks.
//!
//! Every tensor lives on the device, every layer is a handful of compute
//! kernels, and the host only uploads samples, submits command streams and
//! reads results back.
//!
//! # Features
//!
//! - Device tensors with O(1) aliasing reshapes and host upload/download.
//! - A work-size dispatcher that fits any 3D extent into the device's
//!   execution-group limits.
//! - Dense, convolution, max-pooling, activation and reshape layers with full
//!   backward passes, plus softmax and activation output layers.
//! - SGD, momentum, AdaGrad, RMSProp and AdaDelta optimizers with L1/L2
//!   regularization.
//! - A background training session with progress callbacks and cooperative
//!   cancellation.
//!
//! # Modules
//!
//! - [`backend`]: device selection and the shared [`GpuContext`](backend::GpuContext).
//! - [`nn`]: tensors, kernels, layers, networks, optimizers and weight snapshots.
//! - [`training`]: samples, providers and the training session.
//! - [`approx`]: tolerant float comparison.
//!
//! # Example
//!
//! ```no_run
//! use accel_nn::backend::{ContextOptions, GpuContext};
//! use accel_nn::nn::layers::{Activation, LayerSpec, OutputSpec};
//! use accel_nn::nn::network::Network;
//! use accel_nn::nn::optim::{Optimizer, OptimizerState};
//! use accel_nn::nn::tensors::Shape;
//! use accel_nn::training::Sample;
//!
//! let ctx = GpuContext::new(&ContextOptions::default())?;
//! let mut network = Network::new(
//!     &ctx,
//!     vec![LayerSpec::dense(1, 1)],
//!     OutputSpec::Activation { shape: Shape::vector(1), activation: Activation::Linear },
//! )?;
//!
//! let samples = [Sample::new(vec![1.0], vec![3.0]), Sample::new(vec![2.0], vec![5.0])];
//! let optimizer = Optimizer::Sgd { learning_rate: 0.05 };
//! let mut state = OptimizerState::new();
//! for _ in 0..200 {
//!     network.train_batch(&samples, &optimizer, &mut state, None)?;
//! }
//! println!("{:?}", network.feed_forward(&[3.0])?);
//! # Ok::<(), accel_nn::Error>(())
//! ```

#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_panics_doc,
    clippy::cast_possible_truncation
)]

extern crate alloc;

pub mod approx;
pub mod backend;
pub mod error;
pub mod nn;
pub mod training;

pub use error::{Error, Result};
