//! Training sessions.
//!
//! A [`TrainingSession`] runs the epoch loop on a worker thread: each epoch
//! pulls one batch from a [`SampleProvider`], trains every sample of it,
//! applies regularization and one optimizer update, then reports the batch
//! loss.

mod samples;
mod session;

pub use samples::{InMemorySamples, Sample, SampleProvider};
pub use session::{SessionConfig, StopSignal, TrainingSession};
