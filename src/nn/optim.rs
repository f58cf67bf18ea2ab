//! Optimizers.
//!
//! An optimizer consumes the weight/gradient pairs of a network once per
//! batch. For every pair it issues one dispatch that divides the accumulated
//! gradient by the batch size, derives a delta from it, applies the delta in
//! place and zeroes the gradient so the next batch starts clean.
//!
//! Accumulators (velocity, squared-gradient averages) live in an
//! [`OptimizerState`], keyed by the identity of the weight buffer and
//! allocated the first time a weight tensor is seen.

use crate::error::{Error, Result};
use crate::nn::layers::Parameter;
use crate::nn::ops::dispatch::CommandStream;
use crate::nn::ops::kernels::KernelKind;
use crate::nn::tensors::{DeviceTensor, Storage, StorageId};
use alloc::{format, vec::Vec};
use bytemuck::{Pod, Zeroable};
use std::collections::HashMap;
use wgpu::util::DeviceExt;

/// Weight update rule and its hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Optimizer {
    /// `w -= lr * g`.
    Sgd {
        /// Step size.
        learning_rate: f32,
    },
    /// `v = momentum * v + lr * g; w -= v`.
    Momentum {
        /// Step size.
        learning_rate: f32,
        /// Fraction of the previous velocity kept, in `[0, 1)`.
        momentum: f32,
    },
    /// `s += g²; w -= lr * g / sqrt(s + ε)`.
    AdaGrad {
        /// Step size.
        learning_rate: f32,
        /// Added under the root.
        epsilon: f32,
    },
    /// `s = ρ s + (1 - ρ) g²; w -= lr * g / sqrt(s + ε)`.
    RmsProp {
        /// Step size.
        learning_rate: f32,
        /// Decay rate `ρ`, in `[0, 1)`.
        decay: f32,
        /// Added under the root.
        epsilon: f32,
    },
    /// Scales each step by the ratio of decayed update and gradient
    /// magnitudes; no learning rate.
    AdaDelta {
        /// Decay rate `ρ` of both averages, in `[0, 1)`.
        decay: f32,
        /// Added under both roots.
        epsilon: f32,
    },
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::Sgd {
            learning_rate: 0.01,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Params {
    learning_rate: f32,
    decay: f32,
    epsilon: f32,
    batch_size: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct RegularizationParams {
    l1: f32,
    l2: f32,
    padding: [f32; 2],
}

impl Optimizer {
    /// Rejects non-positive or non-finite step sizes and decays outside `[0, 1)`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] naming the offending hyperparameter.
    pub fn validate(&self) -> Result<()> {
        match *self {
            Self::Sgd { learning_rate } => positive("learning rate", learning_rate),
            Self::Momentum {
                learning_rate,
                momentum,
            } => {
                positive("learning rate", learning_rate)?;
                unit_interval("momentum", momentum)
            }
            Self::AdaGrad {
                learning_rate,
                epsilon,
            } => {
                positive("learning rate", learning_rate)?;
                positive("epsilon", epsilon)
            }
            Self::RmsProp {
                learning_rate,
                decay,
                epsilon,
            } => {
                positive("learning rate", learning_rate)?;
                unit_interval("decay", decay)?;
                positive("epsilon", epsilon)
            }
            Self::AdaDelta { decay, epsilon } => {
                unit_interval("decay", decay)?;
                positive("epsilon", epsilon)
            }
        }
    }

    /// Kernel implementing this rule.
    #[must_use]
    pub const fn kernel(&self) -> KernelKind {
        match self {
            Self::Sgd { .. } => KernelKind::SgdUpdate,
            Self::Momentum { .. } => KernelKind::MomentumUpdate,
            Self::AdaGrad { .. } => KernelKind::AdaGradUpdate,
            Self::RmsProp { .. } => KernelKind::RmsPropUpdate,
            Self::AdaDelta { .. } => KernelKind::AdaDeltaUpdate,
        }
    }

    /// Accumulator tensors kept per weight tensor.
    #[must_use]
    pub const fn accumulators(&self) -> usize {
        match self {
            Self::Sgd { .. } => 0,
            Self::Momentum { .. } | Self::AdaGrad { .. } | Self::RmsProp { .. } => 1,
            Self::AdaDelta { .. } => 2,
        }
    }

    fn params(&self, batch_size: usize) -> Params {
        let (learning_rate, decay, epsilon) = match *self {
            Self::Sgd { learning_rate } => (learning_rate, 0.0, 0.0),
            Self::Momentum {
                learning_rate,
                momentum,
            } => (learning_rate, momentum, 0.0),
            Self::AdaGrad {
                learning_rate,
                epsilon,
            } => (learning_rate, 0.0, epsilon),
            Self::RmsProp {
                learning_rate,
                decay,
                epsilon,
            } => (learning_rate, decay, epsilon),
            Self::AdaDelta { decay, epsilon } => (0.0, decay, epsilon),
        };
        #[allow(clippy::cast_precision_loss)]
        let batch_size = batch_size as f32;
        Params {
            learning_rate,
            decay,
            epsilon,
            batch_size,
        }
    }

    /// Records one update of every pair in `parameters`.
    ///
    /// `batch_size` is the number of samples whose gradients were
    /// accumulated. Gradients are zero once the stream has run.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] for bad hyperparameters or a zero batch size;
    /// [`Error::ShapeMismatch`] when a pair's shapes differ; allocation and
    /// dispatch failures.
    pub fn update(
        &self,
        stream: &mut CommandStream<'_>,
        parameters: &[Parameter<'_>],
        batch_size: usize,
        state: &mut OptimizerState,
    ) -> Result<()> {
        self.validate()?;
        if batch_size == 0 {
            return Err(Error::InvalidConfig("batch size must be positive".into()));
        }

        let ctx = stream.context();
        let kernel = ctx.kernel(self.kernel())?;
        let params = ctx
            .device()
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("optimizer params"),
                contents: bytemuck::bytes_of(&self.params(batch_size)),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        for parameter in parameters {
            let Parameter { weights, gradient } = *parameter;
            if weights.shape() != gradient.shape() {
                return Err(Error::ShapeMismatch {
                    expected: weights.shape(),
                    found: gradient.shape(),
                });
            }

            let accumulators = state.accumulators(weights, self.accumulators())?;
            let mut buffers = Vec::with_capacity(6);
            buffers.push(weights.descriptor());
            buffers.push(weights.values());
            buffers.push(gradient.values());
            buffers.extend(accumulators.iter().map(DeviceTensor::values));
            buffers.push(&params);

            stream.dispatch(&kernel, &buffers, weights.shape().extent())?;
        }
        Ok(())
    }
}

/// Accumulators of one optimizer, per weight tensor.
///
/// Discarding the state resets every accumulator.
#[derive(Debug, Default)]
pub struct OptimizerState {
    accumulators: HashMap<StorageId, Vec<DeviceTensor>>,
}

impl OptimizerState {
    /// Empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of weight tensors with allocated accumulators.
    #[must_use]
    pub fn len(&self) -> usize {
        self.accumulators.len()
    }

    /// Whether no accumulators have been allocated yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.accumulators.is_empty()
    }

    /// Accumulators of `weights`, if any were allocated.
    #[must_use]
    pub fn get(&self, weights: &DeviceTensor) -> Option<&[DeviceTensor]> {
        self.accumulators.get(&weights.storage_id()).map(Vec::as_slice)
    }

    fn accumulators(&mut self, weights: &DeviceTensor, count: usize) -> Result<&[DeviceTensor]> {
        if count == 0 {
            return Ok(&[]);
        }
        if !self.accumulators.contains_key(&weights.storage_id()) {
            let tensors = (0..count)
                .map(|i| {
                    DeviceTensor::allocate(
                        weights.context(),
                        weights.shape(),
                        Storage::Private,
                        &format!("optimizer accumulator {i}"),
                    )
                })
                .collect::<Result<Vec<_>>>()?;
            log::debug!("allocated {count} accumulators for {}", weights.shape());
            self.accumulators.insert(weights.storage_id(), tensors);
        }
        Ok(self
            .accumulators
            .get(&weights.storage_id())
            .map_or(&[], Vec::as_slice))
    }
}

/// Penalty terms added to accumulated gradients before an update.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Regularization {
    /// Weight of `sign(w)`.
    pub l1: f32,
    /// Weight of `w`.
    pub l2: f32,
}

impl Regularization {
    /// Checks that both terms are finite and non-negative.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] naming the offending terms.
    pub fn validate(&self) -> Result<()> {
        if !(self.l1.is_finite() && self.l2.is_finite()) || self.l1 < 0.0 || self.l2 < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "regularization terms must be non-negative, got l1 = {}, l2 = {}",
                self.l1, self.l2
            )));
        }
        Ok(())
    }

    /// Records `gradient += batch_size * (l1 * sign(w) + l2 * w)` for every
    /// pair.
    ///
    /// Gradients hold the sum over `batch_size` samples and the update
    /// divides by it, so the terms act once per update at their nominal
    /// strength.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] for negative or non-finite terms or a zero
    /// batch size; dispatch failures.
    pub fn apply(
        &self,
        stream: &mut CommandStream<'_>,
        parameters: &[Parameter<'_>],
        batch_size: usize,
    ) -> Result<()> {
        self.validate()?;
        if batch_size == 0 {
            return Err(Error::InvalidConfig("batch size must be positive".into()));
        }
        if self.l1 == 0.0 && self.l2 == 0.0 {
            return Ok(());
        }

        #[allow(clippy::cast_precision_loss)]
        let scale = batch_size as f32;

        let ctx = stream.context();
        let kernel = ctx.kernel(KernelKind::Regularize)?;
        let terms = ctx
            .device()
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("regularization"),
                contents: bytemuck::bytes_of(&RegularizationParams {
                    l1: self.l1 * scale,
                    l2: self.l2 * scale,
                    padding: [0.0; 2],
                }),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        for &Parameter { weights, gradient } in parameters {
            stream.dispatch(
                &kernel,
                &[
                    weights.descriptor(),
                    weights.values(),
                    gradient.values(),
                    &terms,
                ],
                weights.shape().extent(),
            )?;
        }
        Ok(())
    }
}

fn positive(name: &str, value: f32) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(Error::InvalidConfig(format!("{name} must be positive, got {value}")))
    }
}

fn unit_interval(name: &str, value: f32) -> Result<()> {
    if (0.0..1.0).contains(&value) {
        Ok(())
    } else {
        Err(Error::InvalidConfig(format!("{name} must lie in [0, 1), got {value}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hyperparameters_are_validated() {
        assert!(Optimizer::default().validate().is_ok());
        assert!(Optimizer::Sgd { learning_rate: 0.0 }.validate().is_err());
        assert!(Optimizer::Sgd {
            learning_rate: f32::NAN
        }
        .validate()
        .is_err());
        assert!(Optimizer::Momentum {
            learning_rate: 0.1,
            momentum: 1.0
        }
        .validate()
        .is_err());
        assert!(Optimizer::AdaGrad {
            learning_rate: 0.1,
            epsilon: 0.0
        }
        .validate()
        .is_err());
        assert!(Optimizer::RmsProp {
            learning_rate: 0.1,
            decay: 0.9,
            epsilon: 1e-8
        }
        .validate()
        .is_ok());
        assert!(Optimizer::AdaDelta {
            decay: -0.1,
            epsilon: 1e-6
        }
        .validate()
        .is_err());
    }

    #[test]
    fn accumulator_counts_match_kernels() {
        let cases = [
            (Optimizer::Sgd { learning_rate: 0.1 }, 0),
            (
                Optimizer::Momentum {
                    learning_rate: 0.1,
                    momentum: 0.9,
                },
                1,
            ),
            (
                Optimizer::AdaGrad {
                    learning_rate: 0.1,
                    epsilon: 1e-8,
                },
                1,
            ),
            (
                Optimizer::RmsProp {
                    learning_rate: 0.1,
                    decay: 0.9,
                    epsilon: 1e-8,
                },
                1,
            ),
            (
                Optimizer::AdaDelta {
                    decay: 0.95,
                    epsilon: 1e-6,
                },
                2,
            ),
        ];
        for (optimizer, count) in cases {
            // shape, weights, gradient, accumulators..., params
            assert_eq!(optimizer.kernel().slots().len(), 4 + count, "{optimizer:?}");
            assert_eq!(optimizer.accumulators(), count);
        }
    }

    #[test]
    fn batch_size_is_carried_in_params() {
        let params = Optimizer::RmsProp {
            learning_rate: 0.5,
            decay: 0.9,
            epsilon: 1e-8,
        }
        .params(4);
        assert!((params.learning_rate - 0.5).abs() < f32::EPSILON);
        assert!((params.decay - 0.9).abs() < f32::EPSILON);
        assert!((params.batch_size - 4.0).abs() < f32::EPSILON);
    }

    #[test]
    fn regularization_terms_are_validated() {
        assert!(Regularization::default().validate().is_ok());
        assert!(Regularization { l1: 0.1, l2: 0.01 }.validate().is_ok());
        assert!(Regularization { l1: -0.1, l2: 0.0 }.validate().is_err());
        assert!(Regularization { l1: 0.0, l2: f32::INFINITY }.validate().is_err());
    }
}
