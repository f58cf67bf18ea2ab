//! Weight snapshots.
//!
//! A snapshot is the host-side copy of every weight tensor of a network,
//! grouped by layer, in the same order the optimizer pairs them with their
//! gradients. Encoding snapshots to a file is left to the caller; with the
//! `serde` feature the types derive `Serialize` and `Deserialize`.
//!
//! # Layout
//!
//! ```text
//! ┌─────────────────────────┬──────────────────────────────────────┐
//! │ LayerWeights            │ WeightSnapshot ..                    │
//! ├─────────────────────────┼──────────────────────────────────────┤
//! │ layer: index in network │ shape: width × height × depth        │
//! │ kind: "dense", ..       │ values: slice-major, then row-major  │
//! └─────────────────────────┴──────────────────────────────────────┘
//! ```
//!
//! Dense layers hold one tensor (the weight matrix, bias in the last column);
//! convolution layers hold two (kernels, then bias). Layers without weights
//! do not appear.

use crate::error::{Error, Result};
use crate::nn::network::Network;
use crate::nn::tensors::Shape;
use alloc::{format, string::String, vec::Vec};

/// Host copy of one weight tensor.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WeightSnapshot {
    /// Extent of the tensor.
    pub shape: Shape,
    /// Every value, in storage order.
    pub values: Vec<f32>,
}

/// Host copies of the weights of one layer.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LayerWeights {
    /// Index of the layer in the network.
    pub layer: usize,
    /// Layer kind, for diagnostics.
    pub kind: String,
    /// Weight tensors in enumeration order.
    pub tensors: Vec<WeightSnapshot>,
}

impl Network {
    /// Copies every weight tensor back to the host.
    ///
    /// # Errors
    ///
    /// Poll and map failures of the downloads.
    pub fn snapshot_weights(&self) -> Result<Vec<LayerWeights>> {
        let mut snapshots = Vec::new();
        for (layer, l) in self.layers().iter().enumerate() {
            let weights = l.weights();
            if weights.is_empty() {
                continue;
            }
            let tensors = weights
                .into_iter()
                .map(|tensor| {
                    Ok(WeightSnapshot {
                        shape: tensor.shape(),
                        values: tensor.download()?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            snapshots.push(LayerWeights {
                layer,
                kind: l.kind().into(),
                tensors,
            });
        }
        log::debug!("snapshot of {} weighted layers", snapshots.len());
        Ok(snapshots)
    }

    /// Overwrites weights from host snapshots.
    ///
    /// Every snapshot is checked before any value is written, so a rejected
    /// call leaves the network untouched.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] for an unknown layer index or a tensor count
    /// that does not match; [`Error::ShapeMismatch`] and
    /// [`Error::ValueCount`] for mismatched tensors.
    pub fn restore_weights(&mut self, snapshots: &[LayerWeights]) -> Result<()> {
        for snapshot in snapshots {
            let layer = self.layers().get(snapshot.layer).ok_or_else(|| {
                Error::InvalidConfig(format!("no layer at index {}", snapshot.layer))
            })?;
            let weights = layer.weights();
            if weights.len() != snapshot.tensors.len() {
                return Err(Error::InvalidConfig(format!(
                    "{} layer {} holds {} weight tensors, snapshot has {}",
                    layer.kind(),
                    snapshot.layer,
                    weights.len(),
                    snapshot.tensors.len()
                )));
            }
            for (tensor, saved) in weights.iter().zip(&snapshot.tensors) {
                if tensor.shape() != saved.shape {
                    return Err(Error::ShapeMismatch {
                        expected: tensor.shape(),
                        found: saved.shape,
                    });
                }
                if saved.values.len() != saved.shape.len() {
                    return Err(Error::ValueCount {
                        shape: saved.shape,
                        expected: saved.shape.len(),
                        found: saved.values.len(),
                    });
                }
            }
        }

        for snapshot in snapshots {
            if let Some(layer) = self.layers().get(snapshot.layer) {
                for (tensor, saved) in layer.weights().into_iter().zip(&snapshot.tensors) {
                    tensor.upload(&saved.values)?;
                }
            }
        }
        Ok(())
    }
}
