#![allow(dead_code)]

use accel_nn::backend::{ContextOptions, GpuContext};
use accel_nn::nn::layers::{Activation, LayerSpec, OutputSpec};
use accel_nn::nn::network::Network;
use accel_nn::nn::tensors::{DeviceTensor, Shape, Storage};
use accel_nn::training::Sample;
use std::sync::{Arc, OnceLock};

/// Shared device for the whole test binary, or `None` when the machine has
/// no usable adapter (hardware or software).
pub fn gpu() -> Option<Arc<GpuContext>> {
    static CONTEXT: OnceLock<Option<Arc<GpuContext>>> = OnceLock::new();
    CONTEXT
        .get_or_init(|| {
            let _ = env_logger::builder().is_test(true).try_init();
            match open() {
                Ok(ctx) => Some(ctx),
                Err(err) => {
                    log::warn!("skipping device tests: {err}");
                    None
                }
            }
        })
        .clone()
}

/// A context of its own, with empty kernel caches, for tests that count
/// what gets compiled.
pub fn fresh_gpu() -> Option<Arc<GpuContext>> {
    gpu()?;
    open().ok()
}

fn open() -> accel_nn::Result<Arc<GpuContext>> {
    GpuContext::new(&ContextOptions::default()).or_else(|err| {
        log::info!("no hardware adapter ({err}), trying the fallback adapter");
        GpuContext::new(&ContextOptions {
            force_fallback_adapter: true,
            ..ContextOptions::default()
        })
    })
}

/// `y = 0.5 x + 1.5`.
pub fn line_samples() -> Vec<Sample> {
    vec![
        Sample::new(vec![2.0], vec![2.5]),
        Sample::new(vec![0.0], vec![1.5]),
        Sample::new(vec![1.0], vec![2.0]),
    ]
}

/// One dense unit with a linear output, starting from `weights` (slope, bias).
pub fn line_network(ctx: &Arc<GpuContext>, weights: [f32; 2]) -> Network {
    Network::new(
        ctx,
        vec![LayerSpec::Dense {
            inputs: 1,
            outputs: 1,
            weights: Some(weights.to_vec()),
        }],
        linear_output(1),
    )
    .unwrap()
}

pub fn linear_output(len: u32) -> OutputSpec {
    OutputSpec::Activation {
        shape: Shape::vector(len),
        activation: Activation::Linear,
    }
}

/// A private tensor holding `values`.
pub fn tensor(ctx: &Arc<GpuContext>, shape: Shape, values: &[f32]) -> DeviceTensor {
    DeviceTensor::from_values(ctx, shape, values, Storage::Private, "test values").unwrap()
}
