//! Networks: a chain of layers ending in one output layer.
//!
//! ```no_run
//! use accel_nn::backend::{ContextOptions, GpuContext};
//! use accel_nn::nn::layers::{Activation, LayerSpec, OutputSpec};
//! use accel_nn::nn::network::Network;
//! use accel_nn::nn::tensors::Shape;
//!
//! let ctx = GpuContext::new(&ContextOptions::default())?;
//! let mut network = Network::new(
//!     &ctx,
//!     vec![
//!         LayerSpec::dense(2, 8),
//!         LayerSpec::Activation { shape: Shape::vector(8), activation: Activation::Tanh },
//!         LayerSpec::dense(8, 1),
//!     ],
//!     OutputSpec::Activation { shape: Shape::vector(1), activation: Activation::Sigmoid },
//! )?;
//! let prediction = network.feed_forward(&[0.0, 1.0])?;
//! # Ok::<(), accel_nn::Error>(())
//! ```

use crate::backend::GpuContext;
use crate::error::{Error, Result};
use crate::nn::layers::{Layer, LayerSpec, OutputLayer, OutputSpec, Parameter};
use crate::nn::optim::{Optimizer, OptimizerState, Regularization};
use crate::nn::tensors::{DeviceTensor, Shape, Storage};
use crate::training::Sample;
use alloc::{sync::Arc, vec::Vec};

/// Layers plus the output layer, with staging tensors for samples.
#[derive(Debug)]
pub struct Network {
    ctx: Arc<GpuContext>,
    layers: Vec<Layer>,
    output: OutputLayer,
    input: DeviceTensor,
    expected: Option<DeviceTensor>,
}

impl Network {
    /// Checks that every layer's output shape equals the next layer's input
    /// shape, and that the last one feeds the output layer.
    ///
    /// Runs on specs alone; nothing is allocated.
    ///
    /// # Errors
    ///
    /// [`Error::LayerChain`] at the first mismatch, or the configuration
    /// error of an inconsistent layer.
    pub fn validate(layers: &[LayerSpec], output: &OutputSpec) -> Result<()> {
        if output.shape().is_empty() {
            return Err(Error::EmptyShape(output.shape()));
        }

        for (index, spec) in layers.iter().enumerate() {
            let produced = spec.output_shape()?;
            let (kind, expected) = match layers.get(index + 1) {
                Some(next) => (next.kind(), next.input_shape()),
                None => ("output", output.shape()),
            };
            if produced != expected {
                return Err(Error::LayerChain {
                    index,
                    kind,
                    output: produced,
                    input: expected,
                });
            }
        }
        Ok(())
    }

    /// Validates and builds a trainable network.
    ///
    /// # Errors
    ///
    /// Validation errors before anything is allocated, then kernel
    /// compilation and allocation failures.
    pub fn new(ctx: &Arc<GpuContext>, layers: Vec<LayerSpec>, output: OutputSpec) -> Result<Self> {
        Self::build(ctx, &layers, &output, true)
    }

    /// Validates and builds a network without gradient tensors.
    ///
    /// Training it fails with [`Error::BackwardUnavailable`].
    ///
    /// # Errors
    ///
    /// As [`new`](Self::new).
    pub fn inference_only(
        ctx: &Arc<GpuContext>,
        layers: Vec<LayerSpec>,
        output: OutputSpec,
    ) -> Result<Self> {
        Self::build(ctx, &layers, &output, false)
    }

    fn build(
        ctx: &Arc<GpuContext>,
        specs: &[LayerSpec],
        output: &OutputSpec,
        trainable: bool,
    ) -> Result<Self> {
        Self::validate(specs, output)?;

        let input_shape = specs.first().map_or_else(|| output.shape(), LayerSpec::input_shape);
        let layers = specs
            .iter()
            .map(|spec| Layer::build(ctx, spec, trainable))
            .collect::<Result<Vec<_>>>()?;
        let output_layer = OutputLayer::build(ctx, output, trainable)?;

        let input = DeviceTensor::allocate(ctx, input_shape, Storage::Private, "network input")?;
        let expected = if trainable {
            Some(DeviceTensor::allocate(ctx, output.shape(), Storage::Private, "network expected")?)
        } else {
            None
        };

        log::info!(
            "built network {input_shape} -> {} with {} layers{}",
            output.shape(),
            layers.len(),
            if trainable { "" } else { " (inference only)" }
        );
        Ok(Self {
            ctx: Arc::clone(ctx),
            layers,
            output: output_layer,
            input,
            expected,
        })
    }

    /// Shape of a sample input.
    #[must_use]
    pub fn input_shape(&self) -> Shape {
        self.input.shape()
    }

    /// Shape of the network output.
    #[must_use]
    pub const fn output_shape(&self) -> Shape {
        self.output.shape()
    }

    /// Hidden layers in order.
    #[must_use]
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// The output layer.
    #[must_use]
    pub const fn output(&self) -> &OutputLayer {
        &self.output
    }

    /// The context the network runs on.
    #[must_use]
    pub const fn context(&self) -> &Arc<GpuContext> {
        &self.ctx
    }

    /// Whether gradient tensors were allocated.
    #[must_use]
    pub const fn is_trainable(&self) -> bool {
        self.expected.is_some()
    }

    /// Every weight/gradient pair, layer by layer, in a stable order.
    #[must_use]
    pub fn parameters(&self) -> Vec<Parameter<'_>> {
        self.layers.iter().flat_map(Layer::parameters).collect()
    }

    /// Runs one input through the network and returns the output values.
    ///
    /// # Errors
    ///
    /// [`Error::ValueCount`] for a wrong input length; dispatch, poll and
    /// map failures.
    pub fn feed_forward(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        self.input.upload(input)?;

        let mut stream = self.ctx.command_stream("feed forward");
        let mut current = self.input.clone();
        for layer in &mut self.layers {
            current = layer.forward(&mut stream, &current)?;
        }
        let output = self.output.forward(&mut stream, &current)?;
        stream.commit_and_wait()?;

        output.download()
    }

    /// Runs forward and backward for one sample, adding its contribution to
    /// every weight gradient, and returns the sample's loss.
    ///
    /// All dispatches of the sample go to one stream, submitted once.
    ///
    /// # Errors
    ///
    /// [`Error::BackwardUnavailable`] for inference-only networks;
    /// [`Error::ValueCount`] for wrongly sized samples; dispatch failures.
    pub fn train_one_sample(&mut self, sample: &Sample) -> Result<f32> {
        let expected = self.expected.as_ref().ok_or(Error::BackwardUnavailable {
            layer: "network",
            reason: "built for inference only",
        })?;
        self.input.upload(&sample.input)?;
        expected.upload(&sample.expected)?;

        let mut stream = self.ctx.command_stream("train sample");
        let mut inputs = Vec::with_capacity(self.layers.len());
        let mut current = self.input.clone();
        for layer in &mut self.layers {
            let next = layer.forward(&mut stream, &current)?;
            inputs.push(current);
            current = next;
        }
        let actual = self.output.forward(&mut stream, &current)?;

        let mut gradient = self.output.loss(&mut stream, expected, &actual)?;
        for (layer, input) in self.layers.iter_mut().zip(&inputs).rev() {
            gradient = layer.backward(&mut stream, &gradient, input)?;
        }
        stream.commit_and_wait()?;

        let actual = actual.download()?;
        Ok(self.output.loss_value(&sample.expected, &actual))
    }

    /// Trains on `samples` as one batch and returns their mean loss.
    ///
    /// Gradients of every sample are accumulated, optionally regularized,
    /// then consumed by one optimizer update. If a sample fails, the
    /// gradients accumulated so far are discarded and the weights are left
    /// as they were.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] for an empty batch, plus every error of
    /// [`train_one_sample`](Self::train_one_sample) and
    /// [`Optimizer::update`].
    pub fn train_batch(
        &mut self,
        samples: &[Sample],
        optimizer: &Optimizer,
        state: &mut OptimizerState,
        regularization: Option<&Regularization>,
    ) -> Result<f32> {
        if samples.is_empty() {
            return Err(Error::InvalidConfig("cannot train on an empty batch".into()));
        }
        optimizer.validate()?;
        if let Some(regularization) = regularization {
            regularization.validate()?;
        }

        let mut total = 0.0;
        for sample in samples {
            match self.train_one_sample(sample) {
                Ok(loss) => total += loss,
                Err(err) => {
                    self.clear_gradients()?;
                    return Err(err);
                }
            }
        }

        let parameters = self.parameters();
        let mut stream = self.ctx.command_stream("optimizer");
        if let Some(regularization) = regularization {
            regularization.apply(&mut stream, &parameters, samples.len())?;
        }
        optimizer.update(&mut stream, &parameters, samples.len(), state)?;
        stream.commit_and_wait()?;

        #[allow(clippy::cast_precision_loss)]
        let mean = total / samples.len() as f32;
        Ok(mean)
    }

    /// Zeroes every weight gradient.
    ///
    /// # Errors
    ///
    /// Poll failures.
    pub fn clear_gradients(&self) -> Result<()> {
        let mut stream = self.ctx.command_stream("clear gradients");
        for parameter in self.parameters() {
            stream.clear(parameter.gradient);
        }
        stream.commit_and_wait()
    }
}
