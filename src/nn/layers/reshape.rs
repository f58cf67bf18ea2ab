use crate::error::Result;
use crate::nn::tensors::{DeviceTensor, Shape};

/// Changes the shape of its input without touching the values.
///
/// Both directions return views aliasing the incoming tensor.
#[derive(Debug, Clone, Copy)]
pub struct ReshapeLayer {
    input: Shape,
    output: Shape,
}

impl ReshapeLayer {
    pub(super) const fn new(input: Shape, output: Shape) -> Self {
        Self { input, output }
    }

    /// Input extent.
    #[must_use]
    pub const fn input_shape(&self) -> Shape {
        self.input
    }

    /// Output extent.
    #[must_use]
    pub const fn output_shape(&self) -> Shape {
        self.output
    }

    pub(super) fn forward(&self, input: &DeviceTensor) -> Result<DeviceTensor> {
        input.reshaped(self.output)
    }

    pub(super) fn backward(&self, next_gradient: &DeviceTensor) -> Result<DeviceTensor> {
        next_gradient.reshaped(self.input)
    }
}
