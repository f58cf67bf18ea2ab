//! Shapes and accelerator-resident tensors.
//!
//! Values are laid out slice-major, then row-major: element `(x, y, z)` of a
//! `width × height × depth` tensor lives at `(z * height + y) * width + x`.
//! Kernels read the shape from a small descriptor buffer at run time, so one
//! compiled kernel serves tensors of any size.

use core::fmt;

mod device;
pub use device::{DeviceTensor, StorageId};

/// Extent of a tensor in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Shape {
    /// Columns.
    pub width: u32,
    /// Rows.
    pub height: u32,
    /// Slices.
    pub depth: u32,
}

impl Shape {
    /// Creates a 3D shape.
    #[must_use]
    pub const fn new(width: u32, height: u32, depth: u32) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    /// A `width × height` matrix with a single slice.
    #[must_use]
    pub const fn matrix(width: u32, height: u32) -> Self {
        Self::new(width, height, 1)
    }

    /// A row of `len` values, the layout used by dense layers.
    #[must_use]
    pub const fn vector(len: u32) -> Self {
        Self::new(len, 1, 1)
    }

    /// Number of elements.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.width as usize * self.height as usize * self.depth as usize
    }

    /// Whether any dimension is zero.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.depth == 0
    }

    /// The shape as a dispatch extent.
    #[must_use]
    pub const fn extent(&self) -> [u32; 3] {
        [self.width, self.height, self.depth]
    }

    /// Linear offset of `(x, y, z)`.
    #[must_use]
    pub const fn index(&self, x: u32, y: u32, z: u32) -> usize {
        (z as usize * self.height as usize + y as usize) * self.width as usize + x as usize
    }

    /// Size of the value buffer backing a tensor of this shape.
    #[must_use]
    pub const fn byte_len(&self) -> u64 {
        (self.len() * size_of::<f32>()) as u64
    }

    /// Whether a tensor of this shape may be viewed as `other` without copying.
    #[must_use]
    pub const fn can_reshape_to(&self, other: &Self) -> bool {
        self.len() == other.len()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.depth)
    }
}

/// Where tensor values live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Storage {
    /// Host-visible: downloads map the buffer directly.
    Shared,
    /// Device-only: downloads blit into a staging buffer first.
    #[default]
    Private,
}

/// Shape descriptor as kernels see it.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub(crate) struct Descriptor {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub count: u32,
}

impl From<Shape> for Descriptor {
    #[allow(clippy::cast_possible_truncation)]
    fn from(shape: Shape) -> Self {
        Self {
            width: shape.width,
            height: shape.height,
            depth: shape.depth,
            count: shape.len() as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_is_slice_then_row_major() {
        let shape = Shape::new(4, 3, 2);
        assert_eq!(shape.index(0, 0, 0), 0);
        assert_eq!(shape.index(3, 0, 0), 3);
        assert_eq!(shape.index(0, 1, 0), 4);
        assert_eq!(shape.index(0, 0, 1), 12);
        assert_eq!(shape.index(3, 2, 1), 23);
        assert_eq!(shape.len(), 24);
    }

    #[test]
    fn reshape_requires_equal_counts() {
        let shape = Shape::new(4, 3, 2);
        assert!(shape.can_reshape_to(&Shape::vector(24)));
        assert!(shape.can_reshape_to(&Shape::new(2, 2, 6)));
        assert!(!shape.can_reshape_to(&Shape::vector(23)));
    }

    #[test]
    fn descriptor_carries_count() {
        let descriptor = Descriptor::from(Shape::matrix(5, 7));
        assert_eq!(descriptor.count, 35);
        assert_eq!(size_of::<Descriptor>(), 16);
        assert_eq!(Shape::new(2, 3, 4).to_string(), "2x3x4");
    }

    #[test]
    fn empty_shapes_are_detected() {
        assert!(Shape::new(0, 3, 1).is_empty());
        assert!(!Shape::vector(1).is_empty());
    }
}
