//! Tolerant equality of `f32` values read back from the device.
//!
//! Device arithmetic (fused multiply-add, `exp`, accumulation order) rarely
//! matches the host bit for bit, so results are graded by absolute
//! difference instead.

/// Largest difference still graded [`ApproxEquality::Relative`].
pub const F32_MAX_ERROR: f32 = 1e-3;

/// Largest difference still graded [`ApproxEquality::Partial`].
pub const F32_AVG_ERROR: f32 = 1e-5;

/// Largest difference still graded [`ApproxEquality::Precise`].
pub const F32_MIN_ERROR: f32 = 1e-6;

/// How close two values are.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApproxEquality {
    /// Within [`F32_MIN_ERROR`].
    Precise = 0,
    /// Within [`F32_AVG_ERROR`].
    Partial = 1,
    /// Within [`F32_MAX_ERROR`].
    Relative = 2,
    /// Further apart, or of different lengths.
    Scarce = 3,
}

/// Grades the distance between `self` and a reference.
pub trait RelativeEq<Rhs: ?Sized = Self> {
    /// The grade of the worst element.
    fn approx_eq(&self, rhs: &Rhs) -> ApproxEquality;
}

impl RelativeEq for f32 {
    fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
        let dif = (self - rhs).abs();
        if dif <= F32_MIN_ERROR {
            ApproxEquality::Precise
        } else if dif <= F32_AVG_ERROR {
            ApproxEquality::Partial
        } else if dif <= F32_MAX_ERROR {
            ApproxEquality::Relative
        } else {
            ApproxEquality::Scarce
        }
    }
}

impl RelativeEq for [f32] {
    fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
        if self.len() != rhs.len() {
            return ApproxEquality::Scarce;
        }
        self.iter()
            .zip(rhs)
            .map(|(a, b)| a.approx_eq(b))
            .max()
            .unwrap_or(ApproxEquality::Precise)
    }
}

impl<const N: usize> RelativeEq<[f32; N]> for [f32] {
    fn approx_eq(&self, rhs: &[f32; N]) -> ApproxEquality {
        self.approx_eq(rhs.as_slice())
    }
}

/// Whether `a` and `b` are at least [`ApproxEquality::Relative`].
pub fn approx_eq<A: RelativeEq<B> + ?Sized, B: ?Sized>(a: &A, b: &B) -> bool {
    a.approx_eq(b) <= ApproxEquality::Relative
}

/// Whether every element of `a` is within `tolerance` of `b`.
#[must_use]
pub fn all_close(a: &[f32], b: &[f32], tolerance: f32) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() <= tolerance)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grades_by_absolute_difference() {
        assert_eq!(1.0f32.approx_eq(&1.0), ApproxEquality::Precise);
        assert_eq!(1.0f32.approx_eq(&1.000_005), ApproxEquality::Partial);
        assert_eq!(1.0f32.approx_eq(&1.0005), ApproxEquality::Relative);
        assert_eq!(1.0f32.approx_eq(&1.1), ApproxEquality::Scarce);
    }

    #[test]
    fn slices_take_the_worst_grade() {
        let a = [1.0f32, 2.0, 3.0];
        assert_eq!(a[..].approx_eq(&[1.0, 2.0005, 3.0]), ApproxEquality::Relative);
        assert_eq!(a[..].approx_eq(&[1.0, 2.0]), ApproxEquality::Scarce);
        assert!(approx_eq(&a[..], &[1.0, 2.0, 3.0]));
    }

    #[test]
    fn all_close_checks_lengths() {
        assert!(all_close(&[0.5, 1.5], &[0.52, 1.48], 0.05));
        assert!(!all_close(&[0.5], &[0.5, 1.5], 0.05));
    }
}
