//! Approximate equality for floating point results.
//!
//! Vectorized reductions add lanes in a different order than the scalar loop,
//! so their results may differ in the last few bits. These helpers grade how
//! close two results are, relative to their magnitude.

/// Tolerance for `f32` values at the [`Closeness::Reassociated`] grade.
pub const F32_REASSOC_ERROR: f32 = 1e-5;

/// Tolerance for `f64` values at the [`Closeness::Reassociated`] grade.
pub const F64_REASSOC_ERROR: f64 = 1e-12;

/// How close two values are, best first.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Closeness {
    /// Bit-for-bit equal (or both NaN).
    Exact = 0,
    /// Within what reassociating a sum can produce.
    Reassociated = 1,
    /// Not close.
    Distinct = 2,
}

/// Grades the closeness of two values.
pub trait Approx<Rhs: ?Sized = Self> {
    /// Grade `self` against `rhs`.
    fn closeness(&self, rhs: &Rhs) -> Closeness;
}

macro_rules! impl_approx_float {
    ($t:ty, $reassoc:expr) => {
        impl Approx for $t {
            fn closeness(&self, rhs: &Self) -> Closeness {
                if self.to_bits() == rhs.to_bits() || (self.is_nan() && rhs.is_nan()) {
                    return Closeness::Exact;
                }
                if self.is_infinite() || rhs.is_infinite() {
                    return if self == rhs {
                        Closeness::Exact
                    } else {
                        Closeness::Distinct
                    };
                }
                // relative above 1.0, absolute below
                let scale = self.abs().max(rhs.abs()).max(1.0);
                let dif = (self - rhs).abs() / scale;
                if dif == 0.0 {
                    Closeness::Exact
                } else if dif <= $reassoc {
                    Closeness::Reassociated
                } else {
                    Closeness::Distinct
                }
            }
        }
    };
}

impl_approx_float!(f32, F32_REASSOC_ERROR);
impl_approx_float!(f64, F64_REASSOC_ERROR);

impl<T: Approx> Approx for [T] {
    /// The worst grade over all pairs; slices of different length are distinct.
    fn closeness(&self, rhs: &Self) -> Closeness {
        if self.len() != rhs.len() {
            return Closeness::Distinct;
        }
        self.iter()
            .zip(rhs)
            .map(|(a, b)| a.closeness(b))
            .max()
            .unwrap_or(Closeness::Exact)
    }
}

/// True when `a` and `b` differ by no more than floating-point reassociation.
pub fn reassoc_eq<T: Approx + ?Sized>(a: &T, b: &T) -> bool {
    a.closeness(b) <= Closeness::Reassociated
}
