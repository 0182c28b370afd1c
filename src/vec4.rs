//! Packed four-lane `f32` vector.
//!
//! `Vec4` is a plain value type laid out like the C struct `{ float x, y, z, w; }`
//! so it can cross the native boundary by value. Lane-wise arithmetic uses SSE
//! on `x86_64` (always present on that target) when the `simd` feature is on,
//! and a scalar fallback everywhere else. Both paths perform the same IEEE
//! operation per lane, so their results are bit-identical.

use core::ops::{Add, Mul, Sub};

#[cfg(all(feature = "simd", target_arch = "x86_64"))]
use core::arch::x86_64::{_mm_add_ps, _mm_loadu_ps, _mm_mul_ps, _mm_storeu_ps, _mm_sub_ps};

/// Four packed single-precision floats.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec4 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Vec4 {
    /// The zero vector.
    pub const ZERO: Self = Self::splat(0.0);

    /// Builds a vector from four lanes.
    #[inline]
    #[must_use]
    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }

    /// Builds a vector with every lane set to `v`.
    #[inline]
    #[must_use]
    pub const fn splat(v: f32) -> Self {
        Self::new(v, v, v, v)
    }

    #[inline]
    #[must_use]
    pub const fn from_array(a: [f32; 4]) -> Self {
        Self::new(a[0], a[1], a[2], a[3])
    }

    #[inline]
    #[must_use]
    pub const fn to_array(self) -> [f32; 4] {
        [self.x, self.y, self.z, self.w]
    }

    /// Dot product of all four lanes.
    #[inline]
    #[must_use]
    pub fn dot(self, other: Self) -> f32 {
        let m = self * other;
        m.x + m.y + m.z + m.w
    }

    /// Euclidean length, `sqrt(dot(v, v))`.
    #[inline]
    #[must_use]
    pub fn magnitude(self) -> f32 {
        self.dot(self).sqrt()
    }

    /// Scales the vector to unit length.
    ///
    /// A vector whose magnitude is exactly zero is returned unchanged.
    #[must_use]
    pub fn normalize(self) -> Self {
        let mag = self.magnitude();
        if mag == 0.0 {
            return self;
        }
        Self::new(self.x / mag, self.y / mag, self.z / mag, self.w / mag)
    }

    /// Three-dimensional cross product of the `x`, `y`, `z` lanes.
    ///
    /// The `w` lane of the result is always `0.0`.
    #[must_use]
    pub fn cross(self, other: Self) -> Self {
        Self::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
            0.0,
        )
    }
}

/// Applies an SSE intrinsic lane-wise to two vectors.
#[cfg(all(feature = "simd", target_arch = "x86_64"))]
macro_rules! sse_lanewise {
    ($op:ident, $a:expr, $b:expr) => {{
        let a = $a.to_array();
        let b = $b.to_array();
        let mut out = [0.0f32; 4];
        // SAFETY: SSE is part of the x86_64 baseline; all three arrays hold
        // exactly four f32 lanes and only unaligned loads/stores are used.
        unsafe {
            let r = $op(_mm_loadu_ps(a.as_ptr()), _mm_loadu_ps(b.as_ptr()));
            _mm_storeu_ps(out.as_mut_ptr(), r);
        }
        Vec4::from_array(out)
    }};
}

impl Add for Vec4 {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Self) -> Self {
        #[cfg(all(feature = "simd", target_arch = "x86_64"))]
        {
            sse_lanewise!(_mm_add_ps, self, rhs)
        }
        #[cfg(not(all(feature = "simd", target_arch = "x86_64")))]
        {
            Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z, self.w + rhs.w)
        }
    }
}

impl Sub for Vec4 {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Self) -> Self {
        #[cfg(all(feature = "simd", target_arch = "x86_64"))]
        {
            sse_lanewise!(_mm_sub_ps, self, rhs)
        }
        #[cfg(not(all(feature = "simd", target_arch = "x86_64")))]
        {
            Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z, self.w - rhs.w)
        }
    }
}

impl Mul for Vec4 {
    type Output = Self;

    #[inline]
    fn mul(self, rhs: Self) -> Self {
        #[cfg(all(feature = "simd", target_arch = "x86_64"))]
        {
            sse_lanewise!(_mm_mul_ps, self, rhs)
        }
        #[cfg(not(all(feature = "simd", target_arch = "x86_64")))]
        {
            Self::new(self.x * rhs.x, self.y * rhs.y, self.z * rhs.z, self.w * rhs.w)
        }
    }
}

impl From<[f32; 4]> for Vec4 {
    fn from(a: [f32; 4]) -> Self {
        Self::from_array(a)
    }
}
