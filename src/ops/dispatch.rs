//! Kernel Dispatch Layer
//!
//! Picks the [`simd`](super::simd) kernels when the build has hardware vector
//! support and the slice holds at least one full chunk, and the
//! [`scalar`](super::scalar) loops otherwise. Both produce identical
//! elementwise results, so callers that do not name a variant go through here.

use super::{scalar, simd};

#[inline]
const fn vectorize(n: usize) -> bool {
    simd::ACCELERATED && n >= simd::LANES
}

/// `dst[i] = a[i] + b[i]` over `dst.len()` elements.
#[inline]
pub fn add(dst: &mut [f64], a: &[f64], b: &[f64]) {
    if vectorize(dst.len()) {
        simd::add(dst, a, b);
    } else {
        scalar::add(dst, a, b);
    }
}

/// `dst[i] = a[i] * b[i]` over `dst.len()` elements.
#[inline]
pub fn mul(dst: &mut [f64], a: &[f64], b: &[f64]) {
    if vectorize(dst.len()) {
        simd::mul(dst, a, b);
    } else {
        scalar::mul(dst, a, b);
    }
}

/// Sum of `src`.
#[inline]
pub fn sum(src: &[f64]) -> f64 {
    if vectorize(src.len()) {
        simd::sum(src)
    } else {
        scalar::sum(src)
    }
}
