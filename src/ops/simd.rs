//! Four-lane vectorized kernels.
//!
//! Buffers are processed in chunks of [`LANES`] `f64`s:
//!
//! - `x86_64` with AVX enabled at compile time: one 256-bit op per chunk
//! - `x86_64` otherwise: two SSE2 (128-bit) ops per chunk
//! - `aarch64`: two NEON ops per chunk
//! - anything else, or the `simd` feature off: a plain per-lane loop
//!
//! The remainder past the last full chunk always goes through the scalar
//! kernel.

use super::scalar;

/// Elements per chunk.
pub const LANES: usize = 4;

/// True when chunks are processed with hardware vector instructions.
pub const ACCELERATED: bool = cfg!(all(
    feature = "simd",
    any(target_arch = "x86_64", target_arch = "aarch64")
));

#[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx"))]
macro_rules! lane_kernel {
    ($name:ident, $op:tt, $avx:ident, $sse:ident, $neon:ident) => {
        #[inline]
        fn $name(d: &mut [f64], a: &[f64], b: &[f64]) {
            use core::arch::x86_64::{$avx, _mm256_loadu_pd, _mm256_storeu_pd};
            assert!(d.len() >= LANES && a.len() >= LANES && b.len() >= LANES);
            // SAFETY: AVX is enabled for this build; each slice holds at least
            // LANES f64s and only unaligned loads/stores are used.
            unsafe {
                let r = $avx(_mm256_loadu_pd(a.as_ptr()), _mm256_loadu_pd(b.as_ptr()));
                _mm256_storeu_pd(d.as_mut_ptr(), r);
            }
        }
    };
}

#[cfg(all(feature = "simd", target_arch = "x86_64", not(target_feature = "avx")))]
macro_rules! lane_kernel {
    ($name:ident, $op:tt, $avx:ident, $sse:ident, $neon:ident) => {
        #[inline]
        fn $name(d: &mut [f64], a: &[f64], b: &[f64]) {
            use core::arch::x86_64::{$sse, _mm_loadu_pd, _mm_storeu_pd};
            assert!(d.len() >= LANES && a.len() >= LANES && b.len() >= LANES);
            // SAFETY: SSE2 is part of the x86_64 baseline; each slice holds at
            // least LANES f64s, so both halves at offsets 0 and 2 are in bounds.
            unsafe {
                for h in [0, 2] {
                    let r = $sse(_mm_loadu_pd(a.as_ptr().add(h)), _mm_loadu_pd(b.as_ptr().add(h)));
                    _mm_storeu_pd(d.as_mut_ptr().add(h), r);
                }
            }
        }
    };
}

#[cfg(all(feature = "simd", target_arch = "aarch64"))]
macro_rules! lane_kernel {
    ($name:ident, $op:tt, $avx:ident, $sse:ident, $neon:ident) => {
        #[inline]
        fn $name(d: &mut [f64], a: &[f64], b: &[f64]) {
            use core::arch::aarch64::{$neon, vld1q_f64, vst1q_f64};
            assert!(d.len() >= LANES && a.len() >= LANES && b.len() >= LANES);
            // SAFETY: NEON is part of the aarch64 baseline; each slice holds at
            // least LANES f64s, so both halves at offsets 0 and 2 are in bounds.
            unsafe {
                for h in [0, 2] {
                    let r = $neon(vld1q_f64(a.as_ptr().add(h)), vld1q_f64(b.as_ptr().add(h)));
                    vst1q_f64(d.as_mut_ptr().add(h), r);
                }
            }
        }
    };
}

#[cfg(not(all(feature = "simd", any(target_arch = "x86_64", target_arch = "aarch64"))))]
macro_rules! lane_kernel {
    ($name:ident, $op:tt, $avx:ident, $sse:ident, $neon:ident) => {
        #[inline]
        fn $name(d: &mut [f64], a: &[f64], b: &[f64]) {
            for i in 0..LANES {
                d[i] = a[i] $op b[i];
            }
        }
    };
}

lane_kernel!(add_lanes, +, _mm256_add_pd, _mm_add_pd, vaddq_f64);
lane_kernel!(mul_lanes, *, _mm256_mul_pd, _mm_mul_pd, vmulq_f64);

/// Runs `lanes` over every full chunk of the first `n` elements and `tail`
/// over the rest. All three slices must hold at least `n` elements.
#[inline]
fn chunked(
    dst: &mut [f64],
    a: &[f64],
    b: &[f64],
    n: usize,
    lanes: fn(&mut [f64], &[f64], &[f64]),
    tail: fn(&mut [f64], &[f64], &[f64]),
) {
    let body = n - n % LANES;
    let (dst_body, dst_tail) = dst[..n].split_at_mut(body);
    let (a_body, a_tail) = a[..n].split_at(body);
    let (b_body, b_tail) = b[..n].split_at(body);

    dst_body
        .chunks_exact_mut(LANES)
        .zip(a_body.chunks_exact(LANES).zip(b_body.chunks_exact(LANES)))
        .for_each(|(d, (x, y))| lanes(d, x, y));

    tail(dst_tail, a_tail, b_tail);
}

/// Vectorized `dst[i] = a[i] + b[i]` over `dst.len()` elements.
///
/// # Panics
///
/// Panics if `a` or `b` is shorter than `dst`; public callers check lengths first.
pub fn add(dst: &mut [f64], a: &[f64], b: &[f64]) {
    let n = dst.len();
    chunked(dst, a, b, n, add_lanes, scalar::add);
}

/// Vectorized `dst[i] = a[i] * b[i]` over `dst.len()` elements.
///
/// # Panics
///
/// Panics if `a` or `b` is shorter than `dst`; public callers check lengths first.
pub fn mul(dst: &mut [f64], a: &[f64], b: &[f64]) {
    let n = dst.len();
    chunked(dst, a, b, n, mul_lanes, scalar::mul);
}

/// Vectorized sum: four lane accumulators, folded pairwise, plus the tail.
pub fn sum(src: &[f64]) -> f64 {
    let body = src.len() - src.len() % LANES;
    let mut acc = [0.0; LANES];
    for chunk in src[..body].chunks_exact(LANES) {
        let prev = acc;
        add_lanes(&mut acc, &prev, chunk);
    }
    (acc[0] + acc[1]) + (acc[2] + acc[3]) + scalar::sum(&src[body..])
}
