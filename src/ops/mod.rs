//! # Buffer Kernels
//!
//! Slice-level numeric kernels shared by [`TensorBuffer`](crate::tensors::TensorBuffer),
//! the shaped [`Tensor`](crate::tensors::Tensor) and the native entry points.
//!
//! ## Submodules
//!
//! - [`scalar`]: element-by-element reference loops
//! - [`simd`]: the same kernels over chunks of four lanes, using hardware
//!   vector instructions where the target has them
//! - [`dispatch`]: picks one of the two per call
//!
//! ## Contract
//!
//! Kernels operate on the first `n` elements of their slices. Every public
//! entry point validates `n` against each slice with [`check_len`] before
//! touching memory, so a short buffer is a reported error, never an
//! out-of-bounds write.
//!
//! Elementwise SIMD kernels are bit-identical to the scalar ones (each lane
//! performs exactly the same IEEE operation). Vectorized sums add four partial
//! accumulators and may differ from the scalar sum by reassociation only.

use crate::error::{Result, RuntimeError};

pub mod dispatch;
pub mod scalar;
pub mod simd;

/// Ensures a buffer of `available` elements can serve `needed` of them.
///
/// # Errors
///
/// [`RuntimeError::LengthMismatch`] when `needed > available`.
#[inline]
pub fn check_len(op: &'static str, needed: usize, available: usize) -> Result<()> {
    if needed > available {
        return Err(RuntimeError::LengthMismatch {
            op,
            needed,
            available,
        });
    }
    Ok(())
}
