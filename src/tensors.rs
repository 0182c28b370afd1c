//! Flat numeric buffers and shaped tensors.
//!
//! # Tensor Storage
//!
//! [`TensorBuffer`] owns a contiguous block of `f64`s. It is the unit the
//! native entry points hand out as a handle, and the storage under the shaped
//! [`Tensor`].
//!
//! Every operation takes an explicit element count `n`, validated against each
//! buffer involved. A short buffer is a [`RuntimeError::LengthMismatch`], never
//! an out-of-bounds access.
//!
//! ## Allocation
//!
//! - [`TensorBuffer::try_allocate`] always reports failure as an error.
//! - [`TensorBuffer::allocate`] follows the configured
//!   [`AllocPolicy`](crate::config::AllocPolicy): by default it prints a
//!   diagnostic and aborts the process, matching the runtime's fail-fast
//!   convention.
//!
//! ## Kernel variants
//!
//! - [`add`], [`mul`], [`TensorBuffer::sum`]: scalar reference loops
//! - [`add_simd`], [`mul_simd`], [`TensorBuffer::sum_simd`]: four-lane kernels
//! - [`par_add`], [`par_mul`], [`par_sum`]: partitioned over a
//!   [`ParallelExecutor`], each worker running the four-lane kernel
//!
//! ## Example
//!
//! ```rust
//! use tapegrad::tensors::{add_simd, TensorBuffer};
//!
//! let mut a = TensorBuffer::try_allocate(6).unwrap();
//! let mut b = TensorBuffer::try_allocate(6).unwrap();
//! let mut out = TensorBuffer::try_allocate(6).unwrap();
//! a.fill(6, 1.5).unwrap();
//! b.fill(6, 2.0).unwrap();
//! add_simd(&mut out, &a, &b, 6).unwrap();
//! assert_eq!(out.mean(6).unwrap(), 3.5);
//! ```

use crate::config::{alloc_policy, AllocPolicy};
use crate::error::{Result, RuntimeError};
use crate::ops::{check_len, dispatch, scalar, simd};
use crate::parallel::ParallelExecutor;
use tracing::error;

/// A contiguous, owned block of `f64`s.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TensorBuffer {
    data: Vec<f64>,
}

impl TensorBuffer {
    /// Allocates `n` zeroed elements, reporting allocation failure.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::AllocationFailed`] if the memory cannot be reserved.
    pub fn try_allocate(n: usize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(n)
            .map_err(|_| RuntimeError::AllocationFailed { elements: n })?;
        data.resize(n, 0.0);
        Ok(Self { data })
    }

    /// Allocates `n` zeroed elements under the configured [`AllocPolicy`].
    ///
    /// With [`AllocPolicy::FailFast`] (the default) an allocation failure never
    /// returns: a diagnostic is printed and the process aborts.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::AllocationFailed`] under [`AllocPolicy::Report`].
    pub fn allocate(n: usize) -> Result<Self> {
        match Self::try_allocate(n) {
            Ok(buf) => Ok(buf),
            Err(_) if alloc_policy() == AllocPolicy::FailFast => {
                error!(elements = n, "tensor allocation failed, aborting");
                eprintln!("tapegrad: out of memory allocating tensor of {n} elements");
                std::process::abort()
            }
            Err(e) => Err(e),
        }
    }

    /// Wraps an existing vector without copying.
    #[must_use]
    pub const fn from_vec(data: Vec<f64>) -> Self {
        Self { data }
    }

    /// Releases the buffer. Equivalent to dropping it.
    pub fn free(self) {}

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<f64> {
        self.data
    }

    /// Reads element `i`.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::IndexOutOfBounds`] past the end.
    pub fn get(&self, i: usize) -> Result<f64> {
        self.data
            .get(i)
            .copied()
            .ok_or(RuntimeError::IndexOutOfBounds {
                index: i,
                len: self.data.len(),
            })
    }

    /// Writes element `i`.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::IndexOutOfBounds`] past the end.
    pub fn set(&mut self, i: usize, value: f64) -> Result<()> {
        let len = self.data.len();
        let slot = self
            .data
            .get_mut(i)
            .ok_or(RuntimeError::IndexOutOfBounds { index: i, len })?;
        *slot = value;
        Ok(())
    }

    /// Sets the first `n` elements to `value`.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::LengthMismatch`] if `n > self.len()`.
    pub fn fill(&mut self, n: usize, value: f64) -> Result<()> {
        check_len("fill", n, self.len())?;
        scalar::fill(&mut self.data[..n], value);
        Ok(())
    }

    /// Sum of the first `n` elements, left to right.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::LengthMismatch`] if `n > self.len()`.
    pub fn sum(&self, n: usize) -> Result<f64> {
        check_len("sum", n, self.len())?;
        Ok(scalar::sum(&self.data[..n]))
    }

    /// Sum of the first `n` elements using four lane accumulators.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::LengthMismatch`] if `n > self.len()`.
    pub fn sum_simd(&self, n: usize) -> Result<f64> {
        check_len("sum_simd", n, self.len())?;
        Ok(simd::sum(&self.data[..n]))
    }

    /// `sum(n) / n`.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::InvalidArgument`] for `n == 0`, and
    /// [`RuntimeError::LengthMismatch`] if `n > self.len()`.
    #[allow(clippy::cast_precision_loss)]
    pub fn mean(&self, n: usize) -> Result<f64> {
        if n == 0 {
            return Err(RuntimeError::invalid("mean", "mean of zero elements"));
        }
        Ok(self.sum(n)? / n as f64)
    }
}

impl From<Vec<f64>> for TensorBuffer {
    fn from(data: Vec<f64>) -> Self {
        Self::from_vec(data)
    }
}

fn check_binary(
    op: &'static str,
    dst: &TensorBuffer,
    a: &TensorBuffer,
    b: &TensorBuffer,
    n: usize,
) -> Result<()> {
    check_len(op, n, dst.len())?;
    check_len(op, n, a.len())?;
    check_len(op, n, b.len())
}

/// `dst[i] = a[i] + b[i]` for `i < n`, element by element.
///
/// # Errors
///
/// [`RuntimeError::LengthMismatch`] if any buffer is shorter than `n`.
pub fn add(dst: &mut TensorBuffer, a: &TensorBuffer, b: &TensorBuffer, n: usize) -> Result<()> {
    check_binary("add", dst, a, b, n)?;
    scalar::add(&mut dst.data[..n], &a.data, &b.data);
    Ok(())
}

/// `dst[i] = a[i] * b[i]` for `i < n`, element by element.
///
/// # Errors
///
/// [`RuntimeError::LengthMismatch`] if any buffer is shorter than `n`.
pub fn mul(dst: &mut TensorBuffer, a: &TensorBuffer, b: &TensorBuffer, n: usize) -> Result<()> {
    check_binary("mul", dst, a, b, n)?;
    scalar::mul(&mut dst.data[..n], &a.data, &b.data);
    Ok(())
}

/// Four-lane `dst[i] = a[i] + b[i]` for `i < n`.
///
/// # Errors
///
/// [`RuntimeError::LengthMismatch`] if any buffer is shorter than `n`.
pub fn add_simd(dst: &mut TensorBuffer, a: &TensorBuffer, b: &TensorBuffer, n: usize) -> Result<()> {
    check_binary("add_simd", dst, a, b, n)?;
    simd::add(&mut dst.data[..n], &a.data, &b.data);
    Ok(())
}

/// Four-lane `dst[i] = a[i] * b[i]` for `i < n`.
///
/// # Errors
///
/// [`RuntimeError::LengthMismatch`] if any buffer is shorter than `n`.
pub fn mul_simd(dst: &mut TensorBuffer, a: &TensorBuffer, b: &TensorBuffer, n: usize) -> Result<()> {
    check_binary("mul_simd", dst, a, b, n)?;
    simd::mul(&mut dst.data[..n], &a.data, &b.data);
    Ok(())
}

/// Runs `kernel` on each executor partition of `dst`, one job per partition.
/// Partition boundaries are the executor's, so a part's tail may be shorter
/// than a full chunk.
fn par_binary(
    exec: &ParallelExecutor,
    dst: &mut [f64],
    a: &[f64],
    b: &[f64],
    kernel: fn(&mut [f64], &[f64], &[f64]),
) {
    exec.for_each_chunk_mut(dst, |offset, piece| {
        let end = offset + piece.len();
        kernel(piece, &a[offset..end], &b[offset..end]);
    });
}

/// Folds each executor partition of `data` with `kernel`, then adds the
/// partials in partition order.
fn par_fold(exec: &ParallelExecutor, data: &[f64], kernel: fn(&[f64]) -> f64) -> f64 {
    exec.map_partitions(0, data.len(), |p| kernel(&data[p.start..p.end]))
        .into_iter()
        .sum()
}

/// Partitioned `dst[i] = a[i] + b[i]` for `i < n`.
///
/// # Errors
///
/// [`RuntimeError::LengthMismatch`] if any buffer is shorter than `n`.
pub fn par_add(
    exec: &ParallelExecutor,
    dst: &mut TensorBuffer,
    a: &TensorBuffer,
    b: &TensorBuffer,
    n: usize,
) -> Result<()> {
    check_binary("par_add", dst, a, b, n)?;
    par_binary(exec, &mut dst.data[..n], &a.data, &b.data, simd::add);
    Ok(())
}

/// Partitioned `dst[i] = a[i] * b[i]` for `i < n`.
///
/// # Errors
///
/// [`RuntimeError::LengthMismatch`] if any buffer is shorter than `n`.
pub fn par_mul(
    exec: &ParallelExecutor,
    dst: &mut TensorBuffer,
    a: &TensorBuffer,
    b: &TensorBuffer,
    n: usize,
) -> Result<()> {
    check_binary("par_mul", dst, a, b, n)?;
    par_binary(exec, &mut dst.data[..n], &a.data, &b.data, simd::mul);
    Ok(())
}

/// Partitioned sum of the first `n` elements.
///
/// Each partition is summed with the four-lane kernel, then the partial sums
/// are added in partition order.
///
/// # Errors
///
/// [`RuntimeError::LengthMismatch`] if `n > buf.len()`.
pub fn par_sum(exec: &ParallelExecutor, buf: &TensorBuffer, n: usize) -> Result<f64> {
    check_len("par_sum", n, buf.len())?;
    Ok(par_fold(exec, &buf.data[..n], simd::sum))
}

/// A row-major N-dimensional tensor over a [`TensorBuffer`].
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    strides: Vec<usize>,
    buffer: TensorBuffer,
}

fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

fn element_count(shape: &[usize]) -> Result<usize> {
    shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| RuntimeError::invalid("tensor", format!("shape {shape:?} overflows")))
}

impl Tensor {
    /// A tensor of the given shape filled with zeros.
    ///
    /// # Errors
    ///
    /// Allocation failures (per [`TensorBuffer::allocate`]) and shapes whose
    /// element count overflows.
    pub fn zeros(shape: &[usize]) -> Result<Self> {
        let buffer = TensorBuffer::allocate(element_count(shape)?)?;
        Ok(Self {
            shape: shape.to_vec(),
            strides: row_major_strides(shape),
            buffer,
        })
    }

    /// A tensor of the given shape filled with ones.
    ///
    /// # Errors
    ///
    /// As [`Tensor::zeros`].
    pub fn ones(shape: &[usize]) -> Result<Self> {
        let mut t = Self::zeros(shape)?;
        let n = t.buffer.len();
        t.buffer.fill(n, 1.0)?;
        Ok(t)
    }

    /// Wraps row-major `data` in the given shape.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::ShapeMismatch`] if `data.len()` is not the shape's
    /// element count.
    pub fn from_vec(shape: &[usize], data: Vec<f64>) -> Result<Self> {
        let count = element_count(shape)?;
        if count != data.len() {
            return Err(RuntimeError::ShapeMismatch {
                op: "from_vec",
                expected: shape.to_vec(),
                got: vec![data.len()],
            });
        }
        Ok(Self {
            shape: shape.to_vec(),
            strides: row_major_strides(shape),
            buffer: TensorBuffer::from_vec(data),
        })
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn data(&self) -> &[f64] {
        self.buffer.as_slice()
    }

    #[must_use]
    pub const fn buffer(&self) -> &TensorBuffer {
        &self.buffer
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    fn offset(&self, indices: &[usize]) -> Result<usize> {
        if indices.len() != self.shape.len() {
            return Err(RuntimeError::ShapeMismatch {
                op: "index",
                expected: self.shape.clone(),
                got: indices.to_vec(),
            });
        }
        indices
            .iter()
            .zip(self.shape.iter().zip(&self.strides))
            .try_fold(0, |acc, (&i, (&dim, &stride))| {
                if i < dim {
                    Ok(acc + i * stride)
                } else {
                    Err(RuntimeError::IndexOutOfBounds { index: i, len: dim })
                }
            })
    }

    /// Reads the element at `indices`.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::ShapeMismatch`] for the wrong number of indices,
    /// [`RuntimeError::IndexOutOfBounds`] for an index past its dimension.
    pub fn get(&self, indices: &[usize]) -> Result<f64> {
        self.buffer.get(self.offset(indices)?)
    }

    /// Writes the element at `indices`.
    ///
    /// # Errors
    ///
    /// As [`Tensor::get`].
    pub fn set(&mut self, indices: &[usize], value: f64) -> Result<()> {
        let at = self.offset(indices)?;
        self.buffer.set(at, value)
    }

    fn same_shape(&self, op: &'static str, other: &Self) -> Result<()> {
        if self.shape != other.shape {
            return Err(RuntimeError::ShapeMismatch {
                op,
                expected: self.shape.clone(),
                got: other.shape.clone(),
            });
        }
        Ok(())
    }

    /// Elementwise sum of two tensors of the same shape.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::ShapeMismatch`] if the shapes differ.
    pub fn add(&self, other: &Self) -> Result<Self> {
        self.same_shape("add", other)?;
        let mut out = Self::zeros(&self.shape)?;
        dispatch::add(out.buffer.as_mut_slice(), self.data(), other.data());
        Ok(out)
    }

    /// Elementwise product of two tensors of the same shape.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::ShapeMismatch`] if the shapes differ.
    pub fn mul(&self, other: &Self) -> Result<Self> {
        self.same_shape("mul", other)?;
        let mut out = Self::zeros(&self.shape)?;
        dispatch::mul(out.buffer.as_mut_slice(), self.data(), other.data());
        Ok(out)
    }

    /// Matrix product `self (m×k) · other (k×n)`, one output cell per index
    /// of the executor's range.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::ShapeMismatch`] unless both tensors are 2-D with
    /// matching inner dimensions.
    pub fn matmul(&self, other: &Self, exec: &ParallelExecutor) -> Result<Self> {
        let (&[m, k], &[k2, n]) = (self.shape.as_slice(), other.shape.as_slice()) else {
            return Err(RuntimeError::ShapeMismatch {
                op: "matmul",
                expected: vec![0, 0],
                got: if self.shape.len() == 2 {
                    other.shape.clone()
                } else {
                    self.shape.clone()
                },
            });
        };
        if k != k2 {
            return Err(RuntimeError::ShapeMismatch {
                op: "matmul",
                expected: vec![k, n],
                got: other.shape.clone(),
            });
        }

        let mut out = Self::zeros(&[m, n])?;
        let a = self.data();
        let b = other.data();
        exec.for_each_mut(out.buffer.as_mut_slice(), |idx, cell| {
            let (i, j) = (idx / n, idx % n);
            *cell = (0..k).map(|l| a[i * k + l] * b[l * n + j]).sum();
        });
        Ok(out)
    }

    /// The same data under a new shape with the same element count.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::ShapeMismatch`] if the element counts differ.
    pub fn reshape(&self, shape: &[usize]) -> Result<Self> {
        if element_count(shape)? != self.len() {
            return Err(RuntimeError::ShapeMismatch {
                op: "reshape",
                expected: self.shape.clone(),
                got: shape.to_vec(),
            });
        }
        Ok(Self {
            shape: shape.to_vec(),
            strides: row_major_strides(shape),
            buffer: self.buffer.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::ExecutorConfig;
    use std::sync::Mutex;
    use std::thread::{self, ThreadId};
    use std::time::{Duration, Instant};

    #[test]
    fn allocate_is_zeroed() {
        let buf = TensorBuffer::try_allocate(9).unwrap();
        assert_eq!(buf.len(), 9);
        assert!(buf.as_slice().iter().all(|&x| x == 0.0));
    }

    #[test]
    fn impossible_allocation_is_reported() {
        let err = TensorBuffer::try_allocate(usize::MAX / 2).unwrap_err();
        assert_eq!(
            err,
            RuntimeError::AllocationFailed {
                elements: usize::MAX / 2
            }
        );
    }

    #[test]
    fn short_buffers_are_rejected() {
        let mut dst = TensorBuffer::try_allocate(4).unwrap();
        let a = TensorBuffer::try_allocate(8).unwrap();
        let b = TensorBuffer::try_allocate(3).unwrap();
        assert!(matches!(
            add(&mut dst, &a, &b, 4),
            Err(RuntimeError::LengthMismatch {
                op: "add",
                needed: 4,
                available: 3
            })
        ));
        assert!(dst.fill(5, 1.0).is_err());
        assert!(a.sum(9).is_err());
        assert!(a.mean(0).is_err());
    }

    #[test]
    fn mean_of_constant_fill() {
        let mut buf = TensorBuffer::try_allocate(37).unwrap();
        buf.fill(37, 2.5).unwrap();
        assert_eq!(buf.mean(37).unwrap(), 2.5);
        assert_eq!(buf.sum_simd(37).unwrap(), 92.5);
    }

    #[test]
    fn par_ops_match_sequential() {
        let exec = ParallelExecutor::new(ExecutorConfig::new().with_max_workers(5));
        let n = 1001;
        let a = TensorBuffer::from_vec((0..n).map(|i| i as f64).collect());
        let b = TensorBuffer::from_vec((0..n).map(|i| (n - i) as f64 * 0.5).collect());

        let mut want = TensorBuffer::try_allocate(n).unwrap();
        let mut got = TensorBuffer::try_allocate(n).unwrap();
        add(&mut want, &a, &b, n).unwrap();
        par_add(&exec, &mut got, &a, &b, n).unwrap();
        assert_eq!(want, got);

        mul(&mut want, &a, &b, n).unwrap();
        par_mul(&exec, &mut got, &a, &b, n).unwrap();
        assert_eq!(want, got);

        // integers below 2^53: every summation order is exact
        assert_eq!(par_sum(&exec, &a, n).unwrap(), a.sum(n).unwrap());
    }

    static KERNEL_THREADS: Mutex<Vec<ThreadId>> = Mutex::new(Vec::new());

    /// Notes the calling thread, then waits briefly for a second one so a
    /// single busy worker cannot drain every partition alone.
    fn note_thread() {
        let me = thread::current().id();
        {
            let mut seen = KERNEL_THREADS.lock().unwrap();
            if !seen.contains(&me) {
                seen.push(me);
            }
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while KERNEL_THREADS.lock().unwrap().len() < 2 && Instant::now() < deadline {
            thread::yield_now();
        }
    }

    fn noted_add(dst: &mut [f64], a: &[f64], b: &[f64]) {
        note_thread();
        simd::add(dst, a, b);
    }

    fn noted_sum(data: &[f64]) -> f64 {
        note_thread();
        simd::sum(data)
    }

    #[test]
    fn par_kernels_run_on_several_workers() {
        let exec = ParallelExecutor::with_dedicated_pool(
            ExecutorConfig::new()
                .with_sequential_threshold(0)
                .with_max_workers(4),
        )
        .unwrap();
        let n = 400_000;
        let a = vec![1.0; n];
        let b = vec![2.0; n];
        let mut dst = vec![0.0; n];

        par_binary(&exec, &mut dst, &a, &b, noted_add);
        assert!(dst.iter().all(|&x| x == 3.0));
        let threads = core::mem::take(&mut *KERNEL_THREADS.lock().unwrap());
        assert!(threads.len() > 1, "par_binary ran on {} thread(s)", threads.len());
        assert!(!threads.contains(&thread::current().id()));

        assert_eq!(par_fold(&exec, &dst, noted_sum), 3.0 * n as f64);
        let threads = core::mem::take(&mut *KERNEL_THREADS.lock().unwrap());
        assert!(threads.len() > 1, "par_fold ran on {} thread(s)", threads.len());
    }

    #[test]
    fn shaped_indexing_and_reshape() {
        let mut t = Tensor::zeros(&[2, 3]).unwrap();
        t.set(&[1, 2], 7.0).unwrap();
        assert_eq!(t.get(&[1, 2]).unwrap(), 7.0);
        assert_eq!(t.data()[5], 7.0);
        assert!(matches!(
            t.get(&[2, 0]),
            Err(RuntimeError::IndexOutOfBounds { index: 2, len: 2 })
        ));
        assert!(t.get(&[0]).is_err());

        let r = t.reshape(&[3, 2]).unwrap();
        assert_eq!(r.get(&[2, 1]).unwrap(), 7.0);
        assert!(t.reshape(&[4, 2]).is_err());
    }

    #[test]
    fn matmul_small() {
        let exec = ParallelExecutor::default();
        let a = Tensor::from_vec(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b = Tensor::from_vec(&[3, 2], vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0]).unwrap();
        let c = a.matmul(&b, &exec).unwrap();
        assert_eq!(c.shape(), &[2, 2]);
        assert_eq!(c.data(), &[58.0, 64.0, 139.0, 154.0]);
        assert!(b.matmul(&b, &exec).is_err());
    }
}
