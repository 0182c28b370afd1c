//! tapegrad: the numeric execution core of a language runtime.
//!
//! Generated code calls into this crate for three things: flat and shaped
//! `f64` buffers with four-lane SIMD kernels, a partitioning parallel
//! executor, and a scalar computational graph with reverse-mode automatic
//! differentiation.
//!
//! # Modules
//!
//! - [`tensors`]: [`TensorBuffer`] and the shaped [`Tensor`], with scalar,
//!   SIMD and parallel kernels.
//! - [`vec4`]: the packed four-lane [`Vec4`] value type.
//! - [`ops`]: slice-level kernels the buffers are built on.
//! - [`parallel`]: [`ParallelExecutor`], splitting index ranges across a
//!   `rayon` pool with a full completion barrier.
//! - [`graph`] and [`backprop`]: the arena [`Graph`] and its backward pass.
//! - [`session`]: caller-owned recording state handing out [`Var`]s.
//! - [`ffi`]: name-stable `extern "C"` entry points over one process-wide
//!   session (feature `ffi`).
//! - [`config`], [`error`], [`approx`]: runtime knobs, the error type and
//!   float tolerance helpers.
//!
//! # Logging
//!
//! Diagnostics are emitted through [`tracing`]. The crate never installs a
//! subscriber; embedders choose where the events go.
//!
//! # Example
//!
//! ```rust
//! use tapegrad::Session;
//!
//! let mut s = Session::new();
//! s.begin().unwrap();
//! let x = s.make_var(2.0).unwrap();
//! let x2 = s.mul(x, x).unwrap();
//! let three = s.constant(3.0).unwrap();
//! let three_x = s.mul(three, x).unwrap();
//! let one = s.constant(1.0).unwrap();
//! let partial = s.add(x2, three_x).unwrap();
//! let y = s.add(partial, one).unwrap();
//! s.backward(y).unwrap();
//!
//! assert_eq!(s.value(y).unwrap(), 11.0);
//! assert_eq!(s.grad(x).unwrap(), 7.0);
//! s.end();
//! ```

pub mod approx;
pub mod backprop;
pub mod config;
pub mod error;
#[cfg(feature = "ffi")]
pub mod ffi;
pub mod graph;
pub mod ops;
pub mod parallel;
pub mod session;
pub mod tensors;
pub mod vec4;

pub use error::{Result, RuntimeError};
pub use graph::{Graph, GraphNode, NodeId, Op};
pub use parallel::{ExecutorConfig, ParallelExecutor, Partition};
pub use session::{Session, Var};
pub use tensors::{Tensor, TensorBuffer};
pub use vec4::Vec4;
