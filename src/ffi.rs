//! Name-stable `extern "C"` entry points.
//!
//! # Native Surface
//!
//! Generated code calls the runtime through these functions only. Every
//! argument and result is an `i64` handle, an `f64`/`f32` scalar, a function
//! pointer or a [`Vec4`] passed by value.
//!
//! ## Handles
//!
//! - Tensor handles are pointers to boxed [`TensorBuffer`]s cast to `i64`.
//!   They are owned by the caller between `tg_tensor_alloc` and
//!   `tg_tensor_free`.
//! - Tracked variable handles are [`NodeId::to_raw`] values, always positive.
//! - Values computed without an active session live in a detached pool and
//!   get negative handles: bit 63 set, the slot's generation in bits 32..63
//!   and `slot + 1` below. A slot is reused only after `tg_var_free` releases
//!   it or `tg_grad_begin` / `tg_grad_end` clears the pool, and reuse bumps
//!   its generation, so an old handle reads as stale instead of aliasing the
//!   new value. Without those calls the pool grows by one slot per detached
//!   result.
//! - `0` is the null handle.
//!
//! ## Errors
//!
//! Nothing here unwinds or returns a `Result`. A failing call records the
//! error in a process-wide slot, logs it, and returns a neutral value (`0`,
//! `0.0`, or nothing). `tg_last_error` reads the slot as a
//! [`RuntimeError::code`], `0` meaning no error.
//!
//! All session and error state sits behind one mutex, so concurrent callers
//! are serialized.

use crate::config::{executor_defaults, set_executor_defaults};
use crate::error::{Result, RuntimeError};
use crate::graph::{NodeId, Op};
use crate::parallel::{ExecutorConfig, ParallelExecutor};
use crate::session::{Session, Var};
use crate::tensors::{self, TensorBuffer};
use crate::vec4::Vec4;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

const DETACHED_TAG: u64 = 1 << 63;
const MAX_GENERATION: u32 = 0x7FFF_FFFF;

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    generation: u32,
    value: Option<f64>,
}

/// Values of detached handles, recycled through a free list.
#[derive(Debug, Default)]
struct DetachedPool {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl DetachedPool {
    const fn handle(index: u32, generation: u32) -> u64 {
        DETACHED_TAG | ((generation as u64) << 32) | (index as u64 + 1)
    }

    const fn is_detached(raw: u64) -> bool {
        raw & DETACHED_TAG != 0
    }

    fn insert(&mut self, value: f64) -> Result<u64> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(self.slots.len())
                    .ok()
                    .filter(|&i| i < u32::MAX)
                    .ok_or(RuntimeError::AllocationFailed {
                        elements: self.slots.len() + 1,
                    })?;
                self.slots.push(Slot::default());
                index
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.value = Some(value);
        Ok(Self::handle(index, slot.generation))
    }

    /// Live slot index for `raw`.
    fn locate(&self, raw: u64) -> Result<usize> {
        let stale = RuntimeError::InvalidHandle { handle: raw };
        let low = raw & 0xFFFF_FFFF;
        if low == 0 {
            return Err(stale);
        }
        let index = usize::try_from(low - 1).map_err(|_| stale.clone())?;
        let generation = (raw & !DETACHED_TAG) >> 32;
        match self.slots.get(index) {
            Some(slot) if slot.value.is_some() && u64::from(slot.generation) == generation => {
                Ok(index)
            }
            _ => Err(stale),
        }
    }

    fn get(&self, raw: u64) -> Result<f64> {
        let index = self.locate(raw)?;
        Ok(self.slots[index].value.unwrap_or_default())
    }

    fn release_slot(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        slot.value = None;
        // a slot whose generations are used up is retired, not reused
        if slot.generation < MAX_GENERATION {
            slot.generation += 1;
            if let Ok(index) = u32::try_from(index) {
                self.free.push(index);
            }
        }
    }

    fn remove(&mut self, raw: u64) -> Result<()> {
        let index = self.locate(raw)?;
        self.release_slot(index);
        Ok(())
    }

    /// Releases every live value, keeping the slots for reuse.
    fn clear(&mut self) {
        let live = self.live();
        if live > 0 {
            debug!(live, slots = self.slots.len(), "releasing detached values");
        }
        for index in 0..self.slots.len() {
            if self.slots[index].value.is_some() {
                self.release_slot(index);
            }
        }
    }

    fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.value.is_some()).count()
    }
}

struct NativeState {
    session: Session,
    detached: DetachedPool,
    last_error: Option<RuntimeError>,
}

lazy_static::lazy_static! {
    static ref STATE: Mutex<NativeState> = Mutex::new(NativeState {
        session: Session::new(),
        detached: DetachedPool::default(),
        last_error: None,
    });
}

fn state() -> MutexGuard<'static, NativeState> {
    STATE.lock().unwrap_or_else(PoisonError::into_inner)
}

fn record(op: &'static str, err: RuntimeError) {
    warn!(op, error = %err, "native call failed");
    state().last_error = Some(err);
}

/// Unwraps `result`, recording the error and substituting `fallback`.
fn report<T>(op: &'static str, result: Result<T>, fallback: T) -> T {
    result.unwrap_or_else(|err| {
        record(op, err);
        fallback
    })
}

fn to_usize(op: &'static str, value: i64) -> Result<usize> {
    usize::try_from(value).map_err(|_| RuntimeError::invalid(op, format!("negative count {value}")))
}

#[allow(clippy::cast_sign_loss)]
const fn handle_bits(handle: i64) -> u64 {
    handle as u64
}

#[allow(clippy::cast_possible_wrap)]
const fn raw_to_handle(raw: u64) -> i64 {
    raw as i64
}

const fn to_handle(id: NodeId) -> i64 {
    raw_to_handle(id.to_raw())
}

/// Borrows the buffer behind a tensor handle.
///
/// # Safety
///
/// `handle` must be 0 or a live handle from `tg_tensor_alloc`, and no mutable
/// borrow of the same buffer may exist.
unsafe fn buffer<'a>(op: &'static str, handle: i64) -> Result<&'a TensorBuffer> {
    let ptr = handle as *const TensorBuffer;
    // SAFETY: non-null handles are pointers from `Box::into_raw` that the
    // caller keeps alive; the caller guarantees no aliasing `&mut`.
    unsafe { ptr.as_ref() }.ok_or_else(|| RuntimeError::invalid(op, "null tensor handle"))
}

/// # Safety
///
/// As [`buffer`], and no other borrow of the same buffer may exist.
unsafe fn buffer_mut<'a>(op: &'static str, handle: i64) -> Result<&'a mut TensorBuffer> {
    let ptr = handle as *mut TensorBuffer;
    // SAFETY: as in `buffer`; the caller guarantees exclusivity.
    unsafe { ptr.as_mut() }.ok_or_else(|| RuntimeError::invalid(op, "null tensor handle"))
}

type BinaryKernel = fn(&mut TensorBuffer, &TensorBuffer, &TensorBuffer, usize) -> Result<()>;

/// Runs a binary kernel, copying any input that aliases `dst` first.
///
/// # Safety
///
/// All three handles must be 0 or live tensor handles.
unsafe fn binary(op: &'static str, kernel: BinaryKernel, dst: i64, a: i64, b: i64, n: i64) {
    let run = || -> Result<()> {
        let n = to_usize(op, n)?;
        // SAFETY: handles are live per this function's contract; each shared
        // borrow ends with the clone, before `dst` is borrowed mutably.
        let a_copy = if a == dst { Some(unsafe { buffer(op, a)? }.clone()) } else { None };
        // SAFETY: as above.
        let b_copy = if b == dst { Some(unsafe { buffer(op, b)? }.clone()) } else { None };
        // SAFETY: `dst` is live and, with aliasing inputs replaced by copies,
        // borrowed exactly once.
        let out = unsafe { buffer_mut(op, dst)? };
        let a_ref = match &a_copy {
            Some(copy) => copy,
            // SAFETY: `a != dst`, so this does not alias `out`.
            None => unsafe { buffer(op, a)? },
        };
        let b_ref = match &b_copy {
            Some(copy) => copy,
            // SAFETY: `b != dst`, so this does not alias `out`.
            None => unsafe { buffer(op, b)? },
        };
        kernel(out, a_ref, b_ref, n)
    };
    report(op, run(), ());
}

/// Allocates a zeroed tensor of `n` elements and returns its handle.
///
/// Follows the configured [`AllocPolicy`](crate::config::AllocPolicy): by
/// default an allocation failure terminates the process.
#[unsafe(no_mangle)]
pub extern "C" fn tg_tensor_alloc(n: i64) -> i64 {
    let buf = to_usize("tg_tensor_alloc", n).and_then(TensorBuffer::allocate);
    report(
        "tg_tensor_alloc",
        buf.map(|b| Box::into_raw(Box::new(b)) as i64),
        0,
    )
}

/// Releases a tensor. Null is ignored.
///
/// # Safety
///
/// `handle` must be 0 or a live tensor handle, and is dead afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tg_tensor_free(handle: i64) {
    if handle != 0 {
        // SAFETY: a live handle came from `Box::into_raw` in `tg_tensor_alloc`.
        drop(unsafe { Box::from_raw(handle as *mut TensorBuffer) });
    }
}

/// # Safety
///
/// `handle` must be 0 or a live tensor handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tg_tensor_fill(handle: i64, n: i64, value: f64) {
    let run = || -> Result<()> {
        let n = to_usize("tg_tensor_fill", n)?;
        // SAFETY: forwarded contract.
        unsafe { buffer_mut("tg_tensor_fill", handle)? }.fill(n, value)
    };
    report("tg_tensor_fill", run(), ());
}

/// # Safety
///
/// All handles must be 0 or live tensor handles.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tg_tensor_add(dst: i64, a: i64, b: i64, n: i64) {
    // SAFETY: forwarded contract.
    unsafe { binary("tg_tensor_add", tensors::add, dst, a, b, n) }
}

/// # Safety
///
/// All handles must be 0 or live tensor handles.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tg_tensor_mul(dst: i64, a: i64, b: i64, n: i64) {
    // SAFETY: forwarded contract.
    unsafe { binary("tg_tensor_mul", tensors::mul, dst, a, b, n) }
}

/// # Safety
///
/// All handles must be 0 or live tensor handles.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tg_tensor_add_simd(dst: i64, a: i64, b: i64, n: i64) {
    // SAFETY: forwarded contract.
    unsafe { binary("tg_tensor_add_simd", tensors::add_simd, dst, a, b, n) }
}

/// # Safety
///
/// All handles must be 0 or live tensor handles.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tg_tensor_mul_simd(dst: i64, a: i64, b: i64, n: i64) {
    // SAFETY: forwarded contract.
    unsafe { binary("tg_tensor_mul_simd", tensors::mul_simd, dst, a, b, n) }
}

/// # Safety
///
/// `handle` must be 0 or a live tensor handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tg_tensor_sum(handle: i64, n: i64) -> f64 {
    let run = || -> Result<f64> {
        let n = to_usize("tg_tensor_sum", n)?;
        // SAFETY: forwarded contract.
        unsafe { buffer("tg_tensor_sum", handle)? }.sum(n)
    };
    report("tg_tensor_sum", run(), 0.0)
}

/// # Safety
///
/// `handle` must be 0 or a live tensor handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tg_tensor_mean(handle: i64, n: i64) -> f64 {
    let run = || -> Result<f64> {
        let n = to_usize("tg_tensor_mean", n)?;
        // SAFETY: forwarded contract.
        unsafe { buffer("tg_tensor_mean", handle)? }.mean(n)
    };
    report("tg_tensor_mean", run(), 0.0)
}

/// # Safety
///
/// `handle` must be 0 or a live tensor handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tg_tensor_get(handle: i64, index: i64) -> f64 {
    let run = || -> Result<f64> {
        let index = to_usize("tg_tensor_get", index)?;
        // SAFETY: forwarded contract.
        unsafe { buffer("tg_tensor_get", handle)? }.get(index)
    };
    report("tg_tensor_get", run(), 0.0)
}

/// # Safety
///
/// `handle` must be 0 or a live tensor handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tg_tensor_set(handle: i64, index: i64, value: f64) {
    let run = || -> Result<()> {
        let index = to_usize("tg_tensor_set", index)?;
        // SAFETY: forwarded contract.
        unsafe { buffer_mut("tg_tensor_set", handle)? }.set(index, value)
    };
    report("tg_tensor_set", run(), ());
}

#[unsafe(no_mangle)]
pub extern "C" fn tg_simd_vec4f(x: f32, y: f32, z: f32, w: f32) -> Vec4 {
    Vec4::new(x, y, z, w)
}

#[unsafe(no_mangle)]
pub extern "C" fn tg_simd_add(a: Vec4, b: Vec4) -> Vec4 {
    a + b
}

#[unsafe(no_mangle)]
pub extern "C" fn tg_simd_sub(a: Vec4, b: Vec4) -> Vec4 {
    a - b
}

#[unsafe(no_mangle)]
pub extern "C" fn tg_simd_mul(a: Vec4, b: Vec4) -> Vec4 {
    a * b
}

#[unsafe(no_mangle)]
pub extern "C" fn tg_simd_dot(a: Vec4, b: Vec4) -> f32 {
    a.dot(b)
}

#[unsafe(no_mangle)]
pub extern "C" fn tg_simd_magnitude(v: Vec4) -> f32 {
    v.magnitude()
}

#[unsafe(no_mangle)]
pub extern "C" fn tg_simd_normalize(v: Vec4) -> Vec4 {
    v.normalize()
}

#[unsafe(no_mangle)]
pub extern "C" fn tg_simd_cross(a: Vec4, b: Vec4) -> Vec4 {
    a.cross(b)
}

/// Signed range `[start, end)` as an offset and a length.
#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn signed_range(start: i64, end: i64) -> usize {
    if end <= start {
        0
    } else {
        end.abs_diff(start) as usize
    }
}

/// Calls `body(i)` for every `i` in `[start, end)` on the executor with the
/// process-wide defaults, returning after every call has finished.
#[unsafe(no_mangle)]
pub extern "C" fn tg_parallel_for(start: i64, end: i64, body: extern "C" fn(i64)) {
    let exec = ParallelExecutor::default();
    #[allow(clippy::cast_possible_wrap)]
    let result = exec.execute_isolated(0, signed_range(start, end), |i| body(start + i as i64));
    report("tg_parallel_for", result, ());
}

/// Maps `len` integers through `mapper` into a new array, released with
/// [`tg_parallel_map_free`]. Returns null for an empty or invalid input.
///
/// # Safety
///
/// `input` must point to `len` readable `i64`s.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tg_parallel_map(
    input: *const i64,
    len: i64,
    mapper: extern "C" fn(i64) -> i64,
) -> *mut i64 {
    let run = || -> Result<*mut i64> {
        let len = to_usize("tg_parallel_map", len)?;
        if len == 0 {
            return Ok(core::ptr::null_mut());
        }
        if input.is_null() {
            return Err(RuntimeError::invalid("tg_parallel_map", "null input"));
        }
        // SAFETY: the caller guarantees `len` readable elements at `input`.
        let input = unsafe { core::slice::from_raw_parts(input, len) };
        let out = ParallelExecutor::default().parallel_map(input, |&x| mapper(x));
        Ok(Box::into_raw(out.into_boxed_slice()).cast::<i64>())
    };
    report("tg_parallel_map", run(), core::ptr::null_mut())
}

/// Releases an array from [`tg_parallel_map`].
///
/// # Safety
///
/// `output` must be null or a pointer returned by `tg_parallel_map` for an
/// input of exactly `len` elements, not yet released.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tg_parallel_map_free(output: *mut i64, len: i64) {
    let Ok(len) = usize::try_from(len) else {
        return;
    };
    if output.is_null() || len == 0 {
        return;
    }
    // SAFETY: `output` is the boxed slice of `len` elements leaked by
    // `tg_parallel_map`.
    drop(unsafe { Box::from_raw(core::ptr::slice_from_raw_parts_mut(output, len)) });
}

/// Folds `len` integers with `reducer`, seeding every partition and the final
/// fold with `initial`.
///
/// # Safety
///
/// `input` must point to `len` readable `i64`s.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tg_parallel_reduce(
    input: *const i64,
    len: i64,
    reducer: extern "C" fn(i64, i64) -> i64,
    initial: i64,
) -> i64 {
    let run = || -> Result<i64> {
        let len = to_usize("tg_parallel_reduce", len)?;
        if len == 0 {
            return Ok(initial);
        }
        if input.is_null() {
            return Err(RuntimeError::invalid("tg_parallel_reduce", "null input"));
        }
        // SAFETY: the caller guarantees `len` readable elements at `input`.
        let input = unsafe { core::slice::from_raw_parts(input, len) };
        Ok(ParallelExecutor::default().parallel_reduce(input, initial, |a, b| reducer(a, b)))
    };
    report("tg_parallel_reduce", run(), initial)
}

/// Sets the process-wide sequential threshold and worker cap. A negative
/// argument keeps the current value.
#[unsafe(no_mangle)]
pub extern "C" fn tg_parallel_configure(sequential_threshold: i64, max_workers: i64) {
    let current = executor_defaults();
    let threshold = usize::try_from(sequential_threshold).unwrap_or(current.sequential_threshold);
    let workers = usize::try_from(max_workers).unwrap_or(current.max_workers);
    set_executor_defaults(
        ExecutorConfig::new()
            .with_sequential_threshold(threshold)
            .with_max_workers(workers),
    );
}

impl NativeState {
    fn resolve(&self, handle: i64) -> Result<Var> {
        let raw = handle_bits(handle);
        if DetachedPool::is_detached(raw) {
            return self.detached.get(raw).map(Var::Detached);
        }
        NodeId::from_raw(raw)
            .map(Var::Tracked)
            .ok_or(RuntimeError::InvalidHandle { handle: raw })
    }

    fn publish(&mut self, var: Var) -> Result<i64> {
        match var {
            Var::Tracked(id) => Ok(to_handle(id)),
            Var::Detached(x) => self.detached.insert(x).map(raw_to_handle),
        }
    }

    fn apply(&mut self, op: Op, l: i64, r: Option<i64>) -> Result<i64> {
        let l = self.resolve(l)?;
        let r = r.map(|h| self.resolve(h)).transpose()?;
        let out = self.session.apply(op, l, r)?;
        self.publish(out)
    }
}

/// Starts a recording session, discarding any active one, and releases every
/// detached value.
#[unsafe(no_mangle)]
pub extern "C" fn tg_grad_begin() {
    let result = {
        let mut st = state();
        st.detached.clear();
        st.session.begin()
    };
    report("tg_grad_begin", result, ());
}

/// Ends the recording session, freeing its graph, and releases every detached
/// value.
#[unsafe(no_mangle)]
pub extern "C" fn tg_grad_end() {
    let mut st = state();
    st.session.end();
    st.detached.clear();
}

/// Releases a detached value so its slot can be reused. Null and tracked
/// handles are ignored; tracked nodes live until the session ends.
#[unsafe(no_mangle)]
pub extern "C" fn tg_var_free(handle: i64) {
    let raw = handle_bits(handle);
    if !DetachedPool::is_detached(raw) {
        return;
    }
    let result = state().detached.remove(raw);
    report("tg_var_free", result, ());
}

/// A differentiable leaf while recording, a detached value otherwise.
#[unsafe(no_mangle)]
pub extern "C" fn tg_make_var(value: f64) -> i64 {
    let result = {
        let mut st = state();
        st.session.make_var(value).and_then(|v| st.publish(v))
    };
    report("tg_make_var", result, 0)
}

fn native_apply(name: &'static str, op: Op, l: i64, r: Option<i64>) -> i64 {
    let result = state().apply(op, l, r);
    report(name, result, 0)
}

macro_rules! native_binary {
    ($($name:ident => $op:ident),* $(,)?) => {$(
        #[unsafe(no_mangle)]
        pub extern "C" fn $name(a: i64, b: i64) -> i64 {
            native_apply(stringify!($name), Op::$op, a, Some(b))
        }
    )*};
}

macro_rules! native_unary {
    ($($name:ident => $op:ident),* $(,)?) => {$(
        #[unsafe(no_mangle)]
        pub extern "C" fn $name(a: i64) -> i64 {
            native_apply(stringify!($name), Op::$op, a, None)
        }
    )*};
}

native_binary! {
    tg_var_add => Add,
    tg_var_sub => Sub,
    tg_var_mul => Mul,
    tg_var_div => Div,
    tg_var_pow => Pow,
    tg_var_matmul => MatMul,
}

native_unary! {
    tg_var_exp => Exp,
    tg_var_log => Log,
    tg_var_sin => Sin,
    tg_var_cos => Cos,
}

/// Backpropagates from `output`. Null and detached outputs are no-ops.
#[unsafe(no_mangle)]
pub extern "C" fn tg_backward(output: i64) {
    if output == 0 {
        return;
    }
    let result = {
        let mut st = state();
        st.resolve(output).and_then(|v| st.session.backward(v))
    };
    report("tg_backward", result, ());
}

/// Forward value of a variable; `0.0` for null or stale handles.
#[unsafe(no_mangle)]
pub extern "C" fn tg_var_value(handle: i64) -> f64 {
    if handle == 0 {
        return 0.0;
    }
    let result = {
        let st = state();
        st.resolve(handle).and_then(|v| st.session.value(v))
    };
    report("tg_var_value", result, 0.0)
}

/// Accumulated gradient of a variable; `0.0` for null, detached or stale
/// handles.
#[unsafe(no_mangle)]
pub extern "C" fn tg_var_grad(handle: i64) -> f64 {
    if handle == 0 {
        return 0.0;
    }
    let result = {
        let st = state();
        st.resolve(handle).and_then(|v| st.session.grad(v))
    };
    report("tg_var_grad", result, 0.0)
}

/// Code of the most recent recorded error, `0` if none.
#[unsafe(no_mangle)]
pub extern "C" fn tg_last_error() -> i64 {
    state().last_error.as_ref().map_or(0, RuntimeError::code)
}

#[unsafe(no_mangle)]
pub extern "C" fn tg_clear_error() {
    state().last_error = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    static SERIAL: Mutex<()> = Mutex::new(());

    fn serial() -> MutexGuard<'static, ()> {
        let guard = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        tg_clear_error();
        guard
    }

    #[test]
    fn detached_pool_stays_bounded_when_values_are_freed() {
        let _g = serial();
        tg_grad_end();
        let before = state().detached.slots.len();
        for i in 0..10_000i32 {
            let x = tg_make_var(f64::from(i));
            assert!(x < 0);
            let y = tg_var_mul(x, x);
            assert_eq!(tg_var_value(y), f64::from(i) * f64::from(i));
            tg_var_free(x);
            tg_var_free(y);
        }
        let st = state();
        assert!(st.detached.slots.len() <= before.max(2));
        assert_eq!(st.detached.live(), 0);
        assert!(st.last_error.is_none());
    }

    #[test]
    fn freed_detached_handles_go_stale() {
        let _g = serial();
        tg_grad_end();
        let h = tg_make_var(2.0);
        tg_var_free(h);
        assert_eq!(tg_var_value(h), 0.0);
        assert_eq!(tg_last_error(), 6);
        tg_clear_error();

        // the slot is reused under a new generation
        let again = tg_make_var(3.0);
        assert_ne!(again, h);
        assert_eq!(tg_var_value(again), 3.0);
        assert_eq!(tg_var_value(h), 0.0);
        tg_clear_error();

        tg_var_free(h);
        assert_eq!(tg_last_error(), 6);
        tg_clear_error();
        tg_var_free(again);
        assert_eq!(tg_last_error(), 0);
    }

    #[test]
    fn begin_and_end_release_detached_values() {
        let _g = serial();
        tg_grad_end();
        let h = tg_make_var(5.0);
        tg_grad_begin();
        assert_eq!(state().detached.live(), 0);
        assert_eq!(tg_var_value(h), 0.0);
        assert_eq!(tg_last_error(), 6);
        tg_grad_end();
        tg_clear_error();
    }

    #[test]
    fn matmul_entry_point_differentiates_like_mul() {
        let _g = serial();
        tg_grad_begin();
        let a = tg_make_var(3.0);
        let b = tg_make_var(4.0);
        assert!(a > 0 && b > 0);
        let m = tg_var_matmul(a, b);
        assert_eq!(tg_var_value(m), 12.0);
        tg_backward(m);
        // tracked handles are owned by the session
        tg_var_free(a);
        assert_eq!(tg_var_grad(a), 4.0);
        assert_eq!(tg_var_grad(b), 3.0);
        assert_eq!(tg_last_error(), 0);
        tg_grad_end();
    }

    #[test]
    fn exhausted_slots_are_retired() {
        let mut pool = DetachedPool::default();
        pool.insert(1.0).unwrap();
        pool.slots[0].generation = MAX_GENERATION;
        let h = DetachedPool::handle(0, MAX_GENERATION);
        assert_eq!(pool.get(h), Ok(1.0));
        pool.remove(h).unwrap();
        assert!(pool.free.is_empty());

        let next = pool.insert(2.0).unwrap();
        assert_eq!(pool.slots.len(), 2);
        assert!(pool.get(h).is_err());
        assert_eq!(pool.get(next), Ok(2.0));
        assert!(DetachedPool::is_detached(next));
        assert!(pool.get(DETACHED_TAG).is_err());
    }
}
