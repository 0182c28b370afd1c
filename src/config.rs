//! Process-wide runtime configuration.
//!
//! Two knobs live here:
//!
//! - [`AllocPolicy`]: what happens when a tensor allocation fails.
//! - Executor defaults: the sequential threshold and worker cap used by
//!   [`ParallelExecutor::default`](crate::parallel::ParallelExecutor) and by
//!   the native entry points.
//!
//! Both are stored in atomics so they can be read from worker threads without
//! locking. They are expected to change rarely (at startup, or from tests),
//! never in the middle of a hot loop.

use crate::parallel::ExecutorConfig;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Policy applied when an allocation cannot be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum AllocPolicy {
    /// Log a diagnostic and abort the process (default).
    #[default]
    FailFast = 0,
    /// Surface [`RuntimeError::AllocationFailed`](crate::RuntimeError) to the caller.
    Report,
}

impl TryFrom<u8> for AllocPolicy {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::FailFast),
            1 => Ok(Self::Report),
            _ => Err(()),
        }
    }
}

static ALLOC_POLICY: AtomicU8 = AtomicU8::new(AllocPolicy::FailFast as u8);

static EXECUTOR_THRESHOLD: AtomicUsize = AtomicUsize::new(ExecutorConfig::DEFAULT_THRESHOLD);
static EXECUTOR_MAX_WORKERS: AtomicUsize = AtomicUsize::new(ExecutorConfig::DEFAULT_MAX_WORKERS);

/// Sets the allocation-failure policy.
///
/// # Example
///
/// ```
/// use tapegrad::config::{set_alloc_policy, alloc_policy, AllocPolicy};
/// set_alloc_policy(AllocPolicy::Report);
/// assert_eq!(alloc_policy(), AllocPolicy::Report);
/// set_alloc_policy(AllocPolicy::FailFast);
/// ```
pub fn set_alloc_policy(policy: AllocPolicy) {
    ALLOC_POLICY.store(policy as u8, Ordering::Release);
}

/// Returns the current allocation-failure policy.
///
/// An unrecognized stored value reads back as [`AllocPolicy::FailFast`].
pub fn alloc_policy() -> AllocPolicy {
    AllocPolicy::try_from(ALLOC_POLICY.load(Ordering::Acquire)).unwrap_or_default()
}

/// Overrides the executor defaults picked up by `ParallelExecutor::default()`.
pub fn set_executor_defaults(config: ExecutorConfig) {
    EXECUTOR_THRESHOLD.store(config.sequential_threshold, Ordering::Release);
    EXECUTOR_MAX_WORKERS.store(config.max_workers, Ordering::Release);
}

/// Current executor defaults.
pub fn executor_defaults() -> ExecutorConfig {
    ExecutorConfig::new()
        .with_sequential_threshold(EXECUTOR_THRESHOLD.load(Ordering::Acquire))
        .with_max_workers(EXECUTOR_MAX_WORKERS.load(Ordering::Acquire))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_policy_round_trips_through_u8() {
        assert_eq!(AllocPolicy::try_from(0), Ok(AllocPolicy::FailFast));
        assert_eq!(AllocPolicy::try_from(1), Ok(AllocPolicy::Report));
        assert_eq!(AllocPolicy::try_from(7), Err(()));
    }

    #[test]
    fn executor_defaults_start_at_documented_constants() {
        // other tests never touch the executor defaults
        let cfg = executor_defaults();
        assert_eq!(cfg.sequential_threshold, 100);
        assert_eq!(cfg.max_workers, 16);
    }
}
