//! Partitioned parallel execution over index ranges.
//!
//! # Parallel Executor
//!
//! [`ParallelExecutor::execute`] applies a body to every index of `[start, end)`:
//!
//! - Ranges shorter than the sequential threshold (100 by default), or that
//!   reduce to a single worker, run on the calling thread.
//! - Otherwise the range is cut into `min(range, max_workers)` contiguous
//!   partitions (16 workers at most by default). Each partition holds
//!   `range / workers` indices, and the first `range % workers` partitions
//!   hold one more.
//! - Every partition runs as its own job inside a `rayon` scope, and the call
//!   returns only after all of them have finished (a full barrier).
//!
//! There is no ordering between indices and no fixed index-to-thread mapping.
//! Bodies must not depend on each other and must write to disjoint memory;
//! [`ParallelExecutor::for_each_mut`] gives a safe way to do the latter.
//!
//! ## Failures
//!
//! [`ParallelExecutor::try_execute`] returns the error of the lowest-numbered
//! failing partition, after the barrier. A panicking body is re-raised on the
//! caller once every other partition has finished, unless it runs under
//! [`ParallelExecutor::execute_isolated`], which reports it as
//! [`RuntimeError::WorkerFailed`] instead.
//!
//! ## Reductions
//!
//! [`ParallelExecutor::parallel_reduce`] seeds every partition with `init` and
//! folds the partial results starting from `init` again, so `init` takes part
//! once per partition plus once more. Only reducers for which `init` is a true
//! identity give partition-independent results.

use crate::error::{Result, RuntimeError};
use core::convert::Infallible;
use std::sync::Arc;
use tracing::debug;

/// Tuning knobs of a [`ParallelExecutor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Ranges with fewer indices than this run sequentially.
    pub sequential_threshold: usize,
    /// Upper bound on the number of partitions (and workers) per call.
    pub max_workers: usize,
}

impl ExecutorConfig {
    pub const DEFAULT_THRESHOLD: usize = 100;
    pub const DEFAULT_MAX_WORKERS: usize = 16;

    /// The built-in defaults: threshold 100, 16 workers.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sequential_threshold: Self::DEFAULT_THRESHOLD,
            max_workers: Self::DEFAULT_MAX_WORKERS,
        }
    }

    #[must_use]
    pub const fn with_sequential_threshold(mut self, threshold: usize) -> Self {
        self.sequential_threshold = threshold;
        self
    }

    /// Sets the worker cap. Zero is treated as one.
    #[must_use]
    pub const fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = if workers == 0 { 1 } else { workers };
        self
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// A contiguous slice of the index range handed to one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub worker: usize,
    pub start: usize,
    pub end: usize,
}

impl Partition {
    #[must_use]
    pub const fn len(&self) -> usize {
        self.end - self.start
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Splits index ranges across workers and waits for all of them.
#[derive(Clone)]
pub struct ParallelExecutor {
    config: ExecutorConfig,
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl core::fmt::Debug for ParallelExecutor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ParallelExecutor")
            .field("config", &self.config)
            .field("dedicated_pool", &self.pool.is_some())
            .finish()
    }
}

impl Default for ParallelExecutor {
    /// An executor on the shared `rayon` pool using the process-wide defaults
    /// from [`config::executor_defaults`](crate::config::executor_defaults).
    fn default() -> Self {
        Self::new(crate::config::executor_defaults())
    }
}

impl ParallelExecutor {
    /// An executor that runs its partitions on the shared `rayon` pool.
    #[must_use]
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config, pool: None }
    }

    /// An executor with its own pool of exactly `config.max_workers` threads.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::ExecutorUnavailable`] if the threads cannot be spawned.
    pub fn with_dedicated_pool(config: ExecutorConfig) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.max_workers.max(1))
            .thread_name(|i| format!("tapegrad-worker-{i}"))
            .build()
            .map_err(|e| RuntimeError::ExecutorUnavailable { why: e.to_string() })?;
        Ok(Self {
            config,
            pool: Some(Arc::new(pool)),
        })
    }

    /// How `[start, end)` is split across workers.
    ///
    /// Empty for an empty range, a single partition when the range runs
    /// sequentially, otherwise one contiguous partition per worker.
    #[must_use]
    pub fn plan(&self, start: usize, end: usize) -> Vec<Partition> {
        if end <= start {
            return Vec::new();
        }
        let range = end - start;
        let workers = range.min(self.config.max_workers.max(1));
        if workers == 1 || range < self.config.sequential_threshold {
            return vec![Partition {
                worker: 0,
                start,
                end,
            }];
        }

        let chunk = range / workers;
        let remainder = range % workers;
        let mut parts = Vec::with_capacity(workers);
        let mut cursor = start;
        for worker in 0..workers {
            let len = chunk + usize::from(worker < remainder);
            parts.push(Partition {
                worker,
                start: cursor,
                end: cursor + len,
            });
            cursor += len;
        }
        debug!(range, workers, chunk, remainder, "partitioned range");
        parts
    }

    /// Runs one job per partition and blocks until all have returned.
    fn run_scoped<'env, J>(&self, jobs: Vec<J>)
    where
        J: FnOnce() + Send + 'env,
    {
        let spawn_all = |s: &rayon::Scope<'env>| {
            for job in jobs {
                s.spawn(move |_| job());
            }
        };
        match &self.pool {
            Some(pool) => pool.scope(spawn_all),
            None => rayon::scope(spawn_all),
        }
    }

    /// Applies `body(i)` for every `i` in `[start, end)`.
    pub fn execute<F>(&self, start: usize, end: usize, body: F)
    where
        F: Fn(usize) + Sync,
    {
        let result = self.try_execute::<_, Infallible>(start, end, |i| {
            body(i);
            Ok(())
        });
        match result {
            Ok(()) => {}
            Err(never) => match never {},
        }
    }

    /// Applies a fallible `body(i)` for every `i` in `[start, end)`.
    ///
    /// A partition stops at its first error; other partitions run to
    /// completion. After the barrier, the error of the lowest-numbered failing
    /// partition is returned.
    ///
    /// # Errors
    ///
    /// The first error produced by `body`, in partition order.
    pub fn try_execute<F, E>(&self, start: usize, end: usize, body: F) -> Result<(), E>
    where
        F: Fn(usize) -> Result<(), E> + Sync,
        E: Send,
    {
        self.run_partitions(&self.plan(start, end), |part| {
            (part.start..part.end).try_for_each(&body)
        })
    }

    /// Like [`ParallelExecutor::execute`], but a panicking body is caught
    /// inside its partition instead of unwinding into the caller.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::WorkerFailed`] for the lowest-numbered partition that
    /// panicked, after every partition has finished.
    pub fn execute_isolated<F>(&self, start: usize, end: usize, body: F) -> Result<()>
    where
        F: Fn(usize) + Sync,
    {
        self.run_partitions(&self.plan(start, end), |part| {
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                (part.start..part.end).for_each(&body);
            }))
            .map_err(|payload| {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_owned());
                RuntimeError::WorkerFailed {
                    worker: part.worker,
                    message,
                }
            })
        })
    }

    /// Runs `job` once per partition, inline when there is only one.
    fn run_partitions<F, E>(&self, parts: &[Partition], job: F) -> Result<(), E>
    where
        F: Fn(&Partition) -> Result<(), E> + Sync,
        E: Send,
    {
        match parts {
            [] => return Ok(()),
            [only] => return job(only),
            _ => {}
        }

        let mut failures: Vec<Option<E>> = parts.iter().map(|_| None).collect();
        let job = &job;
        let jobs: Vec<_> = parts
            .iter()
            .zip(failures.iter_mut())
            .map(|(part, slot)| {
                move || {
                    if let Err(e) = job(part) {
                        *slot = Some(e);
                    }
                }
            })
            .collect();
        self.run_scoped(jobs);

        match failures.into_iter().flatten().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Runs `f` once per planned partition of `[start, end)` and returns the
    /// results in partition order.
    ///
    /// Each partition is its own job, so the sequential threshold applies to
    /// the index range, not to the number of partitions.
    pub fn map_partitions<U, F>(&self, start: usize, end: usize, f: F) -> Vec<U>
    where
        U: Send,
        F: Fn(&Partition) -> U + Sync,
    {
        let parts = self.plan(start, end);
        if parts.len() <= 1 {
            return parts.iter().map(f).collect();
        }

        let f = &f;
        let mut slots: Vec<Option<U>> = parts.iter().map(|_| None).collect();
        let jobs: Vec<_> = parts
            .iter()
            .zip(slots.iter_mut())
            .map(|(part, slot)| move || *slot = Some(f(part)))
            .collect();
        self.run_scoped(jobs);
        slots.into_iter().flatten().collect()
    }

    /// Cuts `items` into the planned partitions and calls `body(offset, chunk)`
    /// once per partition, where `offset` is the chunk's first index.
    pub fn for_each_chunk_mut<T, F>(&self, items: &mut [T], body: F)
    where
        T: Send,
        F: Fn(usize, &mut [T]) + Sync,
    {
        let parts = self.plan(0, items.len());
        match parts.as_slice() {
            [] => return,
            [only] => return body(only.start, items),
            _ => {}
        }

        let body = &body;
        let mut rest = items;
        let mut jobs = Vec::with_capacity(parts.len());
        for part in &parts {
            let (head, tail) = core::mem::take(&mut rest).split_at_mut(part.len());
            rest = tail;
            let offset = part.start;
            jobs.push(move || body(offset, head));
        }
        self.run_scoped(jobs);
    }

    /// Applies `body(i, &mut items[i])` to every element, partitioning the
    /// slice into disjoint sub-slices, one per worker.
    pub fn for_each_mut<T, F>(&self, items: &mut [T], body: F)
    where
        T: Send,
        F: Fn(usize, &mut T) + Sync,
    {
        self.for_each_chunk_mut(items, |offset, chunk| {
            chunk
                .iter_mut()
                .enumerate()
                .for_each(|(i, x)| body(offset + i, x));
        });
    }

    /// Maps every element of `input` through `f`, preserving order.
    pub fn parallel_map<T, U, F>(&self, input: &[T], f: F) -> Vec<U>
    where
        T: Sync,
        U: Send,
        F: Fn(&T) -> U + Sync,
    {
        let pieces = self.map_partitions(0, input.len(), |part| {
            input[part.start..part.end].iter().map(&f).collect::<Vec<U>>()
        });
        pieces.into_iter().flatten().collect()
    }

    /// Folds `input` with `reducer`, seeding each partition and the final fold
    /// with `init`.
    ///
    /// Returns `init` for an empty input.
    pub fn parallel_reduce<T, F>(&self, input: &[T], init: T, reducer: F) -> T
    where
        T: Clone + Send + Sync,
        F: Fn(T, T) -> T + Sync,
    {
        let partials = self.map_partitions(0, input.len(), |part| {
            input[part.start..part.end]
                .iter()
                .cloned()
                .fold(init.clone(), &reducer)
        });
        partials.into_iter().fold(init, &reducer)
    }
}
