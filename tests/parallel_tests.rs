use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tapegrad::tensors::{par_add, par_sum, TensorBuffer};
use tapegrad::{ExecutorConfig, ParallelExecutor, RuntimeError};

fn executors() -> Vec<ParallelExecutor> {
    [1, 2, 3, 7, 16, 64]
        .into_iter()
        .map(|w| ParallelExecutor::new(ExecutorConfig::new().with_max_workers(w)))
        .collect()
}

#[test]
fn test_empty_ranges_do_nothing() {
    let calls = AtomicUsize::new(0);
    for exec in executors() {
        exec.execute(0, 0, |_| {
            calls.fetch_add(1, Ordering::Relaxed);
        });
        exec.execute(5, 5, |_| {
            calls.fetch_add(1, Ordering::Relaxed);
        });
    }
    assert_eq!(calls.load(Ordering::Relaxed), 0);
}

#[test]
fn test_execute_matches_sequential_for_every_worker_count() {
    let want: Vec<i64> = (0..1000).collect();
    for exec in executors() {
        let out: Vec<AtomicI64> = (0..1000).map(|_| AtomicI64::new(-1)).collect();
        exec.execute(0, 1000, |i| out[i].store(i as i64, Ordering::Relaxed));
        let got: Vec<i64> = out.iter().map(|x| x.load(Ordering::Relaxed)).collect();
        assert_eq!(got, want, "{exec:?}");
    }
}

#[test]
fn test_for_each_mut_writes_disjoint_slices() {
    for exec in executors() {
        let mut out = vec![0usize; 1234];
        exec.for_each_mut(&mut out, |i, x| *x = i * 3);
        assert!(out.iter().enumerate().all(|(i, &x)| x == i * 3));
    }
}

#[test]
fn test_reduce_max_is_partition_independent() {
    let input = [3.0, 1.0, 4.0, 1.0, 5.0, 9.0, 2.0, 6.0];
    for workers in 1..=8 {
        let exec = ParallelExecutor::new(
            ExecutorConfig::new()
                .with_sequential_threshold(0)
                .with_max_workers(workers),
        );
        assert_eq!(exec.plan(0, input.len()).len(), workers);
        let max = exec.parallel_reduce(&input, f64::NEG_INFINITY, f64::max);
        assert_eq!(max, 9.0, "workers = {workers}");
    }
}

#[test]
fn test_map_preserves_order() {
    let input: Vec<i64> = (0..777).collect();
    for exec in executors() {
        let out = exec.parallel_map(&input, |&x| x * x - 1);
        assert_eq!(out.len(), input.len());
        assert!(out.iter().zip(&input).all(|(&y, &x)| y == x * x - 1));
    }
}

#[test]
fn test_isolated_panics_become_errors() {
    let exec = ParallelExecutor::new(ExecutorConfig::new().with_max_workers(4));
    let finished = AtomicUsize::new(0);
    let result = exec.execute_isolated(0, 400, |i| {
        if i == 250 {
            panic!("bad index {i}");
        }
        finished.fetch_add(1, Ordering::Relaxed);
    });
    assert_eq!(
        result,
        Err(RuntimeError::WorkerFailed {
            worker: 2,
            message: "bad index 250".to_owned()
        })
    );
    // the other three partitions ran to completion
    assert!(finished.load(Ordering::Relaxed) >= 300);
}

#[test]
fn test_panic_in_plain_execute_reaches_caller() {
    let exec = ParallelExecutor::new(ExecutorConfig::new().with_max_workers(4));
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        exec.execute(0, 400, |i| assert_ne!(i, 399));
    }));
    assert!(result.is_err());
}

/// Records the current thread and waits up to a few seconds for a second one.
fn note_thread(seen: &Mutex<Vec<ThreadId>>) {
    let me = thread::current().id();
    {
        let mut seen = seen.lock().unwrap();
        if !seen.contains(&me) {
            seen.push(me);
        }
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    while seen.lock().unwrap().len() < 2 && Instant::now() < deadline {
        thread::yield_now();
    }
}

#[test]
fn test_partitions_run_on_pool_threads() {
    let exec = ParallelExecutor::with_dedicated_pool(
        ExecutorConfig::new()
            .with_sequential_threshold(0)
            .with_max_workers(4),
    )
    .unwrap();
    let caller = thread::current().id();

    let seen = Mutex::new(Vec::new());
    let mut data = vec![0u32; 4000];
    exec.for_each_chunk_mut(&mut data, |offset, chunk| {
        note_thread(&seen);
        chunk.fill(u32::try_from(offset).unwrap());
    });
    let threads = seen.into_inner().unwrap();
    assert!(threads.len() > 1, "chunks ran on {} thread(s)", threads.len());
    assert!(!threads.contains(&caller));
    assert_eq!(data[0], 0);
    assert_eq!(data[3999], 3000);

    let seen = Mutex::new(Vec::new());
    let lens = exec.map_partitions(0, 4000, |p| {
        note_thread(&seen);
        p.len()
    });
    assert_eq!(lens, vec![1000; 4]);
    assert!(seen.into_inner().unwrap().len() > 1);
}

#[test]
fn test_par_kernels_on_dedicated_pool() {
    let exec = ParallelExecutor::with_dedicated_pool(ExecutorConfig::new().with_max_workers(4))
        .unwrap();
    let n = 100_000;
    let a = TensorBuffer::from_vec(vec![1.5; n]);
    let b = TensorBuffer::from_vec(vec![2.5; n]);
    let mut dst = TensorBuffer::try_allocate(n).unwrap();
    par_add(&exec, &mut dst, &a, &b, n).unwrap();
    assert!(dst.as_slice().iter().all(|&x| x == 4.0));
    assert_eq!(par_sum(&exec, &dst, n).unwrap(), 400_000.0);

    let threads = Mutex::new(Vec::new());
    exec.execute(0, n, |i| {
        if i % 25_000 == 0 {
            note_thread(&threads);
        }
    });
    assert!(threads.into_inner().unwrap().len() > 1);
}
