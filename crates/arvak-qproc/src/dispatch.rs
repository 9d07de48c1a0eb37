//! Range partitioning over a fixed worker pool.

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

use crate::error::QprocResult;

/// Split `[begin, end)` into at most `n_workers` contiguous sub-ranges.
///
/// Sizes differ by at most one; the first `len % parts` sub-ranges take the
/// extra element. An empty range yields no sub-ranges.
pub fn partition(begin: u64, end: u64, n_workers: usize) -> Vec<(u64, u64)> {
    let len = end.saturating_sub(begin);
    if len == 0 || n_workers == 0 {
        return Vec::new();
    }
    let parts = (n_workers as u64).min(len);
    let base = len / parts;
    let remainder = len % parts;

    let mut ranges = Vec::with_capacity(parts as usize);
    let mut cursor = begin;
    for part in 0..parts {
        let size = base + u64::from(part < remainder);
        ranges.push((cursor, cursor + size));
        cursor += size;
    }
    ranges
}

/// Runs range operations on a fixed pool and joins before returning.
///
/// Each sub-range is owned by exactly one task, which is what lets kernels
/// write the state vector without locks.
pub struct ParallelDispatcher {
    pool: ThreadPool,
    n_workers: usize,
}

impl ParallelDispatcher {
    /// Create a dispatcher with `n_workers` threads, or one per available
    /// hardware thread when `None`.
    pub fn new(n_workers: Option<usize>) -> QprocResult<Self> {
        let n_workers = n_workers.unwrap_or_else(default_workers).max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(n_workers)
            .thread_name(|idx| format!("arvak-qproc-{idx}"))
            .build()?;
        debug!(n_workers, "parallel dispatcher started");
        Ok(Self { pool, n_workers })
    }

    /// Number of worker threads.
    pub fn n_workers(&self) -> usize {
        self.n_workers
    }

    /// Run `op(worker_idx, sub_begin, sub_end)` once per sub-range.
    pub fn distribute<F>(&self, op: F, begin: u64, end: u64)
    where
        F: Fn(usize, u64, u64) + Sync,
    {
        self.distribute_collect(op, begin, end);
    }

    /// Like [`distribute`](Self::distribute), returning every sub-range's
    /// result in sub-range order.
    pub fn distribute_collect<T, F>(&self, op: F, begin: u64, end: u64) -> Vec<T>
    where
        T: Send,
        F: Fn(usize, u64, u64) -> T + Sync,
    {
        let ranges = partition(begin, end, self.n_workers);
        if ranges.len() <= 1 {
            return ranges
                .into_iter()
                .map(|(b, e)| op(0, b, e))
                .collect();
        }
        self.pool.install(|| {
            ranges
                .into_par_iter()
                .enumerate()
                .map(|(idx, (b, e))| op(idx, b, e))
                .collect()
        })
    }

    /// Split `data` the same way [`partition`] splits its index range and
    /// hand each task exclusive access to its piece, along with the piece's
    /// offset in `data`.
    pub fn distribute_mut<T, F>(&self, data: &mut [T], op: F)
    where
        T: Send,
        F: Fn(usize, u64, &mut [T]) + Sync,
    {
        let ranges = partition(0, data.len() as u64, self.n_workers);
        let mut pieces = Vec::with_capacity(ranges.len());
        let mut rest = data;
        for (b, e) in ranges {
            let (piece, tail) = std::mem::take(&mut rest).split_at_mut((e - b) as usize);
            pieces.push((b, piece));
            rest = tail;
        }
        if pieces.len() <= 1 {
            for (offset, piece) in pieces {
                op(0, offset, piece);
            }
            return;
        }
        self.pool.install(|| {
            pieces
                .into_par_iter()
                .enumerate()
                .for_each(|(idx, (offset, piece))| op(idx, offset, piece));
        });
    }

    /// Run `op(worker_idx)` for every worker index.
    pub fn run<F>(&self, op: F)
    where
        F: Fn(usize) + Sync,
    {
        self.run_collect(op);
    }

    /// Run `op(worker_idx)` for every worker index, returning the results in
    /// worker order.
    pub fn run_collect<T, F>(&self, op: F) -> Vec<T>
    where
        T: Send,
        F: Fn(usize) -> T + Sync,
    {
        self.pool
            .install(|| (0..self.n_workers).into_par_iter().map(&op).collect())
    }
}

pub(crate) fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    #[test]
    fn test_partition_remainder_goes_first() {
        assert_eq!(
            partition(0, 10, 4),
            vec![(0, 3), (3, 6), (6, 8), (8, 10)]
        );
        assert_eq!(partition(5, 7, 4), vec![(5, 6), (6, 7)]);
        assert!(partition(3, 3, 4).is_empty());
    }

    #[test]
    fn test_partition_covers_range() {
        for (begin, end, w) in [(0u64, 1u64, 8usize), (7, 1000, 3), (0, 64, 64), (1, 2, 1)] {
            let ranges = partition(begin, end, w);
            assert!(ranges.len() <= w);
            assert_eq!(ranges.first().map(|r| r.0), Some(begin));
            assert_eq!(ranges.last().map(|r| r.1), Some(end));
            for pair in ranges.windows(2) {
                assert_eq!(pair[0].1, pair[1].0);
            }
        }
    }

    #[test]
    fn test_distribute_visits_each_index_once() {
        let dispatcher = ParallelDispatcher::new(Some(4)).unwrap();
        let sum = AtomicU64::new(0);
        dispatcher.distribute(
            |_, b, e| {
                sum.fetch_add((b..e).sum::<u64>(), Ordering::Relaxed);
            },
            0,
            1001,
        );
        assert_eq!(sum.load(Ordering::Relaxed), 1000 * 1001 / 2);
    }

    #[test]
    fn test_collect_preserves_order() {
        let dispatcher = ParallelDispatcher::new(Some(3)).unwrap();
        let spans = dispatcher.distribute_collect(|_, b, e| (b, e), 0, 8);
        assert_eq!(spans, vec![(0, 3), (3, 6), (6, 8)]);
    }

    #[test]
    fn test_distribute_mut_hands_out_disjoint_pieces() {
        let dispatcher = ParallelDispatcher::new(Some(3)).unwrap();
        let mut data = vec![0u64; 10];
        dispatcher.distribute_mut(&mut data, |_, offset, piece| {
            for (i, v) in piece.iter_mut().enumerate() {
                *v = offset + i as u64;
            }
        });
        assert_eq!(data, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_run_calls_every_worker() {
        let dispatcher = ParallelDispatcher::new(Some(5)).unwrap();
        let calls = AtomicUsize::new(0);
        dispatcher.run(|_| {
            calls.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(calls.load(Ordering::Relaxed), 5);
    }
}
