//! Chunked state vectors.
//!
//! A register of `n` lanes holds `2^n` amplitudes split into equally sized
//! power-of-two chunks. Chunk `k` covers global indices
//! `[k << shift, (k + 1) << shift)`, so the chunks partition the index space
//! without gaps or overlaps and every global index has exactly one
//! `(chunk, local)` location.

use num_complex::Complex;
use std::ops::Range;
use std::sync::Arc;

use crate::error::QprocResult;
use crate::pool::{Affinity, ChunkBuffer, ChunkPool};
use crate::precision::{Precision, Real};

struct ChunkStore<R: Real> {
    chunks: Vec<(Affinity, ChunkBuffer<R>)>,
    pool: Arc<ChunkPool<R>>,
}

impl<R: Real> Drop for ChunkStore<R> {
    fn drop(&mut self) {
        for (affinity, buffer) in self.chunks.drain(..) {
            self.pool.release(affinity, buffer);
        }
    }
}

/// Amplitudes of one quantum register, owned by the processor that created
/// it.
pub struct QubitStates<R: Real> {
    n_lanes: u32,
    chunk_shift: u32,
    owner: u64,
    store: Arc<ChunkStore<R>>,
}

impl<R: Real> QubitStates<R> {
    /// Allocate chunks for `n_lanes` lanes. Contents are unspecified.
    pub(crate) fn allocate(
        pool: &Arc<ChunkPool<R>>,
        owner: u64,
        n_lanes: u32,
        max_po2_per_chunk: u32,
    ) -> QprocResult<Self> {
        let chunk_shift = n_lanes.min(max_po2_per_chunk);
        let n_chunks = 1usize << (n_lanes - chunk_shift);
        let chunks = pool.allocate(n_chunks, 1usize << chunk_shift)?;
        Ok(Self {
            n_lanes,
            chunk_shift,
            owner,
            store: Arc::new(ChunkStore {
                chunks,
                pool: Arc::clone(pool),
            }),
        })
    }

    /// Number of lanes.
    pub fn n_lanes(&self) -> u32 {
        self.n_lanes
    }

    /// Number of amplitudes, `2^n`.
    pub fn n_states(&self) -> u64 {
        1 << self.n_lanes
    }

    /// Component precision.
    pub fn precision(&self) -> Precision {
        R::PRECISION
    }

    /// Number of chunks.
    pub fn n_chunks(&self) -> usize {
        self.store.chunks.len()
    }

    /// Amplitudes per chunk.
    pub fn chunk_len(&self) -> u64 {
        1 << self.chunk_shift
    }

    /// Compute unit each chunk lives on, in chunk order.
    pub fn affinities(&self) -> Vec<Affinity> {
        self.store.chunks.iter().map(|(a, _)| *a).collect()
    }

    /// Global index range covered by a chunk.
    pub fn chunk_range(&self, chunk: usize) -> Range<u64> {
        let begin = (chunk as u64) << self.chunk_shift;
        begin..begin + self.chunk_len()
    }

    /// Chunk and local offset holding a global index.
    pub fn locate(&self, idx: u64) -> (usize, usize) {
        assert!(
            idx < self.n_states(),
            "state index {idx} out of range for {} lanes",
            self.n_lanes
        );
        (
            (idx >> self.chunk_shift) as usize,
            (idx & (self.chunk_len() - 1)) as usize,
        )
    }

    pub(crate) fn owner(&self) -> u64 {
        self.owner
    }

    pub(crate) fn view(&self) -> StateView<R> {
        StateView {
            store: Arc::clone(&self.store),
            chunk_shift: self.chunk_shift,
            n_lanes: self.n_lanes,
        }
    }
}

impl<R: Real> std::fmt::Debug for QubitStates<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QubitStates")
            .field("n_lanes", &self.n_lanes)
            .field("precision", &R::PRECISION)
            .field("n_chunks", &self.n_chunks())
            .field("chunk_len", &self.chunk_len())
            .finish()
    }
}

/// Index-addressed access to the amplitudes of one state vector.
///
/// Views are handed to kernels for the duration of one call and keep the
/// chunks alive while asynchronous jobs still hold them. Every access is
/// `unsafe`: callers must hold exclusive ownership of the indices they write
/// and must not read indices someone else is writing. The engine guarantees
/// this by giving each concurrent task a disjoint range of work indices.
#[derive(Clone)]
pub struct StateView<R: Real> {
    store: Arc<ChunkStore<R>>,
    chunk_shift: u32,
    n_lanes: u32,
}

impl<R: Real> StateView<R> {
    /// Number of lanes of the viewed state.
    #[inline]
    pub fn n_lanes(&self) -> u32 {
        self.n_lanes
    }

    /// Number of amplitudes.
    #[inline]
    pub fn n_states(&self) -> u64 {
        1 << self.n_lanes
    }

    #[inline]
    fn cell(&self, idx: u64) -> *mut Complex<R> {
        let chunk = (idx >> self.chunk_shift) as usize;
        let local = (idx & ((1 << self.chunk_shift) - 1)) as usize;
        self.store.chunks[chunk].1.cell(local)
    }

    /// Read one amplitude.
    ///
    /// # Safety
    ///
    /// No other task may be writing `idx` concurrently.
    #[inline]
    pub unsafe fn load(&self, idx: u64) -> Complex<R> {
        // SAFETY: upheld by the caller.
        unsafe { *self.cell(idx) }
    }

    /// Write one amplitude.
    ///
    /// # Safety
    ///
    /// The caller must own `idx` exclusively for the duration of the call.
    #[inline]
    pub unsafe fn store(&self, idx: u64, value: Complex<R>) {
        // SAFETY: upheld by the caller.
        unsafe { *self.cell(idx) = value }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Arc<ChunkPool<f64>> {
        Arc::new(ChunkPool::new([
            (Affinity::Device(0), 1 << 20),
            (Affinity::Device(1), 1 << 20),
        ]))
    }

    #[test]
    fn test_chunks_partition_index_space() {
        let qs = QubitStates::allocate(&pool(), 1, 6, 4).unwrap();
        assert_eq!(qs.n_chunks(), 4);
        assert_eq!(qs.chunk_len(), 16);

        let mut next = 0;
        for k in 0..qs.n_chunks() {
            let range = qs.chunk_range(k);
            assert_eq!(range.start, next);
            next = range.end;
        }
        assert_eq!(next, qs.n_states());
        assert_eq!(qs.locate(37), (2, 5));
    }

    #[test]
    fn test_small_register_uses_one_chunk() {
        let qs = QubitStates::allocate(&pool(), 1, 3, 10).unwrap();
        assert_eq!(qs.n_chunks(), 1);
        assert_eq!(qs.chunk_len(), 8);
    }

    #[test]
    fn test_chunks_return_to_pool_on_drop() {
        let pool = pool();
        let qs = QubitStates::allocate(&pool, 1, 5, 4).unwrap();
        let view = qs.view();
        drop(qs);
        // The view still holds the chunks.
        let before: usize = pool.usage().iter().map(|(_, b)| b).sum();
        drop(view);
        let reused = QubitStates::allocate(&pool, 1, 5, 4).unwrap();
        let after: usize = pool.usage().iter().map(|(_, b)| b).sum();
        assert_eq!(before, after);
        assert_eq!(reused.n_chunks(), 2);
    }

    #[test]
    fn test_view_roundtrips_across_chunks() {
        let qs = QubitStates::allocate(&pool(), 1, 4, 2).unwrap();
        let view = qs.view();
        for idx in 0..qs.n_states() {
            // SAFETY: single-threaded test.
            unsafe { view.store(idx, Complex::new(idx as f64, 0.0)) };
        }
        for idx in 0..qs.n_states() {
            // SAFETY: single-threaded test.
            assert_eq!(unsafe { view.load(idx) }.re, idx as f64);
        }
    }
}
