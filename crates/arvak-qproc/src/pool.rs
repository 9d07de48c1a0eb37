//! Pooled allocators for chunk memory and host staging buffers.
//!
//! Memory handed out here is not returned to the system when a state or a
//! transfer releases it; it goes back on a free list and is reused by the next
//! allocation of the same shape. Only `clear` gives it back.

use num_complex::Complex;
use rustc_hash::FxHashMap;
use std::any::{Any, TypeId};
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::Mutex;
use tracing::{debug, trace};

use crate::error::{QprocError, QprocResult};
use crate::precision::Real;

/// Compute unit a chunk is resident on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Affinity {
    /// Host memory, processed by the CPU dispatcher.
    Host,
    /// Memory of the accelerator device with this id.
    Device(usize),
}

impl fmt::Display for Affinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Affinity::Host => write!(f, "host"),
            Affinity::Device(id) => write!(f, "device{id}"),
        }
    }
}

/// Backing memory of one chunk.
///
/// Cells are individually mutable through shared references; exclusive access
/// to any given cell is guaranteed by range ownership, not by the type system.
#[derive(Debug)]
pub struct ChunkBuffer<R> {
    cells: Box<[UnsafeCell<Complex<R>>]>,
}

// SAFETY: concurrent users only ever touch disjoint cells (see `StateView`).
unsafe impl<R: Send> Sync for ChunkBuffer<R> {}

impl<R: Real> ChunkBuffer<R> {
    fn try_new(len: usize) -> QprocResult<Self> {
        let mut cells = Vec::new();
        cells
            .try_reserve_exact(len)
            .map_err(|_| QprocError::OutOfDeviceMemory {
                requested: len * std::mem::size_of::<Complex<R>>(),
            })?;
        cells.extend((0..len).map(|_| UnsafeCell::new(Complex::default())));
        Ok(Self {
            cells: cells.into_boxed_slice(),
        })
    }

    /// Number of amplitudes.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the buffer holds no amplitudes.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Raw pointer to one amplitude.
    #[inline]
    pub(crate) fn cell(&self, local: usize) -> *mut Complex<R> {
        self.cells[local].get()
    }
}

#[derive(Debug)]
struct UnitBudget {
    affinity: Affinity,
    capacity: usize,
    used: usize,
}

struct PoolInner<R> {
    units: Vec<UnitBudget>,
    free: FxHashMap<(Affinity, usize), Vec<ChunkBuffer<R>>>,
    next_unit: usize,
}

/// Chunk allocator spanning every compute unit of a processor.
pub struct ChunkPool<R> {
    inner: Mutex<PoolInner<R>>,
}

impl<R: Real> ChunkPool<R> {
    /// Create a pool over units with the given byte budgets.
    pub fn new(units: impl IntoIterator<Item = (Affinity, usize)>) -> Self {
        let units = units
            .into_iter()
            .map(|(affinity, capacity)| UnitBudget {
                affinity,
                capacity,
                used: 0,
            })
            .collect();
        Self {
            inner: Mutex::new(PoolInner {
                units,
                free: FxHashMap::default(),
                next_unit: 0,
            }),
        }
    }

    /// Allocate `n_chunks` chunks of `elements` amplitudes, placed round robin
    /// across units that still have room.
    pub fn allocate(
        &self,
        n_chunks: usize,
        elements: usize,
    ) -> QprocResult<Vec<(Affinity, ChunkBuffer<R>)>> {
        let bytes = elements * std::mem::size_of::<Complex<R>>();
        let mut inner = self.lock();
        let mut placed = Vec::with_capacity(n_chunks);

        for _ in 0..n_chunks {
            match inner.take_one(elements, bytes) {
                Ok(chunk) => placed.push(chunk),
                Err(e) => {
                    for (affinity, buffer) in placed {
                        inner.free.entry((affinity, elements)).or_default().push(buffer);
                    }
                    return Err(e);
                }
            }
        }
        trace!(n_chunks, elements, "chunks allocated");
        Ok(placed)
    }

    /// Return a chunk to the free list. Its memory stays reserved.
    pub fn release(&self, affinity: Affinity, buffer: ChunkBuffer<R>) {
        let elements = buffer.len();
        self.lock()
            .free
            .entry((affinity, elements))
            .or_default()
            .push(buffer);
    }

    /// Drop every pooled chunk and give its budget back.
    pub fn clear(&self) {
        let mut inner = self.lock();
        let free = std::mem::take(&mut inner.free);
        for ((affinity, elements), buffers) in free {
            let bytes = elements * std::mem::size_of::<Complex<R>>() * buffers.len();
            if let Some(unit) = inner.units.iter_mut().find(|u| u.affinity == affinity) {
                unit.used -= bytes;
            }
        }
        debug!("chunk pool cleared");
    }

    /// Bytes currently charged against each unit.
    pub fn usage(&self) -> Vec<(Affinity, usize)> {
        self.lock()
            .units
            .iter()
            .map(|u| (u.affinity, u.used))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner<R>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<R: Real> PoolInner<R> {
    fn take_one(&mut self, elements: usize, bytes: usize) -> QprocResult<(Affinity, ChunkBuffer<R>)> {
        let n_units = self.units.len();
        for step in 0..n_units {
            let unit_idx = (self.next_unit + step) % n_units;
            let affinity = self.units[unit_idx].affinity;

            if let Some(buffer) = self
                .free
                .get_mut(&(affinity, elements))
                .and_then(Vec::pop)
            {
                self.next_unit = (unit_idx + 1) % n_units;
                return Ok((affinity, buffer));
            }

            let unit = &mut self.units[unit_idx];
            if unit.capacity - unit.used >= bytes {
                let buffer = ChunkBuffer::try_new(elements)?;
                unit.used += bytes;
                self.next_unit = (unit_idx + 1) % n_units;
                return Ok((affinity, buffer));
            }
        }
        Err(QprocError::OutOfDeviceMemory { requested: bytes })
    }
}

struct PooledBuffer {
    bytes: usize,
    buffer: Box<dyn Any + Send>,
}

/// Bounded store of host staging buffers owned by one device.
pub struct HostMemoryStore {
    device: usize,
    capacity: usize,
    used: usize,
    pooled: usize,
    free: FxHashMap<(TypeId, usize), Vec<PooledBuffer>>,
}

impl HostMemoryStore {
    /// Create a store holding at most `capacity` bytes.
    pub fn new(device: usize, capacity: usize) -> Self {
        Self {
            device,
            capacity,
            used: 0,
            pooled: 0,
            free: FxHashMap::default(),
        }
    }

    /// Bytes that can still be handed out, counting pooled buffers as
    /// reclaimable.
    pub fn remaining(&self) -> usize {
        self.capacity - self.used + self.pooled
    }

    /// Elements of `V` that fit in [`remaining`](Self::remaining).
    pub fn remaining_of<V>(&self) -> usize {
        self.remaining() / std::mem::size_of::<V>().max(1)
    }

    /// Take a buffer of exactly `len` elements.
    pub fn allocate<V>(&mut self, len: usize) -> QprocResult<Vec<V>>
    where
        V: Copy + Default + Send + 'static,
    {
        let key = (TypeId::of::<V>(), len);
        if let Some(pooled) = self.free.get_mut(&key).and_then(Vec::pop) {
            self.pooled -= pooled.bytes;
            if let Ok(buffer) = pooled.buffer.downcast::<Vec<V>>() {
                return Ok(*buffer);
            }
        }

        let bytes = len * std::mem::size_of::<V>();
        if self.capacity - self.used < bytes {
            self.reclaim();
        }
        if self.capacity - self.used < bytes {
            return Err(QprocError::HostMemoryExhausted {
                device: self.device,
                requested: bytes,
                remaining: self.capacity - self.used,
            });
        }
        self.used += bytes;
        Ok(vec![V::default(); len])
    }

    /// Put a buffer back for reuse. It stays charged against the store.
    pub fn release<V>(&mut self, buffer: Vec<V>)
    where
        V: Send + 'static,
    {
        let bytes = buffer.len() * std::mem::size_of::<V>();
        let key = (TypeId::of::<V>(), buffer.len());
        self.pooled += bytes;
        self.free.entry(key).or_default().push(PooledBuffer {
            bytes,
            buffer: Box::new(buffer),
        });
    }

    /// Uncharge a buffer of `bytes` that was lost and will not be released.
    pub fn discard(&mut self, bytes: usize) {
        self.used -= bytes.min(self.used - self.pooled);
    }

    /// Drop every pooled buffer.
    pub fn clear(&mut self) {
        self.reclaim();
    }

    /// Bytes charged against the store, pooled buffers included.
    pub fn used(&self) -> usize {
        self.used
    }

    fn reclaim(&mut self) {
        self.free.clear();
        self.used -= self.pooled;
        self.pooled = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_round_robin_across_units() {
        let pool = ChunkPool::<f64>::new([
            (Affinity::Device(0), 1 << 20),
            (Affinity::Device(1), 1 << 20),
        ]);
        let chunks = pool.allocate(4, 16).unwrap();
        let placement: Vec<_> = chunks.iter().map(|(a, _)| *a).collect();
        assert_eq!(
            placement,
            vec![
                Affinity::Device(0),
                Affinity::Device(1),
                Affinity::Device(0),
                Affinity::Device(1)
            ]
        );
    }

    #[test]
    fn test_full_unit_is_skipped() {
        // Unit 0 holds exactly one 16-element f64 chunk (256 bytes).
        let pool = ChunkPool::<f64>::new([
            (Affinity::Device(0), 256),
            (Affinity::Device(1), 1 << 20),
        ]);
        let chunks = pool.allocate(3, 16).unwrap();
        let on_zero = chunks
            .iter()
            .filter(|(a, _)| *a == Affinity::Device(0))
            .count();
        assert_eq!(on_zero, 1);
    }

    #[test]
    fn test_exhaustion_returns_error_and_keeps_budget() {
        let pool = ChunkPool::<f32>::new([(Affinity::Host, 64)]);
        let err = pool.allocate(2, 8).unwrap_err();
        assert!(matches!(err, QprocError::OutOfDeviceMemory { requested: 64 }));
        // The first chunk went back on the free list and can be reused.
        let again = pool.allocate(1, 8).unwrap();
        assert_eq!(again.len(), 1);
    }

    #[test]
    fn test_released_chunks_are_reused_then_cleared() {
        let pool = ChunkPool::<f64>::new([(Affinity::Host, 1024)]);
        let mut chunks = pool.allocate(1, 32).unwrap();
        let (affinity, buffer) = chunks.pop().unwrap();
        pool.release(affinity, buffer);
        assert_eq!(pool.usage(), vec![(Affinity::Host, 512)]);

        let reused = pool.allocate(1, 32).unwrap();
        assert_eq!(pool.usage(), vec![(Affinity::Host, 512)]);
        for (affinity, buffer) in reused {
            pool.release(affinity, buffer);
        }
        pool.clear();
        assert_eq!(pool.usage(), vec![(Affinity::Host, 0)]);
    }

    #[test]
    fn test_host_store_reuses_and_reclaims() {
        let mut store = HostMemoryStore::new(0, 1024);
        let a = store.allocate::<f64>(64).unwrap();
        assert_eq!(store.remaining(), 512);
        store.release(a);
        assert_eq!(store.remaining(), 1024);

        // Same shape is served from the pool.
        let b = store.allocate::<f64>(64).unwrap();
        assert_eq!(store.used(), 512);
        store.release(b);

        // A different shape forces the pooled buffer to be reclaimed.
        let c = store.allocate::<f32>(200).unwrap();
        assert_eq!(store.used(), 800);
        assert!(store.allocate::<f32>(100).is_err());
        store.release(c);
        store.clear();
        assert_eq!(store.used(), 0);
    }
}
