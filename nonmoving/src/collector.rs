//! Collection-cycle coordinator.
//!
//! The heap lists take no locks; the sweep relies on nothing else touching
//! them. The [`Collector`] provides that guarantee for multi-threaded
//! programs. A collection holds the heap lock for mark, prepare and sweep,
//! and mutators take it only to allocate. Block reads and writes go through
//! the heap's [`StorageTable`] and wait at most for the sweep to clear the
//! one segment they touch, so mutator threads that are not allocating keep
//! running during a collection.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use crate::{
    error::AllocError,
    heap::{BlockRef, Heap, HeapCensus, Marker},
    settings::HeapSettings,
    storage::StorageTable,
    sweep::SweepStats,
};

#[derive(Debug)]
pub struct Collector {
    heap: Arc<Mutex<Heap>>,
    storage: StorageTable,
    cycles: AtomicUsize,
}

/// Allocation and block-access handle for one mutator thread.
#[derive(Debug, Clone)]
pub struct Mutator {
    heap: Arc<Mutex<Heap>>,
    storage: StorageTable,
}

impl Collector {
    pub fn new(settings: HeapSettings) -> Result<Self, &'static str> {
        let heap = Heap::try_new(settings)?;
        Ok(Self {
            storage: heap.storage_table(),
            heap: Arc::new(Mutex::new(heap)),
            cycles: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub fn mutator(&self) -> Mutator {
        Mutator {
            heap: self.heap.clone(),
            storage: self.storage.clone(),
        }
    }

    /// Completed collection cycles.
    pub fn cycles(&self) -> usize {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Runs one cycle: `mark` writes the bitmaps through the [`Marker`],
    /// then every filled segment is swept.
    ///
    /// Allocation is paused for the whole cycle.
    pub fn collect<F>(&self, mark: F) -> SweepStats
    where
        F: FnOnce(&mut Marker<'_>),
    {
        let mut heap = self.heap.lock();

        let mut marker = heap.begin_mark();
        mark(&mut marker);
        let stats = marker.prepare_sweep().sweep();

        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        log::info!("collection {cycle}: {stats}");
        stats
    }

    /// Read access to the heap, e.g. for [`Heap::verify`].
    pub fn with_heap<R>(&self, f: impl FnOnce(&Heap) -> R) -> R {
        f(&*self.heap.lock())
    }

    pub fn census(&self) -> HeapCensus {
        self.heap.lock().census()
    }
}

impl Mutator {
    pub fn allocate(&self, size: usize) -> Result<BlockRef, AllocError> {
        self.heap.lock().allocate(size)
    }

    /// Runs `f` on the bytes of a live block without taking the heap lock.
    ///
    /// `f` holds the segment's storage lock, so it must not allocate.
    pub fn with_block<R>(
        &self,
        block: BlockRef,
        f: impl FnOnce(&[u8]) -> R,
    ) -> R {
        self.storage.with_block(block, f)
    }

    pub fn with_block_mut<R>(
        &self,
        block: BlockRef,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> R {
        self.storage.with_block_mut(block, f)
    }
}
