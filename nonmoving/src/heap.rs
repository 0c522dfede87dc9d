//! Segment heap of the non-moving collector.
//!
//! Segments live in an arena and are addressed by index. Each one is on
//! exactly one list at a time, threaded through its `link` field:
//!
//! - per size class, an [`Allocator`] with an `active` list (free blocks
//!   left) and a `filled` list (no free blocks),
//! - the global `free` list (no live blocks, any size class),
//! - the global `sweep_list` (filled segments waiting to be classified).
//!
//! The lists take no locks. Marking and sweeping go through handles that
//! borrow the heap mutably ([`Marker`], [`crate::Sweeper`]), so allocation
//! cannot interleave with them. Block bytes live in [`crate::SegmentStorage`]
//! behind per-segment locks and are published in a [`StorageTable`], which
//! is how [`crate::Collector`] lets mutators touch live blocks during a
//! collection.

use std::{iter, mem::ManuallyDrop};

use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard};

use crate::{
    allocator::Allocator,
    error::{AllocError, HeapCorruption, heap_corruption},
    segment::{NO_SEGMENT, Segment, SegmentList},
    settings::HeapSettings,
    storage::StorageTable,
    system::SegmentMemory,
};

/// A block handed out by [`Heap::allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRef {
    pub segment: usize,
    pub block: usize,
}

/// Position in the collection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// Allocation allowed.
    Idle,
    /// Bitmaps of filled segments are being written.
    Marking,
    /// Filled lists are moved to the sweep list.
    Preparing,
    /// The sweep list is drained.
    Sweeping,
}

/// Number of segments on each kind of list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapCensus {
    pub free: usize,
    pub active: usize,
    pub filled: usize,
    pub sweep: usize,
    /// Arena slots whose memory went back to the OS.
    pub released: usize,
}

impl HeapCensus {
    /// Segments currently backed by memory.
    pub fn mapped(&self) -> usize {
        self.free + self.active + self.filled + self.sweep
    }
}

// ── Heap ──────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Heap {
    pub(crate) settings: HeapSettings,
    pub(crate) segments: Vec<Segment>,
    pub(crate) allocators: Box<[Allocator]>,
    /// Filled segments awaiting classification.
    pub(crate) sweep_list: usize,
    /// Segments without live blocks.
    pub(crate) free: usize,
    /// Arena slots of released segments, reused before growing the arena.
    pub(crate) released: Vec<usize>,
    pub(crate) phase: GcPhase,
    storage_table: StorageTable,
}

impl Heap {
    #[must_use]
    pub fn new(settings: HeapSettings) -> Self {
        Self::try_new(settings).expect("Invalid Heap Settings")
    }

    pub fn try_new(settings: HeapSettings) -> Result<Self, &'static str> {
        settings.validate()?;

        let allocators = (0..settings.size_classes)
            .map(|class| Allocator::new(settings.log_block_size(class)))
            .collect();

        log::debug!(
            "nonmoving heap: {} size classes ({}..={} bytes), {} byte segments",
            settings.size_classes,
            settings.block_size(0),
            settings.max_block_size(),
            settings.segment_size
        );

        Ok(Self {
            settings,
            segments: Vec::new(),
            allocators,
            sweep_list: NO_SEGMENT,
            free: NO_SEGMENT,
            released: Vec::new(),
            phase: GcPhase::Idle,
            storage_table: StorageTable::default(),
        })
    }

    #[inline]
    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    #[inline]
    pub fn phase(&self) -> GcPhase {
        self.phase
    }

    #[inline]
    pub fn allocators(&self) -> &[Allocator] {
        &self.allocators
    }

    #[inline]
    pub fn segment(&self, id: usize) -> &Segment {
        &self.segments[id]
    }

    /// Storage of every mapped segment, readable without the heap.
    #[inline]
    pub fn storage_table(&self) -> StorageTable {
        self.storage_table.clone()
    }

    /// Arena slots, released ones included.
    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    #[inline]
    pub fn free_head(&self) -> usize {
        self.free
    }

    #[inline]
    pub fn sweep_list_head(&self) -> usize {
        self.sweep_list
    }

    /// Follows `link` from `head` until [`NO_SEGMENT`].
    pub fn iter_list(&self, head: usize) -> impl Iterator<Item = usize> + '_ {
        iter::successors((head != NO_SEGMENT).then_some(head), move |&id| {
            let next = self.segments[id].link;
            (next != NO_SEGMENT).then_some(next)
        })
    }

    pub fn free_segments(&self) -> impl Iterator<Item = usize> + '_ {
        self.iter_list(self.free)
    }

    pub fn active_segments(
        &self,
        class: usize,
    ) -> impl Iterator<Item = usize> + '_ {
        self.iter_list(self.allocators[class].active)
    }

    pub fn filled_segments(
        &self,
        class: usize,
    ) -> impl Iterator<Item = usize> + '_ {
        self.iter_list(self.allocators[class].filled)
    }

    /// Size class owning segment `id`.
    fn class_of(&self, id: usize) -> usize {
        let log = self.segments[id].log_block_size();
        match self.settings.class_of_log(log) {
            Some(class) => class,
            None => heap_corruption(format_args!(
                "segment {id} has block size 2^{log} outside every size class"
            )),
        }
    }

    // ── List transfer ─────────────────────────────────────────────────
    //
    // Never run concurrently with allocation, so no synchronization.

    pub(crate) fn push_free(&mut self, id: usize) {
        let segment = &mut self.segments[id];
        debug_assert_eq!(segment.list, SegmentList::Unlinked);
        segment.link = self.free;
        segment.list = SegmentList::Free;
        self.free = id;
    }

    pub(crate) fn push_active(&mut self, id: usize) {
        let class = self.class_of(id);
        let alloc = &mut self.allocators[class];
        let segment = &mut self.segments[id];
        debug_assert_eq!(segment.list, SegmentList::Unlinked);
        segment.link = alloc.active;
        segment.list = SegmentList::Active(class);
        alloc.active = id;
    }

    pub(crate) fn push_filled(&mut self, id: usize) {
        let class = self.class_of(id);
        let alloc = &mut self.allocators[class];
        let segment = &mut self.segments[id];
        debug_assert_eq!(segment.list, SegmentList::Unlinked);
        segment.link = alloc.filled;
        segment.list = SegmentList::Filled(class);
        alloc.filled = id;
    }

    pub(crate) fn pop_free(&mut self) -> Option<usize> {
        let head = self.free;
        if head == NO_SEGMENT {
            return None;
        }
        let segment = &mut self.segments[head];
        self.free = segment.link;
        segment.link = NO_SEGMENT;
        segment.list = SegmentList::Unlinked;
        Some(head)
    }

    pub(crate) fn pop_active(&mut self, class: usize) -> Option<usize> {
        let alloc = &mut self.allocators[class];
        let head = alloc.active;
        if head == NO_SEGMENT {
            return None;
        }
        let segment = &mut self.segments[head];
        alloc.active = segment.link;
        segment.link = NO_SEGMENT;
        segment.list = SegmentList::Unlinked;
        Some(head)
    }

    // ── Allocation ────────────────────────────────────────────────────

    /// Allocates one block big enough for `size` bytes.
    ///
    /// Allocated blocks are marked and stay live until the mark phase of
    /// the cycle that sweeps their segment says otherwise.
    pub fn allocate(&mut self, size: usize) -> Result<BlockRef, AllocError> {
        if self.phase != GcPhase::Idle {
            return Err(AllocError::CollectionInProgress);
        }
        let class = self
            .settings
            .size_class_for(size)
            .ok_or(AllocError::BadRequest)?;

        let mut id = self.allocators[class].active;
        if id == NO_SEGMENT {
            id = self.acquire_segment(class)?;
            self.push_active(id);
        }

        let segment = &mut self.segments[id];
        let block = segment.next_free;
        debug_assert!(!segment.is_marked(block), "next_free on a used block");
        segment.set_mark(block);

        match segment.find_free_from(block + 1) {
            Some(next) => segment.next_free = next,
            None => {
                segment.next_free = segment.block_count();
                let popped = self.pop_active(class);
                debug_assert_eq!(popped, Some(id));
                self.push_filled(id);
            }
        }

        Ok(BlockRef { segment: id, block })
    }

    /// A fresh, unlinked segment for `class`: from the free list, a released
    /// slot, or a new mapping.
    fn acquire_segment(&mut self, class: usize) -> Result<usize, AllocError> {
        let log = self.settings.log_block_size(class);

        if let Some(id) = self.pop_free() {
            self.segments[id].assign(log);
            log::trace!("reassigned free segment {id} to class {class}");
            return Ok(id);
        }

        let mapped = self.segments.len() - self.released.len();
        if mapped >= self.settings.max_segments {
            log::debug!("segment limit of {} reached", self.settings.max_segments);
            return Err(AllocError::OutOfMemory);
        }

        let memory = SegmentMemory::map(self.settings.segment_size)
            .ok_or(AllocError::OutOfMemory)?;

        let id = match self.released.pop() {
            Some(id) => {
                self.segments[id].restore(memory, log);
                id
            }
            None => {
                self.segments.push(Segment::new(memory, log));
                self.segments.len() - 1
            }
        };
        if let Some(storage) = self.segments[id].shared_storage() {
            self.storage_table.insert(id, storage.clone());
        }
        log::trace!("mapped segment {id} for class {class}");
        Ok(id)
    }

    /// Segment holding `block`, or why the reference is stale.
    pub fn check_block(
        &self,
        block: BlockRef,
    ) -> Result<&Segment, HeapCorruption> {
        match self.segments.get(block.segment) {
            Some(segment)
                if !segment.is_released()
                    && block.block < segment.block_count() =>
            {
                Ok(segment)
            }
            _ => Err(HeapCorruption::StaleBlock {
                segment: block.segment,
                block: block.block,
            }),
        }
    }

    fn segment_of(&self, block: BlockRef) -> &Segment {
        match self.check_block(block) {
            Ok(segment) => segment,
            Err(err) => heap_corruption(format_args!("{err}")),
        }
    }

    fn segment_of_mut(&mut self, block: BlockRef) -> &mut Segment {
        if let Err(err) = self.check_block(block) {
            heap_corruption(format_args!("{err}"));
        }
        &mut self.segments[block.segment]
    }

    #[inline]
    pub fn block(&self, block: BlockRef) -> MappedRwLockReadGuard<'_, [u8]> {
        self.segment_of(block).block(block.block)
    }

    #[inline]
    pub fn block_mut(
        &mut self,
        block: BlockRef,
    ) -> MappedRwLockWriteGuard<'_, [u8]> {
        self.segment_of_mut(block).block_mut(block.block)
    }

    #[inline]
    pub fn is_marked(&self, block: BlockRef) -> bool {
        self.segment_of(block).is_marked(block.block)
    }

    // ── Marking ───────────────────────────────────────────────────────

    /// Starts a mark phase.
    ///
    /// Clears the bitmaps of all filled segments, which the following sweep
    /// will classify, and snapshots `next_free` of active segments.
    pub fn begin_mark(&mut self) -> Marker<'_> {
        debug_assert_eq!(self.phase, GcPhase::Idle);
        self.phase = GcPhase::Marking;

        for class in 0..self.allocators.len() {
            let mut id = self.allocators[class].filled;
            while id != NO_SEGMENT {
                let segment = &mut self.segments[id];
                segment.clear_bitmap();
                id = segment.link;
            }

            let mut id = self.allocators[class].active;
            while id != NO_SEGMENT {
                let segment = &mut self.segments[id];
                segment.next_free_snap = segment.next_free;
                id = segment.link;
            }
        }

        Marker { heap: self }
    }

    // ── Trimming ──────────────────────────────────────────────────────

    /// Unmaps free segments beyond `max_free_segments`.
    ///
    /// Returns the number of segments released.
    pub fn trim_free_segments(&mut self) -> usize {
        let Some(limit) = self.settings.max_free_segments else {
            return 0;
        };
        let free = self.free_segments().count();
        if free <= limit {
            return 0;
        }

        let excess = free - limit;
        for _ in 0..excess {
            let Some(id) = self.pop_free() else { break };
            self.storage_table.remove(id);
            drop(self.segments[id].release());
            self.released.push(id);
        }
        log::debug!("released {excess} free segments, {limit} kept");
        excess
    }

    // ── Census / verification ─────────────────────────────────────────

    pub fn census(&self) -> HeapCensus {
        let mut census = HeapCensus {
            free: self.free_segments().count(),
            sweep: self.iter_list(self.sweep_list).count(),
            released: self.released.len(),
            ..HeapCensus::default()
        };
        for class in 0..self.allocators.len() {
            census.active += self.active_segments(class).count();
            census.filled += self.filled_segments(class).count();
        }
        census
    }

    /// Walks every list and checks that each mapped segment is reached
    /// exactly once, carries the owner tag of its list, and, on allocator
    /// lists, has the allocator's block size.
    pub fn verify(&self) -> Result<HeapCensus, HeapCorruption> {
        let mut seen = vec![false; self.segments.len()];
        let mut census = HeapCensus {
            free: self.walk(self.free, SegmentList::Free, None, &mut seen)?,
            sweep: self.walk(
                self.sweep_list,
                SegmentList::Sweep,
                None,
                &mut seen,
            )?,
            ..HeapCensus::default()
        };

        for (class, alloc) in self.allocators.iter().enumerate() {
            census.active += self.walk(
                alloc.active,
                SegmentList::Active(class),
                Some(class),
                &mut seen,
            )?;
            census.filled += self.walk(
                alloc.filled,
                SegmentList::Filled(class),
                Some(class),
                &mut seen,
            )?;
        }

        for (id, segment) in self.segments.iter().enumerate() {
            if seen[id] {
                continue;
            }
            if segment.list != SegmentList::Released {
                return Err(HeapCorruption::Unreachable { segment: id });
            }
            census.released += 1;
        }

        Ok(census)
    }

    fn walk(
        &self,
        head: usize,
        expected: SegmentList,
        class: Option<usize>,
        seen: &mut [bool],
    ) -> Result<usize, HeapCorruption> {
        let mut count = 0;
        let mut id = head;
        while id != NO_SEGMENT {
            if std::mem::replace(&mut seen[id], true) {
                return Err(HeapCorruption::Duplicate { segment: id });
            }
            let segment = &self.segments[id];
            if segment.list != expected {
                return Err(HeapCorruption::WrongOwner {
                    segment: id,
                    expected,
                    found: segment.list,
                });
            }
            if let Some(class) = class {
                if segment.log_block_size()
                    != self.settings.log_block_size(class)
                {
                    return Err(HeapCorruption::WrongBlockSize {
                        segment: id,
                        class,
                    });
                }
            }
            if let SegmentList::Active(_) = expected {
                let next_free = segment.next_free;
                if next_free >= segment.block_count()
                    || segment.is_marked(next_free)
                {
                    return Err(HeapCorruption::StaleCursor {
                        segment: id,
                        next_free,
                    });
                }
            }
            count += 1;
            id = segment.link;
        }
        Ok(count)
    }
}

// ── Marker ────────────────────────────────────────────────────────────

/// Write access to the bitmaps for the duration of a mark phase.
///
/// Obtained from [`Heap::begin_mark`]. Dropping it without
/// [`Marker::prepare_sweep`] abandons the cycle and returns the heap to
/// [`GcPhase::Idle`]; the cleared bitmaps then only reflect what was marked.
#[derive(Debug)]
pub struct Marker<'h> {
    heap: &'h mut Heap,
}

impl<'h> Marker<'h> {
    #[inline]
    pub fn mark(&mut self, block: BlockRef) {
        self.heap.segment_of_mut(block).set_mark(block.block);
    }

    #[inline]
    pub fn is_marked(&self, block: BlockRef) -> bool {
        self.heap.is_marked(block)
    }

    #[inline]
    pub fn heap(&self) -> &Heap {
        self.heap
    }

    /// Ends the mark phase and moves every filled segment to the sweep list.
    pub fn prepare_sweep(self) -> crate::Sweeper<'h> {
        let this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped or used again, so the mutable
        // borrow is moved out exactly once
        let heap = unsafe { std::ptr::read(&this.heap) };
        heap.prepare_sweep()
    }
}

impl Drop for Marker<'_> {
    fn drop(&mut self) {
        if self.heap.phase == GcPhase::Marking {
            log::warn!("mark phase abandoned before sweeping");
            self.heap.phase = GcPhase::Idle;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
