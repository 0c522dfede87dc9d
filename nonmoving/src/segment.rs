//! Segments: fixed-size regions of equally sized blocks plus the metadata the
//! sweep needs (mark bitmap, free cursors, list link).

use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard};

use crate::{
    error::{HeapCorruption, heap_corruption},
    storage::SegmentStorage,
    system::SegmentMemory,
};

// ── Segment metadata ──────────────────────────────────────────────────

/// Terminates every segment list.
pub const NO_SEGMENT: usize = usize::MAX;
/// Bitmap byte of a block that holds no reachable object.
pub const UNMARKED: u8 = 0;
/// Bitmap byte of a live block.
pub const MARKED: u8 = 1;
/// Byte written over dead memory when sanity clearing is enabled.
pub const SANITY_FILL: u8 = 0;

/// The list a segment currently belongs to.
///
/// Mirrors the intrusive `link`: a segment is on exactly one list, and the
/// tag names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentList {
    /// Detached, in transit between two lists.
    Unlinked,
    /// Global free list, no live blocks.
    Free,
    /// Active list of the given size class.
    Active(usize),
    /// Filled list of the given size class.
    Filled(usize),
    /// Pending classification.
    Sweep,
    /// Memory returned to the OS; the arena slot waits for reuse.
    Released,
}

/// Where a swept segment goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepResult {
    /// No live blocks: global free list.
    Free,
    /// Some live and some dead blocks: the allocator's active list.
    Partial,
    /// Every block live: the allocator's filled list.
    Filled,
}

#[derive(Debug)]
pub struct Segment {
    storage: Option<Arc<SegmentStorage>>,
    log_block_size: u8,
    block_count: usize,
    /// One byte per block, written by the mark phase.
    bitmap: Box<[u8]>,
    /// First block to try when allocating. Only meaningful while active.
    pub(crate) next_free: usize,
    /// `next_free` as of the last mark snapshot or sweep.
    pub(crate) next_free_snap: usize,
    /// Intrusive next pointer of whichever list owns the segment.
    pub(crate) link: usize,
    pub(crate) list: SegmentList,
}

impl Segment {
    pub(crate) fn new(memory: SegmentMemory, log_block_size: u8) -> Self {
        let block_count = memory.size() >> log_block_size;
        debug_assert!(block_count > 0);
        Self {
            storage: Some(Arc::new(SegmentStorage::new(
                memory,
                log_block_size,
            ))),
            log_block_size,
            block_count,
            bitmap: vec![UNMARKED; block_count].into_boxed_slice(),
            next_free: 0,
            next_free_snap: 0,
            link: NO_SEGMENT,
            list: SegmentList::Unlinked,
        }
    }

    /// Reassigns a free segment to another size class.
    pub(crate) fn assign(&mut self, log_block_size: u8) {
        debug_assert_eq!(self.list, SegmentList::Unlinked);
        let storage = self.storage();
        let size = storage.size();
        storage.set_log_block_size(log_block_size);
        self.log_block_size = log_block_size;
        self.block_count = size >> log_block_size;
        if self.bitmap.len() == self.block_count {
            self.bitmap.fill(UNMARKED);
        } else {
            self.bitmap = vec![UNMARKED; self.block_count].into_boxed_slice();
        }
        self.next_free = 0;
        self.next_free_snap = 0;
    }

    /// Gives up the block storage. The segment keeps its arena slot; the
    /// memory is unmapped once no mutator holds the storage any more.
    pub(crate) fn release(&mut self) -> Option<Arc<SegmentStorage>> {
        debug_assert_eq!(self.list, SegmentList::Unlinked);
        self.bitmap = Box::default();
        self.block_count = 0;
        self.next_free = 0;
        self.next_free_snap = 0;
        self.list = SegmentList::Released;
        self.storage.take()
    }

    /// Puts fresh storage into a released slot.
    pub(crate) fn restore(&mut self, memory: SegmentMemory, log_block_size: u8) {
        debug_assert_eq!(self.list, SegmentList::Released);
        *self = Segment::new(memory, log_block_size);
    }

    #[inline]
    pub fn log_block_size(&self) -> u8 {
        self.log_block_size
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        1 << self.log_block_size
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    #[inline]
    pub fn next_free(&self) -> usize {
        self.next_free
    }

    #[inline]
    pub fn next_free_snap(&self) -> usize {
        self.next_free_snap
    }

    #[inline]
    pub fn link(&self) -> usize {
        self.link
    }

    #[inline]
    pub fn list(&self) -> SegmentList {
        self.list
    }

    #[inline]
    pub fn is_released(&self) -> bool {
        self.storage.is_none()
    }

    /// Shared handle to the block storage, `None` once released.
    #[inline]
    pub fn shared_storage(&self) -> Option<&Arc<SegmentStorage>> {
        self.storage.as_ref()
    }

    // ── Bitmap ────────────────────────────────────────────────────────

    #[inline]
    pub fn bitmap(&self) -> &[u8] {
        &self.bitmap
    }

    #[inline]
    pub fn is_marked(&self, block: usize) -> bool {
        self.bitmap[block] != UNMARKED
    }

    #[inline]
    pub fn set_mark(&mut self, block: usize) {
        self.bitmap[block] = MARKED;
    }

    pub fn clear_bitmap(&mut self) {
        self.bitmap.fill(UNMARKED);
    }

    pub fn live_blocks(&self) -> usize {
        self.bitmap.iter().filter(|&&b| b != UNMARKED).count()
    }

    /// First unmarked block at or after `start`.
    pub(crate) fn find_free_from(&self, start: usize) -> Option<usize> {
        self.bitmap
            .get(start..)?
            .iter()
            .position(|&b| b == UNMARKED)
            .map(|offset| start + offset)
    }

    // ── Block storage ─────────────────────────────────────────────────

    fn storage(&self) -> &SegmentStorage {
        match &self.storage {
            Some(storage) => storage,
            None => heap_corruption(format_args!(
                "access to the storage of a released segment"
            )),
        }
    }

    pub fn block(&self, block: usize) -> MappedRwLockReadGuard<'_, [u8]> {
        match self.storage().block(block) {
            Some(bytes) => bytes,
            None => panic!("block index {block} out of range"),
        }
    }

    pub fn block_mut(
        &mut self,
        block: usize,
    ) -> MappedRwLockWriteGuard<'_, [u8]> {
        match self.storage().block_mut(block) {
            Some(bytes) => bytes,
            None => panic!("block index {block} out of range"),
        }
    }

    // ── Sweeping ──────────────────────────────────────────────────────

    /// Decides which list the segment belongs on after marking.
    ///
    /// Scans the bitmap in block order and stops as soon as both a live and
    /// a dead block have been seen. The first dead block becomes
    /// `next_free`/`next_free_snap`; that is all allocation needs. The bitmap
    /// is only read.
    #[inline]
    pub fn classify(&mut self) -> SweepResult {
        debug_assert!(self.block_count > 0);

        let mut found_free = false;
        let mut found_live = false;

        for (i, &bit) in self.bitmap.iter().enumerate() {
            if bit != UNMARKED {
                found_live = true;
            } else if !found_free {
                found_free = true;
                self.next_free = i;
                self.next_free_snap = i;
            }

            if found_free && found_live {
                return SweepResult::Partial;
            }
        }

        if found_live {
            SweepResult::Filled
        } else {
            if let Err(err) = self.check_free_cursors() {
                heap_corruption(format_args!("{err}"));
            }
            SweepResult::Free
        }
    }

    /// Block 0 is the first dead block of an empty segment, so both cursors
    /// of a segment classified free must name it.
    pub(crate) fn check_free_cursors(&self) -> Result<(), HeapCorruption> {
        if self.next_free != 0 || self.next_free_snap != 0 {
            return Err(HeapCorruption::FreeCursor {
                next_free: self.next_free,
                next_free_snap: self.next_free_snap,
            });
        }
        Ok(())
    }

    /// Zeroes all block storage and the bitmap. Returns the bytes written.
    pub(crate) fn clear(&mut self) -> usize {
        self.bitmap.fill(UNMARKED);
        self.storage().fill(SANITY_FILL)
    }

    /// Zeroes every block whose mark bit is unset; live blocks stay
    /// untouched. Returns the bytes written.
    pub(crate) fn clear_dead_blocks(&mut self) -> usize {
        self.storage().fill_unmarked(&self.bitmap, SANITY_FILL)
    }
}
