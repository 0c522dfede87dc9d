//! Block storage, kept apart from the segment lists.
//!
//! The lists and bitmaps belong to the [`crate::Heap`] and change only under
//! `&mut Heap`. The bytes of a segment sit behind their own lock, so mutators
//! can read and write live blocks through a [`StorageTable`] while a
//! collection holds the heap. The sweep takes a segment's lock only while it
//! clears that segment's dead blocks.

use std::{ops::Range, sync::Arc};

use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard,
    RwLockWriteGuard,
};

use crate::{
    error::{HeapCorruption, heap_corruption},
    heap::BlockRef,
    segment::UNMARKED,
    system::SegmentMemory,
};

#[derive(Debug)]
struct Blocks {
    memory: SegmentMemory,
    log_block_size: u8,
}

impl Blocks {
    #[inline]
    fn range(&self, block: usize) -> Option<Range<usize>> {
        if block >= self.memory.size() >> self.log_block_size {
            return None;
        }
        let start = block << self.log_block_size;
        Some(start..start + (1 << self.log_block_size))
    }
}

/// The memory of one segment, split into blocks of its current size class.
#[derive(Debug)]
pub struct SegmentStorage {
    size: usize,
    blocks: RwLock<Blocks>,
}

impl SegmentStorage {
    pub(crate) fn new(memory: SegmentMemory, log_block_size: u8) -> Self {
        Self {
            size: memory.size(),
            blocks: RwLock::new(Blocks {
                memory,
                log_block_size,
            }),
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn log_block_size(&self) -> u8 {
        self.blocks.read().log_block_size
    }

    pub(crate) fn set_log_block_size(&self, log_block_size: u8) {
        self.blocks.write().log_block_size = log_block_size;
    }

    /// `None` if `block` is past the last block.
    pub fn block(
        &self,
        block: usize,
    ) -> Option<MappedRwLockReadGuard<'_, [u8]>> {
        let blocks = self.blocks.read();
        let range = blocks.range(block)?;
        Some(RwLockReadGuard::map(blocks, |blocks| {
            &blocks.memory.as_slice()[range]
        }))
    }

    pub fn block_mut(
        &self,
        block: usize,
    ) -> Option<MappedRwLockWriteGuard<'_, [u8]>> {
        let blocks = self.blocks.write();
        let range = blocks.range(block)?;
        Some(RwLockWriteGuard::map(blocks, |blocks| {
            &mut blocks.memory.as_mut_slice()[range]
        }))
    }

    /// Overwrites the whole segment. Returns the bytes written.
    pub(crate) fn fill(&self, byte: u8) -> usize {
        let mut blocks = self.blocks.write();
        let bytes = blocks.memory.as_mut_slice();
        bytes.fill(byte);
        bytes.len()
    }

    /// Overwrites every block whose bitmap byte is unmarked. Returns the
    /// bytes written.
    pub(crate) fn fill_unmarked(&self, bitmap: &[u8], byte: u8) -> usize {
        let mut guard = self.blocks.write();
        let blocks = &mut *guard;
        let block_size = 1usize << blocks.log_block_size;

        let mut written = 0;
        for (chunk, &bit) in blocks
            .memory
            .as_mut_slice()
            .chunks_exact_mut(block_size)
            .zip(bitmap)
        {
            // after mark, so bit not set == dead
            if bit == UNMARKED {
                chunk.fill(byte);
                written += block_size;
            }
        }
        written
    }
}

/// Segment id to storage, shared by the heap and its mutator handles.
///
/// The heap inserts an entry whenever it maps a segment and removes it when
/// the segment is released. Lookups clone the entry out, so the table lock is
/// never held while a block is accessed.
#[derive(Debug, Clone, Default)]
pub struct StorageTable {
    slots: Arc<RwLock<Vec<Option<Arc<SegmentStorage>>>>>,
}

impl StorageTable {
    pub(crate) fn insert(&self, segment: usize, storage: Arc<SegmentStorage>) {
        let mut slots = self.slots.write();
        if slots.len() <= segment {
            slots.resize(segment + 1, None);
        }
        slots[segment] = Some(storage);
    }

    pub(crate) fn remove(&self, segment: usize) {
        if let Some(slot) = self.slots.write().get_mut(segment) {
            *slot = None;
        }
    }

    /// Storage of a mapped segment.
    pub fn get(&self, segment: usize) -> Option<Arc<SegmentStorage>> {
        self.slots.read().get(segment)?.clone()
    }

    /// Storage holding `block`, or why the reference is stale.
    pub fn check_block(
        &self,
        block: BlockRef,
    ) -> Result<Arc<SegmentStorage>, HeapCorruption> {
        let stale = HeapCorruption::StaleBlock {
            segment: block.segment,
            block: block.block,
        };
        let storage = self.get(block.segment).ok_or(stale.clone())?;
        if block.block >= storage.size() >> storage.log_block_size() {
            return Err(stale);
        }
        Ok(storage)
    }

    fn storage_of(&self, block: BlockRef) -> Arc<SegmentStorage> {
        match self.check_block(block) {
            Ok(storage) => storage,
            Err(err) => heap_corruption(format_args!("{err}")),
        }
    }

    /// Runs `f` on the bytes of `block` under its segment's read lock.
    pub fn with_block<R>(
        &self,
        block: BlockRef,
        f: impl FnOnce(&[u8]) -> R,
    ) -> R {
        let storage = self.storage_of(block);
        let Some(bytes) = storage.block(block.block) else {
            heap_corruption(format_args!(
                "block {} of segment {} changed size class while in use",
                block.block, block.segment
            ));
        };
        f(&*bytes)
    }

    /// Runs `f` on the bytes of `block` under its segment's write lock.
    pub fn with_block_mut<R>(
        &self,
        block: BlockRef,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> R {
        let storage = self.storage_of(block);
        let Some(mut bytes) = storage.block_mut(block.block) else {
            heap_corruption(format_args!(
                "block {} of segment {} changed size class while in use",
                block.block, block.segment
            ));
        };
        f(&mut *bytes)
    }
}
