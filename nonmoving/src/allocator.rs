use crate::segment::NO_SEGMENT;

/// Segment pools of one size class.
///
/// Both fields are heads of intrusive lists threaded through
/// [`crate::Segment`] links.
#[derive(Debug)]
pub struct Allocator {
    log_block_size: u8,
    /// Segments with at least one free block.
    pub(crate) active: usize,
    /// Segments without free blocks, swept on the next cycle.
    pub(crate) filled: usize,
}

impl Allocator {
    pub fn new(log_block_size: u8) -> Self {
        Self {
            log_block_size,
            active: NO_SEGMENT,
            filled: NO_SEGMENT,
        }
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
    pub fn active_head(&self) -> usize {
        self.active
    }

    #[inline]
    pub fn filled_head(&self) -> usize {
        self.filled
    }
}
