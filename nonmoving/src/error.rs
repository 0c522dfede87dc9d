use std::fmt;

use crate::segment::SegmentList;

/// Recoverable allocation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Zero-sized or larger than the biggest size class.
    BadRequest,
    /// No segment could be mapped.
    OutOfMemory,
    /// The heap is being marked or swept.
    CollectionInProgress,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::BadRequest => f.write_str("unsupported allocation size"),
            AllocError::OutOfMemory => f.write_str("out of segments"),
            AllocError::CollectionInProgress => {
                f.write_str("allocation during a collection cycle")
            }
        }
    }
}

impl std::error::Error for AllocError {}

/// Inconsistencies found by [`crate::Heap::verify`] and the checks behind
/// the fatal sweep and block-access paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeapCorruption {
    /// A segment sits on a list its owner tag does not name.
    WrongOwner {
        segment: usize,
        expected: SegmentList,
        found: SegmentList,
    },
    /// A segment on an allocator list has a different block size.
    WrongBlockSize { segment: usize, class: usize },
    /// An active segment whose `next_free` does not name a free block.
    StaleCursor { segment: usize, next_free: usize },
    /// A segment reached twice while walking the lists.
    Duplicate { segment: usize },
    /// A mapped segment that no list reaches.
    Unreachable { segment: usize },
    /// A [`crate::BlockRef`] into a released segment or past its last block.
    StaleBlock { segment: usize, block: usize },
    /// A segment classified free whose cursors do not point at block 0.
    FreeCursor {
        next_free: usize,
        next_free_snap: usize,
    },
}

impl fmt::Display for HeapCorruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapCorruption::WrongOwner {
                segment,
                expected,
                found,
            } => write!(
                f,
                "segment {segment} is on the {expected:?} list but tagged {found:?}"
            ),
            HeapCorruption::WrongBlockSize { segment, class } => write!(
                f,
                "segment {segment} does not match the block size of class {class}"
            ),
            HeapCorruption::StaleCursor { segment, next_free } => write!(
                f,
                "active segment {segment} has next_free {next_free} on a used block"
            ),
            HeapCorruption::Duplicate { segment } => {
                write!(f, "segment {segment} is linked more than once")
            }
            HeapCorruption::Unreachable { segment } => {
                write!(f, "segment {segment} is on no list")
            }
            HeapCorruption::StaleBlock { segment, block } => write!(
                f,
                "block {block} of segment {segment} is not allocated storage"
            ),
            HeapCorruption::FreeCursor {
                next_free,
                next_free_snap,
            } => write!(
                f,
                "free segment with next_free {next_free} / next_free_snap {next_free_snap}"
            ),
        }
    }
}

impl std::error::Error for HeapCorruption {}

/// Internal-consistency failure: the heap can no longer be trusted to hand
/// out sound memory, so the process is terminated.
#[cold]
#[inline(never)]
pub(crate) fn heap_corruption(args: fmt::Arguments<'_>) -> ! {
    log::error!("nonmoving heap corruption: {args}");
    eprintln!("nonmoving heap corruption: {args}");
    std::process::abort()
}
