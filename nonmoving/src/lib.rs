//! Segment allocator and sweep phase of a non-moving mark-and-sweep
//! collector.
//!
//! Memory is carved into fixed-size segments of equally sized blocks, one
//! [`Allocator`] per size class. After a mark phase has filled in the
//! bitmaps, [`Heap::prepare_sweep`] and [`Sweeper::sweep`] reclaim empty
//! segments, return partially live ones to allocation and keep full ones for
//! the next cycle. Live objects never move.

mod allocator;
mod collector;
mod error;
mod heap;
mod segment;
mod settings;
mod storage;
mod sweep;
mod system;

pub use allocator::Allocator;
pub use collector::{Collector, Mutator};
pub use error::{AllocError, HeapCorruption};
pub use heap::{BlockRef, GcPhase, Heap, HeapCensus, Marker};
pub use segment::{
    MARKED, NO_SEGMENT, SANITY_FILL, Segment, SegmentList, SweepResult,
    UNMARKED,
};
pub use settings::HeapSettings;
pub use storage::{SegmentStorage, StorageTable};
pub use sweep::{SweepStats, Sweeper};
pub use system::{OS_PAGE_SIZE, SegmentMemory};
