//! Sweep phase.
//!
//! [`Heap::prepare_sweep`] moves every allocator's filled list onto the
//! global sweep list. [`Sweeper`] then pops segments one at a time,
//! classifies them from their mark bitmap and pushes each onto the free
//! list, its allocator's active list, or back onto its filled list.

use std::{fmt, mem};

use crate::{
    error::{HeapCorruption, heap_corruption},
    heap::{GcPhase, Heap},
    segment::{NO_SEGMENT, SegmentList, SweepResult},
};

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Segments moved onto the sweep list.
    pub prepared: usize,
    pub freed: usize,
    pub partial: usize,
    pub filled: usize,
    /// Free segments unmapped by the trim after the sweep.
    pub released: usize,
    /// Bytes overwritten by sanity clearing.
    pub cleared_bytes: usize,
}

impl SweepStats {
    pub fn swept(&self) -> usize {
        self.freed + self.partial + self.filled
    }
}

impl fmt::Display for SweepStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "swept {} segments: {} free, {} partial, {} filled, {} released",
            self.swept(),
            self.freed,
            self.partial,
            self.filled,
            self.released
        )?;
        if self.cleared_bytes > 0 {
            write!(f, ", {} bytes cleared", self.cleared_bytes)?;
        }
        Ok(())
    }
}

impl Heap {
    /// Moves all filled segments onto the sweep list and returns the
    /// handle that sweeps them.
    ///
    /// Must not run concurrently with allocation or marking; holding
    /// `&mut Heap` guarantees that. The bitmaps of the filled segments must
    /// hold the result of a completed mark phase.
    pub fn prepare_sweep(&mut self) -> Sweeper<'_> {
        debug_assert!(matches!(self.phase, GcPhase::Idle | GcPhase::Marking));
        debug_assert_eq!(self.sweep_list, NO_SEGMENT);
        self.phase = GcPhase::Preparing;

        let mut prepared = 0;
        for class in 0..self.allocators.len() {
            let filled =
                mem::replace(&mut self.allocators[class].filled, NO_SEGMENT);
            if filled == NO_SEGMENT {
                continue;
            }

            // Link filled to sweep_list
            let mut tail = filled;
            loop {
                let segment = &mut self.segments[tail];
                debug_assert_eq!(segment.list, SegmentList::Filled(class));
                segment.list = SegmentList::Sweep;
                prepared += 1;
                if segment.link == NO_SEGMENT {
                    break;
                }
                tail = segment.link;
            }
            self.segments[tail].link = self.sweep_list;
            self.sweep_list = filled;
        }

        log::debug!("sweep prepared with {prepared} filled segments");
        self.phase = GcPhase::Sweeping;

        Sweeper {
            heap: self,
            stats: SweepStats {
                prepared,
                ..SweepStats::default()
            },
        }
    }

    /// Detaches the head of the sweep list.
    ///
    /// A head that is not tagged [`SegmentList::Sweep`] is left in place and
    /// reported.
    pub(crate) fn unlink_sweep_head(
        &mut self,
    ) -> Result<Option<usize>, HeapCorruption> {
        let id = self.sweep_list;
        if id == NO_SEGMENT {
            return Ok(None);
        }
        let segment = &mut self.segments[id];
        if segment.list != SegmentList::Sweep {
            return Err(HeapCorruption::WrongOwner {
                segment: id,
                expected: SegmentList::Sweep,
                found: segment.list,
            });
        }

        // Pushing the segment to one of the free/active/filled lists
        // updates the link field, so update sweep_list here
        self.sweep_list = segment.link;
        segment.link = NO_SEGMENT;
        segment.list = SegmentList::Unlinked;
        Ok(Some(id))
    }
}

// ── Sweeper ───────────────────────────────────────────────────────────

/// Drains the sweep list.
///
/// Dropping a sweeper finishes the remaining work, so segments are never
/// left stranded on the sweep list.
#[derive(Debug)]
pub struct Sweeper<'h> {
    heap: &'h mut Heap,
    stats: SweepStats,
}

impl Sweeper<'_> {
    #[inline]
    pub fn heap(&self) -> &Heap {
        self.heap
    }

    #[inline]
    pub fn stats(&self) -> SweepStats {
        self.stats
    }

    /// Sweeps the whole list, trims the free list and returns to
    /// [`GcPhase::Idle`].
    pub fn sweep(mut self) -> SweepStats {
        while self.sweep_segment().is_some() {}
        self.finish();
        self.stats
    }

    /// Classifies and redistributes the head of the sweep list.
    ///
    /// Returns `None` once the list is empty.
    pub fn sweep_segment(&mut self) -> Option<(usize, SweepResult)> {
        let heap = &mut *self.heap;
        let id = match heap.unlink_sweep_head() {
            Ok(id) => id?,
            Err(err) => heap_corruption(format_args!("{err}")),
        };

        let sanity = heap.settings.sanity_clear;
        let segment = &mut heap.segments[id];
        let result = segment.classify();
        match result {
            SweepResult::Free => {
                if sanity {
                    self.stats.cleared_bytes += segment.clear();
                }
                heap.push_free(id);
                self.stats.freed += 1;
            }
            SweepResult::Partial => {
                if sanity {
                    self.stats.cleared_bytes += segment.clear_dead_blocks();
                }
                heap.push_active(id);
                self.stats.partial += 1;
            }
            SweepResult::Filled => {
                heap.push_filled(id);
                self.stats.filled += 1;
            }
        }

        log::trace!("swept segment {id}: {result:?}");
        Some((id, result))
    }

    fn finish(&mut self) {
        if self.heap.phase != GcPhase::Sweeping {
            return;
        }
        debug_assert_eq!(self.heap.sweep_list, NO_SEGMENT);

        self.stats.released = self.heap.trim_free_segments();
        self.heap.phase = GcPhase::Idle;
        log::debug!("{}", self.stats);
    }
}

impl Drop for Sweeper<'_> {
    fn drop(&mut self) {
        if self.heap.phase == GcPhase::Sweeping {
            while self.sweep_segment().is_some() {}
            self.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{
        BlockRef,
        tests::{fill_segments, tiny_settings},
    };
    use crate::{HeapSettings, segment::SANITY_FILL};

    fn sanity_settings() -> HeapSettings {
        HeapSettings {
            sanity_clear: true,
            ..tiny_settings()
        }
    }

    fn fill_pattern(heap: &mut Heap, blocks: &[BlockRef]) {
        for (i, &block) in blocks.iter().enumerate() {
            heap.block_mut(block).fill(0x40 + i as u8);
        }
    }

    #[test]
    fn partial_segment_becomes_active() {
        let mut heap = Heap::new(sanity_settings());
        let blocks = fill_segments(&mut heap, 1);
        fill_pattern(&mut heap, &blocks);

        let mut marker = heap.begin_mark();
        marker.mark(blocks[0]);
        marker.mark(blocks[2]);
        let stats = marker.prepare_sweep().sweep();

        assert_eq!(stats.partial, 1);
        assert_eq!(stats.cleared_bytes, 32);
        assert_eq!(heap.active_segments(1).collect::<Vec<_>>(), [0]);
        assert_eq!(heap.filled_segments(1).count(), 0);

        let segment = heap.segment(0);
        assert_eq!(segment.next_free(), 1);
        assert_eq!(segment.next_free_snap(), 1);
        assert!(heap.block(blocks[0]).iter().all(|&b| b == 0x40));
        assert!(heap.block(blocks[1]).iter().all(|&b| b == SANITY_FILL));
        assert!(heap.block(blocks[2]).iter().all(|&b| b == 0x42));
        assert!(heap.block(blocks[3]).iter().all(|&b| b == SANITY_FILL));
    }

    #[test]
    fn without_sanity_dead_blocks_are_untouched() {
        let mut heap = Heap::new(tiny_settings());
        let blocks = fill_segments(&mut heap, 1);
        fill_pattern(&mut heap, &blocks);

        let mut marker = heap.begin_mark();
        marker.mark(blocks[0]);
        marker.mark(blocks[2]);
        let stats = marker.prepare_sweep().sweep();

        assert_eq!(stats.cleared_bytes, 0);
        assert_eq!(heap.segment(0).list(), SegmentList::Active(1));
        assert_eq!(heap.segment(0).next_free(), 1);
        for (i, &block) in blocks.iter().enumerate() {
            assert!(heap.block(block).iter().all(|&b| b == 0x40 + i as u8));
        }
    }

    #[test]
    fn sanity_mode_does_not_change_placement() {
        let run = |sanity: bool| {
            let mut heap = Heap::new(HeapSettings {
                sanity_clear: sanity,
                ..tiny_settings()
            });
            let blocks = fill_segments(&mut heap, 3);
            let mut marker = heap.begin_mark();
            for &i in &[0, 1, 2, 3, 5] {
                marker.mark(blocks[i]);
            }
            marker.prepare_sweep().sweep();
            let lists: Vec<_> = (0..heap.segment_count())
                .map(|id| (heap.segment(id).list(), heap.segment(id).next_free()))
                .collect();
            lists
        };
        assert_eq!(run(false), run(true));
    }

    #[test]
    fn live_and_dead_segments_split() {
        let mut heap = Heap::new(tiny_settings());
        let blocks = fill_segments(&mut heap, 2);

        let mut marker = heap.begin_mark();
        for &block in &blocks[..4] {
            marker.mark(block);
        }
        let stats = marker.prepare_sweep().sweep();

        assert_eq!(stats.prepared, 2);
        assert_eq!(stats.filled, 1);
        assert_eq!(stats.freed, 1);
        assert_eq!(heap.filled_segments(1).collect::<Vec<_>>(), [0]);
        assert_eq!(heap.free_segments().collect::<Vec<_>>(), [1]);
        assert_eq!(heap.active_segments(1).count(), 0);
    }

    #[test]
    fn free_segment_is_wiped_in_sanity_mode() {
        let mut heap = Heap::new(sanity_settings());
        let blocks = fill_segments(&mut heap, 1);
        fill_pattern(&mut heap, &blocks);

        let stats = heap.begin_mark().prepare_sweep().sweep();

        assert_eq!(stats.freed, 1);
        assert_eq!(stats.cleared_bytes, 64);
        for &block in &blocks {
            assert!(heap.block(block).iter().all(|&b| b == SANITY_FILL));
        }
        assert_eq!(heap.segment(0).live_blocks(), 0);
    }

    #[test]
    fn filled_segment_is_never_cleared() {
        let mut heap = Heap::new(sanity_settings());
        let blocks = fill_segments(&mut heap, 1);
        fill_pattern(&mut heap, &blocks);

        let mut marker = heap.begin_mark();
        for &block in &blocks {
            marker.mark(block);
        }
        let stats = marker.prepare_sweep().sweep();

        assert_eq!(stats.filled, 1);
        assert_eq!(stats.cleared_bytes, 0);
        for (i, &block) in blocks.iter().enumerate() {
            assert!(heap.block(block).iter().all(|&b| b == 0x40 + i as u8));
        }
    }

    #[test]
    fn segments_are_conserved() {
        let mut heap = Heap::new(tiny_settings());
        let blocks = fill_segments(&mut heap, 6);
        // one extra active segment of each class, never swept
        heap.allocate(8).unwrap();
        heap.allocate(16).unwrap();
        let before = heap.verify().unwrap();
        assert_eq!(before.filled, 6);
        assert_eq!(before.active, 2);

        let mut marker = heap.begin_mark();
        // segment 0: all live, 1: none, 2..: every other block
        for &block in &blocks[..4] {
            marker.mark(block);
        }
        for &block in blocks[8..].iter().step_by(2) {
            marker.mark(block);
        }
        let stats = marker.prepare_sweep().sweep();
        let after = heap.verify().unwrap();

        assert_eq!(stats.swept(), 6);
        assert_eq!(after.mapped(), before.mapped());
        assert_eq!(after.free, 1);
        assert_eq!(after.filled, 1);
        assert_eq!(after.active, 2 + 4);
        assert_eq!(after.sweep, 0);
    }

    #[test]
    fn prepare_splices_filled_lists_in_order() {
        let mut heap = Heap::new(tiny_settings());
        fill_segments(&mut heap, 3);
        let filled: Vec<_> = heap.filled_segments(1).collect();
        assert_eq!(filled, [2, 1, 0]);

        let sweeper = heap.prepare_sweep();
        let heap = sweeper.heap();
        assert_eq!(heap.phase(), GcPhase::Sweeping);
        assert_eq!(heap.filled_segments(1).count(), 0);
        let pending: Vec<_> = heap.iter_list(heap.sweep_list_head()).collect();
        assert_eq!(pending, filled);
        assert!(
            pending
                .iter()
                .all(|&id| heap.segment(id).list() == SegmentList::Sweep)
        );
    }

    #[test]
    fn sweep_segment_steps_through_the_list() {
        let mut heap = Heap::new(tiny_settings());
        let blocks = fill_segments(&mut heap, 2);
        let mut marker = heap.begin_mark();
        marker.mark(blocks[5]);
        let mut sweeper = marker.prepare_sweep();

        assert_eq!(sweeper.sweep_segment(), Some((1, SweepResult::Partial)));
        assert_eq!(sweeper.heap().sweep_list_head(), 0);
        assert_eq!(sweeper.sweep_segment(), Some((0, SweepResult::Free)));
        assert_eq!(sweeper.sweep_segment(), None);
        assert_eq!(sweeper.stats().swept(), 2);

        let stats = sweeper.sweep();
        assert_eq!(stats.partial, 1);
        assert_eq!(stats.freed, 1);
        assert_eq!(heap.phase(), GcPhase::Idle);
        // block 4 was the first dead block of segment 1
        assert_eq!(heap.segment(1).next_free(), 0);
    }

    #[test]
    fn mistagged_sweep_head_is_reported_and_left_in_place() {
        let mut heap = Heap::new(tiny_settings());
        fill_segments(&mut heap, 2);
        {
            let mut sweeper = heap.begin_mark().prepare_sweep();
            let head = sweeper.heap().sweep_list_head();

            sweeper.heap.segments[head].list = SegmentList::Filled(1);
            assert_eq!(
                sweeper.heap.unlink_sweep_head(),
                Err(HeapCorruption::WrongOwner {
                    segment: head,
                    expected: SegmentList::Sweep,
                    found: SegmentList::Filled(1),
                })
            );
            assert_eq!(sweeper.heap().sweep_list_head(), head);

            sweeper.heap.segments[head].list = SegmentList::Sweep;
            assert_eq!(sweeper.heap.unlink_sweep_head(), Ok(Some(head)));
            assert_eq!(
                sweeper.heap().segment(head).list(),
                SegmentList::Unlinked
            );
            assert_ne!(sweeper.heap().sweep_list_head(), head);
            sweeper.heap.push_free(head);
        }
        assert_eq!(heap.verify().unwrap().free, 2);
    }

    #[test]
    fn dropped_sweeper_finishes_the_cycle() {
        let mut heap = Heap::new(tiny_settings());
        fill_segments(&mut heap, 4);
        {
            let mut sweeper = heap.begin_mark().prepare_sweep();
            sweeper.sweep_segment();
        }
        assert_eq!(heap.phase(), GcPhase::Idle);
        assert_eq!(heap.sweep_list_head(), NO_SEGMENT);
        assert_eq!(heap.verify().unwrap().free, 4);
    }

    #[test]
    fn sweep_trims_free_segments() {
        let mut heap = Heap::new(HeapSettings {
            max_free_segments: Some(2),
            ..tiny_settings()
        });
        fill_segments(&mut heap, 5);

        let stats = heap.begin_mark().prepare_sweep().sweep();

        assert_eq!(stats.freed, 5);
        assert_eq!(stats.released, 3);
        let census = heap.verify().unwrap();
        assert_eq!(census.free, 2);
        assert_eq!(census.released, 3);
    }

    #[test]
    fn empty_heap_sweeps_to_idle() {
        let mut heap = Heap::new(tiny_settings());
        let stats = heap.prepare_sweep().sweep();
        assert_eq!(stats, SweepStats::default());
        assert_eq!(heap.phase(), GcPhase::Idle);
    }

    #[test]
    fn partial_segment_allocates_from_dead_blocks() {
        let mut heap = Heap::new(tiny_settings());
        let blocks = fill_segments(&mut heap, 1);
        let mut marker = heap.begin_mark();
        marker.mark(blocks[0]);
        marker.mark(blocks[2]);
        marker.prepare_sweep().sweep();

        assert_eq!(heap.allocate(16).unwrap(), blocks[1]);
        assert_eq!(heap.segment(0).next_free(), 3);
        assert_eq!(heap.allocate(16).unwrap(), blocks[3]);
        assert_eq!(heap.segment(0).list(), SegmentList::Filled(1));
        assert_eq!(heap.allocate(16).unwrap().segment, 1);
    }

    #[test]
    fn stats_display() {
        let stats = SweepStats {
            prepared: 3,
            freed: 1,
            partial: 1,
            filled: 1,
            released: 0,
            cleared_bytes: 16,
        };
        assert_eq!(
            stats.to_string(),
            "swept 3 segments: 1 free, 1 partial, 1 filled, 0 released, 16 bytes cleared"
        );
    }
}
