// ── Heap settings ─────────────────────────────────────────────────────

/// Configuration for the segment heap.
///
/// Size class `c` serves blocks of `1 << (min_block_log + c)` bytes. Every
/// segment holds `segment_size >> log_block_size` blocks of its class.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Bytes of block storage per segment. Must be a multiple of the largest
    /// block size so every class gets at least one block per segment.
    pub segment_size: usize,
    /// log2 of the smallest block size (3 = 8 bytes, one machine word).
    pub min_block_log: u8,
    /// Number of size classes, i.e. allocators.
    pub size_classes: usize,
    /// Upper bound on mapped segments.
    pub max_segments: usize,
    /// High-water mark for the free list after a sweep. Free segments beyond
    /// it are unmapped. `None` keeps all of them.
    pub max_free_segments: Option<usize>,
    /// Zero dead memory during sweep so stale references read a fixed
    /// pattern. Does not change which list a segment ends up on.
    pub sanity_clear: bool,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            segment_size: 32_768, // 32 KB
            min_block_log: 3,     // 8 Bytes
            size_classes: 10,     // 8 B ..= 4 KB
            max_segments: 16_384, // 512 MB
            max_free_segments: Some(64),
            sanity_clear: cfg!(feature = "sanity"),
        }
    }
}

impl HeapSettings {
    #[inline]
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.segment_size == 0 || self.size_classes == 0 {
            return Err("Sizes must be > 0");
        }
        if self.min_block_log < 3 {
            return Err("blocks must hold at least one machine word");
        }
        let max_log = self.min_block_log as usize + self.size_classes - 1;
        if max_log >= usize::BITS as usize - 1 || max_log > u8::MAX as usize
        {
            return Err("too many size classes");
        }
        if !self.segment_size.is_multiple_of(1 << max_log) {
            return Err("segment_size must be a multiple of the largest block size");
        }
        if self.max_segments == 0 {
            return Err("max_segments must be > 0");
        }
        Ok(())
    }

    /// log2 of the block size served by `class`.
    #[inline]
    pub fn log_block_size(&self, class: usize) -> u8 {
        debug_assert!(class < self.size_classes);
        self.min_block_log + class as u8
    }

    #[inline]
    pub fn block_size(&self, class: usize) -> usize {
        1 << self.log_block_size(class)
    }

    #[inline]
    pub fn max_block_size(&self) -> usize {
        self.block_size(self.size_classes - 1)
    }

    /// Smallest class whose blocks fit `size` bytes.
    pub fn size_class_for(&self, size: usize) -> Option<usize> {
        if size == 0 || size > self.max_block_size() {
            return None;
        }
        let log = size.next_power_of_two().trailing_zeros() as usize;
        Some(log.saturating_sub(self.min_block_log as usize))
    }

    /// Class owning segments of `log_block_size`.
    pub fn class_of_log(&self, log_block_size: u8) -> Option<usize> {
        let class = log_block_size.checked_sub(self.min_block_log)? as usize;
        (class < self.size_classes).then_some(class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        let settings = HeapSettings::default();
        assert_eq!(settings.validate(), Ok(()));
        assert_eq!(settings.max_block_size(), 4096);
        assert_eq!(settings.segment_size / settings.block_size(0), 4096);
    }

    #[test]
    fn size_classes_round_up() {
        let settings = HeapSettings::default();
        assert_eq!(settings.size_class_for(0), None);
        assert_eq!(settings.size_class_for(1), Some(0));
        assert_eq!(settings.size_class_for(8), Some(0));
        assert_eq!(settings.size_class_for(9), Some(1));
        assert_eq!(settings.size_class_for(16), Some(1));
        assert_eq!(settings.size_class_for(100), Some(4));
        assert_eq!(settings.size_class_for(4096), Some(9));
        assert_eq!(settings.size_class_for(4097), None);
    }

    #[test]
    fn class_of_log_inverts_log_block_size() {
        let settings = HeapSettings::default();
        for class in 0..settings.size_classes {
            let log = settings.log_block_size(class);
            assert_eq!(settings.class_of_log(log), Some(class));
        }
        assert_eq!(settings.class_of_log(2), None);
        assert_eq!(settings.class_of_log(13), None);
    }

    #[test]
    fn rejects_segments_smaller_than_largest_block() {
        let settings = HeapSettings {
            segment_size: 2048,
            ..HeapSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_sub_word_blocks() {
        let settings = HeapSettings {
            min_block_log: 2,
            ..HeapSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn tiny_segments_are_allowed() {
        let settings = HeapSettings {
            segment_size: 64,
            min_block_log: 3,
            size_classes: 2,
            ..HeapSettings::default()
        };
        assert_eq!(settings.validate(), Ok(()));
        assert_eq!(settings.segment_size >> settings.log_block_size(1), 4);
    }
}
