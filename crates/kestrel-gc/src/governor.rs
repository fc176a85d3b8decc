//! Memory governor: heap ceiling, soft limit and the minor-collection
//! allowance.
//!
//! After every major collection the governor looks at how much the
//! collection reclaimed relative to how much was allocated since the previous
//! one, and sets the allowance: how many bytes minor collections may promote
//! (plus large objects and reported off-heap pressure) before the next major
//! collection is due. The target is to save half of the live heap each time.

use crate::config::GcConfig;
use crate::heap::major::SECTION_SIZE;

const SAVE_TARGET_RATIO: f64 = 0.5;

pub(crate) struct Governor {
    /// Ceiling for sections, large objects and pinned pages (nursery excluded).
    max_heap_size: usize,
    soft_heap_limit: usize,
    min_allowance: usize,
    debug_allowance: bool,

    allocated_heap: usize,
    allowance: usize,
    need_calculate: bool,

    /// Sections mapped since the last major collection ended.
    sections_alloced: usize,
    memory_pressure: usize,

    last_collection_old_num_sections: usize,
    last_collection_old_los_usage: usize,
    last_collection_los_alloced: usize,
    last_collection_los_usage: usize,
}

impl Governor {
    pub(crate) fn new(config: &GcConfig) -> Self {
        let max_heap_size = config
            .max_heap_size
            .map_or(usize::MAX, |max| max.saturating_sub(config.nursery_size));
        let soft_heap_limit = config.soft_heap_limit.unwrap_or(usize::MAX);
        Self {
            max_heap_size,
            soft_heap_limit,
            min_allowance: config.nursery_size,
            debug_allowance: config.debug_allowance,
            allocated_heap: 0,
            allowance: config.nursery_size,
            need_calculate: false,
            sections_alloced: 0,
            memory_pressure: 0,
            last_collection_old_num_sections: 0,
            last_collection_old_los_usage: 0,
            last_collection_los_alloced: 0,
            last_collection_los_usage: 0,
        }
    }

    pub(crate) const fn allowance(&self) -> usize {
        self.allowance
    }

    pub(crate) const fn max_heap_size(&self) -> usize {
        self.max_heap_size
    }

    pub(crate) const fn allocated_heap(&self) -> usize {
        self.allocated_heap
    }

    pub(crate) const fn available_free_space(&self) -> usize {
        self.max_heap_size - if self.allocated_heap < self.max_heap_size {
            self.allocated_heap
        } else {
            self.max_heap_size
        }
    }

    /// Reserve `size` bytes of heap growth. Fails past the ceiling.
    pub(crate) fn try_alloc_space(&mut self, size: usize) -> bool {
        if self.available_free_space() < size {
            return false;
        }
        self.allocated_heap += size;
        true
    }

    /// Account for heap growth that may not be refused.
    pub(crate) fn force_alloc_space(&mut self, size: usize) {
        self.allocated_heap += size;
    }

    pub(crate) fn release_space(&mut self, size: usize) {
        self.allocated_heap = self.allocated_heap.saturating_sub(size);
    }

    /// A section is about to be mapped. Returns `false` past the ceiling
    /// unless `force` is set.
    pub(crate) fn alloc_section(&mut self, force: bool) -> bool {
        if force {
            self.force_alloc_space(SECTION_SIZE);
        } else if !self.try_alloc_space(SECTION_SIZE) {
            return false;
        }
        self.sections_alloced += 1;
        true
    }

    /// External allocations that should bring the next major collection
    /// closer (or, when negative, push it back).
    pub(crate) fn add_memory_pressure(&mut self, bytes: i64) {
        let magnitude = usize::try_from(bytes.unsigned_abs()).unwrap_or(usize::MAX);
        if bytes >= 0 {
            self.memory_pressure = self.memory_pressure.saturating_add(magnitude);
        } else {
            self.memory_pressure = self.memory_pressure.saturating_sub(magnitude);
        }
    }

    fn los_alloced(&self, los_usage: usize) -> usize {
        los_usage - self.last_collection_los_usage.min(los_usage) + self.memory_pressure
    }

    /// `true` if a major collection should run before `space_needed` more
    /// bytes are promoted.
    pub(crate) fn need_major_collection(&self, space_needed: usize, los_usage: usize) -> bool {
        space_needed > self.available_free_space()
            || self.sections_alloced * SECTION_SIZE + self.los_alloced(los_usage) > self.allowance
    }

    pub(crate) fn major_collection_start(&mut self, num_sections: usize, los_usage: usize) {
        self.last_collection_old_num_sections = num_sections;
        self.last_collection_old_los_usage = los_usage;
        self.last_collection_los_alloced = self.los_alloced(los_usage);
        self.need_calculate = true;
    }

    pub(crate) fn major_collection_end(&mut self, num_sections: usize, los_usage: usize) {
        self.last_collection_los_usage = los_usage;
        self.try_calculate_allowance(num_sections, los_usage);
        self.sections_alloced = 0;
        self.memory_pressure = 0;
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn try_calculate_allowance(&mut self, num_sections: usize, los_usage: usize) {
        if !self.need_calculate {
            return;
        }
        let sections_saved = self
            .last_collection_old_num_sections
            .saturating_sub(num_sections);
        let los_saved = self
            .last_collection_old_los_usage
            .saturating_sub(self.last_collection_los_usage)
            .max(1);

        let new_major = num_sections * SECTION_SIZE;
        let new_heap_size = new_major + self.last_collection_los_usage;
        let save_target = (new_heap_size as f64 * SAVE_TARGET_RATIO) as usize;

        let alloced =
            (self.sections_alloced * SECTION_SIZE + self.last_collection_los_alloced) as f64;
        let saved = (sections_saved * SECTION_SIZE + los_saved) as f64;
        let allowance_target = (save_target as f64 * alloced / saved) as usize;

        let mut allowance = allowance_target
            .min(new_major + los_usage)
            .max(self.min_allowance);
        if new_heap_size.saturating_add(allowance) > self.soft_heap_limit {
            allowance = if new_heap_size > self.soft_heap_limit {
                self.min_allowance
            } else {
                (self.soft_heap_limit - new_heap_size).max(self.min_allowance)
            };
        }
        self.allowance = allowance;

        if self.debug_allowance {
            let old_major = self.last_collection_old_num_sections * SECTION_SIZE;
            eprintln!(
                "[GC] Before collection: {} bytes ({} major, {} LOS)",
                old_major + self.last_collection_old_los_usage,
                old_major,
                self.last_collection_old_los_usage
            );
            eprintln!(
                "[GC] After collection: {new_heap_size} bytes ({new_major} major, {} LOS)",
                self.last_collection_los_usage
            );
            eprintln!("[GC] Allowance: {allowance} bytes");
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(allowance, new_heap_size, "minor collection allowance recomputed");

        self.need_calculate = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor(nursery: usize, max: Option<usize>, soft: Option<usize>) -> Governor {
        Governor::new(
            &GcConfig::default()
                .with_nursery_size(nursery)
                .with_max_heap_size(max)
                .with_soft_heap_limit(soft),
        )
    }

    #[test]
    fn ceiling_excludes_the_nursery() {
        let mut gov = governor(1 << 20, Some(8 << 20), None);
        assert_eq!(gov.max_heap_size(), 7 << 20);
        assert!(gov.try_alloc_space(6 << 20));
        assert!(!gov.try_alloc_space(2 << 20));
        gov.release_space(1 << 20);
        assert!(gov.try_alloc_space(2 << 20));
        assert_eq!(gov.available_free_space(), 0);
        assert!(!gov.alloc_section(false));
        assert!(gov.alloc_section(true));
        assert_eq!(gov.available_free_space(), 0);
    }

    #[test]
    fn allowance_tracks_sections_and_pressure() {
        let mut gov = governor(1 << 20, None, None);
        assert_eq!(gov.allowance(), 1 << 20);
        for _ in 0..8 {
            assert!(gov.alloc_section(false));
        }
        assert!(!gov.need_major_collection(0, 0));
        gov.alloc_section(false);
        assert!(gov.need_major_collection(0, 0));

        let mut gov = governor(1 << 20, None, None);
        gov.add_memory_pressure(2 << 20);
        assert!(gov.need_major_collection(0, 0));
        gov.add_memory_pressure(-(2 << 20));
        assert!(!gov.need_major_collection(0, 0));
    }

    #[test]
    fn allowance_is_clamped_by_the_surviving_heap() {
        let mut gov = governor(1 << 20, None, None);
        for _ in 0..100 {
            gov.alloc_section(false);
        }
        gov.major_collection_start(100, 0);
        gov.major_collection_end(60, 0);
        assert_eq!(gov.allowance(), 60 * SECTION_SIZE);
        assert!(!gov.need_major_collection(0, 0));

        // Little promotion against a large saving drops to the minimum.
        for _ in 0..20 {
            gov.alloc_section(false);
        }
        gov.major_collection_start(80, 0);
        gov.major_collection_end(10, 0);
        assert_eq!(gov.allowance(), 1 << 20);
    }

    #[test]
    fn soft_limit_shrinks_the_allowance() {
        let mut gov = governor(1 << 18, None, Some(12 * SECTION_SIZE));
        for _ in 0..100 {
            gov.alloc_section(false);
        }
        gov.major_collection_start(100, 0);
        gov.major_collection_end(10, 0);
        assert_eq!(gov.allowance(), 2 * SECTION_SIZE);

        gov.major_collection_start(20, 0);
        gov.major_collection_end(20, 0);
        assert_eq!(gov.allowance(), 1 << 18);
    }
}
