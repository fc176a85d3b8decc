//! Registered root ranges.
//!
//! Embedders register static storage, handle tables and similar memory as
//! `(start, words, descriptor)` ranges. Precise ranges are scanned and
//! updated in place; conservative ranges only pin what they reference.

use crate::descriptor::RootDescriptor;
use crate::internal::{vec_in, InternalMemType, InternalVec};

const WORD: usize = std::mem::size_of::<usize>();

#[derive(Debug, Clone, Copy)]
pub(crate) struct RootRange {
    pub(crate) start: usize,
    pub(crate) words: usize,
    pub(crate) desc: RootDescriptor,
}

impl RootRange {
    const fn end(&self) -> usize {
        self.start + self.words * WORD
    }
}

/// Root ranges sorted by start address.
pub(crate) struct RootRegistry {
    ranges: InternalVec<RootRange>,
}

impl RootRegistry {
    pub(crate) const fn new() -> Self {
        Self {
            ranges: vec_in(InternalMemType::Roots),
        }
    }

    /// Register `[start, start + words * 8)`. Re-registering a start address
    /// replaces the previous range.
    pub(crate) fn register(&mut self, start: usize, words: usize, desc: RootDescriptor) {
        let range = RootRange { start, words, desc };
        match self.ranges.binary_search_by_key(&start, |r| r.start) {
            Ok(i) => self.ranges[i] = range,
            Err(i) => self.ranges.insert(i, range),
        }
    }

    /// Remove the range starting at `start`. Returns `false` if none was
    /// registered.
    pub(crate) fn unregister(&mut self, start: usize) -> bool {
        match self.ranges.binary_search_by_key(&start, |r| r.start) {
            Ok(i) => {
                self.ranges.remove(i);
                true
            }
            Err(_) => false,
        }
    }

    /// `true` if `addr` lies inside a registered range.
    pub(crate) fn contains(&self, addr: usize) -> bool {
        let i = self.ranges.partition_point(|r| r.start <= addr);
        i > 0 && addr < self.ranges[i - 1].end()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = RootRange> + '_ {
        self.ranges.iter().copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.ranges.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_stay_sorted_and_answer_containment() {
        let mut roots = RootRegistry::new();
        roots.register(0x3000, 4, RootDescriptor::Conservative);
        roots.register(0x1000, 2, RootDescriptor::all_refs(2));
        assert_eq!(roots.iter().map(|r| r.start).collect::<Vec<_>>(), [0x1000, 0x3000]);

        assert!(roots.contains(0x1008));
        assert!(!roots.contains(0x1010));
        assert!(roots.contains(0x3018));
        assert!(!roots.contains(0x0ff8));

        assert!(roots.unregister(0x1000));
        assert!(!roots.unregister(0x1000));
        assert_eq!(roots.len(), 1);
    }

    #[test]
    fn reregistering_replaces() {
        let mut roots = RootRegistry::new();
        roots.register(0x1000, 1, RootDescriptor::Conservative);
        roots.register(0x1000, 8, RootDescriptor::all_refs(8));
        assert_eq!(roots.len(), 1);
        assert!(roots.contains(0x1038));
    }
}
