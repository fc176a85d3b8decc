//! Large-object space: one OS mapping per object.
//!
//! Large objects never move. A major collection marks the reachable ones and
//! unmaps the rest.

use std::collections::BTreeMap;
use std::io;

use sys_alloc::{Mmap, MmapOptions};

struct LargeObject {
    _map: Mmap,
    size: usize,
    marked: bool,
}

/// Outcome of a large-object sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LosSweep {
    pub(crate) objects_freed: usize,
    pub(crate) bytes_freed: usize,
}

#[derive(Default)]
pub(crate) struct LargeObjectSpace {
    objects: BTreeMap<usize, LargeObject>,
    memory_usage: usize,
}

impl LargeObjectSpace {
    pub(crate) const fn new() -> Self {
        Self {
            objects: BTreeMap::new(),
            memory_usage: 0,
        }
    }

    /// Bytes held by large objects (rounded to pages).
    pub(crate) const fn memory_usage(&self) -> usize {
        self.memory_usage
    }

    pub(crate) fn len(&self) -> usize {
        self.objects.len()
    }

    /// Bytes a `size`-byte object will occupy.
    pub(crate) fn footprint(size: usize) -> usize {
        size.next_multiple_of(sys_alloc::page_size())
    }

    /// Map a zeroed region for a `size`-byte object.
    pub(crate) fn alloc(&mut self, size: usize) -> io::Result<usize> {
        let footprint = Self::footprint(size);
        // SAFETY: fresh anonymous mapping.
        let map = unsafe { MmapOptions::new().len(footprint).map_anon()? };
        let addr = map.ptr() as usize;
        self.objects.insert(
            addr,
            LargeObject {
                _map: map,
                size: footprint,
                marked: false,
            },
        );
        self.memory_usage += footprint;
        Ok(addr)
    }

    /// Start of the large object containing `addr`.
    pub(crate) fn find_object(&self, addr: usize) -> Option<usize> {
        let (&start, obj) = self.objects.range(..=addr).next_back()?;
        (addr < start + obj.size).then_some(start)
    }

    pub(crate) fn contains(&self, addr: usize) -> bool {
        self.find_object(addr).is_some()
    }

    /// Mark the object starting at `start`. Returns `true` the first time.
    pub(crate) fn mark(&mut self, start: usize) -> bool {
        self.objects
            .get_mut(&start)
            .is_some_and(|obj| !std::mem::replace(&mut obj.marked, true))
    }

    pub(crate) fn is_marked(&self, start: usize) -> bool {
        self.objects.get(&start).is_some_and(|obj| obj.marked)
    }

    /// Unmap every unmarked object and clear the marks of the rest.
    pub(crate) fn sweep(&mut self) -> LosSweep {
        let mut stats = LosSweep::default();
        self.objects.retain(|_, obj| {
            if std::mem::replace(&mut obj.marked, false) {
                true
            } else {
                stats.objects_freed += 1;
                stats.bytes_freed += obj.size;
                false
            }
        });
        self.memory_usage -= stats.bytes_freed;
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interior_lookup_and_sweep() {
        let mut los = LargeObjectSpace::new();
        let a = los.alloc(10_000).unwrap();
        let b = los.alloc(20_000).unwrap();
        assert_eq!(los.find_object(a + 9_999), Some(a));
        assert_eq!(los.find_object(b), Some(b));
        assert_ne!(los.find_object(a - 8), Some(a));

        assert!(los.mark(b));
        assert!(!los.mark(b));
        let swept = los.sweep();
        assert_eq!(swept.objects_freed, 1);
        assert_eq!(swept.bytes_freed, LargeObjectSpace::footprint(10_000));
        assert_eq!(los.len(), 1);
        assert!(!los.is_marked(b));
        assert_eq!(los.memory_usage(), LargeObjectSpace::footprint(20_000));
    }
}
