//! The nursery: one region aligned to its own size.
//!
//! Threads bump-allocate inside leased buffers carved from the fragment list.
//! Scan starts record, for every 8 KiB of the nursery, the lowest address
//! where an object was placed, so an interior pointer can be resolved by
//! walking at most one chunk of objects.

use std::sync::atomic::{AtomicUsize, Ordering};

use sys_alloc::{Mmap, MmapOptions};

use super::{find_object_from, lower_scan_start, take_range, zero_range, Fragment};
use super::{FRAGMENT_MIN_SIZE, SCAN_START_SIZE};
use crate::error::{GcError, GcResult};
use crate::internal::{vec_in, InternalMemType, InternalVec};
use crate::object::ObjectHeader;
use crate::scan::object_size;

pub(crate) struct Nursery {
    _map: Mmap,
    start: usize,
    end: usize,
    mask: usize,
    scan_starts: Box<[AtomicUsize]>,
}

impl Nursery {
    pub(crate) fn new(size: usize) -> GcResult<Self> {
        // SAFETY: fresh anonymous mapping.
        let map = unsafe { MmapOptions::new().len(size).align(size).map_anon() }
            .map_err(|source| GcError::OutOfMemory {
                requested: size,
                source,
            })?;
        let start = map.ptr() as usize;
        let scan_starts = (0..size / SCAN_START_SIZE)
            .map(|_| AtomicUsize::new(0))
            .collect();
        Ok(Self {
            _map: map,
            start,
            end: start + size,
            mask: !(size - 1),
            scan_starts,
        })
    }

    #[inline]
    pub(crate) const fn contains(&self, addr: usize) -> bool {
        addr & self.mask == self.start
    }

    pub(crate) const fn start(&self) -> usize {
        self.start
    }

    pub(crate) const fn size(&self) -> usize {
        self.end - self.start
    }

    /// Note that an object is (or is about to be) placed at `addr`.
    #[inline]
    pub(crate) fn record_scan_start(&self, addr: usize) {
        let idx = (addr - self.start) / SCAN_START_SIZE;
        lower_scan_start(&self.scan_starts[idx], addr);
    }

    /// Start of the object whose extent contains `addr`, if any.
    ///
    /// # Safety
    ///
    /// All threads must be stopped with their buffers retired.
    pub(crate) unsafe fn find_object(&self, addr: usize) -> Option<usize> {
        if !self.contains(addr) {
            return None;
        }
        let mut idx = (addr - self.start) / SCAN_START_SIZE;
        let from = loop {
            let start = self.scan_starts[idx].load(Ordering::Relaxed);
            if start != 0 && start <= addr {
                break start;
            }
            if idx == 0 {
                break self.start;
            }
            idx -= 1;
        };
        unsafe { find_object_from(from, addr) }
    }

    /// Rebuild `frags` from the pinned survivors (sorted, deduplicated).
    ///
    /// Every byte outside a pinned object is zeroed. Pinned objects are
    /// unpinned and become the only scan starts. Returns the free bytes.
    ///
    /// # Safety
    ///
    /// Must run at the end of a collection, after every other survivor has
    /// been copied out.
    pub(crate) unsafe fn build_fragments(
        &self,
        pinned: &[usize],
        frags: &mut NurseryFragments,
    ) -> usize {
        frags.list.clear();
        for slot in &*self.scan_starts {
            slot.store(0, Ordering::Relaxed);
        }

        let mut free = 0;
        let mut cursor = self.start;
        for &obj in pinned {
            free += unsafe { Self::add_gap(cursor, obj, &mut frags.list) };
            let size = unsafe { object_size(obj) };
            unsafe { ObjectHeader::at(obj) }.unpin();
            self.record_scan_start(obj);
            cursor = obj + size;
        }
        free += unsafe { Self::add_gap(cursor, self.end, &mut frags.list) };
        free
    }

    unsafe fn add_gap(from: usize, to: usize, list: &mut InternalVec<Fragment>) -> usize {
        if to <= from {
            return 0;
        }
        unsafe { zero_range(from, to) };
        if to - from >= FRAGMENT_MIN_SIZE {
            list.push(Fragment {
                start: from,
                end: to,
            });
            to - from
        } else {
            0
        }
    }
}

/// Free nursery ranges, rebuilt after every collection.
pub(crate) struct NurseryFragments {
    list: InternalVec<Fragment>,
}

impl NurseryFragments {
    pub(crate) const fn new() -> Self {
        Self {
            list: vec_in(InternalMemType::Fragments),
        }
    }

    /// The whole nursery as a single fragment.
    pub(crate) fn reset_to(&mut self, nursery: &Nursery) {
        self.list.clear();
        self.list.push(Fragment {
            start: nursery.start,
            end: nursery.end,
        });
    }

    /// Lease `desired` bytes, or any fragment of at least `minimum` bytes.
    pub(crate) fn alloc_range(&mut self, desired: usize, minimum: usize) -> Option<Fragment> {
        take_range(&mut self.list, desired, minimum)
    }

    pub(crate) fn free_bytes(&self) -> usize {
        self.list.iter().map(|f| f.len()).sum()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectType;

    const SIZE: usize = 256 * 1024;

    #[test]
    fn nursery_is_aligned_to_its_size() {
        let nursery = Nursery::new(SIZE).unwrap();
        assert_eq!(nursery.start() % SIZE, 0);
        assert!(nursery.contains(nursery.start() + SIZE - 8));
        assert!(!nursery.contains(nursery.start() + SIZE));
        assert!(!nursery.contains(nursery.start() - 8));
    }

    #[test]
    fn interior_pointers_resolve_to_their_object() {
        let nursery = Nursery::new(SIZE).unwrap();
        let ty = ObjectType::object("Node", 48, &[2]);
        let base = nursery.start() + 2 * SCAN_START_SIZE - 64;
        nursery.record_scan_start(base);
        for i in 0..4 {
            unsafe { ObjectHeader::init(base + i * 48, ty, 0) };
        }

        unsafe {
            assert_eq!(nursery.find_object(base + 48 + 47), Some(base + 48));
            assert_eq!(nursery.find_object(base + 3 * 48 + 8), Some(base + 3 * 48));
            assert_eq!(nursery.find_object(base + 4 * 48 + 8), None);
            assert_eq!(nursery.find_object(base - 8), None);
        }
    }

    #[test]
    fn fragments_skip_pinned_objects() {
        let nursery = Nursery::new(SIZE).unwrap();
        let ty = ObjectType::object("Blob", 64, &[]);
        let pinned = nursery.start() + 4096;
        unsafe { ObjectHeader::init(pinned, ty, 0) };
        unsafe { ObjectHeader::at(pinned) }.pin();
        // Garbage between fragments must be cleared.
        unsafe { ObjectHeader::init(nursery.start() + 128, ty, 0) };

        let mut frags = NurseryFragments::new();
        let free = unsafe { nursery.build_fragments(&[pinned], &mut frags) };
        assert_eq!(free, SIZE - 64);
        assert!(!unsafe { ObjectHeader::at(pinned) }.is_pinned());
        assert_eq!(unsafe { (nursery.start() as *const usize).add(16).read() }, 0);

        let first = frags.alloc_range(4096, 4096).unwrap();
        assert_eq!(first.start, nursery.start());
        assert_eq!(first.end, pinned);
        let next = frags.alloc_range(512, 512).unwrap();
        assert_eq!(next.start, pinned + 64);
    }
}
