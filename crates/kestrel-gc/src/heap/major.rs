//! Major heap: 128 KiB sections filled by bump allocation.
//!
//! Between collections the sections are an append-only old generation. A
//! major collection flips every existing section to from-space, evacuates
//! live objects into fresh to-space sections, frees from-space sections that
//! hold no pinned object and turns the pinned ones into fragment lists.

use std::io;

use sys_alloc::{Mmap, MmapOptions};

use super::{find_object_from, take_range, zero_range, Fragment};
use super::{FRAGMENT_MIN_SIZE, SCAN_START_SIZE};
use crate::internal::{map_in, vec_in, InternalMap, InternalMemType, InternalVec};
use crate::object::ObjectHeader;
use crate::scan::object_size;

/// Size and alignment of a heap section.
pub const SECTION_SIZE: usize = 128 * 1024;

const SECTION_MASK: usize = !(SECTION_SIZE - 1);
const SCAN_STARTS: usize = SECTION_SIZE / SCAN_START_SIZE;

pub(crate) struct Section {
    _map: Mmap,
    base: usize,
    next_data: usize,
    is_to_space: bool,
    has_pins: bool,
    scan_starts: [usize; SCAN_STARTS],
    fragments: InternalVec<Fragment>,
}

impl Section {
    fn new() -> io::Result<Self> {
        // SAFETY: fresh anonymous mapping.
        let map = unsafe {
            MmapOptions::new()
                .len(SECTION_SIZE)
                .align(SECTION_SIZE)
                .map_anon()?
        };
        let base = map.ptr() as usize;
        Ok(Self {
            _map: map,
            base,
            next_data: base,
            is_to_space: false,
            has_pins: false,
            scan_starts: [0; SCAN_STARTS],
            fragments: vec_in(InternalMemType::Sections),
        })
    }

    const fn end(&self) -> usize {
        self.base + SECTION_SIZE
    }

    fn record_scan_start(&mut self, addr: usize) {
        let slot = &mut self.scan_starts[(addr - self.base) / SCAN_START_SIZE];
        if *slot == 0 || *slot > addr {
            *slot = addr;
        }
    }

    fn alloc(&mut self, size: usize) -> Option<usize> {
        let addr = if self.next_data + size <= self.end() {
            let addr = self.next_data;
            self.next_data += size;
            addr
        } else {
            take_range(&mut self.fragments, size, size)?.start
        };
        self.record_scan_start(addr);
        Some(addr)
    }

    unsafe fn find_object(&self, addr: usize) -> Option<usize> {
        if addr >= self.next_data {
            return None;
        }
        let mut idx = (addr - self.base) / SCAN_START_SIZE;
        let from = loop {
            let start = self.scan_starts[idx];
            if start != 0 && start <= addr {
                break start;
            }
            if idx == 0 {
                break self.base;
            }
            idx -= 1;
        };
        unsafe { find_object_from(from, addr) }
    }

    /// Keep only `pinned` (sorted) objects; everything else becomes zeroed
    /// fragments. The bump pointer is closed.
    unsafe fn rebuild_around(&mut self, pinned: &[usize]) -> usize {
        self.fragments.clear();
        self.scan_starts = [0; SCAN_STARTS];
        let mut live = 0;
        let mut cursor = self.base;
        for &obj in pinned {
            self.add_gap(cursor, obj);
            let size = unsafe { object_size(obj) };
            unsafe { ObjectHeader::at(obj) }.unpin();
            self.record_scan_start(obj);
            live += size;
            cursor = obj + size;
        }
        self.add_gap(cursor, self.end());
        self.next_data = self.end();
        self.has_pins = false;
        live
    }

    fn add_gap(&mut self, from: usize, to: usize) {
        if to <= from {
            return;
        }
        unsafe { zero_range(from, to) };
        if to - from >= FRAGMENT_MIN_SIZE {
            self.fragments.push(Fragment {
                start: from,
                end: to,
            });
        }
    }

    fn free_bytes(&self) -> usize {
        self.end() - self.next_data + self.fragments.iter().map(|f| f.len()).sum::<usize>()
    }
}

/// Outcome of a major-collection sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SweepStats {
    pub(crate) sections_freed: usize,
    pub(crate) sections_kept: usize,
}

pub(crate) struct MajorHeap {
    sections: InternalMap<usize, Section>,
    current: Option<usize>,
    with_fragments: InternalVec<usize>,
    in_major: bool,
}

impl MajorHeap {
    pub(crate) fn new() -> Self {
        Self {
            sections: map_in(InternalMemType::Sections),
            current: None,
            with_fragments: vec_in(InternalMemType::Sections),
            in_major: false,
        }
    }

    pub(crate) fn num_sections(&self) -> usize {
        self.sections.len()
    }

    #[inline]
    fn section_of(&self, addr: usize) -> Option<&Section> {
        self.sections.get(&(addr & SECTION_MASK))
    }

    /// `true` if `addr` is inside a section.
    pub(crate) fn contains(&self, addr: usize) -> bool {
        self.section_of(addr).is_some()
    }

    /// `true` if `addr` lies in a section created during the running major
    /// collection.
    pub(crate) fn is_to_space(&self, addr: usize) -> bool {
        self.section_of(addr).is_some_and(|s| s.is_to_space)
    }

    /// `true` if `addr` lies in a section being evacuated.
    pub(crate) fn is_from_space(&self, addr: usize) -> bool {
        self.in_major && self.section_of(addr).is_some_and(|s| !s.is_to_space)
    }

    /// Allocate `size` bytes, mapping a new section when the current one and
    /// every fragment are full.
    ///
    /// `on_new_section` runs before a section is mapped and may veto it.
    pub(crate) fn alloc(
        &mut self,
        size: usize,
        on_new_section: impl FnOnce() -> bool,
    ) -> Result<Option<usize>, io::Error> {
        if let Some(addr) = self.current.and_then(|base| self.sections.get_mut(&base)?.alloc(size)) {
            return Ok(Some(addr));
        }
        while let Some(&base) = self.with_fragments.last() {
            if let Some(addr) = self.sections.get_mut(&base).and_then(|s| s.alloc(size)) {
                return Ok(Some(addr));
            }
            let exhausted = self
                .sections
                .get(&base)
                .is_none_or(|s| s.fragments.iter().all(|f| f.len() < FRAGMENT_MIN_SIZE));
            if !exhausted {
                break;
            }
            self.with_fragments.pop();
        }
        if !on_new_section() {
            return Ok(None);
        }
        let mut section = Section::new()?;
        section.is_to_space = self.in_major;
        let addr = section.alloc(size);
        let base = section.base;
        self.sections.insert(base, section);
        self.current = Some(base);
        Ok(addr)
    }

    /// Object containing `addr` in a from-space section.
    ///
    /// # Safety
    ///
    /// Must run during a major collection, before any object is copied.
    pub(crate) unsafe fn find_object(&self, addr: usize) -> Option<usize> {
        unsafe { self.section_of(addr)?.find_object(addr) }
    }

    /// Remember that the section holding `obj` has a pinned object.
    pub(crate) fn note_pinned(&mut self, obj: usize) {
        if let Some(section) = self.sections.get_mut(&(obj & SECTION_MASK)) {
            section.has_pins = true;
        }
    }

    /// Flip every section to from-space.
    pub(crate) fn begin_major(&mut self) {
        self.in_major = true;
        self.current = None;
        self.with_fragments.clear();
        for section in self.sections.values_mut() {
            section.is_to_space = false;
            section.has_pins = false;
        }
    }

    /// Release evacuated sections and compact the pinned ones around their
    /// pinned objects. `pinned` is the sorted list of pinned objects.
    ///
    /// # Safety
    ///
    /// Every live object outside `pinned` must have been copied to to-space.
    pub(crate) unsafe fn sweep(&mut self, pinned: &[usize]) -> SweepStats {
        let mut stats = SweepStats::default();
        let mut from_space: InternalVec<usize> = vec_in(InternalMemType::Sections);
        from_space.extend(
            self.sections
                .iter()
                .filter(|(_, s)| !s.is_to_space)
                .map(|(&base, _)| base),
        );
        for base in from_space {
            let has_pins = self.sections.get(&base).is_some_and(|s| s.has_pins);
            if has_pins {
                let lo = pinned.partition_point(|&p| p < base);
                let hi = pinned.partition_point(|&p| p < base + SECTION_SIZE);
                if let Some(section) = self.sections.get_mut(&base) {
                    unsafe { section.rebuild_around(&pinned[lo..hi]) };
                    if section.free_bytes() > 0 {
                        self.with_fragments.push(base);
                    }
                }
                stats.sections_kept += 1;
            } else {
                self.sections.remove(&base);
                stats.sections_freed += 1;
            }
        }
        for section in self.sections.values_mut() {
            section.is_to_space = false;
        }
        self.in_major = false;
        stats
    }

    /// Bytes handed out in all sections.
    pub(crate) fn used_bytes(&self) -> usize {
        self.sections.values().map(|s| SECTION_SIZE - s.free_bytes()).sum()
    }
}
