//! Gray queue: objects discovered but not yet scanned.
//!
//! A stack of fixed-size sections drawn from the internal allocator. Emptied
//! sections go to a free list and are reused by the next collection.

use allocator_api2::boxed::Box;

use crate::internal::{InternalAlloc, InternalMemType};

/// Entries per section.
pub const GRAY_SECTION_SIZE: usize = 125;

struct GraySection {
    next: Option<Box<GraySection, InternalAlloc>>,
    len: usize,
    entries: [usize; GRAY_SECTION_SIZE],
}

pub(crate) struct GrayQueue {
    first: Option<Box<GraySection, InternalAlloc>>,
    free: Option<Box<GraySection, InternalAlloc>>,
    len: usize,
}

impl GrayQueue {
    pub(crate) const fn new() -> Self {
        Self {
            first: None,
            free: None,
            len: 0,
        }
    }

    fn new_section(&mut self) -> Box<GraySection, InternalAlloc> {
        if let Some(mut section) = self.free.take() {
            self.free = section.next.take();
            section.len = 0;
            return section;
        }
        Box::new_in(
            GraySection {
                next: None,
                len: 0,
                entries: [0; GRAY_SECTION_SIZE],
            },
            InternalAlloc::new(InternalMemType::GrayQueue),
        )
    }

    pub(crate) fn push(&mut self, obj: usize) {
        let full = self
            .first
            .as_ref()
            .is_none_or(|section| section.len == GRAY_SECTION_SIZE);
        if full {
            let mut section = self.new_section();
            section.next = self.first.take();
            self.first = Some(section);
        }
        if let Some(section) = self.first.as_mut() {
            let idx = section.len;
            section.entries[idx] = obj;
            section.len += 1;
            self.len += 1;
        }
    }

    pub(crate) fn pop(&mut self) -> Option<usize> {
        loop {
            let section = self.first.as_mut()?;
            if section.len > 0 {
                section.len -= 1;
                self.len -= 1;
                return Some(section.entries[section.len]);
            }
            let mut empty = self.first.take()?;
            self.first = empty.next.take();
            empty.next = self.free.take();
            self.free = Some(empty);
        }
    }

    pub(crate) const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) const fn len(&self) -> usize {
        self.len
    }
}
