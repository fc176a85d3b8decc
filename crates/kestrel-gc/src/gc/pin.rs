//! Pinning: objects referenced from conservatively scanned memory.
//!
//! A candidate word is resolved to the object whose extent contains it,
//! using scan starts in the nursery and sections and range lookups in the
//! large-object and pinned spaces. Objects in moving spaces are pinned for
//! this collection; objects in non-moving spaces are simply marked.

use crate::gc::copy::{Copier, Mode};
use crate::internal::InternalVec;
use crate::object::ObjectHeader;
use crate::scan::scan_region_conservatively;
use crate::stack::RegisterSnapshot;

impl Copier<'_> {
    /// Pin or mark the object containing `addr`, if any.
    ///
    /// Newly pinned objects are appended to `queue`.
    ///
    /// # Safety
    ///
    /// All mutators must be stopped with their allocation buffers retired.
    pub(crate) unsafe fn pin_address(&mut self, addr: usize, queue: &mut InternalVec<usize>) {
        if self.nursery.contains(addr) {
            if let Some(obj) = unsafe { self.nursery.find_object(addr) } {
                Self::pin_moving(obj, queue);
            }
            return;
        }
        if self.mode == Mode::Minor {
            return;
        }
        if self.major.is_from_space(addr) {
            if let Some(obj) = unsafe { self.major.find_object(addr) } {
                if Self::pin_moving(obj, queue) {
                    self.major.note_pinned(obj);
                }
            }
            return;
        }
        if let Some(obj) = self.los.find_object(addr) {
            if self.los.mark(obj) {
                self.push_gray(obj);
            }
        } else if let Some(obj) = self.pinned.find_object(addr) {
            if self.pinned.mark(obj) {
                self.push_gray(obj);
            }
        }
    }

    fn pin_moving(obj: usize, queue: &mut InternalVec<usize>) -> bool {
        // SAFETY: `obj` was resolved from an object walk.
        let header = unsafe { ObjectHeader::at(obj) };
        if header.is_pinned() {
            return false;
        }
        header.pin();
        queue.push(obj);
        true
    }

    /// Pin everything referenced from `[start, start + len)`.
    ///
    /// # Safety
    ///
    /// The range must be readable; see [`Copier::pin_address`].
    pub(crate) unsafe fn pin_from_region(
        &mut self,
        start: usize,
        len: usize,
        queue: &mut InternalVec<usize>,
    ) {
        unsafe {
            scan_region_conservatively(start, len, |word| self.pin_address(word, queue));
        }
    }

    /// Pin everything referenced from a register snapshot.
    ///
    /// # Safety
    ///
    /// See [`Copier::pin_address`].
    pub(crate) unsafe fn pin_from_registers(
        &mut self,
        regs: &RegisterSnapshot,
        queue: &mut InternalVec<usize>,
    ) {
        for &word in regs {
            unsafe { self.pin_address(word, queue) };
        }
    }

    /// Sort the pin queue and queue the pinned objects for scanning.
    pub(crate) fn finish_pinning(&mut self, queue: &mut InternalVec<usize>) {
        queue.sort_unstable();
        queue.dedup();
        for &obj in queue.iter() {
            self.push_gray(obj);
        }
    }
}
