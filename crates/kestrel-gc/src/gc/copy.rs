//! Evacuation: copying survivors, forwarding, and the gray-queue drain.

use crate::collector::Runtime;
use crate::error::gc_fatal;
use crate::gc::gray::GrayQueue;
use crate::governor::Governor;
use crate::heap::los::LargeObjectSpace;
use crate::heap::major::MajorHeap;
use crate::heap::nursery::Nursery;
use crate::heap::pinned::PinnedSpace;
use crate::object::{ObjRef, ObjectHeader};
use crate::remset::{RemsetEntry, RemsetLog};
use crate::scan::{object_size, scan_object};

/// Which generation a collection reclaims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Nursery only; everything outside it is assumed live.
    Minor,
    /// Nursery, sections, large objects and pinned pages.
    Major,
}

/// Where a slot being updated lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotOrigin {
    /// A root: a registered range, a runtime root or a queue the collector owns.
    Root,
    /// A field of a heap object, or a location replayed from a remembered set.
    Heap,
}

pub(crate) struct Copier<'a> {
    pub(crate) mode: Mode,
    pub(crate) nursery: &'a Nursery,
    pub(crate) major: &'a mut MajorHeap,
    pub(crate) los: &'a mut LargeObjectSpace,
    pub(crate) pinned: &'a mut PinnedSpace,
    pub(crate) gray: &'a mut GrayQueue,
    pub(crate) global_remset: &'a mut RemsetLog,
    pub(crate) governor: &'a mut Governor,
    pub(crate) runtime: &'a dyn Runtime,
    pub(crate) bytes_copied: usize,
    pub(crate) objects_copied: usize,
}

impl Copier<'_> {
    /// `true` if `obj` survives the collection so far.
    ///
    /// # Safety
    ///
    /// `obj` must be an object start or an address outside the heap.
    pub(crate) unsafe fn is_live(&self, obj: usize) -> bool {
        if self.nursery.contains(obj) || self.major.is_from_space(obj) {
            let header = unsafe { ObjectHeader::at(obj) };
            header.forwarded_to().is_some() || header.is_pinned()
        } else if self.mode == Mode::Minor || self.major.contains(obj) {
            true
        } else if self.los.contains(obj) {
            self.los.is_marked(obj)
        } else if self.pinned.contains(obj) {
            self.pinned.is_marked(obj)
        } else {
            true
        }
    }

    /// Where `obj` lives now: its forwarding address if it was copied.
    ///
    /// # Safety
    ///
    /// `obj` must be an object start.
    pub(crate) unsafe fn current_address(&self, obj: usize) -> usize {
        unsafe { ObjectHeader::at(obj) }.forwarded_to().unwrap_or(obj)
    }

    /// Queue a live object for scanning unless it holds no references.
    pub(crate) fn push_gray(&mut self, obj: usize) {
        // SAFETY: callers pass live, non-forwarded objects.
        let ty = unsafe { ObjectHeader::at(obj).object_type() };
        if !ty.descriptor().is_ptr_free() {
            self.gray.push(obj);
        }
    }

    /// Copy `obj` into the major heap and leave a forwarding pointer. Already
    /// forwarded objects return their copy, pinned ones stay put.
    ///
    /// # Safety
    ///
    /// `obj` must be an object in the nursery or in from-space.
    pub(crate) unsafe fn copy_object(&mut self, obj: usize) -> usize {
        let header = unsafe { ObjectHeader::at(obj) };
        if let Some(new) = header.forwarded_to() {
            return new;
        }
        if header.is_pinned() {
            return obj;
        }
        let size = unsafe { object_size(obj) };
        let governor = &mut *self.governor;
        let new = match self.major.alloc(size, || governor.alloc_section(true)) {
            Ok(Some(addr)) => addr,
            Ok(None) => gc_fatal!("promotion of a {size}-byte object was refused"),
            Err(err) => gc_fatal!("out of memory while promoting a {size}-byte object: {err}"),
        };
        // SAFETY: `new` is a fresh block of `size` bytes disjoint from `obj`.
        unsafe { std::ptr::copy_nonoverlapping(obj as *const u8, new as *mut u8, size) };
        header.forward_to(new);
        if let (Some(old_ref), Some(new_ref)) = (ObjRef::from_addr(obj), ObjRef::from_addr(new)) {
            self.runtime.on_object_moved(old_ref, new_ref);
        }
        self.bytes_copied += size;
        self.objects_copied += 1;
        self.push_gray(new);
        new
    }

    /// Keep `obj` alive and return its address after the collection.
    ///
    /// # Safety
    ///
    /// `obj` must be an object start or an address outside the heap.
    pub(crate) unsafe fn trace(&mut self, obj: usize) -> usize {
        if self.nursery.contains(obj) {
            return unsafe { self.copy_object(obj) };
        }
        if self.mode == Mode::Minor {
            return obj;
        }
        if self.major.is_from_space(obj) {
            return unsafe { self.copy_object(obj) };
        }
        if self.major.contains(obj) {
            return obj;
        }
        if self.los.mark(obj) || self.pinned.mark(obj) {
            self.push_gray(obj);
        }
        obj
    }

    /// Trace the reference stored at `slot` and update it.
    ///
    /// A heap slot outside the nursery that still points at a (pinned)
    /// nursery object is logged in the global remembered set.
    ///
    /// # Safety
    ///
    /// `slot` must be a readable and writable reference slot.
    pub(crate) unsafe fn copy_slot(&mut self, slot: *mut usize, origin: SlotOrigin) {
        let value = unsafe { slot.read() };
        if value == 0 {
            return;
        }
        let new = unsafe { self.trace(value) };
        if new != value {
            unsafe { slot.write(new) };
        }
        if origin == SlotOrigin::Heap
            && self.nursery.contains(new)
            && !self.nursery.contains(slot as usize)
        {
            self.global_remset.push(RemsetEntry::Location(slot as usize));
        }
    }

    /// Scan queued objects until the gray queue is empty.
    ///
    /// # Safety
    ///
    /// Every queued object must be live and fully initialized.
    pub(crate) unsafe fn drain_gray(&mut self) {
        while let Some(obj) = self.gray.pop() {
            unsafe {
                scan_object(obj, |slot| self.copy_slot(slot, SlotOrigin::Heap));
            }
        }
    }
}
