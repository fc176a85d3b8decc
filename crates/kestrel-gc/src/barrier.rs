//! Write barriers.
//!
//! Every store of a reference into the heap goes through one of these so the
//! next minor collection can find old-to-young pointers. A store is logged
//! in the thread's remembered set unless the destination is in the nursery
//! (scanned anyway) or on the thread's own stack (scanned as a root).

use crate::heap::nursery::Nursery;
use crate::mutator::Mutator;
use crate::object::{ObjRef, ObjectType, HEADER_SIZE};
use crate::remset::RemsetEntry;
use crate::scan::object_size;

impl Mutator {
    #[inline]
    fn nursery(&self) -> &Nursery {
        &self.inner.nursery
    }

    #[inline]
    fn needs_logging(&self, dest: usize) -> bool {
        !self.nursery().contains(dest) && !self.info.on_stack(dest)
    }

    #[inline]
    fn log(&self, entry: RemsetEntry) {
        // SAFETY: called by the owning thread outside any collection.
        unsafe { self.info.remset_mut() }.log.push(entry);
    }

    /// Store `value` into the reference slot `slot`.
    ///
    /// # Safety
    ///
    /// `slot` must be a reference slot of a live object, a registered root or
    /// a location on this thread's stack.
    #[inline]
    pub unsafe fn write_barrier(&self, slot: *mut usize, value: Option<ObjRef>) {
        let value = value.map_or(0, ObjRef::addr);
        unsafe { slot.write(value) };
        if value != 0 && self.nursery().contains(value) && self.needs_logging(slot as usize) {
            self.log(RemsetEntry::Location(slot as usize));
        }
    }

    /// Store `value` into `slot` through the deduplicating store buffer. For
    /// code that cannot tell whether `slot` is a reference field.
    ///
    /// # Safety
    ///
    /// As for [`Mutator::write_barrier`].
    pub unsafe fn write_barrier_generic(&self, slot: *mut usize, value: Option<ObjRef>) {
        let value = value.map_or(0, ObjRef::addr);
        unsafe { slot.write(value) };
        if value != 0 && self.nursery().contains(value) && self.needs_logging(slot as usize) {
            // SAFETY: owning thread.
            unsafe { self.info.remset_mut() }.record_generic(slot as usize);
        }
    }

    /// Store `value` into reference field `index` of `obj`.
    ///
    /// # Safety
    ///
    /// `obj` must be live and word `index` one of its reference slots.
    #[inline]
    pub unsafe fn set_ref(&self, obj: ObjRef, index: usize, value: Option<ObjRef>) {
        unsafe { self.write_barrier(obj.word_ptr(index), value) };
    }

    /// Copy `count` references from `src` to `dest` (the ranges may overlap)
    /// and remember the destination range.
    ///
    /// # Safety
    ///
    /// Both ranges must hold `count` reference slots.
    pub unsafe fn write_barrier_arrayref_copy(
        &self,
        dest: *mut usize,
        src: *const usize,
        count: usize,
    ) {
        unsafe { std::ptr::copy(src, dest, count) };
        if count > 0 && self.needs_logging(dest as usize) {
            self.log(RemsetEntry::Range {
                start: dest as usize,
                count,
            });
        }
    }

    /// Copy `count` inline values of `ty` from `src` to `dest` and remember
    /// their reference fields. An inline value is an instance of `ty`
    /// without its header.
    ///
    /// # Safety
    ///
    /// Both ranges must hold `count` values of `ty`.
    pub unsafe fn write_barrier_value_copy(
        &self,
        dest: *mut u8,
        src: *const u8,
        count: usize,
        ty: &'static ObjectType,
    ) {
        let bytes = count * (ty.instance_size() - HEADER_SIZE);
        unsafe { std::ptr::copy(src, dest, bytes) };
        if count > 0 && !ty.descriptor().is_ptr_free() && self.needs_logging(dest as usize) {
            self.log(RemsetEntry::ValueTypes {
                start: dest as usize,
                ty,
                count,
            });
        }
    }

    /// Copy the payload of `src` into `dest`, which has the same type and
    /// length, and remember `dest`.
    ///
    /// # Safety
    ///
    /// Both objects must be live and of the same type and length.
    pub unsafe fn write_barrier_object_copy(&self, dest: ObjRef, src: ObjRef) {
        let size = unsafe { object_size(src.addr()) };
        unsafe {
            std::ptr::copy_nonoverlapping(
                (src.addr() + HEADER_SIZE) as *const u8,
                (dest.addr() + HEADER_SIZE) as *mut u8,
                size - HEADER_SIZE,
            );
        }
        let ty = unsafe { dest.object_type() };
        if !ty.descriptor().is_ptr_free() && !self.nursery().contains(dest.addr()) {
            self.log(RemsetEntry::Object(dest.addr()));
        }
    }

    /// Entries in this thread's remembered set, including buffered generic
    /// stores.
    #[must_use]
    pub fn remembered_entries(&self) -> usize {
        // SAFETY: owning thread.
        let remset = unsafe { self.info.remset_mut() };
        remset.log.len() + remset.buffered()
    }
}

#[cfg(test)]
mod tests {
    use crate::{Collector, GcConfig, ObjectType};

    #[test]
    #[cfg_attr(miri, ignore)]
    fn nursery_and_stack_stores_are_not_logged() {
        let collector = Collector::new(GcConfig::default().with_scan_thread_stacks(false)).unwrap();
        let mutator = collector.register_thread();
        let node = ObjectType::object("Node", 24, &[2]);
        let a = mutator.alloc(node).unwrap();
        let b = mutator.alloc(node).unwrap();
        unsafe { mutator.set_ref(a, 2, Some(b)) };

        let mut local = 0usize;
        unsafe { mutator.write_barrier(&mut local, Some(b)) };
        assert_eq!(local, b.addr());
        assert_eq!(mutator.remembered_entries(), 0);
    }

    #[test]
    fn old_to_young_stores_are_logged_once_per_barrier() {
        let collector = Collector::new(GcConfig::default().with_scan_thread_stacks(false)).unwrap();
        let mutator = collector.register_thread();
        let node = ObjectType::object("Node", 24, &[2]);
        let old = mutator.alloc_pinned(node, 0).unwrap();
        let young = mutator.alloc(node).unwrap();

        unsafe { mutator.set_ref(old, 2, Some(young)) };
        assert_eq!(mutator.remembered_entries(), 1);
        unsafe { mutator.set_ref(old, 2, None) };
        assert_eq!(mutator.remembered_entries(), 1);

        unsafe { mutator.write_barrier_generic(old.word_ptr(2), Some(young)) };
        unsafe { mutator.write_barrier_generic(old.word_ptr(2), Some(young)) };
        assert_eq!(mutator.remembered_entries(), 2);
    }

    #[test]
    fn arrayref_copy_moves_the_references() {
        let collector = Collector::new(GcConfig::default().with_scan_thread_stacks(false)).unwrap();
        let mutator = collector.register_thread();
        let array = ObjectType::ref_array("Object[]");
        let node = ObjectType::object("Node", 24, &[2]);
        let src = mutator.alloc_array(array, 4).unwrap();
        let dest = mutator.alloc_pinned(array, 4).unwrap();
        let young = mutator.alloc(node).unwrap();
        unsafe {
            mutator.set_ref(src, 2, Some(young));
            mutator.write_barrier_arrayref_copy(dest.word_ptr(2), src.word_ptr(2), 4);
        }
        assert_eq!(unsafe { dest.read_ref(2) }, Some(young));
        assert_eq!(mutator.remembered_entries(), 1);
    }
}
