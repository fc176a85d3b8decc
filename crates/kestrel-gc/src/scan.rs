//! Reference enumeration driven by layout descriptors.
//!
//! Everything the collector learns about an object's shape comes through
//! here: where its reference slots are and how many bytes it spans.

use crate::descriptor::{with_complex_bitmap, DescriptorKind, RootDescriptor, VectorSubtype};
use crate::object::{align_up, ObjectHeader, ObjectType, HEADER_SIZE, HEADER_WORDS};

const WORD: usize = std::mem::size_of::<usize>();

#[inline]
fn visit_bits(base: usize, bits: usize, first_word: usize, visit: &mut impl FnMut(*mut usize)) {
    let mut bits = bits;
    while bits != 0 {
        let word = first_word + bits.trailing_zeros() as usize;
        visit((base + word * WORD) as *mut usize);
        bits &= bits - 1;
    }
}

fn visit_bitmap(base: usize, words: &[usize], visit: &mut impl FnMut(*mut usize)) {
    for (i, &bits) in words.iter().enumerate() {
        visit_bits(base, bits, i * usize::BITS as usize, visit);
    }
}

/// Visit the address of every reference slot of the object at `obj`.
///
/// # Safety
///
/// `obj` must be a live, non-forwarded object of type `ty` with `length`
/// elements.
pub(crate) unsafe fn for_each_ref(
    obj: usize,
    ty: &ObjectType,
    length: usize,
    mut visit: impl FnMut(*mut usize),
) {
    let desc = ty.descriptor();
    if desc.is_ptr_free() {
        return;
    }
    let payload = obj + HEADER_SIZE;
    match desc.kind() {
        DescriptorKind::RunLength => {
            let (first, count) = desc.run();
            for word in first..first + count {
                visit((obj + word * WORD) as *mut usize);
            }
        }
        DescriptorKind::SmallBitmap => visit_bits(obj, desc.small_bitmap(), HEADER_WORDS, &mut visit),
        DescriptorKind::LargeBitmap => visit_bits(obj, desc.payload(), HEADER_WORDS, &mut visit),
        DescriptorKind::Complex => {
            with_complex_bitmap(desc.payload(), |words| visit_bitmap(obj, words, &mut visit));
        }
        DescriptorKind::Vector => {
            let elem_size = ty.element_size();
            match desc.vector_subtype() {
                Some(VectorSubtype::Refs) => {
                    for i in 0..length * elem_size / WORD {
                        visit((payload + i * WORD) as *mut usize);
                    }
                }
                Some(VectorSubtype::RunLength) => {
                    let layout = desc.vector_layout();
                    let (first, count) = (layout & 0xff, (layout >> 8) & 0xff);
                    for i in 0..length {
                        let elem = payload + i * elem_size;
                        for word in first..first + count {
                            visit((elem + word * WORD) as *mut usize);
                        }
                    }
                }
                Some(VectorSubtype::Bitmap) => {
                    let bits = desc.vector_layout();
                    for i in 0..length {
                        visit_bits(payload + i * elem_size, bits, 0, &mut visit);
                    }
                }
                Some(VectorSubtype::PtrFree) | None => {}
            }
        }
        DescriptorKind::ComplexArray => {
            let elem_size = ty.element_size();
            with_complex_bitmap(desc.payload(), |words| {
                for i in 0..length {
                    visit_bitmap(payload + i * elem_size, words, &mut visit);
                }
            });
        }
    }
}

/// Visit every reference slot of the object at `obj`, reading type and
/// length from its header.
///
/// # Safety
///
/// `obj` must be a live, non-forwarded object.
pub(crate) unsafe fn scan_object(obj: usize, visit: impl FnMut(*mut usize)) {
    let header = unsafe { ObjectHeader::at(obj) };
    let ty = unsafe { header.object_type() };
    unsafe { for_each_ref(obj, ty, header.length(), visit) };
}

/// Visit the reference slots of `count` inline values of type `ty` stored
/// back to back from `start` (a struct array or a copied value type).
///
/// `ty` describes the boxed form of the value, so its bitmap counts the
/// header words that the inline form lacks.
///
/// # Safety
///
/// The range must hold `count` values of `ty`.
pub(crate) unsafe fn scan_value_types(
    start: usize,
    ty: &ObjectType,
    count: usize,
    mut visit: impl FnMut(*mut usize),
) {
    let elem_size = ty.instance_size() - HEADER_SIZE;
    for i in 0..count {
        let boxed = (start + i * elem_size).wrapping_sub(HEADER_SIZE);
        unsafe { for_each_ref(boxed, ty, 0, &mut visit) };
    }
}

/// Byte size of the object at `obj`, following a forwarding pointer if the
/// object has already been copied.
///
/// # Safety
///
/// `obj` must be the start of an object.
pub(crate) unsafe fn object_size(obj: usize) -> usize {
    let header = unsafe { ObjectHeader::at(obj) };
    let current = header.forwarded_to().unwrap_or(obj);
    let header = unsafe { ObjectHeader::at(current) };
    let ty = unsafe { header.object_type() };
    let desc = ty.descriptor();
    match desc.kind() {
        DescriptorKind::RunLength | DescriptorKind::SmallBitmap => {
            desc.encoded_size().unwrap_or_else(|| ty.instance_size())
        }
        DescriptorKind::Vector => {
            let elem_size = desc.element_size().unwrap_or_else(|| ty.element_size());
            align_up(HEADER_SIZE + header.length() * elem_size)
        }
        DescriptorKind::ComplexArray => ty.size_for(header.length()),
        DescriptorKind::LargeBitmap | DescriptorKind::Complex => ty.instance_size(),
    }
}

/// Visit every precise reference slot of a registered root range.
///
/// Conservative ranges yield nothing here; they are handled by pinning.
///
/// # Safety
///
/// `[start, start + words * 8)` must be readable and writable.
pub(crate) unsafe fn for_each_root_slot(
    start: usize,
    words: usize,
    desc: RootDescriptor,
    mut visit: impl FnMut(*mut usize),
) {
    match desc {
        RootDescriptor::Conservative => {}
        RootDescriptor::Bitmap(bits) => visit_bits(start, bits, 0, &mut visit),
        RootDescriptor::Complex(index) => {
            with_complex_bitmap(index, |bitmap| {
                let limit = bitmap.len().min(words.div_ceil(usize::BITS as usize));
                visit_bitmap(start, &bitmap[..limit], &mut visit);
            });
        }
        RootDescriptor::User(mark) => mark(start as *mut usize, &mut visit),
    }
}

/// Call `f` with every pointer-aligned word of `[start, start + len)`.
///
/// This is conservative: any integer that happens to look like a heap
/// address is reported.
///
/// # Safety
///
/// The region must be readable for the duration of the call.
pub unsafe fn scan_region_conservatively(start: usize, len: usize, mut f: impl FnMut(usize)) {
    if start == 0 || len == 0 {
        return;
    }
    let end = start + len;
    let mut current = align_up(start);
    while current + WORD <= end {
        // SAFETY: the caller guarantees the region is readable. Stacks of
        // parked threads are read volatile so the loads are not elided.
        f(unsafe { std::ptr::read_volatile(current as *const usize) });
        current += WORD;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{GlobalAlloc, Layout, System};
    use std::cell::Cell;

    /// Counts heap allocations made by the current thread.
    struct CountingAlloc;

    thread_local! {
        static ALLOCATIONS: Cell<usize> = const { Cell::new(0) };
    }

    unsafe impl GlobalAlloc for CountingAlloc {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            let _ = ALLOCATIONS.try_with(|n| n.set(n.get() + 1));
            unsafe { System.alloc(layout) }
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            unsafe { System.dealloc(ptr, layout) }
        }
    }

    #[global_allocator]
    static GLOBAL: CountingAlloc = CountingAlloc;

    fn allocations() -> usize {
        ALLOCATIONS.with(Cell::get)
    }

    fn collect_slots(obj: usize, ty: &ObjectType, length: usize) -> Vec<usize> {
        let mut slots = Vec::new();
        unsafe { for_each_ref(obj, ty, length, |slot| slots.push(slot as usize - obj)) };
        slots
    }

    #[test]
    fn object_slots_by_kind() {
        let run = ObjectType::object("Run", 48, &[2, 3, 4]);
        assert_eq!(collect_slots(0x1000, run, 0), [16, 24, 32]);

        let sparse = ObjectType::object("Sparse", 96, &[2, 5, 9]);
        assert_eq!(collect_slots(0x1000, sparse, 0), [16, 40, 72]);

        let complex = ObjectType::object("Complex", 8 * 140, &[2, 70, 130]);
        assert_eq!(collect_slots(0x1000, complex, 0), [16, 560, 1040]);

        let leaf = ObjectType::object("Leaf", 32, &[]);
        assert!(collect_slots(0x1000, leaf, 0).is_empty());
    }

    #[test]
    fn array_slots_repeat_per_element() {
        let refs = ObjectType::ref_array("Object[]");
        assert_eq!(collect_slots(0x1000, refs, 3), [16, 24, 32]);

        let pairs = ObjectType::array("Pair[]", 24, &[0, 2]);
        assert_eq!(collect_slots(0x1000, pairs, 2), [16, 32, 40, 56]);

        let wide = ObjectType::array("Wide[]", 1024, &[0]);
        assert_eq!(collect_slots(0x1000, wide, 2), [16, 16 + 1024]);
    }

    #[test]
    fn value_types_skip_the_missing_header() {
        let point = ObjectType::object("RefPair", 32, &[2, 3]);
        let mut slots = Vec::new();
        unsafe {
            scan_value_types(0x2000, point, 2, |slot| slots.push(slot as usize));
        }
        assert_eq!(slots, [0x2000, 0x2008, 0x2010, 0x2018]);
    }

    #[test]
    fn sizes_come_from_descriptors() {
        let ty = ObjectType::ref_array("Object[]");
        let mut storage = [0usize; 8];
        let addr = storage.as_mut_ptr() as usize;
        unsafe { ObjectHeader::init(addr, ty, 5) };
        assert_eq!(unsafe { object_size(addr) }, HEADER_SIZE + 40);

        let big = ObjectType::object("Big", 0x10000 + 16, &[]);
        unsafe { ObjectHeader::init(addr, big, 0) };
        assert_eq!(unsafe { object_size(addr) }, 0x10000 + 16);
    }

    #[test]
    fn root_bitmaps() {
        let mut words = [0usize; 4];
        let start = words.as_mut_ptr() as usize;
        let mut seen = Vec::new();
        unsafe {
            for_each_root_slot(start, 4, RootDescriptor::Bitmap(0b1010), |slot| {
                seen.push((slot as usize - start) / 8);
            });
        }
        assert_eq!(seen, [1, 3]);
    }

    #[test]
    fn complex_root_ranges_stop_at_the_range_end() {
        let mut words = [0usize; 130];
        let start = words.as_mut_ptr() as usize;
        let desc = RootDescriptor::all_refs(130);
        let mut seen = Vec::new();
        unsafe {
            for_each_root_slot(start, 64, desc, |slot| seen.push((slot as usize - start) / 8));
        }
        assert_eq!(seen.len(), 64);
        assert_eq!(seen.last(), Some(&63));
    }

    #[test]
    fn complex_layouts_scan_without_heap_allocation() {
        let complex = ObjectType::object("Complex", 8 * 140, &[2, 70, 130]);
        let wide = ObjectType::array("Wide[]", 1024, &[0, 100]);
        let mut roots = [0usize; 100];
        let start = roots.as_mut_ptr() as usize;
        let root_desc = RootDescriptor::all_refs(100);
        let mut slots = Vec::with_capacity(256);

        let before = allocations();
        unsafe {
            for_each_ref(0x1000, complex, 0, |slot| slots.push(slot as usize));
            for_each_ref(0x8000, wide, 3, |slot| slots.push(slot as usize));
            for_each_root_slot(start, 100, root_desc, |slot| slots.push(slot as usize));
        }
        assert_eq!(allocations(), before);
        assert_eq!(slots.len(), 3 + 6 + 100);
    }

    #[test]
    fn conservative_scan_reads_aligned_words() {
        let words = [7usize, 0, 9];
        let mut seen = Vec::new();
        unsafe {
            scan_region_conservatively(words.as_ptr() as usize, 24, |w| seen.push(w));
        }
        assert_eq!(seen, [7, 0, 9]);
    }
}
