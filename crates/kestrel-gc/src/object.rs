//! Object header, object references and type records.
//!
//! Every heap object starts with a two-word header:
//!
//! ```text
//! word 0: *const ObjectType   (the forwarding address once the object is Forwarded)
//! word 1: state (u8) | padding (3 bytes) | length (u32, arrays only)
//! ```
//!
//! The pinned/forwarded status lives in its own byte next to the type word
//! instead of being tagged into it, so checking it is one load with no
//! masking and the type word is always a plain address.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

use crate::descriptor::{bitmap_from_words, Descriptor};

/// Allocation granularity of every heap object.
pub const ALLOC_ALIGN: usize = 8;

/// Size of the object header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Size of the object header in words.
pub const HEADER_WORDS: usize = HEADER_SIZE / std::mem::size_of::<usize>();

/// Round `size` up to [`ALLOC_ALIGN`].
#[inline]
#[must_use]
pub const fn align_up(size: usize) -> usize {
    (size + ALLOC_ALIGN - 1) & !(ALLOC_ALIGN - 1)
}

/// Collector status of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectState {
    /// Ordinary object.
    Normal = 0,
    /// Cannot move during the current collection.
    Pinned = 1,
    /// Copied; the type word holds the new address.
    Forwarded = 2,
}

#[repr(C)]
pub(crate) struct ObjectHeader {
    vtable: AtomicUsize,
    state: AtomicU8,
    _pad: [u8; 3],
    length: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<ObjectHeader>() == HEADER_SIZE);

impl ObjectHeader {
    /// # Safety
    ///
    /// `addr` must be the start of an object (or of memory about to become one).
    #[inline]
    pub(crate) const unsafe fn at<'a>(addr: usize) -> &'a Self {
        unsafe { &*(addr as *const Self) }
    }

    /// Write a fresh header. The payload must already be zeroed.
    ///
    /// # Safety
    ///
    /// `addr` must point to at least `HEADER_SIZE` writable bytes.
    pub(crate) unsafe fn init(addr: usize, ty: &'static ObjectType, length: usize) {
        let header = unsafe { Self::at(addr) };
        #[allow(clippy::cast_possible_truncation)]
        header.length.store(length as u32, Ordering::Relaxed);
        header.state.store(ObjectState::Normal as u8, Ordering::Relaxed);
        header
            .vtable
            .store(std::ptr::from_ref(ty) as usize, Ordering::Release);
    }

    /// Raw type word: the type address, or the forwarding address.
    #[inline]
    pub(crate) fn type_word(&self) -> usize {
        self.vtable.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn state(&self) -> ObjectState {
        match self.state.load(Ordering::Relaxed) {
            0 => ObjectState::Normal,
            1 => ObjectState::Pinned,
            _ => ObjectState::Forwarded,
        }
    }

    #[inline]
    pub(crate) fn is_pinned(&self) -> bool {
        self.state() == ObjectState::Pinned
    }

    #[inline]
    pub(crate) fn forwarded_to(&self) -> Option<usize> {
        (self.state() == ObjectState::Forwarded).then(|| self.type_word())
    }

    #[inline]
    pub(crate) fn pin(&self) {
        self.state.store(ObjectState::Pinned as u8, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn unpin(&self) {
        self.state.store(ObjectState::Normal as u8, Ordering::Relaxed);
    }

    /// Leave a forwarding pointer to `new_addr`.
    #[inline]
    pub(crate) fn forward_to(&self, new_addr: usize) {
        self.vtable.store(new_addr, Ordering::Relaxed);
        self.state.store(ObjectState::Forwarded as u8, Ordering::Release);
    }

    /// # Safety
    ///
    /// The object must not be forwarded.
    #[inline]
    pub(crate) unsafe fn object_type(&self) -> &'static ObjectType {
        unsafe { &*(self.type_word() as *const ObjectType) }
    }

    #[inline]
    pub(crate) fn length(&self) -> usize {
        self.length.load(Ordering::Relaxed) as usize
    }

    /// Zero both header words so object walks treat the memory as free.
    ///
    /// # Safety
    ///
    /// `addr` must point to at least `min(HEADER_SIZE, limit - addr)` writable bytes.
    pub(crate) unsafe fn clear(addr: usize, limit: usize) {
        let len = HEADER_SIZE.min(limit.saturating_sub(addr));
        unsafe { std::ptr::write_bytes(addr as *mut u8, 0, len) };
    }
}

/// Address of a heap object.
///
/// The collector may move objects; an `ObjRef` is only valid until the next
/// collection unless it was re-read from a root slot the collector updates.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ObjRef(NonZeroUsize);

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef({:#x})", self.0)
    }
}

impl ObjRef {
    /// Wrap a non-null address.
    #[inline]
    #[must_use]
    pub const fn from_addr(addr: usize) -> Option<Self> {
        match NonZeroUsize::new(addr) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// Address of the object header.
    #[inline]
    #[must_use]
    pub const fn addr(self) -> usize {
        self.0.get()
    }

    /// Collector status of the object.
    ///
    /// # Safety
    ///
    /// `self` must reference a live object.
    #[must_use]
    pub unsafe fn state(self) -> ObjectState {
        unsafe { ObjectHeader::at(self.addr()) }.state()
    }

    /// The object's type.
    ///
    /// # Safety
    ///
    /// `self` must reference a live, non-forwarded object.
    #[must_use]
    pub unsafe fn object_type(self) -> &'static ObjectType {
        unsafe { ObjectHeader::at(self.addr()).object_type() }
    }

    /// Element count of an array object (zero for other objects).
    ///
    /// # Safety
    ///
    /// `self` must reference a live object.
    #[must_use]
    pub unsafe fn array_len(self) -> usize {
        unsafe { ObjectHeader::at(self.addr()) }.length()
    }

    /// Pointer to payload word `index`, counting the header words.
    ///
    /// # Safety
    ///
    /// `index` must be inside the object.
    #[must_use]
    pub unsafe fn word_ptr(self, index: usize) -> *mut usize {
        (self.addr() + index * std::mem::size_of::<usize>()) as *mut usize
    }

    /// Read payload word `index`.
    ///
    /// # Safety
    ///
    /// `self` must reference a live object and `index` must be inside it.
    #[must_use]
    pub unsafe fn read_word(self, index: usize) -> usize {
        unsafe { self.word_ptr(index).read() }
    }

    /// Read payload word `index` as a reference.
    ///
    /// # Safety
    ///
    /// Same as [`ObjRef::read_word`]; the word must be a reference slot.
    #[must_use]
    pub unsafe fn read_ref(self, index: usize) -> Option<Self> {
        Self::from_addr(unsafe { self.read_word(index) })
    }

    /// Store a non-reference value into payload word `index`.
    ///
    /// # Safety
    ///
    /// `index` must be inside the object and must not be a reference slot.
    pub unsafe fn write_word(self, index: usize, value: usize) {
        unsafe { self.word_ptr(index).write(value) };
    }

    /// Address of array element `index` for an element size of `elem_size`.
    ///
    /// # Safety
    ///
    /// `self` must be an array with more than `index` elements.
    #[must_use]
    pub unsafe fn element_ptr(self, index: usize, elem_size: usize) -> *mut u8 {
        (self.addr() + HEADER_SIZE + index * elem_size) as *mut u8
    }
}

/// Type record shared by all objects of one shape.
///
/// Objects store a pointer to their `ObjectType` in the header, so type
/// records are leaked and live for the rest of the process.
#[derive(Debug)]
pub struct ObjectType {
    name: String,
    descriptor: Descriptor,
    instance_size: usize,
    element_size: usize,
}

impl ObjectType {
    /// A fixed-size object type of `instance_size` bytes (header included)
    /// whose reference slots are the given word indices.
    ///
    /// # Panics
    ///
    /// Panics if the size cannot hold the header or a reference word lies in
    /// the header or past the end of the object.
    #[must_use]
    pub fn object(name: &str, instance_size: usize, ref_words: &[usize]) -> &'static Self {
        assert!(instance_size >= HEADER_SIZE, "objects must include the header");
        assert!(
            ref_words.iter().all(|&w| (w + 1) * 8 <= instance_size),
            "reference word outside the object"
        );
        let (bitmap, numbits) = bitmap_from_words(ref_words);
        Self::leak(Self {
            name: name.to_owned(),
            descriptor: Descriptor::for_object(&bitmap, numbits, instance_size),
            instance_size: align_up(instance_size),
            element_size: 0,
        })
    }

    /// An array type whose `element_size`-byte elements hold references at the
    /// given word indices.
    ///
    /// # Panics
    ///
    /// Panics if a reference word lies past the end of the element.
    #[must_use]
    pub fn array(name: &str, element_size: usize, element_ref_words: &[usize]) -> &'static Self {
        assert!(
            element_ref_words.iter().all(|&w| (w + 1) * 8 <= element_size),
            "reference word outside the element"
        );
        let (bitmap, numbits) = bitmap_from_words(element_ref_words);
        Self::leak(Self {
            name: name.to_owned(),
            descriptor: Descriptor::for_array(&bitmap, numbits, element_size),
            instance_size: HEADER_SIZE,
            element_size,
        })
    }

    /// Array of references.
    #[must_use]
    pub fn ref_array(name: &str) -> &'static Self {
        Self::array(name, std::mem::size_of::<usize>(), &[0])
    }

    fn leak(ty: Self) -> &'static Self {
        Box::leak(Box::new(ty))
    }

    /// Type name, for diagnostics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The layout descriptor.
    #[must_use]
    pub const fn descriptor(&self) -> Descriptor {
        self.descriptor
    }

    /// Size of an instance in bytes (the header size for arrays).
    #[must_use]
    pub const fn instance_size(&self) -> usize {
        self.instance_size
    }

    /// Element size for arrays, zero otherwise.
    #[must_use]
    pub const fn element_size(&self) -> usize {
        self.element_size
    }

    /// `true` for array types.
    #[must_use]
    pub const fn is_array(&self) -> bool {
        self.descriptor.is_array()
    }

    /// Byte size of an instance with `length` elements, or `None` when the
    /// length does not fit the 32-bit header field or the size overflows.
    #[must_use]
    pub const fn checked_size_for(&self, length: usize) -> Option<usize> {
        if length > u32::MAX as usize {
            return None;
        }
        if !self.is_array() {
            return Some(self.instance_size);
        }
        let Some(payload) = length.checked_mul(self.element_size) else {
            return None;
        };
        match payload.checked_add(HEADER_SIZE + ALLOC_ALIGN - 1) {
            Some(padded) => Some(padded & !(ALLOC_ALIGN - 1)),
            None => None,
        }
    }

    /// Byte size of an instance with `length` elements. `length` must have
    /// passed [`ObjectType::checked_size_for`].
    #[must_use]
    pub const fn size_for(&self, length: usize) -> usize {
        if self.is_array() {
            align_up(HEADER_SIZE + length * self.element_size)
        } else {
            self.instance_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_state_transitions() {
        let ty = ObjectType::object("Pair", 32, &[2, 3]);
        let mut storage = [0usize; 4];
        let addr = storage.as_mut_ptr() as usize;
        unsafe { ObjectHeader::init(addr, ty, 0) };
        let header = unsafe { ObjectHeader::at(addr) };

        assert_eq!(header.state(), ObjectState::Normal);
        assert!(std::ptr::eq(unsafe { header.object_type() }, ty));
        header.pin();
        assert!(header.is_pinned());
        header.unpin();
        assert_eq!(header.forwarded_to(), None);
        header.forward_to(0x1000);
        assert_eq!(header.forwarded_to(), Some(0x1000));
    }

    #[test]
    fn array_sizes() {
        let bytes = ObjectType::array("Bytes", 1, &[]);
        assert_eq!(bytes.size_for(0), HEADER_SIZE);
        assert_eq!(bytes.size_for(3), HEADER_SIZE + 8);
        let refs = ObjectType::ref_array("Object[]");
        assert_eq!(refs.size_for(4), HEADER_SIZE + 32);
        assert!(refs.is_array());
    }

    #[test]
    fn checked_sizes_reject_oversized_lengths() {
        let bytes = ObjectType::array("Bytes", 1, &[]);
        assert_eq!(bytes.checked_size_for(3), Some(HEADER_SIZE + 8));
        assert_eq!(bytes.checked_size_for(u32::MAX as usize + 1), None);
        assert_eq!(bytes.checked_size_for(usize::MAX / 4), None);

        let huge = ObjectType::array("Huge", 1 << 40, &[]);
        assert_eq!(huge.checked_size_for(1 << 30), None);

        let node = ObjectType::object("Node", 32, &[2]);
        assert_eq!(node.checked_size_for(0), Some(32));
        assert_eq!(node.checked_size_for(1 << 33), None);
    }

    #[test]
    fn obj_ref_rejects_null() {
        assert!(ObjRef::from_addr(0).is_none());
        assert_eq!(ObjRef::from_addr(0x10).map(ObjRef::addr), Some(0x10));
    }
}
