//! Allocator for the collector's own bookkeeping.
//!
//! Gray queue sections, remembered-set logs, fragment lists, the pin queue,
//! finalization and weak-link tables all live here rather than on the global
//! allocator or in the managed heap, so growing collector metadata can never
//! trigger a collection.
//!
//! Small requests are served from size-class free lists. A class refills by
//! carving a 16 KiB page out of a 1 MiB OS chunk. Requests above the largest
//! class get their own mapping.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::LazyLock;

use allocator_api2::alloc::{AllocError, Allocator, Layout};
use crossbeam_queue::SegQueue;
use hashbrown::DefaultHashBuilder;
use parking_lot::Mutex;
use sys_alloc::{Mmap, MmapOptions};

use crate::error::gc_fatal;

// ============================================================================
// Constants
// ============================================================================

const CHUNK_SIZE: usize = 1024 * 1024;
const PAGE_SIZE: usize = 16 * 1024;

/// Block sizes served from free lists.
const SIZE_CLASSES: [usize; 30] = [
    8, 16, 24, 32, 40, 48, 64, 80, 96, 128, 160, 192, 224, 248, 320, 384, 448, 528, 584, 680, 816,
    1088, 1360, 2040, 2336, 2728, 3272, 4088, 5456, 8184,
];

/// Largest request served from a size class.
pub const MAX_SMALL_SIZE: usize = SIZE_CLASSES[SIZE_CLASSES.len() - 1];

/// What an internal allocation is used for. Only used for statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InternalMemType {
    /// Gray queue sections.
    GrayQueue,
    /// Conservative candidates and pinned objects of one collection.
    PinQueue,
    /// Remembered-set logs and store buffers.
    Remset,
    /// Nursery and section fragment lists.
    Fragments,
    /// Section bookkeeping.
    Sections,
    /// Large-object bookkeeping.
    LargeObjects,
    /// Registered root ranges.
    Roots,
    /// Finalizer registrations.
    FinalizeTable,
    /// Disappearing links.
    LinkTable,
    /// Objects waiting for their finalizer.
    ReadyQueue,
}

const MEM_TYPE_COUNT: usize = 10;

impl InternalMemType {
    /// Every tag, in declaration order.
    pub const ALL: [Self; MEM_TYPE_COUNT] = [
        Self::GrayQueue,
        Self::PinQueue,
        Self::Remset,
        Self::Fragments,
        Self::Sections,
        Self::LargeObjects,
        Self::Roots,
        Self::FinalizeTable,
        Self::LinkTable,
        Self::ReadyQueue,
    ];

    /// Human-readable tag name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::GrayQueue => "gray-queue",
            Self::PinQueue => "pin-queue",
            Self::Remset => "remset",
            Self::Fragments => "fragments",
            Self::Sections => "sections",
            Self::LargeObjects => "large-objects",
            Self::Roots => "roots",
            Self::FinalizeTable => "finalize-table",
            Self::LinkTable => "link-table",
            Self::ReadyQueue => "ready-queue",
        }
    }

    /// Bytes currently allocated under this tag, across all collectors.
    #[must_use]
    pub fn bytes_in_use(self) -> usize {
        INTERNAL.in_use[self as usize].load(Ordering::Relaxed)
    }
}

// ============================================================================
// Size-class allocator
// ============================================================================

/// Index of the smallest class that fits `size` bytes at `align`.
fn class_index(size: usize, align: usize) -> Option<usize> {
    SIZE_CLASSES
        .iter()
        .position(|&class| class >= size && class % align == 0)
}

struct Carver {
    chunks: Vec<Mmap>,
    next_page: usize,
    chunk_end: usize,
}

struct InternalAllocator {
    free_lists: [SegQueue<usize>; SIZE_CLASSES.len()],
    carver: Mutex<Carver>,
    large: Mutex<hashbrown::HashMap<usize, Mmap>>,
    in_use: [AtomicUsize; MEM_TYPE_COUNT],
}

static INTERNAL: LazyLock<InternalAllocator> = LazyLock::new(|| InternalAllocator {
    free_lists: std::array::from_fn(|_| SegQueue::new()),
    carver: Mutex::new(Carver {
        chunks: Vec::new(),
        next_page: 0,
        chunk_end: 0,
    }),
    large: Mutex::new(hashbrown::HashMap::new()),
    in_use: std::array::from_fn(|_| AtomicUsize::new(0)),
});

impl InternalAllocator {
    fn alloc_block(&self, class: usize) -> usize {
        if let Some(block) = self.free_lists[class].pop() {
            return block;
        }
        let page = self.carve_page();
        let size = SIZE_CLASSES[class];
        for i in 1..PAGE_SIZE / size {
            self.free_lists[class].push(page + i * size);
        }
        page
    }

    fn carve_page(&self) -> usize {
        let mut carver = self.carver.lock();
        if carver.next_page == carver.chunk_end {
            // SAFETY: fresh anonymous mapping.
            let chunk = unsafe { MmapOptions::new().len(CHUNK_SIZE).align(CHUNK_SIZE).map_anon() };
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => gc_fatal!("internal allocator cannot map {CHUNK_SIZE} bytes: {err}"),
            };
            carver.next_page = chunk.ptr() as usize;
            carver.chunk_end = chunk.end();
            carver.chunks.push(chunk);
        }
        let page = carver.next_page;
        carver.next_page += PAGE_SIZE;
        page
    }

    fn alloc_large(&self, size: usize) -> usize {
        // SAFETY: fresh anonymous mapping.
        let map = match unsafe { MmapOptions::new().len(size).map_anon() } {
            Ok(map) => map,
            Err(err) => gc_fatal!("internal allocator cannot map {size} bytes: {err}"),
        };
        let addr = map.ptr() as usize;
        self.large.lock().insert(addr, map);
        addr
    }
}

// ============================================================================
// Allocator trait
// ============================================================================

/// Handle to the internal allocator, tagged with what the memory is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternalAlloc {
    tag: InternalMemType,
}

impl InternalAlloc {
    /// Allocator handle charging its memory to `tag`.
    #[must_use]
    pub const fn new(tag: InternalMemType) -> Self {
        Self { tag }
    }
}

unsafe impl Allocator for InternalAlloc {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            let dangling = NonNull::new(layout.align() as *mut u8).ok_or(AllocError)?;
            return Ok(NonNull::slice_from_raw_parts(dangling, 0));
        }
        let (addr, size) = match class_index(layout.size(), layout.align()) {
            Some(class) => (INTERNAL.alloc_block(class), SIZE_CLASSES[class]),
            None if layout.align() <= sys_alloc::page_size() => {
                (INTERNAL.alloc_large(layout.size()), layout.size())
            }
            None => return Err(AllocError),
        };
        INTERNAL.in_use[self.tag as usize].fetch_add(size, Ordering::Relaxed);
        let ptr = NonNull::new(addr as *mut u8).ok_or(AllocError)?;
        // Report the requested length so deallocation sees the same layout.
        Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        let addr = ptr.as_ptr() as usize;
        let size = match class_index(layout.size(), layout.align()) {
            Some(class) => {
                INTERNAL.free_lists[class].push(addr);
                SIZE_CLASSES[class]
            }
            None => {
                INTERNAL.large.lock().remove(&addr);
                layout.size()
            }
        };
        INTERNAL.in_use[self.tag as usize].fetch_sub(size, Ordering::Relaxed);
    }
}

/// Vector backed by the internal allocator.
pub(crate) type InternalVec<T> = allocator_api2::vec::Vec<T, InternalAlloc>;

/// Hash map backed by the internal allocator.
pub(crate) type InternalMap<K, V> = hashbrown::HashMap<K, V, DefaultHashBuilder, InternalAlloc>;

/// Hash set backed by the internal allocator.
pub(crate) type InternalSet<K> = hashbrown::HashSet<K, DefaultHashBuilder, InternalAlloc>;

/// Empty vector charged to `tag`.
pub(crate) const fn vec_in<T>(tag: InternalMemType) -> InternalVec<T> {
    allocator_api2::vec::Vec::new_in(InternalAlloc::new(tag))
}

/// Empty map charged to `tag`.
pub(crate) fn map_in<K, V>(tag: InternalMemType) -> InternalMap<K, V> {
    hashbrown::HashMap::with_hasher_in(DefaultHashBuilder::default(), InternalAlloc::new(tag))
}

/// Empty set charged to `tag`.
pub(crate) fn set_in<K>(tag: InternalMemType) -> InternalSet<K> {
    hashbrown::HashSet::with_hasher_in(DefaultHashBuilder::default(), InternalAlloc::new(tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_respect_alignment() {
        assert_eq!(class_index(1, 8), Some(0));
        assert_eq!(SIZE_CLASSES[class_index(20, 16).unwrap()], 32);
        assert_eq!(SIZE_CLASSES[class_index(600, 8).unwrap()], 680);
        assert_eq!(class_index(MAX_SMALL_SIZE + 1, 8), None);
    }

    #[test]
    fn vec_round_trip_through_free_lists() {
        let mut v: InternalVec<u64> = vec_in(InternalMemType::GrayQueue);
        for i in 0..10_000 {
            v.push(i);
        }
        assert_eq!(v.iter().copied().sum::<u64>(), (0..10_000).sum());
        assert!(InternalMemType::GrayQueue.bytes_in_use() >= 10_000 * 8);
    }

    #[test]
    fn maps_use_the_internal_allocator() {
        let mut map: InternalMap<usize, bool> = map_in(InternalMemType::LinkTable);
        for i in 0..500 {
            map.insert(i * 8, i % 2 == 0);
        }
        assert_eq!(map.get(&16), Some(&true));
        assert_eq!(map.len(), 500);
        let mut set: InternalSet<usize> = set_in(InternalMemType::FinalizeTable);
        set.insert(42);
        assert!(set.contains(&42));
    }

    #[test]
    fn blocks_are_reused() {
        let alloc = InternalAlloc::new(InternalMemType::PinQueue);
        let layout = Layout::from_size_align(40, 8).unwrap();
        let a = alloc.allocate(layout).unwrap();
        unsafe { alloc.deallocate(a.cast(), layout) };
        let b = alloc.allocate(layout).unwrap();
        assert_eq!(b.len(), 40);
        unsafe { alloc.deallocate(b.cast(), layout) };
    }
}
