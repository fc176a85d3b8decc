//! `BiBOP` (Big Bag of Pages) space for objects that must never move.
//!
//! Memory is divided into 4KB pages. Each page holds blocks of a single size
//! class, so the block containing any interior address is found with a mask
//! and a division. Page metadata lives out of line, keyed by page address,
//! so blocks start exactly at page offsets that are multiples of the class
//! size.

use std::io;

use sys_alloc::{Mmap, MmapOptions};

use crate::internal::{map_in, vec_in, InternalMap, InternalMemType, InternalVec};

// ============================================================================
// Constants
// ============================================================================

/// Size of each page.
pub const PAGE_SIZE: usize = 4096;

/// Mask for extracting page address from a pointer.
pub const PAGE_MASK: usize = !(PAGE_SIZE - 1);

/// Pages are mapped this many at a time.
const PAGES_PER_CHUNK: usize = 16;

/// Bytes mapped per chunk.
pub const CHUNK_SIZE: usize = PAGE_SIZE * PAGES_PER_CHUNK;

/// Block sizes. Requests are routed to the smallest class that fits.
pub const SIZE_CLASSES: [usize; 8] = [16, 32, 64, 128, 256, 512, 1024, 2048];

/// Pinned objects larger than this go to the large-object space.
pub const MAX_PINNED_OBJECT_SIZE: usize = 2048;

const fn class_index(size: usize) -> Option<usize> {
    let mut i = 0;
    while i < SIZE_CLASSES.len() {
        if SIZE_CLASSES[i] >= size {
            return Some(i);
        }
        i += 1;
    }
    None
}

// ============================================================================
// PageHeader - metadata for one page
// ============================================================================

/// Metadata for one page of the pinned space.
pub(crate) struct PageHeader {
    /// Size of each block in bytes.
    block_size: usize,
    /// Bitmap of marked blocks (one bit per slot).
    mark_bitmap: [u64; 4],
    /// Bitmap of handed-out blocks.
    alloc_bitmap: [u64; 4],
}

impl PageHeader {
    const fn new(block_size: usize) -> Self {
        Self {
            block_size,
            mark_bitmap: [0; 4],
            alloc_bitmap: [0; 4],
        }
    }

    /// Maximum number of blocks in the page.
    const fn obj_count(&self) -> usize {
        PAGE_SIZE / self.block_size
    }

    const fn is_marked(&self, index: usize) -> bool {
        (self.mark_bitmap[index / 64] & (1 << (index % 64))) != 0
    }

    const fn set_mark(&mut self, index: usize) {
        self.mark_bitmap[index / 64] |= 1 << (index % 64);
    }

    const fn clear_all_marks(&mut self) {
        self.mark_bitmap = [0; 4];
    }

    const fn is_allocated(&self, index: usize) -> bool {
        (self.alloc_bitmap[index / 64] & (1 << (index % 64))) != 0
    }

    const fn set_allocated(&mut self, index: usize) {
        self.alloc_bitmap[index / 64] |= 1 << (index % 64);
    }

    const fn clear_allocated(&mut self, index: usize) {
        self.alloc_bitmap[index / 64] &= !(1 << (index % 64));
    }

    fn is_empty(&self) -> bool {
        self.alloc_bitmap == [0; 4]
    }
}

// ============================================================================
// PinnedSpace
// ============================================================================

/// Outcome of [`PinnedSpace::sweep`].
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct PinnedSweep {
    pub(crate) bytes_freed: usize,
    /// Chunks unmapped because none of their pages held a block.
    pub(crate) chunks_released: usize,
}

pub(crate) struct PinnedSpace {
    chunks: InternalVec<Mmap>,
    pages: InternalMap<usize, PageHeader>,
    unused_pages: InternalVec<usize>,
    free_lists: [InternalVec<usize>; SIZE_CLASSES.len()],
    used: usize,
}

impl PinnedSpace {
    pub(crate) fn new() -> Self {
        Self {
            chunks: vec_in(InternalMemType::Sections),
            pages: map_in(InternalMemType::Sections),
            unused_pages: vec_in(InternalMemType::Sections),
            free_lists: std::array::from_fn(|_| vec_in(InternalMemType::Sections)),
            used: 0,
        }
    }

    /// Bytes in allocated blocks.
    pub(crate) const fn used_bytes(&self) -> usize {
        self.used
    }

    /// Bytes mapped from the OS.
    pub(crate) fn mapped_bytes(&self) -> usize {
        self.chunks.len() * CHUNK_SIZE
    }

    /// Allocate a zeroed block for a `size`-byte object.
    ///
    /// `on_new_chunk` runs before more memory is mapped and may veto it.
    pub(crate) fn alloc(
        &mut self,
        size: usize,
        on_new_chunk: impl FnOnce() -> bool,
    ) -> io::Result<Option<usize>> {
        let Some(class) = class_index(size) else {
            return Ok(None);
        };
        if self.free_lists[class].is_empty() && !self.add_page(class, on_new_chunk)? {
            return Ok(None);
        }
        let Some(block) = self.free_lists[class].pop() else {
            return Ok(None);
        };
        if let Some(page) = self.pages.get_mut(&(block & PAGE_MASK)) {
            page.set_allocated((block & !PAGE_MASK) / page.block_size);
        }
        self.used += SIZE_CLASSES[class];
        Ok(Some(block))
    }

    fn add_page(&mut self, class: usize, on_new_chunk: impl FnOnce() -> bool) -> io::Result<bool> {
        if self.unused_pages.is_empty() {
            if !on_new_chunk() {
                return Ok(false);
            }
            // SAFETY: fresh anonymous mapping.
            let chunk = unsafe { MmapOptions::new().len(CHUNK_SIZE).align(PAGE_SIZE).map_anon()? };
            let base = chunk.ptr() as usize;
            self.unused_pages
                .extend((0..PAGES_PER_CHUNK).rev().map(|i| base + i * PAGE_SIZE));
            self.chunks.push(chunk);
        }
        let Some(page) = self.unused_pages.pop() else {
            return Ok(false);
        };
        let block_size = SIZE_CLASSES[class];
        let header = PageHeader::new(block_size);
        let list = &mut self.free_lists[class];
        list.extend((0..header.obj_count()).rev().map(|i| page + i * block_size));
        self.pages.insert(page, header);
        Ok(true)
    }

    /// Start of the allocated block containing `addr`.
    pub(crate) fn find_object(&self, addr: usize) -> Option<usize> {
        let page_addr = addr & PAGE_MASK;
        let page = self.pages.get(&page_addr)?;
        let index = (addr - page_addr) / page.block_size;
        page.is_allocated(index)
            .then_some(page_addr + index * page.block_size)
    }

    pub(crate) fn contains(&self, addr: usize) -> bool {
        self.pages.contains_key(&(addr & PAGE_MASK))
    }

    /// Mark the block at `obj`. Returns `true` the first time.
    pub(crate) fn mark(&mut self, obj: usize) -> bool {
        let page_addr = obj & PAGE_MASK;
        let Some(page) = self.pages.get_mut(&page_addr) else {
            return false;
        };
        let index = (obj - page_addr) / page.block_size;
        if page.is_marked(index) {
            return false;
        }
        page.set_mark(index);
        true
    }

    pub(crate) fn is_marked(&self, obj: usize) -> bool {
        let page_addr = obj & PAGE_MASK;
        self.pages
            .get(&page_addr)
            .is_some_and(|page| page.is_marked((obj - page_addr) / page.block_size))
    }

    /// Free every allocated, unmarked block and clear the marks. Freed blocks
    /// are zeroed. Pages left without blocks return to the unused pool, and
    /// chunks whose pages are all unused are unmapped.
    pub(crate) fn sweep(&mut self) -> PinnedSweep {
        let mut freed = 0;
        let mut emptied = false;
        for (&page_addr, page) in &mut self.pages {
            let class = class_index(page.block_size).unwrap_or(0);
            for index in 0..page.obj_count() {
                if page.is_allocated(index) && !page.is_marked(index) {
                    let block = page_addr + index * page.block_size;
                    // SAFETY: the block belongs to this space and is dead.
                    unsafe { std::ptr::write_bytes(block as *mut u8, 0, page.block_size) };
                    page.clear_allocated(index);
                    self.free_lists[class].push(block);
                    freed += page.block_size;
                }
            }
            page.clear_all_marks();
            emptied |= page.is_empty();
        }
        self.used -= freed;
        PinnedSweep {
            bytes_freed: freed,
            chunks_released: if emptied { self.recycle_empty_pages() } else { 0 },
        }
    }

    /// Move empty pages to the unused pool and unmap fully unused chunks.
    /// Returns the number of chunks unmapped.
    fn recycle_empty_pages(&mut self) -> usize {
        let unused = &mut self.unused_pages;
        self.pages.retain(|&page_addr, page| {
            if page.is_empty() {
                unused.push(page_addr);
                return false;
            }
            true
        });
        let pages = &self.pages;
        for list in &mut self.free_lists {
            list.retain(|&block| pages.contains_key(&(block & PAGE_MASK)));
        }

        let before = self.chunks.len();
        self.chunks.retain(|chunk| {
            let base = chunk.ptr() as usize;
            let in_chunk = |page: &usize| (base..base + CHUNK_SIZE).contains(page);
            if unused.iter().filter(|page| in_chunk(page)).count() < PAGES_PER_CHUNK {
                return true;
            }
            unused.retain(|page| !in_chunk(page));
            false
        });
        let released = before - self.chunks.len();
        #[cfg(feature = "tracing")]
        if released > 0 {
            tracing::debug!(chunks = released, "pinned chunks unmapped");
        }
        released
    }
}
