//! Anonymous OS memory mappings for the collector's heap spaces.
//!
//! Every region the collector owns (the nursery, heap sections, large objects,
//! pinned pages and the internal allocator's chunks) is a [`Mmap`]. Regions that
//! must be found again by masking an interior address are requested with
//! [`MmapOptions::align`].

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is the system page size.
/// Alignments up to this value come for free with every mapping.
#[must_use]
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// A handle to a memory mapped region.
///
/// The region is zero-filled when created and unmapped when this handle is dropped.
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Returns a pointer to the start of the memory mapping.
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the memory mapping in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping is empty. Mappings are never created empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// First address past the end of the mapping.
    #[must_use]
    pub fn end(&self) -> usize {
        self.ptr() as usize + self.len()
    }

    /// Returns `true` if `addr` lies inside the mapping.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.ptr() as usize;
        addr >= start && addr < start + self.len()
    }
}

impl std::fmt::Debug for Mmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mmap")
            .field("ptr", &self.ptr())
            .field("len", &self.len())
            .finish()
    }
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

/// Configuration for creating a memory mapping.
#[derive(Debug, Clone)]
pub struct MmapOptions {
    len: usize,
    align: usize,
}

impl MmapOptions {
    /// Creates a new `MmapOptions` with default settings (length 0).
    /// You must set a length before mapping.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            len: 0,
            align: 0,
        }
    }

    /// Sets the length of the mapping in bytes.
    #[must_use]
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Requires the start of the mapping to be a multiple of `align`.
    ///
    /// `align` must be a power of two. Alignments at or below the allocation
    /// granularity are satisfied by every mapping and cost nothing extra.
    #[must_use]
    pub const fn align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    /// Creates an anonymous, zero-filled memory map.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a zero length or a non-power-of-two alignment,
    /// and the OS error when the mapping cannot be created.
    ///
    /// # Safety
    ///
    /// The mapping is released when the returned [`Mmap`] drops; pointers into
    /// it must not outlive the handle.
    pub unsafe fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        if self.align != 0 && !self.align.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "alignment must be a power of two",
            ));
        }

        let inner = if self.align > allocation_granularity() {
            unsafe { os::MmapInner::map_anon_aligned(self.len, self.align)? }
        } else {
            unsafe { os::MmapInner::map_anon(self.len)? }
        };

        Ok(Mmap { inner })
    }
}

impl Default for MmapOptions {
    fn default() -> Self {
        Self::new()
    }
}
