//! Heap spaces.
//!
//! | space     | objects                               | moves |
//! |-----------|---------------------------------------|-------|
//! | nursery   | new objects up to 8000 bytes          | yes   |
//! | major     | promoted survivors, degraded allocs   | yes (major collections) |
//! | los       | objects above 8000 bytes              | no    |
//! | pinned    | `alloc_pinned` objects up to 2048 B   | no    |

pub(crate) mod los;
pub(crate) mod major;
pub(crate) mod nursery;
pub(crate) mod pinned;

use crate::scan::object_size;

/// Granularity of scan-start hints.
pub const SCAN_START_SIZE: usize = 8192;

/// Dead gaps smaller than this are zeroed but not reused.
pub const FRAGMENT_MIN_SIZE: usize = 512;

/// Largest object the nursery and heap sections hold; bigger objects go to
/// the large-object space.
pub const MAX_SMALL_OBJ_SIZE: usize = 8000;

/// A free byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Fragment {
    pub(crate) start: usize,
    pub(crate) end: usize,
}

impl Fragment {
    pub(crate) const fn len(self) -> usize {
        self.end - self.start
    }
}

/// First-fit over `frags`: cut `desired` bytes off the first fragment that
/// holds them, else hand out a whole fragment of at least `minimum` bytes.
pub(crate) fn take_range(
    frags: &mut crate::internal::InternalVec<Fragment>,
    desired: usize,
    minimum: usize,
) -> Option<Fragment> {
    if let Some(i) = frags.iter().position(|f| f.len() >= desired) {
        let frag = &mut frags[i];
        let range = Fragment {
            start: frag.start,
            end: frag.start + desired,
        };
        frag.start += desired;
        if frag.len() == 0 {
            frags.remove(i);
        }
        return Some(range);
    }
    let i = frags.iter().position(|f| f.len() >= minimum)?;
    Some(frags.remove(i))
}

/// Zero `[from, to)`.
///
/// # Safety
///
/// The range must be writable heap memory holding no live objects.
pub(crate) unsafe fn zero_range(from: usize, to: usize) {
    if to > from {
        unsafe { std::ptr::write_bytes(from as *mut u8, 0, to - from) };
    }
}

/// Record `addr` as a scan start in `slot` if it precedes the current one.
pub(crate) fn lower_scan_start(slot: &std::sync::atomic::AtomicUsize, addr: usize) {
    use std::sync::atomic::Ordering;
    let mut current = slot.load(Ordering::Relaxed);
    while current == 0 || current > addr {
        match slot.compare_exchange_weak(current, addr, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

/// Walk the objects laid out from `from` and return the one whose extent
/// contains `addr`. Zero words between objects are skipped.
///
/// # Safety
///
/// `from` must be an object start or zeroed memory, and every byte up to
/// `addr` must be objects or zeroes.
pub(crate) unsafe fn find_object_from(from: usize, addr: usize) -> Option<usize> {
    let mut p = from;
    while p <= addr {
        // SAFETY: the caller guarantees p is inside the walked region.
        if unsafe { (p as *const usize).read() } == 0 {
            p += std::mem::size_of::<usize>();
            continue;
        }
        let size = unsafe { object_size(p) };
        if addr < p + size {
            return Some(p);
        }
        p += size;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::{vec_in, InternalMemType};

    #[test]
    fn take_range_cuts_then_falls_back() {
        let mut frags = vec_in(InternalMemType::Fragments);
        frags.push(Fragment { start: 0x1000, end: 0x1400 });
        frags.push(Fragment { start: 0x2000, end: 0x4000 });

        let cut = take_range(&mut frags, 0x1000, 0x1000).unwrap();
        assert_eq!(cut, Fragment { start: 0x2000, end: 0x3000 });

        let whole = take_range(&mut frags, 0x2000, 0x200).unwrap();
        assert_eq!(whole, Fragment { start: 0x1000, end: 0x1400 });

        assert!(take_range(&mut frags, 0x2000, 0x2000).is_none());
        assert_eq!(frags.len(), 1);
    }

    #[test]
    fn scan_start_keeps_lowest() {
        let slot = std::sync::atomic::AtomicUsize::new(0);
        lower_scan_start(&slot, 0x3000);
        lower_scan_start(&slot, 0x2000);
        lower_scan_start(&slot, 0x2800);
        assert_eq!(slot.into_inner(), 0x2000);
    }
}
