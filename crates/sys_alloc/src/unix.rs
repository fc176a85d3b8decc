use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
))]
const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
)))]
const MAP_NORESERVE: libc::c_int = 0;

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            #[allow(clippy::cast_sign_loss)]
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

unsafe fn raw_map(len: usize, extra_flags: libc::c_int) -> io::Result<usize> {
    let flags = libc::MAP_PRIVATE | libc::MAP_ANON | extra_flags;
    let prot = libc::PROT_READ | libc::PROT_WRITE;

    let ptr = unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, -1, 0) };
    if ptr == libc::MAP_FAILED {
        return Err(Error::last_os_error());
    }
    Ok(ptr as usize)
}

pub struct MmapInner {
    start: usize,
    len: usize,
}

impl MmapInner {
    /// Maps `len` zeroed bytes wherever the kernel places them.
    ///
    /// # Safety
    ///
    /// This function is unsafe because it calls `mmap`.
    pub unsafe fn map_anon(len: usize) -> io::Result<Self> {
        let start = unsafe { raw_map(len, 0)? };
        Ok(Self { start, len })
    }

    /// Maps `len + align` bytes and trims the unaligned head and the tail so
    /// exactly `len` aligned bytes remain mapped.
    ///
    /// # Safety
    ///
    /// This function is unsafe because it calls `mmap` and `munmap`.
    pub unsafe fn map_anon_aligned(len: usize, align: usize) -> io::Result<Self> {
        let len = len.next_multiple_of(page_size());
        let total = len + align;

        let raw = unsafe { raw_map(total, MAP_NORESERVE)? };
        let start = raw.next_multiple_of(align);
        let head = start - raw;
        let tail = total - head - len;

        unsafe {
            if head > 0 {
                libc::munmap(raw as *mut libc::c_void, head);
            }
            if tail > 0 {
                libc::munmap((start + len) as *mut libc::c_void, tail);
            }
        }
        Ok(Self { start, len })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.start as *mut u8
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.start as *mut libc::c_void, self.len);
            }
        }
    }
}
