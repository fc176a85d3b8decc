use std::io::{self, Error};
use std::mem;
use std::ptr;

#[cfg(not(miri))]
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS,
    PAGE_READWRITE,
};
#[cfg(not(miri))]
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// Placement attempts for an aligned mapping before giving up.
#[cfg(not(miri))]
const ALIGNED_MAP_ATTEMPTS: usize = 8;

/// Returns the system allocation granularity (typically 64KB).
pub fn allocation_granularity() -> usize {
    #[cfg(miri)]
    {
        65536
    }
    #[cfg(not(miri))]
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let gran = info.dwAllocationGranularity as usize;
        if gran == 0 {
            65536
        } else {
            gran
        }
    }
}

pub fn page_size() -> usize {
    #[cfg(miri)]
    {
        4096
    }
    #[cfg(not(miri))]
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let size = info.dwPageSize as usize;
        if size == 0 {
            4096
        } else {
            size
        }
    }
}

pub struct MmapInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
    #[cfg(miri)]
    align: usize,
}

impl MmapInner {
    #[cfg(miri)]
    unsafe fn std_alloc(len: usize, align: usize) -> io::Result<Self> {
        use std::alloc::{alloc_zeroed, Layout};
        let layout = Layout::from_size_align(len, align)
            .map_err(|_| Error::from(io::ErrorKind::InvalidInput))?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(Error::from(io::ErrorKind::OutOfMemory));
        }
        Ok(Self {
            ptr: ptr.cast::<std::ffi::c_void>(),
            len,
            align,
        })
    }

    /// Commits `len` zeroed bytes wherever the system places them.
    pub unsafe fn map_anon(len: usize) -> io::Result<Self> {
        #[cfg(miri)]
        {
            unsafe { Self::std_alloc(len, allocation_granularity()) }
        }
        #[cfg(not(miri))]
        {
            let ptr = unsafe { VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
            if ptr.is_null() {
                return Err(Error::last_os_error());
            }
            Ok(Self { ptr, len })
        }
    }

    /// Reserves `len + align` bytes to find an aligned hole, releases the
    /// reservation and commits exactly `len` bytes at the aligned address.
    /// Another thread may grab the hole in between, so placement is retried.
    pub unsafe fn map_anon_aligned(len: usize, align: usize) -> io::Result<Self> {
        #[cfg(miri)]
        {
            unsafe { Self::std_alloc(len, align) }
        }
        #[cfg(not(miri))]
        {
            for _ in 0..ALIGNED_MAP_ATTEMPTS {
                let reservation = unsafe { VirtualAlloc(ptr::null(), len + align, MEM_RESERVE, PAGE_NOACCESS) };
                if reservation.is_null() {
                    return Err(Error::last_os_error());
                }
                let start = (reservation as usize + align - 1) & !(align - 1);
                unsafe { VirtualFree(reservation, 0, MEM_RELEASE) };

                let ptr = unsafe {
                    VirtualAlloc(
                        start as *const std::ffi::c_void,
                        len,
                        MEM_COMMIT | MEM_RESERVE,
                        PAGE_READWRITE,
                    )
                };
                if !ptr.is_null() {
                    return Ok(Self { ptr, len });
                }
            }
            Err(Error::from(io::ErrorKind::AddrInUse))
        }
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                #[cfg(miri)]
                {
                    use std::alloc::{dealloc, Layout};
                    if let Ok(layout) = Layout::from_size_align(self.len, self.align) {
                        dealloc(self.ptr.cast::<u8>(), layout);
                    }
                }
                #[cfg(not(miri))]
                {
                    // MEM_RELEASE requires dwSize to be 0
                    VirtualFree(self.ptr, 0, MEM_RELEASE);
                }
            }
        }
    }
}

unsafe impl Send for MmapInner {}
unsafe impl Sync for MmapInner {}
