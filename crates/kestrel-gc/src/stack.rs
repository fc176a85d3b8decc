//! Conservative stack scanning support.
//!
//! Utilities to find a thread's stack, spill callee-saved registers where a
//! scan can see them, and walk a stack range word by word.

/// Bounds of a thread's stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    /// The bottom of the stack (highest address).
    pub bottom: usize,
    /// The top of the stack (lowest address).
    pub top: usize,
}

/// Number of words in a register snapshot.
pub const REGISTER_WORDS: usize = 12;

/// Callee-saved registers captured when a thread parks.
pub type RegisterSnapshot = [usize; REGISTER_WORDS];

/// Retrieve the stack bounds for the current thread.
#[cfg(miri)]
pub fn get_stack_bounds() -> Option<StackBounds> {
    // Miri cannot read other threads' stacks.
    None
}

/// Retrieve the stack bounds for the current thread.
#[cfg(all(target_os = "linux", not(miri)))]
pub fn get_stack_bounds() -> Option<StackBounds> {
    use libc::{
        pthread_attr_destroy, pthread_attr_getstack, pthread_attr_t, pthread_getattr_np,
        pthread_self,
    };

    unsafe {
        let mut attr: pthread_attr_t = std::mem::zeroed();
        if pthread_getattr_np(pthread_self(), &raw mut attr) != 0 {
            return None;
        }

        let mut stackaddr: *mut libc::c_void = std::ptr::null_mut();
        let mut stacksize: libc::size_t = 0;
        let ret = pthread_attr_getstack(&raw const attr, &raw mut stackaddr, &raw mut stacksize);
        pthread_attr_destroy(&raw mut attr);
        if ret != 0 {
            return None;
        }

        let top = stackaddr as usize;
        Some(StackBounds {
            bottom: top + stacksize,
            top,
        })
    }
}

/// Retrieve the stack bounds for the current thread.
#[cfg(all(target_vendor = "apple", not(miri)))]
pub fn get_stack_bounds() -> Option<StackBounds> {
    unsafe {
        let thread = libc::pthread_self();
        let bottom = libc::pthread_get_stackaddr_np(thread) as usize;
        let size = libc::pthread_get_stacksize_np(thread);
        Some(StackBounds {
            bottom,
            top: bottom - size,
        })
    }
}

/// Retrieve the stack bounds for the current thread.
#[cfg(all(windows, not(miri)))]
pub fn get_stack_bounds() -> Option<StackBounds> {
    use windows_sys::Win32::System::Threading::GetCurrentThreadStackLimits;

    let mut low = 0usize;
    let mut high = 0usize;
    unsafe { GetCurrentThreadStackLimits(&raw mut low, &raw mut high) };
    Some(StackBounds {
        bottom: high,
        top: low,
    })
}

/// Retrieve the stack bounds for the current thread.
#[cfg(all(
    not(any(target_os = "linux", target_vendor = "apple", windows)),
    not(miri)
))]
pub const fn get_stack_bounds() -> Option<StackBounds> {
    // Unknown platform; the runtime must report stacks itself.
    None
}

/// Approximate stack pointer of the caller.
#[inline(never)]
pub fn current_stack_pointer() -> usize {
    let marker = 0usize;
    std::hint::black_box(&raw const marker) as usize
}

/// Copy the callee-saved registers into an array so pointers held only in
/// registers become visible to a conservative scan.
#[inline(never)]
pub fn spill_registers() -> RegisterSnapshot {
    #[allow(unused_mut)]
    let mut regs = [0usize; REGISTER_WORDS];

    #[cfg(all(target_arch = "x86_64", not(miri)))]
    unsafe {
        std::arch::asm!(
            "mov [{0}], rbx",
            "mov [{0} + 8], rbp",
            "mov [{0} + 16], r12",
            "mov [{0} + 24], r13",
            "mov [{0} + 32], r14",
            "mov [{0} + 40], r15",
            in(reg) regs.as_mut_ptr(),
            options(nostack, preserves_flags),
        );
    }

    #[cfg(all(target_arch = "aarch64", not(miri)))]
    unsafe {
        std::arch::asm!(
            "stp x19, x20, [{0}]",
            "stp x21, x22, [{0}, #16]",
            "stp x23, x24, [{0}, #32]",
            "stp x25, x26, [{0}, #48]",
            "stp x27, x28, [{0}, #64]",
            "stp x29, x30, [{0}, #80]",
            in(reg) regs.as_mut_ptr(),
            options(nostack, preserves_flags),
        );
    }

    std::hint::black_box(regs)
}

/// Clear scratch callee-saved registers so stale values do not pin objects.
#[cfg(any(test, feature = "test-util"))]
#[inline(never)]
pub unsafe fn clear_registers() {
    #[cfg(all(target_arch = "x86_64", not(miri)))]
    unsafe {
        std::arch::asm!(
            "xor r12, r12",
            "xor r13, r13",
            "xor r14, r14",
            "xor r15, r15",
            out("r12") _,
            out("r13") _,
            out("r14") _,
            out("r15") _,
        );
    }
    #[cfg(any(not(target_arch = "x86_64"), miri))]
    std::hint::black_box(());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn current_sp_is_inside_stack() {
        let Some(bounds) = get_stack_bounds() else {
            return;
        };
        let sp = current_stack_pointer();
        assert!(bounds.top < sp && sp < bounds.bottom);
    }

    #[test]
    fn spilled_registers_have_fixed_width() {
        assert_eq!(spill_registers().len(), REGISTER_WORDS);
    }
}
