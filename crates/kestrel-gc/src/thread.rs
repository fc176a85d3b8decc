//! Per-thread collector state.
//!
//! A [`ThreadInfo`] is shared between its owning mutator and the collector.
//! The owner touches its allocation buffer and remembered set freely while
//! it runs; the collector touches them only while the owner is stopped.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use crate::remset::ThreadRemset;
use crate::stack::{self, RegisterSnapshot, REGISTER_WORDS};

// ============================================================================
// Thread states
// ============================================================================

/// Where a mutator stands relative to the stop-the-world protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ThreadState {
    /// Executing managed code; must reach a safepoint before a collection.
    Running = 0,
    /// In native code or waiting for the collector lock. Its stack snapshot is
    /// recorded and it will not touch the heap without leaving this state.
    Blocking = 1,
    /// Stopped at a safepoint.
    Parked = 2,
    /// Was `Blocking` when a collection started; cannot leave until resumed.
    Suspended = 3,
}

impl ThreadState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Blocking,
            2 => Self::Parked,
            _ => Self::Suspended,
        }
    }
}

// ============================================================================
// Allocation buffer
// ============================================================================

/// A thread-local allocation buffer leased from the nursery.
///
/// `temp_end` trails `real_end` by at most one scan-start interval so every
/// object start within an interval gets recorded.
pub(crate) struct Tlab {
    pub(crate) start: AtomicUsize,
    pub(crate) next: AtomicUsize,
    pub(crate) temp_end: AtomicUsize,
    pub(crate) real_end: AtomicUsize,
}

impl Tlab {
    const fn new() -> Self {
        Self {
            start: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            temp_end: AtomicUsize::new(0),
            real_end: AtomicUsize::new(0),
        }
    }

    /// Drop the buffer. The unused tail is already zeroed.
    pub(crate) fn retire(&self) {
        self.start.store(0, Ordering::Relaxed);
        self.next.store(0, Ordering::Relaxed);
        self.temp_end.store(0, Ordering::Relaxed);
        self.real_end.store(0, Ordering::Relaxed);
    }

    /// Bytes left between the bump pointer and the end of the buffer.
    pub(crate) fn unused_bytes(&self) -> usize {
        let real_end = self.real_end.load(Ordering::Relaxed);
        real_end.saturating_sub(self.next.load(Ordering::Relaxed))
    }

    pub(crate) fn install(&self, start: usize, end: usize, temp_end: usize) {
        self.start.store(start, Ordering::Relaxed);
        self.next.store(start, Ordering::Relaxed);
        self.real_end.store(end, Ordering::Relaxed);
        self.temp_end.store(temp_end, Ordering::Relaxed);
    }
}

// ============================================================================
// ThreadInfo
// ============================================================================

pub(crate) struct ThreadInfo {
    pub(crate) id: u64,
    state: AtomicU8,
    /// Epoch of the last stop this thread acknowledged.
    pub(crate) stopped_epoch: AtomicU64,
    stack_bottom: usize,
    stack_top: usize,
    sp: AtomicUsize,
    regs: [AtomicUsize; REGISTER_WORDS],
    /// Set while inside the allocation fast path.
    pub(crate) in_critical_region: AtomicBool,
    /// Set by the collector to let a parked thread run until its next
    /// safepoint.
    pub(crate) step_request: AtomicBool,
    pub(crate) tlab: Tlab,
    remset: UnsafeCell<ThreadRemset>,
}

// SAFETY: the remembered set is only accessed by the owning thread while it
// runs and by the collector while the owner is stopped or blocking.
unsafe impl Sync for ThreadInfo {}
unsafe impl Send for ThreadInfo {}

impl ThreadInfo {
    /// State for the calling thread.
    pub(crate) fn current(id: u64) -> Self {
        let bounds = stack::get_stack_bounds();
        Self {
            id,
            state: AtomicU8::new(ThreadState::Running as u8),
            stopped_epoch: AtomicU64::new(0),
            stack_bottom: bounds.map_or(0, |b| b.bottom),
            stack_top: bounds.map_or(0, |b| b.top),
            sp: AtomicUsize::new(0),
            regs: std::array::from_fn(|_| AtomicUsize::new(0)),
            in_critical_region: AtomicBool::new(false),
            step_request: AtomicBool::new(false),
            tlab: Tlab::new(),
            remset: UnsafeCell::new(ThreadRemset::new()),
        }
    }

    #[inline]
    pub(crate) fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn transition(&self, from: ThreadState, to: ThreadState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Snapshot the stack pointer and callee-saved registers of the calling
    /// thread, which must be the owner.
    #[inline(never)]
    pub(crate) fn record_context(&self) {
        let regs = stack::spill_registers();
        for (slot, value) in self.regs.iter().zip(regs) {
            slot.store(value, Ordering::Relaxed);
        }
        self.sp.store(stack::current_stack_pointer(), Ordering::Release);
    }

    pub(crate) fn registers(&self) -> RegisterSnapshot {
        std::array::from_fn(|i| self.regs[i].load(Ordering::Relaxed))
    }

    /// The live part of the stack as `(start, len)`, if the recorded stack
    /// pointer lies within the thread's stack bounds.
    pub(crate) fn stack_range(&self) -> Option<(usize, usize)> {
        let sp = self.sp.load(Ordering::Acquire);
        (sp != 0 && sp >= self.stack_top && sp < self.stack_bottom)
            .then(|| (sp, self.stack_bottom - sp))
    }

    /// `true` if `addr` lies within this thread's stack.
    #[inline]
    pub(crate) const fn on_stack(&self, addr: usize) -> bool {
        addr >= self.stack_top && addr < self.stack_bottom
    }

    /// # Safety
    ///
    /// The caller must be the owning thread, or the owner must be stopped,
    /// and no other reference to the remembered set may be live.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn remset_mut(&self) -> &mut ThreadRemset {
        unsafe { &mut *self.remset.get() }
    }
}
