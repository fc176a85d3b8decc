//! Bounded lock-free staging arrays.
//!
//! Finalizer and weak-link registrations come from arbitrary mutator threads.
//! Instead of taking the collector lock for each one, a thread claims a free
//! slot with a compare-and-swap, writes its entry and publishes it. The
//! collector drains the array whenever it already holds the lock; a thread
//! that finds the array full takes the lock and drains it itself.
//!
//! Each slot moves through `FREE -> BUSY -> USED -> BUSY -> FREE`. Only the
//! thread that moved a slot to `BUSY` touches its value. Every entry carries
//! a sequence number, and a drain applies entries in the order they were
//! added, whichever slots they landed in.
//!
//! # Example
//!
//! ```
//! use kestrel_gc::staging::StagingArray;
//!
//! let stage: StagingArray<u32, 4> = StagingArray::new();
//! assert!(stage.try_add(7));
//! let mut seen = Vec::new();
//! assert_eq!(stage.drain(|v| seen.push(v)), 1);
//! assert_eq!(seen, [7]);
//! ```

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Slot holds nothing.
pub const STAGE_FREE: u8 = 0;
/// Slot is being written or read by one thread.
pub const STAGE_BUSY: u8 = 1;
/// Slot holds a published entry.
pub const STAGE_USED: u8 = 2;

/// Default capacity of the collector's staging arrays.
pub const STAGE_ENTRIES: usize = 1024;

struct Slot<T> {
    state: AtomicU8,
    seq: UnsafeCell<u64>,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// A fixed array of `N` entries filled without locks.
pub struct StagingArray<T, const N: usize> {
    slots: Box<[Slot<T>]>,
    next_seq: AtomicU64,
}

// SAFETY: a slot's value is only accessed by the thread that won the CAS to
// BUSY, and the USED/FREE transitions publish it with release/acquire.
unsafe impl<T: Send, const N: usize> Sync for StagingArray<T, N> {}
unsafe impl<T: Send, const N: usize> Send for StagingArray<T, N> {}

impl<T: Copy, const N: usize> StagingArray<T, N> {
    /// An empty array.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: (0..N)
                .map(|_| Slot {
                    state: AtomicU8::new(STAGE_FREE),
                    seq: UnsafeCell::new(0),
                    value: UnsafeCell::new(MaybeUninit::uninit()),
                })
                .collect(),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Publish `value` in a free slot. Returns `false` if every slot is taken.
    pub fn try_add(&self, value: T) -> bool {
        for slot in &*self.slots {
            if slot.state.load(Ordering::Relaxed) != STAGE_FREE {
                continue;
            }
            if slot
                .state
                .compare_exchange(STAGE_FREE, STAGE_BUSY, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            // SAFETY: the CAS above gave this thread exclusive use of the slot.
            unsafe {
                *slot.seq.get() = seq;
                (*slot.value.get()).write(value);
            }
            slot.state.store(STAGE_USED, Ordering::Release);
            return true;
        }
        false
    }

    /// Hand every published entry to `f`, oldest first, and free its slot.
    /// Returns how many entries were drained.
    ///
    /// Slots that are mid-write are left for the next drain. Entries are
    /// ordered in an `N`-element buffer on the stack.
    pub fn drain(&self, mut f: impl FnMut(T)) -> usize {
        let mut order = [(0u64, 0usize); N];
        let mut claimed = 0;
        for (index, slot) in self.slots.iter().enumerate() {
            if slot
                .state
                .compare_exchange(STAGE_USED, STAGE_BUSY, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            // SAFETY: USED means a writer initialized the slot and released
            // it; the CAS made this thread its only reader.
            order[claimed] = (unsafe { *slot.seq.get() }, index);
            claimed += 1;
        }
        order[..claimed].sort_unstable_by_key(|&(seq, _)| seq);

        for &(_, index) in &order[..claimed] {
            let slot = &self.slots[index];
            // SAFETY: claimed above and still BUSY.
            let value = unsafe { (*slot.value.get()).assume_init() };
            slot.state.store(STAGE_FREE, Ordering::Release);
            f(value);
        }
        claimed
    }

    /// Number of published entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state.load(Ordering::Relaxed) == STAGE_USED)
            .count()
    }

    /// `true` if no entry is published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<T: Copy, const N: usize> Default for StagingArray<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
