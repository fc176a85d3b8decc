//! Collection drivers and the machinery they share.

pub(crate) mod copy;
pub(crate) mod gray;
pub(crate) mod major;
pub(crate) mod minor;
pub(crate) mod pin;
pub(crate) mod stw;

use std::sync::Arc;

use crate::collector::Runtime;
use crate::config::GcConfig;
use crate::gc::copy::{Copier, SlotOrigin};
use crate::heap::nursery::Nursery;
use crate::internal::InternalVec;
use crate::roots::RootRegistry;
use crate::scan::for_each_root_slot;
use crate::thread::ThreadInfo;

const WORD: usize = std::mem::size_of::<usize>();

/// Everything a collection reads besides the locked [`GcState`](crate::collector::GcState).
pub(crate) struct CollectionContext<'a> {
    pub(crate) config: &'a GcConfig,
    pub(crate) nursery: &'a Nursery,
    pub(crate) runtime: &'a dyn Runtime,
    /// Every registered mutator, all stopped.
    pub(crate) threads: &'a [Arc<ThreadInfo>],
}

/// Pin everything referenced from conservatively scanned memory: thread
/// stacks and registers, stacks reported by the runtime, conservative root
/// ranges, and objects whose finalizer is running. Returns the number of
/// objects pinned in place.
///
/// # Safety
///
/// The world must be stopped and every allocation buffer retired.
pub(crate) unsafe fn pin_conservative_roots(
    ctx: &CollectionContext<'_>,
    copier: &mut Copier<'_>,
    roots: &RootRegistry,
    finalizing: &[usize],
    queue: &mut InternalVec<usize>,
) -> usize {
    queue.clear();
    if ctx.config.scan_thread_stacks {
        for thread in ctx.threads {
            if let Some((start, len)) = thread.stack_range() {
                unsafe { copier.pin_from_region(start, len, queue) };
            }
            unsafe { copier.pin_from_registers(&thread.registers(), queue) };
        }
    }
    ctx.runtime.enumerate_thread_stacks(&mut |start, len| unsafe {
        copier.pin_from_region(start, len, queue);
    });
    for range in roots.iter().filter(|r| r.desc.is_conservative()) {
        unsafe { copier.pin_from_region(range.start, range.words * WORD, queue) };
    }
    for &obj in finalizing {
        unsafe { copier.pin_address(obj, queue) };
    }
    copier.finish_pinning(queue);
    queue.len()
}

/// Trace and update every precise root: registered ranges, runtime roots and
/// the finalization ready queue.
///
/// # Safety
///
/// The world must be stopped; registered ranges must be valid.
pub(crate) unsafe fn scan_precise_roots(
    ctx: &CollectionContext<'_>,
    copier: &mut Copier<'_>,
    roots: &RootRegistry,
    ready: &mut InternalVec<usize>,
) {
    for range in roots.iter() {
        unsafe {
            for_each_root_slot(range.start, range.words, range.desc, |slot| {
                copier.copy_slot(slot, SlotOrigin::Root);
            });
        }
    }
    ctx.runtime.enumerate_roots(&mut |slot| unsafe {
        copier.copy_slot(slot, SlotOrigin::Root);
    });
    for obj in ready.iter_mut() {
        unsafe { copier.copy_slot(obj, SlotOrigin::Root) };
    }
}

/// Start and end index of the objects in `sorted` that lie in
/// `[start, end)`.
pub(crate) fn range_of(sorted: &[usize], start: usize, end: usize) -> (usize, usize) {
    (
        sorted.partition_point(|&p| p < start),
        sorted.partition_point(|&p| p < end),
    )
}
