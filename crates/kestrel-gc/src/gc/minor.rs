//! Minor collection: evacuate nursery survivors into the major heap.
//!
//! Roots are the conservatively scanned memory (which pins), precise roots,
//! and every old-space slot recorded in a remembered set. Old objects are
//! assumed live. Afterwards the nursery is rebuilt into free fragments
//! around the pinned objects.

use crate::collector::GcState;
use crate::error::gc_fatal;
use crate::gc::copy::{Copier, Mode, SlotOrigin};
use crate::gc::{pin_conservative_roots, range_of, scan_precise_roots, CollectionContext};
use crate::metrics::{CollectionType, GcMetrics, PhaseTimer};
use crate::remset::{RemsetEntry, RemsetLog};
use crate::roots::RootRegistry;
use crate::scan::{scan_object, scan_value_types};

#[cfg(feature = "tracing")]
use crate::tracing::internal::{
    log_phase_end, log_phase_start, next_gc_id, trace_gc_collection, trace_phase, GcPhase,
};

const WORD: usize = std::mem::size_of::<usize>();

/// Run a minor collection. The world must be stopped.
pub(crate) fn collect(ctx: &CollectionContext<'_>, state: &mut GcState) -> GcMetrics {
    #[cfg(feature = "tracing")]
    let _span = trace_gc_collection("minor", next_gc_id());

    let mut metrics = GcMetrics::new();
    metrics.collection_type = CollectionType::Minor;
    let mut timer = PhaseTimer::new();

    let GcState {
        fragments,
        degraded,
        major,
        los,
        pinned,
        roots,
        global_remset,
        freed_remset,
        fin,
        governor,
        gray,
        pin_queue,
    } = state;

    for thread in ctx.threads {
        thread.tlab.retire();
    }
    let old_global = std::mem::replace(global_remset, RemsetLog::new());

    let mut copier = Copier {
        mode: Mode::Minor,
        nursery: ctx.nursery,
        major,
        los,
        pinned,
        gray,
        global_remset,
        governor,
        runtime: ctx.runtime,
        bytes_copied: 0,
        objects_copied: 0,
    };

    // Pinning
    timer.start();
    {
        #[cfg(feature = "tracing")]
        let _phase = trace_phase(GcPhase::Pinning);
        #[cfg(feature = "tracing")]
        log_phase_start(GcPhase::Pinning, ctx.nursery.size() - fragments.free_bytes());
        // SAFETY: the world is stopped and buffers retired.
        metrics.objects_pinned =
            unsafe { pin_conservative_roots(ctx, &mut copier, roots, &fin.finalizing, pin_queue) };
        #[cfg(feature = "tracing")]
        log_phase_end(GcPhase::Pinning, metrics.objects_pinned);
    }
    metrics.pinning_duration = timer.stop();

    // Scanning
    timer.start();
    {
        #[cfg(feature = "tracing")]
        let _phase = trace_phase(GcPhase::Scanning);
        unsafe {
            for thread in ctx.threads {
                let remset = thread.remset_mut();
                remset.flush_store_buffer();
                replay_log(&mut copier, roots, &remset.log);
                remset.clear();
            }
            replay_log(&mut copier, roots, freed_remset);
            freed_remset.clear();
            replay_log(&mut copier, roots, &old_global);

            scan_precise_roots(ctx, &mut copier, roots, &mut fin.ready);
            copier.drain_gray();
        }
        #[cfg(feature = "tracing")]
        log_phase_end(GcPhase::Scanning, copier.objects_copied);
    }
    metrics.scanning_duration = timer.stop();

    // Finalization
    timer.start();
    {
        #[cfg(feature = "tracing")]
        let _phase = trace_phase(GcPhase::Finalizing);
        let stats = unsafe { fin.process(&mut copier) };
        metrics.finalizers_queued = stats.queued;
        metrics.weak_links_nulled = stats.nulled;
    }
    metrics.finalizing_duration = timer.stop();

    metrics.bytes_copied = copier.bytes_copied;
    metrics.objects_copied = copier.objects_copied;

    // Fragment rebuild
    timer.start();
    {
        #[cfg(feature = "tracing")]
        let _phase = trace_phase(GcPhase::FragmentRebuild);
        let (lo, hi) = range_of(
            pin_queue,
            ctx.nursery.start(),
            ctx.nursery.start() + ctx.nursery.size(),
        );
        // SAFETY: every unpinned survivor has been copied out.
        let free = unsafe { ctx.nursery.build_fragments(&pin_queue[lo..hi], fragments) };
        #[cfg(feature = "tracing")]
        log_phase_end(GcPhase::FragmentRebuild, free);
        #[cfg(not(feature = "tracing"))]
        let _ = free;
    }
    metrics.sweep_duration = timer.stop();

    #[cfg(feature = "tracing")]
    if fragments.is_empty() && !degraded.active {
        tracing::warn!("nursery has no usable fragments, entering degraded mode");
    }
    degraded.active = fragments.is_empty();
    pin_queue.clear();
    metrics
}

/// Replay every entry of a remembered-set log.
///
/// # Safety
///
/// Entries must name valid slots, objects or value ranges.
unsafe fn replay_log(copier: &mut Copier<'_>, roots: &RootRegistry, log: &RemsetLog) {
    for entry in log.iter() {
        unsafe { replay_entry(copier, roots, entry) };
    }
}

unsafe fn replay_entry(copier: &mut Copier<'_>, roots: &RootRegistry, entry: RemsetEntry) {
    match entry {
        RemsetEntry::Location(slot) => unsafe { replay_slot(copier, roots, slot) },
        RemsetEntry::Range { start, count } => {
            for i in 0..count {
                unsafe { replay_slot(copier, roots, start + i * WORD) };
            }
        }
        RemsetEntry::Object(obj) => {
            if copier.nursery.contains(obj) {
                return;
            }
            unsafe { scan_object(obj, |slot| copier.copy_slot(slot, SlotOrigin::Heap)) };
        }
        RemsetEntry::ValueTypes { start, ty, count } => {
            if copier.nursery.contains(start) {
                return;
            }
            unsafe {
                scan_value_types(start, ty, count, |slot| {
                    copier.copy_slot(slot, SlotOrigin::Heap);
                });
            }
        }
    }
}

unsafe fn replay_slot(copier: &mut Copier<'_>, roots: &RootRegistry, slot: usize) {
    if copier.nursery.contains(slot) {
        return;
    }
    if copier.major.contains(slot) || copier.los.contains(slot) || copier.pinned.contains(slot) {
        unsafe { copier.copy_slot(slot as *mut usize, SlotOrigin::Heap) };
    } else if !roots.contains(slot) {
        gc_fatal!("remembered slot {slot:#x} is neither in the heap nor in a registered root");
    }
}
