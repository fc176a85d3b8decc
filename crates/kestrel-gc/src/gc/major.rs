//! Major collection: evacuate the nursery and every section into fresh
//! to-space sections, mark large and pinned-space objects, then sweep.
//!
//! Remembered sets are discarded up front: the whole heap is traced, and any
//! slot that still points into the nursery afterwards (at a pinned object)
//! is recorded again in the global log as it is scanned.

use crate::collector::GcState;
use crate::gc::copy::{Copier, Mode};
use crate::gc::{pin_conservative_roots, range_of, scan_precise_roots, CollectionContext};
use crate::heap::major::SECTION_SIZE;
use crate::heap::pinned::CHUNK_SIZE;
use crate::metrics::{CollectionType, GcMetrics, PhaseTimer};

#[cfg(feature = "tracing")]
use crate::tracing::internal::{
    log_phase_end, log_phase_start, next_gc_id, trace_gc_collection, trace_phase, GcPhase,
};

/// Run a major collection. The world must be stopped.
pub(crate) fn collect(ctx: &CollectionContext<'_>, state: &mut GcState) -> GcMetrics {
    #[cfg(feature = "tracing")]
    let _span = trace_gc_collection("major", next_gc_id());

    let mut metrics = GcMetrics::new();
    metrics.collection_type = CollectionType::Major;
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

    governor.major_collection_start(major.num_sections(), los.memory_usage());
    for thread in ctx.threads {
        thread.tlab.retire();
        // SAFETY: the owner is stopped.
        unsafe { thread.remset_mut() }.clear();
    }
    freed_remset.clear();
    global_remset.clear();
    major.begin_major();

    let mut copier = Copier {
        mode: Mode::Major,
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
        log_phase_start(GcPhase::Pinning, copier.major.used_bytes());
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

    // Sweep
    timer.start();
    {
        #[cfg(feature = "tracing")]
        let _phase = trace_phase(GcPhase::Sweep);
        let (lo, hi) = range_of(
            pin_queue,
            ctx.nursery.start(),
            ctx.nursery.start() + ctx.nursery.size(),
        );
        // SAFETY: every unpinned survivor has been copied out.
        unsafe { ctx.nursery.build_fragments(&pin_queue[lo..hi], fragments) };

        // SAFETY: as above, for from-space sections.
        let sweep = unsafe { copier.major.sweep(pin_queue) };
        copier.governor.release_space(sweep.sections_freed * SECTION_SIZE);
        metrics.sections_freed = sweep.sections_freed;

        let los_sweep = copier.los.sweep();
        copier.governor.release_space(los_sweep.bytes_freed);
        metrics.los_bytes_reclaimed = los_sweep.bytes_freed;
        #[cfg(feature = "tracing")]
        if los_sweep.objects_freed > 0 {
            tracing::debug!(
                objects = los_sweep.objects_freed,
                bytes = los_sweep.bytes_freed,
                "large objects released"
            );
        }

        let pinned_sweep = copier.pinned.sweep();
        copier.governor.release_space(pinned_sweep.chunks_released * CHUNK_SIZE);
        #[cfg(feature = "tracing")]
        log_phase_end(GcPhase::Sweep, sweep.sections_freed);
    }
    metrics.sweep_duration = timer.stop();

    let num_sections = copier.major.num_sections();
    let los_usage = copier.los.memory_usage();
    copier.governor.major_collection_end(num_sections, los_usage);

    degraded.bytes = 0;
    if degraded.active && !fragments.is_empty() {
        degraded.active = false;
        #[cfg(feature = "tracing")]
        tracing::info!("nursery fragments available again, leaving degraded mode");
    }
    pin_queue.clear();
    metrics
}
