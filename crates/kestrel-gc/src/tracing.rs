//! GC tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! tracing spans and events for garbage collection operations.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    /// Phases of a collection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum GcPhase {
        /// Resolve conservative candidates and pin their objects.
        Pinning,
        /// Copy and scan everything reachable.
        Scanning,
        /// Finalization and weak-link passes.
        Finalizing,
        /// Rebuild the nursery free list.
        FragmentRebuild,
        /// Release dead sections, large objects and pinned blocks.
        Sweep,
    }

    /// Stable identifier for a GC run.
    ///
    /// Correlates every event emitted by one collection. Starts at 1 and
    /// increases monotonically across all collectors in the process.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique GC ID.
    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a span for the entire GC collection.
    pub fn trace_gc_collection(collection_type: &str, gc_id: GcId) -> span::EnteredSpan {
        span!(
            Level::DEBUG,
            "gc_collect",
            collection_type = collection_type,
            gc_id = gc_id.0
        )
        .entered()
    }

    /// Create a span for a GC phase.
    pub fn trace_phase(phase: GcPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }

    /// Log the start of a GC phase.
    pub fn log_phase_start(phase: GcPhase, bytes_used: usize) {
        tracing::debug!(phase = ?phase, bytes_used, "phase_start");
    }

    /// Log the end of a GC phase.
    pub fn log_phase_end(phase: GcPhase, objects: usize) {
        tracing::debug!(phase = ?phase, objects, "phase_end");
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    /// Stub function when tracing is disabled.
    #[must_use]
    pub const fn next_gc_id() -> GcId {
        GcId(0)
    }
}

pub use internal::GcId;
