//! GC metrics and statistics.

use std::time::{Duration, Instant};

/// Statistics from the most recent garbage collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcMetrics {
    /// Wall-clock pause, from the stop request to the restart.
    pub duration: Duration,
    /// Type of collection (Minor or Major).
    pub collection_type: CollectionType,
    /// Time spent resolving conservative candidates to pinned objects.
    pub pinning_duration: Duration,
    /// Time spent copying and scanning reachable objects.
    pub scanning_duration: Duration,
    /// Time spent in the finalization and weak-link passes.
    pub finalizing_duration: Duration,
    /// Time spent rebuilding nursery fragments and sweeping old spaces.
    pub sweep_duration: Duration,
    /// Bytes copied out of the nursery or into to-space.
    pub bytes_copied: usize,
    /// Objects copied.
    pub objects_copied: usize,
    /// Objects pinned by conservative references.
    pub objects_pinned: usize,
    /// Objects moved to the ready-for-finalization queue.
    pub finalizers_queued: usize,
    /// Weak links cleared because their target died.
    pub weak_links_nulled: usize,
    /// Bytes returned to the OS by the large-object sweep.
    pub los_bytes_reclaimed: usize,
    /// Major heap sections released.
    pub sections_freed: usize,
    /// Times a thread had to be stepped out of the allocation fast path.
    pub critical_region_restarts: usize,
    /// A minor collection that went on to run a major collection.
    pub escalated: bool,
}

impl Default for GcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GcMetrics {
    /// Create a new `GcMetrics` with all fields set to zero/defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            duration: Duration::ZERO,
            collection_type: CollectionType::None,
            pinning_duration: Duration::ZERO,
            scanning_duration: Duration::ZERO,
            finalizing_duration: Duration::ZERO,
            sweep_duration: Duration::ZERO,
            bytes_copied: 0,
            objects_copied: 0,
            objects_pinned: 0,
            finalizers_queued: 0,
            weak_links_nulled: 0,
            los_bytes_reclaimed: 0,
            sections_freed: 0,
            critical_region_restarts: 0,
            escalated: false,
        }
    }

    /// Fold the counters of a collection that ran inside this one (a major
    /// collection triggered at the end of a minor one).
    pub(crate) fn absorb(&mut self, nested: &Self) {
        self.collection_type = nested.collection_type;
        self.pinning_duration += nested.pinning_duration;
        self.scanning_duration += nested.scanning_duration;
        self.finalizing_duration += nested.finalizing_duration;
        self.sweep_duration += nested.sweep_duration;
        self.bytes_copied += nested.bytes_copied;
        self.objects_copied += nested.objects_copied;
        self.objects_pinned += nested.objects_pinned;
        self.finalizers_queued += nested.finalizers_queued;
        self.weak_links_nulled += nested.weak_links_nulled;
        self.los_bytes_reclaimed += nested.los_bytes_reclaimed;
        self.sections_freed += nested.sections_freed;
        self.escalated = true;
    }
}

/// Type of GC collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CollectionType {
    /// No collection has run yet.
    #[default]
    None = 0,
    /// A minor collection (nursery only).
    Minor = 1,
    /// A major collection (whole heap).
    Major = 2,
}

/// Internal helper for capturing phase durations.
///
/// ```
/// use kestrel_gc::metrics::PhaseTimer;
///
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... pinning work ...
/// let pinning = timer.stop();
/// assert!(pinning <= std::time::Duration::from_secs(1));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimer {
    current_start: Option<Instant>,
}

impl PhaseTimer {
    /// Create an idle timer.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    /// Stop timing and return the elapsed time (zero if never started).
    pub fn stop(&mut self) -> Duration {
        self.current_start
            .take()
            .map_or(Duration::ZERO, |start| start.elapsed())
    }
}
