//! Collector configuration.

use crate::error::GcError;

/// Default nursery size (4 MiB).
pub const DEFAULT_NURSERY_SIZE: usize = 4 * 1024 * 1024;

/// Smallest nursery the collector accepts.
pub const MIN_NURSERY_SIZE: usize = 256 * 1024;

/// Default size of a thread-local allocation buffer.
pub const DEFAULT_TLAB_SIZE: usize = 16 * 1024;

/// Smallest allocation buffer worth leasing.
pub const MIN_TLAB_SIZE: usize = 512;

/// Tunables for a [`Collector`](crate::Collector).
///
/// # Example
///
/// ```
/// use kestrel_gc::GcConfig;
///
/// let config = GcConfig::default()
///     .with_nursery_size(1 << 20)
///     .with_max_heap_size(Some(64 << 20));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcConfig {
    /// Size of the nursery in bytes. Must be a power of two.
    pub nursery_size: usize,
    /// Bytes leased to a thread per allocation buffer.
    pub tlab_size: usize,
    /// Hard ceiling on major heap + LOS + pinned space, nursery included.
    pub max_heap_size: Option<usize>,
    /// Heap size above which the minor allowance shrinks.
    pub soft_heap_limit: Option<usize>,
    /// Scan registered threads' stacks and registers conservatively.
    pub scan_thread_stacks: bool,
    /// Print the governor's allowance computation after each major collection.
    pub debug_allowance: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            nursery_size: DEFAULT_NURSERY_SIZE,
            tlab_size: DEFAULT_TLAB_SIZE,
            max_heap_size: None,
            soft_heap_limit: None,
            scan_thread_stacks: true,
            debug_allowance: false,
        }
    }
}

impl GcConfig {
    /// Set the nursery size.
    #[must_use]
    pub const fn with_nursery_size(mut self, bytes: usize) -> Self {
        self.nursery_size = bytes;
        self
    }

    /// Set the allocation buffer size.
    #[must_use]
    pub const fn with_tlab_size(mut self, bytes: usize) -> Self {
        self.tlab_size = bytes;
        self
    }

    /// Set the hard heap ceiling.
    #[must_use]
    pub const fn with_max_heap_size(mut self, bytes: Option<usize>) -> Self {
        self.max_heap_size = bytes;
        self
    }

    /// Set the soft heap limit.
    #[must_use]
    pub const fn with_soft_heap_limit(mut self, bytes: Option<usize>) -> Self {
        self.soft_heap_limit = bytes;
        self
    }

    /// Enable or disable conservative scanning of thread stacks.
    #[must_use]
    pub const fn with_scan_thread_stacks(mut self, scan: bool) -> Self {
        self.scan_thread_stacks = scan;
        self
    }

    /// Enable or disable allowance debugging output.
    #[must_use]
    pub const fn with_debug_allowance(mut self, debug: bool) -> Self {
        self.debug_allowance = debug;
        self
    }

    /// Check the configuration for consistency.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::InvalidConfig`] describing the first violated rule.
    pub fn validate(&self) -> Result<(), GcError> {
        if !self.nursery_size.is_power_of_two() || self.nursery_size < MIN_NURSERY_SIZE {
            return Err(GcError::InvalidConfig(format!(
                "nursery size must be a power of two of at least {MIN_NURSERY_SIZE} bytes, got {}",
                self.nursery_size
            )));
        }
        if self.tlab_size < MIN_TLAB_SIZE || self.tlab_size % 8 != 0 {
            return Err(GcError::InvalidConfig(format!(
                "tlab size must be a multiple of 8 and at least {MIN_TLAB_SIZE}, got {}",
                self.tlab_size
            )));
        }
        if self.tlab_size * 4 > self.nursery_size {
            return Err(GcError::InvalidConfig(
                "tlab size must fit at least four times in the nursery".into(),
            ));
        }
        if let Some(max_heap) = self.max_heap_size {
            if let Some(soft) = self.soft_heap_limit {
                if max_heap < soft {
                    return Err(GcError::InvalidConfig(
                        "max-heap-size must be at least as large as soft-heap-limit".into(),
                    ));
                }
            }
            if max_heap < self.nursery_size * 4 {
                return Err(GcError::InvalidConfig(
                    "max-heap-size must be at least 4 times larger than nursery size".into(),
                ));
            }
        }
        Ok(())
    }
}
