//! Error types for the collector.

use std::fmt;
use std::io;

use thiserror::Error;

/// Errors surfaced to mutators and embedders.
///
/// Heap corruption and failures in the middle of a collection are not
/// represented here: those abort the process through [`fatal`].
#[derive(Debug, Error)]
pub enum GcError {
    /// A [`GcConfig`](crate::GcConfig) failed validation.
    #[error("invalid collector configuration: {0}")]
    InvalidConfig(String),

    /// The OS refused to map memory for an allocation.
    #[error("out of memory while allocating {requested} bytes")]
    OutOfMemory {
        /// Bytes the failed request needed.
        requested: usize,
        /// The underlying mapping failure.
        #[source]
        source: io::Error,
    },

    /// The allocation would grow the heap past `max_heap_size`, even after a
    /// major collection.
    #[error("heap limit of {limit} bytes exceeded while allocating {requested} bytes")]
    HeapLimitExceeded {
        /// Bytes the failed request needed.
        requested: usize,
        /// The configured ceiling.
        limit: usize,
    },

    /// The requested array length does not fit the object header, or its
    /// byte size overflows.
    #[error("array length {length} is too large")]
    ArrayTooLarge {
        /// The rejected element count.
        length: usize,
    },
}

/// Convenient `Result` alias for fallible collector operations.
pub type GcResult<T> = Result<T, GcError>;

/// Report an unrecoverable invariant violation and abort.
#[cold]
#[inline(never)]
pub(crate) fn fatal(args: fmt::Arguments<'_>) -> ! {
    #[cfg(feature = "tracing")]
    tracing::error!(reason = %args, "fatal collector error");
    eprintln!("[GC] fatal: {args}");
    std::process::abort()
}

/// Abort with a formatted message.
macro_rules! gc_fatal {
    ($($arg:tt)*) => {
        $crate::error::fatal(format_args!($($arg)*))
    };
}

pub(crate) use gc_fatal;
