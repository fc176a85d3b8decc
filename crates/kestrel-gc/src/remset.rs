//! Remembered sets: logs of old-space locations that may point into the
//! nursery.
//!
//! Each mutator owns a [`ThreadRemset`] that its barriers append to without
//! locking. The collector reads it only while the owner is stopped. Entries
//! that must outlive a minor collection (slots still pointing at a pinned
//! nursery object) go to the global log, and the logs of exited threads are
//! merged into the freed-thread log.

use crate::internal::{vec_in, InternalMemType, InternalVec};
use crate::object::ObjectType;

/// Capacity of the generic-barrier store buffer.
pub const STORE_BUFFER_SIZE: usize = 1024;

/// One remembered location.
#[derive(Debug, Clone, Copy)]
pub(crate) enum RemsetEntry {
    /// A single reference slot.
    Location(usize),
    /// `count` consecutive reference slots.
    Range { start: usize, count: usize },
    /// Every reference slot of an object.
    Object(usize),
    /// `count` inline values of `ty` starting at `start`.
    ValueTypes {
        start: usize,
        ty: &'static ObjectType,
        count: usize,
    },
}

/// An append-only log of entries.
pub(crate) struct RemsetLog {
    entries: InternalVec<RemsetEntry>,
}

impl RemsetLog {
    pub(crate) const fn new() -> Self {
        Self {
            entries: vec_in(InternalMemType::Remset),
        }
    }

    pub(crate) fn push(&mut self, entry: RemsetEntry) {
        self.entries.push(entry);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn append(&mut self, other: &mut Self) {
        self.entries.extend(other.entries.drain(..));
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = RemsetEntry> + '_ {
        self.entries.iter().copied()
    }
}

/// Per-thread barrier state.
pub(crate) struct ThreadRemset {
    pub(crate) log: RemsetLog,
    store_buffer: InternalVec<usize>,
    last_generic: usize,
}

impl ThreadRemset {
    pub(crate) const fn new() -> Self {
        Self {
            log: RemsetLog::new(),
            store_buffer: vec_in(InternalMemType::Remset),
            last_generic: 0,
        }
    }

    /// Log a slot from the generic barrier, dropping an immediate repeat of
    /// the previous slot.
    pub(crate) fn record_generic(&mut self, slot: usize) {
        if slot == self.last_generic {
            return;
        }
        self.last_generic = slot;
        self.store_buffer.push(slot);
        if self.store_buffer.len() >= STORE_BUFFER_SIZE {
            self.flush_store_buffer();
        }
    }

    /// Move buffered generic stores into the log.
    pub(crate) fn flush_store_buffer(&mut self) {
        for slot in self.store_buffer.drain(..) {
            self.log.entries.push(RemsetEntry::Location(slot));
        }
    }

    /// Drop everything (after the entries have been replayed).
    pub(crate) fn clear(&mut self) {
        self.log.clear();
        self.store_buffer.clear();
        self.last_generic = 0;
    }

    pub(crate) fn buffered(&self) -> usize {
        self.store_buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_barrier_dedupes_repeats() {
        let mut remset = ThreadRemset::new();
        remset.record_generic(0x100);
        remset.record_generic(0x100);
        remset.record_generic(0x108);
        remset.record_generic(0x100);
        assert_eq!(remset.buffered(), 3);
        remset.flush_store_buffer();
        assert_eq!(remset.log.len(), 3);
        assert_eq!(remset.buffered(), 0);
    }

    #[test]
    fn full_store_buffer_flushes_into_the_log() {
        let mut remset = ThreadRemset::new();
        for i in 0..STORE_BUFFER_SIZE {
            remset.record_generic(0x1000 + i * 8);
        }
        assert_eq!(remset.buffered(), 0);
        assert_eq!(remset.log.len(), STORE_BUFFER_SIZE);
    }

    #[test]
    fn logs_merge() {
        let mut freed = RemsetLog::new();
        let mut thread = ThreadRemset::new();
        thread.log.push(RemsetEntry::Object(0x2000));
        thread.log.push(RemsetEntry::Range { start: 0x3000, count: 4 });
        freed.append(&mut thread.log);
        assert_eq!(freed.len(), 2);
        assert_eq!(thread.log.len(), 0);
    }
}
