//! Finalizer registrations and disappearing links.
//!
//! Both kinds of entry are kept per generation: the young tables hold
//! entries whose object is in the nursery and are the only ones a minor
//! collection looks at. Entries move to the old tables as their objects are
//! promoted.
//!
//! A weak slot stores its target *hidden* (bit-inverted, zero for null) so
//! neither precise nor conservative scans treat it as a reference.

use crate::gc::copy::{Copier, Mode};
use crate::heap::nursery::Nursery;
use crate::internal::{map_in, set_in, vec_in, InternalMap, InternalMemType, InternalSet, InternalVec};

/// A staged finalizer registration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FinStage {
    pub(crate) obj: usize,
}

/// A staged weak-link change. `target` is the object the slot was pointed
/// at, zero when the link was removed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LinkStage {
    pub(crate) slot: usize,
    pub(crate) target: usize,
    pub(crate) track: bool,
}

/// Encode an object address for storage in a weak slot.
#[inline]
pub(crate) const fn hide(addr: usize) -> usize {
    if addr == 0 {
        0
    } else {
        !addr
    }
}

/// Decode a weak slot.
#[inline]
pub(crate) const fn reveal(word: usize) -> Option<usize> {
    if word == 0 {
        None
    } else {
        Some(!word)
    }
}

/// Outcome of the finalization phase.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FinalizeStats {
    pub(crate) queued: usize,
    pub(crate) nulled: usize,
}

pub(crate) struct FinalizeTables {
    young: InternalSet<usize>,
    old: InternalSet<usize>,
    young_links: InternalMap<usize, bool>,
    old_links: InternalMap<usize, bool>,
    /// Objects whose finalizer is due. Scanned as a precise root.
    pub(crate) ready: InternalVec<usize>,
    /// Objects whose finalizer is running. Pinned by every collection.
    pub(crate) finalizing: InternalVec<usize>,
}

impl FinalizeTables {
    pub(crate) fn new() -> Self {
        Self {
            young: set_in(InternalMemType::FinalizeTable),
            old: set_in(InternalMemType::FinalizeTable),
            young_links: map_in(InternalMemType::LinkTable),
            old_links: map_in(InternalMemType::LinkTable),
            ready: vec_in(InternalMemType::ReadyQueue),
            finalizing: vec_in(InternalMemType::ReadyQueue),
        }
    }

    pub(crate) fn add_finalizer(&mut self, obj: usize, nursery: &Nursery) {
        if nursery.contains(obj) {
            self.young.insert(obj);
        } else {
            self.old.insert(obj);
        }
    }

    pub(crate) fn remove_finalizer(&mut self, obj: usize) -> bool {
        self.young.remove(&obj) | self.old.remove(&obj)
    }

    pub(crate) fn num_finalizers(&self) -> usize {
        self.young.len() + self.old.len()
    }

    pub(crate) fn num_links(&self) -> usize {
        self.young_links.len() + self.old_links.len()
    }

    /// Track `slot` as a link to `target`, or forget it when `target` is
    /// zero.
    pub(crate) fn sync_link(
        &mut self,
        slot: usize,
        target: usize,
        track: bool,
        nursery: &Nursery,
    ) {
        self.young_links.remove(&slot);
        self.old_links.remove(&slot);
        if target == 0 {
            return;
        }
        if nursery.contains(target) {
            self.young_links.insert(slot, track);
        } else {
            self.old_links.insert(slot, track);
        }
    }

    /// Run the finalization phase of a collection: null dead short links,
    /// queue dead finalizable objects (keeping them and what they reference
    /// alive) until nothing changes, then fix up tracking links.
    ///
    /// # Safety
    ///
    /// Must run during a collection, after the gray queue has been drained.
    pub(crate) unsafe fn process(&mut self, copier: &mut Copier<'_>) -> FinalizeStats {
        let mut stats = FinalizeStats::default();
        stats.nulled += unsafe { self.process_links(copier, false) };
        loop {
            let queued = unsafe { self.finalize_dead(copier) };
            unsafe { copier.drain_gray() };
            stats.queued += queued;
            if queued == 0 {
                break;
            }
        }
        stats.nulled += unsafe { self.process_links(copier, true) };
        stats
    }

    unsafe fn finalize_dead(&mut self, copier: &mut Copier<'_>) -> usize {
        let mut entries: InternalVec<(usize, bool)> = vec_in(InternalMemType::FinalizeTable);
        entries.extend(self.young.iter().map(|&obj| (obj, true)));
        if copier.mode == Mode::Major {
            entries.extend(self.old.iter().map(|&obj| (obj, false)));
        }

        let mut queued = 0;
        for (obj, young) in entries {
            let table = if young { &mut self.young } else { &mut self.old };
            if unsafe { copier.is_live(obj) } {
                let new = unsafe { copier.current_address(obj) };
                let now_young = copier.nursery.contains(new);
                if new != obj || now_young != young {
                    table.remove(&obj);
                    if now_young {
                        self.young.insert(new);
                    } else {
                        self.old.insert(new);
                    }
                }
            } else {
                table.remove(&obj);
                let new = unsafe { copier.trace(obj) };
                self.ready.push(new);
                queued += 1;
            }
        }
        queued
    }

    unsafe fn process_links(&mut self, copier: &mut Copier<'_>, track: bool) -> usize {
        let mut entries: InternalVec<(usize, bool)> = vec_in(InternalMemType::LinkTable);
        entries.extend(
            self.young_links
                .iter()
                .filter(|&(_, &t)| t == track)
                .map(|(&slot, _)| (slot, true)),
        );
        if copier.mode == Mode::Major {
            entries.extend(
                self.old_links
                    .iter()
                    .filter(|&(_, &t)| t == track)
                    .map(|(&slot, _)| (slot, false)),
            );
        }

        let mut nulled = 0;
        for (slot, young) in entries {
            let table = if young {
                &mut self.young_links
            } else {
                &mut self.old_links
            };
            let ptr = slot as *mut usize;
            let Some(obj) = reveal(unsafe { ptr.read() }) else {
                table.remove(&slot);
                continue;
            };
            if !unsafe { copier.is_live(obj) } {
                unsafe { ptr.write(0) };
                table.remove(&slot);
                nulled += 1;
                continue;
            }
            let new = unsafe { copier.current_address(obj) };
            if new != obj {
                unsafe { ptr.write(hide(new)) };
            }
            let now_young = copier.nursery.contains(new);
            if now_young != young {
                table.remove(&slot);
                if now_young {
                    self.young_links.insert(slot, track);
                } else {
                    self.old_links.insert(slot, track);
                }
            }
        }
        nulled
    }
}
