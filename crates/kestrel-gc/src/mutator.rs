//! Mutator threads: allocation and safepoints.
//!
//! # Allocation paths
//!
//! - **Fast path**: bump the thread's allocation buffer up to its temporary
//!   end. No lock, no atomic read-modify-write.
//! - **Buffer refill**: move the temporary end forward by one scan-start
//!   interval, or lease a new buffer from the nursery fragments under the
//!   collector lock, collecting the nursery when none is left.
//! - **Degraded**: when a collection leaves no usable fragment, allocate
//!   directly in the major heap until a major collection frees the nursery.
//! - **Large**: objects over [`MAX_SMALL_OBJ_SIZE`] get their own mapping.
//! - **Pinned**: small objects that must never move come from size-classed
//!   pages; larger ones go to the large-object space.

use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::collector::{Collector, CollectorInner, GcState, Generation};
use crate::error::{GcError, GcResult};
use crate::gc::stw::ParkOutcome;
use crate::heap::los::LargeObjectSpace;
use crate::heap::major::SECTION_SIZE;
use crate::heap::pinned::{CHUNK_SIZE, MAX_PINNED_OBJECT_SIZE};
use crate::heap::{MAX_SMALL_OBJ_SIZE, SCAN_START_SIZE};
use crate::metrics::GcMetrics;
use crate::object::{ObjRef, ObjectHeader, ObjectType};
use crate::thread::ThreadInfo;

/// A thread registered with a [`Collector`].
///
/// Allocates, runs write barriers and reaches safepoints. Not `Send`: it
/// must be dropped on the thread that created it, which unregisters the
/// thread.
pub struct Mutator {
    pub(crate) inner: Arc<CollectorInner>,
    pub(crate) info: Arc<ThreadInfo>,
    _not_send: PhantomData<*const ()>,
}

impl std::fmt::Debug for Mutator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutator")
            .field("thread", &self.info.id)
            .finish_non_exhaustive()
    }
}

impl Mutator {
    pub(crate) const fn new(inner: Arc<CollectorInner>, info: Arc<ThreadInfo>) -> Self {
        Self {
            inner,
            info,
            _not_send: PhantomData,
        }
    }

    /// Handle to the collector this thread is registered with.
    #[must_use]
    pub fn collector(&self) -> Collector {
        Collector {
            inner: Arc::clone(&self.inner),
        }
    }

    // ========================================================================
    // Safepoints
    // ========================================================================

    /// Stop here if a collection is waiting for this thread.
    #[inline]
    pub fn safepoint(&self) {
        if self.inner.stw.stop_requested() {
            self.park();
        }
    }

    #[cold]
    fn park(&self) {
        while self.inner.stw.park(&self.info) == ParkOutcome::Stepped {}
    }

    /// Enter native code. Collections proceed without waiting for this
    /// thread until [`Mutator::leave_native`]; the thread must not touch the
    /// heap in between.
    pub fn enter_native(&self) {
        self.inner.stw.enter_blocking(&self.info);
    }

    /// Return from native code, waiting for a running collection to finish.
    pub fn leave_native(&self) {
        self.inner.stw.leave_blocking(&self.info);
    }

    /// Collect `generation` from this thread. See [`Collector::collect`].
    pub fn collect(&self, generation: Generation) -> GcMetrics {
        self.collector().collect(generation)
    }

    /// Park like a thread stopped in the middle of the allocation fast path,
    /// if a collection is waiting. Lets tests exercise the collector's
    /// critical-region restart loop.
    #[cfg(any(test, feature = "test-util"))]
    #[doc(hidden)]
    pub fn debug_safepoint_in_critical_region(&self) {
        if !self.inner.stw.stop_requested() {
            return;
        }
        self.info.in_critical_region.store(true, Ordering::Release);
        let outcome = self.inner.stw.park(&self.info);
        self.info.in_critical_region.store(false, Ordering::Release);
        if outcome == ParkOutcome::Stepped {
            self.safepoint();
        }
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocate a zeroed instance of the non-array type `ty`.
    ///
    /// # Errors
    ///
    /// [`GcError::HeapLimitExceeded`] or [`GcError::OutOfMemory`] when the
    /// heap cannot grow.
    pub fn alloc(&self, ty: &'static ObjectType) -> GcResult<ObjRef> {
        self.alloc_with(ty, 0)
    }

    /// Allocate a zeroed array of `length` elements.
    ///
    /// # Errors
    ///
    /// [`GcError::ArrayTooLarge`] if `length` does not fit in 32 bits or the
    /// array's byte size overflows; otherwise see [`Mutator::alloc`].
    pub fn alloc_array(&self, ty: &'static ObjectType, length: usize) -> GcResult<ObjRef> {
        self.alloc_with(ty, length)
    }

    /// Allocate in the large-object space regardless of size. The object
    /// never moves.
    ///
    /// # Errors
    ///
    /// See [`Mutator::alloc_array`].
    pub fn alloc_large(&self, ty: &'static ObjectType, length: usize) -> GcResult<ObjRef> {
        let size = Self::object_size(ty, length)?;
        self.safepoint();
        self.alloc_los(ty, length, size)
    }

    /// Allocate an object that never moves.
    ///
    /// # Errors
    ///
    /// See [`Mutator::alloc_array`].
    pub fn alloc_pinned(&self, ty: &'static ObjectType, length: usize) -> GcResult<ObjRef> {
        let size = Self::object_size(ty, length)?;
        self.safepoint();
        if size > MAX_PINNED_OBJECT_SIZE {
            return self.alloc_los(ty, length, size);
        }
        let me = Some(&*self.info);
        let mut state = self.inner.lock_state(me);
        let mut collected = false;
        loop {
            let GcState {
                pinned, governor, ..
            } = &mut *state;
            match pinned.alloc(size, || governor.try_alloc_space(CHUNK_SIZE)) {
                Ok(Some(addr)) => return Ok(unsafe { Self::init(addr, ty, length) }),
                Ok(None) if !collected => {
                    self.inner.collect_locked(&mut state, me, Generation::Old);
                    collected = true;
                }
                Ok(None) => return Err(Self::limit_error(&state, size)),
                Err(source) => {
                    return Err(GcError::OutOfMemory {
                        requested: size,
                        source,
                    })
                }
            }
        }
    }

    fn object_size(ty: &'static ObjectType, length: usize) -> GcResult<usize> {
        ty.checked_size_for(length).ok_or(GcError::ArrayTooLarge { length })
    }

    fn alloc_with(&self, ty: &'static ObjectType, length: usize) -> GcResult<ObjRef> {
        let size = Self::object_size(ty, length)?;
        self.safepoint();
        if size > MAX_SMALL_OBJ_SIZE {
            return self.alloc_los(ty, length, size);
        }

        let tlab = &self.info.tlab;
        self.info.in_critical_region.store(true, Ordering::Release);
        let next = tlab.next.load(Ordering::Relaxed);
        if next != 0 && next + size <= tlab.temp_end.load(Ordering::Relaxed) {
            // SAFETY: `[next, next + size)` is zeroed nursery memory owned by
            // this thread's buffer.
            let obj = unsafe { Self::init(next, ty, length) };
            tlab.next.store(next + size, Ordering::Release);
            self.info.in_critical_region.store(false, Ordering::Release);
            return Ok(obj);
        }
        self.info.in_critical_region.store(false, Ordering::Release);
        self.alloc_slow(ty, length, size)
    }

    /// Write the header of a fresh object.
    ///
    /// # Safety
    ///
    /// `addr` must start `ty.size_for(length)` zeroed bytes reserved for it.
    unsafe fn init(addr: usize, ty: &'static ObjectType, length: usize) -> ObjRef {
        unsafe { ObjectHeader::init(addr, ty, length) };
        // Heap addresses are never null.
        ObjRef::from_addr(addr).unwrap_or_else(|| unreachable!())
    }

    #[cold]
    fn alloc_slow(&self, ty: &'static ObjectType, length: usize, size: usize) -> GcResult<ObjRef> {
        let tlab = &self.info.tlab;
        let nursery = &self.inner.nursery;

        let next = tlab.next.load(Ordering::Relaxed);
        let real_end = tlab.real_end.load(Ordering::Relaxed);
        if next != 0 && next + size <= real_end {
            nursery.record_scan_start(next);
            tlab.temp_end
                .store(real_end.min(next + SCAN_START_SIZE), Ordering::Relaxed);
            let obj = unsafe { Self::init(next, ty, length) };
            tlab.next.store(next + size, Ordering::Release);
            return Ok(obj);
        }

        let me = Some(&*self.info);
        let mut state = self.inner.lock_state(me);
        let tlab_size = self.inner.config.tlab_size;
        let mut collected = false;
        loop {
            if state.degraded.active {
                return self.alloc_degraded(&mut state, ty, length, size);
            }
            if size > tlab_size {
                if let Some(frag) = state.fragments.alloc_range(size, size) {
                    nursery.record_scan_start(frag.start);
                    return Ok(unsafe { Self::init(frag.start, ty, length) });
                }
            } else if let Some(frag) = state.fragments.alloc_range(tlab_size, size) {
                nursery.record_scan_start(frag.start);
                tlab.install(
                    frag.start,
                    frag.end,
                    frag.end.min(frag.start + SCAN_START_SIZE),
                );
                let obj = unsafe { Self::init(frag.start, ty, length) };
                tlab.next.store(frag.start + size, Ordering::Release);
                return Ok(obj);
            }
            if collected {
                #[cfg(feature = "tracing")]
                tracing::warn!(size, "nursery exhausted after collection, entering degraded mode");
                state.degraded.active = true;
                continue;
            }
            self.inner
                .collect_locked(&mut state, me, Generation::Nursery);
            collected = true;
        }
    }

    fn alloc_degraded(
        &self,
        state: &mut GcState,
        ty: &'static ObjectType,
        length: usize,
        size: usize,
    ) -> GcResult<ObjRef> {
        let me = Some(&*self.info);
        if state.degraded.bytes >= SECTION_SIZE {
            self.inner.collect_locked(state, me, Generation::Old);
            if !state.degraded.active {
                if let Some(frag) = state.fragments.alloc_range(size, size) {
                    self.inner.nursery.record_scan_start(frag.start);
                    return Ok(unsafe { Self::init(frag.start, ty, length) });
                }
            }
        }
        let mut collected = false;
        loop {
            let GcState {
                major, governor, ..
            } = &mut *state;
            match major.alloc(size, || governor.alloc_section(false)) {
                Ok(Some(addr)) => {
                    state.degraded.bytes += size;
                    return Ok(unsafe { Self::init(addr, ty, length) });
                }
                Ok(None) if !collected => {
                    self.inner.collect_locked(state, me, Generation::Old);
                    collected = true;
                }
                Ok(None) => return Err(Self::limit_error(state, size)),
                Err(source) => {
                    return Err(GcError::OutOfMemory {
                        requested: size,
                        source,
                    })
                }
            }
        }
    }

    fn alloc_los(&self, ty: &'static ObjectType, length: usize, size: usize) -> GcResult<ObjRef> {
        let footprint = LargeObjectSpace::footprint(size);
        let me = Some(&*self.info);
        let mut state = self.inner.lock_state(me);

        let mut collected = false;
        if state
            .governor
            .need_major_collection(footprint, state.los.memory_usage())
        {
            self.inner.collect_locked(&mut state, me, Generation::Old);
            collected = true;
        }
        if !state.governor.try_alloc_space(footprint) {
            if collected {
                return Err(Self::limit_error(&state, size));
            }
            self.inner.collect_locked(&mut state, me, Generation::Old);
            if !state.governor.try_alloc_space(footprint) {
                return Err(Self::limit_error(&state, size));
            }
        }
        match state.los.alloc(size) {
            Ok(addr) => {
                #[cfg(feature = "tracing")]
                tracing::trace!(size, addr, "large object allocated");
                Ok(unsafe { Self::init(addr, ty, length) })
            }
            Err(source) => {
                state.governor.release_space(footprint);
                Err(GcError::OutOfMemory {
                    requested: size,
                    source,
                })
            }
        }
    }

    fn limit_error(state: &GcState, size: usize) -> GcError {
        GcError::HeapLimitExceeded {
            requested: size,
            limit: state.governor.max_heap_size(),
        }
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        let mut state = self.inner.lock_state(Some(&*self.info));
        self.info.tlab.retire();
        // SAFETY: this is the owning thread and it holds the collector lock.
        let remset = unsafe { self.info.remset_mut() };
        remset.flush_store_buffer();
        state.freed_remset.append(&mut remset.log);
        remset.clear();
        self.inner.unregister_thread(&self.info);
    }
}
