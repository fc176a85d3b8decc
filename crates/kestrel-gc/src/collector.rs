//! The collector instance: shared state, runtime hooks and collection entry
//! points.
//!
//! All mutable heap metadata lives in one [`GcState`] behind the collector
//! lock. Mutators take the lock on allocation slow paths; a collection holds
//! it for its whole duration, with every other mutator stopped.
//!
//! Lock order: collector lock, then the thread registry.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};

use crate::config::GcConfig;
use crate::descriptor::RootDescriptor;
use crate::error::GcResult;
use crate::finalize::{hide, reveal, FinStage, FinalizeTables, LinkStage};
use crate::gc::gray::GrayQueue;
use crate::gc::stw::StopTheWorld;
use crate::gc::{major, minor, CollectionContext};
use crate::governor::Governor;
use crate::heap::los::LargeObjectSpace;
use crate::heap::major::{MajorHeap, SECTION_SIZE};
use crate::heap::nursery::{Nursery, NurseryFragments};
use crate::heap::pinned::PinnedSpace;
use crate::internal::{vec_in, InternalMemType, InternalVec};
use crate::metrics::GcMetrics;
use crate::mutator::Mutator;
use crate::object::ObjRef;
use crate::remset::RemsetLog;
use crate::roots::RootRegistry;
use crate::staging::{StagingArray, STAGE_ENTRIES};
use crate::thread::ThreadInfo;

// ============================================================================
// Runtime hooks
// ============================================================================

/// Hooks into the language runtime that embeds the collector.
///
/// Every method has a no-op default. Hooks are called while the world is
/// stopped (except [`Runtime::run_finalizer`]) and must not allocate or
/// take locks a stopped mutator could hold.
pub trait Runtime: Send + Sync {
    /// Report precise roots: `visit` receives the address of each slot
    /// holding an object reference (or null), which the collector updates in
    /// place when the object moves.
    fn enumerate_roots(&self, visit: &mut dyn FnMut(*mut usize)) {
        let _ = visit;
    }

    /// Report memory to scan conservatively as `(start, len)` ranges, for
    /// stacks the collector does not know about.
    fn enumerate_thread_stacks(&self, visit: &mut dyn FnMut(usize, usize)) {
        let _ = visit;
    }

    /// Called when a surviving object is copied.
    fn on_object_moved(&self, old: ObjRef, new: ObjRef) {
        let _ = (old, new);
    }

    /// Run the finalizer of an unreachable object registered with
    /// [`Collector::register_finalizer`]. Called once per object, with the
    /// world running and the object pinned.
    fn run_finalizer(&self, obj: ObjRef) {
        let _ = obj;
    }
}

/// A [`Runtime`] that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRuntime;

impl Runtime for NoopRuntime {}

/// Which part of the heap a collection covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    /// Minor collection: evacuate the nursery.
    Nursery,
    /// Major collection: the whole heap.
    Old,
}

// ============================================================================
// Collector state
// ============================================================================

/// Allocation directly into the major heap after the nursery ran out of
/// usable fragments.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Degraded {
    pub(crate) active: bool,
    /// Bytes allocated in degraded mode since the last major collection.
    pub(crate) bytes: usize,
}

pub(crate) struct GcState {
    pub(crate) fragments: NurseryFragments,
    pub(crate) degraded: Degraded,
    pub(crate) major: MajorHeap,
    pub(crate) los: LargeObjectSpace,
    pub(crate) pinned: PinnedSpace,
    pub(crate) roots: RootRegistry,
    /// Entries that survived a minor collection (slots still pointing at
    /// pinned nursery objects).
    pub(crate) global_remset: RemsetLog,
    /// Remembered sets of threads that exited.
    pub(crate) freed_remset: RemsetLog,
    pub(crate) fin: FinalizeTables,
    pub(crate) governor: Governor,
    pub(crate) gray: GrayQueue,
    pub(crate) pin_queue: InternalVec<usize>,
}

impl GcState {
    fn new(config: &GcConfig, nursery: &Nursery) -> Self {
        let mut fragments = NurseryFragments::new();
        fragments.reset_to(nursery);
        Self {
            fragments,
            degraded: Degraded::default(),
            major: MajorHeap::new(),
            los: LargeObjectSpace::new(),
            pinned: PinnedSpace::new(),
            roots: RootRegistry::new(),
            global_remset: RemsetLog::new(),
            freed_remset: RemsetLog::new(),
            fin: FinalizeTables::new(),
            governor: Governor::new(config),
            gray: GrayQueue::new(),
            pin_queue: vec_in(InternalMemType::PinQueue),
        }
    }
}

pub(crate) struct CollectorInner {
    pub(crate) config: GcConfig,
    pub(crate) runtime: Arc<dyn Runtime>,
    pub(crate) nursery: Nursery,
    pub(crate) state: Mutex<GcState>,
    pub(crate) threads: Mutex<Vec<Arc<ThreadInfo>>>,
    pub(crate) stw: StopTheWorld,
    fin_stage: StagingArray<FinStage, STAGE_ENTRIES>,
    link_stage: StagingArray<LinkStage, STAGE_ENTRIES>,
    next_thread_id: AtomicU64,
    minor_count: AtomicUsize,
    major_count: AtomicUsize,
    last_metrics: Mutex<GcMetrics>,
}

thread_local! {
    /// Threads registered with a collector, keyed by the collector's address.
    static REGISTERED: RefCell<Vec<(usize, Arc<ThreadInfo>)>> = const { RefCell::new(Vec::new()) };
    static IN_FINALIZER: Cell<bool> = const { Cell::new(false) };
}

impl CollectorInner {
    fn key(&self) -> usize {
        std::ptr::from_ref(self) as usize
    }

    /// The calling thread's state, if it is registered with this collector.
    pub(crate) fn current_thread(&self) -> Option<Arc<ThreadInfo>> {
        let key = self.key();
        REGISTERED.with_borrow(|list| {
            list.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, info)| Arc::clone(info))
        })
    }

    /// Take the collector lock. A registered thread waits in the blocking
    /// state so a collection in progress can proceed without it.
    pub(crate) fn lock_state(&self, me: Option<&ThreadInfo>) -> MutexGuard<'_, GcState> {
        if let Some(guard) = self.state.try_lock() {
            return guard;
        }
        let Some(me) = me else {
            return self.state.lock();
        };
        self.stw.enter_blocking(me);
        let guard = self.state.lock();
        self.stw.leave_blocking(me);
        guard
    }

    pub(crate) fn register_current_thread(self: &Arc<Self>) -> Arc<ThreadInfo> {
        let key = self.key();
        assert!(
            self.current_thread().is_none(),
            "thread is already registered with this collector"
        );
        let id = self.next_thread_id.fetch_add(1, Ordering::Relaxed);
        let info = Arc::new(ThreadInfo::current(id));
        {
            let _state = self.lock_state(None);
            self.threads.lock().push(Arc::clone(&info));
        }
        REGISTERED.with_borrow_mut(|list| list.push((key, Arc::clone(&info))));
        #[cfg(feature = "tracing")]
        tracing::debug!(thread = id, "mutator registered");
        info
    }

    /// Unregister `info`. The caller holds the collector lock and has already
    /// merged the thread's remembered set.
    pub(crate) fn unregister_thread(&self, info: &Arc<ThreadInfo>) {
        self.threads.lock().retain(|t| !Arc::ptr_eq(t, info));
        let key = self.key();
        // The thread-local may already be gone during thread teardown.
        let _ = REGISTERED.try_with(|list| {
            list.borrow_mut()
                .retain(|(k, t)| !(*k == key && Arc::ptr_eq(t, info)));
        });
        #[cfg(feature = "tracing")]
        tracing::debug!(thread = info.id, "mutator exited");
    }

    /// Apply staged finalizer and weak-link registrations.
    pub(crate) fn drain_staging(&self, state: &mut GcState) {
        let nursery = &self.nursery;
        let fin = &mut state.fin;
        self.fin_stage.drain(|entry| fin.add_finalizer(entry.obj, nursery));
        self.link_stage
            .drain(|entry| fin.sync_link(entry.slot, entry.target, entry.track, nursery));
    }

    /// Run a collection of `generation` with the collector lock held.
    ///
    /// `me` is the calling thread if it is a registered mutator.
    pub(crate) fn collect_locked(
        &self,
        state: &mut GcState,
        me: Option<&ThreadInfo>,
        generation: Generation,
    ) -> GcMetrics {
        let start = Instant::now();
        let threads = self.threads.lock().clone();
        if let Some(me) = me {
            me.record_context();
        }
        let (epoch, restarts) = self.stw.stop_world(&threads, me);
        self.drain_staging(state);

        let ctx = CollectionContext {
            config: &self.config,
            nursery: &self.nursery,
            runtime: &*self.runtime,
            threads: &threads,
        };
        let mut metrics = match generation {
            Generation::Nursery => {
                let mut metrics = minor::collect(&ctx, state);
                self.minor_count.fetch_add(1, Ordering::Relaxed);
                if state
                    .governor
                    .need_major_collection(0, state.los.memory_usage())
                {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("minor collection escalating to major");
                    let nested = major::collect(&ctx, state);
                    self.major_count.fetch_add(1, Ordering::Relaxed);
                    metrics.absorb(&nested);
                }
                metrics
            }
            Generation::Old => {
                let metrics = major::collect(&ctx, state);
                self.major_count.fetch_add(1, Ordering::Relaxed);
                metrics
            }
        };
        metrics.critical_region_restarts = restarts;

        self.stw.restart_world(&threads, epoch);
        metrics.duration = start.elapsed();
        *self.last_metrics.lock() = metrics;
        metrics
    }

    pub(crate) fn stage_finalizer(&self, obj: usize) {
        if self.fin_stage.try_add(FinStage { obj }) {
            return;
        }
        let me = self.current_thread();
        let mut state = self.lock_state(me.as_deref());
        self.drain_staging(&mut state);
        state.fin.add_finalizer(obj, &self.nursery);
    }

    pub(crate) fn stage_link(&self, slot: usize, target: usize, track: bool) {
        if self.link_stage.try_add(LinkStage { slot, target, track }) {
            return;
        }
        let me = self.current_thread();
        let mut state = self.lock_state(me.as_deref());
        self.drain_staging(&mut state);
        state.fin.sync_link(slot, target, track, &self.nursery);
    }
}

// ============================================================================
// Collector handle
// ============================================================================

/// A generational collector instance.
///
/// Cheap to clone; every clone refers to the same heap.
///
/// # Example
///
/// ```
/// use kestrel_gc::{Collector, GcConfig, Generation, ObjectType};
///
/// let collector = Collector::new(GcConfig::default().with_scan_thread_stacks(false)).unwrap();
/// let mutator = collector.register_thread();
/// let pair = ObjectType::object("Pair", 32, &[2, 3]);
/// let obj = mutator.alloc(pair).unwrap();
/// assert_eq!(unsafe { obj.read_ref(2) }, None);
/// mutator.collect(Generation::Nursery);
/// ```
#[derive(Clone)]
pub struct Collector {
    pub(crate) inner: Arc<CollectorInner>,
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("config", &self.inner.config)
            .field("threads", &self.inner.threads.lock().len())
            .finish_non_exhaustive()
    }
}

impl Collector {
    /// Create a collector with no runtime hooks.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::InvalidConfig`](crate::GcError::InvalidConfig) if
    /// the configuration is invalid, or
    /// [`GcError::OutOfMemory`](crate::GcError::OutOfMemory) if the nursery
    /// cannot be mapped.
    pub fn new(config: GcConfig) -> GcResult<Self> {
        Self::with_runtime(config, Arc::new(NoopRuntime))
    }

    /// Create a collector that reports to `runtime`.
    ///
    /// # Errors
    ///
    /// See [`Collector::new`].
    pub fn with_runtime(config: GcConfig, runtime: Arc<dyn Runtime>) -> GcResult<Self> {
        config.validate()?;
        let nursery = Nursery::new(config.nursery_size)?;
        let state = GcState::new(&config, &nursery);
        Ok(Self {
            inner: Arc::new(CollectorInner {
                config,
                runtime,
                nursery,
                state: Mutex::new(state),
                threads: Mutex::new(Vec::new()),
                stw: StopTheWorld::new(),
                fin_stage: StagingArray::new(),
                link_stage: StagingArray::new(),
                next_thread_id: AtomicU64::new(1),
                minor_count: AtomicUsize::new(0),
                major_count: AtomicUsize::new(0),
                last_metrics: Mutex::new(GcMetrics::new()),
            }),
        })
    }

    /// The configuration this collector was created with.
    #[must_use]
    pub fn config(&self) -> &GcConfig {
        &self.inner.config
    }

    /// Register the calling thread as a mutator.
    ///
    /// # Panics
    ///
    /// Panics if the thread is already registered with this collector.
    #[must_use]
    pub fn register_thread(&self) -> Mutator {
        let info = self.inner.register_current_thread();
        Mutator::new(Arc::clone(&self.inner), info)
    }

    /// Collect `generation` now, then run pending finalizers.
    ///
    /// A minor collection escalates to a major one when the governor's
    /// allowance is used up.
    pub fn collect(&self, generation: Generation) -> GcMetrics {
        let me = self.inner.current_thread();
        let metrics = {
            let mut state = self.inner.lock_state(me.as_deref());
            self.inner.collect_locked(&mut state, me.as_deref(), generation)
        };
        self.run_pending_finalizers();
        metrics
    }

    /// Run the finalizers of objects found unreachable by past collections.
    /// Returns how many ran. Nested calls from inside a finalizer do nothing.
    pub fn run_pending_finalizers(&self) -> usize {
        if IN_FINALIZER.get() {
            return 0;
        }
        let me = self.inner.current_thread();
        let batch = {
            let mut state = self.inner.lock_state(me.as_deref());
            let fin = &mut state.fin;
            let batch = std::mem::replace(&mut fin.ready, vec_in(InternalMemType::ReadyQueue));
            fin.finalizing.extend(batch.iter().copied());
            batch
        };
        if batch.is_empty() {
            return 0;
        }

        let _guard = FinalizerGuard::enter();
        for &obj in &batch {
            if let Some(obj) = ObjRef::from_addr(obj) {
                self.inner.runtime.run_finalizer(obj);
            }
            let mut state = self.inner.lock_state(me.as_deref());
            let finalizing = &mut state.fin.finalizing;
            if let Some(i) = finalizing.iter().position(|&o| o == obj) {
                finalizing.swap_remove(i);
            }
        }
        batch.len()
    }

    /// Number of objects waiting for their finalizer to run.
    #[must_use]
    pub fn pending_finalizers(&self) -> usize {
        let me = self.inner.current_thread();
        self.inner.lock_state(me.as_deref()).fin.ready.len()
    }

    /// Register `[start, start + words)` as a root range.
    ///
    /// Precise descriptors make the collector update the slots in place when
    /// objects move; [`RootDescriptor::Conservative`] pins whatever the range
    /// appears to reference. Registering the same start again replaces the
    /// range.
    ///
    /// # Safety
    ///
    /// The range must stay readable and writable, and must hold only null or
    /// valid object references in precise slots, until it is unregistered.
    pub unsafe fn register_root(&self, start: *mut usize, words: usize, desc: RootDescriptor) {
        let me = self.inner.current_thread();
        self.inner
            .lock_state(me.as_deref())
            .roots
            .register(start as usize, words, desc);
    }

    /// Remove the root range starting at `start`. Returns `false` if no range
    /// starts there.
    pub fn unregister_root(&self, start: *mut usize) -> bool {
        let me = self.inner.current_thread();
        self.inner
            .lock_state(me.as_deref())
            .roots
            .unregister(start as usize)
    }

    /// Register (`enable == true`) or deregister a finalizer for `obj`.
    ///
    /// Registration goes through a lock-free staging array and is applied
    /// at the next collection. The finalizer runs through
    /// [`Runtime::run_finalizer`] at most once, after the object becomes
    /// unreachable.
    ///
    /// # Safety
    ///
    /// `obj` must be an object allocated by this collector, and it must still
    /// be at that address (no collection since it was obtained).
    pub unsafe fn register_finalizer(&self, obj: ObjRef, enable: bool) {
        if enable {
            self.inner.stage_finalizer(obj.addr());
            return;
        }
        let me = self.inner.current_thread();
        let mut state = self.inner.lock_state(me.as_deref());
        self.inner.drain_staging(&mut state);
        state.fin.remove_finalizer(obj.addr());
    }

    /// Turn `slot` into a disappearing link to `target`.
    ///
    /// The slot holds a hidden pointer: read it with
    /// [`Collector::weak_link_get`]. A collection nulls it when `target` dies
    /// and rewrites it when `target` moves. With `track_resurrection`, the
    /// link survives while the target is only reachable from the
    /// finalization queue.
    ///
    /// # Safety
    ///
    /// `slot` must stay valid and outside any movable heap object until
    /// [`Collector::weak_link_remove`] is called; `target` as for
    /// [`Collector::register_finalizer`].
    pub unsafe fn register_weak_link(
        &self,
        slot: *mut usize,
        target: Option<ObjRef>,
        track_resurrection: bool,
    ) {
        let target = target.map_or(0, ObjRef::addr);
        unsafe { slot.write(hide(target)) };
        self.inner.stage_link(slot as usize, target, track_resurrection);
    }

    /// Current target of a disappearing link.
    ///
    /// # Safety
    ///
    /// `slot` must be a link registered with this collector.
    #[must_use]
    pub unsafe fn weak_link_get(&self, slot: *const usize) -> Option<ObjRef> {
        reveal(unsafe { slot.read() }).and_then(ObjRef::from_addr)
    }

    /// Clear a disappearing link and stop tracking it. Takes effect
    /// immediately, after any registration still staged for the slot.
    ///
    /// # Safety
    ///
    /// `slot` must be a link registered with this collector.
    pub unsafe fn weak_link_remove(&self, slot: *mut usize) {
        unsafe { slot.write(0) };
        let me = self.inner.current_thread();
        let mut state = self.inner.lock_state(me.as_deref());
        self.inner.drain_staging(&mut state);
        state.fin.sync_link(slot as usize, 0, false, &self.inner.nursery);
    }

    /// Report `bytes` of memory held outside the heap on behalf of heap
    /// objects (negative to release). Brings the next major collection
    /// closer.
    pub fn add_memory_pressure(&self, bytes: i64) {
        let me = self.inner.current_thread();
        self.inner
            .lock_state(me.as_deref())
            .governor
            .add_memory_pressure(bytes);
    }

    /// Bytes mapped for the heap: nursery, sections, large objects and
    /// pinned pages.
    #[must_use]
    pub fn heap_size(&self) -> usize {
        let me = self.inner.current_thread();
        let state = self.inner.lock_state(me.as_deref());
        self.inner.nursery.size()
            + state.major.num_sections() * SECTION_SIZE
            + state.los.memory_usage()
            + state.pinned.mapped_bytes()
    }

    /// Bytes occupied by objects that are live or not yet reclaimed. The
    /// unused tails of allocation buffers still held by threads are not
    /// counted.
    #[must_use]
    pub fn used_size(&self) -> usize {
        let me = self.inner.current_thread();
        let state = self.inner.lock_state(me.as_deref());
        let buffered: usize = self
            .inner
            .threads
            .lock()
            .iter()
            .map(|t| t.tlab.unused_bytes())
            .sum();
        self.inner.nursery.size() - state.fragments.free_bytes() - buffered
            + state.major.used_bytes()
            + state.los.memory_usage()
            + state.pinned.used_bytes()
    }

    /// Metrics of the most recent collection.
    #[must_use]
    pub fn last_metrics(&self) -> GcMetrics {
        *self.inner.last_metrics.lock()
    }

    /// Number of collections of `generation` so far. Escalated minor
    /// collections count once for each generation.
    #[must_use]
    pub fn collection_count(&self, generation: Generation) -> usize {
        match generation {
            Generation::Nursery => self.inner.minor_count.load(Ordering::Relaxed),
            Generation::Old => self.inner.major_count.load(Ordering::Relaxed),
        }
    }

    /// `true` while allocation bypasses the nursery because pinning left it
    /// without usable fragments.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        let me = self.inner.current_thread();
        self.inner.lock_state(me.as_deref()).degraded.active
    }

    /// `true` if `obj` lies in the nursery.
    #[must_use]
    pub fn is_young(&self, obj: ObjRef) -> bool {
        self.inner.nursery.contains(obj.addr())
    }
}

struct FinalizerGuard;

impl FinalizerGuard {
    fn enter() -> Self {
        IN_FINALIZER.set(true);
        Self
    }
}

impl Drop for FinalizerGuard {
    fn drop(&mut self) {
        IN_FINALIZER.set(false);
    }
}
