//! Finalizers and disappearing links.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use kestrel_gc::{Collector, GcConfig, Generation, ObjRef, ObjectType, RootDescriptor, Runtime};

fn resource() -> &'static ObjectType {
    static TYPE: OnceLock<&'static ObjectType> = OnceLock::new();
    TYPE.get_or_init(|| ObjectType::object("Resource", 32, &[2]))
}

/// Records the payload of every finalized object. Can re-root an object
/// from its finalizer.
#[derive(Default)]
struct Finalizers {
    ran: Mutex<Vec<usize>>,
    resurrect_into: AtomicUsize,
}

impl Finalizers {
    fn ran(&self) -> Vec<usize> {
        self.ran.lock().unwrap().clone()
    }
}

impl Runtime for Finalizers {
    fn run_finalizer(&self, obj: ObjRef) {
        self.ran.lock().unwrap().push(unsafe { obj.read_word(3) });
        let slot = self.resurrect_into.swap(0, Ordering::AcqRel);
        if slot != 0 {
            unsafe { (slot as *mut usize).write(obj.addr()) };
        }
    }
}

fn setup() -> (Arc<Finalizers>, Collector) {
    let runtime = Arc::new(Finalizers::default());
    let collector = Collector::with_runtime(
        GcConfig::default().with_scan_thread_stacks(false),
        runtime.clone(),
    )
    .unwrap();
    (runtime, collector)
}

#[test]
fn unreachable_object_is_finalized_once() {
    let (runtime, collector) = setup();
    let mutator = collector.register_thread();
    let obj = mutator.alloc(resource()).unwrap();
    unsafe {
        obj.write_word(3, 17);
        collector.register_finalizer(obj, true);
    }

    let metrics = mutator.collect(Generation::Nursery);
    assert_eq!(metrics.finalizers_queued, 1);
    assert_eq!(runtime.ran(), vec![17]);
    assert_eq!(collector.pending_finalizers(), 0);

    mutator.collect(Generation::Nursery);
    mutator.collect(Generation::Old);
    assert_eq!(runtime.ran(), vec![17]);
}

#[test]
fn reachable_object_is_not_finalized() {
    let (runtime, collector) = setup();
    let mutator = collector.register_thread();
    let mut roots = Box::new([0usize; 1]);
    unsafe { collector.register_root(roots.as_mut_ptr(), 1, RootDescriptor::all_refs(1)) };

    let obj = mutator.alloc(resource()).unwrap();
    unsafe {
        obj.write_word(3, 5);
        collector.register_finalizer(obj, true);
        mutator.write_barrier(&mut roots[0], Some(obj));
    }
    mutator.collect(Generation::Nursery);
    mutator.collect(Generation::Old);
    assert!(runtime.ran().is_empty());

    // The registration followed the object into the old generation.
    roots[0] = 0;
    mutator.collect(Generation::Nursery);
    assert!(runtime.ran().is_empty());
    mutator.collect(Generation::Old);
    assert_eq!(runtime.ran(), vec![5]);

    collector.unregister_root(roots.as_mut_ptr());
}

#[test]
fn deregistered_finalizer_does_not_run() {
    let (runtime, collector) = setup();
    let mutator = collector.register_thread();
    let obj = mutator.alloc(resource()).unwrap();
    unsafe {
        collector.register_finalizer(obj, true);
        collector.register_finalizer(obj, false);
    }
    let metrics = mutator.collect(Generation::Nursery);
    assert_eq!(metrics.finalizers_queued, 0);
    assert!(runtime.ran().is_empty());
}

#[test]
fn finalizable_object_keeps_its_referents() {
    let (runtime, collector) = setup();
    let mutator = collector.register_thread();
    let owner = mutator.alloc(resource()).unwrap();
    let part = mutator.alloc(resource()).unwrap();
    unsafe {
        owner.write_word(3, 1);
        part.write_word(3, 2);
        mutator.set_ref(owner, 2, Some(part));
        collector.register_finalizer(owner, true);
        collector.register_finalizer(part, true);
    }

    // Both are queued in the same collection; the part survives until the
    // owner's finalizer has run.
    let metrics = mutator.collect(Generation::Nursery);
    assert_eq!(metrics.finalizers_queued, 2);
    let mut ran = runtime.ran();
    ran.sort_unstable();
    assert_eq!(ran, vec![1, 2]);
}

#[test]
fn resurrected_object_survives_until_unreachable_again() {
    let (runtime, collector) = setup();
    let mutator = collector.register_thread();
    let mut roots = Box::new([0usize; 1]);
    let mut link = Box::new(0usize);
    unsafe { collector.register_root(roots.as_mut_ptr(), 1, RootDescriptor::all_refs(1)) };

    let obj = mutator.alloc(resource()).unwrap();
    unsafe {
        obj.write_word(3, 8);
        collector.register_finalizer(obj, true);
        collector.register_weak_link(&mut *link, Some(obj), true);
    }
    runtime
        .resurrect_into
        .store(roots.as_mut_ptr() as usize, Ordering::Release);

    mutator.collect(Generation::Nursery);
    assert_eq!(runtime.ran(), vec![8]);
    let revived = ObjRef::from_addr(roots[0]).unwrap();
    assert_eq!(unsafe { collector.weak_link_get(&*link) }, Some(revived));

    mutator.collect(Generation::Old);
    let revived = ObjRef::from_addr(roots[0]).unwrap();
    assert_eq!(unsafe { revived.read_word(3) }, 8);
    assert_eq!(unsafe { collector.weak_link_get(&*link) }, Some(revived));

    roots[0] = 0;
    mutator.collect(Generation::Old);
    assert_eq!(unsafe { collector.weak_link_get(&*link) }, None);
    assert_eq!(runtime.ran(), vec![8]);

    unsafe { collector.weak_link_remove(&mut *link) };
    collector.unregister_root(roots.as_mut_ptr());
}

#[test]
fn short_link_is_nulled_before_finalization() {
    let (runtime, collector) = setup();
    let mutator = collector.register_thread();
    let mut short = Box::new(0usize);
    let mut tracking = Box::new(0usize);

    let obj = mutator.alloc(resource()).unwrap();
    unsafe {
        collector.register_finalizer(obj, true);
        collector.register_weak_link(&mut *short, Some(obj), false);
        collector.register_weak_link(&mut *tracking, Some(obj), true);
    }

    let metrics = mutator.collect(Generation::Nursery);
    assert_eq!(metrics.weak_links_nulled, 1);
    assert_eq!(runtime.ran().len(), 1);
    assert_eq!(unsafe { collector.weak_link_get(&*short) }, None);
    let queued = unsafe { collector.weak_link_get(&*tracking) }.unwrap();
    assert!(!collector.is_young(queued));

    // Nothing holds it after the finalizer ran.
    mutator.collect(Generation::Old);
    assert_eq!(unsafe { collector.weak_link_get(&*tracking) }, None);

    unsafe {
        collector.weak_link_remove(&mut *short);
        collector.weak_link_remove(&mut *tracking);
    }
}

#[test]
fn weak_link_follows_moves_and_nulls_on_death() {
    let (_runtime, collector) = setup();
    let mutator = collector.register_thread();
    let mut roots = Box::new([0usize; 1]);
    let mut link = Box::new(0usize);
    unsafe { collector.register_root(roots.as_mut_ptr(), 1, RootDescriptor::all_refs(1)) };

    let obj = mutator.alloc(resource()).unwrap();
    unsafe {
        collector.register_weak_link(&mut *link, Some(obj), false);
        mutator.write_barrier(&mut roots[0], Some(obj));
    }
    // Hidden: the raw slot is not the address.
    assert_ne!(*link, obj.addr());
    assert_eq!(unsafe { collector.weak_link_get(&*link) }, Some(obj));

    mutator.collect(Generation::Nursery);
    let moved = ObjRef::from_addr(roots[0]).unwrap();
    assert_ne!(moved, obj);
    assert_eq!(unsafe { collector.weak_link_get(&*link) }, Some(moved));

    mutator.collect(Generation::Old);
    let moved = ObjRef::from_addr(roots[0]).unwrap();
    assert_eq!(unsafe { collector.weak_link_get(&*link) }, Some(moved));

    roots[0] = 0;
    let metrics = mutator.collect(Generation::Old);
    assert_eq!(metrics.weak_links_nulled, 1);
    assert_eq!(unsafe { collector.weak_link_get(&*link) }, None);

    unsafe { collector.weak_link_remove(&mut *link) };
    collector.unregister_root(roots.as_mut_ptr());
}

#[test]
fn removed_weak_link_is_left_alone() {
    let (_runtime, collector) = setup();
    let mutator = collector.register_thread();
    let mut link = Box::new(0usize);
    let obj = mutator.alloc(resource()).unwrap();
    unsafe {
        collector.register_weak_link(&mut *link, Some(obj), false);
        collector.weak_link_remove(&mut *link);
    }
    assert_eq!(unsafe { collector.weak_link_get(&*link) }, None);

    // The slot now holds unrelated data the collector must not touch.
    *link = 0x1234;
    let metrics = mutator.collect(Generation::Nursery);
    assert_eq!(metrics.weak_links_nulled, 0);
    assert_eq!(*link, 0x1234);
}

#[test]
fn finalizers_do_not_run_recursively() {
    struct Nested {
        collector: OnceLock<Collector>,
        depth: AtomicUsize,
        nested_ran: AtomicUsize,
    }

    impl Runtime for Nested {
        fn run_finalizer(&self, _obj: ObjRef) {
            self.depth.fetch_add(1, Ordering::Relaxed);
            if let Some(collector) = self.collector.get() {
                let ran = collector.run_pending_finalizers();
                self.nested_ran.fetch_add(ran, Ordering::Relaxed);
            }
        }
    }

    let runtime = Arc::new(Nested {
        collector: OnceLock::new(),
        depth: AtomicUsize::new(0),
        nested_ran: AtomicUsize::new(0),
    });
    let collector = Collector::with_runtime(
        GcConfig::default().with_scan_thread_stacks(false),
        runtime.clone(),
    )
    .unwrap();
    let _ = runtime.collector.set(collector.clone());
    let mutator = collector.register_thread();
    for _ in 0..3 {
        let obj = mutator.alloc(resource()).unwrap();
        unsafe { collector.register_finalizer(obj, true) };
    }

    mutator.collect(Generation::Nursery);
    assert_eq!(runtime.depth.load(Ordering::Relaxed), 3);
    assert_eq!(runtime.nested_ran.load(Ordering::Relaxed), 0);
}
