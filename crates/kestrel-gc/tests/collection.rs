//! Reachability across minor and major collections.
//!
//! Stack scanning is disabled so only the registered roots keep objects
//! alive and every survivor moves.

use std::sync::OnceLock;

use kestrel_gc::{
    CollectionType, Collector, GcConfig, Generation, Mutator, ObjRef, ObjectType, RootDescriptor,
};

/// `[header, next, payload, payload]`
fn node() -> &'static ObjectType {
    static TYPE: OnceLock<&'static ObjectType> = OnceLock::new();
    TYPE.get_or_init(|| ObjectType::object("Node", 32, &[2]))
}

fn precise_collector() -> Collector {
    Collector::new(GcConfig::default().with_scan_thread_stacks(false)).unwrap()
}

/// Push `count` nodes onto the list rooted at `root`; node `i` carries `i`
/// and `i * 3`.
unsafe fn push_nodes(mutator: &Mutator, root: *mut usize, count: usize) {
    for i in 0..count {
        let node = mutator.alloc(node()).unwrap();
        let head = ObjRef::from_addr(unsafe { root.read() });
        unsafe {
            mutator.set_ref(node, 2, head);
            node.write_word(3, i);
            mutator.write_barrier(root, Some(node));
        }
    }
}

/// Payloads from head to tail, checking the second payload word on the way.
fn payloads(head: usize) -> Vec<usize> {
    let mut out = Vec::new();
    let mut cursor = ObjRef::from_addr(head);
    while let Some(node) = cursor {
        let value = unsafe { node.read_word(3) };
        out.push(value);
        cursor = unsafe { node.read_ref(2) };
    }
    out
}

#[test]
fn rooted_list_survives_minor_collection() {
    let collector = precise_collector();
    let mutator = collector.register_thread();
    let mut roots = Box::new([0usize; 1]);
    unsafe {
        collector.register_root(roots.as_mut_ptr(), 1, RootDescriptor::all_refs(1));
        push_nodes(&mutator, roots.as_mut_ptr(), 200);
    }
    let before = roots[0];
    assert!(collector.is_young(ObjRef::from_addr(before).unwrap()));

    let metrics = mutator.collect(Generation::Nursery);
    assert_eq!(metrics.collection_type, CollectionType::Minor);
    assert_eq!(metrics.objects_copied, 200);
    assert_eq!(metrics.bytes_copied, 200 * 32);

    assert_ne!(roots[0], before);
    assert!(!collector.is_young(ObjRef::from_addr(roots[0]).unwrap()));
    let expected: Vec<usize> = (0..200).rev().collect();
    assert_eq!(payloads(roots[0]), expected);

    collector.unregister_root(roots.as_mut_ptr());
}

#[test]
fn unreachable_nursery_objects_are_reclaimed() {
    let collector = precise_collector();
    let mutator = collector.register_thread();
    let mut scratch = 0usize;
    unsafe { push_nodes(&mutator, &mut scratch, 1000) };
    assert!(collector.used_size() > 0);

    let metrics = mutator.collect(Generation::Nursery);
    assert_eq!(metrics.objects_copied, 0);
    assert_eq!(collector.used_size(), 0);
}

#[test]
fn shared_object_is_copied_once() {
    let collector = precise_collector();
    let mutator = collector.register_thread();
    let mut roots = Box::new([0usize; 2]);
    unsafe { collector.register_root(roots.as_mut_ptr(), 2, RootDescriptor::all_refs(2)) };

    let shared = mutator.alloc(node()).unwrap();
    unsafe {
        shared.write_word(3, 0xfeed);
        mutator.write_barrier(&mut roots[0], Some(shared));
        mutator.write_barrier(&mut roots[1], Some(shared));
    }

    let metrics = mutator.collect(Generation::Nursery);
    assert_eq!(metrics.objects_copied, 1);
    assert_eq!(roots[0], roots[1]);
    assert_ne!(roots[0], shared.addr());
    assert_eq!(payloads(roots[0]), vec![0xfeed]);

    collector.unregister_root(roots.as_mut_ptr());
}

#[test]
fn major_collection_evacuates_old_objects() {
    let collector = precise_collector();
    let mutator = collector.register_thread();
    let mut roots = Box::new([0usize; 1]);
    unsafe {
        collector.register_root(roots.as_mut_ptr(), 1, RootDescriptor::all_refs(1));
        push_nodes(&mutator, roots.as_mut_ptr(), 500);
    }
    mutator.collect(Generation::Nursery);
    let promoted = roots[0];

    let metrics = mutator.collect(Generation::Old);
    assert_eq!(metrics.collection_type, CollectionType::Major);
    assert_eq!(metrics.objects_copied, 500);
    assert_ne!(roots[0], promoted);
    assert_eq!(payloads(roots[0]).len(), 500);
    assert_eq!(collector.collection_count(Generation::Old), 1);

    // Drop the list: the next major collection frees every section.
    roots[0] = 0;
    let used_before = collector.used_size();
    let metrics = mutator.collect(Generation::Old);
    assert_eq!(metrics.objects_copied, 0);
    assert!(metrics.sections_freed >= 1);
    assert!(collector.used_size() < used_before);

    collector.unregister_root(roots.as_mut_ptr());
}

#[test]
fn used_size_counts_objects_not_buffers() {
    let collector = precise_collector();
    let mutator = collector.register_thread();
    assert_eq!(collector.used_size(), 0);

    mutator.alloc(node()).unwrap();
    assert_eq!(collector.used_size(), 32);
    mutator.alloc(node()).unwrap();
    assert_eq!(collector.used_size(), 64);
    assert!(collector.heap_size() > collector.used_size());
}

#[test]
fn cycles_are_collected() {
    let collector = precise_collector();
    let mutator = collector.register_thread();
    let mut roots = Box::new([0usize; 1]);
    unsafe { collector.register_root(roots.as_mut_ptr(), 1, RootDescriptor::all_refs(1)) };

    let a = mutator.alloc(node()).unwrap();
    let b = mutator.alloc(node()).unwrap();
    unsafe {
        mutator.set_ref(a, 2, Some(b));
        mutator.set_ref(b, 2, Some(a));
        mutator.write_barrier(&mut roots[0], Some(a));
    }
    mutator.collect(Generation::Nursery);
    let a = ObjRef::from_addr(roots[0]).unwrap();
    let b = unsafe { a.read_ref(2) }.unwrap();
    assert_eq!(unsafe { b.read_ref(2) }, Some(a));

    roots[0] = 0;
    let metrics = mutator.collect(Generation::Old);
    assert_eq!(metrics.objects_copied, 0);

    collector.unregister_root(roots.as_mut_ptr());
}

#[test]
fn memory_pressure_escalates_minor_collection() {
    let collector = precise_collector();
    let mutator = collector.register_thread();
    let nursery = i64::try_from(collector.config().nursery_size).unwrap();

    let metrics = mutator.collect(Generation::Nursery);
    assert!(!metrics.escalated);

    collector.add_memory_pressure(nursery + 1);
    let metrics = mutator.collect(Generation::Nursery);
    assert!(metrics.escalated);
    assert_eq!(metrics.collection_type, CollectionType::Major);
    assert_eq!(collector.collection_count(Generation::Nursery), 2);
    assert_eq!(collector.collection_count(Generation::Old), 1);

    // The major collection reset the pressure.
    let metrics = mutator.collect(Generation::Nursery);
    assert!(!metrics.escalated);
}

#[test]
fn last_metrics_matches_returned_metrics() {
    let collector = precise_collector();
    let mutator = collector.register_thread();
    let metrics = mutator.collect(Generation::Nursery);
    assert_eq!(collector.last_metrics(), metrics);
    assert!(metrics.duration >= metrics.scanning_duration);
}
