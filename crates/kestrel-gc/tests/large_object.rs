//! Large-object space and the heap ceiling.

use std::sync::OnceLock;

use kestrel_gc::{
    Collector, GcConfig, GcError, Generation, ObjRef, ObjectType, RootDescriptor,
    MAX_SMALL_OBJ_SIZE,
};

fn bytes() -> &'static ObjectType {
    static TYPE: OnceLock<&'static ObjectType> = OnceLock::new();
    TYPE.get_or_init(|| ObjectType::array("byte[]", 1, &[]))
}

fn node() -> &'static ObjectType {
    static TYPE: OnceLock<&'static ObjectType> = OnceLock::new();
    TYPE.get_or_init(|| ObjectType::object("Node", 32, &[2]))
}

fn longs() -> &'static ObjectType {
    static TYPE: OnceLock<&'static ObjectType> = OnceLock::new();
    TYPE.get_or_init(|| ObjectType::array("long[]", 8, &[]))
}

fn refs() -> &'static ObjectType {
    static TYPE: OnceLock<&'static ObjectType> = OnceLock::new();
    TYPE.get_or_init(|| ObjectType::ref_array("Object[]"))
}

#[test]
fn large_arrays_bypass_the_nursery_and_never_move() {
    let collector = Collector::new(GcConfig::default().with_scan_thread_stacks(false)).unwrap();
    let mutator = collector.register_thread();
    let mut roots = Box::new([0usize; 1]);
    unsafe { collector.register_root(roots.as_mut_ptr(), 1, RootDescriptor::all_refs(1)) };

    let heap_before = collector.heap_size();
    let big = mutator.alloc_array(bytes(), MAX_SMALL_OBJ_SIZE * 4).unwrap();
    assert!(!collector.is_young(big));
    assert!(collector.heap_size() >= heap_before + MAX_SMALL_OBJ_SIZE * 4);
    unsafe {
        big.element_ptr(100, 1).write(0xab);
        mutator.write_barrier(&mut roots[0], Some(big));
    }

    mutator.collect(Generation::Nursery);
    mutator.collect(Generation::Old);
    assert_eq!(roots[0], big.addr());
    assert_eq!(unsafe { big.element_ptr(100, 1).read() }, 0xab);
    assert_eq!(unsafe { big.array_len() }, MAX_SMALL_OBJ_SIZE * 4);

    roots[0] = 0;
    let metrics = mutator.collect(Generation::Old);
    assert!(metrics.los_bytes_reclaimed >= MAX_SMALL_OBJ_SIZE * 4);
    assert_eq!(collector.heap_size(), heap_before);

    collector.unregister_root(roots.as_mut_ptr());
}

#[test]
fn large_object_holds_young_references() {
    let collector = Collector::new(GcConfig::default().with_scan_thread_stacks(false)).unwrap();
    let mutator = collector.register_thread();
    let mut roots = Box::new([0usize; 1]);
    unsafe { collector.register_root(roots.as_mut_ptr(), 1, RootDescriptor::all_refs(1)) };

    let table = mutator.alloc_large(refs(), 16).unwrap();
    unsafe { mutator.write_barrier(&mut roots[0], Some(table)) };
    for i in 0..16 {
        let entry = mutator.alloc(node()).unwrap();
        unsafe {
            entry.write_word(3, i);
            mutator.set_ref(table, 2 + i, Some(entry));
        }
    }

    mutator.collect(Generation::Nursery);
    mutator.collect(Generation::Old);
    for i in 0..16 {
        let entry = unsafe { table.read_ref(2 + i) }.unwrap();
        assert!(!collector.is_young(entry));
        assert_eq!(unsafe { entry.read_word(3) }, i);
    }

    collector.unregister_root(roots.as_mut_ptr());
}

#[test]
fn heap_limit_is_reported_and_recoverable() {
    const NURSERY: usize = 256 * 1024;
    const CHUNK: usize = 64 * 1024;

    let config = GcConfig::default()
        .with_nursery_size(NURSERY)
        .with_max_heap_size(Some(NURSERY * 4))
        .with_scan_thread_stacks(false);
    let collector = Collector::new(config).unwrap();
    let mutator = collector.register_thread();
    let mut roots = Box::new([0usize; 64]);
    unsafe { collector.register_root(roots.as_mut_ptr(), 64, RootDescriptor::all_refs(64)) };

    let mut failure = None;
    for slot in roots.iter_mut() {
        match mutator.alloc_array(bytes(), CHUNK) {
            Ok(obj) => *slot = obj.addr(),
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
    }
    match failure {
        Some(GcError::HeapLimitExceeded { requested, limit }) => {
            assert!(requested >= CHUNK);
            assert_eq!(limit, NURSERY * 3);
        }
        other => panic!("expected the heap limit to be hit, got {other:?}"),
    }
    let live = roots.iter().filter(|&&slot| slot != 0).count();
    assert!(live >= 8 && live < 12, "{live} chunks fit under the limit");

    // Everything allocated is still intact.
    for &slot in roots.iter().filter(|&&slot| slot != 0) {
        let obj = ObjRef::from_addr(slot).unwrap();
        assert_eq!(unsafe { obj.array_len() }, CHUNK);
    }

    roots.fill(0);
    assert!(mutator.alloc_array(bytes(), CHUNK).is_ok());

    collector.unregister_root(roots.as_mut_ptr());
}

#[test]
fn pinned_allocations_respect_the_heap_limit() {
    const NURSERY: usize = 256 * 1024;

    let config = GcConfig::default()
        .with_nursery_size(NURSERY)
        .with_max_heap_size(Some(NURSERY * 4))
        .with_scan_thread_stacks(false);
    let collector = Collector::new(config).unwrap();
    let mutator = collector.register_thread();

    let mut roots = vec![0usize; 8192];
    unsafe {
        collector.register_root(
            roots.as_mut_ptr(),
            roots.len(),
            RootDescriptor::all_refs(roots.len()),
        );
    }
    let mut result = Ok(());
    for slot in &mut roots {
        match mutator.alloc_pinned(bytes(), 1024) {
            Ok(obj) => *slot = obj.addr(),
            Err(err) => {
                result = Err(err);
                break;
            }
        }
    }
    assert!(matches!(result, Err(GcError::HeapLimitExceeded { .. })));

    collector.unregister_root(roots.as_mut_ptr());
}

#[test]
fn oversized_array_lengths_are_rejected() {
    let collector = Collector::new(GcConfig::default().with_scan_thread_stacks(false)).unwrap();
    let mutator = collector.register_thread();
    let heap_before = collector.heap_size();

    let too_long = (1usize << 32) + 16;
    assert!(matches!(
        mutator.alloc_large(bytes(), too_long),
        Err(GcError::ArrayTooLarge { length }) if length == too_long
    ));
    assert!(matches!(
        mutator.alloc_large(longs(), usize::MAX / 4),
        Err(GcError::ArrayTooLarge { .. })
    ));
    assert!(matches!(
        mutator.alloc_array(longs(), 1 << 33),
        Err(GcError::ArrayTooLarge { .. })
    ));
    assert!(matches!(
        mutator.alloc_pinned(bytes(), too_long),
        Err(GcError::ArrayTooLarge { .. })
    ));
    assert_eq!(collector.heap_size(), heap_before);

    let ok = mutator.alloc_array(longs(), 4).unwrap();
    assert_eq!(unsafe { ok.array_len() }, 4);
}
