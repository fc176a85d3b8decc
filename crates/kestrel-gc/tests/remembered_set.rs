//! Old-to-young references recorded by the write barriers.

use std::sync::OnceLock;

use kestrel_gc::{Collector, GcConfig, Generation, Mutator, ObjRef, ObjectType, RootDescriptor};

fn node() -> &'static ObjectType {
    static TYPE: OnceLock<&'static ObjectType> = OnceLock::new();
    TYPE.get_or_init(|| ObjectType::object("Node", 32, &[2]))
}

/// Inline value `{ ref, int }`, described by its boxed form.
fn pair() -> &'static ObjectType {
    static TYPE: OnceLock<&'static ObjectType> = OnceLock::new();
    TYPE.get_or_init(|| ObjectType::object("Pair", 32, &[2]))
}

fn pair_array() -> &'static ObjectType {
    static TYPE: OnceLock<&'static ObjectType> = OnceLock::new();
    TYPE.get_or_init(|| ObjectType::array("Pair[]", 16, &[0]))
}

fn precise_collector() -> Collector {
    Collector::new(GcConfig::default().with_scan_thread_stacks(false)).unwrap()
}

/// Allocate a young object of `ty`, root it in `root` and promote it.
fn promoted(mutator: &Mutator, root: &mut usize, ty: &'static ObjectType, len: usize) -> ObjRef {
    let obj = if ty.is_array() {
        mutator.alloc_array(ty, len).unwrap()
    } else {
        mutator.alloc(ty).unwrap()
    };
    unsafe { mutator.write_barrier(root, Some(obj)) };
    mutator.collect(Generation::Nursery);
    let obj = ObjRef::from_addr(*root).unwrap();
    assert!(!mutator.collector().is_young(obj));
    obj
}

/// A young object with `value` in its payload word.
fn young_with(mutator: &Mutator, value: usize) -> ObjRef {
    let obj = mutator.alloc(node()).unwrap();
    unsafe { obj.write_word(3, value) };
    obj
}

#[test]
fn old_to_young_edge_is_updated() {
    let collector = precise_collector();
    let mutator = collector.register_thread();
    let mut roots = Box::new([0usize; 1]);
    let mut links = Box::new([0usize; 2]);
    unsafe { collector.register_root(roots.as_mut_ptr(), 1, RootDescriptor::all_refs(1)) };

    let b = promoted(&mutator, &mut roots[0], node(), 0);
    let a = young_with(&mutator, 99);
    unsafe {
        mutator.set_ref(b, 2, Some(a));
        collector.register_weak_link(&mut links[0], Some(a), false);
        collector.register_weak_link(&mut links[1], Some(b), false);
    }
    assert_eq!(mutator.remembered_entries(), 1);

    mutator.collect(Generation::Nursery);
    let b = ObjRef::from_addr(roots[0]).unwrap();
    let a_new = unsafe { b.read_ref(2) }.unwrap();
    assert_ne!(a_new, a);
    assert!(!collector.is_young(a_new));
    assert_eq!(unsafe { a_new.read_word(3) }, 99);
    assert_eq!(unsafe { collector.weak_link_get(&links[0]) }, Some(a_new));
    assert_eq!(mutator.remembered_entries(), 0);

    // The log was consumed: with the root gone, a second minor collection
    // leaves both old objects alone and a major one frees them.
    roots[0] = 0;
    let metrics = mutator.collect(Generation::Nursery);
    assert_eq!(metrics.objects_copied, 0);
    assert!(unsafe { collector.weak_link_get(&links[1]) }.is_some());

    mutator.collect(Generation::Old);
    assert_eq!(unsafe { collector.weak_link_get(&links[0]) }, None);
    assert_eq!(unsafe { collector.weak_link_get(&links[1]) }, None);

    unsafe {
        collector.weak_link_remove(&mut links[0]);
        collector.weak_link_remove(&mut links[1]);
    }
    collector.unregister_root(roots.as_mut_ptr());
}

#[test]
fn generic_barrier_is_replayed() {
    let collector = precise_collector();
    let mutator = collector.register_thread();
    let mut roots = Box::new([0usize; 1]);
    unsafe { collector.register_root(roots.as_mut_ptr(), 1, RootDescriptor::all_refs(1)) };

    let old = promoted(&mutator, &mut roots[0], node(), 0);
    let young = young_with(&mutator, 7);
    unsafe { mutator.write_barrier_generic(old.word_ptr(2), Some(young)) };

    mutator.collect(Generation::Nursery);
    let old = ObjRef::from_addr(roots[0]).unwrap();
    let moved = unsafe { old.read_ref(2) }.unwrap();
    assert!(!collector.is_young(moved));
    assert_eq!(unsafe { moved.read_word(3) }, 7);

    collector.unregister_root(roots.as_mut_ptr());
}

#[test]
fn arrayref_copy_into_old_array() {
    let collector = precise_collector();
    let mutator = collector.register_thread();
    let refs = ObjectType::ref_array("Object[]");
    let mut roots = Box::new([0usize; 1]);
    unsafe { collector.register_root(roots.as_mut_ptr(), 1, RootDescriptor::all_refs(1)) };

    let old = promoted(&mutator, &mut roots[0], refs, 8);
    let young: Vec<usize> = (0..8).map(|i| young_with(&mutator, i).addr()).collect();
    unsafe { mutator.write_barrier_arrayref_copy(old.word_ptr(2), young.as_ptr(), 8) };

    mutator.collect(Generation::Nursery);
    let old = ObjRef::from_addr(roots[0]).unwrap();
    for i in 0..8 {
        let element = unsafe { old.read_ref(2 + i) }.unwrap();
        assert!(!collector.is_young(element));
        assert_eq!(unsafe { element.read_word(3) }, i);
    }

    collector.unregister_root(roots.as_mut_ptr());
}

#[test]
fn value_copy_into_old_array() {
    let collector = precise_collector();
    let mutator = collector.register_thread();
    let mut roots = Box::new([0usize; 1]);
    unsafe { collector.register_root(roots.as_mut_ptr(), 1, RootDescriptor::all_refs(1)) };

    let old = promoted(&mutator, &mut roots[0], pair_array(), 2);
    let young = young_with(&mutator, 5);
    let values = [0usize, 11, young.addr(), 12];
    unsafe {
        mutator.write_barrier_value_copy(
            old.element_ptr(0, 16),
            values.as_ptr().cast::<u8>(),
            2,
            pair(),
        );
    }

    mutator.collect(Generation::Nursery);
    let old = ObjRef::from_addr(roots[0]).unwrap();
    unsafe {
        assert_eq!(old.read_ref(2), None);
        assert_eq!(old.read_word(3), 11);
        let moved = old.read_ref(4).unwrap();
        assert!(!collector.is_young(moved));
        assert_eq!(moved.read_word(3), 5);
        assert_eq!(old.read_word(5), 12);
    }

    collector.unregister_root(roots.as_mut_ptr());
}

#[test]
fn object_copy_into_old_object() {
    let collector = precise_collector();
    let mutator = collector.register_thread();
    let mut roots = Box::new([0usize; 1]);
    unsafe { collector.register_root(roots.as_mut_ptr(), 1, RootDescriptor::all_refs(1)) };

    let old = promoted(&mutator, &mut roots[0], node(), 0);
    let target = young_with(&mutator, 31);
    let src = young_with(&mutator, 64);
    unsafe {
        mutator.set_ref(src, 2, Some(target));
        mutator.write_barrier_object_copy(old, src);
    }
    assert_eq!(unsafe { old.read_word(3) }, 64);

    mutator.collect(Generation::Nursery);
    let old = ObjRef::from_addr(roots[0]).unwrap();
    let moved = unsafe { old.read_ref(2) }.unwrap();
    assert!(!collector.is_young(moved));
    assert_eq!(unsafe { moved.read_word(3) }, 31);

    collector.unregister_root(roots.as_mut_ptr());
}

#[test]
fn remembered_set_of_exited_thread_is_kept() {
    let collector = precise_collector();
    let mut roots = Box::new([0usize; 1]);
    unsafe { collector.register_root(roots.as_mut_ptr(), 1, RootDescriptor::all_refs(1)) };
    let root_addr = roots.as_mut_ptr() as usize;

    std::thread::scope(|s| {
        s.spawn(|| {
            let mutator = collector.register_thread();
            let root = root_addr as *mut usize;
            let old = promoted(&mutator, unsafe { &mut *root }, node(), 0);
            let young = young_with(&mutator, 3);
            unsafe { mutator.set_ref(old, 2, Some(young)) };
        });
    });

    collector.collect(Generation::Nursery);
    let old = ObjRef::from_addr(roots[0]).unwrap();
    let moved = unsafe { old.read_ref(2) }.unwrap();
    assert!(!collector.is_young(moved));
    assert_eq!(unsafe { moved.read_word(3) }, 3);

    collector.unregister_root(roots.as_mut_ptr());
}
