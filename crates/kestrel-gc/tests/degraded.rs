//! Degraded allocation when pinning leaves the nursery without fragments.

use std::sync::OnceLock;

use kestrel_gc::{Collector, GcConfig, Generation, ObjectType, RootDescriptor};

const NURSERY: usize = 256 * 1024;
const BLOB: usize = 256;

fn blob() -> &'static ObjectType {
    static TYPE: OnceLock<&'static ObjectType> = OnceLock::new();
    TYPE.get_or_init(|| ObjectType::object("Blob", BLOB, &[]))
}

#[test]
fn fully_pinned_nursery_degrades_until_released() {
    let config = GcConfig::default()
        .with_nursery_size(NURSERY)
        .with_scan_thread_stacks(false);
    let collector = Collector::new(config).unwrap();
    let mutator = collector.register_thread();

    // Every allocation is pinned through an ambiguous root.
    let mut pins = vec![0usize; 2 * NURSERY / BLOB];
    unsafe { collector.register_root(pins.as_mut_ptr(), pins.len(), RootDescriptor::Conservative) };

    let mut degraded_at = None;
    for i in 0..pins.len() {
        let obj = mutator.alloc(blob()).unwrap();
        if !collector.is_young(obj) {
            degraded_at = Some(i);
            break;
        }
        pins[i] = obj.addr();
    }
    let degraded_at = degraded_at.expect("nursery never filled up");
    assert!(degraded_at >= NURSERY / BLOB / 2, "degraded after {degraded_at} objects");
    assert!(collector.is_degraded());
    assert!(collector.last_metrics().objects_pinned >= degraded_at / 2);

    // Further small allocations keep going to the old generation.
    let obj = mutator.alloc(blob()).unwrap();
    assert!(!collector.is_young(obj));

    pins.fill(0);
    mutator.collect(Generation::Old);
    assert!(!collector.is_degraded());
    let obj = mutator.alloc(blob()).unwrap();
    assert!(collector.is_young(obj));

    collector.unregister_root(pins.as_mut_ptr());
}
