//! Threads stopped inside the allocation fast path are stepped out of it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;

use kestrel_gc::{Collector, GcConfig, Generation};

#[test]
fn collection_restarts_thread_in_critical_region() {
    let collector = Collector::new(GcConfig::default().with_scan_thread_stacks(false)).unwrap();
    let stop = AtomicBool::new(false);
    let (ready_tx, ready_rx) = mpsc::channel();

    thread::scope(|s| {
        let worker = &collector;
        let stop = &stop;
        s.spawn(move || {
            let mutator = worker.register_thread();
            ready_tx.send(()).unwrap();
            while !stop.load(Ordering::Acquire) {
                mutator.debug_safepoint_in_critical_region();
                std::hint::spin_loop();
            }
        });

        ready_rx.recv().unwrap();
        let restarts: usize = (0..5)
            .map(|_| collector.collect(Generation::Nursery).critical_region_restarts)
            .sum();
        stop.store(true, Ordering::Release);
        assert!(restarts >= 1, "no critical-region restart in 5 collections");
    });

    assert_eq!(collector.collection_count(Generation::Nursery), 5);
}
