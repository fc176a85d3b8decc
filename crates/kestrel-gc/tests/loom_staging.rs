//! Loom tests for the staging array's slot protocol.

use std::sync::Arc;

use kestrel_gc::staging::StagingArray;

const STAGE_SIZE: usize = 2;

/// An entry published before a drain is seen exactly once.
#[test]
#[ignore = "loom test - run with cargo test loom_staging_publish --release"]
fn test_publish_then_drain_sees_entry() {
    loom::model(|| {
        let stage: Arc<StagingArray<usize, STAGE_SIZE>> = Arc::new(StagingArray::new());

        let writer = loom::thread::spawn({
            let stage = Arc::clone(&stage);
            move || stage.try_add(42)
        });
        let drainer = loom::thread::spawn({
            let stage = Arc::clone(&stage);
            move || {
                let mut seen = Vec::new();
                stage.drain(|v| seen.push(v));
                seen
            }
        });

        let added = writer.join().unwrap();
        let mut seen = drainer.join().unwrap();
        assert!(added);
        stage.drain(|v| seen.push(v));
        assert_eq!(seen, [42]);
    });
}

/// Two writers racing for the same slots never lose or duplicate entries.
#[test]
#[ignore = "loom test - run with cargo test loom_staging_concurrent --release"]
fn test_concurrent_writers() {
    loom::model(|| {
        let stage: Arc<StagingArray<usize, STAGE_SIZE>> = Arc::new(StagingArray::new());

        let handles: Vec<_> = [1, 2]
            .into_iter()
            .map(|value| {
                let stage = Arc::clone(&stage);
                loom::thread::spawn(move || stage.try_add(value))
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }

        let mut seen = Vec::new();
        stage.drain(|v| seen.push(v));
        seen.sort_unstable();
        assert_eq!(seen, [1, 2]);
        assert!(stage.is_empty());
    });
}
