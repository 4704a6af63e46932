//! Several engines racing on one store

use lockstep::migration::{
    EngineError, LockCoordinator, LockError, LockOptions, MigrateError, MigrationRecord,
    MigrationRepository, Migrator, MigratorOptions,
};
use lockstep::MemoryStore;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn records() -> Vec<MigrationRecord> {
    (1..=5)
        .map(|key| {
            let record = MigrationRecord::new(
                key,
                format!("step{key}"),
                format!("CREATE TABLE t{key} ();"),
            );
            if key == 1 {
                record
            } else {
                record.parent(format!("m{}_step{}", key - 1, key - 1))
            }
        })
        .collect()
}

fn migrator(
    store: &MemoryStore,
    owner: String,
    acquire_timeout: Duration,
) -> Migrator<MemoryStore, MemoryStore> {
    Migrator::new(
        MigrationRepository::from_records(records()),
        store.clone(),
        LockCoordinator::new(
            store.clone(),
            LockOptions {
                acquire_timeout,
                initial_backoff: Duration::from_millis(2),
                max_backoff: Duration::from_millis(20),
            },
        ),
        MigratorOptions {
            owner,
            ..MigratorOptions::default()
        },
    )
}

#[test]
fn test_each_migration_is_applied_exactly_once() {
    let store = MemoryStore::new();
    let replicas = 4;
    let barrier = Arc::new(Barrier::new(replicas));

    let handles: Vec<_> = (0..replicas)
        .map(|i| {
            let store = store.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let migrator = migrator(&store, format!("replica-{i}"), Duration::from_secs(10));
                barrier.wait();
                migrator.run()
            })
        })
        .collect();

    let reports: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().expect("thread").expect("every replica succeeds"))
        .collect();

    let applied_total: usize = reports.iter().map(|r| r.applied.len()).sum();
    assert_eq!(applied_total, 5);

    // Whoever holds the lease first applies everything; the rest find nothing pending
    let noops = reports.iter().filter(|r| r.is_noop()).count();
    assert_eq!(noops, replicas - 1);
    for report in reports.iter().filter(|r| r.is_noop()) {
        assert_eq!(report.already_applied, 5);
    }
    assert_eq!(store.journal().len(), 5);
    assert_eq!(
        store.applied_identifiers(),
        records().iter().map(|r| r.identifier().to_string()).collect::<Vec<_>>()
    );
    assert_eq!(store.lease_holder("lockstep"), None);
}

#[test]
fn test_failing_migration_stops_every_replica_at_the_same_step() {
    let store = MemoryStore::new();
    store.fail_when_script_contains("t3");

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|i| {
            let store = store.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let migrator = migrator(&store, format!("replica-{i}"), Duration::from_millis(1));
                barrier.wait();
                migrator.run()
            })
        })
        .collect();

    for handle in handles {
        match handle.join().expect("thread") {
            Err(MigrateError::Lock(LockError::Timeout { .. })) => {}
            Err(MigrateError::Engine(EngineError::MigrationFailed { identifier, .. })) => {
                assert_eq!(identifier, "m3_step3");
            }
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(report) => panic!("step 3 cannot succeed, got {report:?}"),
        }
    }

    // t3 always fails, so the ledger stops after step 2 no matter who won
    assert_eq!(store.applied_identifiers(), vec!["m1_step1", "m2_step2"]);
    assert_eq!(store.journal().len(), 2);
}
