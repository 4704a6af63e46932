//! End-to-end engine behaviour against the in-memory store

use lockstep::migration::{
    EngineError, LedgerError, LockCoordinator, LockOptions, MigrateError, MigrationRecord,
    MigrationRepository, Migrator, MigratorOptions, RepositoryError,
};
use lockstep::{MemoryStore, MigrationStore, StoreTransaction};
use std::time::Duration;

fn chain() -> Vec<MigrationRecord> {
    vec![
        MigrationRecord::with_identifier("A", 1, "a", "CREATE TABLE a ();").revert("DROP TABLE a;"),
        MigrationRecord::with_identifier("B", 2, "b", "CREATE TABLE b ();")
            .parent("A")
            .revert("DROP TABLE b;"),
        MigrationRecord::with_identifier("C", 3, "c", "CREATE TABLE c ();")
            .parent("B")
            .revert("DROP TABLE c;"),
    ]
}

fn migrator(
    store: &MemoryStore,
    records: Vec<MigrationRecord>,
) -> Migrator<MemoryStore, MemoryStore> {
    Migrator::new(
        MigrationRepository::from_records(records),
        store.clone(),
        LockCoordinator::new(
            store.clone(),
            LockOptions {
                acquire_timeout: Duration::from_millis(100),
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(20),
            },
        ),
        MigratorOptions::default(),
    )
}

#[test]
fn test_full_apply_then_noop() {
    let store = MemoryStore::new();
    let migrator = migrator(&store, chain());

    let report = migrator.run().expect("first run");
    assert_eq!(report.identifiers(), vec!["A", "B", "C"]);
    assert_eq!(store.applied_identifiers(), vec!["A", "B", "C"]);
    assert_eq!(
        store.journal(),
        vec!["CREATE TABLE a ();", "CREATE TABLE b ();", "CREATE TABLE c ();"]
    );
    let sequences: Vec<i64> = store.ledger().iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);

    let begun = store.transactions_begun();
    let report = migrator.run().expect("second run");
    assert!(report.is_noop());
    assert_eq!(report.already_applied, 3);
    assert_eq!(store.transactions_begun(), begun, "a no-op run opens no transaction");
}

#[test]
fn test_failure_at_b_keeps_ledger_and_skips_c() {
    let store = MemoryStore::new();
    migrator(&store, chain()).up(Some(1)).expect("apply A");
    store.fail_when_script_contains("CREATE TABLE b");

    match migrator(&store, chain()).run() {
        Err(MigrateError::Engine(EngineError::MigrationFailed { identifier, .. })) => {
            assert_eq!(identifier, "B");
        }
        other => panic!("Expected MigrationFailed for B, got {other:?}"),
    }

    assert_eq!(store.applied_identifiers(), vec!["A"]);
    assert!(
        !store.journal().iter().any(|s| s.contains("TABLE c")),
        "C must never be attempted"
    );

    store.clear_failures();
    let report = migrator(&store, chain()).run().expect("retry after fix");
    assert_eq!(report.identifiers(), vec!["B", "C"]);
}

#[test]
fn test_exit_codes_by_failure_class() {
    let store = MemoryStore::new();
    store.fail_when_script_contains("CREATE TABLE a");
    let engine = migrator(&store, chain()).run().expect_err("apply fails");
    assert_eq!(engine.exit_code(), 3);

    let mut cyclic = chain();
    cyclic[0] = MigrationRecord::with_identifier("A", 1, "a", "CREATE TABLE a ();").parent("C");
    let repository = migrator(&MemoryStore::new(), cyclic).run().expect_err("cycle");
    assert!(matches!(repository, MigrateError::Repository(_)));
    assert_eq!(repository.exit_code(), 2);

    let ledger: MigrateError = LedgerError::AlreadyApplied {
        identifier: "A".to_string(),
    }
    .into();
    assert_eq!(ledger.exit_code(), 4);
}

#[test]
fn test_invalid_chain_leaves_ledger_untouched() {
    let store = MemoryStore::new();
    let mut duplicate = chain();
    duplicate[2] = MigrationRecord::with_identifier("C", 2, "c", "CREATE TABLE c ();").parent("B");

    match migrator(&store, duplicate).run() {
        Err(MigrateError::Repository(RepositoryError::DuplicateKey { key, .. })) => {
            assert_eq!(key, 2)
        }
        other => panic!("Expected DuplicateKey, got {other:?}"),
    }
    assert!(store.applied_identifiers().is_empty());
    assert_eq!(store.transactions_begun(), 0);
    assert!(!store.is_prepared());
}

#[test]
fn test_revert_head_restores_prefix() {
    let store = MemoryStore::new();
    let migrator = migrator(&store, chain());
    migrator.run().expect("run");

    match migrator.revert("B") {
        Err(MigrateError::Engine(EngineError::NotHead { head, .. })) => {
            assert_eq!(head.as_deref(), Some("C"));
        }
        other => panic!("Expected NotHead, got {other:?}"),
    }
    assert_eq!(store.applied_identifiers(), vec!["A", "B", "C"]);

    migrator.revert("C").expect("revert head");
    assert_eq!(store.applied_identifiers(), vec!["A", "B"]);

    let report = migrator.run().expect("re-apply");
    assert_eq!(report.identifiers(), vec!["C"]);
}

#[test]
fn test_checksum_drift_blocks_run() {
    let store = MemoryStore::new();
    migrator(&store, chain()).up(Some(2)).expect("apply A, B");

    let mut edited = chain();
    edited[0] = MigrationRecord::with_identifier("A", 1, "a", "CREATE TABLE a (id INT);")
        .revert("DROP TABLE a;");
    match migrator(&store, edited.clone()).run() {
        Err(MigrateError::Engine(EngineError::ChecksumMismatch { identifier, .. })) => {
            assert_eq!(identifier, "A");
        }
        other => panic!("Expected ChecksumMismatch, got {other:?}"),
    }
    assert_eq!(store.applied_identifiers(), vec!["A", "B"]);

    let lenient = Migrator::new(
        MigrationRepository::from_records(edited),
        store.clone(),
        LockCoordinator::new(store.clone(), LockOptions::default()),
        MigratorOptions {
            verify_checksums: false,
            ..MigratorOptions::default()
        },
    );
    assert_eq!(lenient.run().expect("lenient run").identifiers(), vec!["C"]);
}

#[test]
fn test_replayed_record_is_rejected_by_ledger() {
    let store = MemoryStore::new();
    migrator(&store, chain()).up(Some(1)).expect("apply A");

    let records = chain();
    let mut tx = store.begin().expect("begin");
    let err = lockstep::migration::VersionLedger::new(&mut tx)
        .record(&records[0], None)
        .expect_err("already applied");
    assert!(matches!(err, LedgerError::AlreadyApplied { .. }));
    tx.rollback().expect("rollback");
}
