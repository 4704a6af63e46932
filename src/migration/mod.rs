//! Migration system for Lockstep
//!
//! This module provides the migration engine and its collaborators:
//! - `MigrationRepository` loads an ordered, validated chain of migrations
//! - `VersionLedger` records applied migrations inside store transactions
//! - `LockCoordinator` hands out expiring leases so one replica migrates at a time
//! - `Migrator` ties them together
//!
//! # Example
//!
//! ```rust
//! use lockstep::migration::{
//!     LockCoordinator, LockOptions, MigrationRecord, MigrationRepository, Migrator,
//!     MigratorOptions,
//! };
//! use lockstep::store::MemoryStore;
//!
//! let repository = MigrationRepository::from_records(vec![
//!     MigrationRecord::new(20240101000000, "create_users", "CREATE TABLE users (id BIGINT);")
//!         .revert("DROP TABLE users;"),
//!     MigrationRecord::new(20240102000000, "add_email", "ALTER TABLE users ADD email TEXT;")
//!         .parent("m20240101000000_create_users"),
//! ]);
//!
//! let store = MemoryStore::new();
//! let migrator = Migrator::new(
//!     repository,
//!     store.clone(),
//!     LockCoordinator::new(store.clone(), LockOptions::default()),
//!     MigratorOptions::default(),
//! );
//!
//! let report = migrator.run()?;
//! assert_eq!(report.applied.len(), 2);
//! assert!(migrator.run()?.is_noop());
//! # Ok::<(), lockstep::MigrateError>(())
//! ```

pub mod checksum;
pub mod error;
pub mod file;
pub mod ledger;
pub mod lock;
pub mod migrator;
pub mod record;
pub mod repository;
pub mod startup;
pub mod status;

pub use checksum::{calculate_checksum, validate_checksum};
pub use error::{EngineError, LedgerError, LockError, MigrateError, RepositoryError};
pub use file::{discover_migrations, parse_migration_source, MigrationFile};
pub use ledger::{LedgerEntry, VersionLedger};
pub use lock::{
    default_owner, LeaseClaim, LeaseHolder, Lock, LockBackend, LockCoordinator, LockGuard,
    LockOptions,
};
pub use migrator::{
    AppliedMigration, MigrationInfo, MigrationReport, Migrator, MigratorOptions, RevertReport,
    DEFAULT_LOCK_NAME,
};
pub use record::MigrationRecord;
pub use repository::{MigrationChain, MigrationRepository};
pub use startup::{startup_migrations, StartupPolicy};
pub use status::MigrationStatus;
