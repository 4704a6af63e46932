//! # Lockstep
//!
//! Versioned schema migrations for PostgreSQL on the `may` runtime.
//!
//! Migrations are loaded from a directory of SQL files, validated as a single
//! parent-linked chain, and applied exactly once under a lease-based lock held
//! in the target database. Every step commits its structural change and its
//! ledger entry in the same transaction.
//!
//! ```rust,no_run
//! use lockstep::config::LockstepConfig;
//! use lockstep::migration::{startup_migrations, StartupPolicy};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = LockstepConfig::load()?;
//!     let migrator = lockstep::postgres_migrator(&config)?;
//!     let report = startup_migrations(&migrator, &StartupPolicy::from(&config.migrations))?;
//!     println!("applied {} migration(s)", report.applied.len());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod metrics;
pub mod migration;
pub mod store;

pub use connection::{connect, ConnectionError};
pub use migration::{
    LedgerEntry, MigrateError, MigrationChain, MigrationRecord, MigrationRepository, Migrator,
};
pub use store::{MemoryStore, MigrationStore, PgStore, StoreError, StoreTransaction};

use crate::config::LockstepConfig;
use crate::migration::{LockCoordinator, MigratorOptions};

/// Build a [`Migrator`] for the PostgreSQL database named in `config`.
///
/// The ledger and the lock share one client; the engine never interleaves them.
///
/// # Errors
///
/// Returns `MigrateError::Connection` if the database cannot be reached and
/// `MigrateError::Store` if a configured table name is not a valid identifier.
pub fn postgres_migrator(
    config: &LockstepConfig,
) -> Result<Migrator<PgStore, PgStore>, MigrateError> {
    let client = connect(&config.database.url)?;
    let store = PgStore::with_tables(
        client,
        &config.migrations.ledger_table,
        &config.migrations.lock_table,
    )?;

    Ok(Migrator::new(
        MigrationRepository::from_dir(&config.migrations.dir),
        store.clone(),
        LockCoordinator::new(store, (&config.migrations).into()),
        MigratorOptions::from(&config.migrations),
    ))
}
