//! Store abstraction
//!
//! The engine never talks to a database directly. It drives a
//! [`MigrationStore`], which opens [`StoreTransaction`]s that can run an action
//! script and read or write ledger rows in the same unit of work. The ledger
//! invariants themselves live in [`crate::migration::VersionLedger`], so every
//! backend gets them for free.

use crate::migration::LedgerEntry;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::{MemoryStore, MemoryTransaction};
pub use postgres::{PgStore, PgTransaction};

/// Store-level error type
#[derive(Debug, Error)]
pub enum StoreError {
    /// `PostgreSQL` error from `may_postgres`
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] may_postgres::Error),

    /// An action script was rejected by the store
    #[error("execution error: {0}")]
    Execution(String),

    /// Another writer changed the ledger while this transaction was open
    #[error("transaction conflict: {0}")]
    Conflict(String),

    /// Transaction already committed or rolled back
    #[error("transaction has already been committed or rolled back")]
    TransactionClosed,

    /// A configured table name is not a plain SQL identifier
    #[error("invalid table name '{0}': expected [A-Za-z_][A-Za-z0-9_]*")]
    InvalidTableName(String),

    /// Other store errors
    #[error("store error: {0}")]
    Other(String),
}

/// A target database that hosts the migrated schema and its ledger
pub trait MigrationStore {
    /// Transaction handle produced by [`MigrationStore::begin`]
    type Transaction: StoreTransaction;

    /// Create the ledger and lock tables if they do not exist yet
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the bookkeeping schema cannot be created.
    fn prepare(&self) -> Result<(), StoreError>;

    /// Open a new transaction
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the transaction cannot be started.
    fn begin(&self) -> Result<Self::Transaction, StoreError>;

    /// Read the ledger outside of any transaction, ordered by apply sequence
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the ledger cannot be read.
    fn ledger_entries(&self) -> Result<Vec<LedgerEntry>, StoreError>;
}

/// One unit of work on a [`MigrationStore`]
///
/// Dropping an open transaction without committing must discard its effects.
pub trait StoreTransaction {
    /// Run an opaque action script
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the script fails.
    fn execute(&mut self, script: &str) -> Result<(), StoreError>;

    /// Read the ledger as seen by this transaction, ordered by apply sequence
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the ledger cannot be read.
    fn ledger_entries(&mut self) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Append a ledger row
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the row cannot be written.
    fn insert_ledger_entry(&mut self, entry: &LedgerEntry) -> Result<(), StoreError>;

    /// Delete a ledger row, returning whether it existed
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the row cannot be deleted.
    fn delete_ledger_entry(&mut self, identifier: &str) -> Result<bool, StoreError>;

    /// Make every change in this transaction durable
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the commit fails, in which case nothing was applied.
    fn commit(self) -> Result<(), StoreError>;

    /// Discard every change in this transaction
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the rollback cannot be issued.
    fn rollback(self) -> Result<(), StoreError>;
}

/// Unquoted `PostgreSQL` identifier, at most 63 bytes
static TABLE_NAME: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").ok());

/// Check that a configured table name can be interpolated into SQL
///
/// # Errors
///
/// Returns `StoreError::InvalidTableName` for anything but a plain identifier.
pub fn validate_table_name(name: &str) -> Result<(), StoreError> {
    let valid = (*TABLE_NAME).as_ref().is_some_and(|re| re.is_match(name));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidTableName(name.to_string()))
    }
}
