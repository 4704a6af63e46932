//! Migration error taxonomy
//!
//! Each failure class maps to its own process exit code so that a supervisor
//! can tell a configuration defect from a failed migration from a transient
//! lock race.

use crate::connection::ConnectionError;
use crate::store::StoreError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Exit code for a successful run or a clean no-op.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code for store, connection and configuration-loading failures.
pub const EXIT_STORE: i32 = 1;
/// Exit code for a broken migration source. Not worth retrying.
pub const EXIT_REPOSITORY: i32 = 2;
/// Exit code for a failed migration. Needs an operator.
pub const EXIT_ENGINE: i32 = 3;
/// Exit code for a ledger assertion, which means the lock discipline was broken.
pub const EXIT_LEDGER: i32 = 4;
/// Exit code for lock contention (`EX_TEMPFAIL`). Safe to retry with backoff.
pub const EXIT_LOCK: i32 = 75;

/// Errors raised while loading and validating the migration chain
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The migration directory does not exist
    #[error("migration source not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    /// The migration directory or one of its files could not be read
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A migration file name or body does not follow the expected layout
    #[error("invalid migration '{origin}': {reason}")]
    InvalidFormat { origin: String, reason: String },

    /// Two migrations share an ordering key
    #[error("ordering key {key} is used by both '{first}' and '{second}'")]
    DuplicateKey {
        key: i64,
        first: String,
        second: String,
    },

    /// Two migrations share an identifier
    #[error("migration identifier '{0}' is defined more than once")]
    DuplicateIdentifier(String),

    /// The parent links do not form a single chain from root to head
    #[error("broken migration chain at '{identifier}': {reason}")]
    BrokenChain { identifier: String, reason: String },

    /// Following parent links returns to a migration already visited
    #[error("migration chain contains a cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    /// A caller named a migration the source does not define
    #[error("no migration named '{0}' in the migration source")]
    UnknownMigration(String),
}

/// Errors raised by the lease-based lock coordinator
#[derive(Debug, Error)]
pub enum LockError {
    /// Another owner holds an unexpired lease
    #[error("lock '{name}' is held by '{holder}' until {expires_at}")]
    AlreadyHeld {
        name: String,
        holder: String,
        expires_at: chrono::DateTime<chrono::Utc>,
    },

    /// The lease could not be acquired within the configured bound
    #[error(
        "failed to acquire lock '{name}' within {waited:?}; another replica may be migrating. \
         If this persists, check for a stuck migration process"
    )]
    Timeout { name: String, waited: Duration },

    /// The lease expired and was taken over, or was removed, while we held it
    #[error("lease on lock '{name}' held by '{owner}' was lost")]
    Lost { name: String, owner: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised by the version ledger
///
/// Apart from `Store`, these indicate a broken lock discipline and are treated
/// as fatal assertions.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The identifier already has a ledger entry
    #[error("migration '{identifier}' has already been applied")]
    AlreadyApplied { identifier: String },

    /// Recording this migration would leave the ledger without its parent
    #[error(
        "migration '{identifier}' expects parent {} but the ledger head is {}",
        describe(.parent), describe(.head)
    )]
    ParentNotApplied {
        identifier: String,
        parent: Option<String>,
        head: Option<String>,
    },

    /// The identifier has no ledger entry to remove
    #[error("migration '{identifier}' is not applied")]
    NotApplied { identifier: String },

    /// Later migrations still depend on this entry
    #[error(
        "migration '{identifier}' cannot be removed while {} still applied",
        .dependents.join(", ")
    )]
    HasDependents {
        identifier: String,
        dependents: Vec<String>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised by the migration engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Applying a migration failed; the step was rolled back
    #[error("migration '{identifier}' failed: {cause}")]
    MigrationFailed {
        identifier: String,
        #[source]
        cause: StoreError,
    },

    /// Reverting a migration failed; the step was rolled back
    #[error("revert of migration '{identifier}' failed: {cause}")]
    RevertFailed {
        identifier: String,
        #[source]
        cause: StoreError,
    },

    /// The migration has no revert action
    #[error("migration '{identifier}' has no revert action")]
    Irreversible { identifier: String },

    /// Only the most recently applied migration may be reverted
    #[error("migration '{identifier}' is not the ledger head (head is {})", describe(.head))]
    NotHead {
        identifier: String,
        head: Option<String>,
    },

    /// The ledger names a migration the repository does not know
    #[error("applied migration '{identifier}' is missing from the migration source")]
    UnknownApplied { identifier: String },

    /// The applied sequence is not a prefix of the chain
    #[error(
        "ledger diverges from the chain at position {position}: \
         expected '{expected}', found '{found}'"
    )]
    LedgerDivergence {
        position: usize,
        expected: String,
        found: String,
    },

    /// An applied migration was edited after deployment
    #[error(
        "migration '{identifier}' has been modified after being applied \
         (stored checksum {stored}, current checksum {current})"
    )]
    ChecksumMismatch {
        identifier: String,
        stored: String,
        current: String,
    },
}

/// Top-level error surfaced to the invoking process
#[derive(Debug, Error)]
pub enum MigrateError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl MigrateError {
    /// Process exit code for this error class
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            MigrateError::Repository(_) => EXIT_REPOSITORY,
            MigrateError::Lock(LockError::Store(_)) => EXIT_STORE,
            MigrateError::Lock(_) => EXIT_LOCK,
            MigrateError::Ledger(LedgerError::Store(_)) => EXIT_STORE,
            MigrateError::Ledger(_) => EXIT_LEDGER,
            MigrateError::Engine(_) => EXIT_ENGINE,
            MigrateError::Store(_) | MigrateError::Connection(_) => EXIT_STORE,
        }
    }

    /// Whether restarting the run may succeed without anyone intervening
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MigrateError::Lock(
                LockError::Timeout { .. } | LockError::AlreadyHeld { .. } | LockError::Lost { .. }
            )
        )
    }
}

fn describe(identifier: &Option<String>) -> String {
    match identifier {
        Some(id) => format!("'{id}'"),
        None => "none".to_string(),
    }
}
