//! Migration status tracking

use crate::migration::{LedgerEntry, MigrationRecord};

/// Migration status information
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    /// Applied migrations (from the ledger, in apply order)
    pub applied: Vec<LedgerEntry>,

    /// Pending migrations (from the repository, in chain order)
    pub pending: Vec<MigrationRecord>,

    /// Total number of migrations (applied + pending)
    pub total: usize,

    /// Number of applied migrations
    pub applied_count: usize,

    /// Number of pending migrations
    pub pending_count: usize,
}

impl MigrationStatus {
    /// Create a new `MigrationStatus`
    #[must_use]
    pub fn new(applied: Vec<LedgerEntry>, pending: Vec<MigrationRecord>) -> Self {
        let applied_count = applied.len();
        let pending_count = pending.len();
        let total = applied_count + pending_count;

        Self {
            applied,
            pending,
            total,
            applied_count,
            pending_count,
        }
    }

    /// Check if all migrations are applied
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.pending_count == 0
    }

    /// The ledger head
    #[must_use]
    pub fn latest_applied(&self) -> Option<&LedgerEntry> {
        self.applied.iter().max_by_key(|e| e.sequence)
    }

    /// The record the next `up` would apply first
    #[must_use]
    pub fn next_pending(&self) -> Option<&MigrationRecord> {
        self.pending.first()
    }
}
