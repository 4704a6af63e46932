//! Version ledger
//!
//! The ledger is the durable record of applied migrations, kept in the target
//! database next to the data it describes. [`VersionLedger`] wraps an open
//! [`StoreTransaction`] so that every ledger write commits or rolls back
//! together with the migration action that caused it.

use crate::migration::{LedgerError, MigrationRecord};
use crate::store::StoreTransaction;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Duration;

/// One row of the ledger table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Identifier of the applied migration
    pub identifier: String,

    /// Ordering key of the applied migration
    pub ordering_key: i64,

    /// `SHA-256` of the migration's actions at apply time
    pub checksum: String,

    /// When the migration was applied
    pub applied_at: DateTime<Utc>,

    /// 1-based apply order
    pub sequence: i64,

    /// Execution time in milliseconds (`None` if not recorded)
    pub execution_time_ms: Option<i64>,
}

/// Ledger operations inside one store transaction
pub struct VersionLedger<'t, T: StoreTransaction> {
    tx: &'t mut T,
}

impl<'t, T: StoreTransaction> VersionLedger<'t, T> {
    pub fn new(tx: &'t mut T) -> Self {
        Self { tx }
    }

    /// Applied entries in apply order
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Store` if the ledger cannot be read.
    pub fn applied(&mut self) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut entries = self.tx.ledger_entries()?;
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }

    /// Applied identifiers
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Store` if the ledger cannot be read.
    pub fn applied_set(&mut self) -> Result<HashSet<String>, LedgerError> {
        Ok(self.applied()?.into_iter().map(|e| e.identifier).collect())
    }

    /// Append an entry for `record`
    ///
    /// The record's parent must be the current ledger head, which keeps the
    /// ledger a prefix of the chain.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::AlreadyApplied` if the record has an entry,
    /// `LedgerError::ParentNotApplied` if its parent is not the head, and
    /// `LedgerError::Store` if the write fails.
    pub fn record(
        &mut self,
        record: &MigrationRecord,
        execution_time: Option<Duration>,
    ) -> Result<LedgerEntry, LedgerError> {
        let applied = self.applied()?;

        if applied.iter().any(|e| e.identifier == record.identifier()) {
            return Err(LedgerError::AlreadyApplied {
                identifier: record.identifier().to_string(),
            });
        }

        let head = applied.last();
        if head.map(|e| e.identifier.as_str()) != record.parent_identifier() {
            return Err(LedgerError::ParentNotApplied {
                identifier: record.identifier().to_string(),
                parent: record.parent_identifier().map(str::to_string),
                head: head.map(|e| e.identifier.clone()),
            });
        }

        let entry = LedgerEntry {
            identifier: record.identifier().to_string(),
            ordering_key: record.ordering_key(),
            checksum: record.checksum().to_string(),
            applied_at: Utc::now(),
            sequence: head.map_or(1, |e| e.sequence + 1),
            execution_time_ms: execution_time
                .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX)),
        };

        self.tx.insert_ledger_entry(&entry)?;
        Ok(entry)
    }

    /// Remove the entry for `identifier`
    ///
    /// Only the most recently applied entry can be removed.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::NotApplied` if there is no such entry,
    /// `LedgerError::HasDependents` if later entries exist, and
    /// `LedgerError::Store` if the delete fails.
    pub fn unrecord(&mut self, identifier: &str) -> Result<LedgerEntry, LedgerError> {
        let applied = self.applied()?;

        let position = applied
            .iter()
            .position(|e| e.identifier == identifier)
            .ok_or_else(|| LedgerError::NotApplied {
                identifier: identifier.to_string(),
            })?;

        if position + 1 < applied.len() {
            return Err(LedgerError::HasDependents {
                identifier: identifier.to_string(),
                dependents: applied[position + 1..]
                    .iter()
                    .map(|e| e.identifier.clone())
                    .collect(),
            });
        }

        if !self.tx.delete_ledger_entry(identifier)? {
            return Err(LedgerError::NotApplied {
                identifier: identifier.to_string(),
            });
        }

        Ok(applied[position].clone())
    }
}
