//! In-memory store
//!
//! Keeps the ledger, the lease table and a journal of committed action scripts
//! behind one mutex. A transaction works on a staged copy of the ledger and
//! publishes it on commit, refusing if another commit landed in between. Clones
//! share state, so several engines in one process can race on the same store.

use crate::migration::{LeaseClaim, LeaseHolder, LedgerEntry, LockBackend};
use crate::store::{MigrationStore, StoreError, StoreTransaction};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct MemoryState {
    prepared: bool,
    ledger: Vec<LedgerEntry>,
    version: u64,
    journal: Vec<String>,
    failures: Vec<String>,
    leases: HashMap<String, LeaseHolder>,
    transactions_begun: usize,
    transactions_committed: usize,
}

/// Shared in-memory target store
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        lock_state(&self.state)
    }

    /// Committed ledger in apply order
    pub fn ledger(&self) -> Vec<LedgerEntry> {
        self.state().ledger.clone()
    }

    /// Committed ledger identifiers in apply order
    pub fn applied_identifiers(&self) -> Vec<String> {
        self.state().ledger.iter().map(|e| e.identifier.clone()).collect()
    }

    /// Replace the committed ledger, bypassing every check
    pub fn set_ledger(&self, entries: Vec<LedgerEntry>) {
        let mut state = self.state();
        state.ledger = entries;
        state.version += 1;
    }

    /// Action scripts from committed transactions, in commit order
    pub fn journal(&self) -> Vec<String> {
        self.state().journal.clone()
    }

    pub fn transactions_begun(&self) -> usize {
        self.state().transactions_begun
    }

    pub fn transactions_committed(&self) -> usize {
        self.state().transactions_committed
    }

    pub fn is_prepared(&self) -> bool {
        self.state().prepared
    }

    /// Make any script containing `pattern` fail with `StoreError::Execution`
    pub fn fail_when_script_contains(&self, pattern: impl Into<String>) {
        self.state().failures.push(pattern.into());
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Owner named by the lease row, expired or not
    pub fn lease_holder(&self, name: &str) -> Option<String> {
        self.state().leases.get(name).map(|h| h.owner.clone())
    }
}

fn lock_state(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn lease_expiry(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl MigrationStore for MemoryStore {
    type Transaction = MemoryTransaction;

    fn prepare(&self) -> Result<(), StoreError> {
        self.state().prepared = true;
        Ok(())
    }

    fn begin(&self) -> Result<MemoryTransaction, StoreError> {
        let mut state = self.state();
        state.transactions_begun += 1;
        Ok(MemoryTransaction {
            state: Arc::clone(&self.state),
            base_version: state.version,
            ledger: state.ledger.clone(),
            scripts: Vec::new(),
            closed: false,
        })
    }

    fn ledger_entries(&self) -> Result<Vec<LedgerEntry>, StoreError> {
        Ok(self.ledger())
    }
}

/// Staged unit of work on a [`MemoryStore`]
#[derive(Debug)]
pub struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    base_version: u64,
    ledger: Vec<LedgerEntry>,
    scripts: Vec<String>,
    closed: bool,
}

impl MemoryTransaction {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed {
            Err(StoreError::TransactionClosed)
        } else {
            Ok(())
        }
    }
}

impl StoreTransaction for MemoryTransaction {
    fn execute(&mut self, script: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        let state = lock_state(&self.state);
        if let Some(pattern) = state.failures.iter().find(|p| script.contains(p.as_str())) {
            return Err(StoreError::Execution(format!(
                "script rejected (matched '{pattern}')"
            )));
        }
        drop(state);
        self.scripts.push(script.to_string());
        Ok(())
    }

    fn ledger_entries(&mut self) -> Result<Vec<LedgerEntry>, StoreError> {
        self.ensure_open()?;
        Ok(self.ledger.clone())
    }

    fn insert_ledger_entry(&mut self, entry: &LedgerEntry) -> Result<(), StoreError> {
        self.ensure_open()?;
        if self.ledger.iter().any(|e| e.identifier == entry.identifier) {
            return Err(StoreError::Conflict(format!(
                "duplicate ledger identifier '{}'",
                entry.identifier
            )));
        }
        if self.ledger.iter().any(|e| e.sequence == entry.sequence) {
            return Err(StoreError::Conflict(format!(
                "duplicate ledger sequence {}",
                entry.sequence
            )));
        }
        self.ledger.push(entry.clone());
        Ok(())
    }

    fn delete_ledger_entry(&mut self, identifier: &str) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let before = self.ledger.len();
        self.ledger.retain(|e| e.identifier != identifier);
        Ok(self.ledger.len() != before)
    }

    fn commit(mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.closed = true;

        let mut state = lock_state(&self.state);
        if state.version != self.base_version {
            return Err(StoreError::Conflict(
                "ledger changed since the transaction began".to_string(),
            ));
        }
        state.ledger = std::mem::take(&mut self.ledger);
        state.version += 1;
        state.journal.append(&mut self.scripts);
        state.transactions_committed += 1;
        Ok(())
    }

    fn rollback(mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.closed = true;
        Ok(())
    }
}

impl LockBackend for MemoryStore {
    fn try_claim(
        &self,
        name: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<LeaseClaim, StoreError> {
        let now = Utc::now();
        let mut state = self.state();

        let acquired_at = match state.leases.get(name) {
            Some(current) if current.owner != owner && current.expires_at > now => {
                return Ok(LeaseClaim::Held {
                    holder: current.owner.clone(),
                    expires_at: current.expires_at,
                });
            }
            Some(current) if current.owner == owner => current.acquired_at,
            Some(current) => {
                log::warn!(
                    "Taking over expired lease '{}' from '{}' (expired at {})",
                    name,
                    current.owner,
                    current.expires_at
                );
                now
            }
            None => now,
        };

        let expires_at = lease_expiry(now, lease);
        state.leases.insert(
            name.to_string(),
            LeaseHolder {
                owner: owner.to_string(),
                acquired_at,
                expires_at,
            },
        );
        Ok(LeaseClaim::Granted { expires_at })
    }

    fn extend(
        &self,
        name: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let mut state = self.state();
        match state.leases.get_mut(name) {
            Some(current) if current.owner == owner => {
                current.expires_at = lease_expiry(Utc::now(), lease);
                Ok(Some(current.expires_at))
            }
            _ => Ok(None),
        }
    }

    fn release(&self, name: &str, owner: &str) -> Result<bool, StoreError> {
        let mut state = self.state();
        if state.leases.get(name).is_some_and(|h| h.owner == owner) {
            state.leases.remove(name);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn holder(&self, name: &str) -> Result<Option<LeaseHolder>, StoreError> {
        Ok(self.state().leases.get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(identifier: &str, sequence: i64) -> LedgerEntry {
        LedgerEntry {
            identifier: identifier.to_string(),
            ordering_key: sequence,
            checksum: "abc".to_string(),
            applied_at: Utc::now(),
            sequence,
            execution_time_ms: None,
        }
    }

    #[test]
    fn test_commit_publishes_ledger_and_journal() {
        let store = MemoryStore::new();
        let mut tx = store.begin().expect("begin");
        tx.execute("CREATE TABLE a ();").expect("execute");
        tx.insert_ledger_entry(&entry("m1_a", 1)).expect("insert");
        assert!(store.applied_identifiers().is_empty());
        tx.commit().expect("commit");

        assert_eq!(store.applied_identifiers(), vec!["m1_a"]);
        assert_eq!(store.journal(), vec!["CREATE TABLE a ();"]);
        assert_eq!(store.transactions_begun(), 1);
        assert_eq!(store.transactions_committed(), 1);
    }

    #[test]
    fn test_rollback_discards_everything() {
        let store = MemoryStore::new();
        let mut tx = store.begin().expect("begin");
        tx.execute("CREATE TABLE a ();").expect("execute");
        tx.insert_ledger_entry(&entry("m1_a", 1)).expect("insert");
        tx.rollback().expect("rollback");

        assert!(store.applied_identifiers().is_empty());
        assert!(store.journal().is_empty());
    }

    #[test]
    fn test_dropped_transaction_discards_everything() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin().expect("begin");
            tx.insert_ledger_entry(&entry("m1_a", 1)).expect("insert");
        }
        assert!(store.applied_identifiers().is_empty());
    }

    #[test]
    fn test_injected_failure() {
        let store = MemoryStore::new();
        store.fail_when_script_contains("BROKEN");
        let mut tx = store.begin().expect("begin");
        assert!(matches!(
            tx.execute("CREATE TABLE BROKEN ();"),
            Err(StoreError::Execution(_))
        ));
        tx.execute("CREATE TABLE fine ();").expect("unrelated script");

        store.clear_failures();
        tx.execute("CREATE TABLE BROKEN ();").expect("failure cleared");
    }

    #[test]
    fn test_concurrent_commit_conflicts() {
        let store = MemoryStore::new();
        let mut first = store.begin().expect("begin first");
        let mut second = store.begin().expect("begin second");
        first.insert_ledger_entry(&entry("m1_a", 1)).expect("insert first");
        second.insert_ledger_entry(&entry("m1_a", 1)).expect("insert second");

        first.commit().expect("first commits");
        assert!(matches!(second.commit(), Err(StoreError::Conflict(_))));
        assert_eq!(store.applied_identifiers(), vec!["m1_a"]);
    }

    #[test]
    fn test_duplicate_entry_is_rejected() {
        let store = MemoryStore::new();
        let mut tx = store.begin().expect("begin");
        tx.insert_ledger_entry(&entry("m1_a", 1)).expect("insert");
        assert!(matches!(
            tx.insert_ledger_entry(&entry("m1_a", 2)),
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            tx.insert_ledger_entry(&entry("m2_b", 1)),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn test_lease_expiry_saturates() {
        let now = Utc::now();
        assert_eq!(lease_expiry(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert!(lease_expiry(now, Duration::from_secs(1)) > now);
    }
}
