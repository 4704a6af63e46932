//! Migrator - Core migration execution engine

use crate::config::MigrationsConfig;
use crate::migration::checksum::validate_checksum;
use crate::migration::lock::default_owner;
use crate::migration::{
    EngineError, LedgerEntry, LockBackend, LockCoordinator, LockGuard, MigrateError,
    MigrationChain, MigrationRecord, MigrationRepository, MigrationStatus, RepositoryError,
    VersionLedger,
};
use crate::store::{MigrationStore, StoreTransaction};
use std::time::{Duration, Instant};

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;
#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

/// Default name of the lease row guarding migrations
pub const DEFAULT_LOCK_NAME: &str = "lockstep";

/// Per-engine settings
#[derive(Debug, Clone)]
pub struct MigratorOptions {
    /// Lease row to contend on
    pub lock_name: String,
    /// Identity written into the lease row
    pub owner: String,
    /// Lease duration, renewed before every step
    pub lease: Duration,
    /// Compare stored checksums with the current source
    pub verify_checksums: bool,
}

impl Default for MigratorOptions {
    fn default() -> Self {
        Self {
            lock_name: DEFAULT_LOCK_NAME.to_string(),
            owner: default_owner(),
            lease: Duration::from_secs(30),
            verify_checksums: true,
        }
    }
}

impl From<&MigrationsConfig> for MigratorOptions {
    fn from(config: &MigrationsConfig) -> Self {
        Self {
            lock_name: config.lock_name.clone(),
            owner: config.lock_owner.clone().unwrap_or_else(default_owner),
            lease: Duration::from_secs(config.lease_seconds),
            verify_checksums: config.verify_checksums,
        }
    }
}

/// One migration applied or reverted by a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    pub identifier: String,
    pub elapsed: Duration,
}

/// Outcome of `up`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Migrations applied by this run, in order
    pub applied: Vec<AppliedMigration>,
    /// Migrations that were already in the ledger when the run started
    pub already_applied: usize,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }

    pub fn identifiers(&self) -> Vec<&str> {
        self.applied.iter().map(|m| m.identifier.as_str()).collect()
    }
}

/// Outcome of `down` and `revert`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevertReport {
    /// Migrations reverted by this run, newest first
    pub reverted: Vec<AppliedMigration>,
    /// Ledger entries left after the run
    pub remaining: usize,
}

impl RevertReport {
    pub fn identifiers(&self) -> Vec<&str> {
        self.reverted.iter().map(|m| m.identifier.as_str()).collect()
    }
}

/// A migration together with its ledger entry, if applied
#[derive(Debug, Clone)]
pub struct MigrationInfo {
    pub record: MigrationRecord,
    pub entry: Option<LedgerEntry>,
    /// Whether the record is the ledger head, and so may be reverted
    pub is_head: bool,
}

/// Core migration execution engine
///
/// Owns its repository, store and lock coordinator; nothing is global. The
/// same store value commonly backs both the ledger and the lease table.
pub struct Migrator<S, L> {
    repository: MigrationRepository,
    store: S,
    coordinator: LockCoordinator<L>,
    options: MigratorOptions,
}

impl<S: MigrationStore, L: LockBackend> Migrator<S, L> {
    pub fn new(
        repository: MigrationRepository,
        store: S,
        coordinator: LockCoordinator<L>,
        options: MigratorOptions,
    ) -> Self {
        Self {
            repository,
            store,
            coordinator,
            options,
        }
    }

    pub fn repository(&self) -> &MigrationRepository {
        &self.repository
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn coordinator(&self) -> &LockCoordinator<L> {
        &self.coordinator
    }

    pub fn options(&self) -> &MigratorOptions {
        &self.options
    }

    /// Apply every pending migration
    ///
    /// # Errors
    ///
    /// See [`Migrator::up`].
    pub fn run(&self) -> Result<MigrationReport, MigrateError> {
        self.up(None)
    }

    /// Apply up to `steps` pending migrations (`None` for all)
    ///
    /// Each migration runs in its own transaction together with its ledger
    /// row. The first failure is rolled back and ends the run; later
    /// migrations are not attempted.
    ///
    /// # Errors
    ///
    /// - `RepositoryError` if the chain cannot be loaded
    /// - `LockError` if the lease cannot be acquired or is lost between steps
    /// - `EngineError` if the ledger does not match the chain or a migration fails
    /// - `LedgerError` if a ledger assertion fails inside a step
    pub fn up(&self, steps: Option<usize>) -> Result<MigrationReport, MigrateError> {
        let chain = self.repository.load()?;
        self.with_lock(|guard| {
            let applied = self.store.ledger_entries()?;
            self.verify(&chain, &applied)?;

            let pending = limit(chain.after(applied.len()), steps);
            let mut report = MigrationReport {
                applied: Vec::with_capacity(pending.len()),
                already_applied: applied.len(),
            };

            if pending.is_empty() {
                log::debug!(
                    "No pending migrations ({} already applied)",
                    report.already_applied
                );
                return Ok(report);
            }

            for record in pending {
                guard.renew()?;
                let elapsed = self.apply_one(record)?;
                log::info!("Applied migration {} in {:?}", record.identifier(), elapsed);
                report.applied.push(AppliedMigration {
                    identifier: record.identifier().to_string(),
                    elapsed,
                });
            }

            Ok(report)
        })
    }

    /// Revert the `steps` most recently applied migrations, newest first
    ///
    /// Every target must be reversible; this is checked before anything runs.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Irreversible` if a target has no revert action,
    /// `EngineError::RevertFailed` if a revert action fails, and the errors of
    /// [`Migrator::up`] otherwise.
    pub fn down(&self, steps: usize) -> Result<RevertReport, MigrateError> {
        let chain = self.repository.load()?;
        self.with_lock(|guard| {
            let applied = self.store.ledger_entries()?;
            self.verify(&chain, &applied)?;

            let targets = revert_targets(&chain, applied.len(), steps);
            self.revert_all(&targets, applied.len(), guard)
        })
    }

    /// Revert exactly `identifier`, which must be the ledger head
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::UnknownMigration` if the source does not
    /// define it, `EngineError::NotHead` if it is not the most recently applied
    /// migration, and the errors of [`Migrator::down`] otherwise.
    pub fn revert(&self, identifier: &str) -> Result<RevertReport, MigrateError> {
        let chain = self.repository.load()?;
        if chain.get(identifier).is_none() {
            return Err(RepositoryError::UnknownMigration(identifier.to_string()).into());
        }

        self.with_lock(|guard| {
            let applied = self.store.ledger_entries()?;
            self.verify(&chain, &applied)?;

            let head = applied.last().map(|e| e.identifier.clone());
            if head.as_deref() != Some(identifier) {
                return Err(EngineError::NotHead {
                    identifier: identifier.to_string(),
                    head,
                }
                .into());
            }

            let targets = revert_targets(&chain, applied.len(), 1);
            self.revert_all(&targets, applied.len(), guard)
        })
    }

    /// Applied and pending migrations, without taking the lock
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError` if the chain cannot be loaded, `StoreError` if
    /// the ledger cannot be read, and `EngineError` if it does not match the chain.
    pub fn status(&self) -> Result<MigrationStatus, MigrateError> {
        let chain = self.repository.load()?;
        let applied = self.read_ledger()?;
        self.verify(&chain, &applied)?;

        let pending = chain.after(applied.len()).to_vec();
        Ok(MigrationStatus::new(applied, pending))
    }

    /// Check the source and the ledger against each other
    ///
    /// Returns the number of applied migrations.
    ///
    /// # Errors
    ///
    /// Same as [`Migrator::status`].
    pub fn validate(&self) -> Result<usize, MigrateError> {
        let chain = self.repository.load()?;
        let applied = self.read_ledger()?;
        self.verify(&chain, &applied)?;
        log::debug!(
            "Validated {} migration(s), {} applied",
            chain.len(),
            applied.len()
        );
        Ok(applied.len())
    }

    /// Migrations `up(steps)` would apply, in order
    ///
    /// # Errors
    ///
    /// Same as [`Migrator::status`].
    pub fn plan(&self, steps: Option<usize>) -> Result<Vec<MigrationRecord>, MigrateError> {
        let chain = self.repository.load()?;
        let applied = self.read_ledger()?;
        self.verify(&chain, &applied)?;
        Ok(limit(chain.after(applied.len()), steps).to_vec())
    }

    /// Migrations `down(steps)` would revert, newest first
    ///
    /// # Errors
    ///
    /// Same as [`Migrator::status`].
    pub fn plan_down(&self, steps: usize) -> Result<Vec<MigrationRecord>, MigrateError> {
        let chain = self.repository.load()?;
        let applied = self.read_ledger()?;
        self.verify(&chain, &applied)?;
        Ok(revert_targets(&chain, applied.len(), steps)
            .into_iter()
            .cloned()
            .collect())
    }

    /// One migration and its ledger entry
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::UnknownMigration` if the source does not define it.
    pub fn info(&self, identifier: &str) -> Result<MigrationInfo, MigrateError> {
        let chain = self.repository.load()?;
        let record = chain
            .get(identifier)
            .cloned()
            .ok_or_else(|| RepositoryError::UnknownMigration(identifier.to_string()))?;
        let applied = self.read_ledger()?;
        let is_head = applied.last().is_some_and(|e| e.identifier == identifier);
        let entry = applied.into_iter().find(|e| e.identifier == identifier);
        Ok(MigrationInfo {
            record,
            entry,
            is_head,
        })
    }

    fn read_ledger(&self) -> Result<Vec<LedgerEntry>, MigrateError> {
        self.store.prepare()?;
        Ok(self.store.ledger_entries()?)
    }

    /// Prepare bookkeeping, hold the lease for the duration of `body`, release it
    fn with_lock<T>(
        &self,
        body: impl FnOnce(&mut LockGuard<'_, L>) -> Result<T, MigrateError>,
    ) -> Result<T, MigrateError> {
        self.store.prepare()?;
        let lock = self.coordinator.acquire(
            &self.options.lock_name,
            &self.options.owner,
            self.options.lease,
        )?;
        let mut guard = self.coordinator.guard(lock);

        let result = body(&mut guard);

        if let Err(e) = guard.release() {
            log::warn!("Failed to release lock '{}': {}", self.options.lock_name, e);
        }
        result
    }

    /// Ledger must be a prefix of the chain, with unchanged checksums
    fn verify(&self, chain: &MigrationChain, applied: &[LedgerEntry]) -> Result<(), EngineError> {
        for (position, entry) in applied.iter().enumerate() {
            let Some(record) = chain.get(&entry.identifier) else {
                return Err(EngineError::UnknownApplied {
                    identifier: entry.identifier.clone(),
                });
            };

            match chain.records().get(position) {
                Some(expected) if expected.identifier() == entry.identifier => {}
                expected => {
                    return Err(EngineError::LedgerDivergence {
                        position,
                        expected: expected
                            .map_or_else(|| "none".to_string(), |r| r.identifier().to_string()),
                        found: entry.identifier.clone(),
                    });
                }
            }

            if self.options.verify_checksums {
                validate_checksum(&entry.identifier, &entry.checksum, record.checksum())?;
            }
        }
        Ok(())
    }

    fn apply_one(&self, record: &MigrationRecord) -> Result<Duration, MigrateError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::migration_step_span(record.identifier(), "up").entered();

        let start = Instant::now();
        let mut tx = self.store.begin()?;

        let executed = tx.execute(record.apply_action());
        if let Err(cause) = executed {
            rollback(tx, record.identifier());
            return Err(EngineError::MigrationFailed {
                identifier: record.identifier().to_string(),
                cause,
            }
            .into());
        }

        let elapsed = start.elapsed();
        let recorded = VersionLedger::new(&mut tx).record(record, Some(elapsed));
        if let Err(e) = recorded {
            rollback(tx, record.identifier());
            return Err(e.into());
        }

        tx.commit().map_err(|cause| EngineError::MigrationFailed {
            identifier: record.identifier().to_string(),
            cause,
        })?;

        #[cfg(feature = "metrics")]
        METRICS.record_applied(elapsed);

        Ok(elapsed)
    }

    fn revert_all(
        &self,
        targets: &[&MigrationRecord],
        applied: usize,
        guard: &mut LockGuard<'_, L>,
    ) -> Result<RevertReport, MigrateError> {
        if let Some(record) = targets.iter().find(|r| !r.is_reversible()) {
            return Err(EngineError::Irreversible {
                identifier: record.identifier().to_string(),
            }
            .into());
        }

        let mut report = RevertReport {
            reverted: Vec::with_capacity(targets.len()),
            remaining: applied,
        };

        if targets.is_empty() {
            log::debug!("Nothing to revert");
            return Ok(report);
        }

        for record in targets {
            guard.renew()?;
            let elapsed = self.revert_one(record)?;
            log::info!("Reverted migration {} in {:?}", record.identifier(), elapsed);
            report.remaining -= 1;
            report.reverted.push(AppliedMigration {
                identifier: record.identifier().to_string(),
                elapsed,
            });
        }

        Ok(report)
    }

    fn revert_one(&self, record: &MigrationRecord) -> Result<Duration, MigrateError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::migration_step_span(record.identifier(), "down").entered();

        let Some(script) = record.revert_action() else {
            return Err(EngineError::Irreversible {
                identifier: record.identifier().to_string(),
            }
            .into());
        };

        let start = Instant::now();
        let mut tx = self.store.begin()?;

        let executed = tx.execute(script);
        if let Err(cause) = executed {
            rollback(tx, record.identifier());
            return Err(EngineError::RevertFailed {
                identifier: record.identifier().to_string(),
                cause,
            }
            .into());
        }

        let removed = VersionLedger::new(&mut tx).unrecord(record.identifier());
        if let Err(e) = removed {
            rollback(tx, record.identifier());
            return Err(e.into());
        }

        tx.commit().map_err(|cause| EngineError::RevertFailed {
            identifier: record.identifier().to_string(),
            cause,
        })?;

        let elapsed = start.elapsed();
        #[cfg(feature = "metrics")]
        METRICS.record_reverted(elapsed);

        Ok(elapsed)
    }
}

fn limit(records: &[MigrationRecord], steps: Option<usize>) -> &[MigrationRecord] {
    match steps {
        Some(n) if n < records.len() => &records[..n],
        _ => records,
    }
}

/// The last `steps` applied records of the chain, newest first
fn revert_targets(chain: &MigrationChain, applied: usize, steps: usize) -> Vec<&MigrationRecord> {
    chain.records()[..applied.min(chain.len())]
        .iter()
        .rev()
        .take(steps)
        .collect()
}

fn rollback<T: StoreTransaction>(tx: T, identifier: &str) {
    if let Err(e) = tx.rollback() {
        log::warn!("Rollback of migration {} failed: {}", identifier, e);
    }
}
