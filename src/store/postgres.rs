//! `PostgreSQL` store over `may_postgres`
//!
//! The ledger and the lease table live in the migrated database. Transactions
//! are plain `BEGIN`/`COMMIT` on the store's client, so an action script and
//! its ledger row become visible together or not at all.

use crate::migration::{LeaseClaim, LeaseHolder, LedgerEntry, LockBackend};
use crate::store::{validate_table_name, MigrationStore, StoreError, StoreTransaction};
use chrono::{DateTime, Utc};
use may_postgres::{Client, Row};
use sea_query::{
    ColumnDef, Index, IndexCreateStatement, PostgresQueryBuilder, Table, TableCreateStatement,
};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Default ledger table name
pub const DEFAULT_LEDGER_TABLE: &str = "lockstep_migrations";
/// Default lease table name
pub const DEFAULT_LOCK_TABLE: &str = "lockstep_locks";

/// `PostgreSQL` target store
///
/// Cloning shares the underlying client.
#[derive(Clone)]
pub struct PgStore {
    client: Client,
    ledger_table: String,
    lock_table: String,
}

impl PgStore {
    /// Store using the default table names
    pub fn new(client: Client) -> Self {
        Self {
            client,
            ledger_table: DEFAULT_LEDGER_TABLE.to_string(),
            lock_table: DEFAULT_LOCK_TABLE.to_string(),
        }
    }

    /// Store using custom table names
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidTableName` unless both names are plain identifiers.
    pub fn with_tables(
        client: Client,
        ledger_table: &str,
        lock_table: &str,
    ) -> Result<Self, StoreError> {
        validate_table_name(ledger_table)?;
        validate_table_name(lock_table)?;
        Ok(Self {
            client,
            ledger_table: ledger_table.to_string(),
            lock_table: lock_table.to_string(),
        })
    }

    pub fn ledger_table(&self) -> &str {
        &self.ledger_table
    }

    pub fn lock_table(&self) -> &str {
        &self.lock_table
    }

    fn select_ledger_sql(&self) -> String {
        format!(
            "SELECT identifier, ordering_key, checksum, applied_at, sequence, execution_time_ms \
             FROM {} ORDER BY sequence",
            self.ledger_table
        )
    }

    fn select_holder(&self, name: &str) -> Result<Option<LeaseHolder>, StoreError> {
        let sql = format!(
            "SELECT owner, acquired_at, expires_at FROM {} WHERE name = $1",
            self.lock_table
        );
        let rows = self.client.query(sql.as_str(), &[&name])?;
        match rows.first() {
            Some(row) => Ok(Some(LeaseHolder {
                owner: row.try_get::<_, String>(0)?,
                acquired_at: row.try_get::<_, DateTime<Utc>>(1)?,
                expires_at: row.try_get::<_, DateTime<Utc>>(2)?,
            })),
            None => Ok(None),
        }
    }
}

/// Advisory lock key serializing `prepare` for one lease table
///
/// Concurrent `CREATE TABLE IF NOT EXISTS` can still collide in the catalog,
/// so replicas take this transaction-scoped lock before creating anything.
pub fn prepare_lock_key(lock_table: &str) -> i64 {
    let digest = Sha256::digest(format!("lockstep:prepare:{lock_table}").as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// `CREATE TABLE IF NOT EXISTS` for the ledger
pub fn ledger_table_statement(table: &str) -> TableCreateStatement {
    Table::create()
        .table(table.to_string())
        .if_not_exists()
        .col(ColumnDef::new("identifier").text().not_null().primary_key())
        .col(ColumnDef::new("ordering_key").big_integer().not_null())
        .col(ColumnDef::new("checksum").string_len(64).not_null())
        .col(ColumnDef::new("applied_at").timestamp_with_time_zone().not_null())
        .col(ColumnDef::new("sequence").big_integer().not_null().unique_key())
        .col(ColumnDef::new("execution_time_ms").big_integer().null())
        .to_owned()
}

/// Index on the ledger's `applied_at`
pub fn ledger_index_statement(table: &str) -> IndexCreateStatement {
    Index::create()
        .if_not_exists()
        .name(format!("idx_{table}_applied_at"))
        .table(table.to_string())
        .col("applied_at")
        .to_owned()
}

/// `CREATE TABLE IF NOT EXISTS` for the lease rows
pub fn lock_table_statement(table: &str) -> TableCreateStatement {
    Table::create()
        .table(table.to_string())
        .if_not_exists()
        .col(ColumnDef::new("name").text().not_null().primary_key())
        .col(ColumnDef::new("owner").text().not_null())
        .col(ColumnDef::new("acquired_at").timestamp_with_time_zone().not_null())
        .col(ColumnDef::new("expires_at").timestamp_with_time_zone().not_null())
        .to_owned()
}

fn ledger_entry(row: &Row) -> Result<LedgerEntry, StoreError> {
    Ok(LedgerEntry {
        identifier: row.try_get::<_, String>(0)?,
        ordering_key: row.try_get::<_, i64>(1)?,
        checksum: row.try_get::<_, String>(2)?,
        applied_at: row.try_get::<_, DateTime<Utc>>(3)?,
        sequence: row.try_get::<_, i64>(4)?,
        execution_time_ms: row.try_get::<_, Option<i64>>(5)?,
    })
}

impl MigrationStore for PgStore {
    type Transaction = PgTransaction;

    fn prepare(&self) -> Result<(), StoreError> {
        let statements = [
            ledger_table_statement(&self.ledger_table).build(PostgresQueryBuilder),
            ledger_index_statement(&self.ledger_table).build(PostgresQueryBuilder),
            lock_table_statement(&self.lock_table).build(PostgresQueryBuilder),
        ];

        let key = prepare_lock_key(&self.lock_table);
        let tx = self.begin()?;
        tx.client.execute("SELECT pg_advisory_xact_lock($1)", &[&key])?;
        for sql in &statements {
            tx.client.execute(sql.as_str(), &[])?;
        }
        tx.commit()?;

        log::debug!(
            "Prepared bookkeeping tables '{}' and '{}'",
            self.ledger_table,
            self.lock_table
        );
        Ok(())
    }

    fn begin(&self) -> Result<PgTransaction, StoreError> {
        self.client.execute("BEGIN", &[])?;
        Ok(PgTransaction {
            client: self.client.clone(),
            ledger_table: self.ledger_table.clone(),
            closed: false,
        })
    }

    fn ledger_entries(&self) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows = self.client.query(self.select_ledger_sql().as_str(), &[])?;
        rows.iter().map(ledger_entry).collect()
    }
}

/// Open `PostgreSQL` transaction
///
/// Dropped without `commit` or `rollback`, it issues `ROLLBACK`.
pub struct PgTransaction {
    client: Client,
    ledger_table: String,
    closed: bool,
}

impl PgTransaction {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed {
            Err(StoreError::TransactionClosed)
        } else {
            Ok(())
        }
    }
}

impl StoreTransaction for PgTransaction {
    fn execute(&mut self, script: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.client.batch_execute(script)?;
        Ok(())
    }

    fn ledger_entries(&mut self) -> Result<Vec<LedgerEntry>, StoreError> {
        self.ensure_open()?;
        let sql = format!(
            "SELECT identifier, ordering_key, checksum, applied_at, sequence, execution_time_ms \
             FROM {} ORDER BY sequence",
            self.ledger_table
        );
        let rows = self.client.query(sql.as_str(), &[])?;
        rows.iter().map(ledger_entry).collect()
    }

    fn insert_ledger_entry(&mut self, entry: &LedgerEntry) -> Result<(), StoreError> {
        self.ensure_open()?;
        let sql = format!(
            "INSERT INTO {} \
             (identifier, ordering_key, checksum, applied_at, sequence, execution_time_ms) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            self.ledger_table
        );
        self.client.execute(
            sql.as_str(),
            &[
                &entry.identifier,
                &entry.ordering_key,
                &entry.checksum,
                &entry.applied_at,
                &entry.sequence,
                &entry.execution_time_ms,
            ],
        )?;
        Ok(())
    }

    fn delete_ledger_entry(&mut self, identifier: &str) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let sql = format!("DELETE FROM {} WHERE identifier = $1", self.ledger_table);
        Ok(self.client.execute(sql.as_str(), &[&identifier])? > 0)
    }

    fn commit(mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.closed = true;
        self.client.execute("COMMIT", &[])?;
        Ok(())
    }

    fn rollback(mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.closed = true;
        self.client.execute("ROLLBACK", &[])?;
        Ok(())
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.client.execute("ROLLBACK", &[]) {
                log::warn!("Failed to roll back abandoned transaction: {}", e);
            }
        }
    }
}

impl LockBackend for PgStore {
    fn try_claim(
        &self,
        name: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<LeaseClaim, StoreError> {
        let claim_sql = format!(
            "INSERT INTO {t} (name, owner, acquired_at, expires_at) \
             VALUES ($1, $2, NOW(), NOW() + make_interval(secs => $3)) \
             ON CONFLICT (name) DO UPDATE SET \
                 owner = EXCLUDED.owner, \
                 acquired_at = CASE WHEN {t}.owner = EXCLUDED.owner \
                     THEN {t}.acquired_at ELSE EXCLUDED.acquired_at END, \
                 expires_at = EXCLUDED.expires_at \
             WHERE {t}.expires_at < NOW() OR {t}.owner = EXCLUDED.owner \
             RETURNING expires_at",
            t = self.lock_table
        );
        let seconds = lease.as_secs_f64();

        // The row can vanish between a refused claim and the read of its holder
        for _ in 0..3 {
            let rows = self.client.query(claim_sql.as_str(), &[&name, &owner, &seconds])?;
            if let Some(row) = rows.first() {
                return Ok(LeaseClaim::Granted {
                    expires_at: row.try_get::<_, DateTime<Utc>>(0)?,
                });
            }
            if let Some(holder) = self.select_holder(name)? {
                return Ok(LeaseClaim::Held {
                    holder: holder.owner,
                    expires_at: holder.expires_at,
                });
            }
        }

        Err(StoreError::Other(format!(
            "lease row '{name}' kept changing while being claimed"
        )))
    }

    fn extend(
        &self,
        name: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let sql = format!(
            "UPDATE {} SET expires_at = NOW() + make_interval(secs => $3) \
             WHERE name = $1 AND owner = $2 RETURNING expires_at",
            self.lock_table
        );
        let rows = self.client.query(sql.as_str(), &[&name, &owner, &lease.as_secs_f64()])?;
        match rows.first() {
            Some(row) => Ok(Some(row.try_get::<_, DateTime<Utc>>(0)?)),
            None => Ok(None),
        }
    }

    fn release(&self, name: &str, owner: &str) -> Result<bool, StoreError> {
        let sql = format!(
            "DELETE FROM {} WHERE name = $1 AND owner = $2",
            self.lock_table
        );
        Ok(self.client.execute(sql.as_str(), &[&name, &owner])? > 0)
    }

    fn holder(&self, name: &str) -> Result<Option<LeaseHolder>, StoreError> {
        self.select_holder(name)
    }
}
