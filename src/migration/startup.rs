//! In-process migration execution helpers

use crate::config::MigrationsConfig;
use crate::migration::{LockBackend, LockError, MigrateError, MigrationReport, Migrator};
use crate::store::MigrationStore;
use std::time::Duration;

/// Retry behaviour of [`startup_migrations`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupPolicy {
    /// Additional attempts after a lock timeout
    pub retries: u32,
    /// Pause between attempts
    pub retry_delay: Duration,
}

impl Default for StartupPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl From<&MigrationsConfig> for StartupPolicy {
    fn from(config: &MigrationsConfig) -> Self {
        Self {
            retries: config.startup_retries,
            retry_delay: Duration::from_secs(config.startup_retry_delay_seconds),
        }
    }
}

/// Run migrations on application startup
///
/// Call this during initialization, before serving traffic. The first
/// replica to take the lease applies pending migrations; the others wait,
/// then find nothing left to do.
///
/// Only `LockError::Timeout` is retried. Every other failure is returned
/// immediately and the service should not start.
///
/// # Errors
///
/// Returns the last `MigrateError` once retries are exhausted, or the first
/// non-retryable one.
///
/// # Example
///
/// ```rust,no_run
/// use lockstep::config::LockstepConfig;
/// use lockstep::migration::{startup_migrations, StartupPolicy};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = LockstepConfig::load()?;
/// let migrator = lockstep::postgres_migrator(&config)?;
/// startup_migrations(&migrator, &StartupPolicy::from(&config.migrations))?;
/// # Ok(())
/// # }
/// ```
pub fn startup_migrations<S: MigrationStore, L: LockBackend>(
    migrator: &Migrator<S, L>,
    policy: &StartupPolicy,
) -> Result<MigrationReport, MigrateError> {
    let mut attempt = 0;
    loop {
        match migrator.run() {
            Ok(report) => {
                if report.is_noop() {
                    log::debug!("No pending migrations to apply");
                } else {
                    log::info!("Applied {} migration(s) on startup", report.applied.len());
                }
                return Ok(report);
            }
            Err(MigrateError::Lock(LockError::Timeout { name, waited }))
                if attempt < policy.retries =>
            {
                attempt += 1;
                log::debug!(
                    "Lock '{}' not acquired after {:?}, retry {}/{} in {:?}",
                    name,
                    waited,
                    attempt,
                    policy.retries,
                    policy.retry_delay
                );
                may::coroutine::sleep(policy.retry_delay);
            }
            Err(e) => return Err(e),
        }
    }
}
