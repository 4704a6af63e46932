//! Lease-based migration lock
//!
//! A lock is a row in the store's lock table naming the owner and the instant
//! its lease expires. Whoever inserts the row, or finds it expired and takes it
//! over, holds the lock. A crashed holder never blocks the cluster for longer
//! than one lease.

use crate::config::MigrationsConfig;
use crate::migration::LockError;
use crate::store::StoreError;
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;
#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

/// Outcome of a single claim attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseClaim {
    /// The lease row now names the caller
    Granted { expires_at: DateTime<Utc> },
    /// Another owner holds an unexpired lease
    Held {
        holder: String,
        expires_at: DateTime<Utc>,
    },
}

/// Current occupant of a lock row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseHolder {
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LeaseHolder {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Storage for lease rows
///
/// Each method is a single atomic statement against the store. Claiming an
/// expired lease or re-claiming one's own lease both succeed.
pub trait LockBackend {
    /// Insert the lease row, or take it over if expired or already ours
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the store cannot be reached.
    fn try_claim(&self, name: &str, owner: &str, lease: Duration) -> Result<LeaseClaim, StoreError>;

    /// Push out the expiry of a lease still owned by `owner`
    ///
    /// Returns the new expiry, or `None` if the row is gone or names someone else.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the store cannot be reached.
    fn extend(
        &self,
        name: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Delete the lease row if it still names `owner`
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the store cannot be reached.
    fn release(&self, name: &str, owner: &str) -> Result<bool, StoreError>;

    /// Read the lease row, expired or not
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the store cannot be reached.
    fn holder(&self, name: &str) -> Result<Option<LeaseHolder>, StoreError>;
}

/// A held lease
#[derive(Debug, PartialEq, Eq)]
pub struct Lock {
    name: String,
    owner: String,
    lease: Duration,
    expires_at: DateTime<Utc>,
}

impl Lock {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Expiry as of the last acquire or renew
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

/// Waiting behaviour of [`LockCoordinator::acquire`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOptions {
    /// Give up with `LockError::Timeout` after this long
    pub acquire_timeout: Duration,
    /// First delay between attempts
    pub initial_backoff: Duration,
    /// Upper bound for the doubling delay
    pub max_backoff: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(60),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl From<&MigrationsConfig> for LockOptions {
    fn from(config: &MigrationsConfig) -> Self {
        Self {
            acquire_timeout: Duration::from_secs(config.lock_timeout_seconds),
            initial_backoff: Duration::from_millis(config.backoff_initial_ms),
            max_backoff: Duration::from_millis(
                config.backoff_max_ms.max(config.backoff_initial_ms),
            ),
        }
    }
}

/// Hands out leases from a [`LockBackend`]
pub struct LockCoordinator<B> {
    backend: B,
    options: LockOptions,
}

impl<B: LockBackend> LockCoordinator<B> {
    pub fn new(backend: B, options: LockOptions) -> Self {
        Self { backend, options }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// Make one attempt to take the lease
    ///
    /// # Errors
    ///
    /// Returns `LockError::AlreadyHeld` if another owner holds an unexpired
    /// lease, or `LockError::Store` if the store fails.
    pub fn try_acquire(&self, name: &str, owner: &str, lease: Duration) -> Result<Lock, LockError> {
        match self.backend.try_claim(name, owner, lease)? {
            LeaseClaim::Granted { expires_at } => Ok(Lock {
                name: name.to_string(),
                owner: owner.to_string(),
                lease,
                expires_at,
            }),
            LeaseClaim::Held { holder, expires_at } => Err(LockError::AlreadyHeld {
                name: name.to_string(),
                holder,
                expires_at,
            }),
        }
    }

    /// Take the lease, waiting with exponential backoff while it is held
    ///
    /// The wait uses `may::coroutine::sleep`, which parks only the calling
    /// coroutine when called from one.
    ///
    /// # Errors
    ///
    /// Returns `LockError::Timeout` once `acquire_timeout` has passed, or
    /// `LockError::Store` if the store fails.
    pub fn acquire(&self, name: &str, owner: &str, lease: Duration) -> Result<Lock, LockError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::acquire_lock_span(name).entered();

        let start = Instant::now();
        let mut backoff = self.options.initial_backoff;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.try_acquire(name, owner, lease) {
                Ok(lock) => {
                    #[cfg(feature = "metrics")]
                    METRICS.observe_lock_wait(start.elapsed());

                    log::info!(
                        "Acquired lock '{}' as '{}' after {} attempt(s), lease expires at {}",
                        name,
                        owner,
                        attempts,
                        lock.expires_at
                    );
                    return Ok(lock);
                }
                Err(LockError::AlreadyHeld { holder, expires_at, .. }) => {
                    let elapsed = start.elapsed();
                    if elapsed >= self.options.acquire_timeout {
                        return Err(LockError::Timeout {
                            name: name.to_string(),
                            waited: elapsed,
                        });
                    }

                    log::debug!(
                        "Lock '{}' held by '{}' until {}, retrying in {:?}",
                        name,
                        holder,
                        expires_at,
                        backoff
                    );

                    let remaining = self.options.acquire_timeout - elapsed;
                    may::coroutine::sleep(backoff.min(remaining));
                    backoff = (backoff * 2).min(self.options.max_backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Extend a held lease by its original duration
    ///
    /// # Errors
    ///
    /// Returns `LockError::Lost` if the lease expired and was taken over or
    /// removed, or `LockError::Store` if the store fails.
    pub fn renew(&self, lock: &mut Lock) -> Result<(), LockError> {
        match self.backend.extend(&lock.name, &lock.owner, lock.lease)? {
            Some(expires_at) => {
                lock.expires_at = expires_at;
                Ok(())
            }
            None => {
                log::warn!("Lease on lock '{}' held by '{}' was lost", lock.name, lock.owner);
                Err(LockError::Lost {
                    name: lock.name.clone(),
                    owner: lock.owner.clone(),
                })
            }
        }
    }

    /// Give up a held lease
    ///
    /// A lease that was already taken over is left alone.
    ///
    /// # Errors
    ///
    /// Returns `LockError::Store` if the store fails.
    pub fn release(&self, lock: Lock) -> Result<(), LockError> {
        if self.backend.release(&lock.name, &lock.owner)? {
            log::info!("Released lock '{}' held by '{}'", lock.name, lock.owner);
        } else {
            log::warn!(
                "Lock '{}' no longer belonged to '{}' at release",
                lock.name,
                lock.owner
            );
        }
        Ok(())
    }

    /// Current occupant of the lock row, if any
    ///
    /// # Errors
    ///
    /// Returns `LockError::Store` if the store fails.
    pub fn holder(&self, name: &str) -> Result<Option<LeaseHolder>, LockError> {
        Ok(self.backend.holder(name)?)
    }

    /// Wrap a lease so it is released when the guard goes out of scope
    pub fn guard(&self, lock: Lock) -> LockGuard<'_, B> {
        LockGuard {
            coordinator: self,
            lock: Some(lock),
        }
    }
}

/// Releases its lease when dropped
///
/// Drop cannot report errors; call [`LockGuard::release`] to see them.
pub struct LockGuard<'c, B: LockBackend> {
    coordinator: &'c LockCoordinator<B>,
    lock: Option<Lock>,
}

impl<B: LockBackend> LockGuard<'_, B> {
    pub fn lock(&self) -> Option<&Lock> {
        self.lock.as_ref()
    }

    /// # Errors
    ///
    /// Returns `LockError::Lost` if the lease was taken over.
    pub fn renew(&mut self) -> Result<(), LockError> {
        match self.lock.as_mut() {
            Some(lock) => self.coordinator.renew(lock),
            None => Ok(()),
        }
    }

    /// # Errors
    ///
    /// Returns `LockError::Store` if the store fails.
    pub fn release(mut self) -> Result<(), LockError> {
        match self.lock.take() {
            Some(lock) => self.coordinator.release(lock),
            None => Ok(()),
        }
    }
}

impl<B: LockBackend> Drop for LockGuard<'_, B> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            if let Err(e) = self.coordinator.release(lock) {
                log::warn!("Failed to release migration lock: {}", e);
            }
        }
    }
}

/// Owner identity for this process: `{hostname}-{pid}-{uuid}`
#[must_use]
pub fn default_owner() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}-{}-{}", host, std::process::id(), uuid::Uuid::new_v4().simple())
}
