//! Exclusive locks
//!
//! A lock is a named lease in a [`LeaseBackend`] carrying a random owner
//! token and an optional TTL. Only the holder's token can release it; an
//! expired lease can be taken by anyone. Every lock key carries the
//! [`LOCK_PREFIX`] so [`LockClient::clean_locks`] never touches other keys.

pub mod file;
pub mod memory;
pub mod pod_lock;

pub use file::FileLeaseBackend;
pub use memory::MemoryLeaseBackend;
pub use pod_lock::{pod_lock, PodOperation, DEFAULT_POD_OPERATION_TIMEOUT};

use crate::backoff::FibonacciBackoff;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Prefix of every lock key
pub const LOCK_PREFIX: &str = "kd.exclusivelock.";

/// TTL of the check lease taken by [`LockClient::is_acquired`]
const CHECK_TTL: Duration = Duration::from_secs(1);

/// Lease backend errors
#[derive(Debug, Error)]
pub enum LeaseError {
    /// Lease file could not be read or written
    #[error("I/O error on {}: {}", .path.display(), .source)]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Lease record could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TTL does not fit a timestamp
    #[error("TTL out of range: {0:?}")]
    InvalidTtl(Duration),
}

/// A stored lease
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Full lock key, prefix included
    pub key: String,
    /// Random token of the holder
    pub token: String,
    /// Expiry; `None` never expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Data left by the holder for other workers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl LeaseRecord {
    /// Build a record expiring `ttl` from now
    pub fn new(
        key: &str,
        token: &str,
        ttl: Option<Duration>,
        payload: Option<&Value>,
    ) -> Result<Self, LeaseError> {
        let expires_at = ttl
            .map(|ttl| {
                chrono::Duration::from_std(ttl)
                    .ok()
                    .and_then(|ttl| Utc::now().checked_add_signed(ttl))
                    .ok_or(LeaseError::InvalidTtl(ttl))
            })
            .transpose()?;
        Ok(Self {
            key: key.to_string(),
            token: token.to_string(),
            expires_at,
            payload: payload.cloned(),
        })
    }

    /// Whether the lease has run out at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Atomic set-if-absent storage with expiry
#[async_trait]
pub trait LeaseBackend: Send + Sync {
    /// Create the lease unless a live one exists. Returns whether it was created.
    async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Option<Duration>,
        payload: Option<&Value>,
    ) -> Result<bool, LeaseError>;

    /// Delete the lease if it is still owned by `token`
    async fn release(&self, key: &str, token: &str) -> Result<bool, LeaseError>;

    /// Live lease stored under `key`
    async fn get(&self, key: &str) -> Result<Option<LeaseRecord>, LeaseError>;

    /// Delete every lease whose key starts with `prefix`; returns how many
    async fn clean(&self, prefix: &str) -> Result<usize, LeaseError>;
}

/// How long [`LockClient::acquire`] may wait for a held lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocking {
    /// Fail immediately
    No,
    /// Poll until the lock is free or the deadline passes
    For(Duration),
}

/// Creates [`ExclusiveLock`]s over a lease backend
#[derive(Clone)]
pub struct LockClient {
    backend: Arc<dyn LeaseBackend>,
    poll_min: Duration,
    poll_max: Duration,
}

impl LockClient {
    /// Client over `backend` with the default polling bounds
    pub fn new(backend: Arc<dyn LeaseBackend>) -> Self {
        Self {
            backend,
            poll_min: Duration::from_millis(100),
            poll_max: Duration::from_secs(5),
        }
    }

    /// Bounds of the Fibonacci delay between polls of a held lock
    pub fn with_polling(mut self, min: Duration, max: Duration) -> Self {
        self.poll_min = min;
        self.poll_max = max;
        self
    }

    fn key(name: &str) -> String {
        format!("{}{}", LOCK_PREFIX, name)
    }

    /// Acquire `name`. `None` means another owner holds it.
    pub async fn acquire(
        &self,
        name: &str,
        ttl: Option<Duration>,
        blocking: Blocking,
    ) -> Result<Option<ExclusiveLock>, LeaseError> {
        self.acquire_with_payload(name, ttl, blocking, None).await
    }

    /// Acquire `name`, storing `payload` alongside the lease
    pub async fn acquire_with_payload(
        &self,
        name: &str,
        ttl: Option<Duration>,
        blocking: Blocking,
        payload: Option<Value>,
    ) -> Result<Option<ExclusiveLock>, LeaseError> {
        let key = Self::key(name);
        let token = Uuid::new_v4().to_string();
        let deadline = match blocking {
            Blocking::No => None,
            Blocking::For(wait) => Some(Instant::now() + wait),
        };
        let mut backoff = FibonacciBackoff::new(self.poll_min, self.poll_max);

        loop {
            if self
                .backend
                .try_acquire(&key, &token, ttl, payload.as_ref())
                .await?
            {
                debug!("Acquired lock {}", name);
                return Ok(Some(ExclusiveLock {
                    backend: Arc::clone(&self.backend),
                    name: name.to_string(),
                    key,
                    token,
                    released: false,
                }));
            }

            let Some(deadline) = deadline else {
                return Ok(None);
            };
            let now = Instant::now();
            if now >= deadline {
                debug!("Gave up waiting for lock {}", name);
                return Ok(None);
            }
            tokio::time::sleep(backoff.next_backoff().min(deadline - now)).await;
        }
    }

    /// Whether some owner currently holds `name`.
    ///
    /// Takes and drops a short-lived lease so that the answer is race-free at
    /// the moment of the check.
    pub async fn is_acquired(&self, name: &str) -> Result<bool, LeaseError> {
        let key = Self::key(name);
        let token = Uuid::new_v4().to_string();
        if self
            .backend
            .try_acquire(&key, &token, Some(CHECK_TTL), None)
            .await?
        {
            self.backend.release(&key, &token).await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Payload stored with the live lock `name`
    pub async fn payload(&self, name: &str) -> Result<Option<Value>, LeaseError> {
        Ok(self
            .backend
            .get(&Self::key(name))
            .await?
            .and_then(|record| record.payload))
    }

    /// Drop every lock whose name starts with `pattern` (all locks for `None`)
    pub async fn clean_locks(&self, pattern: Option<&str>) -> Result<usize, LeaseError> {
        let prefix = Self::key(pattern.unwrap_or_default());
        let removed = self.backend.clean(&prefix).await?;
        if removed > 0 {
            warn!("Removed {} lock(s) matching {}", removed, prefix);
        }
        Ok(removed)
    }

    /// Run `f` while holding `name`; `Ok(None)` if the lock was not acquired.
    pub async fn run_exclusive<T, E, F, Fut>(
        &self,
        name: &str,
        ttl: Option<Duration>,
        blocking: Blocking,
        f: F,
    ) -> Result<Option<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LeaseError>,
    {
        let Some(lock) = self.acquire(name, ttl, blocking).await? else {
            return Ok(None);
        };
        let result = f().await;
        lock.release_logged().await;
        result.map(Some)
    }
}

/// A held lock.
///
/// Release explicitly with [`ExclusiveLock::release`]. A guard dropped
/// while held schedules a release on the current runtime; without a
/// runtime the lease simply runs out its TTL.
pub struct ExclusiveLock {
    backend: Arc<dyn LeaseBackend>,
    name: String,
    key: String,
    token: String,
    released: bool,
}

impl std::fmt::Debug for ExclusiveLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusiveLock")
            .field("name", &self.name)
            .field("released", &self.released)
            .finish()
    }
}

impl ExclusiveLock {
    /// Lock name, without the key prefix
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the lock. Returns `false` if it had expired and was taken over.
    pub async fn release(mut self) -> Result<bool, LeaseError> {
        self.released = true;
        let owned = self.backend.release(&self.key, &self.token).await?;
        if owned {
            debug!("Released lock {}", self.name);
        } else {
            warn!("Lock {} expired before release", self.name);
        }
        Ok(owned)
    }

    /// Release, logging instead of returning a backend error
    pub async fn release_logged(self) {
        let name = self.name.clone();
        if let Err(e) = self.release().await {
            warn!("Failed to release lock {}: {}", name, e);
        }
    }
}

impl Drop for ExclusiveLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("Lock {} dropped outside a runtime; left to expire", self.name);
            return;
        };
        let backend = Arc::clone(&self.backend);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        let name = std::mem::take(&mut self.name);
        handle.spawn(async move {
            if let Err(e) = backend.release(&key, &token).await {
                warn!("Failed to release dropped lock {}: {}", name, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> LockClient {
        LockClient::new(Arc::new(MemoryLeaseBackend::new()))
            .with_polling(Duration::from_millis(5), Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let locks = client();

        let held = locks.acquire("job", None, Blocking::No).await.unwrap();
        assert!(held.is_some());
        assert!(locks.acquire("job", None, Blocking::No).await.unwrap().is_none());
        assert!(locks.is_acquired("job").await.unwrap());

        assert!(held.unwrap().release().await.unwrap());
        assert!(!locks.is_acquired("job").await.unwrap());
        assert!(locks.acquire("job", None, Blocking::No).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_has_one_winner() {
        let locks = client();
        let ttl = Some(Duration::from_secs(60));

        let (a, b) = tokio::join!(
            locks.acquire("x", ttl, Blocking::No),
            locks.acquire("x", ttl, Blocking::No)
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(a.is_some() ^ b.is_some());
        let winner = a.or(b).unwrap();
        assert!(locks.acquire("x", ttl, Blocking::No).await.unwrap().is_none());
        winner.release().await.unwrap();
        assert!(locks.acquire("x", ttl, Blocking::No).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_is_acquired_does_not_leave_lock_behind() {
        let locks = client();
        assert!(!locks.is_acquired("checked").await.unwrap());
        assert!(locks.acquire("checked", None, Blocking::No).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ttl_expiry_allows_takeover() {
        let locks = client();

        let stale = locks
            .acquire("ttl", Some(Duration::from_millis(50)), Blocking::No)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let fresh = locks.acquire("ttl", None, Blocking::No).await.unwrap();
        assert!(fresh.is_some());
        // The stale holder must not release the new owner's lease.
        assert!(!stale.release().await.unwrap());
        assert!(locks.is_acquired("ttl").await.unwrap());
    }

    #[tokio::test]
    async fn test_blocking_acquire_waits_for_release() {
        let locks = client();
        let held = locks.acquire("wait", None, Blocking::No).await.unwrap().unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .acquire("wait", None, Blocking::For(Duration::from_secs(2)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        held.release().await.unwrap();

        assert!(waiter.await.unwrap().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_blocking_acquire_times_out() {
        let locks = client();
        let _held = locks.acquire("busy", None, Blocking::No).await.unwrap().unwrap();

        let started = Instant::now();
        let result = locks
            .acquire("busy", None, Blocking::For(Duration::from_millis(60)))
            .await
            .unwrap();

        assert!(result.is_none());
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_payload_and_clean() {
        let locks = client();
        let _a = locks
            .acquire_with_payload("POD.a", None, Blocking::No, Some(json!({"operation": "stop"})))
            .await
            .unwrap()
            .unwrap();
        let _b = locks.acquire("other", None, Blocking::No).await.unwrap().unwrap();

        assert_eq!(
            locks.payload("POD.a").await.unwrap(),
            Some(json!({"operation": "stop"}))
        );
        assert_eq!(locks.clean_locks(Some("POD.")).await.unwrap(), 1);
        assert!(!locks.is_acquired("POD.a").await.unwrap());
        assert!(locks.is_acquired("other").await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_guard_is_released() {
        let locks = client();
        drop(locks.acquire("dropped", None, Blocking::No).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!locks.is_acquired("dropped").await.unwrap());
    }

    #[tokio::test]
    async fn test_run_exclusive_skips_when_held() {
        let locks = client();
        let _held = locks.acquire("run", None, Blocking::No).await.unwrap().unwrap();

        let ran: Result<Option<u32>, LeaseError> = locks
            .run_exclusive("run", None, Blocking::No, || async { Ok(1) })
            .await;
        assert!(ran.unwrap().is_none());
    }
}
