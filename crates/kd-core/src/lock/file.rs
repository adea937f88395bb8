//! File lease backend
//!
//! One JSON file per lease in a shared directory. A lease is created by
//! writing a private temp file and hard-linking it to the lease path, which
//! fails if the path exists; readers therefore never observe a partial file.
//!
//! An expired lease is replaced, never removed: the new record is renamed
//! over it, so the lease path is not empty at any point and plain creators
//! keep failing. Takeovers of one key are serialized by a guard file taken
//! the same way as a lease. A guard left by a crashed process expires after
//! [`GUARD_TTL`].

use super::{LeaseBackend, LeaseError, LeaseRecord};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

const LEASE_SUFFIX: &str = ".lock";
const GUARD_SUFFIX: &str = ".takeover";

/// Age after which a takeover guard is considered abandoned
pub const GUARD_TTL: Duration = Duration::from_secs(30);

/// Leases stored as files under `dir`
#[derive(Debug, Clone)]
pub struct FileLeaseBackend {
    dir: PathBuf,
}

impl FileLeaseBackend {
    /// Use `dir`, creating it if needed
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, LeaseError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| LeaseError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    fn path(&self, key: &str) -> PathBuf {
        let file: String = key
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
                _ => '_',
            })
            .collect();
        self.dir.join(format!("{}{}", file, LEASE_SUFFIX))
    }

    async fn read(path: &Path) -> Result<Option<LeaseRecord>, LeaseError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(LeaseError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    async fn remove(path: &Path) -> Result<(), LeaseError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(LeaseError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    fn guard_path(path: &Path) -> PathBuf {
        let mut guard = path.as_os_str().to_owned();
        guard.push(GUARD_SUFFIX);
        PathBuf::from(guard)
    }

    /// Replace an expired or unreadable lease at `path` with `record`.
    ///
    /// Returns `false` when the lease turns out to be live, or another
    /// process is taking it over.
    async fn take_over(
        &self,
        path: &Path,
        record: &LeaseRecord,
    ) -> Result<bool, LeaseError> {
        let guard = Self::guard_path(path);
        let guard_record =
            LeaseRecord::new(&record.key, &record.token, Some(GUARD_TTL), None)?;
        if !self.create(&guard, &guard_record).await? {
            if Self::read(&guard)
                .await?
                .is_none_or(|held| held.is_expired(Utc::now()))
            {
                warn!("Removing abandoned takeover guard {}", guard.display());
                Self::remove(&guard).await?;
            }
            return Ok(false);
        }

        let result = self.replace_expired(path, record).await;
        Self::remove(&guard).await?;
        result
    }

    async fn replace_expired(
        &self,
        path: &Path,
        record: &LeaseRecord,
    ) -> Result<bool, LeaseError> {
        let held = Self::read(path).await?;
        if Self::is_live(held.as_ref()) {
            return Ok(false);
        }
        // Released in the meantime
        if held.is_none() && self.create(path, record).await? {
            return Ok(true);
        }
        if Self::is_live(Self::read(path).await?.as_ref()) {
            return Ok(false);
        }

        let tmp = self.write_tmp(record).await?;
        let renamed = tokio::fs::rename(&tmp, path).await;
        if renamed.is_err() {
            Self::remove(&tmp).await?;
        }
        renamed.map_err(|source| LeaseError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(true)
    }

    fn is_live(held: Option<&LeaseRecord>) -> bool {
        held.is_some_and(|held| !held.is_expired(Utc::now()))
    }

    async fn write_tmp(&self, record: &LeaseRecord) -> Result<PathBuf, LeaseError> {
        let tmp = self.dir.join(format!(".{}.tmp", Uuid::new_v4()));
        let bytes = serde_json::to_vec(record)?;
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|source| LeaseError::Io {
                path: tmp.clone(),
                source,
            })?;
        Ok(tmp)
    }

    /// Publish `record` at `path` unless something is already there
    async fn create(&self, path: &Path, record: &LeaseRecord) -> Result<bool, LeaseError> {
        let tmp = self.write_tmp(record).await?;
        let linked = tokio::fs::hard_link(&tmp, path).await;
        Self::remove(&tmp).await?;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(source) => Err(LeaseError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

#[async_trait]
impl LeaseBackend for FileLeaseBackend {
    async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Option<Duration>,
        payload: Option<&Value>,
    ) -> Result<bool, LeaseError> {
        let record = LeaseRecord::new(key, token, ttl, payload)?;
        let path = self.path(key);

        if self.create(&path, &record).await? {
            return Ok(true);
        }

        // Unreadable files are leftovers of a crashed writer
        if Self::is_live(Self::read(&path).await?.as_ref()) {
            return Ok(false);
        }
        let taken = self.take_over(&path, &record).await?;
        if taken {
            debug!("Took over expired lease {}", key);
        }
        Ok(taken)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, LeaseError> {
        let path = self.path(key);
        match Self::read(&path).await? {
            Some(held) if held.token == token => {
                Self::remove(&path).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<LeaseRecord>, LeaseError> {
        Ok(Self::read(&self.path(key))
            .await?
            .filter(|held| !held.is_expired(Utc::now())))
    }

    async fn clean(&self, prefix: &str) -> Result<usize, LeaseError> {
        let io_err = |source| LeaseError::Io {
            path: self.dir.clone(),
            source,
        };
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(io_err)?;
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if !path.to_string_lossy().ends_with(LEASE_SUFFIX) {
                continue;
            }
            if let Some(record) = Self::read(&path).await?
                && record.key.starts_with(prefix)
            {
                Self::remove(&path).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
