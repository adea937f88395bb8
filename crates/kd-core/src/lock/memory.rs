//! Process-local lease backend

use super::{LeaseBackend, LeaseError, LeaseRecord};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

/// Leases kept in a map; shares locks between tasks of one process
#[derive(Debug, Default)]
pub struct MemoryLeaseBackend {
    leases: Mutex<HashMap<String, LeaseRecord>>,
}

impl MemoryLeaseBackend {
    /// Empty backend
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseBackend for MemoryLeaseBackend {
    async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Option<Duration>,
        payload: Option<&Value>,
    ) -> Result<bool, LeaseError> {
        let record = LeaseRecord::new(key, token, ttl, payload)?;
        let mut leases = self.leases.lock().await;
        if leases
            .get(key)
            .is_some_and(|held| !held.is_expired(Utc::now()))
        {
            return Ok(false);
        }
        leases.insert(key.to_string(), record);
        Ok(true)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, LeaseError> {
        let mut leases = self.leases.lock().await;
        match leases.get(key) {
            Some(held) if held.token == token => {
                leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<LeaseRecord>, LeaseError> {
        let leases = self.leases.lock().await;
        Ok(leases
            .get(key)
            .filter(|held| !held.is_expired(Utc::now()))
            .cloned())
    }

    async fn clean(&self, prefix: &str) -> Result<usize, LeaseError> {
        let mut leases = self.leases.lock().await;
        let before = leases.len();
        leases.retain(|key, _| !key.starts_with(prefix));
        Ok(before - leases.len())
    }
}
