//! Per-pod operation locks
//!
//! At most one lifecycle operation runs on a pod at a time. The lock is
//! named `POD.<id>` and its payload records the operation holding it so a
//! refused caller can say what is in the way.

use super::{Blocking, ExclusiveLock, LockClient};
use crate::error::KdError;
use kd_models::PodId;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

/// Bound on a pod operation lock when the caller has no better estimate
pub const DEFAULT_POD_OPERATION_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Operations that take a pod lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodOperation {
    /// Start a stopped pod
    Start,
    /// Stop a running pod
    Stop,
}

impl PodOperation {
    /// Name recorded in the lock payload
    pub fn as_str(self) -> &'static str {
        match self {
            PodOperation::Start => "start",
            PodOperation::Stop => "stop",
        }
    }
}

fn lock_name(pod_id: PodId) -> String {
    format!("POD.{}", pod_id)
}

/// Take the lock of `pod_id` for `operation`.
///
/// Tries `retry_count + 1` times, `retry_pause` apart. When every attempt
/// fails the error names the operation recorded by the current holder.
pub async fn pod_lock(
    locks: &LockClient,
    pod_id: PodId,
    operation: PodOperation,
    ttl: Duration,
    retry_count: u32,
    retry_pause: Duration,
) -> Result<ExclusiveLock, KdError> {
    let name = lock_name(pod_id);
    let payload = json!({ "operation": operation.as_str() });

    for attempt in 0..=retry_count {
        if attempt > 0 {
            tokio::time::sleep(retry_pause).await;
        }
        if let Some(lock) = locks
            .acquire_with_payload(&name, Some(ttl), Blocking::No, Some(payload.clone()))
            .await?
        {
            return Ok(lock);
        }
        debug!(
            "Pod {} is locked, attempt {}/{}",
            pod_id,
            attempt + 1,
            retry_count + 1
        );
    }

    let operation = locks
        .payload(&name)
        .await?
        .and_then(|p| p.get("operation").and_then(|o| o.as_str()).map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string());
    Err(KdError::PodIsLocked { pod_id, operation })
}
