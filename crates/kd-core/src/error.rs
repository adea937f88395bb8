//! Core error types.

use crate::backup_merge::MergeError;
use crate::lock::LeaseError;
use crate::store::StoreError;
use kd_models::{PodCommand, PodId, UserId};
use orchestrator_client::OrchestratorError;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in the KuberDock core.
#[derive(Debug, Error)]
pub enum KdError {
    /// Malformed input (bad CIDR, overlapping networks, bad autoblock list)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Every eligible address is allocated or blocked
    #[error("There are no free public IP-addresses, contact KuberDock administrator")]
    NoFreeIps,

    /// Network still has allocated addresses
    #[error("You cannot delete this network '{0}' while some of IP-addresses of this network are assigned to Pods")]
    NetworkInUse(String),

    /// Network is not registered
    #[error("Network '{0}' does not exist")]
    NetworkNotFound(String),

    /// Pod is not in the database
    #[error("Pod not found: {0}")]
    PodNotFound(PodId),

    /// User is not in the database
    #[error("User not found: {0}")]
    UserNotFound(UserId),

    /// Administrators and the internal user cannot be suspended
    #[error("User {0} cannot be suspended")]
    UserNotSuspendable(String),

    /// Another suspend/unsuspend for this user holds the per-user lock
    #[error("Suspension of user {0} is already in progress")]
    SuspensionInProgress(UserId),

    /// Pod lock is held by another operation
    #[error("Pod \"{pod_id}\" is locked by operation {operation}")]
    PodIsLocked {
        /// Locked pod
        pod_id: PodId,
        /// Operation holding the lock, as recorded in the lock payload
        operation: String,
    },

    /// Pod command did not complete in time; the pod is treated as not transitioned
    #[error("Pod {pod_id}: {} did not complete within {timeout:?}", .command.as_str())]
    OrchestratorTimeout {
        /// Pod the command was sent to
        pod_id: PodId,
        /// Command sent
        command: PodCommand,
        /// Bound that elapsed
        timeout: Duration,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Pod API error
    #[error("Pod API error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    /// Database error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Lease backend error
    #[error("Lease error: {0}")]
    Lease(#[from] LeaseError),

    /// Backup merge failure
    #[error("Merge error: {0}")]
    Merge(#[from] MergeError),
}
