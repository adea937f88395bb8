//! User records and suspension state

use crate::ids::{PodId, UserId, KUBERDOCK_INTERNAL_USER};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// User role (only the distinction the core needs)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum Role {
    /// Platform administrator
    Admin,
    /// Regular tenant
    #[default]
    User,
}

/// Per-user suspension state machine
///
/// `Active -> Suspending -> Suspended -> Unsuspending -> Active`.
/// The transitional states are only observable while a suspend/unsuspend
/// is in flight or after it failed part-way; rerunning the operation
/// resumes from there.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum SuspensionState {
    /// Pods may run and hold public IPs
    #[default]
    Active,
    /// Pods are being stopped and their IPs reclaimed
    Suspending,
    /// All pods are stopped and hold no public IP
    Suspended,
    /// IPs are being restored and pods restarted
    Unsuspending,
}

/// User record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User id
    pub id: UserId,
    /// Login name
    pub username: String,
    /// Role
    #[serde(default)]
    pub role: Role,
    /// Suspension state
    #[serde(default)]
    pub suspension: SuspensionState,
    /// Pods that were running when the user got suspended; restarted on unsuspend
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub stopped_by_suspension: BTreeSet<PodId>,
}

impl User {
    /// Build an active regular user
    pub fn new(id: UserId, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            role: Role::User,
            suspension: SuspensionState::Active,
            stopped_by_suspension: BTreeSet::new(),
        }
    }

    /// Administrators and the internal service user cannot be suspended.
    pub fn is_suspendable(&self) -> bool {
        self.role != Role::Admin && self.username != KUBERDOCK_INTERNAL_USER
    }
}
