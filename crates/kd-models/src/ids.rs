//! Identifiers and named sentinels

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Pod identifier (UUID, as issued by the pod API)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PodId(pub Uuid);

impl PodId {
    /// Generate a fresh random pod id
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for PodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for PodId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

/// User (tenant) identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Kube type (resource package unit) identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KubeTypeId(pub u32);

/// The kube type every package falls back to when a pod does not name one.
///
/// Billing fixtures historically relied on the row with id 0; code should
/// refer to this constant instead of the literal.
pub const DEFAULT_KUBE_TYPE: KubeTypeId = KubeTypeId(0);

impl Default for KubeTypeId {
    fn default() -> Self {
        DEFAULT_KUBE_TYPE
    }
}

/// Username of the service account that owns system pods.
pub const KUBERDOCK_INTERNAL_USER: &str = "kuberdock-internal";
