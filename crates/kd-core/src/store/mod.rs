//! Relational store seam
//!
//! Every read-modify-write in the core runs inside one [`StoreTx`]. A
//! transaction that is dropped without [`StoreTx::commit`] leaves the store
//! untouched. Implementations must enforce the two uniqueness constraints
//! on allocation records (one record per address, one per pod) and report
//! violations as [`StoreError::Conflict`].

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use kd_models::{IpPoolNetwork, IpState, Pod, PodId, PodIp, User, UserId};
use thiserror::Error;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Uniqueness constraint violated
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Row to update does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Backend failure (connection lost, commit rejected)
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Opens transactions
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;
}

/// One database transaction
#[async_trait]
pub trait StoreTx: Send {
    /// All networks, ordered by network address
    async fn list_networks(&mut self) -> Result<Vec<IpPoolNetwork>, StoreError>;

    async fn get_network(&mut self, network: Ipv4Net) -> Result<Option<IpPoolNetwork>, StoreError>;

    /// Insert or replace a network
    async fn put_network(&mut self, network: IpPoolNetwork) -> Result<(), StoreError>;

    async fn delete_network(&mut self, network: Ipv4Net) -> Result<bool, StoreError>;

    /// All allocation records, ordered by address
    async fn list_pod_ips(&mut self) -> Result<Vec<PodIp>, StoreError>;

    async fn find_pod_ip(&mut self, pod_id: PodId) -> Result<Option<PodIp>, StoreError>;

    async fn find_pod_ip_by_address(&mut self, ip: u32) -> Result<Option<PodIp>, StoreError>;

    /// Insert an allocation record; duplicate address or pod is a `Conflict`
    async fn insert_pod_ip(&mut self, pod_ip: PodIp) -> Result<(), StoreError>;

    /// Remove the record for `ip`, returning it
    async fn delete_pod_ip(&mut self, ip: u32) -> Result<Option<PodIp>, StoreError>;

    /// Open an address usage interval
    async fn start_ip_state(
        &mut self,
        pod_id: PodId,
        ip: u32,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Close the open usage interval of `pod_id` on `ip`, if any
    async fn end_ip_state(
        &mut self,
        pod_id: PodId,
        ip: u32,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn list_ip_states(&mut self, pod_id: PodId) -> Result<Vec<IpState>, StoreError>;

    async fn get_pod(&mut self, id: PodId) -> Result<Option<Pod>, StoreError>;

    async fn list_pods(&mut self, owner: UserId) -> Result<Vec<Pod>, StoreError>;

    /// Insert or replace a pod
    async fn save_pod(&mut self, pod: Pod) -> Result<(), StoreError>;

    async fn get_user(&mut self, id: UserId) -> Result<Option<User>, StoreError>;

    /// Insert or replace a user
    async fn save_user(&mut self, user: User) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
