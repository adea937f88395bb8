//! KuberDock Core
//!
//! The parts of the control plane that carry real invariants:
//!
//! - [`ippool`]: public IP networks and at-most-once address allocation
//! - [`public_ip`]: binding a pod's public exposure to the IP pool
//! - [`suspension`]: all-or-nothing tenant suspend/unsuspend
//! - [`lock`]: TTL-bound exclusive locks over a lease backend
//! - [`backup_merge`]: folding time-windowed node backup snapshots together
//!
//! Collaborators are injected: the relational store ([`store::Store`]), the
//! pod API ([`orchestrator_client::OrchestratorClientTrait`]) and the lease
//! backend ([`lock::LeaseBackend`]).

pub mod backoff;
pub mod backup_merge;
pub mod config;
pub mod error;
pub mod ippool;
pub mod lock;
pub mod public_ip;
pub mod store;
pub mod suspension;

pub use backup_merge::{BackupMerger, MergeError, MergeOptions, MergeReport};
pub use config::KdConfig;
pub use error::KdError;
pub use ippool::{AllocationRequest, IpPool, NetworkSummary, NewNetwork};
pub use lock::{Blocking, ExclusiveLock, LeaseBackend, LockClient};
pub use public_ip::PublicIpAssigner;
pub use store::{MemoryStore, Store, StoreError, StoreTx};
pub use suspension::{SuspensionCoordinator, SuspensionReport, SuspensionSettings};
