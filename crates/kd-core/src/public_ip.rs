//! Public IP assignment for pods
//!
//! Keeps a pod's configuration and the pool in agreement: a pod has a live
//! public address in its config exactly when the pool holds an allocation
//! record for it. Revocation keeps the old address in the config's shadow
//! fields so a later assignment can ask for it back.
//!
//! Pool and config changes run in separate transactions; whichever step
//! fails second is compensated so that a failure leaves neither a config
//! pointing at an unallocated address nor an allocation nobody uses.

use crate::error::KdError;
use crate::ippool::{AllocationRequest, IpPool};
use crate::store::Store;
use kd_models::{Pod, PodId, PublicIp};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Assigns and revokes pod public addresses against an [`IpPool`]
#[derive(Clone)]
pub struct PublicIpAssigner {
    pool: IpPool,
    store: Arc<dyn Store>,
    fixed_ip_pools: bool,
}

impl PublicIpAssigner {
    /// `fixed_ip_pools` restricts allocation to networks bound to the pod's node
    pub fn new(store: Arc<dyn Store>, fixed_ip_pools: bool) -> Self {
        Self {
            pool: IpPool::new(Arc::clone(&store)),
            store,
            fixed_ip_pools,
        }
    }

    /// Underlying address pool
    pub fn pool(&self) -> &IpPool {
        &self.pool
    }

    /// Current database copy of a pod
    pub async fn load_pod(&self, pod_id: PodId) -> Result<Pod, KdError> {
        let mut tx = self.store.begin().await?;
        tx.get_pod(pod_id).await?.ok_or(KdError::PodNotFound(pod_id))
    }

    async fn save_pod(&self, pod: Pod) -> Result<(), KdError> {
        let mut tx = self.store.begin().await?;
        tx.save_pod(pod).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Give a pod a public address.
    ///
    /// A pod with a live address keeps it. A pod whose address was freed
    /// asks for the same address back and gets the lowest free one if it
    /// is gone. A pod without public ports gets nothing.
    pub async fn assign(&self, pod_id: PodId) -> Result<Option<Ipv4Addr>, KdError> {
        let pod = self.load_pod(pod_id).await?;

        let preferred = match pod.config.public_ip() {
            PublicIp::Assigned(ip) => {
                if self
                    .pool
                    .find_by_pod(pod_id)
                    .await?
                    .is_some_and(|record| record.addr() == ip)
                {
                    return Ok(Some(ip));
                }
                warn!("Pod {} claims {} without an allocation, reallocating", pod_id, ip);
                Some(ip)
            }
            PublicIp::Freed(ip) => Some(ip),
            PublicIp::Unassigned => {
                if !pod.config.has_public_ports() {
                    return Ok(None);
                }
                None
            }
        };

        let request = AllocationRequest {
            pod_id,
            owner_id: pod.owner_id,
            preferred,
            node: if self.fixed_ip_pools {
                pod.config.node.clone()
            } else {
                None
            },
        };
        let ip = self.pool.allocate(&request).await?;
        if let Some(previous) = preferred.filter(|previous| *previous != ip) {
            info!("{} is no longer free, pod {} gets {}", previous, pod_id, ip);
        }

        let mut updated = pod;
        updated.config.assign_public_ip(ip);
        if let Err(e) = self.save_pod(updated).await {
            error!("Failed to store {} in pod {}: {}", ip, pod_id, e);
            if let Err(release_err) = self.pool.release(ip).await {
                error!("Failed to release {} after error: {}", ip, release_err);
            }
            return Err(e);
        }

        info!("Assigned public IP {} to pod {}", ip, pod_id);
        Ok(Some(ip))
    }

    /// Take a pod's public address back into the pool.
    ///
    /// The address moves to the shadow fields of the config. Revoking a pod
    /// without a live address is a no-op.
    pub async fn revoke(&self, pod_id: PodId) -> Result<Option<Ipv4Addr>, KdError> {
        let pod = self.load_pod(pod_id).await?;

        let mut updated = pod.clone();
        let Some(ip) = updated.config.free_public_ip() else {
            if let Some(stray) = self.pool.find_by_pod(pod_id).await? {
                warn!("Pod {} has no public IP but holds {}, releasing", pod_id, stray.addr());
                self.pool.release(stray.addr()).await?;
            }
            return Ok(None);
        };

        self.save_pod(updated).await?;
        if let Err(e) = self.pool.release(ip).await {
            error!("Failed to release {} of pod {}: {}", ip, pod_id, e);
            if let Err(restore_err) = self.save_pod(pod).await {
                error!("Failed to restore config of pod {}: {}", pod_id, restore_err);
            }
            return Err(e);
        }

        info!("Revoked public IP {} from pod {}", ip, pod_id);
        Ok(Some(ip))
    }

    /// Undo an [`assign`](Self::assign): put back the config the pod had in
    /// `previous`, then release whatever it holds now.
    ///
    /// The config is written first. If the release then fails the pod is
    /// left with a stray allocation, which the next [`revoke`](Self::revoke)
    /// cleans up, never with a live address the pool does not hold.
    pub async fn rollback_assign(&self, previous: &Pod) -> Result<(), KdError> {
        let mut restored = self.load_pod(previous.id).await?;
        restored.config = previous.config.clone();
        self.save_pod(restored).await?;

        let keep = previous.config.live_ip();
        if let Some(record) = self.pool.find_by_pod(previous.id).await?
            && Some(record.addr()) != keep
        {
            self.pool.release(record.addr()).await?;
        }
        info!("Rolled back public IP of pod {}", previous.id);
        Ok(())
    }

    /// Drop a pod's address for good, shadow included
    pub async fn release_for_deletion(&self, pod_id: PodId) -> Result<Option<Ipv4Addr>, KdError> {
        let mut pod = self.load_pod(pod_id).await?;
        let released = match self.pool.find_by_pod(pod_id).await? {
            Some(record) => {
                self.pool.release(record.addr()).await?;
                Some(record.addr())
            }
            None => None,
        };
        if pod.config.public_ip() != PublicIp::Unassigned {
            pod.config.clear_public_ip();
            self.save_pod(pod).await?;
        }
        Ok(released)
    }

    /// Revoke whatever pod holds `ip`. Returns that pod.
    pub async fn unbind(&self, ip: Ipv4Addr) -> Result<Option<PodId>, KdError> {
        let Some(record) = self.pool.find_by_address(ip).await? else {
            return Ok(None);
        };
        self.revoke(record.pod_id).await?;
        Ok(Some(record.pod_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ippool::NewNetwork;
    use crate::store::MemoryStore;
    use kd_models::{ContainerSpec, PortSpec, UserId};

    async fn setup(cidr: &str) -> (MemoryStore, PublicIpAssigner) {
        let store = MemoryStore::new();
        let assigner = PublicIpAssigner::new(Arc::new(store.clone()), false);
        assigner
            .pool()
            .create(NewNetwork {
                network: cidr.to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        (store, assigner)
    }

    async fn add_pod(store: &MemoryStore, ports: Vec<PortSpec>) -> Pod {
        let pod = Pod::new(
            UserId(1),
            "web",
            vec![ContainerSpec {
                name: "app".to_string(),
                image: "nginx".to_string(),
                ports,
            }],
        );
        let mut tx = store.begin().await.unwrap();
        tx.save_pod(pod.clone()).await.unwrap();
        tx.commit().await.unwrap();
        pod
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_assign_revoke_reassign_same_address() {
        let (store, assigner) = setup("10.0.0.0/29").await;
        let pod = add_pod(&store, vec![PortSpec::public(80)]).await;

        assert_eq!(assigner.assign(pod.id).await.unwrap(), Some(ip("10.0.0.1")));
        assert_eq!(assigner.assign(pod.id).await.unwrap(), Some(ip("10.0.0.1")));

        assert_eq!(assigner.revoke(pod.id).await.unwrap(), Some(ip("10.0.0.1")));
        let revoked = assigner.load_pod(pod.id).await.unwrap();
        assert_eq!(revoked.config.public_ip(), PublicIp::Freed(ip("10.0.0.1")));
        assert!(revoked.config.has_freed_ports());
        assert!(assigner.pool().find_by_pod(pod.id).await.unwrap().is_none());
        assert_eq!(assigner.revoke(pod.id).await.unwrap(), None);

        assert_eq!(assigner.assign(pod.id).await.unwrap(), Some(ip("10.0.0.1")));
        let mut expected = pod.config.clone();
        expected.assign_public_ip(ip("10.0.0.1"));
        assert_eq!(assigner.load_pod(pod.id).await.unwrap().config, expected);
    }

    #[tokio::test]
    async fn test_private_pod_gets_nothing() {
        let (store, assigner) = setup("10.0.0.0/29").await;
        let pod = add_pod(&store, vec![PortSpec::private(5432)]).await;

        assert_eq!(assigner.assign(pod.id).await.unwrap(), None);
        assert!(assigner.pool().user_addresses(UserId(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_freed_address_taken_falls_back() {
        let (store, assigner) = setup("10.0.0.0/29").await;
        let pod = add_pod(&store, vec![PortSpec::public(80)]).await;
        let other = add_pod(&store, vec![PortSpec::public(80)]).await;

        assigner.assign(pod.id).await.unwrap();
        assigner.revoke(pod.id).await.unwrap();
        assert_eq!(assigner.assign(other.id).await.unwrap(), Some(ip("10.0.0.1")));

        assert_eq!(assigner.assign(pod.id).await.unwrap(), Some(ip("10.0.0.2")));
    }

    #[tokio::test]
    async fn test_failed_config_save_releases_address() {
        let (store, assigner) = setup("10.0.0.0/29").await;
        let pod = add_pod(&store, vec![PortSpec::public(80)]).await;

        store.fail_next_pod_saves(1);
        assert!(assigner.assign(pod.id).await.is_err());

        assert!(assigner.pool().find_by_pod(pod.id).await.unwrap().is_none());
        let unchanged = assigner.load_pod(pod.id).await.unwrap();
        assert_eq!(unchanged.config, pod.config);
    }

    #[tokio::test]
    async fn test_unbind_and_release_for_deletion() {
        let (store, assigner) = setup("10.0.0.0/29").await;
        let pod = add_pod(&store, vec![PortSpec::public(80)]).await;
        let held = assigner.assign(pod.id).await.unwrap().unwrap();

        assert_eq!(assigner.unbind(held).await.unwrap(), Some(pod.id));
        assert_eq!(assigner.unbind(held).await.unwrap(), None);
        assert!(assigner.load_pod(pod.id).await.unwrap().config.freed_ip().is_some());

        assigner.assign(pod.id).await.unwrap();
        assert_eq!(assigner.release_for_deletion(pod.id).await.unwrap(), Some(held));
        let cleared = assigner.load_pod(pod.id).await.unwrap();
        assert_eq!(cleared.config.public_ip(), PublicIp::Unassigned);
        assert!(!cleared.config.has_freed_ports());
    }

    #[tokio::test]
    async fn test_rollback_restores_previous_config() {
        let (store, assigner) = setup("10.0.0.0/29").await;
        let pod = add_pod(&store, vec![PortSpec::public(80)]).await;
        assigner.assign(pod.id).await.unwrap();
        assigner.revoke(pod.id).await.unwrap();
        let suspended = assigner.load_pod(pod.id).await.unwrap();

        assigner.assign(pod.id).await.unwrap();
        assigner.rollback_assign(&suspended).await.unwrap();

        assert_eq!(assigner.load_pod(pod.id).await.unwrap().config, suspended.config);
        assert!(assigner.pool().find_by_pod(pod.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_rollback_keeps_config_and_allocation_in_step() {
        let (store, assigner) = setup("10.0.0.0/29").await;
        let pod = add_pod(&store, vec![PortSpec::public(80)]).await;
        assigner.assign(pod.id).await.unwrap();
        assigner.revoke(pod.id).await.unwrap();
        let suspended = assigner.load_pod(pod.id).await.unwrap();
        assigner.assign(pod.id).await.unwrap();

        store.fail_next_pod_saves(1);
        assert!(assigner.rollback_assign(&suspended).await.is_err());

        // Nothing was released: the live address is still backed by the pool.
        let current = assigner.load_pod(pod.id).await.unwrap();
        assert_eq!(current.config.public_ip(), PublicIp::Assigned(ip("10.0.0.1")));
        let record = assigner.pool().find_by_pod(pod.id).await.unwrap().unwrap();
        assert_eq!(record.addr(), ip("10.0.0.1"));

        assigner.rollback_assign(&suspended).await.unwrap();
        assert_eq!(assigner.load_pod(pod.id).await.unwrap().config, suspended.config);
        assert!(assigner.pool().find_by_pod(pod.id).await.unwrap().is_none());
    }
}
