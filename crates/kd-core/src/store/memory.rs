//! In-memory store
//!
//! A transaction holds the store mutex for its whole lifetime and works on a
//! copy of the tables; commit swaps the copy in. Transactions are therefore
//! serialized, and a caller must never open a second transaction while it
//! still holds one.

use super::{Store, StoreError, StoreTx};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use kd_models::{IpPoolNetwork, IpState, Pod, PodId, PodIp, User, UserId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Default)]
struct Tables {
    networks: BTreeMap<Ipv4Net, IpPoolNetwork>,
    pod_ips: BTreeMap<u32, PodIp>,
    ip_states: Vec<IpState>,
    pods: HashMap<PodId, Pod>,
    users: HashMap<UserId, User>,
}

#[derive(Debug, Default)]
struct Faults {
    /// `save_pod` calls let through before `pod_saves` applies
    pod_save_skips: AtomicU32,
    pod_saves: AtomicU32,
    commits: AtomicU32,
}

impl Faults {
    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn take_pod_save(&self) -> bool {
        if self.pod_saves.load(Ordering::SeqCst) > 0 && Self::take(&self.pod_save_skips) {
            return false;
        }
        Self::take(&self.pod_saves)
    }
}

/// Store kept in process memory
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    faults: Arc<Faults>,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(any(test, feature = "test-util"))]
impl MemoryStore {
    /// Make the next `n` `save_pod` calls fail with a backend error
    pub fn fail_next_pod_saves(&self, n: u32) {
        self.faults.pod_save_skips.store(0, Ordering::SeqCst);
        self.faults.pod_saves.store(n, Ordering::SeqCst);
    }

    /// Let `successes` `save_pod` calls through, then fail the next one
    pub fn fail_pod_save_after(&self, successes: u32) {
        self.faults.pod_save_skips.store(successes, Ordering::SeqCst);
        self.faults.pod_saves.store(1, Ordering::SeqCst);
    }

    /// Make the next `n` commits fail with a backend error
    pub fn fail_next_commits(&self, n: u32) {
        self.faults.commits.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let guard = Arc::clone(&self.tables).lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            work,
            faults: Arc::clone(&self.faults),
        }))
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<Tables>,
    work: Tables,
    faults: Arc<Faults>,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn list_networks(&mut self) -> Result<Vec<IpPoolNetwork>, StoreError> {
        Ok(self.work.networks.values().cloned().collect())
    }

    async fn get_network(&mut self, network: Ipv4Net) -> Result<Option<IpPoolNetwork>, StoreError> {
        Ok(self.work.networks.get(&network).cloned())
    }

    async fn put_network(&mut self, network: IpPoolNetwork) -> Result<(), StoreError> {
        self.work.networks.insert(network.network, network);
        Ok(())
    }

    async fn delete_network(&mut self, network: Ipv4Net) -> Result<bool, StoreError> {
        Ok(self.work.networks.remove(&network).is_some())
    }

    async fn list_pod_ips(&mut self) -> Result<Vec<PodIp>, StoreError> {
        Ok(self.work.pod_ips.values().cloned().collect())
    }

    async fn find_pod_ip(&mut self, pod_id: PodId) -> Result<Option<PodIp>, StoreError> {
        Ok(self
            .work
            .pod_ips
            .values()
            .find(|p| p.pod_id == pod_id)
            .cloned())
    }

    async fn find_pod_ip_by_address(&mut self, ip: u32) -> Result<Option<PodIp>, StoreError> {
        Ok(self.work.pod_ips.get(&ip).cloned())
    }

    async fn insert_pod_ip(&mut self, pod_ip: PodIp) -> Result<(), StoreError> {
        if self.work.pod_ips.contains_key(&pod_ip.ip_address) {
            return Err(StoreError::Conflict(format!(
                "address {} is already allocated",
                pod_ip.addr()
            )));
        }
        if self.work.pod_ips.values().any(|p| p.pod_id == pod_ip.pod_id) {
            return Err(StoreError::Conflict(format!(
                "pod {} already holds an address",
                pod_ip.pod_id
            )));
        }
        self.work.pod_ips.insert(pod_ip.ip_address, pod_ip);
        Ok(())
    }

    async fn delete_pod_ip(&mut self, ip: u32) -> Result<Option<PodIp>, StoreError> {
        Ok(self.work.pod_ips.remove(&ip))
    }

    async fn start_ip_state(
        &mut self,
        pod_id: PodId,
        ip: u32,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.work.ip_states.push(IpState {
            pod_id,
            ip_address: ip,
            start: at,
            end: None,
        });
        Ok(())
    }

    async fn end_ip_state(
        &mut self,
        pod_id: PodId,
        ip: u32,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(state) = self
            .work
            .ip_states
            .iter_mut()
            .rev()
            .find(|s| s.pod_id == pod_id && s.ip_address == ip && s.end.is_none())
        {
            state.end = Some(at);
        }
        Ok(())
    }

    async fn list_ip_states(&mut self, pod_id: PodId) -> Result<Vec<IpState>, StoreError> {
        Ok(self
            .work
            .ip_states
            .iter()
            .filter(|s| s.pod_id == pod_id)
            .cloned()
            .collect())
    }

    async fn get_pod(&mut self, id: PodId) -> Result<Option<Pod>, StoreError> {
        Ok(self.work.pods.get(&id).cloned())
    }

    async fn list_pods(&mut self, owner: UserId) -> Result<Vec<Pod>, StoreError> {
        let mut pods: Vec<Pod> = self
            .work
            .pods
            .values()
            .filter(|p| p.owner_id == owner)
            .cloned()
            .collect();
        pods.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(pods)
    }

    async fn save_pod(&mut self, pod: Pod) -> Result<(), StoreError> {
        if self.faults.take_pod_save() {
            return Err(StoreError::Backend(format!("saving pod {} failed", pod.id)));
        }
        self.work.pods.insert(pod.id, pod);
        Ok(())
    }

    async fn get_user(&mut self, id: UserId) -> Result<Option<User>, StoreError> {
        Ok(self.work.users.get(&id).cloned())
    }

    async fn save_user(&mut self, user: User) -> Result<(), StoreError> {
        self.work.users.insert(user.id, user);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTx {
            mut guard,
            work,
            faults,
        } = *self;
        if Faults::take(&faults.commits) {
            return Err(StoreError::Backend("commit rejected".to_string()));
        }
        *guard = work;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod_ip(ip: u32) -> PodIp {
        PodIp {
            pod_id: PodId::new_v4(),
            owner_id: UserId(1),
            ip_address: ip,
            network: "10.0.0.0/24".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let store = MemoryStore::new();

        let mut tx = store.begin().await.unwrap();
        tx.insert_pod_ip(pod_ip(1)).await.unwrap();
        drop(tx);

        let mut tx = store.begin().await.unwrap();
        assert!(tx.list_pod_ips().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unique_address_and_pod() {
        let store = MemoryStore::new();
        let first = pod_ip(1);

        let mut tx = store.begin().await.unwrap();
        tx.insert_pod_ip(first.clone()).await.unwrap();
        assert!(matches!(
            tx.insert_pod_ip(pod_ip(1)).await,
            Err(StoreError::Conflict(_))
        ));
        let same_pod = PodIp {
            ip_address: 2,
            ..first
        };
        assert!(matches!(
            tx.insert_pod_ip(same_pod).await,
            Err(StoreError::Conflict(_))
        ));
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_commit_discards_changes() {
        let store = MemoryStore::new();
        store.fail_next_commits(1);

        let mut tx = store.begin().await.unwrap();
        tx.insert_pod_ip(pod_ip(1)).await.unwrap();
        assert!(tx.commit().await.is_err());

        let mut tx = store.begin().await.unwrap();
        assert!(tx.list_pod_ips().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pod_save_fails_after_successes() {
        let store = MemoryStore::new();
        let pod = Pod::new(UserId(1), "web", Vec::new());
        store.fail_pod_save_after(2);

        let mut tx = store.begin().await.unwrap();
        assert!(tx.save_pod(pod.clone()).await.is_ok());
        assert!(tx.save_pod(pod.clone()).await.is_ok());
        assert!(matches!(
            tx.save_pod(pod.clone()).await,
            Err(StoreError::Backend(_))
        ));
        assert!(tx.save_pod(pod).await.is_ok());
    }

    #[tokio::test]
    async fn test_ip_state_interval() {
        let store = MemoryStore::new();
        let pod_id = PodId::new_v4();

        let mut tx = store.begin().await.unwrap();
        tx.start_ip_state(pod_id, 7, Utc::now()).await.unwrap();
        tx.end_ip_state(pod_id, 7, Utc::now()).await.unwrap();
        tx.start_ip_state(pod_id, 7, Utc::now()).await.unwrap();
        let states = tx.list_ip_states(pod_id).await.unwrap();

        assert_eq!(states.len(), 2);
        assert!(states[0].end.is_some());
        assert!(states[1].end.is_none());
    }
}
