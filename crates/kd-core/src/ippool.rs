//! Public IP pool
//!
//! Networks are registered CIDR blocks; every host address of a network
//! (network and broadcast addresses excluded) is either free, blocked or
//! allocated to exactly one pod. Allocation, release and block/unblock each
//! run in a single store transaction, and the store's uniqueness constraint
//! on allocation records backs the at-most-once guarantee when two workers
//! race for the same address.

use crate::error::KdError;
use crate::store::{Store, StoreError, StoreTx};
use chrono::Utc;
use ipnet::Ipv4Net;
use kd_models::{compress_ranges, IpPoolNetwork, IpState, PodId, PodIp, UserId};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Attempts before a racing allocation gives up
const MAX_ALLOCATION_ATTEMPTS: u32 = 3;

/// Registration request for a network
#[derive(Debug, Clone, Default)]
pub struct NewNetwork {
    /// CIDR, e.g. `"192.168.1.0/24"`
    pub network: String,
    /// Addresses to block at creation: `"10.0.0.1,10.0.0.30-10.0.1.32"`
    pub autoblock: Option<String>,
    /// Further addresses to block at creation
    pub excluded: Vec<Ipv4Addr>,
    /// Node to bind the network to
    pub node: Option<String>,
}

/// Who needs an address
#[derive(Debug, Clone)]
pub struct AllocationRequest {
    /// Pod that will hold the address
    pub pod_id: PodId,
    /// Owner of the pod
    pub owner_id: UserId,
    /// Address to hand out if it is still free
    pub preferred: Option<Ipv4Addr>,
    /// Restrict to networks bound to this node
    pub node: Option<String>,
}

/// Occupancy of one network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSummary {
    /// Network address and prefix
    pub network: Ipv4Net,
    /// Node the network is bound to
    pub node: Option<String>,
    /// Host addresses in the network
    pub total: u64,
    /// Neither allocated nor blocked
    pub free: u64,
    /// Held by pods
    pub allocated: u64,
    /// Excluded from allocation
    pub blocked: u64,
    /// Blocked addresses as inclusive `[start, end]` runs
    pub blocked_ranges: Vec<(Ipv4Addr, Ipv4Addr)>,
}

/// The pool of public addresses
#[derive(Clone)]
pub struct IpPool {
    store: Arc<dyn Store>,
}

fn parse_network(network: &str) -> Result<Ipv4Net, KdError> {
    let net: Ipv4Net = network
        .trim()
        .parse()
        .map_err(|_| KdError::Validation(format!("'{}' is not a valid IPv4 network", network)))?;
    if net.trunc() != net {
        return Err(KdError::Validation(format!(
            "'{}' has host bits set, did you mean {}?",
            network,
            net.trunc()
        )));
    }
    Ok(net)
}

fn parse_ip(ip: &str) -> Result<u32, KdError> {
    ip.trim()
        .parse::<Ipv4Addr>()
        .map(u32::from)
        .map_err(|_| KdError::Validation(format!("'{}' is not a valid IPv4 address", ip)))
}

/// Parse `"a,b-c,..."` into host addresses of `network`
fn parse_autoblock(spec: &str, network: &IpPoolNetwork) -> Result<BTreeSet<u32>, KdError> {
    let mut blocked = BTreeSet::new();
    for item in spec.split(',') {
        let (first, last) = match item.split_once('-') {
            Some((first, last)) => (parse_ip(first)?, parse_ip(last)?),
            None => {
                let ip = parse_ip(item)?;
                (ip, ip)
            }
        };
        if first > last {
            return Err(KdError::Validation(format!("Invalid range '{}'", item.trim())));
        }
        for ip in first..=last {
            if !network.contains_host(ip) {
                return Err(KdError::Validation(format!(
                    "{} does not belong to network {}",
                    Ipv4Addr::from(ip),
                    network.network
                )));
            }
            blocked.insert(ip);
        }
    }
    Ok(blocked)
}

/// Lowest address of `network` that is neither blocked nor in `taken`
fn lowest_free(network: &IpPoolNetwork, taken: &BTreeSet<u32>) -> Option<u32> {
    let (first, last) = network.host_bounds()?;
    let mut ip = first;
    while taken.contains(&ip) || network.is_blocked(ip) {
        if ip == last {
            return None;
        }
        ip += 1;
    }
    Some(ip)
}

impl IpPool {
    /// Pool backed by `store`
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    async fn network_in(tx: &mut dyn StoreTx, network: &str) -> Result<IpPoolNetwork, KdError> {
        let net = parse_network(network)?;
        tx.get_network(net)
            .await?
            .ok_or_else(|| KdError::NetworkNotFound(net.to_string()))
    }

    /// Network whose hosts include `ip`
    async fn owning_network(tx: &mut dyn StoreTx, ip: u32) -> Result<IpPoolNetwork, KdError> {
        tx.list_networks()
            .await?
            .into_iter()
            .find(|n| n.contains_host(ip))
            .ok_or_else(|| {
                KdError::Validation(format!(
                    "{} does not belong to any network",
                    Ipv4Addr::from(ip)
                ))
            })
    }

    /// Register a network.
    ///
    /// Rejects malformed CIDRs, networks without host addresses, duplicates
    /// and overlaps with registered networks.
    pub async fn create(&self, request: NewNetwork) -> Result<IpPoolNetwork, KdError> {
        let net = parse_network(&request.network)?;
        let mut network = IpPoolNetwork::new(net, request.node);
        if network.host_bounds().is_none() {
            return Err(KdError::Validation(format!(
                "Network {} has no host addresses",
                net
            )));
        }
        if let Some(autoblock) = request.autoblock.as_deref().filter(|s| !s.trim().is_empty()) {
            network.blocked = parse_autoblock(autoblock, &network)?;
        }
        for ip in &request.excluded {
            let addr = u32::from(*ip);
            if !network.contains_host(addr) {
                return Err(KdError::Validation(format!(
                    "{} does not belong to network {}",
                    ip, net
                )));
            }
            network.blocked.insert(addr);
        }

        let mut tx = self.store.begin().await?;
        for existing in tx.list_networks().await? {
            if existing.network == net {
                return Err(KdError::Validation(format!("Network {} already exists", net)));
            }
            if existing.network.contains(&net) || net.contains(&existing.network) {
                return Err(KdError::Validation(format!(
                    "New {} network overlaps {} which already exists",
                    net, existing.network
                )));
            }
        }
        tx.put_network(network.clone()).await?;
        tx.commit().await?;

        info!(
            "Created IP network {} ({} hosts, {} blocked)",
            net,
            network.host_count(),
            network.blocked.len()
        );
        Ok(network)
    }

    /// Remove a network that has no allocated addresses
    pub async fn delete(&self, network: &str) -> Result<(), KdError> {
        let mut tx = self.store.begin().await?;
        let existing = Self::network_in(tx.as_mut(), network).await?;
        if tx
            .list_pod_ips()
            .await?
            .iter()
            .any(|p| p.network == existing.network)
        {
            return Err(KdError::NetworkInUse(existing.network.to_string()));
        }
        tx.delete_network(existing.network).await?;
        tx.commit().await?;
        info!("Deleted IP network {}", existing.network);
        Ok(())
    }

    /// Network registered under `network` (CIDR notation)
    pub async fn get(&self, network: &str) -> Result<Option<IpPoolNetwork>, KdError> {
        let net = parse_network(network)?;
        let mut tx = self.store.begin().await?;
        Ok(tx.get_network(net).await?)
    }

    /// Every registered network, ordered by address
    pub async fn list(&self) -> Result<Vec<IpPoolNetwork>, KdError> {
        let mut tx = self.store.begin().await?;
        Ok(tx.list_networks().await?)
    }

    /// Bind a network to a node, or unbind it with `None`.
    ///
    /// Refused while any address of the network is allocated.
    pub async fn set_node(
        &self,
        network: &str,
        node: Option<String>,
    ) -> Result<IpPoolNetwork, KdError> {
        let mut tx = self.store.begin().await?;
        let mut existing = Self::network_in(tx.as_mut(), network).await?;
        if existing.node == node {
            return Ok(existing);
        }
        if tx
            .list_pod_ips()
            .await?
            .iter()
            .any(|p| p.network == existing.network)
        {
            return Err(KdError::Validation(format!(
                "You cannot change the node of network '{}' while some of IP-addresses of this network are assigned to Pods",
                existing.network
            )));
        }
        existing.node = node;
        tx.put_network(existing.clone()).await?;
        tx.commit().await?;
        info!("Network {} bound to node {:?}", existing.network, existing.node);
        Ok(existing)
    }

    /// Free host addresses of a network, ascending
    pub async fn free_hosts(&self, network: &str) -> Result<Vec<Ipv4Addr>, KdError> {
        let mut tx = self.store.begin().await?;
        let existing = Self::network_in(tx.as_mut(), network).await?;
        let taken: BTreeSet<u32> = tx.list_pod_ips().await?.iter().map(|p| p.ip_address).collect();
        let Some((first, last)) = existing.host_bounds() else {
            return Ok(Vec::new());
        };
        Ok((first..=last)
            .filter(|ip| !taken.contains(ip) && !existing.is_blocked(*ip))
            .map(Ipv4Addr::from)
            .collect())
    }

    /// Free, allocated and blocked counts of `network`
    pub async fn summary(&self, network: &str) -> Result<NetworkSummary, KdError> {
        let mut tx = self.store.begin().await?;
        let existing = Self::network_in(tx.as_mut(), network).await?;
        let allocated = tx
            .list_pod_ips()
            .await?
            .iter()
            .filter(|p| p.network == existing.network)
            .count() as u64;
        let total = existing.host_count();
        let blocked = existing.blocked.len() as u64;
        Ok(NetworkSummary {
            network: existing.network,
            node: existing.node.clone(),
            total,
            free: total.saturating_sub(allocated + blocked),
            allocated,
            blocked,
            blocked_ranges: compress_ranges(existing.blocked.iter().copied())
                .into_iter()
                .map(|(first, last)| (Ipv4Addr::from(first), Ipv4Addr::from(last)))
                .collect(),
        })
    }

    /// Hand out an address to a pod.
    ///
    /// Returns the preferred address when it is eligible, otherwise the
    /// lowest free address across eligible networks. A pod that already
    /// holds an address gets that address back.
    pub async fn allocate(&self, request: &AllocationRequest) -> Result<Ipv4Addr, KdError> {
        let mut attempt = 1;
        loop {
            let mut tx = self.store.begin().await?;
            if let Some(existing) = tx.find_pod_ip(request.pod_id).await? {
                warn!(
                    "Pod {} already holds {}, not allocating another address",
                    request.pod_id,
                    existing.addr()
                );
                return Ok(existing.addr());
            }

            let networks: Vec<IpPoolNetwork> = tx
                .list_networks()
                .await?
                .into_iter()
                .filter(|n| request.node.is_none() || n.node == request.node)
                .collect();
            let taken: BTreeSet<u32> =
                tx.list_pod_ips().await?.iter().map(|p| p.ip_address).collect();

            let preferred = request.preferred.map(u32::from).and_then(|ip| {
                networks
                    .iter()
                    .find(|n| n.contains_host(ip) && !n.is_blocked(ip) && !taken.contains(&ip))
                    .map(|n| (n.network, ip))
            });
            let candidate = preferred.or_else(|| {
                networks
                    .iter()
                    .find_map(|n| lowest_free(n, &taken).map(|ip| (n.network, ip)))
            });
            let Some((network, ip)) = candidate else {
                return Err(KdError::NoFreeIps);
            };

            let record = PodIp {
                pod_id: request.pod_id,
                owner_id: request.owner_id,
                ip_address: ip,
                network,
            };
            match tx.insert_pod_ip(record).await {
                Ok(()) => {}
                Err(StoreError::Conflict(reason)) if attempt < MAX_ALLOCATION_ATTEMPTS => {
                    warn!(
                        "Allocation for pod {} lost a race ({}), retrying",
                        request.pod_id, reason
                    );
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
            tx.start_ip_state(request.pod_id, ip, Utc::now()).await?;
            match tx.commit().await {
                Ok(()) => {}
                Err(StoreError::Conflict(reason)) if attempt < MAX_ALLOCATION_ATTEMPTS => {
                    warn!(
                        "Allocation for pod {} lost a race ({}), retrying",
                        request.pod_id, reason
                    );
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            info!("Allocated {} to pod {}", Ipv4Addr::from(ip), request.pod_id);
            return Ok(Ipv4Addr::from(ip));
        }
    }

    /// Return an address to the pool. Releasing a free address is a no-op.
    pub async fn release(&self, ip: Ipv4Addr) -> Result<bool, KdError> {
        let mut tx = self.store.begin().await?;
        let Some(record) = tx.delete_pod_ip(u32::from(ip)).await? else {
            debug!("{} is not allocated, nothing to release", ip);
            return Ok(false);
        };
        tx.end_ip_state(record.pod_id, record.ip_address, Utc::now())
            .await?;
        tx.commit().await?;
        info!("Released {} from pod {}", ip, record.pod_id);
        Ok(true)
    }

    /// Exclude a free address from allocation. Returns whether it changed.
    pub async fn block(&self, ip: Ipv4Addr) -> Result<bool, KdError> {
        let addr = u32::from(ip);
        let mut tx = self.store.begin().await?;
        let mut network = Self::owning_network(tx.as_mut(), addr).await?;
        if let Some(record) = tx.find_pod_ip_by_address(addr).await? {
            return Err(KdError::Validation(format!(
                "IP {} is assigned to pod {}, unbind it first",
                ip, record.pod_id
            )));
        }
        if !network.blocked.insert(addr) {
            debug!("{} is already blocked", ip);
            return Ok(false);
        }
        tx.put_network(network).await?;
        tx.commit().await?;
        info!("Blocked {}", ip);
        Ok(true)
    }

    /// Make a blocked address allocatable again. Returns whether it changed.
    pub async fn unblock(&self, ip: Ipv4Addr) -> Result<bool, KdError> {
        let addr = u32::from(ip);
        let mut tx = self.store.begin().await?;
        let mut network = Self::owning_network(tx.as_mut(), addr).await?;
        if !network.blocked.remove(&addr) {
            debug!("{} is not blocked", ip);
            return Ok(false);
        }
        tx.put_network(network).await?;
        tx.commit().await?;
        info!("Unblocked {}", ip);
        Ok(true)
    }

    /// Allocation record of a pod
    pub async fn find_by_pod(&self, pod_id: PodId) -> Result<Option<PodIp>, KdError> {
        let mut tx = self.store.begin().await?;
        Ok(tx.find_pod_ip(pod_id).await?)
    }

    /// Allocation record of an address
    pub async fn find_by_address(&self, ip: Ipv4Addr) -> Result<Option<PodIp>, KdError> {
        let mut tx = self.store.begin().await?;
        Ok(tx.find_pod_ip_by_address(u32::from(ip)).await?)
    }

    /// Addresses held by a user's pods
    pub async fn user_addresses(&self, owner: UserId) -> Result<Vec<PodIp>, KdError> {
        let mut tx = self.store.begin().await?;
        Ok(tx
            .list_pod_ips()
            .await?
            .into_iter()
            .filter(|p| p.owner_id == owner)
            .collect())
    }

    /// Address usage history of a pod
    pub async fn history(&self, pod_id: PodId) -> Result<Vec<IpState>, KdError> {
        let mut tx = self.store.begin().await?;
        Ok(tx.list_ip_states(pod_id).await?)
    }
}
