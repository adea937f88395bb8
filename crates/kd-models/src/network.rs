//! IP pool tables
//!
//! Addresses are stored as integers (`u32`) so that ordering and set
//! operations are plain integer comparisons.

use crate::ids::{PodId, UserId};
use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

/// A registered public IP network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpPoolNetwork {
    /// CIDR block
    pub network: Ipv4Net,
    /// Administratively excluded addresses
    #[serde(default)]
    pub blocked: BTreeSet<u32>,
    /// Node this network is bound to (fixed IP pools mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// Registration time
    pub created_at: DateTime<Utc>,
}

impl IpPoolNetwork {
    /// Build a network with nothing blocked
    pub fn new(network: Ipv4Net, node: Option<String>) -> Self {
        Self {
            network,
            blocked: BTreeSet::new(),
            node,
            created_at: Utc::now(),
        }
    }

    /// First and last host address. The network and broadcast addresses are
    /// never hosts, so `/31` and `/32` networks have none.
    pub fn host_bounds(&self) -> Option<(u32, u32)> {
        let first = u32::from(self.network.network()).checked_add(1)?;
        let last = u32::from(self.network.broadcast()).checked_sub(1)?;
        (first <= last).then_some((first, last))
    }

    /// Number of host addresses, blocked ones included
    pub fn host_count(&self) -> u64 {
        self.host_bounds()
            .map_or(0, |(first, last)| u64::from(last - first) + 1)
    }

    /// Whether `ip` is a host address of this network
    pub fn contains_host(&self, ip: u32) -> bool {
        self.host_bounds()
            .is_some_and(|(first, last)| (first..=last).contains(&ip))
    }

    /// Whether `ip` is administratively blocked
    pub fn is_blocked(&self, ip: u32) -> bool {
        self.blocked.contains(&ip)
    }
}

/// Allocation record: a pod holding a public address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodIp {
    /// Pod holding the address
    pub pod_id: PodId,
    /// Owner of the pod
    pub owner_id: UserId,
    /// Integer-encoded address
    pub ip_address: u32,
    /// Network the address belongs to
    pub network: Ipv4Net,
}

impl PodIp {
    /// The address as an `Ipv4Addr`
    pub fn addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ip_address)
    }
}

/// Usage history of a public address held by a pod
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpState {
    /// Pod that held the address
    pub pod_id: PodId,
    /// Integer-encoded address
    pub ip_address: u32,
    /// When the pod got the address
    pub start: DateTime<Utc>,
    /// When the pod released it, `None` while still held
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

/// Collapse addresses into inclusive `(start, end)` runs of consecutive values.
pub fn compress_ranges(ips: impl IntoIterator<Item = u32>) -> Vec<(u32, u32)> {
    let sorted: BTreeSet<u32> = ips.into_iter().collect();
    let mut blocks: Vec<(u32, u32)> = Vec::new();
    for ip in sorted {
        match blocks.last_mut() {
            Some((_, end)) if end.checked_add(1) == Some(ip) => *end = ip,
            _ => blocks.push((ip, ip)),
        }
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpPoolNetwork {
        IpPoolNetwork::new(s.parse().unwrap(), None)
    }

    #[test]
    fn test_host_bounds_exclude_network_and_broadcast() {
        let pool = net("192.168.0.0/30");
        let (first, last) = pool.host_bounds().unwrap();
        assert_eq!(Ipv4Addr::from(first), Ipv4Addr::new(192, 168, 0, 1));
        assert_eq!(Ipv4Addr::from(last), Ipv4Addr::new(192, 168, 0, 2));
        assert_eq!(pool.host_count(), 2);
        assert!(!pool.contains_host(u32::from(Ipv4Addr::new(192, 168, 0, 0))));
        assert!(!pool.contains_host(u32::from(Ipv4Addr::new(192, 168, 0, 3))));
    }

    #[test]
    fn test_tiny_networks_have_no_hosts() {
        assert_eq!(net("10.0.0.0/31").host_count(), 0);
        assert_eq!(net("10.0.0.1/32").host_count(), 0);
        assert!(net("0.0.0.0/32").host_bounds().is_none());
    }

    #[test]
    fn test_compress_ranges() {
        assert_eq!(compress_ranges(vec![5, 1, 2, 3, 7, 8]), vec![(1, 3), (5, 5), (7, 8)]);
        assert!(compress_ranges(Vec::new()).is_empty());
    }
}
