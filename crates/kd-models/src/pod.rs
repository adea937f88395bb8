//! Pod records
//!
//! A pod's configuration is stored as a JSON document. The public exposure
//! fields (`public_ip`, `isPublic`) have "shadow" twins (`public_ip_before_freed`,
//! `isPublic_before_freed`) that remember the exposure across a suspension.
//! Live and shadow values are mutually exclusive, so both are folded into a
//! single enum on the Rust side and the JSON representation is only produced
//! at the serialization boundary.

use crate::ids::{KubeTypeId, PodId, UserId};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use thiserror::Error;

/// Errors raised while decoding a pod configuration document
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Both the live and the shadow public IP are present
    #[error("public_ip ({live}) and public_ip_before_freed ({shadow}) are mutually exclusive")]
    ConflictingPublicIp {
        /// Live address
        live: Ipv4Addr,
        /// Shadow address
        shadow: Ipv4Addr,
    },

    /// A port is marked both public and public-before-freed
    #[error("port {0}: isPublic and isPublic_before_freed are mutually exclusive")]
    ConflictingPortExposure(u16),
}

/// Pod lifecycle status as reported by the orchestrator
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum PodStatus {
    /// Pod is being scheduled or its containers are starting
    Pending,
    /// Pod is running
    Running,
    /// Pod is being stopped
    Stopping,
    /// Pod is stopped
    #[default]
    Stopped,
    /// Pod was stopped because its owner did not pay
    Unpaid,
    /// Pod failed to start
    Failed,
    /// Pod is being deleted
    Deleting,
    /// Pod was deleted
    Deleted,
}

impl PodStatus {
    /// Whether the pod has no running workload.
    pub fn is_stopped(self) -> bool {
        matches!(self, Self::Stopped | Self::Unpaid | Self::Failed)
    }

    /// Whether the pod is gone or going away.
    pub fn is_deleted(self) -> bool {
        matches!(self, Self::Deleting | Self::Deleted)
    }
}

/// Commands accepted by the pod API
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PodCommand {
    /// Start the pod
    Start,
    /// Stop the pod
    Stop,
}

impl PodCommand {
    /// Wire name of the command
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }
}

/// Public exposure of a single container port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortExposure {
    /// Port is not exposed on the public IP
    #[default]
    Private,
    /// Port is exposed on the pod's public IP
    Public,
    /// Port was public before the pod's IP was freed by a suspension
    PublicBeforeFreed,
}

/// Container port specification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPortSpec", into = "RawPortSpec")]
pub struct PortSpec {
    /// Port inside the container
    pub container_port: u16,
    /// Port on the public IP, if different from `container_port`
    pub host_port: Option<u16>,
    /// Transport protocol
    pub protocol: String,
    /// Public exposure state
    pub exposure: PortExposure,
}

impl PortSpec {
    /// A private TCP port
    pub fn private(container_port: u16) -> Self {
        Self {
            container_port,
            host_port: None,
            protocol: "tcp".to_string(),
            exposure: PortExposure::Private,
        }
    }

    /// A public TCP port
    pub fn public(container_port: u16) -> Self {
        Self {
            exposure: PortExposure::Public,
            ..Self::private(container_port)
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RawPortSpec {
    #[serde(rename = "containerPort")]
    container_port: u16,
    #[serde(rename = "hostPort", default, skip_serializing_if = "Option::is_none")]
    host_port: Option<u16>,
    #[serde(default = "default_protocol")]
    protocol: String,
    #[serde(rename = "isPublic", default, skip_serializing_if = "Option::is_none")]
    is_public: Option<bool>,
    #[serde(rename = "isPublic_before_freed", default, skip_serializing_if = "Option::is_none")]
    is_public_before_freed: Option<bool>,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

impl TryFrom<RawPortSpec> for PortSpec {
    type Error = ConfigError;

    fn try_from(raw: RawPortSpec) -> Result<Self, Self::Error> {
        let exposure = match (raw.is_public, raw.is_public_before_freed) {
            (Some(true), Some(true)) => {
                return Err(ConfigError::ConflictingPortExposure(raw.container_port));
            }
            (Some(true), _) => PortExposure::Public,
            (_, Some(true)) => PortExposure::PublicBeforeFreed,
            _ => PortExposure::Private,
        };
        Ok(Self {
            container_port: raw.container_port,
            host_port: raw.host_port,
            protocol: raw.protocol,
            exposure,
        })
    }
}

impl From<PortSpec> for RawPortSpec {
    fn from(port: PortSpec) -> Self {
        let (is_public, is_public_before_freed) = match port.exposure {
            PortExposure::Private => (Some(false), None),
            PortExposure::Public => (Some(true), None),
            PortExposure::PublicBeforeFreed => (None, Some(true)),
        };
        Self {
            container_port: port.container_port,
            host_port: port.host_port,
            protocol: port.protocol,
            is_public,
            is_public_before_freed,
        }
    }
}

/// Container specification (only the parts the core cares about)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ContainerSpec {
    /// Container name
    pub name: String,
    /// Image reference
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    /// Declared ports
    #[serde(default)]
    pub ports: Vec<PortSpec>,
}

/// Public address of a pod, live or remembered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublicIp {
    /// No public address
    #[default]
    Unassigned,
    /// Pod currently holds this address
    Assigned(Ipv4Addr),
    /// Address was freed by a suspension and should be restored on unsuspend
    Freed(Ipv4Addr),
}

/// Pod configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(try_from = "RawPodConfig", into = "RawPodConfig")]
pub struct PodConfig {
    /// Containers of the pod
    pub containers: Vec<ContainerSpec>,
    /// Node the pod is pinned to (fixed IP pools mode)
    pub node: Option<String>,
    public_ip: PublicIp,
    /// Remaining configuration, preserved verbatim
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Serialize, Deserialize)]
struct RawPodConfig {
    #[serde(default)]
    containers: Vec<ContainerSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    public_ip: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    public_ip_before_freed: Option<Ipv4Addr>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

impl TryFrom<RawPodConfig> for PodConfig {
    type Error = ConfigError;

    fn try_from(raw: RawPodConfig) -> Result<Self, Self::Error> {
        let public_ip = match (raw.public_ip, raw.public_ip_before_freed) {
            (Some(live), Some(shadow)) => {
                return Err(ConfigError::ConflictingPublicIp { live, shadow });
            }
            (Some(live), None) => PublicIp::Assigned(live),
            (None, Some(shadow)) => PublicIp::Freed(shadow),
            (None, None) => PublicIp::Unassigned,
        };
        Ok(Self {
            containers: raw.containers,
            node: raw.node,
            public_ip,
            extra: raw.extra,
        })
    }
}

impl From<PodConfig> for RawPodConfig {
    fn from(config: PodConfig) -> Self {
        let (public_ip, public_ip_before_freed) = match config.public_ip {
            PublicIp::Unassigned => (None, None),
            PublicIp::Assigned(ip) => (Some(ip), None),
            PublicIp::Freed(ip) => (None, Some(ip)),
        };
        Self {
            containers: config.containers,
            node: config.node,
            public_ip,
            public_ip_before_freed,
            extra: config.extra,
        }
    }
}

impl PodConfig {
    /// Build a config from its containers
    pub fn new(containers: Vec<ContainerSpec>) -> Self {
        Self {
            containers,
            ..Self::default()
        }
    }

    /// Current public address state
    pub fn public_ip(&self) -> PublicIp {
        self.public_ip
    }

    /// Live public address, if any
    pub fn live_ip(&self) -> Option<Ipv4Addr> {
        match self.public_ip {
            PublicIp::Assigned(ip) => Some(ip),
            _ => None,
        }
    }

    /// Address remembered by a suspension, if any
    pub fn freed_ip(&self) -> Option<Ipv4Addr> {
        match self.public_ip {
            PublicIp::Freed(ip) => Some(ip),
            _ => None,
        }
    }

    fn ports(&self) -> impl Iterator<Item = &PortSpec> {
        self.containers.iter().flat_map(|c| c.ports.iter())
    }

    fn ports_mut(&mut self) -> impl Iterator<Item = &mut PortSpec> {
        self.containers.iter_mut().flat_map(|c| c.ports.iter_mut())
    }

    /// Whether any container port is exposed publicly.
    pub fn has_public_ports(&self) -> bool {
        self.ports().any(|p| p.exposure == PortExposure::Public)
    }

    /// Whether any container port was public before a suspension.
    pub fn has_freed_ports(&self) -> bool {
        self.ports().any(|p| p.exposure == PortExposure::PublicBeforeFreed)
    }

    /// Record `ip` as the live public address and turn remembered public
    /// ports back into public ones.
    ///
    /// Only the public IP assigner should call this; the IP pool's
    /// allocation table must agree with what the config says.
    pub fn assign_public_ip(&mut self, ip: Ipv4Addr) {
        self.restore_public_ports();
        self.public_ip = PublicIp::Assigned(ip);
    }

    /// Move the live public address and public ports into their shadow
    /// fields. Returns the freed address, or `None` if there was none.
    pub fn free_public_ip(&mut self) -> Option<Ipv4Addr> {
        let ip = self.live_ip()?;
        for port in self.ports_mut() {
            if port.exposure == PortExposure::Public {
                port.exposure = PortExposure::PublicBeforeFreed;
            }
        }
        self.public_ip = PublicIp::Freed(ip);
        Some(ip)
    }

    /// Turn ports remembered by a suspension back into public ports.
    pub fn restore_public_ports(&mut self) {
        for port in self.ports_mut() {
            if port.exposure == PortExposure::PublicBeforeFreed {
                port.exposure = PortExposure::Public;
            }
        }
    }

    /// Forget both the live and the remembered public address.
    pub fn clear_public_ip(&mut self) {
        self.restore_public_ports();
        self.public_ip = PublicIp::Unassigned;
    }
}

/// Pod as seen through the pod API and stored in the database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    /// Pod id
    pub id: PodId,
    /// Owner user id
    pub owner_id: UserId,
    /// Display name
    pub name: String,
    /// Lifecycle status
    #[serde(default)]
    pub status: PodStatus,
    /// Kube type of the pod's containers
    #[serde(default)]
    pub kube_type: KubeTypeId,
    /// Configuration document
    #[serde(default)]
    pub config: PodConfig,
}

impl Pod {
    /// Build a stopped pod with the given containers
    pub fn new(owner_id: UserId, name: impl Into<String>, containers: Vec<ContainerSpec>) -> Self {
        Self {
            id: PodId::new_v4(),
            owner_id,
            name: name.into(),
            status: PodStatus::Stopped,
            kube_type: KubeTypeId::default(),
            config: PodConfig::new(containers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn web_container() -> ContainerSpec {
        ContainerSpec {
            name: "web".to_string(),
            image: "nginx".to_string(),
            ports: vec![PortSpec::public(80), PortSpec::private(9000)],
        }
    }

    #[test]
    fn test_free_and_restore_public_ip() {
        let mut config = PodConfig::new(vec![web_container()]);
        let ip = Ipv4Addr::new(192, 168, 0, 10);
        config.assign_public_ip(ip);
        assert_eq!(config.public_ip(), PublicIp::Assigned(ip));

        assert_eq!(config.free_public_ip(), Some(ip));
        assert_eq!(config.public_ip(), PublicIp::Freed(ip));
        assert!(!config.has_public_ports());
        assert!(config.has_freed_ports());

        // Freeing twice is a no-op
        assert_eq!(config.free_public_ip(), None);
        assert_eq!(config.public_ip(), PublicIp::Freed(ip));

        config.assign_public_ip(ip);
        assert!(config.has_public_ports());
        assert!(!config.has_freed_ports());
    }

    #[test]
    fn test_shadow_fields_serialize_under_original_names() {
        let mut config = PodConfig::new(vec![web_container()]);
        config.assign_public_ip(Ipv4Addr::new(10, 0, 0, 2));
        config.free_public_ip();

        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["public_ip_before_freed"], json!("10.0.0.2"));
        assert!(value.get("public_ip").is_none());
        assert_eq!(value["containers"][0]["ports"][0]["isPublic_before_freed"], json!(true));
        assert!(value["containers"][0]["ports"][0].get("isPublic").is_none());
        assert_eq!(value["containers"][0]["ports"][1]["isPublic"], json!(false));
    }

    #[test]
    fn test_live_and_shadow_ip_are_rejected_together() {
        let doc = json!({
            "containers": [],
            "public_ip": "10.0.0.2",
            "public_ip_before_freed": "10.0.0.3",
        });
        let err = serde_json::from_value::<PodConfig>(doc).unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn test_unknown_config_keys_are_preserved() {
        let doc = json!({
            "containers": [{"name": "db", "ports": [{"containerPort": 5432, "isPublic": true}]}],
            "public_ip": "10.0.0.7",
            "restartPolicy": "Always",
            "volumes": [],
        });
        let config: PodConfig = serde_json::from_value(doc).unwrap();
        assert_eq!(config.live_ip(), Some(Ipv4Addr::new(10, 0, 0, 7)));
        assert!(config.has_public_ports());
        assert_eq!(config.extra["restartPolicy"], json!("Always"));

        let back = serde_json::to_value(&config).unwrap();
        assert_eq!(back["restartPolicy"], json!("Always"));
        assert_eq!(back["public_ip"], json!("10.0.0.7"));
    }

    #[test]
    fn test_pod_status_helpers() {
        assert!(PodStatus::Stopped.is_stopped());
        assert!(PodStatus::Unpaid.is_stopped());
        assert!(!PodStatus::Running.is_stopped());
        assert!(PodStatus::Deleted.is_deleted());
        assert_eq!(serde_json::to_value(PodStatus::Running).unwrap(), json!("running"));
    }
}
