//! Runtime configuration
//!
//! Built from defaults, optionally overlaid with a YAML file, then with
//! `KD_*` environment variables.

use crate::error::KdError;
use crate::suspension::SuspensionSettings;
use orchestrator_client::OrchestratorClient;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct KdConfig {
    /// Pod API endpoint
    pub orchestrator: OrchestratorConfig,
    /// Exclusive lock settings
    pub locks: LockConfig,
    /// Node backup settings
    pub backups: BackupConfig,
    /// Bind IP networks to nodes; allocation then only considers the pod's node
    pub fixed_ip_pools: bool,
}

/// Pod API endpoint settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Base URL of the pod API
    pub url: String,
    /// API token
    pub token: Option<String>,
    /// Per-request timeout
    pub timeout_secs: u64,
    /// Retries of transient request failures
    pub max_retries: u32,
    /// Bound on a single start/stop command issued during (un)suspension
    pub command_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:5000".to_string(),
            token: None,
            timeout_secs: 30,
            max_retries: 3,
            command_timeout_secs: 120,
        }
    }
}

/// Exclusive lock settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Directory for the file lease backend
    pub dir: PathBuf,
    /// TTL for pod operation locks
    pub default_ttl_secs: u64,
    /// TTL for the per-user suspension lock
    pub suspension_ttl_secs: u64,
    /// First delay while waiting for a held lock
    pub poll_min_ms: u64,
    /// Cap on the delay while waiting for a held lock
    pub poll_max_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lock/kuberdock"),
            default_ttl_secs: 600,
            suspension_ttl_secs: 3600,
            poll_min_ms: 100,
            poll_max_ms: 5000,
        }
    }
}

impl LockConfig {
    /// TTL for pod operation locks
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    /// TTL for the per-user suspension lock
    pub fn suspension_ttl(&self) -> Duration {
        Duration::from_secs(self.suspension_ttl_secs)
    }

    /// `(min, max)` delay while waiting for a held lock
    pub fn poll_bounds(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.poll_min_ms),
            Duration::from_millis(self.poll_max_ms),
        )
    }
}

/// Node backup settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Directory holding `local_pv_backup_*` snapshots
    pub root: PathBuf,
    /// Snapshots within this many hours of a group's first one are merged
    pub precision_hours: u32,
    /// TTL of the lock serializing merges of one root
    pub lock_ttl_secs: u64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/kuberdock/backups"),
            precision_hours: 1,
            lock_ttl_secs: 6 * 3600,
        }
    }
}

impl KdConfig {
    /// Parse a YAML document; missing keys keep their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, KdError> {
        serde_yaml::from_str(yaml).map_err(|e| KdError::InvalidConfig(e.to_string()))
    }

    /// Read a YAML file.
    pub fn from_yaml_file(path: &Path) -> Result<Self, KdError> {
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| KdError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml_str(&yaml)
    }

    /// Defaults, then the optional file, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, KdError> {
        let config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.with_env(|key| std::env::var(key).ok())
    }

    /// Apply `KD_*` overrides read through `lookup`.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, KdError> {
        if let Some(url) = lookup("KD_ORCHESTRATOR_URL") {
            self.orchestrator.url = url;
        }
        if let Some(token) = lookup("KD_ORCHESTRATOR_TOKEN") {
            self.orchestrator.token = Some(token);
        }
        if let Some(dir) = lookup("KD_LOCK_DIR") {
            self.locks.dir = PathBuf::from(dir);
        }
        if let Some(ttl) = lookup("KD_LOCK_TTL_SECS") {
            self.locks.default_ttl_secs = parse_var("KD_LOCK_TTL_SECS", &ttl)?;
        }
        if let Some(ttl) = lookup("KD_SUSPENSION_LOCK_TTL_SECS") {
            self.locks.suspension_ttl_secs = parse_var("KD_SUSPENSION_LOCK_TTL_SECS", &ttl)?;
        }
        if let Some(root) = lookup("KD_BACKUPS_ROOT") {
            self.backups.root = PathBuf::from(root);
        }
        if let Some(precision) = lookup("KD_MERGE_PRECISION_HOURS") {
            self.backups.precision_hours = parse_var("KD_MERGE_PRECISION_HOURS", &precision)?;
        }
        if let Some(fixed) = lookup("KD_FIXED_IP_POOLS") {
            self.fixed_ip_pools = parse_var("KD_FIXED_IP_POOLS", &fixed)?;
        }
        Ok(self)
    }

    /// Pod API client; the token is required
    pub fn orchestrator_client(&self) -> Result<OrchestratorClient, KdError> {
        let token = self.orchestrator.token.clone().ok_or_else(|| {
            KdError::InvalidConfig("KD_ORCHESTRATOR_TOKEN is required".to_string())
        })?;
        Ok(OrchestratorClient::with_policy(
            self.orchestrator.url.clone(),
            token,
            Duration::from_secs(self.orchestrator.timeout_secs),
            self.orchestrator.max_retries,
        )?)
    }

    /// Bounds for the suspension coordinator
    pub fn suspension_settings(&self) -> SuspensionSettings {
        SuspensionSettings {
            lock_ttl: self.locks.suspension_ttl(),
            pod_lock_ttl: self.locks.default_ttl(),
            command_timeout: Duration::from_secs(self.orchestrator.command_timeout_secs),
        }
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, KdError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| KdError::InvalidConfig(format!("{}={:?}: {}", key, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_yaml_overrides_defaults() {
        let config = KdConfig::from_yaml_str(
            "fixed_ip_pools: true\nbackups:\n  precision_hours: 6\n",
        )
        .unwrap();

        assert!(config.fixed_ip_pools);
        assert_eq!(config.backups.precision_hours, 6);
        assert_eq!(config.backups.root, BackupConfig::default().root);
        assert_eq!(config.locks, LockConfig::default());
    }

    #[test]
    fn test_env_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("KD_ORCHESTRATOR_URL", "https://master.example"),
            ("KD_LOCK_TTL_SECS", "30"),
            ("KD_FIXED_IP_POOLS", "true"),
        ]
        .into_iter()
        .collect();

        let config = KdConfig::default()
            .with_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.orchestrator.url, "https://master.example");
        assert_eq!(config.locks.default_ttl(), Duration::from_secs(30));
        assert!(config.fixed_ip_pools);
    }

    #[test]
    fn test_malformed_env_is_rejected() {
        let result = KdConfig::default().with_env(|key| {
            (key == "KD_MERGE_PRECISION_HOURS").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(KdError::InvalidConfig(_))));
    }

    #[test]
    fn test_orchestrator_client_requires_token() {
        let mut config = KdConfig::default();
        assert!(matches!(
            config.orchestrator_client(),
            Err(KdError::InvalidConfig(_))
        ));

        config.orchestrator.token = Some("secret".to_string());
        assert!(config.orchestrator_client().is_ok());
    }

    #[test]
    fn test_suspension_settings() {
        let settings = KdConfig::default().suspension_settings();
        assert_eq!(settings.lock_ttl, Duration::from_secs(3600));
        assert_eq!(settings.pod_lock_ttl, Duration::from_secs(600));
        assert_eq!(settings.command_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_malformed_yaml_is_rejected() {
        assert!(matches!(
            KdConfig::from_yaml_str("locks: [1, 2"),
            Err(KdError::InvalidConfig(_))
        ));
    }
}
