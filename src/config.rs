//! Broker configuration
//!
//! Daemon settings, loadable from a YAML file. Every section has defaults so a
//! partial file (or none at all) is valid; command-line flags are applied on
//! top by the binary.
//!
//! ```yaml
//! service:
//!   id: nfsbroker
//!   name: nfs
//! policy:
//!   allowed_options: uid,gid,auto_cache
//!   default_options: uid:1000,gid:1000
//! store:
//!   kind: file
//!   path: /var/vcap/data/nfsbroker/state.json
//! ```

use crate::broker::backends::BackendConfig;
use crate::broker::{BrokerSettings, ServiceCatalog};
use crate::error::{Error, Result};
use crate::mount::{MergePolicy, DEFAULT_CONTAINER_BASE};
use crate::store::{StoreConfig, StoreKind};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

// =============================================================================
// Sections
// =============================================================================

/// Catalog identity of the offered service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub id: String,
    pub name: String,
    /// Plan sizes in gigabytes
    pub plans_gb: Vec<u64>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            id: "nfsbroker".to_string(),
            name: "nfs".to_string(),
            plans_gb: vec![5, 10],
        }
    }
}

/// Mount option policy, in operator notation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Comma-separated keys a caller may set
    pub allowed_options: String,
    /// Comma-separated `key:value` defaults
    pub default_options: String,
    /// Drop unknown keys instead of rejecting them
    pub permissive: bool,
}

/// Health and metrics listeners
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub health_addr: String,
    pub metrics_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            health_addr: "0.0.0.0:8081".to_string(),
            metrics_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Log output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    pub level: String,
    /// Emit JSON lines
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// =============================================================================
// Broker Configuration
// =============================================================================

/// Complete daemon configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub service: ServiceConfig,
    pub policy: PolicyConfig,
    /// Parent of synthesized container paths
    pub container_base: String,
    pub store: StoreConfig,
    pub backend: BackendConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            policy: PolicyConfig::default(),
            container_base: DEFAULT_CONTAINER_BASE.to_string(),
            store: StoreConfig::default(),
            backend: BackendConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Load from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse YAML
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::Configuration(format!("invalid YAML configuration: {}", e)))
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.service.id.is_empty() || self.service.name.is_empty() {
            return Err(Error::Configuration(
                "service id and name must not be empty".to_string(),
            ));
        }
        if self.service.plans_gb.is_empty() {
            return Err(Error::Configuration("at least one plan is required".to_string()));
        }
        if self.service.plans_gb.contains(&0) {
            return Err(Error::Configuration(
                "plan sizes must be greater than 0".to_string(),
            ));
        }
        if !self.container_base.starts_with('/') {
            return Err(Error::Configuration(format!(
                "container base must be an absolute path: {}",
                self.container_base
            )));
        }
        if self.store.kind == StoreKind::File && self.store.path.is_none() {
            return Err(Error::Configuration(
                "file store requires a state file path".to_string(),
            ));
        }
        parse_addr("health", &self.server.health_addr)?;
        parse_addr("metrics", &self.server.metrics_addr)?;

        self.merge_policy().map(|_| ())
    }

    /// Build the mount option policy
    pub fn merge_policy(&self) -> Result<MergePolicy> {
        MergePolicy::from_conf(
            &self.policy.allowed_options,
            &self.policy.default_options,
            self.policy.permissive,
        )
    }

    /// Settings for the broker orchestrator
    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            catalog: ServiceCatalog::with_plans(
                self.service.id.clone(),
                self.service.name.clone(),
                self.service.plans_gb.iter().copied(),
            ),
            container_base: self.container_base.clone(),
        }
    }
}

/// Parse a listener address
pub fn parse_addr(name: &str, addr: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| Error::Configuration(format!("invalid {} address '{}': {}", name, addr, e)))
}
