//! Volume Provisioner Adapters
//!
//! Provides adapters for the broker's provisioner port:
//! - Simulated: in-memory NFS filer

pub mod simulated;

pub use simulated::*;

use crate::domain::ports::VolumeProvisionerRef;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Factory for creating volume provisioners
pub struct BackendFactory;

impl BackendFactory {
    /// Create a backend adapter by name
    pub fn create(name: &str, config: BackendConfig) -> Result<VolumeProvisionerRef> {
        match name.to_lowercase().as_str() {
            "simulated" | "simulated-nfs" => Ok(Arc::new(SimulatedNfsBackend::new(config.simulated))),
            _ => Err(crate::error::Error::BackendUnavailable {
                backend: name.to_string(),
            }),
        }
    }
}

/// Combined backend configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend selected at startup
    pub kind: String,
    pub simulated: SimulatedNfsConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: "simulated".to_string(),
            simulated: SimulatedNfsConfig::default(),
        }
    }
}
