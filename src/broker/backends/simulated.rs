//! Simulated NFS Backend
//!
//! In-memory stand-in for an NFS filer. Tracks volumes, their exports and
//! quotas so the broker can be run and tested without a real appliance.

use crate::domain::ports::VolumeProvisioner;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

const BACKEND_NAME: &str = "simulated-nfs";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the simulated backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedNfsConfig {
    /// Server name used in export locators
    pub server: String,
    /// Directory under which volumes are created
    pub export_root: String,
}

impl Default for SimulatedNfsConfig {
    fn default() -> Self {
        Self {
            server: "nfs-server".to_string(),
            export_root: "/export/volumes".to_string(),
        }
    }
}

// =============================================================================
// Volume State
// =============================================================================

/// Internal tracking of created volumes
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VolumeState {
    path: String,
    exported: bool,
    quota_bytes: Option<u64>,
    created_at: chrono::DateTime<chrono::Utc>,
}

// =============================================================================
// Simulated Backend
// =============================================================================

/// In-memory NFS backend
pub struct SimulatedNfsBackend {
    config: SimulatedNfsConfig,
    /// Volumes by instance id
    volumes: RwLock<BTreeMap<String, VolumeState>>,
    /// Is the backend reachable
    available: AtomicBool,
}

impl SimulatedNfsBackend {
    /// Create a new simulated backend
    pub fn new(config: SimulatedNfsConfig) -> Self {
        Self {
            config,
            volumes: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Set availability (for fault injection)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Check whether an export exists for `instance_id`
    pub async fn is_exported(&self, instance_id: &str) -> bool {
        self.volumes
            .read()
            .await
            .get(instance_id)
            .map(|v| v.exported)
            .unwrap_or(false)
    }

    /// Current quota of a volume
    pub async fn quota(&self, instance_id: &str) -> Option<u64> {
        self.volumes
            .read()
            .await
            .get(instance_id)
            .and_then(|v| v.quota_bytes)
    }

    /// Number of volumes currently held
    pub async fn volume_count(&self) -> usize {
        self.volumes.read().await.len()
    }

    fn volume_path(&self, instance_id: &str) -> String {
        format!(
            "{}/{}",
            self.config.export_root.trim_end_matches('/'),
            instance_id
        )
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(Error::BackendUnavailable {
                backend: BACKEND_NAME.to_string(),
            })
        }
    }

    fn failed(operation: &str, instance_id: &str, reason: &str) -> Error {
        Error::BackendOperationFailed {
            backend: BACKEND_NAME.to_string(),
            operation: operation.to_string(),
            instance_id: instance_id.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Apply `update` to an existing volume
    async fn with_volume<T>(
        &self,
        operation: &str,
        instance_id: &str,
        update: impl FnOnce(&mut VolumeState) -> T,
    ) -> Result<T> {
        self.check_available()?;
        let mut volumes = self.volumes.write().await;
        let volume = volumes
            .get_mut(instance_id)
            .ok_or_else(|| Self::failed(operation, instance_id, "volume does not exist"))?;
        Ok(update(volume))
    }
}

#[async_trait]
impl VolumeProvisioner for SimulatedNfsBackend {
    async fn create_volume(&self, instance_id: &str) -> Result<()> {
        self.check_available()?;
        let mut volumes = self.volumes.write().await;

        if volumes.contains_key(instance_id) {
            debug!("Volume for {} already exists", instance_id);
            return Ok(());
        }

        let path = self.volume_path(instance_id);
        info!("Creating simulated NFS volume at {}", path);
        volumes.insert(
            instance_id.to_string(),
            VolumeState {
                path,
                exported: false,
                quota_bytes: None,
                created_at: chrono::Utc::now(),
            },
        );
        Ok(())
    }

    async fn export_volume(&self, instance_id: &str) -> Result<String> {
        let server = self.config.server.clone();
        self.with_volume("export", instance_id, |volume| {
            volume.exported = true;
            format!("{}:{}", server, volume.path)
        })
        .await
    }

    async fn set_quota(&self, instance_id: &str, bytes: u64) -> Result<()> {
        if bytes == 0 {
            return Err(Self::failed(
                "set_quota",
                instance_id,
                "quota must be greater than 0 bytes",
            ));
        }
        self.with_volume("set_quota", instance_id, |volume| {
            volume.quota_bytes = Some(bytes);
        })
        .await
    }

    async fn unexport_volume(&self, instance_id: &str) -> Result<()> {
        self.with_volume("unexport", instance_id, |volume| {
            volume.exported = false;
        })
        .await
    }

    async fn clear_quota(&self, instance_id: &str) -> Result<()> {
        self.with_volume("clear_quota", instance_id, |volume| {
            volume.quota_bytes = None;
        })
        .await
    }

    async fn delete_volume(&self, instance_id: &str) -> Result<()> {
        self.check_available()?;
        let mut volumes = self.volumes.write().await;

        match volumes.remove(instance_id) {
            Some(volume) => {
                info!(
                    "Deleted simulated NFS volume at {} (created {})",
                    volume.path, volume.created_at
                );
                Ok(())
            }
            None => Err(Self::failed("delete", instance_id, "volume does not exist")),
        }
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.available.load(Ordering::Relaxed))
    }

    fn backend_name(&self) -> &str {
        BACKEND_NAME
    }
}
