//! Domain Ports - Core records and trait definitions for the broker
//!
//! These traits define the boundaries between the broker logic and external
//! systems. Adapters implement them to provide concrete persistence and
//! volume provisioning.

use crate::error::Result;
use crate::mount::{parse_parameters, BindParameters};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Registry Records
// =============================================================================

/// A provisioned service instance
///
/// The caller identifiers are opaque; they only take part in conflict
/// detection on re-provision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub service_id: String,
    pub plan_id: String,
    pub organization_id: String,
    pub space_id: String,
    /// Backend locator of the exported volume, set once at provision time
    pub fingerprint: String,
}

/// A recorded binding of an application to an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingDetails {
    /// Instance the binding was created against
    pub instance_id: String,
    /// Consuming application
    pub app_id: String,
    /// Parameters exactly as the caller submitted them
    #[serde(default)]
    pub parameters: BindParameters,
}

// =============================================================================
// Requests
// =============================================================================

/// Request to provision a new instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub service_id: String,
    pub plan_id: String,
    pub organization_id: String,
    pub space_id: String,
}

impl ProvisionRequest {
    /// Instance record for this request once the backend has exported it
    pub fn into_instance(self, fingerprint: impl Into<String>) -> ServiceInstance {
        ServiceInstance {
            service_id: self.service_id,
            plan_id: self.plan_id,
            organization_id: self.organization_id,
            space_id: self.space_id,
            fingerprint: fingerprint.into(),
        }
    }
}

/// Request to bind an application to an instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BindRequest {
    /// Consuming application; a bind without one is rejected
    pub app_id: Option<String>,
    #[serde(default)]
    pub parameters: BindParameters,
}

impl BindRequest {
    /// Build a request from raw JSON parameters
    pub fn from_raw(app_id: Option<String>, raw_parameters: &[u8]) -> Result<Self> {
        Ok(Self {
            app_id,
            parameters: parse_parameters(raw_parameters)?,
        })
    }
}

// =============================================================================
// State Store Port
// =============================================================================

/// Durable slot holding the encoded registry
///
/// Calls are synchronous: the registry invokes them while holding its lock.
pub trait StateStore: Send + Sync {
    /// Read the last saved state; `None` when nothing was ever saved
    fn load(&self) -> Result<Option<Bytes>>;

    /// Replace the saved state
    fn save(&self, data: Bytes) -> Result<()>;

    /// Store name for logs and errors
    fn store_name(&self) -> &str;
}

// =============================================================================
// Volume Provisioner Port
// =============================================================================

/// Backend that creates and exports the volumes behind instances
#[async_trait]
pub trait VolumeProvisioner: Send + Sync {
    /// Create the backing volume for an instance
    async fn create_volume(&self, instance_id: &str) -> Result<()>;

    /// Export the volume and return its locator (the instance fingerprint)
    async fn export_volume(&self, instance_id: &str) -> Result<String>;

    /// Limit the volume to `bytes`
    async fn set_quota(&self, instance_id: &str, bytes: u64) -> Result<()>;

    /// Withdraw the export
    async fn unexport_volume(&self, instance_id: &str) -> Result<()>;

    /// Remove any quota
    async fn clear_quota(&self, instance_id: &str) -> Result<()>;

    /// Delete the backing volume
    async fn delete_volume(&self, instance_id: &str) -> Result<()>;

    /// Check backend health
    async fn health_check(&self) -> Result<bool>;

    /// Get backend name
    fn backend_name(&self) -> &str;
}

// =============================================================================
// Type Aliases for Arc-wrapped traits
// =============================================================================

pub type StateStoreRef = Arc<dyn StateStore>;
pub type VolumeProvisionerRef = Arc<dyn VolumeProvisioner>;
