//! Service Catalog
//!
//! The single service this broker offers and the plans it can be provisioned
//! with. A plan's size becomes the quota on the instance's volume.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Bytes in one plan gigabyte
pub const GB: u64 = 1024 * 1024 * 1024;

/// Permission the platform must grant for volume services
pub const PERMISSION_VOLUME_MOUNT: &str = "volume_mount";

// =============================================================================
// Service Plan
// =============================================================================

/// A provisionable size of the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePlan {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Quota applied to the volume, in gigabytes
    pub size_gb: u64,
}

impl ServicePlan {
    pub fn new(size_gb: u64) -> Self {
        Self {
            id: size_gb.to_string(),
            name: format!("{}GB", size_gb),
            description: format!("{}GB NFS share.", size_gb),
            size_gb,
        }
    }

    /// Quota size in bytes
    pub fn size_bytes(&self) -> u64 {
        self.size_gb.saturating_mul(GB)
    }
}

// =============================================================================
// Service Catalog
// =============================================================================

/// Catalog entry for the NFS volume service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCatalog {
    pub id: String,
    pub name: String,
    pub description: String,
    pub bindable: bool,
    pub plan_updatable: bool,
    pub tags: Vec<String>,
    pub requires: Vec<String>,
    pub plans: Vec<ServicePlan>,
}

impl ServiceCatalog {
    /// Catalog with the default 5GB and 10GB plans
    pub fn new(service_id: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self::with_plans(service_id, service_name, [5, 10])
    }

    /// Catalog with one plan per size
    pub fn with_plans(
        service_id: impl Into<String>,
        service_name: impl Into<String>,
        sizes_gb: impl IntoIterator<Item = u64>,
    ) -> Self {
        Self {
            id: service_id.into(),
            name: service_name.into(),
            description: "NFS volume service".to_string(),
            bindable: true,
            plan_updatable: false,
            tags: vec!["nfs".to_string()],
            requires: vec![PERMISSION_VOLUME_MOUNT.to_string()],
            plans: sizes_gb.into_iter().map(ServicePlan::new).collect(),
        }
    }

    /// Look up a plan by id
    pub fn plan(&self, plan_id: &str) -> Result<&ServicePlan> {
        let plan = self
            .plans
            .iter()
            .find(|p| p.id == plan_id)
            .ok_or_else(|| Error::invalid("plan_id", format!("unknown plan '{}'", plan_id)))?;

        if plan.size_gb == 0 {
            return Err(Error::invalid(
                "plan_id",
                "plan size must be greater than 0 bytes",
            ));
        }
        Ok(plan)
    }
}
