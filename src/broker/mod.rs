//! Broker Module
//!
//! The service broker proper:
//! - Catalog: the offered service and its plans
//! - Backends: provisioner adapters
//! - Orchestrator: the provision/deprovision/bind/unbind verbs

pub mod backends;
pub mod catalog;
pub mod orchestrator;

pub use catalog::{ServiceCatalog, ServicePlan, GB, PERMISSION_VOLUME_MOUNT};
pub use orchestrator::*;
