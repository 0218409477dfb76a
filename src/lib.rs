//! NFS Volume Broker
//!
//! A service broker for NFS volumes: provisions backend volumes, binds
//! applications to them with validated mount options, and keeps a persisted
//! registry of instances and bindings so repeated requests are idempotent and
//! conflicting reuse of identifiers is detected.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          Broker Orchestrator                        │
//! │        provision · deprovision · bind · unbind · services           │
//! ├──────────────────────┬───────────────────────┬──────────────────────┤
//! │   Mount Merge        │   Volume Identity     │  Instance Registry   │
//! │   (policy + params)  │   (xxh64 of config)   │  (mutex + flush)     │
//! ├──────────────────────┴───────────────────────┼──────────────────────┤
//! │              Volume Provisioner              │     State Store      │
//! │              (simulated NFS filer)           │   (memory / file)    │
//! └──────────────────────────────────────────────┴──────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`broker`]: Orchestrator, catalog and provisioner backends
//! - [`mount`]: Parameter decoding, merge policy, merge engine, identity
//! - [`registry`]: Instance and binding registry
//! - [`store`]: State store adapters
//! - [`domain`]: Registry records and port traits
//! - [`config`]: Daemon configuration
//! - [`metrics`]: Prometheus exposition
//! - [`error`]: Error types and handling

pub mod broker;
pub mod config;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod mount;
pub mod registry;
pub mod store;

// Re-export commonly used types
pub use broker::{
    backends::{BackendConfig, BackendFactory, SimulatedNfsBackend, SimulatedNfsConfig},
    BindingResponse, Broker, BrokerSettings, BrokerStatsSnapshot, ServiceCatalog, ServicePlan,
    SharedDevice, VolumeMount,
};

pub use config::BrokerConfig;

pub use domain::ports::{
    BindRequest, BindingDetails, ProvisionRequest, ServiceInstance, StateStore, StateStoreRef,
    VolumeProvisioner, VolumeProvisionerRef,
};

pub use error::{Error, ErrorKind, ResourceKind, Result};

pub use metrics::BrokerMetrics;

pub use mount::{
    identify, merge_mount_options, parse_parameters, validate_share, volume_id, BindParameters,
    EffectiveMountConfig, MergePolicy, MergedMount, MountMode, ParamValue,
};

pub use registry::{InstanceRegistry, RegistryEvent, RegistryStatsSnapshot};

pub use store::{FileStore, FileStoreConfig, MemoryStore, StoreConfig, StoreFactory, StoreKind};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
