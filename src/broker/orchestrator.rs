//! Broker Orchestrator
//!
//! Sequences the four broker verbs across the provisioner, the merge engine
//! and the registry:
//! - Provision: create, export and size a volume, then record the instance
//! - Deprovision: tear the volume down, then forget the instance
//! - Bind: merge mount options and record the binding
//! - Unbind: forget the binding
//!
//! Provisioner calls are awaited without any registry lock held. Registry
//! calls run on the blocking pool, since a mutation holds the registry lock
//! through a synchronous store flush.

use super::catalog::ServiceCatalog;
use crate::domain::ports::{
    BindRequest, BindingDetails, ProvisionRequest, VolumeProvisionerRef,
};
use crate::error::{Error, ResourceKind, Result};
use crate::mount::{
    merge_mount_options, volume_id, EffectiveMountConfig, MergePolicy, MountMode,
    DEFAULT_CONTAINER_BASE,
};
use crate::registry::{InstanceRegistry, RegistryStatsSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Volume driver named in every binding
pub const DRIVER_NAME: &str = "nfsv3driver";

/// Device type named in every binding
pub const DEVICE_TYPE_SHARED: &str = "shared";

// =============================================================================
// Binding Response
// =============================================================================

/// Device shared between all apps bound with the same mount config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedDevice {
    pub volume_id: String,
    pub mount_config: EffectiveMountConfig,
}

/// Mount handed to the platform for the consuming application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub container_dir: String,
    pub mode: MountMode,
    pub driver: String,
    pub device_type: String,
    pub device: SharedDevice,
}

/// Result of a successful bind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingResponse {
    /// Always present, always empty
    pub credentials: BTreeMap<String, String>,
    pub volume_mounts: Vec<VolumeMount>,
}

// =============================================================================
// Orchestrator Configuration
// =============================================================================

/// Configuration for the broker
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// Service offered
    pub catalog: ServiceCatalog,
    /// Parent of synthesized container paths
    pub container_base: String,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            catalog: ServiceCatalog::new("nfsbroker", "nfs"),
            container_base: DEFAULT_CONTAINER_BASE.to_string(),
        }
    }
}

// =============================================================================
// Broker Statistics
// =============================================================================

/// Outcome counter for one verb
#[derive(Debug, Default)]
struct VerbCounter {
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl VerbCounter {
    fn record<T>(&self, result: &Result<T>) {
        if result.is_ok() {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> VerbStats {
        VerbStats {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Request outcome counters
#[derive(Debug, Default)]
pub struct BrokerStats {
    provision: VerbCounter,
    deprovision: VerbCounter,
    bind: VerbCounter,
    unbind: VerbCounter,
}

impl BrokerStats {
    /// Create a snapshot of current stats
    pub fn snapshot(&self) -> BrokerStatsSnapshot {
        BrokerStatsSnapshot {
            provision: self.provision.snapshot(),
            deprovision: self.deprovision.snapshot(),
            bind: self.bind.snapshot(),
            unbind: self.unbind.snapshot(),
        }
    }
}

/// Outcomes of one verb
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerbStats {
    pub succeeded: u64,
    pub failed: u64,
}

/// Snapshot of broker statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStatsSnapshot {
    pub provision: VerbStats,
    pub deprovision: VerbStats,
    pub bind: VerbStats,
    pub unbind: VerbStats,
}

// =============================================================================
// Broker
// =============================================================================

/// Service broker for NFS volumes
pub struct Broker {
    settings: BrokerSettings,
    /// Mount option policy
    policy: Arc<MergePolicy>,
    /// Instance and binding registry
    registry: Arc<InstanceRegistry>,
    /// Volume backend
    provisioner: VolumeProvisionerRef,
    /// Request outcomes
    stats: BrokerStats,
}

impl Broker {
    /// Create a new broker
    pub fn new(
        settings: BrokerSettings,
        policy: Arc<MergePolicy>,
        registry: Arc<InstanceRegistry>,
        provisioner: VolumeProvisionerRef,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            policy,
            registry,
            provisioner,
            stats: BrokerStats::default(),
        })
    }

    /// Offered services
    pub fn services(&self) -> Vec<ServiceCatalog> {
        vec![self.settings.catalog.clone()]
    }

    /// Get request statistics
    pub fn stats(&self) -> BrokerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Get registry statistics
    pub fn registry_stats(&self) -> RegistryStatsSnapshot {
        self.registry.stats()
    }

    /// Check provisioner health
    pub async fn backend_healthy(&self) -> bool {
        self.provisioner.health_check().await.unwrap_or(false)
    }

    // =========================================================================
    // Verbs
    // =========================================================================

    /// Provision an instance
    pub async fn provision(&self, instance_id: &str, request: ProvisionRequest) -> Result<()> {
        info!(
            "Provisioning instance {} (service {}, plan {})",
            instance_id, request.service_id, request.plan_id
        );

        let result = self.do_provision(instance_id, request).await;
        self.stats.provision.record(&result);
        log_outcome("provision", instance_id, &result);
        result
    }

    async fn do_provision(&self, instance_id: &str, request: ProvisionRequest) -> Result<()> {
        let quota_bytes = self.settings.catalog.plan(&request.plan_id)?.size_bytes();

        self.backend_step("create", instance_id, self.provisioner.create_volume(instance_id))
            .await?;
        let fingerprint = self
            .backend_step("export", instance_id, self.provisioner.export_volume(instance_id))
            .await?;
        self.backend_step(
            "set_quota",
            instance_id,
            self.provisioner.set_quota(instance_id, quota_bytes),
        )
        .await?;

        debug!("Instance {} exported at {}", instance_id, fingerprint);
        let id = instance_id.to_string();
        let instance = request.into_instance(fingerprint);
        self.with_registry(move |registry| registry.create_instance(&id, instance))
            .await
    }

    /// Deprovision an instance
    pub async fn deprovision(&self, instance_id: &str) -> Result<()> {
        info!("Deprovisioning instance {}", instance_id);

        let result = self.do_deprovision(instance_id).await;
        self.stats.deprovision.record(&result);
        log_outcome("deprovision", instance_id, &result);
        result
    }

    async fn do_deprovision(&self, instance_id: &str) -> Result<()> {
        let id = instance_id.to_string();
        self.with_registry(move |registry| registry.retrieve_instance(&id))
            .await?;

        self.backend_step("unexport", instance_id, self.provisioner.unexport_volume(instance_id))
            .await?;
        self.backend_step("clear_quota", instance_id, self.provisioner.clear_quota(instance_id))
            .await?;
        self.backend_step("delete", instance_id, self.provisioner.delete_volume(instance_id))
            .await?;

        let id = instance_id.to_string();
        self.with_registry(move |registry| registry.delete_instance(&id))
            .await
    }

    /// Bind an application to an instance
    pub async fn bind(
        &self,
        instance_id: &str,
        binding_id: &str,
        request: BindRequest,
    ) -> Result<BindingResponse> {
        info!("Binding {} to instance {}", binding_id, instance_id);

        let result = self.do_bind(instance_id, binding_id, request).await;
        self.stats.bind.record(&result);
        log_outcome("bind", binding_id, &result);
        result
    }

    async fn do_bind(
        &self,
        instance_id: &str,
        binding_id: &str,
        request: BindRequest,
    ) -> Result<BindingResponse> {
        let id = instance_id.to_string();
        let instance = self
            .with_registry(move |registry| registry.retrieve_instance(&id))
            .await?;

        let app_id = request
            .app_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::invalid("app_id", "app guid not provided"))?;

        let merged = merge_mount_options(&self.policy, &request.parameters, &instance.fingerprint)?;
        let volume_id = volume_id(instance_id, &merged.config)?;

        let id = binding_id.to_string();
        let details = BindingDetails {
            instance_id: instance_id.to_string(),
            app_id,
            parameters: request.parameters,
        };
        self.with_registry(move |registry| registry.create_binding(&id, details))
            .await?;

        debug!(
            "Binding {} uses volume {} with {} mount options",
            binding_id,
            volume_id,
            merged.config.len()
        );

        Ok(BindingResponse {
            credentials: BTreeMap::new(),
            volume_mounts: vec![VolumeMount {
                container_dir: merged.container_dir(&self.settings.container_base, instance_id),
                mode: merged.mode,
                driver: DRIVER_NAME.to_string(),
                device_type: DEVICE_TYPE_SHARED.to_string(),
                device: SharedDevice {
                    volume_id,
                    mount_config: merged.config,
                },
            }],
        })
    }

    /// Remove a binding
    pub async fn unbind(&self, instance_id: &str, binding_id: &str) -> Result<()> {
        info!("Unbinding {} from instance {}", binding_id, instance_id);

        let result = self.do_unbind(instance_id, binding_id).await;
        self.stats.unbind.record(&result);
        log_outcome("unbind", binding_id, &result);
        result
    }

    async fn do_unbind(&self, instance_id: &str, binding_id: &str) -> Result<()> {
        let instance_id = instance_id.to_string();
        let binding_id = binding_id.to_string();
        self.with_registry(move |registry| {
            registry.retrieve_instance(&instance_id)?;

            // A binding recorded against another instance is not visible here
            let binding = registry.retrieve_binding(&binding_id)?;
            if binding.instance_id != instance_id {
                return Err(Error::NotFound {
                    kind: ResourceKind::Binding,
                    id: binding_id,
                });
            }

            registry.delete_binding(&binding_id)
        })
        .await
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Run a registry call on the blocking pool
    ///
    /// Registry mutations hold the registry lock through a synchronous store
    /// flush, which must not occupy an async worker thread.
    async fn with_registry<T, F>(&self, call: F) -> Result<T>
    where
        F: FnOnce(&InstanceRegistry) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let registry = self.registry.clone();
        tokio::task::spawn_blocking(move || call(&registry))
            .await
            .map_err(|e| Error::Internal(format!("Registry task failed: {}", e)))?
    }

    /// Await a provisioner call, tagging failures with the operation and
    /// instance
    async fn backend_step<T>(
        &self,
        operation: &str,
        instance_id: &str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        call.await.map_err(|e| match e {
            Error::BackendOperationFailed { .. } => e,
            other => Error::BackendOperationFailed {
                backend: self.provisioner.backend_name().to_string(),
                operation: operation.to_string(),
                instance_id: instance_id.to_string(),
                reason: other.to_string(),
            },
        })
    }
}

fn log_outcome<T>(verb: &str, id: &str, result: &Result<T>) {
    match result {
        Ok(_) => info!("{} {} succeeded", verb, id),
        Err(e) => warn!("{} {} failed: {}", verb, id, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::backends::{SimulatedNfsBackend, SimulatedNfsConfig};
    use crate::domain::ports::{StateStore, VolumeProvisioner};
    use crate::error::ErrorKind;
    use crate::mount::{BindParameters, ParamValue};
    use crate::store::MemoryStore;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::time::{Duration, Instant};
    use tokio_test::{assert_err, assert_ok};

    /// Provisioner that always exports at a fixed locator
    #[derive(Default)]
    struct FixedProvisioner {
        calls: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
    }

    impl FixedProvisioner {
        fn call(&self, operation: &str) -> Result<()> {
            self.calls.lock().push(operation.to_string());
            if self.fail_on == Some(operation) {
                return Err(Error::Internal(format!("{} refused", operation)));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl VolumeProvisioner for FixedProvisioner {
        async fn create_volume(&self, _instance_id: &str) -> Result<()> {
            self.call("create")
        }
        async fn export_volume(&self, _instance_id: &str) -> Result<String> {
            self.call("export")?;
            Ok("srv:/export".to_string())
        }
        async fn set_quota(&self, _instance_id: &str, _bytes: u64) -> Result<()> {
            self.call("set_quota")
        }
        async fn unexport_volume(&self, _instance_id: &str) -> Result<()> {
            self.call("unexport")
        }
        async fn clear_quota(&self, _instance_id: &str) -> Result<()> {
            self.call("clear_quota")
        }
        async fn delete_volume(&self, _instance_id: &str) -> Result<()> {
            self.call("delete")
        }
        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }
        fn backend_name(&self) -> &str {
            "fixed"
        }
    }

    fn policy() -> Arc<MergePolicy> {
        Arc::new(MergePolicy::new(
            ["share", "uid", "gid"],
            Vec::<(&str, &str)>::new(),
            false,
        ))
    }

    fn provision_request() -> ProvisionRequest {
        ProvisionRequest {
            service_id: "nfsbroker".into(),
            plan_id: "5".into(),
            organization_id: "org".into(),
            space_id: "space".into(),
        }
    }

    fn bind_request(pairs: &[(&str, &str)]) -> BindRequest {
        let parameters: BindParameters = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), ParamValue::from(*v)))
            .collect();
        BindRequest {
            app_id: Some("app-guid".into()),
            parameters,
        }
    }

    struct Harness {
        broker: Arc<Broker>,
        store: Arc<MemoryStore>,
        provisioner: Arc<FixedProvisioner>,
    }

    fn harness(provisioner: FixedProvisioner) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let registry = InstanceRegistry::new(store.clone());
        let provisioner = Arc::new(provisioner);
        let broker = Broker::new(
            BrokerSettings::default(),
            policy(),
            registry,
            provisioner.clone(),
        );
        Harness {
            broker,
            store,
            provisioner,
        }
    }

    #[tokio::test]
    async fn test_end_to_end_scenario() {
        let h = harness(FixedProvisioner::default());
        h.broker.provision("i1", provision_request()).await.unwrap();

        let err = h
            .broker
            .bind(
                "i1",
                "b1",
                bind_request(&[("share", "srv:/export"), ("uid", "1234"), ("gid", "5678")]),
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidParameters { ref field, .. } if field == "share");

        let request = bind_request(&[("share", "srv/export"), ("uid", "1234"), ("gid", "5678")]);
        let response = h.broker.bind("i1", "b1", request.clone()).await.unwrap();

        assert!(response.credentials.is_empty());
        let mount = &response.volume_mounts[0];
        assert_eq!(mount.device.mount_config["source"], "nfs://srv/export");
        assert_eq!(mount.device.mount_config["uid"], "1234");
        assert_eq!(mount.device.mount_config["gid"], "5678");
        assert!(mount.device.volume_id.starts_with("i1-"));
        assert_eq!(mount.driver, "nfsv3driver");
        assert_eq!(mount.device_type, "shared");
        assert_eq!(mount.mode, MountMode::ReadWrite);
        assert_eq!(mount.container_dir, "/var/vcap/data/i1");

        let again = h.broker.bind("i1", "b1", request).await.unwrap();
        assert_eq!(again, response);

        let err = h
            .broker
            .bind(
                "i1",
                "b1",
                bind_request(&[("share", "srv/export"), ("uid", "9999"), ("gid", "5678")]),
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::Conflict { kind: ResourceKind::Binding, .. });

        let stats = h.broker.stats();
        assert_eq!(stats.bind.succeeded, 2);
        assert_eq!(stats.bind.failed, 2);
    }

    #[tokio::test]
    async fn test_provision_records_fingerprint() {
        let h = harness(FixedProvisioner::default());
        h.broker.provision("i1", provision_request()).await.unwrap();

        let response = h
            .broker
            .bind("i1", "b1", bind_request(&[("uid", "1")]))
            .await
            .unwrap();
        assert_eq!(
            response.volume_mounts[0].device.mount_config["source"],
            "nfs://srv:/export"
        );
        assert_eq!(
            *h.provisioner.calls.lock(),
            vec!["create", "export", "set_quota"]
        );
        assert!(h.store.save_count() >= 2);
    }

    #[tokio::test]
    async fn test_provision_idempotence_and_conflict() {
        let h = harness(FixedProvisioner::default());
        h.broker.provision("i1", provision_request()).await.unwrap();
        h.broker.provision("i1", provision_request()).await.unwrap();

        let mut other = provision_request();
        other.plan_id = "10".into();
        assert_matches!(
            h.broker.provision("i1", other).await,
            Err(Error::Conflict { kind: ResourceKind::Instance, .. })
        );
    }

    #[tokio::test]
    async fn test_provision_unknown_plan() {
        let h = harness(FixedProvisioner::default());
        let mut request = provision_request();
        request.plan_id = "3".into();

        assert_matches!(
            h.broker.provision("i1", request).await,
            Err(Error::InvalidParameters { ref field, .. }) if field == "plan_id"
        );
        assert!(h.provisioner.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_backend_failure_names_operation() {
        let h = harness(FixedProvisioner {
            fail_on: Some("export"),
            ..Default::default()
        });

        let err = h.broker.provision("i1", provision_request()).await.unwrap_err();
        assert_matches!(err, Error::BackendOperationFailed { ref operation, ref instance_id, .. }
            if operation == "export" && instance_id == "i1");
        assert_eq!(err.kind(), ErrorKind::BackendError);

        // No registry mutation
        assert_matches!(
            h.broker.deprovision("i1").await,
            Err(Error::NotFound { kind: ResourceKind::Instance, .. })
        );
        assert_eq!(h.store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_deprovision() {
        let h = harness(FixedProvisioner::default());

        assert_matches!(
            h.broker.deprovision("i1").await,
            Err(Error::NotFound { kind: ResourceKind::Instance, .. })
        );
        assert!(h.provisioner.calls.lock().is_empty());

        h.broker.provision("i1", provision_request()).await.unwrap();
        h.broker.deprovision("i1").await.unwrap();
        assert_eq!(
            h.provisioner.calls.lock()[3..],
            ["unexport", "clear_quota", "delete"]
        );
        assert_matches!(
            h.broker.bind("i1", "b1", bind_request(&[])).await,
            Err(Error::NotFound { kind: ResourceKind::Instance, .. })
        );
    }

    #[tokio::test]
    async fn test_bind_requires_app_id() {
        let h = harness(FixedProvisioner::default());
        h.broker.provision("i1", provision_request()).await.unwrap();

        let mut request = bind_request(&[]);
        request.app_id = None;
        assert_matches!(
            h.broker.bind("i1", "b1", request).await,
            Err(Error::InvalidParameters { ref field, .. }) if field == "app_id"
        );

        let mut request = bind_request(&[]);
        request.app_id = Some(String::new());
        assert!(h.broker.bind("i1", "b1", request).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_readonly_and_mount_path() {
        let h = harness(FixedProvisioner::default());
        h.broker.provision("i1", provision_request()).await.unwrap();

        let mut request = bind_request(&[("mount", "/var/vcap/otherdir/something")]);
        request
            .parameters
            .insert("readonly".into(), ParamValue::Bool(true));

        let response = h.broker.bind("i1", "b1", request).await.unwrap();
        let mount = &response.volume_mounts[0];
        assert_eq!(mount.mode, MountMode::ReadOnly);
        assert_eq!(mount.device.mount_config["readonly"], "true");
        assert_eq!(mount.container_dir, "/var/vcap/otherdir/something");
        assert!(!mount.device.mount_config.contains_key("mount"));
    }

    #[tokio::test]
    async fn test_unbind() {
        let h = harness(FixedProvisioner::default());

        assert_matches!(
            h.broker.unbind("i1", "b1").await,
            Err(Error::NotFound { kind: ResourceKind::Instance, .. })
        );

        h.broker.provision("i1", provision_request()).await.unwrap();
        assert_matches!(
            h.broker.unbind("i1", "b1").await,
            Err(Error::NotFound { kind: ResourceKind::Binding, .. })
        );

        h.broker
            .bind("i1", "b1", bind_request(&[("uid", "1")]))
            .await
            .unwrap();
        h.broker.unbind("i1", "b1").await.unwrap();
        assert_eq!(h.broker.registry_stats().bindings, 0);
    }

    #[tokio::test]
    async fn test_flush_failure_reports_io_error() {
        let h = harness(FixedProvisioner::default());
        h.broker.provision("i1", provision_request()).await.unwrap();
        h.store.set_available(false);

        let err = h
            .broker
            .bind("i1", "b1", bind_request(&[("uid", "1")]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoError);
        assert!(err.is_transient());

        // Memory already holds the binding
        h.store.set_available(true);
        h.broker
            .bind("i1", "b1", bind_request(&[("uid", "1")]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_binds() {
        let h = harness(FixedProvisioner::default());
        h.broker.provision("i1", provision_request()).await.unwrap();

        let binds = (0..32).map(|i| {
            let broker = h.broker.clone();
            async move {
                let binding_id = format!("b{}", i);
                let uid = (1000 + i % 4).to_string();
                broker
                    .bind("i1", &binding_id, bind_request(&[("uid", uid.as_str())]))
                    .await
            }
        });
        let responses = futures::future::join_all(binds).await;

        assert!(responses.iter().all(|r| r.is_ok()));
        let volume_ids: std::collections::BTreeSet<_> = responses
            .into_iter()
            .map(|r| r.unwrap().volume_mounts[0].device.volume_id.clone())
            .collect();
        // One volume per distinct mount config
        assert_eq!(volume_ids.len(), 4);
        assert_eq!(h.broker.registry_stats().bindings, 32);
    }

    #[tokio::test]
    async fn test_with_simulated_backend() {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(SimulatedNfsBackend::new(SimulatedNfsConfig {
            server: "filer".into(),
            export_root: "/ifs/volumes".into(),
        }));
        let broker = Broker::new(
            BrokerSettings::default(),
            policy(),
            InstanceRegistry::new(store),
            backend.clone(),
        );

        broker.provision("i1", provision_request()).await.unwrap();
        assert_eq!(backend.quota("i1").await, Some(5 * crate::broker::GB));
        assert!(broker.backend_healthy().await);

        let response = broker
            .bind("i1", "b1", bind_request(&[]))
            .await
            .unwrap();
        assert_eq!(
            response.volume_mounts[0].device.mount_config["source"],
            "nfs://filer:/ifs/volumes/i1"
        );

        broker.unbind("i1", "b1").await.unwrap();
        broker.deprovision("i1").await.unwrap();
        assert_eq!(backend.volume_count().await, 0);

        backend.set_available(false);
        assert!(!broker.backend_healthy().await);
    }

    #[tokio::test]
    async fn test_unavailable_backend_names_operation_and_instance() {
        let backend = Arc::new(SimulatedNfsBackend::new(SimulatedNfsConfig::default()));
        let broker = Broker::new(
            BrokerSettings::default(),
            policy(),
            InstanceRegistry::new(Arc::new(MemoryStore::new())),
            backend.clone(),
        );
        broker.provision("inst-7", provision_request()).await.unwrap();
        backend.set_available(false);

        let err = broker
            .provision("inst-42", provision_request())
            .await
            .unwrap_err();
        assert_matches!(err, Error::BackendOperationFailed { ref operation, ref instance_id, .. }
            if operation == "create" && instance_id == "inst-42");
        let message = err.to_string();
        assert!(message.contains("inst-42"));
        assert!(message.contains("create"));
        assert!(message.contains("simulated-nfs"));

        let err = broker.deprovision("inst-7").await.unwrap_err();
        assert_matches!(err, Error::BackendOperationFailed { ref operation, ref instance_id, .. }
            if operation == "unexport" && instance_id == "inst-7");
        assert_eq!(err.kind(), ErrorKind::BackendError);
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_binding_belongs_to_one_instance() {
        let h = harness(FixedProvisioner::default());
        assert_ok!(h.broker.provision("i1", provision_request()).await);
        assert_ok!(h.broker.provision("i2", provision_request()).await);

        let request = bind_request(&[("uid", "1000")]);
        assert_ok!(h.broker.bind("i1", "b1", request.clone()).await);
        assert_matches!(
            h.broker.bind("i2", "b1", request).await,
            Err(Error::Conflict { kind: ResourceKind::Binding, .. })
        );

        assert_matches!(
            h.broker.unbind("i2", "b1").await,
            Err(Error::NotFound { kind: ResourceKind::Binding, .. })
        );
        assert_eq!(h.broker.registry_stats().bindings, 1);
        assert_ok!(h.broker.unbind("i1", "b1").await);
        assert_err!(h.broker.unbind("i1", "b1").await);
    }

    /// Store whose saves sleep on the calling thread
    struct SlowStore {
        inner: MemoryStore,
        delay: Mutex<Duration>,
    }

    impl StateStore for SlowStore {
        fn load(&self) -> Result<Option<Bytes>> {
            self.inner.load()
        }

        fn save(&self, data: Bytes) -> Result<()> {
            let delay = *self.delay.lock();
            std::thread::sleep(delay);
            self.inner.save(data)
        }

        fn store_name(&self) -> &str {
            "slow"
        }
    }

    #[tokio::test]
    async fn test_slow_flush_does_not_stall_runtime() {
        let store = Arc::new(SlowStore {
            inner: MemoryStore::new(),
            delay: Mutex::new(Duration::ZERO),
        });
        let broker = Broker::new(
            BrokerSettings::default(),
            policy(),
            InstanceRegistry::new(store.clone()),
            Arc::new(FixedProvisioner::default()),
        );
        broker.provision("i1", provision_request()).await.unwrap();
        *store.delay.lock() = Duration::from_millis(200);

        // Single-threaded runtime: the timer only fires if bind yields
        let (bound_at, ticked_at) = tokio::join!(
            async {
                broker
                    .bind("i1", "b1", bind_request(&[("uid", "1")]))
                    .await
                    .unwrap();
                Instant::now()
            },
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Instant::now()
            }
        );
        assert!(ticked_at < bound_at);
    }

    #[test]
    fn test_services() {
        let h = harness(FixedProvisioner::default());
        assert!(tokio_test::block_on(h.broker.backend_healthy()));
        let services = h.broker.services();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].plans.len(), 2);
    }
}
