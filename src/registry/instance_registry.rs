//! Instance and Binding Registry
//!
//! Authoritative record of provisioned instances and their bindings.
//!
//! Every operation runs under a single exclusive lock covering both maps, and
//! every mutation is flushed to the [`StateStore`] before the lock is released.
//! A failed flush is reported to the caller but the in-memory change stays:
//! memory is ahead of the store until the next successful flush.

use super::RegistryEvent;
use crate::domain::ports::{BindingDetails, ServiceInstance, StateStoreRef};
use crate::error::{Error, ResourceKind, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

// =============================================================================
// Constants
// =============================================================================

/// Version tag of the persisted envelope
pub const STATE_FORMAT_VERSION: u32 = 1;

/// Capacity of the event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// Persisted Envelope
// =============================================================================

#[derive(Debug, Default)]
struct RegistryState {
    instances: BTreeMap<String, ServiceInstance>,
    bindings: BTreeMap<String, BindingDetails>,
}

/// Borrowed view written on every flush
#[derive(Serialize)]
struct PersistedStateRef<'a> {
    version: u32,
    saved_at: DateTime<Utc>,
    instances: &'a BTreeMap<String, ServiceInstance>,
    bindings: &'a BTreeMap<String, BindingDetails>,
}

/// Owned form read back on restore
#[derive(Deserialize)]
struct PersistedState {
    version: u32,
    #[serde(default)]
    saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    instances: BTreeMap<String, ServiceInstance>,
    #[serde(default)]
    bindings: BTreeMap<String, BindingDetails>,
}

// =============================================================================
// Registry Statistics
// =============================================================================

/// Registry counters
#[derive(Debug, Default)]
pub struct RegistryStats {
    /// Instances currently recorded
    pub instances: AtomicU64,
    /// Bindings currently recorded
    pub bindings: AtomicU64,
    /// Successful flushes
    pub flushes: AtomicU64,
    /// Failed flushes
    pub flush_failures: AtomicU64,
    /// Create calls rejected for differing details
    pub conflicts: AtomicU64,
}

impl RegistryStats {
    /// Create a snapshot of current stats
    pub fn snapshot(&self) -> RegistryStatsSnapshot {
        RegistryStatsSnapshot {
            instances: self.instances.load(Ordering::Relaxed),
            bindings: self.bindings.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
        }
    }

    fn record_sizes(&self, state: &RegistryState) {
        self.instances
            .store(state.instances.len() as u64, Ordering::Relaxed);
        self.bindings
            .store(state.bindings.len() as u64, Ordering::Relaxed);
    }
}

/// Snapshot of registry statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStatsSnapshot {
    pub instances: u64,
    pub bindings: u64,
    pub flushes: u64,
    pub flush_failures: u64,
    pub conflicts: u64,
}

// =============================================================================
// Instance Registry
// =============================================================================

/// Registry of service instances and bindings
pub struct InstanceRegistry {
    /// Both maps, under one lock
    state: Mutex<RegistryState>,
    /// Durable slot for the encoded maps
    store: StateStoreRef,
    /// Registry statistics
    stats: RegistryStats,
    /// Event broadcaster
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl InstanceRegistry {
    /// Create an empty registry persisting to `store`
    pub fn new(store: StateStoreRef) -> Arc<Self> {
        let (event_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Arc::new(Self {
            state: Mutex::new(RegistryState::default()),
            store,
            stats: RegistryStats::default(),
            event_sender,
        })
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    /// Get registry statistics
    pub fn stats(&self) -> RegistryStatsSnapshot {
        self.stats.snapshot()
    }

    /// Name of the backing store
    pub fn store_name(&self) -> &str {
        self.store.store_name()
    }

    /// Load persisted state, replacing whatever is in memory
    ///
    /// A store that was never written, or holds only whitespace, is a fresh
    /// start. Anything else that fails to decode is [`Error::CorruptState`].
    pub fn restore(&self) -> Result<()> {
        let mut state = self.state.lock();

        let data = match self.store.load()? {
            Some(data) if !data.iter().all(u8::is_ascii_whitespace) => data,
            _ => {
                info!(
                    "No persisted registry state in {} store, starting fresh",
                    self.store.store_name()
                );
                *state = RegistryState::default();
                self.stats.record_sizes(&state);
                return Ok(());
            }
        };

        let persisted: PersistedState =
            serde_json::from_slice(&data).map_err(|e| Error::CorruptState(e.to_string()))?;
        if persisted.version != STATE_FORMAT_VERSION {
            return Err(Error::CorruptState(format!(
                "unsupported state format version {}",
                persisted.version
            )));
        }

        *state = RegistryState {
            instances: persisted.instances,
            bindings: persisted.bindings,
        };
        self.stats.record_sizes(&state);

        info!(
            "Restored {} instances and {} bindings (saved at {})",
            state.instances.len(),
            state.bindings.len(),
            persisted
                .saved_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string())
        );
        let _ = self.event_sender.send(RegistryEvent::StateRestored {
            instances: state.instances.len(),
            bindings: state.bindings.len(),
        });

        Ok(())
    }

    // =========================================================================
    // Instances
    // =========================================================================

    /// Record an instance
    ///
    /// Re-creating an instance with equal details succeeds without change;
    /// different details are a [`Error::Conflict`].
    pub fn create_instance(&self, instance_id: &str, details: ServiceInstance) -> Result<()> {
        let mut state = self.state.lock();

        match state.instances.get(instance_id) {
            Some(existing) if *existing == details => {
                debug!("Instance {} already exists with identical details", instance_id);
            }
            Some(_) => {
                self.stats.conflicts.fetch_add(1, Ordering::Relaxed);
                warn!("Instance {} already exists with different details", instance_id);
                return Err(Error::Conflict {
                    kind: ResourceKind::Instance,
                    id: instance_id.to_string(),
                });
            }
            None => {
                state.instances.insert(instance_id.to_string(), details);
                self.stats.record_sizes(&state);
                info!("Created instance {}", instance_id);
                let _ = self.event_sender.send(RegistryEvent::InstanceCreated {
                    instance_id: instance_id.to_string(),
                });
            }
        }

        self.flush_locked(&state)
    }

    /// Get a copy of an instance
    pub fn retrieve_instance(&self, instance_id: &str) -> Result<ServiceInstance> {
        let state = self.state.lock();
        state
            .instances
            .get(instance_id)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: ResourceKind::Instance,
                id: instance_id.to_string(),
            })
    }

    /// Remove an instance
    pub fn delete_instance(&self, instance_id: &str) -> Result<()> {
        let mut state = self.state.lock();

        if state.instances.remove(instance_id).is_none() {
            return Err(Error::NotFound {
                kind: ResourceKind::Instance,
                id: instance_id.to_string(),
            });
        }
        self.stats.record_sizes(&state);
        info!("Deleted instance {}", instance_id);
        let _ = self.event_sender.send(RegistryEvent::InstanceDeleted {
            instance_id: instance_id.to_string(),
        });

        self.flush_locked(&state)
    }

    // =========================================================================
    // Bindings
    // =========================================================================

    /// Record a binding
    ///
    /// Same idempotence rules as [`create_instance`](Self::create_instance).
    pub fn create_binding(&self, binding_id: &str, details: BindingDetails) -> Result<()> {
        let mut state = self.state.lock();

        match state.bindings.get(binding_id) {
            Some(existing) if *existing == details => {
                debug!("Binding {} already exists with identical details", binding_id);
            }
            Some(_) => {
                self.stats.conflicts.fetch_add(1, Ordering::Relaxed);
                warn!("Binding {} already exists with different details", binding_id);
                return Err(Error::Conflict {
                    kind: ResourceKind::Binding,
                    id: binding_id.to_string(),
                });
            }
            None => {
                let app_id = details.app_id.clone();
                state.bindings.insert(binding_id.to_string(), details);
                self.stats.record_sizes(&state);
                info!("Created binding {} for app {}", binding_id, app_id);
                let _ = self.event_sender.send(RegistryEvent::BindingCreated {
                    binding_id: binding_id.to_string(),
                    app_id,
                });
            }
        }

        self.flush_locked(&state)
    }

    /// Get a copy of a binding
    pub fn retrieve_binding(&self, binding_id: &str) -> Result<BindingDetails> {
        let state = self.state.lock();
        state
            .bindings
            .get(binding_id)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: ResourceKind::Binding,
                id: binding_id.to_string(),
            })
    }

    /// Remove a binding
    pub fn delete_binding(&self, binding_id: &str) -> Result<()> {
        let mut state = self.state.lock();

        if state.bindings.remove(binding_id).is_none() {
            return Err(Error::NotFound {
                kind: ResourceKind::Binding,
                id: binding_id.to_string(),
            });
        }
        self.stats.record_sizes(&state);
        info!("Deleted binding {}", binding_id);
        let _ = self.event_sender.send(RegistryEvent::BindingDeleted {
            binding_id: binding_id.to_string(),
        });

        self.flush_locked(&state)
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Write the full registry to the store
    pub fn flush(&self) -> Result<()> {
        let state = self.state.lock();
        self.flush_locked(&state)
    }

    fn flush_locked(&self, state: &RegistryState) -> Result<()> {
        let result = self.encode(state).and_then(|data| self.store.save(data));

        match &result {
            Ok(()) => {
                self.stats.flushes.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.flush_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    "Failed to flush registry to {} store: {}",
                    self.store.store_name(),
                    e
                );
            }
        }
        result
    }

    fn encode(&self, state: &RegistryState) -> Result<Bytes> {
        let persisted = PersistedStateRef {
            version: STATE_FORMAT_VERSION,
            saved_at: Utc::now(),
            instances: &state.instances,
            bindings: &state.bindings,
        };
        Ok(Bytes::from(serde_json::to_vec(&persisted)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::StateStore;
    use crate::mount::ParamValue;
    use crate::store::{FileStore, FileStoreConfig, MemoryStore};
    use assert_matches::assert_matches;

    fn instance(fingerprint: &str) -> ServiceInstance {
        ServiceInstance {
            service_id: "nfs-service".into(),
            plan_id: "5GB".into(),
            organization_id: "org".into(),
            space_id: "space".into(),
            fingerprint: fingerprint.into(),
        }
    }

    fn binding(uid: &str) -> BindingDetails {
        let mut parameters = crate::mount::BindParameters::new();
        parameters.insert("uid".into(), ParamValue::from(uid));
        BindingDetails {
            instance_id: "i1".into(),
            app_id: "app".into(),
            parameters,
        }
    }

    fn registry() -> (Arc<MemoryStore>, Arc<InstanceRegistry>) {
        let store = Arc::new(MemoryStore::new());
        let registry = InstanceRegistry::new(store.clone());
        (store, registry)
    }

    #[test]
    fn test_create_instance_is_idempotent() {
        let (store, registry) = registry();

        registry.create_instance("i1", instance("srv:/a")).unwrap();
        registry.create_instance("i1", instance("srv:/a")).unwrap();

        assert_eq!(registry.retrieve_instance("i1").unwrap(), instance("srv:/a"));
        assert_eq!(registry.stats().instances, 1);
        // The no-op create still flushes
        assert_eq!(store.save_count(), 2);
    }

    #[test]
    fn test_create_instance_conflict() {
        let (_store, registry) = registry();

        registry.create_instance("i1", instance("srv:/a")).unwrap();
        let err = registry
            .create_instance("i1", instance("srv:/b"))
            .unwrap_err();

        assert_matches!(err, Error::Conflict { kind: ResourceKind::Instance, ref id } if id == "i1");
        assert_eq!(registry.retrieve_instance("i1").unwrap().fingerprint, "srv:/a");
        assert_eq!(registry.stats().conflicts, 1);
    }

    #[test]
    fn test_missing_entries() {
        let (_store, registry) = registry();

        assert_matches!(
            registry.retrieve_instance("nope"),
            Err(Error::NotFound { kind: ResourceKind::Instance, .. })
        );
        assert_matches!(
            registry.delete_instance("nope"),
            Err(Error::NotFound { kind: ResourceKind::Instance, .. })
        );
        assert_matches!(
            registry.retrieve_binding("nope"),
            Err(Error::NotFound { kind: ResourceKind::Binding, .. })
        );
        assert_matches!(
            registry.delete_binding("nope"),
            Err(Error::NotFound { kind: ResourceKind::Binding, .. })
        );
    }

    #[test]
    fn test_binding_lifecycle() {
        let (_store, registry) = registry();

        registry.create_binding("b1", binding("1000")).unwrap();
        registry.create_binding("b1", binding("1000")).unwrap();
        assert_matches!(
            registry.create_binding("b1", binding("9999")),
            Err(Error::Conflict { kind: ResourceKind::Binding, .. })
        );

        assert_eq!(registry.retrieve_binding("b1").unwrap(), binding("1000"));
        registry.delete_binding("b1").unwrap();
        assert!(registry.retrieve_binding("b1").is_err());
    }

    #[test]
    fn test_flush_failure_keeps_memory_change() {
        let (store, registry) = registry();
        store.set_available(false);

        let err = registry.create_instance("i1", instance("srv:/a")).unwrap_err();
        assert_matches!(err, Error::Persistence { .. });

        // Memory is ahead of the store
        assert!(registry.retrieve_instance("i1").is_ok());
        assert_eq!(registry.stats().flush_failures, 1);

        store.set_available(true);
        registry.flush().unwrap();
        assert!(store.contents().is_some());
    }

    #[test]
    fn test_restore_round_trip() {
        let (store, registry) = registry();
        registry.create_instance("i1", instance("srv:/a")).unwrap();
        registry.create_binding("b1", binding("1000")).unwrap();

        let restored = InstanceRegistry::new(store.clone());
        let mut events = restored.subscribe();
        restored.restore().unwrap();

        assert_eq!(restored.retrieve_instance("i1").unwrap(), instance("srv:/a"));
        assert_eq!(restored.retrieve_binding("b1").unwrap(), binding("1000"));
        assert_eq!(restored.stats().bindings, 1);
        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::StateRestored {
                instances: 1,
                bindings: 1
            }
        );
    }

    #[test]
    fn test_file_restore_keeps_bind_idempotent() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("state.json");
        let mut parameters = crate::mount::BindParameters::new();
        parameters.insert("uid".into(), ParamValue::from(1000i64));
        parameters.insert(
            "timeo".into(),
            ParamValue::Number(serde_json::Number::from_f64(1.5).unwrap()),
        );
        parameters.insert("readonly".into(), ParamValue::from(true));
        parameters.insert("share".into(), ParamValue::from("srv/export"));
        let details = BindingDetails {
            instance_id: "i1".into(),
            app_id: "app".into(),
            parameters,
        };

        let store = Arc::new(FileStore::new(FileStoreConfig::new(&path)).unwrap());
        let registry = InstanceRegistry::new(store);
        registry.create_instance("i1", instance("srv:/a")).unwrap();
        registry.create_binding("b1", details.clone()).unwrap();

        let store = Arc::new(FileStore::new(FileStoreConfig::new(&path)).unwrap());
        let restored = InstanceRegistry::new(store);
        restored.restore().unwrap();

        assert_eq!(restored.retrieve_binding("b1").unwrap(), details);
        restored.create_binding("b1", details.clone()).unwrap();
        restored.create_instance("i1", instance("srv:/a")).unwrap();
        assert_eq!(restored.stats().conflicts, 0);
        assert_eq!(restored.stats().bindings, 1);

        let mut changed = details;
        changed.parameters.insert("uid".into(), ParamValue::from("1000"));
        assert_matches!(
            restored.create_binding("b1", changed),
            Err(Error::Conflict { kind: ResourceKind::Binding, .. })
        );
    }

    #[test]
    fn test_restore_empty_store() {
        let registry = InstanceRegistry::new(Arc::new(MemoryStore::new()));
        registry.restore().unwrap();
        assert_eq!(registry.stats().instances, 0);

        let registry = InstanceRegistry::new(Arc::new(MemoryStore::with_contents(&b"  \n"[..])));
        registry.restore().unwrap();
    }

    #[test]
    fn test_restore_corrupt_store() {
        let registry =
            InstanceRegistry::new(Arc::new(MemoryStore::with_contents(&b"{\"version\":1,"[..])));
        assert_matches!(registry.restore(), Err(Error::CorruptState(_)));

        let registry = InstanceRegistry::new(Arc::new(MemoryStore::with_contents(
            &br#"{"version":99,"instances":{},"bindings":{}}"#[..],
        )));
        assert_matches!(registry.restore(), Err(Error::CorruptState(_)));
    }

    #[test]
    fn test_restore_unavailable_store() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let registry = InstanceRegistry::new(store);

        assert_matches!(registry.restore(), Err(Error::Persistence { .. }));
    }

    #[test]
    fn test_persisted_envelope() {
        let (store, registry) = registry();
        registry.create_instance("i1", instance("srv:/a")).unwrap();

        let saved: serde_json::Value =
            serde_json::from_slice(&store.load().unwrap().unwrap()).unwrap();
        assert_eq!(saved["version"], STATE_FORMAT_VERSION);
        assert!(saved["saved_at"].is_string());
        assert_eq!(saved["instances"]["i1"]["fingerprint"], "srv:/a");
        assert!(saved["bindings"].as_object().unwrap().is_empty());
    }

    #[test]
    fn test_events() {
        let (_store, registry) = registry();
        let mut events = registry.subscribe();

        registry.create_instance("i1", instance("srv:/a")).unwrap();
        registry.create_binding("b1", binding("1")).unwrap();
        registry.delete_binding("b1").unwrap();
        registry.delete_instance("i1").unwrap();

        let received: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert_eq!(received.len(), 4);
        assert!(received[0].is_instance_event());
        assert!(received[1].is_binding_event());
        assert_eq!(
            received[3],
            RegistryEvent::InstanceDeleted {
                instance_id: "i1".into()
            }
        );
    }

    #[test]
    fn test_concurrent_creates() {
        let (store, registry) = registry();

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let id = format!("i-{}-{}", t, i);
                        registry.create_instance(&id, instance(&id)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.stats().instances, 200);
        assert_eq!(store.save_count(), 200);

        let restored = InstanceRegistry::new(store);
        restored.restore().unwrap();
        assert_eq!(restored.stats().instances, 200);
    }
}
