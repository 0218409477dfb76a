//! Registry Events
//!
//! Events emitted by the instance registry for external consumers to react to
//! instance and binding lifecycle changes.

use serde::{Deserialize, Serialize};

/// Events emitted by the instance registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryEvent {
    /// A new instance was recorded
    InstanceCreated { instance_id: String },

    /// An instance was removed
    InstanceDeleted { instance_id: String },

    /// A new binding was recorded
    BindingCreated { binding_id: String, app_id: String },

    /// A binding was removed
    BindingDeleted { binding_id: String },

    /// State was loaded from the store at startup
    StateRestored { instances: usize, bindings: usize },
}

impl RegistryEvent {
    /// Check if this is an instance-level event
    pub fn is_instance_event(&self) -> bool {
        matches!(
            self,
            RegistryEvent::InstanceCreated { .. } | RegistryEvent::InstanceDeleted { .. }
        )
    }

    /// Check if this is a binding-level event
    pub fn is_binding_event(&self) -> bool {
        matches!(
            self,
            RegistryEvent::BindingCreated { .. } | RegistryEvent::BindingDeleted { .. }
        )
    }
}
