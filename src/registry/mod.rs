//! Instance Registry Module
//!
//! Lock-protected record of service instances and bindings, flushed to a
//! state store on every mutation.

pub mod events;
pub mod instance_registry;

pub use events::*;
pub use instance_registry::*;
