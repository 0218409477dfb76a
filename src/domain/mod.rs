//! Domain layer - Registry records and port definitions
//!
//! This module defines the records the registry owns and the traits (ports)
//! that persistence and provisioning adapters implement.

pub mod ports;

pub use ports::*;
