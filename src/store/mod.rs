//! State Store Adapters
//!
//! Provides adapters for the registry's persistence port:
//! - Memory: process-local slot, state is lost on restart
//! - File: single file on the local filesystem

pub mod file;
pub mod memory;

pub use file::{FileStore, FileStoreConfig};
pub use memory::MemoryStore;

use crate::domain::ports::StateStoreRef;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Which store backs the registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    #[default]
    File,
}

/// Persistence settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    /// State file path, required for the file store
    pub path: Option<PathBuf>,
    /// fsync before each rename
    pub sync_writes: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::File,
            path: Some(PathBuf::from("/var/vcap/data/nfsbroker/state.json")),
            sync_writes: true,
        }
    }
}

/// Factory for creating state stores
pub struct StoreFactory;

impl StoreFactory {
    /// Create the store described by `config`
    pub fn create(config: &StoreConfig) -> Result<StateStoreRef> {
        match config.kind {
            StoreKind::Memory => Ok(Arc::new(MemoryStore::new())),
            StoreKind::File => {
                let path = config.path.clone().ok_or_else(|| {
                    Error::Configuration("file store requires a state file path".to_string())
                })?;
                Ok(Arc::new(FileStore::new(FileStoreConfig {
                    path,
                    sync_writes: config.sync_writes,
                })?))
            }
        }
    }
}
