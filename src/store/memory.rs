//! In-memory state store
//!
//! Keeps the last saved registry image in process memory. Used for tests and
//! for running the broker without durable state.

use crate::domain::ports::StateStore;
use crate::error::{Error, Result};
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// State store backed by a single in-memory slot
pub struct MemoryStore {
    /// Last saved image
    contents: RwLock<Option<Bytes>>,
    /// Is the store accepting calls
    available: AtomicBool,
    /// Successful saves
    save_count: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            contents: RwLock::new(None),
            available: AtomicBool::new(true),
            save_count: AtomicU64::new(0),
        }
    }

    /// Create a store that already holds `data`
    pub fn with_contents(data: impl Into<Bytes>) -> Self {
        let store = Self::new();
        *store.contents.write() = Some(data.into());
        store
    }

    /// Set availability (for fault injection)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    /// Number of successful saves
    pub fn save_count(&self) -> u64 {
        self.save_count.load(Ordering::Relaxed)
    }

    /// Current contents
    pub fn contents(&self) -> Option<Bytes> {
        self.contents.read().clone()
    }

    fn unavailable(&self, operation: &str) -> Error {
        Error::Persistence {
            store: self.store_name().to_string(),
            operation: operation.to_string(),
            reason: "store unavailable".to_string(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for MemoryStore {
    fn load(&self) -> Result<Option<Bytes>> {
        if !self.is_available() {
            return Err(self.unavailable("load"));
        }
        Ok(self.contents.read().clone())
    }

    fn save(&self, data: Bytes) -> Result<()> {
        if !self.is_available() {
            return Err(self.unavailable("save"));
        }
        *self.contents.write() = Some(data);
        self.save_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn store_name(&self) -> &str {
        "memory"
    }
}
