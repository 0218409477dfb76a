//! File-backed state store
//!
//! The registry image lives in a single file. Saves write a sibling temporary
//! file and rename it over the target, so a crash mid-save leaves either the
//! old or the new image on disk.

use crate::domain::ports::StateStore;
use crate::error::{Error, Result};
use bytes::Bytes;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

// =============================================================================
// File Store Configuration
// =============================================================================

/// Configuration for the file store
#[derive(Debug, Clone)]
pub struct FileStoreConfig {
    /// Path of the state file
    pub path: PathBuf,
    /// fsync the temporary file before renaming it into place
    pub sync_writes: bool,
}

impl FileStoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_writes: true,
        }
    }
}

// =============================================================================
// File Store
// =============================================================================

/// State store backed by one file on the local filesystem
pub struct FileStore {
    path: PathBuf,
    temp_path: PathBuf,
    sync_writes: bool,
}

impl FileStore {
    /// Create a store, creating the parent directory if needed
    pub fn new(config: FileStoreConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut temp_name = config
            .path
            .file_name()
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "state file path has no file name: {}",
                    config.path.display()
                ))
            })?
            .to_os_string();
        temp_name.push(".tmp");
        let temp_path = config.path.with_file_name(temp_name);

        Ok(Self {
            path: config.path,
            temp_path,
            sync_writes: config.sync_writes,
        })
    }

    /// Path of the state file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, operation: &str, err: std::io::Error) -> Error {
        Error::Persistence {
            store: self.store_name().to_string(),
            operation: operation.to_string(),
            reason: format!("{}: {}", self.path.display(), err),
        }
    }

    fn write_temp(&self, data: &[u8]) -> std::io::Result<()> {
        let mut file = fs::File::create(&self.temp_path)?;
        file.write_all(data)?;
        if self.sync_writes {
            file.sync_all()?;
        }
        Ok(())
    }
}

impl StateStore for FileStore {
    fn load(&self) -> Result<Option<Bytes>> {
        match fs::read(&self.path) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error("load", e)),
        }
    }

    fn save(&self, data: Bytes) -> Result<()> {
        self.write_temp(&data)
            .map_err(|e| self.io_error("save", e))?;
        fs::rename(&self.temp_path, &self.path).map_err(|e| self.io_error("save", e))?;

        debug!("Saved {} bytes to {}", data.len(), self.path.display());
        Ok(())
    }

    fn store_name(&self) -> &str {
        "file"
    }
}
