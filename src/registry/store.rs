//! Durable registry snapshots
//!
//! The registry is small (one record per device), so every commit writes
//! the whole state. `JsonFileStore` replaces the file atomically: the new
//! snapshot is written to a temporary file in the same directory and
//! renamed over the old one only once it is fully on disk.

use super::RegistryState;
use crate::error::{ProvisionError, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tempfile::NamedTempFile;
use tracing::debug;

/// Transactional backing store for the peer registry
#[cfg_attr(test, mockall::automock)]
pub trait RegistryStore: Send + Sync {
    /// Load the last committed state, if any
    fn load(&self) -> Result<Option<RegistryState>>;

    /// Durably replace the committed state
    fn commit(&self, state: &RegistryState) -> Result<()>;
}

/// Registry state persisted as a JSON document
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Create a store backed by `path`
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// Location of the state file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RegistryStore for JsonFileStore {
    fn load(&self) -> Result<Option<RegistryState>> {
        if !self.path.exists() {
            debug!("No registry state at {:?}", self.path);
            return Ok(None);
        }

        let contents = fs::read_to_string(&self.path).map_err(|e| {
            ProvisionError::Storage(format!("Failed to read state file {:?}: {}", self.path, e))
        })?;

        let state = serde_json::from_str(&contents).map_err(|e| {
            ProvisionError::Storage(format!("Corrupt state file {:?}: {}", self.path, e))
        })?;

        Ok(Some(state))
    }

    fn commit(&self, state: &RegistryState) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(|e| {
            ProvisionError::Storage(format!("Failed to create state directory {:?}: {}", dir, e))
        })?;

        let encoded = serde_json::to_vec_pretty(state)?;

        // NamedTempFile is created 0600, which the private keys inside require
        let mut tmp = NamedTempFile::new_in(dir)
            .map_err(|e| ProvisionError::Storage(format!("Failed to create temp file: {}", e)))?;
        tmp.write_all(&encoded)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| ProvisionError::Storage(format!("Failed to write state: {}", e)))?;
        tmp.persist(&self.path).map_err(|e| {
            ProvisionError::Storage(format!("Failed to replace {:?}: {}", self.path, e.error))
        })?;

        debug!("Committed registry state to {:?}", self.path);
        Ok(())
    }
}

/// In-memory store for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    committed: Mutex<Option<RegistryState>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-loaded with `state`
    pub fn with_state(state: RegistryState) -> Self {
        Self {
            committed: Mutex::new(Some(state)),
        }
    }

    /// The most recently committed state
    pub fn committed(&self) -> Option<RegistryState> {
        self.committed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl RegistryStore for MemoryStore {
    fn load(&self) -> Result<Option<RegistryState>> {
        Ok(self.committed())
    }

    fn commit(&self, state: &RegistryState) -> Result<()> {
        *self.committed.lock().unwrap_or_else(PoisonError::into_inner) = Some(state.clone());
        Ok(())
    }
}
