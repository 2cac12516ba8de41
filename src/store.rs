//! Key-value storage for state that must survive between invocations.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::config::{StateBackend, StateConfig};
use crate::error::{FfbatchError, Result};

/// Storage for one list of paths per key
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<PathBuf>>>;

    /// Store `value` under `key`; an empty list removes the key
    async fn set(&self, key: &str, value: Vec<PathBuf>) -> Result<()>;
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<PathBuf>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<PathBuf>>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| FfbatchError::Store("memory store lock poisoned".to_string()))?;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<PathBuf>) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| FfbatchError::Store("memory store lock poisoned".to_string()))?;
        if value.is_empty() {
            entries.remove(key);
        } else {
            entries.insert(key.to_string(), value);
        }
        Ok(())
    }
}

/// Store backed by a single JSON document, replaced atomically on every write
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    io_lock: tokio::sync::Mutex<()>,
}

impl FileStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            io_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, Vec<PathBuf>>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                FfbatchError::Store(format!(
                    "Failed to parse state file {}: {}",
                    self.path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(FfbatchError::Store(format!(
                "Failed to read state file {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    fn save(&self, entries: &BTreeMap<String, Vec<PathBuf>>) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let content = serde_json::to_string_pretty(entries)?;
        let mut staged = tempfile::NamedTempFile::new_in(&dir)?;
        staged.write_all(content.as_bytes())?;
        staged.flush()?;
        staged.persist(&self.path).map_err(|e| {
            FfbatchError::Store(format!(
                "Failed to replace state file {}: {}",
                self.path.display(),
                e.error
            ))
        })?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<PathBuf>>> {
        let _guard = self.io_lock.lock().await;
        Ok(self.load()?.remove(key))
    }

    async fn set(&self, key: &str, value: Vec<PathBuf>) -> Result<()> {
        let _guard = self.io_lock.lock().await;
        let mut entries = self.load()?;
        if value.is_empty() {
            entries.remove(key);
        } else {
            entries.insert(key.to_string(), value);
        }
        self.save(&entries)?;
        debug!("Persisted state for {} to {}", key, self.path.display());
        Ok(())
    }
}

/// Factory for state stores
pub struct StateStoreFactory;

impl StateStoreFactory {
    pub fn create_store(config: &StateConfig) -> Arc<dyn StateStore> {
        match config.backend {
            StateBackend::Memory => Arc::new(MemoryStore::new()),
            StateBackend::File => Arc::new(FileStore::new(config.path.clone())),
        }
    }
}
