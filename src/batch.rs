//! Pending batches of materialized inputs, one per job key.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::error::{FfbatchError, Result};
use crate::store::StateStore;

/// Identifies one logical accumulation, e.g. one workflow node instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey(String);

impl JobKey {
    pub fn new<S: Into<String>>(key: S) -> Self {
        Self(key.into())
    }

    /// Key for the batch of one operation under this job key
    pub fn scoped(&self, operation: &str) -> JobKey {
        JobKey(format!("{}:{}", operation, self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub struct BatchAccumulator {
    store: Arc<dyn StateStore>,
    locks: Mutex<HashMap<JobKey, Arc<AsyncMutex<()>>>>,
}

impl BatchAccumulator {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Take the per-key lock. Invocations for other keys are never blocked.
    pub async fn lock(&self, key: &JobKey) -> Result<BatchGuard<'_>> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| FfbatchError::Store("batch lock table poisoned".to_string()))?;
            let lock = Arc::clone(locks.entry(key.clone()).or_default());
            // entries only referenced by the table belong to idle keys
            locks.retain(|_, entry| Arc::strong_count(entry) > 1);
            lock
        };

        let guard = lock.lock_owned().await;
        Ok(BatchGuard {
            accumulator: self,
            key: key.clone(),
            _guard: guard,
        })
    }

    pub async fn append(&self, key: &JobKey, new_inputs: Vec<PathBuf>) -> Result<usize> {
        self.lock(key).await?.append(new_inputs).await
    }

    pub async fn is_ready(&self, key: &JobKey, threshold: usize) -> Result<bool> {
        self.lock(key).await?.is_ready(threshold).await
    }

    pub async fn drain(&self, key: &JobKey) -> Result<Vec<PathBuf>> {
        self.lock(key).await?.drain().await
    }

    pub async fn pending(&self, key: &JobKey) -> Result<Vec<PathBuf>> {
        self.lock(key).await?.pending().await
    }

    /// Stored entries whose files still exist
    async fn load_live(&self, key: &JobKey) -> Result<(Vec<PathBuf>, usize)> {
        let stored = self.store.get(key.as_str()).await?.unwrap_or_default();
        let total = stored.len();
        let live: Vec<PathBuf> = stored.into_iter().filter(|path| path.is_file()).collect();
        let pruned = total - live.len();
        if pruned > 0 {
            info!("Pruned {} stale entries from batch {}", pruned, key);
        }
        Ok((live, pruned))
    }
}

/// Exclusive access to one key's batch for a read-modify-write sequence
pub struct BatchGuard<'a> {
    accumulator: &'a BatchAccumulator,
    key: JobKey,
    _guard: OwnedMutexGuard<()>,
}

impl BatchGuard<'_> {
    pub fn key(&self) -> &JobKey {
        &self.key
    }

    /// Append `new_inputs` after pruning stale entries; returns the new batch size
    pub async fn append(&mut self, new_inputs: Vec<PathBuf>) -> Result<usize> {
        let (mut batch, _) = self.accumulator.load_live(&self.key).await?;
        batch.extend(new_inputs);
        let count = batch.len();
        self.accumulator.store.set(self.key.as_str(), batch).await?;
        debug!("Batch {} now holds {} files", self.key, count);
        Ok(count)
    }

    pub async fn is_ready(&self, threshold: usize) -> Result<bool> {
        Ok(self.len().await? >= threshold)
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.accumulator.load_live(&self.key).await?.0.len())
    }

    pub async fn pending(&self) -> Result<Vec<PathBuf>> {
        Ok(self.accumulator.load_live(&self.key).await?.0)
    }

    /// Read and clear the batch; an absent batch drains as empty
    pub async fn drain(&mut self) -> Result<Vec<PathBuf>> {
        let (batch, _) = self.accumulator.load_live(&self.key).await?;
        self.accumulator.store.set(self.key.as_str(), Vec::new()).await?;
        debug!("Drained {} files from batch {}", batch.len(), self.key);
        Ok(batch)
    }
}
