//! Scratch directory management.
//!
//! Every file the orchestrator hands to the external tool (materialized inputs,
//! concat manifests, outputs) is created here under a collision-free name and
//! removed again through [`release_paths`] or a [`CleanupSet`].

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::ScratchConfig;
use crate::error::{FfbatchError, Result};

/// Process-wide counter mixed into generated names
static NAME_COUNTER: AtomicU64 = AtomicU64::new(0);

const MAX_EXTENSION_LEN: usize = 10;
const CREATE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct ScratchDir {
    root: PathBuf,
    prefix: String,
}

impl ScratchDir {
    pub fn new<P: Into<PathBuf>, S: Into<String>>(root: P, prefix: S) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.into(),
        }
    }

    pub fn from_config(config: &ScratchConfig) -> Self {
        Self::new(config.resolve_dir(), config.prefix.clone())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Generate a fresh path without creating anything on disk
    pub fn unique_path(&self, tag: &str, extension: &str) -> PathBuf {
        let timestamp = chrono::Utc::now().format("%Y%m%d%H%M%S%3f");
        let counter = NAME_COUNTER.fetch_add(1, Ordering::Relaxed);
        let random = uuid::Uuid::new_v4().simple().to_string();
        let extension = sanitize_extension(extension, "bin");

        self.root.join(format!(
            "{}_{}_{}_{}_{}.{}",
            self.prefix,
            tag,
            timestamp,
            counter,
            &random[..12],
            extension
        ))
    }

    /// Write `bytes` to a new file in the scratch directory and return its path.
    ///
    /// The file is created synchronously and tracked before any await, so a
    /// cancelled call leaves nothing behind.
    pub async fn materialize(&self, tag: &str, bytes: &[u8], extension: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| FfbatchError::Scratch {
                path: self.root.clone(),
                source,
            })?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let path = self.unique_path(tag, extension);
            let file = match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists && attempt < CREATE_ATTEMPTS => {
                    debug!("Scratch name collision at {}, retrying", path.display());
                    continue;
                }
                Err(source) => return Err(FfbatchError::Scratch { path, source }),
            };

            let mut created = CleanupSet::new();
            created.track(&path);
            let mut file = fs::File::from_std(file);
            if let Err(source) = write_all(&mut file, bytes).await {
                // a partially written file must not outlive the failure
                created.release().await;
                return Err(FfbatchError::Scratch { path, source });
            }
            created.disarm();

            debug!("Materialized {} bytes at {}", bytes.len(), path.display());
            return Ok(path);
        }
    }

    pub async fn materialize_text(&self, tag: &str, text: &str, extension: &str) -> Result<PathBuf> {
        self.materialize(tag, text.as_bytes(), extension).await
    }

}

async fn write_all(file: &mut fs::File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await
}

/// Delete every path that still exists; failures are logged and skipped.
///
/// Returns how many entries were actually removed.
pub async fn release_paths<I, P>(paths: I) -> usize
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let mut removed = 0;
    for path in paths {
        let path = path.as_ref();
        let outcome = match fs::symlink_metadata(path).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await,
            Ok(_) => fs::remove_file(path).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => {
                removed += 1;
                debug!("Released {}", path.display());
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to delete temporary file {}: {}", path.display(), e),
        }
    }
    removed
}

/// Extension of `file_name` if it is usable, otherwise `fallback`.
pub fn extension_of(file_name: Option<&str>, fallback: &str) -> String {
    let candidate = file_name
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .unwrap_or("");
    sanitize_extension(candidate, fallback)
}

fn sanitize_extension(extension: &str, fallback: &str) -> String {
    let extension = extension.trim_start_matches('.');
    let valid = !extension.is_empty()
        && extension.len() <= MAX_EXTENSION_LEN
        && extension.chars().all(|c| c.is_ascii_alphanumeric());

    if valid {
        extension.to_ascii_lowercase()
    } else {
        fallback.trim_start_matches('.').to_string()
    }
}

/// Paths created during one invocation, removed together.
///
/// `release` is the normal way out. A set dropped without being released
/// (panic, cancelled future) removes its files synchronously.
#[derive(Debug, Default)]
pub struct CleanupSet {
    paths: Vec<PathBuf>,
}

impl CleanupSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track<P: Into<PathBuf>>(&mut self, path: P) {
        let path = path.into();
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }

    pub fn extend<I, P>(&mut self, paths: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        for path in paths {
            self.track(path);
        }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Stop tracking every path without deleting anything
    pub fn disarm(&mut self) {
        self.paths.clear();
    }

    pub async fn release(mut self) -> usize {
        let paths = std::mem::take(&mut self.paths);
        release_paths(&paths).await
    }
}

impl Drop for CleanupSet {
    fn drop(&mut self) {
        if self.is_empty() {
            return;
        }
        warn!("Cleanup set dropped with {} unreleased paths", self.paths.len());
        for path in self.paths.drain(..) {
            let outcome = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            if let Err(e) = outcome {
                if e.kind() != ErrorKind::NotFound {
                    warn!("Failed to delete temporary file {}: {}", path.display(), e);
                }
            }
        }
    }
}
