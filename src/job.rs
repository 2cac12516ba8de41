//! Job orchestration.
//!
//! An invocation materializes its items, adds them to the job's pending batch and,
//! once the batch is large enough, drains it, resolves the command template, runs
//! the tool and packages the output. Everything created on the way is tracked in a
//! [`CleanupSet`] that is released before the invocation returns, whatever happened.

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::batch::{BatchAccumulator, BatchGuard, JobKey};
use crate::config::{Config, TextOverlayConfig};
use crate::error::{FfbatchError, Result};
use crate::media::{
    parse_probe_output, CommandTemplate, MediaCommand, MediaInfo, MediaProbe, MediaToolFactory,
    Overrides, PlaceholderMap, PlaceholderValue, ProcessExecutor,
};
use crate::scratch::{extension_of, release_paths, CleanupSet, ScratchDir};
use crate::store::{StateStore, StateStoreFactory};

/// Number of inputs an overlay consumes: one video, one audio
const OVERLAY_INPUTS: usize = 2;
const DEFAULT_EXTENSION: &str = "mp4";

/// One binary payload delivered by the host
#[derive(Debug, Clone)]
pub struct IncomingItem {
    pub data: Vec<u8>,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
}

impl IncomingItem {
    pub fn new(data: Vec<u8>, file_name: Option<String>) -> Self {
        let mime_type = file_name.as_deref().map(|name| mime_for(name).to_string());
        Self {
            data,
            file_name,
            mime_type,
        }
    }

    pub async fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await.map_err(|e| {
            FfbatchError::InvalidInput(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
        Ok(Self::new(data, file_name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Idle,
    Accumulating,
    Ready,
    Executing,
    Finalizing,
    Failed,
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Accumulating => "accumulating",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Finalizing => "finalizing",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OverlayMode {
    /// Put the second file's audio under the first file's video
    Audio,
    /// Same, with a drawtext filter on the video
    Text(TextOverlayConfig),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Merge,
    Overlay(OverlayMode),
    Custom,
    Info,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Overlay(_) => "overlay",
            Self::Custom => "custom",
            Self::Info => "info",
        }
    }

    /// Scope of the pending batch, for operations that accumulate
    pub fn batch_scope(&self) -> Option<&'static str> {
        match self {
            Self::Merge | Self::Overlay(_) => Some(self.name()),
            Self::Custom | Self::Info => None,
        }
    }
}

/// Per-invocation settings; unset fields come from the configuration
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub template: Option<String>,
    pub threshold: Option<usize>,
    pub overrides: Option<Overrides>,
    pub output_file_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JobRequest {
    pub key: JobKey,
    pub operation: Operation,
    pub items: Vec<IncomingItem>,
    pub options: JobOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    pub success: bool,
    pub file_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_count: Option<usize>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutput {
    Artifact {
        record: ArtifactRecord,
        artifact: Artifact,
    },
    Info(MediaInfo),
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// The batch is below its threshold; nothing was run
    StillAccumulating { pending: usize, threshold: usize },
    Completed(Vec<JobOutput>),
}

enum Accumulation {
    Pending(usize),
    Ready(Vec<PathBuf>),
}

pub struct Orchestrator {
    config: Config,
    scratch: ScratchDir,
    accumulator: BatchAccumulator,
    executor: Arc<dyn ProcessExecutor>,
    probe: Arc<dyn MediaProbe>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        store: Arc<dyn StateStore>,
        executor: Arc<dyn ProcessExecutor>,
        probe: Arc<dyn MediaProbe>,
    ) -> Self {
        let scratch = ScratchDir::from_config(&config.scratch);
        Self {
            config,
            scratch,
            accumulator: BatchAccumulator::new(store),
            executor,
            probe,
        }
    }

    /// Orchestrator wired to the real tools and the configured state backend
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let store = StateStoreFactory::create_store(&config.state);
        let executor = MediaToolFactory::create_executor();
        let probe = MediaToolFactory::create_probe(&config.media);
        Ok(Self::new(config, store, executor, probe))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scratch(&self) -> &ScratchDir {
        &self.scratch
    }

    pub async fn execute(&self, request: JobRequest) -> Result<JobOutcome> {
        let JobRequest {
            key,
            operation,
            items,
            options,
        } = request;
        info!(
            "Running {} for job {} with {} items",
            operation.name(),
            key,
            items.len()
        );

        match operation {
            Operation::Merge => self.merge(&key, items, &options).await,
            Operation::Overlay(mode) => self.overlay(&key, items, &mode, &options).await,
            Operation::Custom => self.custom(&key, items, &options).await,
            Operation::Info => self.info(&key, items).await,
        }
    }

    /// Concatenate every file of the batch once `threshold` files have arrived
    pub async fn merge(
        &self,
        key: &JobKey,
        items: Vec<IncomingItem>,
        options: &JobOptions,
    ) -> Result<JobOutcome> {
        let threshold = options
            .threshold
            .unwrap_or(self.config.merge.min_files)
            .max(1);
        let batch_key = key.scoped("merge");

        let batch = match self.accumulate(&batch_key, "merge", items, threshold).await? {
            Accumulation::Pending(pending) => {
                return Ok(JobOutcome::StillAccumulating { pending, threshold });
            }
            Accumulation::Ready(batch) => batch,
        };

        let mut cleanup = CleanupSet::new();
        cleanup.extend(batch.iter().cloned());
        let result = self.run_merge(&batch_key, &batch, options, &mut cleanup).await;
        let output = self.finalize(&batch_key, cleanup, result).await?;
        Ok(JobOutcome::Completed(vec![output]))
    }

    async fn run_merge(
        &self,
        key: &JobKey,
        batch: &[PathBuf],
        options: &JobOptions,
        cleanup: &mut CleanupSet,
    ) -> Result<JobOutput> {
        let template = options
            .template
            .as_deref()
            .unwrap_or(&self.config.merge.template);
        let file_name = options
            .output_file_name
            .clone()
            .unwrap_or_else(|| self.config.merge.output_file_name.clone());

        let manifest = self
            .scratch
            .materialize_text("concat", &concat_manifest(batch)?, "txt")
            .await?;
        cleanup.track(&manifest);

        let output = self
            .scratch
            .unique_path("output", &extension_of(Some(&file_name), DEFAULT_EXTENSION));
        cleanup.track(&output);

        let mut values = PlaceholderMap::new();
        values.insert("input".to_string(), PlaceholderValue::path(&manifest));
        values.insert("output".to_string(), PlaceholderValue::path(&output));

        let command = MediaCommand::from_template(
            &self.config.media.binary_path,
            format!("Merge {} files", batch.len()),
            template,
            &values,
            &self.overrides(options),
            &["input", "output"],
        )?;

        self.run_to_artifact(key, command, &output, file_name, Some(batch.len()))
            .await
    }

    /// Combine the first two files of the batch: video from the first, audio from the second
    pub async fn overlay(
        &self,
        key: &JobKey,
        items: Vec<IncomingItem>,
        mode: &OverlayMode,
        options: &JobOptions,
    ) -> Result<JobOutcome> {
        let batch_key = key.scoped("overlay");

        let batch = match self
            .accumulate(&batch_key, "overlay", items, OVERLAY_INPUTS)
            .await?
        {
            Accumulation::Pending(pending) => {
                return Ok(JobOutcome::StillAccumulating {
                    pending,
                    threshold: OVERLAY_INPUTS,
                });
            }
            Accumulation::Ready(batch) => batch,
        };

        let mut cleanup = CleanupSet::new();
        cleanup.extend(batch.iter().cloned());
        let result = self
            .run_overlay(&batch_key, &batch, mode, options, &mut cleanup)
            .await;
        let output = self.finalize(&batch_key, cleanup, result).await?;
        Ok(JobOutcome::Completed(vec![output]))
    }

    async fn run_overlay(
        &self,
        key: &JobKey,
        batch: &[PathBuf],
        mode: &OverlayMode,
        options: &JobOptions,
        cleanup: &mut CleanupSet,
    ) -> Result<JobOutput> {
        let (video, audio) = match batch {
            [video, audio, rest @ ..] => {
                if !rest.is_empty() {
                    warn!(
                        "Overlay batch {} holds {} files, using the first two",
                        key,
                        batch.len()
                    );
                }
                (video, audio)
            }
            _ => {
                return Err(FfbatchError::InvalidInput(format!(
                    "overlay needs {} files, batch {} holds {}",
                    OVERLAY_INPUTS,
                    key,
                    batch.len()
                )));
            }
        };

        let file_name = options
            .output_file_name
            .clone()
            .unwrap_or_else(|| self.config.overlay.output_file_name.clone());
        let output = self
            .scratch
            .unique_path("output", &extension_of(Some(&file_name), DEFAULT_EXTENSION));
        cleanup.track(&output);

        let mut values = PlaceholderMap::new();
        values.insert("video".to_string(), PlaceholderValue::path(video));
        values.insert("audio".to_string(), PlaceholderValue::path(audio));
        values.insert("output".to_string(), PlaceholderValue::path(&output));

        let (template, required): (&str, &[&str]) = match mode {
            OverlayMode::Audio => (
                options
                    .template
                    .as_deref()
                    .unwrap_or(&self.config.overlay.template),
                &["video", "audio", "output"],
            ),
            OverlayMode::Text(text) => {
                insert_text_values(&mut values, text);
                (
                    options
                        .template
                        .as_deref()
                        .unwrap_or(&self.config.overlay.text_template),
                    &["video", "audio", "output", "text"],
                )
            }
        };

        let command = MediaCommand::from_template(
            &self.config.media.binary_path,
            "Overlay",
            template,
            &values,
            &self.overrides(options),
            required,
        )?;

        self.run_to_artifact(key, command, &output, file_name, None)
            .await
    }

    /// Run the custom template once per item; nothing accumulates
    pub async fn custom(
        &self,
        key: &JobKey,
        items: Vec<IncomingItem>,
        options: &JobOptions,
    ) -> Result<JobOutcome> {
        let template = options
            .template
            .as_deref()
            .unwrap_or(&self.config.custom.template);
        CommandTemplate::parse(template)?.require(&["input", "output"])?;

        let mut outputs = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let mut cleanup = CleanupSet::new();
            let result = self
                .run_custom_item(key, item, template, options, &mut cleanup)
                .await;
            match self.finalize(key, cleanup, result).await {
                Ok(output) => outputs.push(output),
                Err(e) => {
                    error!("Custom command failed for item {} of job {}", index, key);
                    return Err(e);
                }
            }
        }

        Ok(JobOutcome::Completed(outputs))
    }

    async fn run_custom_item(
        &self,
        key: &JobKey,
        item: &IncomingItem,
        template: &str,
        options: &JobOptions,
        cleanup: &mut CleanupSet,
    ) -> Result<JobOutput> {
        let extension = extension_of(item.file_name.as_deref(), DEFAULT_EXTENSION);
        let input = self.scratch.materialize("custom_in", &item.data, &extension).await?;
        cleanup.track(&input);

        let file_name = options
            .output_file_name
            .clone()
            .unwrap_or_else(|| self.config.custom.output_file_name.clone());
        let output = self
            .scratch
            .unique_path("custom_out", &extension_of(Some(&file_name), DEFAULT_EXTENSION));
        cleanup.track(&output);

        let mut values = PlaceholderMap::new();
        values.insert("input".to_string(), PlaceholderValue::path(&input));
        values.insert("output".to_string(), PlaceholderValue::path(&output));

        let command = MediaCommand::from_template(
            &self.config.media.binary_path,
            "Custom command",
            template,
            &values,
            &self.overrides(options),
            &["input", "output"],
        )?;

        self.run_to_artifact(key, command, &output, file_name, None)
            .await
    }

    /// Probe every item and return its metadata
    pub async fn info(&self, key: &JobKey, items: Vec<IncomingItem>) -> Result<JobOutcome> {
        let mut outputs = Vec::with_capacity(items.len());

        for item in &items {
            let extension = extension_of(item.file_name.as_deref(), DEFAULT_EXTENSION);
            let path = self.scratch.materialize("info", &item.data, &extension).await?;
            let mut cleanup = CleanupSet::new();
            cleanup.track(&path);

            let raw = self.probe.probe_raw(&path).await;
            cleanup.release().await;

            let info = parse_probe_output(&raw?, item.file_name.as_deref())?;
            debug!(
                "Probed {} for job {}: {} streams",
                item.file_name.as_deref().unwrap_or("<unnamed>"),
                key,
                info.streams.len()
            );
            outputs.push(JobOutput::Info(info));
        }

        Ok(JobOutcome::Completed(outputs))
    }

    /// Files currently waiting in the batch of `operation` under `key`
    pub async fn pending(&self, key: &JobKey, operation: &Operation) -> Result<Vec<PathBuf>> {
        let scope = accumulating_scope(operation)?;
        self.accumulator.pending(&key.scoped(scope)).await
    }

    /// Drop the pending batch and delete its files; returns how many were removed
    pub async fn reset(&self, key: &JobKey, operation: &Operation) -> Result<usize> {
        let scope = accumulating_scope(operation)?;
        let batch = self.accumulator.drain(&key.scoped(scope)).await?;
        let removed = release_paths(&batch).await;
        info!("Reset {} batch for job {}, removed {} files", scope, key, removed);
        Ok(removed)
    }

    fn overrides(&self, options: &JobOptions) -> Overrides {
        match &options.overrides {
            Some(overrides) => overrides.or(&self.config.overrides),
            None => self.config.overrides.clone(),
        }
    }

    /// Materialize `items` and add them to the batch under one lock, draining it
    /// once `threshold` is reached
    async fn accumulate(
        &self,
        key: &JobKey,
        tag: &str,
        items: Vec<IncomingItem>,
        threshold: usize,
    ) -> Result<Accumulation> {
        let mut guard = self.accumulator.lock(key).await?;
        transition(key, JobPhase::Idle, JobPhase::Accumulating);

        // files written by this call, deleted if it fails or is dropped before
        // they are recorded in the batch
        let mut fresh = CleanupSet::new();
        for item in &items {
            let extension = extension_of(item.file_name.as_deref(), DEFAULT_EXTENSION);
            match self.scratch.materialize(tag, &item.data, &extension).await {
                Ok(path) => fresh.track(path),
                Err(e) => {
                    abandon(&mut guard, fresh).await;
                    return Err(e);
                }
            }
        }

        let count = match guard.append(fresh.paths().to_vec()).await {
            Ok(count) => count,
            Err(e) => {
                abandon(&mut guard, fresh).await;
                return Err(e);
            }
        };

        if count < threshold {
            fresh.disarm();
            info!(
                "Waiting for more files for {}. Current: {}, Required: {}",
                key, count, threshold
            );
            return Ok(Accumulation::Pending(count));
        }

        transition(key, JobPhase::Accumulating, JobPhase::Ready);
        match guard.drain().await {
            Ok(batch) => {
                fresh.disarm();
                info!("Processing {} files for {}", batch.len(), key);
                Ok(Accumulation::Ready(batch))
            }
            Err(e) => {
                abandon(&mut guard, fresh).await;
                Err(e)
            }
        }
    }

    async fn run_to_artifact(
        &self,
        key: &JobKey,
        command: MediaCommand,
        output: &Path,
        file_name: String,
        file_count: Option<usize>,
    ) -> Result<JobOutput> {
        transition(key, JobPhase::Ready, JobPhase::Executing);
        info!("Executing {}", command);

        let result = self
            .executor
            .run(&command, self.config.media.timeout())
            .await;
        if !result.is_success() {
            transition(key, JobPhase::Executing, JobPhase::Failed);
        }
        let result = result.into_result(&command.binary_path)?;

        let bytes = tokio::fs::read(output)
            .await
            .map_err(|source| FfbatchError::Scratch {
                path: output.to_path_buf(),
                source,
            })?;

        info!(
            "{} completed in {:.2}s, output {} bytes",
            command.description,
            result.duration.as_secs_f64(),
            bytes.len()
        );

        let record = ArtifactRecord {
            success: true,
            file_size: bytes.len() as u64,
            file_count,
            duration_ms: result.duration.as_millis() as u64,
        };
        let mime_type = mime_for(&file_name).to_string();

        Ok(JobOutput::Artifact {
            record,
            artifact: Artifact {
                bytes,
                file_name,
                mime_type,
            },
        })
    }

    /// Release everything the invocation created, then surface its result
    async fn finalize(
        &self,
        key: &JobKey,
        cleanup: CleanupSet,
        result: Result<JobOutput>,
    ) -> Result<JobOutput> {
        let from = if result.is_ok() {
            JobPhase::Executing
        } else {
            JobPhase::Failed
        };
        transition(key, from, JobPhase::Finalizing);

        let tracked = cleanup.paths().len();
        let released = cleanup.release().await;
        debug!("Released {} of {} temporary paths for {}", released, tracked, key);
        transition(key, JobPhase::Finalizing, JobPhase::Idle);

        if let Err(e) = &result {
            error!("Job {} failed: {}", key, e);
        }
        result
    }
}

/// Clear the batch after a failure and delete its files along with `cleanup`
async fn abandon(guard: &mut BatchGuard<'_>, mut cleanup: CleanupSet) {
    match guard.drain().await {
        Ok(batch) => cleanup.extend(batch),
        Err(e) => warn!("Failed to clear batch {} after error: {}", guard.key(), e),
    }
    let released = cleanup.release().await;
    warn!("Abandoned batch {}, released {} files", guard.key(), released);
}

fn transition(key: &JobKey, from: JobPhase, to: JobPhase) {
    debug!("Job {}: {} -> {}", key, from, to);
}

fn accumulating_scope(operation: &Operation) -> Result<&'static str> {
    operation.batch_scope().ok_or_else(|| {
        FfbatchError::InvalidInput(format!(
            "{} does not accumulate batches",
            operation.name()
        ))
    })
}

fn insert_text_values(values: &mut PlaceholderMap, text: &TextOverlayConfig) {
    let entries = [
        ("text", PlaceholderValue::FilterQuoted(text.text.clone())),
        ("fontfile", PlaceholderValue::FilterQuoted(text.font_file.clone())),
        ("fontsize", PlaceholderValue::FilterBare(text.font_size.to_string())),
        ("fontcolor", PlaceholderValue::FilterBare(text.font_color.clone())),
        ("x", PlaceholderValue::FilterBare(text.x.clone())),
        ("y", PlaceholderValue::FilterBare(text.y.clone())),
    ];
    for (name, value) in entries {
        values.insert(name.to_string(), value);
    }
}

/// Input list for ffmpeg's concat demuxer
pub fn concat_manifest(paths: &[PathBuf]) -> Result<String> {
    let mut manifest = String::new();
    for path in paths {
        let path = path.to_str().ok_or_else(|| {
            FfbatchError::InvalidInput(format!("path is not valid UTF-8: {}", path.display()))
        })?;
        let path = if cfg!(windows) {
            path.replace('\\', "/")
        } else {
            path.to_string()
        };
        manifest.push_str(&format!("file '{}'\n", path.replace('\'', r"'\''")));
    }
    Ok(manifest)
}

/// MIME type for a file name, by extension
pub fn mime_for(file_name: &str) -> &'static str {
    let extension = Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        None | Some("mp4") | Some("m4v") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("mkv") => "video/x-matroska",
        Some("webm") => "video/webm",
        Some("avi") => "video/x-msvideo",
        Some("flv") => "video/x-flv",
        Some("ts") => "video/mp2t",
        Some("mp3") => "audio/mpeg",
        Some("m4a") => "audio/mp4",
        Some("aac") => "audio/aac",
        Some("wav") => "audio/wav",
        Some("ogg") | Some("oga") => "audio/ogg",
        Some("flac") => "audio/flac",
        Some("gif") => "image/gif",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some(_) => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateBackend;
    use crate::media::{ExecutionResult, ExecutionStatus, MockMediaProbe, MockProcessExecutor};
    use crate::store::MemoryStore;
    use assert_fs::TempDir;
    use std::time::Duration;

    fn orchestrator(temp: &TempDir, executor: MockProcessExecutor, probe: MockMediaProbe) -> Orchestrator {
        let mut config = Config::default();
        config.scratch.dir = Some(temp.path().join("scratch"));
        config.state.backend = StateBackend::Memory;
        Orchestrator::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(executor),
            Arc::new(probe),
        )
    }

    fn item(name: &str, data: &[u8]) -> IncomingItem {
        IncomingItem::new(data.to_vec(), Some(name.to_string()))
    }

    fn scratch_files(orchestrator: &Orchestrator) -> Vec<PathBuf> {
        match std::fs::read_dir(orchestrator.scratch().root()) {
            Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn arg_after(command: &MediaCommand, flag: &str) -> String {
        let position = command.args.iter().position(|arg| arg == flag).unwrap();
        command.args[position + 1].clone()
    }

    fn output_of(command: &MediaCommand) -> PathBuf {
        PathBuf::from(command.args.last().unwrap())
    }

    fn finished(status: ExecutionStatus, diagnostics: &str) -> ExecutionResult {
        ExecutionResult {
            status,
            diagnostics: diagnostics.to_string(),
            duration: Duration::from_millis(5),
        }
    }

    fn artifact(outcome: JobOutcome) -> (ArtifactRecord, Artifact) {
        match outcome {
            JobOutcome::Completed(mut outputs) => match outputs.remove(0) {
                JobOutput::Artifact { record, artifact } => (record, artifact),
                other => panic!("expected artifact, got {:?}", other),
            },
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_merge_accumulates_then_runs_once_and_cleans_up() {
        let temp = TempDir::new().unwrap();
        let mut executor = MockProcessExecutor::new();
        executor.expect_run().times(1).returning(|command, _| {
            let manifest = std::fs::read_to_string(arg_after(command, "-i")).unwrap();
            let lines: Vec<&str> = manifest.lines().collect();
            assert_eq!(lines.len(), 2);
            for line in &lines {
                let path = line.trim_start_matches("file '").trim_end_matches('\'');
                assert!(Path::new(path).is_file());
            }
            std::fs::write(output_of(command), b"merged").unwrap();
            finished(ExecutionStatus::Success, "")
        });
        let orchestrator = orchestrator(&temp, executor, MockMediaProbe::new());
        let key = JobKey::new("node-1");

        let first = orchestrator
            .merge(&key, vec![item("a.mp4", b"aaaa")], &JobOptions::default())
            .await
            .unwrap();
        assert_eq!(first, JobOutcome::StillAccumulating { pending: 1, threshold: 2 });
        assert_eq!(orchestrator.pending(&key, &Operation::Merge).await.unwrap().len(), 1);
        let stored = scratch_files(&orchestrator);
        assert_eq!(stored.len(), 1);

        let second = orchestrator
            .merge(&key, vec![item("b.mp4", b"bbbb")], &JobOptions::default())
            .await
            .unwrap();
        let (record, artifact) = artifact(second);

        assert_eq!(artifact.bytes, b"merged");
        assert_eq!(artifact.file_name, "merged_video.mp4");
        assert_eq!(artifact.mime_type, "video/mp4");
        assert!(record.success);
        assert_eq!(record.file_size, 6);
        assert_eq!(record.file_count, Some(2));

        assert!(!stored[0].exists());
        assert!(scratch_files(&orchestrator).is_empty());
        assert!(orchestrator.pending(&key, &Operation::Merge).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_below_threshold_never_runs_tool() {
        let temp = TempDir::new().unwrap();
        let mut executor = MockProcessExecutor::new();
        executor.expect_run().never();
        let orchestrator = orchestrator(&temp, executor, MockMediaProbe::new());
        let key = JobKey::new("node-1");
        let options = JobOptions {
            threshold: Some(5),
            ..Default::default()
        };

        let mut appended = 0;
        for batch in [vec![item("a.mp4", b"a")], vec![item("b.mp4", b"b"), item("c.mp4", b"c")], Vec::new()] {
            appended += batch.len();
            let outcome = orchestrator.merge(&key, batch, &options).await.unwrap();
            assert_eq!(
                outcome,
                JobOutcome::StillAccumulating { pending: appended, threshold: 5 }
            );
        }
        assert_eq!(orchestrator.pending(&key, &Operation::Merge).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_tool_failure_cleans_everything_and_clears_batch() {
        let temp = TempDir::new().unwrap();
        let mut executor = MockProcessExecutor::new();
        executor.expect_run().times(1).returning(|command, _| {
            // a partial output must not survive the failure
            std::fs::write(output_of(command), b"partial").unwrap();
            finished(
                ExecutionStatus::ToolFailure { code: Some(1) },
                "concat.txt: Invalid data found when processing input",
            )
        });
        let orchestrator = orchestrator(&temp, executor, MockMediaProbe::new());
        let key = JobKey::new("node-1");

        let err = orchestrator
            .merge(&key, vec![item("a.mp4", b"a"), item("b.mp4", b"b")], &JobOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::ToolFailure);
        assert!(err.diagnostics().unwrap().contains("Invalid data found"));
        assert!(scratch_files(&orchestrator).is_empty());
        assert!(orchestrator.pending(&key, &Operation::Merge).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_and_timeout_are_surfaced() {
        for (status, kind) in [
            (
                ExecutionStatus::SpawnFailure { reason: "No such file or directory".to_string() },
                crate::error::ErrorKind::Spawn,
            ),
            (
                ExecutionStatus::Timeout { after: Duration::from_secs(1) },
                crate::error::ErrorKind::Timeout,
            ),
        ] {
            let temp = TempDir::new().unwrap();
            let mut executor = MockProcessExecutor::new();
            let returned = status.clone();
            executor
                .expect_run()
                .times(1)
                .returning(move |_, _| finished(returned.clone(), "frame=  10"));
            let orchestrator = orchestrator(&temp, executor, MockMediaProbe::new());
            let key = JobKey::new("node-1");
            let options = JobOptions {
                threshold: Some(1),
                ..Default::default()
            };

            let err = orchestrator
                .merge(&key, vec![item("a.mp4", b"a")], &options)
                .await
                .unwrap_err();

            assert_eq!(err.kind(), kind);
            assert!(scratch_files(&orchestrator).is_empty());
            assert!(orchestrator.pending(&key, &Operation::Merge).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_success_without_output_is_an_error() {
        let temp = TempDir::new().unwrap();
        let mut executor = MockProcessExecutor::new();
        executor
            .expect_run()
            .times(1)
            .returning(|_, _| finished(ExecutionStatus::Success, ""));
        let orchestrator = orchestrator(&temp, executor, MockMediaProbe::new());

        let err = orchestrator
            .merge(
                &JobKey::new("node-1"),
                vec![item("a.mp4", b"a"), item("b.mp4", b"b")],
                &JobOptions::default(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
        assert!(scratch_files(&orchestrator).is_empty());
    }

    #[tokio::test]
    async fn test_bad_template_consumes_batch_without_running() {
        let temp = TempDir::new().unwrap();
        let mut executor = MockProcessExecutor::new();
        executor.expect_run().never();
        let orchestrator = orchestrator(&temp, executor, MockMediaProbe::new());
        let key = JobKey::new("node-1");
        let options = JobOptions {
            template: Some(r#"-f concat -i "{input}" -f null -"#.to_string()),
            ..Default::default()
        };

        let err = orchestrator
            .merge(&key, vec![item("a.mp4", b"a"), item("b.mp4", b"b")], &options)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::Template);
        assert!(scratch_files(&orchestrator).is_empty());
        assert!(orchestrator.pending(&key, &Operation::Merge).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overrides_are_applied() {
        let temp = TempDir::new().unwrap();
        let mut executor = MockProcessExecutor::new();
        executor.expect_run().times(1).returning(|command, _| {
            assert_eq!(&command.args[..4], ["-b:v", "900k", "-c:v", "libx265"]);
            std::fs::write(output_of(command), b"x").unwrap();
            finished(ExecutionStatus::Success, "")
        });
        let orchestrator = orchestrator(&temp, executor, MockMediaProbe::new());
        let options = JobOptions {
            threshold: Some(1),
            overrides: Some(Overrides {
                video_codec: Some("libx265".to_string()),
                audio_codec: Some("copy".to_string()),
                bitrate_kbps: Some(900),
                ..Default::default()
            }),
            output_file_name: Some("joined.mkv".to_string()),
            ..Default::default()
        };

        let outcome = orchestrator
            .merge(&JobKey::new("node-1"), vec![item("a.mp4", b"a")], &options)
            .await
            .unwrap();
        let (_, artifact) = artifact(outcome);
        assert_eq!(artifact.file_name, "joined.mkv");
        assert_eq!(artifact.mime_type, "video/x-matroska");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_invocations_on_one_key_run_once() {
        let temp = TempDir::new().unwrap();
        let mut executor = MockProcessExecutor::new();
        executor.expect_run().times(1).returning(|command, _| {
            std::fs::write(output_of(command), b"merged").unwrap();
            finished(ExecutionStatus::Success, "")
        });
        let orchestrator = Arc::new(orchestrator(&temp, executor, MockMediaProbe::new()));
        let key = JobKey::new("node-1");

        let first = {
            let orchestrator = Arc::clone(&orchestrator);
            let key = key.clone();
            tokio::spawn(async move {
                orchestrator
                    .merge(&key, vec![item("a.mp4", b"a")], &JobOptions::default())
                    .await
            })
        };
        let second = {
            let orchestrator = Arc::clone(&orchestrator);
            let key = key.clone();
            tokio::spawn(async move {
                orchestrator
                    .merge(&key, vec![item("b.mp4", b"b")], &JobOptions::default())
                    .await
            })
        };

        let outcomes = [first.await.unwrap().unwrap(), second.await.unwrap().unwrap()];
        let completed = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, JobOutcome::Completed(_)))
            .count();
        assert_eq!(completed, 1);
        assert!(outcomes.contains(&JobOutcome::StillAccumulating { pending: 1, threshold: 2 }));
        assert!(scratch_files(&orchestrator).is_empty());
    }

    #[tokio::test]
    async fn test_overlay_uses_video_then_audio() {
        let temp = TempDir::new().unwrap();
        let mut executor = MockProcessExecutor::new();
        executor.expect_run().times(1).returning(|command, _| {
            assert_eq!(command.args[0], "-i");
            assert!(command.args[1].ends_with(".mp4"));
            assert_eq!(command.args[2], "-i");
            assert!(command.args[3].ends_with(".mp3"));
            std::fs::write(output_of(command), b"overlaid").unwrap();
            finished(ExecutionStatus::Success, "")
        });
        let orchestrator = orchestrator(&temp, executor, MockMediaProbe::new());
        let key = JobKey::new("node-1");

        let first = orchestrator
            .overlay(&key, vec![item("video.mp4", b"v")], &OverlayMode::Audio, &JobOptions::default())
            .await
            .unwrap();
        assert_eq!(first, JobOutcome::StillAccumulating { pending: 1, threshold: 2 });

        // a merge batch under the same key is unaffected
        assert!(orchestrator.pending(&key, &Operation::Merge).await.unwrap().is_empty());

        let second = orchestrator
            .overlay(&key, vec![item("audio.mp3", b"a")], &OverlayMode::Audio, &JobOptions::default())
            .await
            .unwrap();
        let (record, artifact) = artifact(second);
        assert_eq!(artifact.bytes, b"overlaid");
        assert_eq!(artifact.file_name, "overlay_video.mp4");
        assert_eq!(record.file_count, None);
        assert!(scratch_files(&orchestrator).is_empty());
    }

    #[tokio::test]
    async fn test_text_overlay_builds_drawtext_filter() {
        let temp = TempDir::new().unwrap();
        let mut executor = MockProcessExecutor::new();
        executor.expect_run().times(1).returning(|command, _| {
            assert_eq!(
                arg_after(command, "-vf"),
                "drawtext=text='Hello world':fontfile='/fonts/Sans.ttf':fontsize=32:fontcolor=white:x=(w-text_w)/2:y=20"
            );
            std::fs::write(output_of(command), b"x").unwrap();
            finished(ExecutionStatus::Success, "")
        });
        let orchestrator = orchestrator(&temp, executor, MockMediaProbe::new());
        let mode = OverlayMode::Text(TextOverlayConfig {
            text: "Hello world".to_string(),
            font_file: "/fonts/Sans.ttf".to_string(),
            font_size: 32,
            font_color: "white".to_string(),
            x: "(w-text_w)/2".to_string(),
            y: "20".to_string(),
        });

        let outcome = orchestrator
            .overlay(
                &JobKey::new("node-1"),
                vec![item("video.mp4", b"v"), item("audio.mp3", b"a")],
                &mode,
                &JobOptions::default(),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, JobOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_text_overlay_rejects_quote_breakout() {
        let temp = TempDir::new().unwrap();
        let mut executor = MockProcessExecutor::new();
        executor.expect_run().never();
        let orchestrator = orchestrator(&temp, executor, MockMediaProbe::new());
        let mut text = orchestrator.config().overlay.text.clone();
        text.text = "it's':fontcolor=red".to_string();
        let key = JobKey::new("node-1");

        let err = orchestrator
            .overlay(
                &key,
                vec![item("video.mp4", b"v"), item("audio.mp3", b"a")],
                &OverlayMode::Text(text),
                &JobOptions::default(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::Template);
        assert!(scratch_files(&orchestrator).is_empty());
        let overlay = Operation::Overlay(OverlayMode::Audio);
        assert!(orchestrator.pending(&key, &overlay).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_custom_runs_per_item() {
        let temp = TempDir::new().unwrap();
        let mut executor = MockProcessExecutor::new();
        executor.expect_run().times(2).returning(|command, _| {
            assert_eq!(command.args[2], "-vf");
            let input = std::fs::read(&command.args[1]).unwrap();
            std::fs::write(output_of(command), [input.as_slice(), b"-rotated"].concat()).unwrap();
            finished(ExecutionStatus::Success, "")
        });
        let orchestrator = orchestrator(&temp, executor, MockMediaProbe::new());

        let outcome = orchestrator
            .custom(
                &JobKey::new("node-1"),
                vec![item("one.mov", b"one"), item("two.mov", b"two")],
                &JobOptions::default(),
            )
            .await
            .unwrap();

        let JobOutcome::Completed(outputs) = outcome else {
            panic!("custom never accumulates");
        };
        let bytes: Vec<Vec<u8>> = outputs
            .into_iter()
            .map(|output| match output {
                JobOutput::Artifact { artifact, .. } => artifact.bytes,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(bytes, vec![b"one-rotated".to_vec(), b"two-rotated".to_vec()]);
        assert!(scratch_files(&orchestrator).is_empty());
    }

    #[tokio::test]
    async fn test_info_parses_probe_output() {
        let temp = TempDir::new().unwrap();
        let mut probe = MockMediaProbe::new();
        probe.expect_probe_raw().times(1).returning(|path| {
            assert!(path.is_file());
            Ok(r#"{"format":{"duration":"12.5","size":"1000","bit_rate":"500000","format_name":"mov,mp4"},"streams":[{"index":0,"codec_type":"video","codec_name":"h264","width":640,"height":480}]}"#.to_string())
        });
        let orchestrator = orchestrator(&temp, MockProcessExecutor::new(), probe);

        let outcome = orchestrator
            .info(&JobKey::new("node-1"), vec![item("clip.mp4", b"data")])
            .await
            .unwrap();

        let JobOutcome::Completed(outputs) = outcome else {
            panic!("info never accumulates");
        };
        match &outputs[0] {
            JobOutput::Info(info) => {
                assert_eq!(info.file_name.as_deref(), Some("clip.mp4"));
                assert_eq!(info.duration, 12.5);
                assert_eq!(info.streams[0].width, Some(640));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(scratch_files(&orchestrator).is_empty());
    }

    #[tokio::test]
    async fn test_info_malformed_output_emits_nothing() {
        let temp = TempDir::new().unwrap();
        let mut probe = MockMediaProbe::new();
        probe
            .expect_probe_raw()
            .times(1)
            .returning(|_| Ok("moov atom not found".to_string()));
        let orchestrator = orchestrator(&temp, MockProcessExecutor::new(), probe);

        let err = orchestrator
            .info(&JobKey::new("node-1"), vec![item("clip.mp4", b"data")])
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::Parse);
        assert!(scratch_files(&orchestrator).is_empty());
    }

    #[tokio::test]
    async fn test_reset_discards_pending_batch() {
        let temp = TempDir::new().unwrap();
        let orchestrator = orchestrator(&temp, MockProcessExecutor::new(), MockMediaProbe::new());
        let key = JobKey::new("node-1");

        orchestrator
            .merge(&key, vec![item("a.mp4", b"a")], &JobOptions::default())
            .await
            .unwrap();
        assert_eq!(orchestrator.reset(&key, &Operation::Merge).await.unwrap(), 1);
        assert!(scratch_files(&orchestrator).is_empty());
        assert!(orchestrator.reset(&key, &Operation::Info).await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_merge_leaves_no_unrecorded_files() {
        let temp = TempDir::new().unwrap();
        let mut executor = MockProcessExecutor::new();
        executor.expect_run().never();
        let orchestrator = orchestrator(&temp, executor, MockMediaProbe::new());
        let key = JobKey::new("node-1");
        let options = JobOptions {
            threshold: Some(1000),
            ..Default::default()
        };
        let items: Vec<IncomingItem> = (0..64)
            .map(|i| item(&format!("{}.mp4", i), &vec![0u8; 256 * 1024]))
            .collect();

        let mut merge = tokio_test::task::spawn(orchestrator.merge(&key, items, &options));
        for _ in 0..1000 {
            if merge.poll().is_ready() || !scratch_files(&orchestrator).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        drop(merge);

        // whatever was written is either recorded in the batch or gone
        let pending = orchestrator.pending(&key, &Operation::Merge).await.unwrap();
        let mut on_disk = scratch_files(&orchestrator);
        let mut recorded = pending.clone();
        on_disk.sort();
        recorded.sort();
        assert_eq!(on_disk, recorded);
    }

    #[test]
    fn test_incoming_item_mime_from_name() {
        let named = IncomingItem::new(b"x".to_vec(), Some("song.mp3".to_string()));
        assert_eq!(named.mime_type.as_deref(), Some("audio/mpeg"));
        assert_eq!(IncomingItem::new(Vec::new(), None).mime_type, None);
    }

    #[tokio::test]
    async fn test_execute_dispatches_request() {
        let temp = TempDir::new().unwrap();
        let orchestrator = orchestrator(&temp, MockProcessExecutor::new(), MockMediaProbe::new());

        let outcome = orchestrator
            .execute(JobRequest {
                key: JobKey::new("node-1"),
                operation: Operation::Merge,
                items: vec![item("a.mp4", b"a")],
                options: JobOptions::default(),
            })
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::StillAccumulating { pending: 1, threshold: 2 });
    }

    #[test]
    fn test_concat_manifest_escapes_quotes() {
        let manifest = concat_manifest(&[
            PathBuf::from("/tmp/a.mp4"),
            PathBuf::from("/tmp/it's.mp4"),
        ])
        .unwrap();
        assert_eq!(manifest, "file '/tmp/a.mp4'\nfile '/tmp/it'\\''s.mp4'\n");
    }

    #[test]
    fn test_mime_for() {
        assert_eq!(mime_for("merged_video.mp4"), "video/mp4");
        assert_eq!(mime_for("noext"), "video/mp4");
        assert_eq!(mime_for("song.MP3"), "audio/mpeg");
        assert_eq!(mime_for("data.xyz"), "application/octet-stream");
    }
}
