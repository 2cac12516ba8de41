//! Media inspection through ffprobe.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::error::{FfbatchError, Result};
use super::commands::MediaCommandBuilder;

/// Summary of one media file as reported by the probe tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    pub file_name: Option<String>,
    pub format_name: String,
    /// Seconds
    pub duration: f64,
    /// Bytes
    pub size: u64,
    /// Bits per second
    pub bit_rate: u64,
    pub streams: Vec<StreamInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub index: u32,
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub sample_rate: Option<u64>,
    pub channels: Option<u32>,
    pub bit_rate: Option<u64>,
    pub duration: Option<f64>,
}

/// Parse `-print_format json -show_format -show_streams` output.
///
/// Missing fields fall back to defaults; numbers may be given as JSON numbers or as
/// the strings ffprobe usually emits. Anything that is not a JSON object is an error.
pub fn parse_probe_output(output: &str, file_name: Option<&str>) -> Result<MediaInfo> {
    let document: Value = serde_json::from_str(output)
        .map_err(|e| FfbatchError::Parse(format!("probe output is not valid JSON: {}", e)))?;

    let document = document
        .as_object()
        .ok_or_else(|| FfbatchError::Parse("probe output is not a JSON object".to_string()))?;

    let empty = Map::new();
    let format = document
        .get("format")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    let streams = document
        .get("streams")
        .and_then(Value::as_array)
        .map(|streams| {
            streams
                .iter()
                .filter_map(Value::as_object)
                .map(parse_stream)
                .collect()
        })
        .unwrap_or_default();

    Ok(MediaInfo {
        file_name: file_name.map(str::to_string),
        format_name: format
            .get("format_name")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        duration: number_f64(format.get("duration")).unwrap_or(0.0),
        size: number_u64(format.get("size")).unwrap_or(0),
        bit_rate: number_u64(format.get("bit_rate")).unwrap_or(0),
        streams,
    })
}

fn parse_stream(stream: &Map<String, Value>) -> StreamInfo {
    let text = |key: &str| stream.get(key).and_then(Value::as_str).map(str::to_string);
    let small = |key: &str| number_u64(stream.get(key)).and_then(|v| u32::try_from(v).ok());

    StreamInfo {
        index: small("index").unwrap_or(0),
        codec_type: text("codec_type"),
        codec_name: text("codec_name"),
        width: small("width"),
        height: small("height"),
        sample_rate: number_u64(stream.get("sample_rate")),
        channels: small("channels"),
        bit_rate: number_u64(stream.get("bit_rate")),
        duration: number_f64(stream.get("duration")),
    }
}

fn number_f64(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

fn number_u64(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}

/// Source of raw probe output for a file
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaProbe: Send + Sync {
    async fn probe_raw(&self, path: &Path) -> Result<String>;
}

/// Runs the ffprobe binary and returns its standard output
pub struct FfprobeProbe {
    builder: MediaCommandBuilder,
    binary_path: String,
    timeout: Option<Duration>,
}

impl FfprobeProbe {
    pub fn new<S: Into<String>>(binary_path: S, timeout: Option<Duration>) -> Self {
        let binary_path = binary_path.into();
        Self {
            builder: MediaCommandBuilder::new(binary_path.clone()),
            binary_path,
            timeout,
        }
    }
}

#[async_trait]
impl MediaProbe for FfprobeProbe {
    async fn probe_raw(&self, path: &Path) -> Result<String> {
        let command = self.builder.probe(path)?;
        debug!("Executing {}", command);

        let run = Command::new(&command.binary_path)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, run).await.map_err(|_| FfbatchError::Timeout {
                program: self.binary_path.clone(),
                after: limit,
                diagnostics: String::new(),
            })?,
            None => run.await,
        }
        .map_err(|e| FfbatchError::Spawn {
            program: self.binary_path.clone(),
            reason: e.to_string(),
        })?;

        if !output.status.success() {
            return Err(FfbatchError::ToolFailure {
                program: self.binary_path.clone(),
                code: output.status.code(),
                diagnostics: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
