use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, FfbatchError};
use crate::media::{CommandTemplate, Overrides};

// Default values for optional sections
fn default_scratch_prefix() -> String {
    "ffbatch".to_string()
}

fn default_state_path() -> PathBuf {
    PathBuf::from(".ffbatch").join("state.json")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub media: MediaConfig,
    pub scratch: ScratchConfig,
    pub state: StateConfig,
    pub merge: MergeConfig,
    pub overlay: OverlayConfig,
    pub custom: CustomConfig,
    /// Codec/resolution/bitrate/frame-rate flags prepended to every resolved command
    #[serde(default)]
    pub overrides: Overrides,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Path to ffmpeg binary
    pub binary_path: String,
    /// Path to ffprobe binary
    pub probe_binary_path: String,
    /// Kill the tool after this many seconds; absent or 0 waits forever
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl MediaConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScratchConfig {
    /// Directory for temporary inputs, manifests and outputs (system temp dir when unset)
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Prefix of every generated file name
    #[serde(default = "default_scratch_prefix")]
    pub prefix: String,
}

impl ScratchConfig {
    pub fn resolve_dir(&self) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(&self.prefix))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Where pending batches live between invocations
    pub backend: StateBackend,
    /// JSON document used by the file backend
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Lives as long as the process; suitable for embedding
    Memory,
    /// Survives process restarts; required for the CLI to accumulate across runs
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Minimum number of files required before merging
    pub min_files: usize,
    /// `{input}` is the generated concat manifest, `{output}` the output file
    pub template: String,
    pub output_file_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// `{video}`, `{audio}` and `{output}` placeholders
    pub template: String,
    /// Template used when a text overlay is requested
    pub text_template: String,
    pub output_file_name: String,
    /// Defaults for the drawtext options
    pub text: TextOverlayConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextOverlayConfig {
    pub text: String,
    pub font_file: String,
    pub font_size: u32,
    pub font_color: String,
    pub x: String,
    pub y: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomConfig {
    /// `{input}` and `{output}` placeholders
    pub template: String,
    pub output_file_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            media: MediaConfig {
                binary_path: "ffmpeg".to_string(),
                probe_binary_path: "ffprobe".to_string(),
                timeout_secs: None,
            },
            scratch: ScratchConfig {
                dir: None,
                prefix: default_scratch_prefix(),
            },
            state: StateConfig {
                backend: StateBackend::File,
                path: default_state_path(),
            },
            merge: MergeConfig {
                min_files: 2,
                template: r#"-f concat -safe 0 -i "{input}" -c:v libx264 -c:a aac "{output}""#.to_string(),
                output_file_name: "merged_video.mp4".to_string(),
            },
            overlay: OverlayConfig {
                template: r#"-i "{video}" -i "{audio}" -c:v copy -c:a aac "{output}""#.to_string(),
                text_template: concat!(
                    r#"-i "{video}" -i "{audio}" "#,
                    r#"-vf "drawtext=text='{text}':fontfile='{fontfile}':fontsize={fontsize}:fontcolor={fontcolor}:x={x}:y={y}" "#,
                    r#"-map 0:v -map 1:a -c:v libx264 -c:a aac "{output}""#,
                )
                .to_string(),
                output_file_name: "overlay_video.mp4".to_string(),
                text: TextOverlayConfig {
                    text: "Sample".to_string(),
                    font_file: "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf".to_string(),
                    font_size: 24,
                    font_color: "white".to_string(),
                    x: "10".to_string(),
                    y: "10".to_string(),
                },
            },
            custom: CustomConfig {
                template: r#"-i "{input}" -vf "transpose=1" "{output}""#.to_string(),
                output_file_name: "output.mp4".to_string(),
            },
            overrides: Overrides::default(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| FfbatchError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)?;

        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| FfbatchError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| FfbatchError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Reject configurations that could never produce a runnable command
    pub fn validate(&self) -> Result<()> {
        if self.merge.min_files == 0 {
            return Err(FfbatchError::Config(
                "merge.min_files must be at least 1".to_string(),
            ));
        }
        if self.media.binary_path.trim().is_empty() || self.media.probe_binary_path.trim().is_empty() {
            return Err(FfbatchError::Config("media binary paths must not be empty".to_string()));
        }

        let templates: [(&str, &str, &[&str]); 4] = [
            ("merge.template", self.merge.template.as_str(), &["input", "output"]),
            ("overlay.template", self.overlay.template.as_str(), &["video", "audio", "output"]),
            ("overlay.text_template", self.overlay.text_template.as_str(), &["video", "audio", "output", "text"]),
            ("custom.template", self.custom.template.as_str(), &["input", "output"]),
        ];
        for (name, source, required) in templates {
            CommandTemplate::parse(source)
                .and_then(|template| template.require(required))
                .map_err(|e| FfbatchError::Config(format!("{}: {}", name, e)))?;
        }

        self.overrides
            .to_args()
            .map_err(|e| FfbatchError::Config(format!("overrides: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.merge.min_files, 2);
        assert_eq!(config.media.timeout(), None);
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ffbatch.toml");

        let mut config = Config::default();
        config.merge.min_files = 3;
        config.media.timeout_secs = Some(90);
        config.overrides.video_codec = Some("libx265".to_string());
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.merge.min_files, 3);
        assert_eq!(loaded.media.timeout(), Some(Duration::from_secs(90)));
        assert_eq!(loaded.overrides.video_codec.as_deref(), Some("libx265"));
        assert_eq!(loaded.state.backend, StateBackend::File);
    }

    #[test]
    fn test_rejects_template_without_output() {
        let mut config = Config::default();
        config.custom.template = r#"-i "{input}" -f null -"#.to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("custom.template"));
    }

    #[test]
    fn test_malformed_file_is_toml_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ffbatch.toml");
        std::fs::write(&path, "[merge\nmin_files = ").unwrap();

        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(err, FfbatchError::Toml(_)));
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn test_rejects_zero_threshold_and_zero_timeout_is_unbounded() {
        let mut config = Config::default();
        config.merge.min_files = 0;
        assert!(config.validate().is_err());

        config.merge.min_files = 1;
        config.media.timeout_secs = Some(0);
        assert_eq!(config.media.timeout(), None);
    }
}
