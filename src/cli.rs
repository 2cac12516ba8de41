use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::TextOverlayConfig;
use crate::error::{FfbatchError, Result};
use crate::job::{Operation, OverlayMode};
use crate::media::Overrides;

const MEDIA_EXTENSIONS: [&str; 12] = [
    "mp4", "avi", "mov", "mkv", "wmv", "flv", "webm", "m4v", "ts", "mp3", "m4a", "wav",
];

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Add files to a merge batch; concatenates once enough files are pending
    Merge {
        #[command(flatten)]
        job: JobArgs,

        #[command(flatten)]
        inputs: InputArgs,

        /// Files required before the merge runs (overrides merge.min_files)
        #[arg(long)]
        min_files: Option<usize>,

        #[command(flatten)]
        overrides: OverrideArgs,
    },

    /// Add files to an overlay batch; the first file supplies video, the second audio
    Overlay {
        #[command(flatten)]
        job: JobArgs,

        #[command(flatten)]
        inputs: InputArgs,

        #[command(flatten)]
        text: TextArgs,

        #[command(flatten)]
        overrides: OverrideArgs,
    },

    /// Run a custom command template once per input file
    Custom {
        #[command(flatten)]
        job: JobArgs,

        #[command(flatten)]
        inputs: InputArgs,

        #[command(flatten)]
        overrides: OverrideArgs,
    },

    /// Print media metadata for each input file
    Info {
        #[command(flatten)]
        inputs: InputArgs,
    },

    /// List the files waiting in a batch
    Pending {
        /// Job key the batch belongs to
        #[arg(short, long, default_value = "default")]
        job: String,

        #[arg(long, value_enum, default_value = "merge")]
        operation: BatchOperation,
    },

    /// Discard a pending batch and delete its files
    Reset {
        /// Job key the batch belongs to
        #[arg(short, long, default_value = "default")]
        job: String,

        #[arg(long, value_enum, default_value = "merge")]
        operation: BatchOperation,
    },

    /// Write the default configuration to a file
    InitConfig {
        /// Destination file
        #[arg(short, long, default_value = "ffbatch.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(ClapArgs)]
pub struct JobArgs {
    /// Job key; invocations with the same key share one batch
    #[arg(short, long, default_value = "default")]
    pub job: String,

    /// Command template replacing the configured one
    #[arg(long)]
    pub template: Option<String>,

    /// Directory the produced files are written to
    #[arg(short, long, default_value = ".")]
    pub output_dir: PathBuf,

    /// File name of the produced file
    #[arg(long)]
    pub output_name: Option<String>,
}

#[derive(ClapArgs)]
pub struct InputArgs {
    /// Input files, in order
    pub files: Vec<PathBuf>,

    /// Also take every media file found under this directory
    #[arg(short, long)]
    pub input_dir: Option<PathBuf>,
}

impl InputArgs {
    /// Explicit files first, then directory contents sorted by name
    pub fn collect(&self) -> Result<Vec<PathBuf>> {
        let mut files = self.files.clone();
        if let Some(dir) = &self.input_dir {
            files.extend(find_media_files(dir)?);
        }
        Ok(files)
    }
}

#[derive(ClapArgs)]
pub struct TextArgs {
    /// Draw this text on the video
    #[arg(long)]
    pub text: Option<String>,

    #[arg(long, requires = "text")]
    pub font_file: Option<String>,

    #[arg(long, requires = "text")]
    pub font_size: Option<u32>,

    #[arg(long, requires = "text")]
    pub font_color: Option<String>,

    /// Horizontal position expression
    #[arg(long, requires = "text")]
    pub x: Option<String>,

    /// Vertical position expression
    #[arg(long, requires = "text")]
    pub y: Option<String>,
}

impl TextArgs {
    /// Audio overlay without `--text`, text overlay layered on `defaults` with it
    pub fn mode(&self, defaults: &TextOverlayConfig) -> OverlayMode {
        let Some(text) = &self.text else {
            return OverlayMode::Audio;
        };
        OverlayMode::Text(TextOverlayConfig {
            text: text.clone(),
            font_file: self.font_file.clone().unwrap_or_else(|| defaults.font_file.clone()),
            font_size: self.font_size.unwrap_or(defaults.font_size),
            font_color: self.font_color.clone().unwrap_or_else(|| defaults.font_color.clone()),
            x: self.x.clone().unwrap_or_else(|| defaults.x.clone()),
            y: self.y.clone().unwrap_or_else(|| defaults.y.clone()),
        })
    }
}

#[derive(ClapArgs, Default)]
pub struct OverrideArgs {
    /// Video codec ("copy" keeps the template's choice)
    #[arg(long)]
    pub video_codec: Option<String>,

    /// Audio codec ("copy" keeps the template's choice)
    #[arg(long)]
    pub audio_codec: Option<String>,

    /// Output size as WIDTHxHEIGHT ("original" keeps the input size)
    #[arg(long)]
    pub resolution: Option<String>,

    /// Video bitrate in kbps
    #[arg(long)]
    pub bitrate: Option<u32>,

    #[arg(long)]
    pub frame_rate: Option<f64>,
}

impl OverrideArgs {
    pub fn to_overrides(&self) -> Option<Overrides> {
        let overrides = Overrides {
            video_codec: self.video_codec.clone(),
            audio_codec: self.audio_codec.clone(),
            resolution: self.resolution.clone(),
            bitrate_kbps: self.bitrate,
            frame_rate: self.frame_rate,
        };
        (overrides != Overrides::default()).then_some(overrides)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BatchOperation {
    Merge,
    Overlay,
}

impl BatchOperation {
    pub fn operation(self) -> Operation {
        match self {
            Self::Merge => Operation::Merge,
            Self::Overlay => Operation::Overlay(OverlayMode::Audio),
        }
    }
}

fn find_media_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(FfbatchError::InvalidInput(format!(
            "input directory not found: {}",
            dir.display()
        )));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(ext) = entry.path().extension().and_then(|ext| ext.to_str()) {
            if MEDIA_EXTENSIONS.contains(&ext.to_lowercase().as_str()) {
                files.push(entry.path().to_path_buf());
            }
        }
    }
    Ok(files)
}
