use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Number of trailing diagnostic lines kept when an error is displayed
const DIAGNOSTIC_TAIL_LINES: usize = 20;

#[derive(Error, Debug)]
pub enum FfbatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Scratch file error at {}: {source}", .path.display())]
    Scratch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Failed to start {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("{program} failed with {}: {}", describe_exit(.code), diagnostics_tail(.diagnostics))]
    ToolFailure {
        program: String,
        code: Option<i32>,
        diagnostics: String,
    },

    #[error("{program} timed out after {:.1}s: {}", .after.as_secs_f64(), diagnostics_tail(.diagnostics))]
    Timeout {
        program: String,
        after: Duration,
        diagnostics: String,
    },

    #[error("Probe output parse error: {0}")]
    Parse(String),

    #[error("State store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Coarse classification of a failure, surfaced to callers alongside the message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Template,
    Spawn,
    ToolFailure,
    Timeout,
    Parse,
    Store,
    Config,
    InvalidInput,
}

impl FfbatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) | Self::Scratch { .. } => ErrorKind::Io,
            Self::Template(_) => ErrorKind::Template,
            Self::Spawn { .. } => ErrorKind::Spawn,
            Self::ToolFailure { .. } => ErrorKind::ToolFailure,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Json(_) | Self::Parse(_) => ErrorKind::Parse,
            Self::Store(_) => ErrorKind::Store,
            Self::Toml(_) | Self::Config(_) => ErrorKind::Config,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
        }
    }

    /// Diagnostic text captured from the external tool, if any
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::ToolFailure { diagnostics, .. } | Self::Timeout { diagnostics, .. } => {
                Some(diagnostics.as_str())
            }
            _ => None,
        }
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "termination by signal".to_string(),
    }
}

fn diagnostics_tail(diagnostics: &str) -> String {
    let lines: Vec<&str> = diagnostics
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect();

    if lines.is_empty() {
        return "no diagnostics".to_string();
    }

    let start = lines.len().saturating_sub(DIAGNOSTIC_TAIL_LINES);
    lines[start..].join("\n")
}

pub type Result<T> = std::result::Result<T, FfbatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_failure_display_keeps_tail() {
        let diagnostics = (0..30)
            .map(|i| format!("line {}", i))
            .collect::<Vec<_>>()
            .join("\n");
        let err = FfbatchError::ToolFailure {
            program: "ffmpeg".to_string(),
            code: Some(1),
            diagnostics,
        };

        let message = err.to_string();
        assert!(message.starts_with("ffmpeg failed with exit code 1"));
        assert!(message.contains("line 29"));
        assert!(!message.contains("line 9\n"));
        assert_eq!(err.kind(), ErrorKind::ToolFailure);
        assert!(err.diagnostics().unwrap().contains("line 0"));
    }

    #[test]
    fn test_signal_exit_and_empty_diagnostics() {
        let err = FfbatchError::ToolFailure {
            program: "ffmpeg".to_string(),
            code: None,
            diagnostics: String::new(),
        };
        assert_eq!(
            err.to_string(),
            "ffmpeg failed with termination by signal: no diagnostics"
        );
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(FfbatchError::Parse("x".into()).kind(), ErrorKind::Parse);
        assert_eq!(FfbatchError::Template("x".into()).kind(), ErrorKind::Template);
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(FfbatchError::from(io).kind(), ErrorKind::Io);
        assert!(FfbatchError::Config("x".into()).diagnostics().is_none());
    }
}
