use std::fmt;
use std::path::Path;

use crate::error::{FfbatchError, Result};
use super::template::{join_command_line, Overrides, PlaceholderMap};

/// A fully resolved invocation of an external media tool
#[derive(Debug, Clone, PartialEq)]
pub struct MediaCommand {
    pub binary_path: String,
    pub args: Vec<String>,
    pub description: String,
}

impl MediaCommand {
    /// Create a new media processing command
    pub fn new<S1: Into<String>, S2: Into<String>>(binary_path: S1, description: S2) -> Self {
        Self {
            binary_path: binary_path.into(),
            args: Vec::new(),
            description: description.into(),
        }
    }

    /// Build a command from a template, checking that `required` placeholders are present
    pub fn from_template<S1: Into<String>, S2: Into<String>>(
        binary_path: S1,
        description: S2,
        template: &str,
        values: &PlaceholderMap,
        overrides: &Overrides,
        required: &[&str],
    ) -> Result<Self> {
        let args = super::template::resolve(template, values, overrides, required)?;
        Ok(Self::new(binary_path, description).args(args))
    }

    /// Add an argument
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(|s| s.into()));
        self
    }

    /// Add a path argument; paths that are not UTF-8 cannot be represented
    pub fn path_arg<P: AsRef<Path>>(self, path: P) -> Result<Self> {
        let path = path.as_ref();
        let arg = path.to_str().ok_or_else(|| {
            FfbatchError::InvalidInput(format!("path is not valid UTF-8: {}", path.display()))
        })?;
        Ok(self.arg(arg))
    }

    /// Shell-quoted form, for logs and for reproducing a run by hand
    pub fn command_line(&self) -> String {
        let mut line = join_command_line(std::slice::from_ref(&self.binary_path));
        if !self.args.is_empty() {
            line.push(' ');
            line.push_str(&join_command_line(&self.args));
        }
        line
    }
}

impl fmt::Display for MediaCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.description, self.command_line())
    }
}

/// Builder for the probe invocation
pub struct MediaCommandBuilder {
    binary_path: String,
}

impl MediaCommandBuilder {
    pub fn new<S: Into<String>>(binary_path: S) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }

    /// `-v quiet -print_format json -show_format -show_streams <path>`
    pub fn probe<P: AsRef<Path>>(&self, path: P) -> Result<MediaCommand> {
        MediaCommand::new(&self.binary_path, "Media probe")
            .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
            .path_arg(path)
    }

    /// Build version check command
    pub fn version_check(&self) -> MediaCommand {
        MediaCommand::new(&self.binary_path, "Version check").arg("-version")
    }
}
