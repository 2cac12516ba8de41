//! Command templates.
//!
//! A template such as `-f concat -safe 0 -i "{input}" -c copy "{output}"` is split into
//! arguments with POSIX shell quoting rules *before* any placeholder is substituted,
//! so a substituted value always stays inside the argument it was written in. Nothing
//! is ever handed to a shell; [`shell_quote`] only exists to print commands that can be
//! pasted back into one.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::debug;

use crate::error::{FfbatchError, Result};

/// Codec value that means "keep whatever the template or tool decides"
pub const CODEC_PASS_THROUGH: &str = "copy";
/// Resolution value that means "keep the source resolution"
pub const RESOLUTION_PASS_THROUGH: &str = "original";

pub type PlaceholderMap = BTreeMap<String, PlaceholderValue>;

/// Value substituted for a `{name}` placeholder
#[derive(Debug, Clone, PartialEq)]
pub enum PlaceholderValue {
    /// Filesystem path, must be valid UTF-8
    Path(PathBuf),
    /// Inserted verbatim
    Text(String),
    /// Goes inside a single-quoted filter option, e.g. `text='{text}'`
    FilterQuoted(String),
    /// Goes into an unquoted filter option, e.g. `fontsize={fontsize}`
    FilterBare(String),
}

impl PlaceholderValue {
    pub fn path<P: Into<PathBuf>>(path: P) -> Self {
        Self::Path(path.into())
    }

    pub fn text<S: Into<String>>(text: S) -> Self {
        Self::Text(text.into())
    }

    fn render(&self, name: &str) -> Result<String> {
        match self {
            Self::Path(path) => path.to_str().map(str::to_string).ok_or_else(|| {
                FfbatchError::Template(format!(
                    "path for {{{}}} is not valid UTF-8: {}",
                    name,
                    path.display()
                ))
            }),
            Self::Text(text) => Ok(text.clone()),
            Self::FilterQuoted(value) => {
                check_filter_value(name, value, &['\'', '\\'])?;
                Ok(value.clone())
            }
            Self::FilterBare(value) => {
                check_filter_value(name, value, &['\'', '\\', ':', ',', ';', '[', ']', '=', ' '])?;
                Ok(value.clone())
            }
        }
    }
}

/// Filter values are rejected rather than escaped: a character that could close the
/// option or start a new one never reaches the filter graph.
fn check_filter_value(name: &str, value: &str, forbidden: &[char]) -> Result<()> {
    if let Some(c) = value
        .chars()
        .find(|c| c.is_control() || forbidden.contains(c) || (forbidden.contains(&' ') && c.is_whitespace()))
    {
        return Err(FfbatchError::Template(format!(
            "value for {{{}}} contains forbidden character {:?}",
            name, c
        )));
    }
    Ok(())
}

/// Encoding overrides prepended to the template arguments
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Overrides {
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    /// `<width>x<height>`
    pub resolution: Option<String>,
    pub bitrate_kbps: Option<u32>,
    pub frame_rate: Option<f64>,
}

impl Overrides {
    /// Fill unset fields from `fallback`
    pub fn or(&self, fallback: &Overrides) -> Overrides {
        Overrides {
            video_codec: self.video_codec.clone().or_else(|| fallback.video_codec.clone()),
            audio_codec: self.audio_codec.clone().or_else(|| fallback.audio_codec.clone()),
            resolution: self.resolution.clone().or_else(|| fallback.resolution.clone()),
            bitrate_kbps: self.bitrate_kbps.or(fallback.bitrate_kbps),
            frame_rate: self.frame_rate.or(fallback.frame_rate),
        }
    }

    /// Flag/value pairs in the fixed order bitrate, frame rate, resolution,
    /// audio codec, video codec. Pass-through values produce no flag.
    pub fn to_args(&self) -> Result<Vec<String>> {
        let mut args = Vec::new();

        if let Some(kbps) = self.bitrate_kbps.filter(|kbps| *kbps > 0) {
            args.push("-b:v".to_string());
            args.push(format!("{}k", kbps));
        }

        if let Some(rate) = self.frame_rate.filter(|rate| *rate > 0.0) {
            if !rate.is_finite() {
                return Err(FfbatchError::Template(format!("invalid frame rate: {}", rate)));
            }
            args.push("-r".to_string());
            args.push(rate.to_string());
        }

        if let Some(resolution) = active(&self.resolution, RESOLUTION_PASS_THROUGH) {
            if !is_resolution(resolution) {
                return Err(FfbatchError::Template(format!(
                    "resolution must look like 1280x720, got {:?}",
                    resolution
                )));
            }
            args.push("-s".to_string());
            args.push(resolution.to_string());
        }

        if let Some(codec) = active(&self.audio_codec, CODEC_PASS_THROUGH) {
            args.push("-c:a".to_string());
            args.push(flag_value("audio codec", codec)?);
        }

        if let Some(codec) = active(&self.video_codec, CODEC_PASS_THROUGH) {
            args.push("-c:v".to_string());
            args.push(flag_value("video codec", codec)?);
        }

        Ok(args)
    }
}

fn active<'a>(value: &'a Option<String>, pass_through: &str) -> Option<&'a str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case(pass_through))
}

fn is_resolution(value: &str) -> bool {
    match value.split_once('x') {
        Some((w, h)) => {
            matches!(w.parse::<u32>(), Ok(w) if w > 0) && matches!(h.parse::<u32>(), Ok(h) if h > 0)
        }
        None => false,
    }
}

fn flag_value(what: &str, value: &str) -> Result<String> {
    if value.starts_with('-') || value.chars().any(char::is_whitespace) {
        return Err(FfbatchError::Template(format!("invalid {}: {:?}", what, value)));
    }
    Ok(value.to_string())
}

/// A tokenized command template
#[derive(Debug, Clone, PartialEq)]
pub struct CommandTemplate {
    source: String,
    tokens: Vec<String>,
}

impl CommandTemplate {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = split_command_line(source)?;
        if tokens.is_empty() {
            return Err(FfbatchError::Template("command template is empty".to_string()));
        }
        Ok(Self {
            source: source.to_string(),
            tokens,
        })
    }

    /// Names of every `{name}` placeholder appearing in the template
    pub fn placeholders(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for token in &self.tokens {
            scan_placeholders(token, |name| {
                names.insert(name.to_string());
            });
        }
        names
    }

    pub fn require(&self, names: &[&str]) -> Result<()> {
        let present = self.placeholders();
        let missing: Vec<String> = names
            .iter()
            .filter(|name| !present.contains(**name))
            .map(|name| format!("{{{}}}", name))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(FfbatchError::Template(format!(
                "template is missing required placeholder(s) {}: {}",
                missing.join(", "),
                self.source
            )))
        }
    }

    /// Overrides first, then the template arguments with placeholders substituted
    pub fn resolve(&self, values: &PlaceholderMap, overrides: &Overrides) -> Result<Vec<String>> {
        let mut args = overrides.to_args()?;
        for token in &self.tokens {
            args.push(substitute(token, values)?);
        }
        Ok(args)
    }
}

/// Parse `template`, check that every `required` placeholder appears in it and has a
/// value, and produce the final argument vector.
pub fn resolve(
    template: &str,
    values: &PlaceholderMap,
    overrides: &Overrides,
    required: &[&str],
) -> Result<Vec<String>> {
    let template = CommandTemplate::parse(template)?;
    template.require(required)?;

    if let Some(name) = required.iter().find(|name| !values.contains_key(**name)) {
        return Err(FfbatchError::Template(format!(
            "no value supplied for placeholder {{{}}}",
            name
        )));
    }

    template.resolve(values, overrides)
}

fn is_placeholder_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

fn scan_placeholders<F: FnMut(&str)>(token: &str, mut found: F) {
    let mut rest = token;
    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) if is_placeholder_name(&after[..end]) => {
                found(&after[..end]);
                rest = &after[end + 1..];
            }
            _ => rest = after,
        }
    }
}

fn substitute(token: &str, values: &PlaceholderMap) -> Result<String> {
    let mut out = String::with_capacity(token.len());
    let mut rest = token;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) if is_placeholder_name(&after[..end]) => {
                let name = &after[..end];
                match values.get(name) {
                    Some(value) => out.push_str(&value.render(name)?),
                    None => {
                        debug!("Leaving unknown placeholder {{{}}} untouched", name);
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    Ok(out)
}

/// Split a command line into arguments using POSIX shell quoting (no expansion)
pub fn split_command_line(line: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err(unterminated('\'', line)),
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\' | '$' | '`')) => current.push(ch),
                            Some('\n') => {}
                            Some(ch) => {
                                current.push('\\');
                                current.push(ch);
                            }
                            None => return Err(unterminated('"', line)),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err(unterminated('"', line)),
                    }
                }
            }
            '\\' => match chars.next() {
                Some('\n') => {}
                Some(ch) => {
                    in_token = true;
                    current.push(ch);
                }
                None => {
                    in_token = true;
                    current.push('\\');
                }
            },
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }

    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

fn unterminated(quote: char, line: &str) -> FfbatchError {
    FfbatchError::Template(format!("unterminated {} quote in: {}", quote, line))
}

fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '=' | '@' | '%' | '+' | ',')
}

/// Quote `arg` so a POSIX shell reads it back as exactly one word
pub fn shell_quote(arg: &str) -> Cow<'_, str> {
    if !arg.is_empty() && arg.chars().all(is_shell_safe) {
        return Cow::Borrowed(arg);
    }
    Cow::Owned(format!("'{}'", arg.replace('\'', r"'\''")))
}

pub fn join_command_line<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|arg| shell_quote(arg.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
