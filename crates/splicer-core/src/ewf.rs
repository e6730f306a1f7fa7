use std::{
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{error::SplicerError, persistence::write_atomic};

pub const EWF_EXTENSION: &str = "ewf";

/// Windowed view onto a source file: the engine plays `source` starting at timeline `offset`,
/// optionally from `start_position` inside the source, for `length` seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VirtualFile {
    pub source: PathBuf,
    pub offset: f64,
    pub start_position: Option<f64>,
    pub length: Option<f64>,
    pub looping: bool,
}

impl VirtualFile {
    #[must_use]
    pub fn builder(source: impl Into<PathBuf>) -> VirtualFileBuilder {
        VirtualFileBuilder {
            source: source.into(),
            offset: 0.0,
            start_position: None,
            length: None,
            looping: false,
        }
    }

    #[must_use]
    pub fn to_text(&self) -> String {
        let mut text = String::new();
        let _ = writeln!(text, "source = {}", self.source.display());
        let _ = writeln!(text, "offset = {}", self.offset);
        if let Some(start_position) = self.start_position {
            let _ = writeln!(text, "start-position = {start_position}");
        }
        if let Some(length) = self.length {
            let _ = writeln!(text, "length = {length}");
        }
        if self.looping {
            text.push_str("looping = true\n");
        }
        text
    }

    pub fn parse(text: &str) -> Result<Self, SplicerError> {
        let mut source = None;
        let mut offset = 0.0;
        let mut start_position = None;
        let mut length = None;
        let mut looping = false;

        for (line_number, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                SplicerError::configuration(format!(
                    "virtual file line {} is not key = value: {line}",
                    line_number + 1
                ))
            })?;
            let (key, value) = (key.trim(), value.trim());

            match key {
                "source" => source = Some(PathBuf::from(value)),
                "offset" => offset = parse_number(key, value)?,
                "start-position" => start_position = Some(parse_number(key, value)?),
                "length" => length = Some(parse_number(key, value)?),
                "looping" => looping = value == "true",
                other => {
                    return Err(SplicerError::configuration(format!(
                        "unknown virtual file key: {other}"
                    )));
                }
            }
        }

        let source =
            source.ok_or_else(|| SplicerError::configuration("virtual file has no source"))?;
        let mut builder = Self::builder(source).offset(offset).looping(looping);
        if let Some(start_position) = start_position {
            builder = builder.start_position(start_position);
        }
        if let Some(length) = length {
            builder = builder.length(length);
        }
        builder.build()
    }
}

#[derive(Debug, Clone)]
pub struct VirtualFileBuilder {
    source: PathBuf,
    offset: f64,
    start_position: Option<f64>,
    length: Option<f64>,
    looping: bool,
}

impl VirtualFileBuilder {
    #[must_use]
    pub fn offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }

    #[must_use]
    pub fn start_position(mut self, start_position: f64) -> Self {
        self.start_position = Some(start_position);
        self
    }

    #[must_use]
    pub fn length(mut self, length: f64) -> Self {
        self.length = Some(length);
        self
    }

    #[must_use]
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    /// Sources are written as one line with the value trimmed on read, so they must be UTF-8,
    /// free of control characters and without surrounding whitespace.
    pub fn build(self) -> Result<VirtualFile, SplicerError> {
        let Some(source) = self.source.to_str() else {
            return Err(SplicerError::configuration(format!(
                "virtual file source is not UTF-8: {}",
                self.source.display()
            )));
        };
        if source.is_empty() {
            return Err(SplicerError::configuration("virtual file source is empty"));
        }
        if source.chars().any(char::is_control) || source.trim() != source {
            return Err(SplicerError::configuration(format!(
                "virtual file source cannot be stored on one line: {source:?}"
            )));
        }
        if !self.offset.is_finite() || self.offset < 0.0 {
            return Err(SplicerError::configuration(format!(
                "virtual file offset must be non-negative, got {}",
                self.offset
            )));
        }
        if let Some(start_position) = self.start_position
            && (!start_position.is_finite() || start_position < 0.0)
        {
            return Err(SplicerError::configuration(format!(
                "virtual file start-position must be non-negative, got {start_position}"
            )));
        }
        if let Some(length) = self.length
            && (!length.is_finite() || length <= 0.0)
        {
            return Err(SplicerError::configuration(format!(
                "virtual file length must be positive, got {length}"
            )));
        }

        Ok(VirtualFile {
            source: self.source,
            offset: self.offset,
            start_position: self.start_position,
            length: self.length,
            looping: self.looping,
        })
    }
}

/// Replaces `path` with the serialized descriptor.
#[instrument(skip(file), fields(path = %path.display(), source = %file.source.display()))]
pub fn write_virtual_file(path: &Path, file: &VirtualFile) -> Result<()> {
    write_atomic(path, file.to_text().as_bytes())?;
    debug!("virtual file written");
    Ok(())
}

pub fn read_virtual_file(path: &Path) -> Result<VirtualFile, SplicerError> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read descriptor: {}", path.display()))?;
    VirtualFile::parse(&text)
}

fn parse_number(key: &str, value: &str) -> Result<f64, SplicerError> {
    value.parse::<f64>().map_err(|_| {
        SplicerError::configuration(format!("virtual file {key} is not a number: {value}"))
    })
}
