//! Image inspection
//!
//! "Not an image" is an ordinary answer here, not an error: most callers
//! probe arbitrary uploads.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use att_core::ToolsConfig;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::tool::ToolCommand;

static IDENTIFY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|\s)([A-Za-z0-9]+) (\d+)x(\d+)(?:\s|$)").expect("identify pattern compiles")
});

/// Format and size reported by the inspection tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    /// Lowercased format tag, e.g. `jpeg`
    pub format: String,
    pub width: u32,
    pub height: u32,
}

impl ImageInfo {
    pub fn content_type(&self) -> String {
        format!("image/{}", self.format)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Image(ImageInfo),
    NotAnImage,
}

impl ProbeOutcome {
    pub fn image(self) -> Option<ImageInfo> {
        match self {
            Self::Image(info) => Some(info),
            Self::NotAnImage => None,
        }
    }
}

#[async_trait]
pub trait ImageProbe: Send + Sync {
    async fn probe(&self, path: &Path) -> ProbeOutcome;
}

/// Probe backed by an `identify`-compatible command
#[derive(Debug, Clone)]
pub struct IdentifyProbe {
    program: PathBuf,
    timeout: Duration,
}

impl IdentifyProbe {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub fn from_config(config: &ToolsConfig) -> Self {
        Self::new(config.identify.clone(), config.timeout())
    }
}

#[async_trait]
impl ImageProbe for IdentifyProbe {
    async fn probe(&self, path: &Path) -> ProbeOutcome {
        // stderr stays discarded: unsupported files make identify chatty
        let output = ToolCommand::new(&self.program, self.timeout)
            .path(path)
            .run()
            .await;

        match output {
            Ok(stdout) => match parse_identify_output(&stdout, path) {
                Some(info) => ProbeOutcome::Image(info),
                None => {
                    debug!(path = %path.display(), "Unrecognized identify output");
                    ProbeOutcome::NotAnImage
                }
            },
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Not an image");
                ProbeOutcome::NotAnImage
            }
        }
    }
}

/// Extract `<format> <width>x<height>` from the first line of output
pub fn parse_identify_output(output: &str, path: &Path) -> Option<ImageInfo> {
    let line = output.lines().next()?;

    // identify echoes the path (which may itself contain spaces or digits)
    let path_str = path.to_string_lossy();
    let mut rest = line.strip_prefix(path_str.as_ref()).unwrap_or(line);
    if rest.starts_with('[') {
        rest = rest.split_once(']').map(|(_, tail)| tail).unwrap_or(rest);
    }

    let caps = IDENTIFY_PATTERN.captures(rest)?;
    let width: u32 = caps[2].parse().ok()?;
    let height: u32 = caps[3].parse().ok()?;
    if width == 0 || height == 0 {
        return None;
    }

    Some(ImageInfo {
        format: caps[1].to_ascii_lowercase(),
        width,
        height,
    })
}
