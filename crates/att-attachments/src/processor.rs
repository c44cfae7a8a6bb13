//! Image conversion
//!
//! The engine decides *what* to produce; implementations of
//! [`ImageProcessor`] only run the conversion into the target path they are
//! given.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use att_core::ToolsConfig;

use crate::geometry::Geometry;
use crate::thumbnail::CropWindow;
use crate::tool::{ProcessError, ToolCommand};

#[async_trait]
pub trait ImageProcessor: Send + Sync {
    /// Aspect-preserving fit of `source` into `geometry`
    async fn thumbnail(
        &self,
        source: &Path,
        target: &Path,
        geometry: &Geometry,
    ) -> Result<(), ProcessError>;

    /// Cut `window` out of `source`, then scale it to exactly `width`x`height`
    async fn crop_resize(
        &self,
        source: &Path,
        target: &Path,
        window: CropWindow,
        width: u32,
        height: u32,
    ) -> Result<(), ProcessError>;
}

/// Processor backed by a `convert`-compatible command
#[derive(Debug, Clone)]
pub struct ConvertProcessor {
    program: PathBuf,
    timeout: Duration,
}

impl ConvertProcessor {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub fn from_config(config: &ToolsConfig) -> Self {
        Self::new(config.convert.clone(), config.timeout())
    }

    fn command(&self) -> ToolCommand {
        ToolCommand::new(&self.program, self.timeout).capture_stderr(true)
    }

    async fn run_into(&self, command: ToolCommand, target: &Path) -> Result<(), ProcessError> {
        let program = command.program_name();
        command.run().await?;
        match tokio::fs::metadata(target).await {
            Ok(meta) if meta.len() > 0 => Ok(()),
            _ => Err(ProcessError::NoOutput { program }),
        }
    }
}

#[async_trait]
impl ImageProcessor for ConvertProcessor {
    async fn thumbnail(
        &self,
        source: &Path,
        target: &Path,
        geometry: &Geometry,
    ) -> Result<(), ProcessError> {
        let command = self
            .command()
            .path(source)
            .arg("-thumbnail")
            .arg(geometry.to_string())
            .path(target);
        self.run_into(command, target).await
    }

    async fn crop_resize(
        &self,
        source: &Path,
        target: &Path,
        window: CropWindow,
        width: u32,
        height: u32,
    ) -> Result<(), ProcessError> {
        let command = self
            .command()
            .path(source)
            .arg("-crop")
            .arg(window.to_string())
            .arg("+repage")
            .arg("-resize")
            .arg(format!("{}x{}!", width, height))
            .path(target);
        self.run_into(command, target).await
    }
}
