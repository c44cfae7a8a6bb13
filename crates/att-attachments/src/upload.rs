//! Upload staging
//!
//! An upload is streamed into a private temp file first. Nothing under the
//! storage root is touched until the owning record is saved, and dropping a
//! [`StagedUpload`] deletes its temp file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use att_core::StorageConfig;
use tempfile::TempPath;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument};

use crate::model::sanitize_filename;
use crate::probe::{ImageInfo, ImageProbe, ProbeOutcome};
use crate::spec::AttachmentSpecification;
use crate::storage::ensure_dir;

/// Used when sanitizing leaves nothing of the declared name
pub const FALLBACK_FILENAME: &str = "upload";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("No data was uploaded")]
    EmptyUpload,
    #[error("File too large: {size} bytes (max: {max} bytes)")]
    FileTooLarge { size: u64, max: u64 },
    #[error("Staging failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Anything with a readable byte stream and an original file name
pub struct UploadSource<R> {
    pub reader: R,
    pub original_filename: String,
    /// Content type declared by the client
    pub content_type: Option<String>,
    /// Size declared by the client
    pub size: Option<u64>,
}

impl<R> UploadSource<R> {
    pub fn new(reader: R, original_filename: impl Into<String>) -> Self {
        Self {
            reader,
            original_filename: original_filename.into(),
            content_type: None,
            size: None,
        }
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }
}

impl UploadSource<std::io::Cursor<Vec<u8>>> {
    /// Upload held entirely in memory
    pub fn from_bytes(data: impl Into<Vec<u8>>, original_filename: impl Into<String>) -> Self {
        let data = data.into();
        let size = data.len() as u64;
        Self::new(std::io::Cursor::new(data), original_filename).size(size)
    }
}

/// An upload copied into a temp file, waiting to be committed
#[derive(Debug)]
pub struct StagedUpload {
    temp: TempPath,
    /// Sanitized name of the upload
    pub filename: String,
    /// Bytes copied
    pub size: u64,
    pub declared_content_type: Option<String>,
    /// Set by classification
    pub content_type: Option<String>,
    /// Set by classification when the upload is an image
    pub image: Option<ImageInfo>,
}

impl StagedUpload {
    pub fn path(&self) -> &Path {
        &self.temp
    }
}

pub struct UploadStager {
    staging_dir: PathBuf,
    max_size: u64,
    probe: Arc<dyn ImageProbe>,
}

impl UploadStager {
    pub fn new(staging_dir: impl Into<PathBuf>, max_size: u64, probe: Arc<dyn ImageProbe>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            max_size,
            probe,
        }
    }

    pub fn from_config(config: &StorageConfig, probe: Arc<dyn ImageProbe>) -> Self {
        Self::new(config.staging_dir(), config.max_upload_size, probe)
    }

    /// Stream `source` into a temp file
    #[instrument(skip(self, source), fields(filename = %source.original_filename))]
    pub async fn stage<R>(&self, source: UploadSource<R>) -> Result<StagedUpload, UploadError>
    where
        R: AsyncRead + Unpin + Send,
    {
        match source.size {
            Some(0) => return Err(UploadError::EmptyUpload),
            Some(size) if size > self.max_size => {
                return Err(UploadError::FileTooLarge {
                    size,
                    max: self.max_size,
                })
            }
            _ => {}
        }

        ensure_dir(&self.staging_dir).await?;
        let (file, temp) = tempfile::Builder::new()
            .prefix("upload-")
            .tempfile_in(&self.staging_dir)?
            .into_parts();

        let mut file = tokio::fs::File::from_std(file);
        let mut limited = source.reader.take(self.max_size.saturating_add(1));
        let copied = tokio::io::copy(&mut limited, &mut file).await?;
        file.flush().await?;
        drop(file);

        if copied == 0 {
            return Err(UploadError::EmptyUpload);
        }
        if copied > self.max_size {
            return Err(UploadError::FileTooLarge {
                size: copied,
                max: self.max_size,
            });
        }

        let mut filename = sanitize_filename(&source.original_filename);
        if filename.is_empty() {
            filename = FALLBACK_FILENAME.to_string();
        }

        debug!(path = %temp.display(), size = copied, filename = %filename, "Upload staged");

        Ok(StagedUpload {
            temp,
            filename,
            size: copied,
            declared_content_type: source.content_type,
            content_type: None,
            image: None,
        })
    }

    /// Probe the staged file and record what it is; returns the format tag
    /// for images
    pub async fn classify(&self, staged: &mut StagedUpload) -> Option<String> {
        match self.probe.probe(staged.path()).await {
            ProbeOutcome::Image(info) => {
                let tag = info.format.clone();
                staged.content_type = Some(info.content_type());
                staged.image = Some(info);
                Some(tag)
            }
            ProbeOutcome::NotAnImage => {
                staged.content_type = staged.declared_content_type.clone();
                staged.image = None;
                None
            }
        }
    }

    /// Whether an upload of type `tag` may be attached to records of `spec`
    pub fn accept(&self, tag: Option<&str>, spec: &AttachmentSpecification) -> bool {
        spec.accepted_types().accepts(tag)
    }
}
