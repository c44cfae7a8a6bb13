//! Thumbnail engine
//!
//! Variants are derived files: they are generated from the original on
//! first request and never tracked anywhere but on disk.
//!
//! Generation writes into a hidden sibling of the target and renames it into
//! place. Concurrent requests for the same missing variant may each run the
//! tool; every run writes its own temp file and the last rename wins, so a
//! reader sees either no file or a complete one.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::model::Attachment;
use crate::partition::Partitioner;
use crate::probe::ImageProbe;
use crate::processor::ImageProcessor;
use crate::spec::{AttachmentSpecification, RegeneratePolicy, VariantKey};
use crate::storage::{self, ensure_dir, temp_sibling};
use crate::tool::ProcessError;

#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error("Unknown variant: {0}")]
    UnknownVariant(VariantKey),
    #[error("Attachment is not an image")]
    NotAnImage,
    #[error("Attachment has not been saved")]
    MissingId,
    #[error("Original file is missing: {}", .0.display())]
    MissingOriginal(PathBuf),
    #[error("Image processing failed: {0}")]
    Processing(#[from] ProcessError),
    #[error("Storage error: {0}")]
    Io(#[from] std::io::Error),
}

/// Centered window of the original that has the target box's aspect ratio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropWindow {
    pub width: u32,
    pub height: u32,
    pub x: u32,
    pub y: u32,
}

impl CropWindow {
    /// Window for cropping a `width`x`height` original to a `box_width`x`box_height` box.
    ///
    /// With `scale_x = W/Ax` and `scale_y = H/Ay`: when `scale_x > scale_y`
    /// the window keeps the full height and is `floor(Ax * scale_y)` wide,
    /// centered horizontally; otherwise it keeps the full width and is
    /// `floor(Ay * scale_x)` high, centered vertically. Offsets use integer
    /// division.
    pub fn compute(width: u32, height: u32, box_width: u32, box_height: u32) -> Self {
        let (w, h) = (u64::from(width), u64::from(height));
        let (bw, bh) = (u64::from(box_width.max(1)), u64::from(box_height.max(1)));

        // scale_x > scale_y  <=>  W * Ay > H * Ax
        if w * bh > h * bw {
            let crop_width = (bw * h / bh).clamp(1, w.max(1)) as u32;
            Self {
                width: crop_width,
                height,
                x: (width - crop_width) / 2,
                y: 0,
            }
        } else {
            let crop_height = (bh * w / bw).clamp(1, h.max(1)) as u32;
            Self {
                width,
                height: crop_height,
                x: 0,
                y: (height - crop_height) / 2,
            }
        }
    }
}

impl fmt::Display for CropWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

pub struct ThumbnailEngine {
    partitioner: Partitioner,
    probe: Arc<dyn ImageProbe>,
    processor: Arc<dyn ImageProcessor>,
}

impl ThumbnailEngine {
    pub fn new(
        partitioner: Partitioner,
        probe: Arc<dyn ImageProbe>,
        processor: Arc<dyn ImageProcessor>,
    ) -> Self {
        Self {
            partitioner,
            probe,
            processor,
        }
    }

    pub fn partitioner(&self) -> &Partitioner {
        &self.partitioner
    }

    /// Path of the ready variant, generating it first when needed.
    ///
    /// Follows the specification's [`RegeneratePolicy`].
    pub async fn ensure(
        &self,
        attachment: &Attachment,
        spec: &AttachmentSpecification,
        key: &VariantKey,
    ) -> Result<PathBuf, ThumbnailError> {
        self.ensure_with(attachment, spec, key, spec.regenerate())
            .await
    }

    /// Generate the variant even if it already exists
    pub async fn regenerate(
        &self,
        attachment: &Attachment,
        spec: &AttachmentSpecification,
        key: &VariantKey,
    ) -> Result<PathBuf, ThumbnailError> {
        self.ensure_with(attachment, spec, key, RegeneratePolicy::Force)
            .await
    }

    #[instrument(skip(self, attachment, spec, key), fields(id = ?attachment.id, variant = %key))]
    pub async fn ensure_with(
        &self,
        attachment: &Attachment,
        spec: &AttachmentSpecification,
        key: &VariantKey,
        policy: RegeneratePolicy,
    ) -> Result<PathBuf, ThumbnailError> {
        if !spec.has_variant(key) {
            return Err(ThumbnailError::UnknownVariant(key.clone()));
        }
        if !attachment.is_image() {
            return Err(ThumbnailError::NotAnImage);
        }
        let id = attachment.storage_id().ok_or(ThumbnailError::MissingId)?;

        let target = self
            .partitioner
            .file_path(spec, id, &attachment.filename, Some(key));
        if policy == RegeneratePolicy::SkipExisting && storage::exists(&target).await {
            debug!(path = %target.display(), "Variant ready");
            return Ok(target);
        }

        let original = self
            .partitioner
            .file_path(spec, id, &attachment.filename, None);
        if !storage::exists(&original).await {
            return Err(ThumbnailError::MissingOriginal(original));
        }

        if let Some(dir) = target.parent() {
            ensure_dir(dir).await?;
        }

        let temp = temp_sibling(&target);
        let generated = self
            .generate(attachment, spec, key, &original, &temp)
            .await;
        if let Err(e) = generated {
            warn!(path = %target.display(), error = %e, "Variant generation failed");
            storage::remove_file_quietly(&temp).await;
            return Err(e);
        }

        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            storage::remove_file_quietly(&temp).await;
            return Err(e.into());
        }

        info!(path = %target.display(), "Variant generated");
        Ok(target)
    }

    async fn generate(
        &self,
        attachment: &Attachment,
        spec: &AttachmentSpecification,
        key: &VariantKey,
        original: &Path,
        temp: &Path,
    ) -> Result<(), ThumbnailError> {
        let geometry = spec
            .geometry(key)
            .ok_or_else(|| ThumbnailError::UnknownVariant(key.clone()))?;

        match (spec.is_croppable(key), geometry.dimensions()) {
            (true, Some((box_width, box_height))) => {
                let (width, height) = match attachment.dimensions() {
                    Some(dims) => dims,
                    None => {
                        let info = self
                            .probe
                            .probe(original)
                            .await
                            .image()
                            .ok_or(ThumbnailError::NotAnImage)?;
                        (info.width, info.height)
                    }
                };
                let window = CropWindow::compute(width, height, box_width, box_height);
                debug!(%window, box_width, box_height, "Cropping");
                self.processor
                    .crop_resize(original, temp, window, box_width, box_height)
                    .await?;
            }
            _ => {
                debug!(%geometry, "Resizing");
                self.processor.thumbnail(original, temp, geometry).await?;
            }
        }

        match tokio::fs::metadata(temp).await {
            Ok(meta) if meta.len() > 0 => Ok(()),
            _ => Err(ProcessError::NoOutput {
                program: "image processor".to_string(),
            }
            .into()),
        }
    }
}
