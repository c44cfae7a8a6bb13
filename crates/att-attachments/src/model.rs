//! Attachment Model
//!
//! The attachment fields carried on an owning record, plus the unsaved state
//! that exists between assigning an upload and saving the record.

use att_core::{Id, Identifiable, ValidationErrors};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::partition::split_extension;
use crate::upload::StagedUpload;

/// Strip any directory part and replace everything outside `[A-Za-z0-9._-]`
/// with `_`.
///
/// Both `/` and `\` count as separators, whatever the host platform. A
/// name made only of dots sanitizes to the empty string.
pub fn sanitize_filename(name: &str) -> String {
    let trimmed = name.trim();
    let base = trimmed
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(trimmed);

    let sanitized: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.chars().all(|c| c == '.') {
        String::new()
    } else {
        sanitized
    }
}

/// Attachment fields of an owning record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// Record ID, assigned by the store
    pub id: Option<Id>,
    /// Sanitized file name of the original
    pub filename: String,
    /// MIME content type, derived at upload time
    pub content_type: Option<String>,
    /// Image width in pixels
    pub width: Option<u32>,
    /// Image height in pixels
    pub height: Option<u32>,
    /// Size of the original in bytes
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Attachment {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: None,
            filename: String::new(),
            content_type: None,
            width: None,
            height: None,
            size: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Attachment {
    /// Create an unsaved attachment; the name is sanitized
    pub fn new(filename: &str) -> Self {
        Self {
            filename: sanitize_filename(filename),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: Id) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    /// Check if this is an image
    pub fn is_image(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("image/"))
    }

    /// Id usable for partitioning; `None` until saved
    pub fn storage_id(&self) -> Option<u64> {
        self.id.and_then(|id| u64::try_from(id).ok())
    }

    /// File name without its extension
    pub fn basename(&self) -> &str {
        split_extension(&self.filename).0
    }

    /// Get file extension, without the dot
    pub fn extension(&self) -> Option<&str> {
        let ext = split_extension(&self.filename).1;
        ext.strip_prefix('.').filter(|e| !e.is_empty())
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match (self.width, self.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some((w, h)),
            _ => None,
        }
    }

    /// `"800x600"` for images with known dimensions
    pub fn image_size(&self) -> Option<String> {
        self.dimensions().map(|(w, h)| format!("{}x{}", w, h))
    }
}

impl Identifiable for Attachment {
    fn id(&self) -> Option<Id> {
        self.id
    }
}

/// An attachment being edited: field changes, a pending upload, and
/// validation errors, none of which are persisted until saved
#[derive(Debug, Default)]
pub struct AttachmentDraft {
    attachment: Attachment,
    loaded_filename: Option<String>,
    staged: Option<StagedUpload>,
    pub errors: ValidationErrors,
}

impl AttachmentDraft {
    /// Draft for a record that does not exist yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Draft for changing an already stored record
    pub fn edit(attachment: Attachment) -> Self {
        let loaded_filename = Some(attachment.filename.clone()).filter(|f| !f.is_empty());
        Self {
            attachment,
            loaded_filename,
            staged: None,
            errors: ValidationErrors::new(),
        }
    }

    pub fn attachment(&self) -> &Attachment {
        &self.attachment
    }

    /// Rename the original; a name that sanitizes to nothing leaves the
    /// draft blank and fails validation on save
    pub fn set_filename(&mut self, filename: &str) {
        self.attachment.filename = sanitize_filename(filename);
    }

    /// Filename at load time, if it has been changed since
    pub fn previous_filename(&self) -> Option<&str> {
        self.loaded_filename
            .as_deref()
            .filter(|loaded| *loaded != self.attachment.filename)
    }

    pub fn has_pending_upload(&self) -> bool {
        self.staged.is_some()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Take over the classified upload's metadata and keep it pending
    pub(crate) fn apply_upload(&mut self, staged: StagedUpload) {
        self.attachment.filename = staged.filename.clone();
        self.attachment.content_type = staged.content_type.clone();
        self.attachment.size = staged.size;
        match &staged.image {
            Some(info) => {
                self.attachment.width = Some(info.width);
                self.attachment.height = Some(info.height);
            }
            None => {
                self.attachment.width = None;
                self.attachment.height = None;
            }
        }
        self.staged = Some(staged);
    }

    pub(crate) fn into_parts(self) -> (Attachment, Option<String>, Option<StagedUpload>) {
        let previous = self.previous_filename().map(str::to_string);
        (self.attachment, previous, self.staged)
    }
}
