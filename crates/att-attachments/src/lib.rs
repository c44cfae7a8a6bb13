//! # att-attachments
//!
//! File attachments for records: uploads are staged, committed into a
//! per-record partition directory when the record is saved, and image
//! variants are derived on demand with an external image tool.
//!
//! ## Example
//!
//! ```rust,ignore
//! use att_attachments::{AttachmentBackends, AttachmentDraft, AttachmentService,
//!     AttachmentSpecification, MemoryAttachmentStore, UploadSource};
//! use std::sync::Arc;
//!
//! let spec = AttachmentSpecification::builder("photos")
//!     .thumbnail("medium", "120x")
//!     .croppable_thumbnail("avatar", "64x64")
//!     .build()?;
//! let service = AttachmentService::new(
//!     Arc::new(MemoryAttachmentStore::new()),
//!     Arc::new(spec),
//!     &config,
//!     AttachmentBackends::from_config(&config),
//! );
//!
//! let mut draft = AttachmentDraft::new();
//! service.assign_upload(&mut draft, Some(UploadSource::from_bytes(data, "me.jpg"))).await?;
//! let attachment = service.save(draft).await?;
//!
//! // served from public/system/photos/0000/0001/me_avatar.jpg
//! let avatar = service.lookup_by_encoded_path("0000", "0001", "me_avatar.jpg").await?;
//! ```

pub mod geometry;
pub mod model;
pub mod partition;
pub mod probe;
pub mod processor;
pub mod replica;
pub mod service;
pub mod spec;
pub mod storage;
pub mod thumbnail;
pub mod tool;
pub mod upload;

#[cfg(test)]
pub(crate) mod testing;

pub use geometry::{Geometry, GeometryError, GeometryFlag};
pub use model::{sanitize_filename, Attachment, AttachmentDraft};
pub use partition::{partition, Partitioner};
pub use probe::{IdentifyProbe, ImageInfo, ImageProbe, ProbeOutcome};
pub use processor::{ConvertProcessor, ImageProcessor};
pub use replica::{ReplicaError, ReplicaSet, ReplicaTransport, SshTransport};
pub use service::{
    AttachmentBackends, AttachmentError, AttachmentResult, AttachmentService, AttachmentStore,
    MemoryAttachmentStore, VariantContent,
};
pub use spec::{
    AcceptedTypes, AttachmentSpecification, RegeneratePolicy, Replica, SpecificationBuilder,
    SpecificationDef, SpecificationError, VariantKey,
};
pub use thumbnail::{CropWindow, ThumbnailEngine, ThumbnailError};
pub use tool::ProcessError;
pub use upload::{StagedUpload, UploadError, UploadSource, UploadStager};
