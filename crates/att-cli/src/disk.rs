//! Records reconstructed from the storage tree
//!
//! The CLI has no database. A record is rebuilt from its partition
//! directory: the original is the one file every other file is a variant
//! of, and its type and dimensions come from probing it.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use att_attachments::partition::parse_variant_file_name;
use att_attachments::storage::is_temp_name;
use att_attachments::{
    Attachment, AttachmentError, AttachmentResult, AttachmentSpecification, AttachmentStore,
    ImageProbe, Partitioner, ProbeOutcome,
};
use att_core::Id;
use tracing::debug;

pub struct DiskStore {
    partitioner: Partitioner,
    spec: Arc<AttachmentSpecification>,
    probe: Arc<dyn ImageProbe>,
}

impl DiskStore {
    pub fn new(
        partitioner: Partitioner,
        spec: Arc<AttachmentSpecification>,
        probe: Arc<dyn ImageProbe>,
    ) -> Self {
        Self {
            partitioner,
            spec,
            probe,
        }
    }

    /// Rebuild the record `id` whose original is called `filename`
    pub async fn load(&self, id: Id, filename: &str) -> AttachmentResult<Option<Attachment>> {
        let Ok(storage_id) = u64::try_from(id) else {
            return Ok(None);
        };
        let path = self
            .partitioner
            .file_path(&self.spec, storage_id, filename, None);
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut attachment = Attachment::new(filename).with_id(id);
        attachment.size = meta.len();
        if let ProbeOutcome::Image(info) = self.probe.probe(&path).await {
            attachment = attachment
                .with_content_type(info.content_type())
                .with_dimensions(info.width, info.height);
        }
        Ok(Some(attachment))
    }

    async fn file_names(&self, dir: &Path) -> std::io::Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Ok(name) = entry.file_name().into_string() {
                if !is_temp_name(&name) {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Name of the file all others in the directory derive from
    pub async fn find_original(&self, id: u64) -> std::io::Result<Option<String>> {
        let dir = self.partitioner.partition_dir(&self.spec, id);
        let names = self.file_names(&dir).await?;

        let original = names.iter().find(|candidate| {
            names
                .iter()
                .all(|name| parse_variant_file_name(name, candidate, &self.spec).is_some())
        });
        debug!(dir = %dir.display(), original = ?original, "Scanned partition directory");
        Ok(original.cloned())
    }
}

#[async_trait]
impl AttachmentStore for DiskStore {
    async fn create(&self, _attachment: &mut Attachment) -> AttachmentResult<Id> {
        Err(AttachmentError::Store("records cannot be created from the command line".into()))
    }

    async fn get(&self, id: Id) -> AttachmentResult<Option<Attachment>> {
        let Ok(storage_id) = u64::try_from(id) else {
            return Ok(None);
        };
        match self.find_original(storage_id).await? {
            Some(filename) => self.load(id, &filename).await,
            None => Ok(None),
        }
    }

    async fn update(&self, _attachment: &Attachment) -> AttachmentResult<()> {
        Err(AttachmentError::Store("records cannot be updated from the command line".into()))
    }

    /// Records live elsewhere; only their files are removed
    async fn delete(&self, _id: Id) -> AttachmentResult<()> {
        Ok(())
    }

    async fn all(&self) -> AttachmentResult<Vec<Attachment>> {
        Ok(Vec::new())
    }
}
