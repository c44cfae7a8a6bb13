//! Attachment Service
//!
//! Ties the record store to the files on disk: commits staged uploads when a
//! record is saved, moves or cleans files when its name changes, removes the
//! partition directory when it is destroyed, and serves variants by path.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use att_core::{AppConfig, Id, ValidationErrors, UPLOADED_DATA};
use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::model::{Attachment, AttachmentDraft};
use crate::partition::{id_from_segments, parse_variant_file_name, Partitioner};
use crate::probe::{IdentifyProbe, ImageProbe};
use crate::processor::{ConvertProcessor, ImageProcessor};
use crate::replica::{ReplicaSet, ReplicaTransport, SshTransport};
use crate::spec::{AttachmentSpecification, VariantKey};
use crate::storage;
use crate::thumbnail::{ThumbnailEngine, ThumbnailError};
use crate::upload::{StagedUpload, UploadError, UploadSource, UploadStager};

/// Service errors
#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("Attachment not found: {0}")]
    NotFound(Id),
    #[error("Validation failed: {0}")]
    Validation(ValidationErrors),
    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),
    #[error("Thumbnail error: {0}")]
    Thumbnail(#[from] ThumbnailError),
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),
    #[error("Attachment has not been saved")]
    MissingId,
    #[error("Store error: {0}")]
    Store(String),
}

pub type AttachmentResult<T> = Result<T, AttachmentError>;

/// Attachment store trait
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Create an attachment record, assigning its ID
    async fn create(&self, attachment: &mut Attachment) -> AttachmentResult<Id>;

    /// Get an attachment by ID
    async fn get(&self, id: Id) -> AttachmentResult<Option<Attachment>>;

    /// Update an attachment
    async fn update(&self, attachment: &Attachment) -> AttachmentResult<()>;

    /// Delete an attachment
    async fn delete(&self, id: Id) -> AttachmentResult<()>;

    /// Every stored attachment
    async fn all(&self) -> AttachmentResult<Vec<Attachment>>;
}

/// In-memory attachment store for testing
pub struct MemoryAttachmentStore {
    attachments: RwLock<Vec<Attachment>>,
    next_id: std::sync::atomic::AtomicI64,
}

impl Default for MemoryAttachmentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAttachmentStore {
    pub fn new() -> Self {
        Self {
            attachments: RwLock::new(Vec::new()),
            next_id: std::sync::atomic::AtomicI64::new(1),
        }
    }
}

#[async_trait]
impl AttachmentStore for MemoryAttachmentStore {
    async fn create(&self, attachment: &mut Attachment) -> AttachmentResult<Id> {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        attachment.id = Some(id);

        let mut attachments = self.attachments.write().await;
        attachments.push(attachment.clone());

        Ok(id)
    }

    async fn get(&self, id: Id) -> AttachmentResult<Option<Attachment>> {
        let attachments = self.attachments.read().await;
        Ok(attachments.iter().find(|a| a.id == Some(id)).cloned())
    }

    async fn update(&self, attachment: &Attachment) -> AttachmentResult<()> {
        let id = attachment.id.ok_or(AttachmentError::MissingId)?;
        let mut attachments = self.attachments.write().await;
        match attachments.iter().position(|a| a.id == Some(id)) {
            Some(pos) => {
                attachments[pos] = attachment.clone();
                Ok(())
            }
            None => Err(AttachmentError::NotFound(id)),
        }
    }

    async fn delete(&self, id: Id) -> AttachmentResult<()> {
        let mut attachments = self.attachments.write().await;
        attachments.retain(|a| a.id != Some(id));
        Ok(())
    }

    async fn all(&self) -> AttachmentResult<Vec<Attachment>> {
        Ok(self.attachments.read().await.clone())
    }
}

/// External collaborators of the service
#[derive(Clone)]
pub struct AttachmentBackends {
    pub probe: Arc<dyn ImageProbe>,
    pub processor: Arc<dyn ImageProcessor>,
    pub transport: Arc<dyn ReplicaTransport>,
}

impl AttachmentBackends {
    /// `identify`, `convert`, `ssh` and `scp` as configured
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            probe: Arc::new(IdentifyProbe::from_config(&config.tools)),
            processor: Arc::new(ConvertProcessor::from_config(&config.tools)),
            transport: Arc::new(SshTransport::from_config(&config.replication)),
        }
    }
}

/// A file found by [`AttachmentService::lookup_by_encoded_path`]
#[derive(Debug, Clone)]
pub struct VariantContent {
    pub attachment: Attachment,
    /// `None` for the original
    pub variant: Option<VariantKey>,
    pub path: PathBuf,
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// Attachment service for one specification
pub struct AttachmentService<St: AttachmentStore> {
    store: Arc<St>,
    spec: Arc<AttachmentSpecification>,
    partitioner: Partitioner,
    stager: UploadStager,
    engine: ThumbnailEngine,
    replicas: ReplicaSet,
    file_mode: u32,
}

impl<St: AttachmentStore> AttachmentService<St> {
    pub fn new(
        store: Arc<St>,
        spec: Arc<AttachmentSpecification>,
        config: &AppConfig,
        backends: AttachmentBackends,
    ) -> Self {
        let partitioner = Partitioner::from_config(&config.storage);
        let stager = UploadStager::from_config(&config.storage, backends.probe.clone());
        let engine = ThumbnailEngine::new(
            partitioner.clone(),
            backends.probe.clone(),
            backends.processor,
        );
        let replicas = ReplicaSet::new(spec.replicas().to_vec(), backends.transport);

        Self {
            store,
            spec,
            partitioner,
            stager,
            engine,
            replicas,
            file_mode: config.storage.file_mode,
        }
    }

    pub fn specification(&self) -> &AttachmentSpecification {
        &self.spec
    }

    pub fn engine(&self) -> &ThumbnailEngine {
        &self.engine
    }

    /// Get an attachment by ID
    pub async fn get(&self, id: Id) -> AttachmentResult<Option<Attachment>> {
        self.store.get(id).await
    }

    /// Stage an upload onto `draft`.
    ///
    /// Returns `Ok(true)` when the upload was accepted and is now pending.
    /// A missing or empty upload changes nothing. Any other upload replaces
    /// the messages of earlier ones; rejected uploads are recorded on the
    /// `uploaded_data` field and their temp file is dropped.
    #[instrument(skip(self, draft, source))]
    pub async fn assign_upload<R>(
        &self,
        draft: &mut AttachmentDraft,
        source: Option<UploadSource<R>>,
    ) -> AttachmentResult<bool>
    where
        R: AsyncRead + Unpin + Send,
    {
        let Some(source) = source else {
            return Ok(false);
        };

        let staged = self.stager.stage(source).await;
        if matches!(staged, Err(UploadError::EmptyUpload)) {
            debug!("Empty upload ignored");
            return Ok(false);
        }
        // each new upload is judged on its own
        draft.errors.clear_field(UPLOADED_DATA);

        let mut staged = match staged {
            Ok(staged) => staged,
            Err(UploadError::FileTooLarge { max, .. }) => {
                draft.errors.add(
                    UPLOADED_DATA,
                    format!("is too large (maximum is {} bytes)", max),
                );
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        let tag = self.stager.classify(&mut staged).await;
        if !self.stager.accept(tag.as_deref(), &self.spec) {
            info!(
                filename = %staged.filename,
                file_type = tag.as_deref().unwrap_or("unknown"),
                "Upload rejected"
            );
            draft.errors.add(
                UPLOADED_DATA,
                format!(
                    "has an invalid file type; must be one of: {}",
                    self.spec.accepted_types().describe()
                ),
            );
            return Ok(false);
        }

        debug!(filename = %staged.filename, size = staged.size, "Upload accepted");
        draft.apply_upload(staged);
        Ok(true)
    }

    /// Persist `draft` and bring the files on disk in line with it
    #[instrument(skip(self, draft), fields(id = ?draft.attachment().id))]
    pub async fn save(&self, mut draft: AttachmentDraft) -> AttachmentResult<Attachment> {
        if draft.attachment().filename.is_empty() && !draft.has_pending_upload() {
            draft.errors.add(UPLOADED_DATA, "can't be blank");
        }
        if !draft.is_valid() {
            return Err(AttachmentError::Validation(draft.errors));
        }

        let (mut attachment, previous_filename, staged) = draft.into_parts();
        attachment.updated_at = chrono::Utc::now();

        match attachment.id {
            Some(id) => {
                let before = self
                    .store
                    .get(id)
                    .await?
                    .ok_or(AttachmentError::NotFound(id))?;

                if let Some(previous) = previous_filename.as_deref() {
                    self.on_filename_change(&attachment, previous, staged.is_some())
                        .await?;
                }
                if let Err(e) = self.store.update(&attachment).await {
                    if let (Some(previous), None) = (previous_filename.as_deref(), &staged) {
                        self.undo_rename(&attachment, previous).await;
                    }
                    return Err(e);
                }

                if let Some(staged) = staged {
                    if let Err(e) = self.on_save(&attachment, staged).await {
                        warn!(id, error = %e, "Commit failed, restoring record");
                        self.store.update(&before).await?;
                        return Err(e);
                    }
                }
                info!(id, filename = %attachment.filename, "Attachment updated");
            }
            None => {
                attachment.created_at = attachment.updated_at;
                let id = self.store.create(&mut attachment).await?;

                if let Some(staged) = staged {
                    if let Err(e) = self.on_save(&attachment, staged).await {
                        warn!(id, error = %e, "Commit failed, removing record");
                        self.store.delete(id).await?;
                        return Err(e);
                    }
                }
                info!(id, filename = %attachment.filename, "Attachment created");
            }
        }

        Ok(attachment)
    }

    /// Commit a staged upload onto the original's path.
    ///
    /// Variants of an earlier file with the same name are removed, then the
    /// original is pushed to the replicas in the background.
    #[instrument(skip(self, attachment, staged), fields(id = ?attachment.id))]
    pub async fn on_save(
        &self,
        attachment: &Attachment,
        staged: StagedUpload,
    ) -> AttachmentResult<PathBuf> {
        let id = attachment.storage_id().ok_or(AttachmentError::MissingId)?;
        let target = self
            .partitioner
            .file_path(&self.spec, id, &attachment.filename, None);

        storage::commit_copy(staged.path(), &target).await?;
        storage::set_file_mode(&target, self.file_mode).await?;
        drop(staged);

        for key in self.spec.variants().keys() {
            let stale = self
                .partitioner
                .file_path(&self.spec, id, &attachment.filename, Some(key));
            if let Err(e) = storage::remove_file(&stale).await {
                warn!(path = %stale.display(), error = %e, "Could not remove stale variant");
            }
        }

        info!(path = %target.display(), "Original committed");
        self.replicas.spawn_push(target.clone());
        Ok(target)
    }

    /// Runs before the store update of a persisted record whose name
    /// changed.
    ///
    /// With a new upload the old files are all removed. Otherwise stray
    /// files are removed and the original is moved to its new name.
    #[instrument(skip(self, attachment), fields(id = ?attachment.id, to = %attachment.filename))]
    pub async fn on_filename_change(
        &self,
        attachment: &Attachment,
        previous_filename: &str,
        new_upload: bool,
    ) -> AttachmentResult<()> {
        if previous_filename.is_empty() || previous_filename == attachment.filename {
            return Ok(());
        }
        let id = attachment.storage_id().ok_or(AttachmentError::MissingId)?;

        let old_path = self
            .partitioner
            .file_path(&self.spec, id, previous_filename, None);
        if !storage::exists(&old_path).await {
            debug!(path = %old_path.display(), "No previous file");
            return Ok(());
        }

        let dir = self.partitioner.partition_dir(&self.spec, id);
        let keep = if new_upload { None } else { Some(old_path.as_path()) };
        for (path, e) in storage::remove_except(&dir, keep).await.failures {
            warn!(path = %path.display(), error = %e, "Cleanup failed");
        }

        if !new_upload {
            let new_path = self
                .partitioner
                .file_path(&self.spec, id, &attachment.filename, None);
            tokio::fs::rename(&old_path, &new_path).await?;
            info!(from = %old_path.display(), to = %new_path.display(), "Original renamed");
        }
        Ok(())
    }

    /// Move the original back to `previous_filename` after a rename the store
    /// refused. Variants removed by the rename stay removed.
    async fn undo_rename(&self, attachment: &Attachment, previous_filename: &str) {
        let Some(id) = attachment.storage_id() else {
            return;
        };
        let renamed = self
            .partitioner
            .file_path(&self.spec, id, &attachment.filename, None);
        let original = self
            .partitioner
            .file_path(&self.spec, id, previous_filename, None);
        if !storage::exists(&renamed).await || storage::exists(&original).await {
            return;
        }
        match tokio::fs::rename(&renamed, &original).await {
            Ok(()) => info!(to = %original.display(), "Rename undone"),
            Err(e) => warn!(path = %renamed.display(), error = %e, "Could not undo rename"),
        }
    }

    /// Remove the partition directory; failures are only logged
    #[instrument(skip(self, attachment), fields(id = ?attachment.id))]
    pub async fn on_destroy(&self, attachment: &Attachment) {
        let Some(id) = attachment.storage_id() else {
            return;
        };
        let dir = self.partitioner.partition_dir(&self.spec, id);
        match storage::remove_dir(&dir).await {
            Ok(()) => info!(dir = %dir.display(), "Partition directory removed"),
            Err(e) => warn!(dir = %dir.display(), error = %e, "Cleanup failed"),
        }
    }

    /// Delete the record, then its files
    #[instrument(skip(self))]
    pub async fn destroy(&self, id: Id) -> AttachmentResult<Attachment> {
        let attachment = self
            .store
            .get(id)
            .await?
            .ok_or(AttachmentError::NotFound(id))?;

        self.store.delete(id).await?;
        self.on_destroy(&attachment).await;

        info!(id, filename = %attachment.filename, "Attachment deleted");
        Ok(attachment)
    }

    /// Resolve `<seg1>/<seg2>/<name>` to the original or a registered
    /// variant, generating the variant when it is missing.
    ///
    /// Anything that cannot be served is `Ok(None)`.
    #[instrument(skip(self))]
    pub async fn lookup_by_encoded_path(
        &self,
        first: &str,
        second: &str,
        name: &str,
    ) -> AttachmentResult<Option<VariantContent>> {
        let Some(id) = id_from_segments(first, second).and_then(|id| Id::try_from(id).ok())
        else {
            return Ok(None);
        };
        let Some(attachment) = self.store.get(id).await? else {
            return Ok(None);
        };
        let Some(variant) = parse_variant_file_name(name, &attachment.filename, &self.spec)
        else {
            return Ok(None);
        };

        let path = match &variant {
            None => self.path_for(&attachment, None)?,
            Some(key) => match self.engine.ensure(&attachment, &self.spec, key).await {
                Ok(path) => path,
                Err(e) => {
                    debug!(id, variant = %key, error = %e, "Variant not available");
                    return Ok(None);
                }
            },
        };

        let Some(data) = storage::read_if_exists(&path).await? else {
            return Ok(None);
        };
        Ok(Some(VariantContent {
            content_type: attachment.content_type.clone(),
            attachment,
            variant,
            path,
            data,
        }))
    }

    /// Where the original or a variant lives; never generates anything
    pub fn path_for(
        &self,
        attachment: &Attachment,
        key: Option<&VariantKey>,
    ) -> AttachmentResult<PathBuf> {
        if let Some(key) = key {
            if !self.spec.has_variant(key) {
                return Err(ThumbnailError::UnknownVariant(key.clone()).into());
            }
        }
        let id = attachment.storage_id().ok_or(AttachmentError::MissingId)?;
        Ok(self
            .partitioner
            .file_path(&self.spec, id, &attachment.filename, key))
    }

    /// Like [`path_for`](Self::path_for), but generates missing variants
    /// when the specification asks for it
    pub async fn resolve_path(
        &self,
        attachment: &Attachment,
        key: Option<&VariantKey>,
    ) -> AttachmentResult<PathBuf> {
        match key {
            Some(key) if self.spec.autocreate() => {
                Ok(self.engine.ensure(attachment, &self.spec, key).await?)
            }
            _ => self.path_for(attachment, key),
        }
    }

    /// Path below the public root, e.g. `/system/photos/0000/0001/a.jpg`
    pub fn public_path(&self, attachment: &Attachment, key: Option<&VariantKey>) -> Option<String> {
        let id = attachment.storage_id()?;
        if key.is_some_and(|k| !self.spec.has_variant(k)) {
            return None;
        }
        self.partitioner
            .public_path(&self.spec, id, &attachment.filename, key)
    }

    /// Remove one variant for every stored record, or with `None` every file
    /// besides the original, so the next request regenerates them. Returns
    /// the number of files removed.
    #[instrument(skip(self))]
    pub async fn regenerate_thumbnails(&self, key: Option<&VariantKey>) -> AttachmentResult<usize> {
        if let Some(key) = key {
            if !self.spec.has_variant(key) {
                return Err(ThumbnailError::UnknownVariant(key.clone()).into());
            }
        }

        let mut removed = 0;
        for attachment in self.store.all().await? {
            let Some(id) = attachment.storage_id() else {
                continue;
            };
            match key {
                Some(key) => {
                    let path = self
                        .partitioner
                        .file_path(&self.spec, id, &attachment.filename, Some(key));
                    if storage::exists(&path).await {
                        storage::remove_file(&path).await?;
                        removed += 1;
                    }
                }
                None => {
                    let dir = self.partitioner.partition_dir(&self.spec, id);
                    let original = self
                        .partitioner
                        .file_path(&self.spec, id, &attachment.filename, None);
                    let removal = storage::remove_except(&dir, Some(&original)).await;
                    for (path, e) in &removal.failures {
                        warn!(path = %path.display(), error = %e, "Cleanup failed");
                    }
                    removed += removal.removed;
                }
            }
        }

        info!(removed, "Variants cleared for regeneration");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{AcceptedTypes, Replica};
    use att_core::Identifiable;
    use std::sync::atomic::{AtomicBool, Ordering};
    use crate::testing::{FakeImageTool, RecordingTransport};
    use crate::upload::FALLBACK_FILENAME;
    use std::path::Path;
    use std::time::Duration;

    type Service = AttachmentService<MemoryAttachmentStore>;

    struct Fixture {
        root: tempfile::TempDir,
        tool: Arc<FakeImageTool>,
        transport: Arc<RecordingTransport>,
        store: Arc<MemoryAttachmentStore>,
        service: Service,
    }

    impl Fixture {
        fn dir(&self, id: u64) -> PathBuf {
            self.root
                .path()
                .join("public/system/photos")
                .join(crate::partition::partition(id).join("/"))
        }

        fn staging(&self) -> PathBuf {
            self.root.path().join("tmp")
        }
    }

    fn photos() -> crate::spec::SpecificationBuilder {
        AttachmentSpecification::builder("photos")
            .thumbnail("medium", "120x")
            .croppable_thumbnail("preview", "200x100")
    }

    fn config_for(root: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.storage.root = root.to_path_buf();
        config.storage.tmp_dir = Some(root.join("tmp"));
        config.storage.max_upload_size = 4096;
        config
    }

    fn backends_for(
        tool: &Arc<FakeImageTool>,
        transport: &Arc<RecordingTransport>,
    ) -> AttachmentBackends {
        AttachmentBackends {
            probe: tool.clone(),
            processor: tool.clone(),
            transport: transport.clone(),
        }
    }

    fn fixture_for(spec: AttachmentSpecification) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let tool = Arc::new(FakeImageTool::new());
        let transport = Arc::new(RecordingTransport::failing_for(&["down.example.com"]));
        let store = Arc::new(MemoryAttachmentStore::new());
        let service = AttachmentService::new(
            store.clone(),
            Arc::new(spec),
            &config_for(root.path()),
            backends_for(&tool, &transport),
        );

        Fixture {
            root,
            tool,
            transport,
            store,
            service,
        }
    }

    fn fixture() -> Fixture {
        fixture_for(photos().build().unwrap())
    }

    fn jpeg(name: &str) -> Option<UploadSource<std::io::Cursor<Vec<u8>>>> {
        Some(UploadSource::from_bytes(
            FakeImageTool::image_bytes("jpeg", 800, 600),
            name,
        ))
    }

    async fn upload(f: &Fixture, name: &str) -> Attachment {
        let mut draft = AttachmentDraft::new();
        assert!(f.service.assign_upload(&mut draft, jpeg(name)).await.unwrap());
        f.service.save(draft).await.unwrap()
    }

    fn names_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_save_commits_upload() {
        let f = fixture();
        let saved = upload(&f, "My Photo.jpg").await;

        assert_eq!(saved.id, Some(1));
        assert_eq!(saved.filename, "My_Photo.jpg");
        assert_eq!(saved.content_type.as_deref(), Some("image/jpeg"));
        assert_eq!(saved.dimensions(), Some((800, 600)));
        assert_eq!(f.store.get(1).await.unwrap(), Some(saved.clone()));

        let original = f.dir(1).join("My_Photo.jpg");
        assert_eq!(
            std::fs::read(&original).unwrap(),
            FakeImageTool::image_bytes("jpeg", 800, 600)
        );
        assert_eq!(names_in(&f.staging()), Vec::<String>::new());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&original).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o644);
        }
    }

    #[tokio::test]
    async fn test_rejected_type_leaves_record_unsaved() {
        let f = fixture();
        let mut draft = AttachmentDraft::new();
        let bmp = UploadSource::from_bytes(FakeImageTool::image_bytes("bmp", 10, 10), "a.bmp");

        assert!(!f.service.assign_upload(&mut draft, Some(bmp)).await.unwrap());
        assert_eq!(
            draft.errors.get(UPLOADED_DATA).unwrap(),
            &["has an invalid file type; must be one of: gif, jpeg, png, psd".to_string()]
        );
        assert!(!draft.has_pending_upload());

        let result = f.service.save(draft).await;
        assert!(matches!(result, Err(AttachmentError::Validation(e)) if e.has_error(UPLOADED_DATA)));
        assert!(f.store.all().await.unwrap().is_empty());
        assert!(!f.dir(1).exists());
        assert_eq!(names_in(&f.staging()), Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_accepted_upload_replaces_earlier_rejection() {
        let f = fixture();
        let mut draft = AttachmentDraft::new();
        let bmp = UploadSource::from_bytes(FakeImageTool::image_bytes("bmp", 10, 10), "a.bmp");
        assert!(!f.service.assign_upload(&mut draft, Some(bmp)).await.unwrap());
        let big = UploadSource::from_bytes(vec![1u8; 5000], "big.jpg");
        assert!(!f.service.assign_upload(&mut draft, Some(big)).await.unwrap());
        assert_eq!(
            draft.errors.get(UPLOADED_DATA).unwrap(),
            &["is too large (maximum is 4096 bytes)".to_string()]
        );

        // an empty upload keeps the current messages
        let empty = UploadSource::new(&b""[..], "a.jpg");
        assert!(!f.service.assign_upload(&mut draft, Some(empty)).await.unwrap());
        assert!(draft.errors.has_error(UPLOADED_DATA));

        assert!(f.service.assign_upload(&mut draft, jpeg("a.jpg")).await.unwrap());
        assert!(draft.is_valid());
        let saved = f.service.save(draft).await.unwrap();
        assert_eq!(saved.filename, "a.jpg");
        assert!(f.dir(1).join("a.jpg").exists());
    }

    #[tokio::test]
    async fn test_dot_only_names_stay_inside_partition() {
        let f = fixture();
        let saved = upload(&f, "..").await;
        assert_eq!(saved.filename, FALLBACK_FILENAME);
        assert_eq!(names_in(&f.dir(1)), vec![FALLBACK_FILENAME]);

        let mut draft = AttachmentDraft::edit(saved);
        draft.set_filename("..");
        let result = f.service.save(draft).await;
        assert!(matches!(result, Err(AttachmentError::Validation(e)) if e.has_error(UPLOADED_DATA)));
        assert_eq!(names_in(&f.dir(1)), vec![FALLBACK_FILENAME]);
        assert_eq!(f.store.get(1).await.unwrap().unwrap().filename, FALLBACK_FILENAME);
    }

    #[tokio::test]
    async fn test_missing_or_empty_upload_is_a_no_op() {
        let f = fixture();
        let mut draft = AttachmentDraft::new();

        let none: Option<UploadSource<&[u8]>> = None;
        assert!(!f.service.assign_upload(&mut draft, none).await.unwrap());
        let empty = UploadSource::new(&b""[..], "a.jpg");
        assert!(!f.service.assign_upload(&mut draft, Some(empty)).await.unwrap());
        assert!(draft.is_valid());

        // nothing to save either
        let result = f.service.save(draft).await;
        assert!(matches!(result, Err(AttachmentError::Validation(_))));
    }

    #[tokio::test]
    async fn test_too_large_upload_is_a_field_error() {
        let f = fixture();
        let mut draft = AttachmentDraft::new();
        let big = UploadSource::from_bytes(vec![1u8; 5000], "big.jpg");

        assert!(!f.service.assign_upload(&mut draft, Some(big)).await.unwrap());
        assert_eq!(
            draft.errors.get(UPLOADED_DATA).unwrap()[0],
            "is too large (maximum is 4096 bytes)"
        );
    }

    #[tokio::test]
    async fn test_any_type_accepted_when_configured() {
        let f = fixture_for(photos().accept(AcceptedTypes::All).build().unwrap());
        let mut draft = AttachmentDraft::new();
        let pdf = UploadSource::from_bytes(b"%PDF-1.4".to_vec(), "report.pdf")
            .content_type("application/pdf");

        assert!(f.service.assign_upload(&mut draft, Some(pdf)).await.unwrap());
        let saved = f.service.save(draft).await.unwrap();
        assert_eq!(saved.content_type.as_deref(), Some("application/pdf"));
        assert_eq!(saved.dimensions(), None);
        assert!(f.dir(1).join("report.pdf").exists());

        // not an image, so no variants
        let medium = f.service.lookup_by_encoded_path("0000", "0001", "report_medium.pdf").await;
        assert!(medium.unwrap().is_none());
        let original = f
            .service
            .lookup_by_encoded_path("0000", "0001", "report.pdf")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(original.data, Bytes::from_static(b"%PDF-1.4"));
    }

    #[tokio::test]
    async fn test_rename_moves_original_and_drops_variants() {
        let f = fixture();
        let saved = upload(&f, "a.jpg").await;
        let key = VariantKey::new("medium");
        f.service.engine().ensure(&saved, f.service.specification(), &key).await.unwrap();
        assert_eq!(names_in(&f.dir(1)), vec!["a.jpg", "a_medium.jpg"]);
        let bytes = std::fs::read(f.dir(1).join("a.jpg")).unwrap();

        let mut draft = AttachmentDraft::edit(saved);
        draft.set_filename("b.jpg");
        let renamed = f.service.save(draft).await.unwrap();

        assert_eq!(renamed.filename, "b.jpg");
        assert_eq!(names_in(&f.dir(1)), vec!["b.jpg"]);
        assert_eq!(std::fs::read(f.dir(1).join("b.jpg")).unwrap(), bytes);
        assert_eq!(f.store.get(1).await.unwrap().unwrap().filename, "b.jpg");
    }

    /// Refuses every update while `refuse` is set
    #[derive(Default)]
    struct RefusingStore {
        inner: MemoryAttachmentStore,
        refuse: AtomicBool,
    }

    #[async_trait]
    impl AttachmentStore for RefusingStore {
        async fn create(&self, attachment: &mut Attachment) -> AttachmentResult<Id> {
            self.inner.create(attachment).await
        }

        async fn get(&self, id: Id) -> AttachmentResult<Option<Attachment>> {
            self.inner.get(id).await
        }

        async fn update(&self, attachment: &Attachment) -> AttachmentResult<()> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(AttachmentError::Store("update refused".into()));
            }
            self.inner.update(attachment).await
        }

        async fn delete(&self, id: Id) -> AttachmentResult<()> {
            self.inner.delete(id).await
        }

        async fn all(&self) -> AttachmentResult<Vec<Attachment>> {
            self.inner.all().await
        }
    }

    #[tokio::test]
    async fn test_refused_rename_moves_original_back() {
        let root = tempfile::tempdir().unwrap();
        let tool = Arc::new(FakeImageTool::new());
        let store = Arc::new(RefusingStore::default());
        let service = AttachmentService::new(
            store.clone(),
            Arc::new(photos().build().unwrap()),
            &config_for(root.path()),
            backends_for(&tool, &Arc::new(RecordingTransport::default())),
        );
        let dir = root.path().join("public/system/photos/0000/0001");

        let mut draft = AttachmentDraft::new();
        assert!(service.assign_upload(&mut draft, jpeg("a.jpg")).await.unwrap());
        let saved = service.save(draft).await.unwrap();
        let bytes = std::fs::read(dir.join("a.jpg")).unwrap();

        store.refuse.store(true, Ordering::SeqCst);
        let mut draft = AttachmentDraft::edit(saved);
        draft.set_filename("b.jpg");
        let result = service.save(draft).await;

        assert!(matches!(result, Err(AttachmentError::Store(_))));
        assert_eq!(names_in(&dir), vec!["a.jpg"]);
        assert_eq!(std::fs::read(dir.join("a.jpg")).unwrap(), bytes);
        assert_eq!(store.get(1).await.unwrap().unwrap().filename, "a.jpg");
    }

    #[tokio::test]
    async fn test_rename_with_new_upload_clears_old_directory() {
        let f = fixture();
        let saved = upload(&f, "a.jpg").await;
        f.service
            .engine()
            .ensure(&saved, f.service.specification(), &"preview".into())
            .await
            .unwrap();

        let mut draft = AttachmentDraft::edit(saved);
        let png = UploadSource::from_bytes(FakeImageTool::image_bytes("png", 40, 30), "c.png");
        assert!(f.service.assign_upload(&mut draft, Some(png)).await.unwrap());
        let updated = f.service.save(draft).await.unwrap();

        assert_eq!(updated.filename, "c.png");
        assert_eq!(updated.dimensions(), Some((40, 30)));
        assert_eq!(names_in(&f.dir(1)), vec!["c.png"]);
    }

    #[tokio::test]
    async fn test_new_upload_with_same_name_drops_stale_variants() {
        let f = fixture();
        let saved = upload(&f, "a.jpg").await;
        f.service
            .engine()
            .ensure(&saved, f.service.specification(), &"medium".into())
            .await
            .unwrap();

        let mut draft = AttachmentDraft::edit(saved);
        let again = UploadSource::from_bytes(FakeImageTool::image_bytes("jpeg", 300, 300), "a.jpg");
        assert!(f.service.assign_upload(&mut draft, Some(again)).await.unwrap());
        f.service.save(draft).await.unwrap();

        assert_eq!(names_in(&f.dir(1)), vec!["a.jpg"]);
        let content = f
            .service
            .lookup_by_encoded_path("0000", "0001", "a_medium.jpg")
            .await
            .unwrap()
            .unwrap();
        let info = FakeImageTool::info_of(&content.data).unwrap();
        assert_eq!((info.width, info.height), (120, 120));
    }

    #[tokio::test]
    async fn test_lookup_by_encoded_path() {
        let f = fixture();
        upload(&f, "a.jpg").await;

        let original = f
            .service
            .lookup_by_encoded_path("0000", "0001", "a.jpg")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(original.variant, None);
        assert_eq!(original.content_type.as_deref(), Some("image/jpeg"));

        let preview = f
            .service
            .lookup_by_encoded_path("0000", "0001", "a_preview.jpg")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(preview.variant, Some("preview".into()));
        assert_eq!(preview.path, f.dir(1).join("a_preview.jpg"));
        let info = FakeImageTool::info_of(&preview.data).unwrap();
        assert_eq!((info.width, info.height), (200, 100));
        assert_eq!(f.tool.conversions(), 1);

        for (first, second, name) in [
            ("0000", "0001", "a_huge.jpg"),
            ("0000", "0001", "b.jpg"),
            ("0000", "0002", "a.jpg"),
            ("000", "0001", "a.jpg"),
            ("0000", "1", "a.jpg"),
        ] {
            let found = f.service.lookup_by_encoded_path(first, second, name).await.unwrap();
            assert!(found.is_none(), "{}/{}/{}", first, second, name);
        }
    }

    #[tokio::test]
    async fn test_lookup_for_large_ids() {
        let f = fixture();
        let mut attachment = Attachment::new("a.jpg").with_content_type("image/jpeg");
        for _ in 0..12_344 {
            f.store.create(&mut Attachment::new("x.jpg")).await.unwrap();
        }
        f.store.create(&mut attachment).await.unwrap();
        assert_eq!(attachment.id, Some(12_345));

        let path = f.service.path_for(&attachment, None).unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, FakeImageTool::image_bytes("jpeg", 10, 10)).unwrap();

        let found = f
            .service
            .lookup_by_encoded_path("0001", "2345", "a.jpg")
            .await
            .unwrap();
        assert_eq!(found.unwrap().attachment.id, Some(12_345));
    }

    #[tokio::test]
    async fn test_destroy_removes_partition_directory() {
        let f = fixture();
        let saved = upload(&f, "a.jpg").await;
        f.service
            .engine()
            .ensure(&saved, f.service.specification(), &"medium".into())
            .await
            .unwrap();

        f.service.destroy(1).await.unwrap();
        assert!(!f.dir(1).exists());
        assert!(f.store.get(1).await.unwrap().is_none());

        for name in ["a.jpg", "a_medium.jpg", "a_preview.jpg"] {
            let found = f.service.lookup_by_encoded_path("0000", "0001", name).await.unwrap();
            assert!(found.is_none());
        }
        assert!(matches!(f.service.destroy(1).await, Err(AttachmentError::NotFound(1))));
    }

    #[tokio::test]
    async fn test_destroy_tolerates_missing_files() {
        let f = fixture();
        let saved = upload(&f, "a.jpg").await;
        std::fs::remove_dir_all(f.dir(1)).unwrap();

        f.service.on_destroy(&saved).await;
        f.service.on_destroy(&Attachment::new("unsaved.jpg")).await;
        assert!(f.service.destroy(1).await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_commit_rolls_back_new_record() {
        let f = fixture();
        std::fs::create_dir_all(f.root.path().join("public/system")).unwrap();
        std::fs::write(f.root.path().join("public/system/photos"), b"not a dir").unwrap();

        let mut draft = AttachmentDraft::new();
        assert!(f.service.assign_upload(&mut draft, jpeg("a.jpg")).await.unwrap());
        let result = f.service.save(draft).await;

        assert!(matches!(result, Err(AttachmentError::Storage(_))));
        assert!(f.store.all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replica_push_does_not_block_save() {
        let spec = photos()
            .replica(Replica::new("down.example.com", "deploy"))
            .replica(Replica::new("up.example.com", "deploy"))
            .build()
            .unwrap();
        let f = fixture_for(spec);
        let saved = upload(&f, "a.jpg").await;
        assert!(saved.is_persisted());

        let original = f.dir(1).join("a.jpg");
        let expected = format!("copy deploy@up.example.com {}", original.display());
        for _ in 0..100 {
            if f.transport.calls().contains(&expected) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let calls = f.transport.calls();
        assert!(calls.contains(&expected), "calls: {:?}", calls);
        // the unreachable replica never got a copy
        assert!(!calls.iter().any(|c| c.starts_with("copy deploy@down")));
    }

    #[tokio::test]
    async fn test_paths() {
        let f = fixture();
        let saved = upload(&f, "a.jpg").await;
        let medium = VariantKey::new("medium");

        assert_eq!(
            f.service.path_for(&saved, Some(&medium)).unwrap(),
            f.dir(1).join("a_medium.jpg")
        );
        assert!(matches!(
            f.service.path_for(&saved, Some(&"huge".into())),
            Err(AttachmentError::Thumbnail(ThumbnailError::UnknownVariant(_)))
        ));
        assert!(matches!(
            f.service.path_for(&Attachment::new("a.jpg"), None),
            Err(AttachmentError::MissingId)
        ));
        assert_eq!(
            f.service.public_path(&saved, Some(&medium)).as_deref(),
            Some("/system/photos/0000/0001/a_medium.jpg")
        );

        // without autocreate nothing is generated
        let path = f.service.resolve_path(&saved, Some(&medium)).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_resolve_path_autocreates() {
        let f = fixture_for(photos().autocreate(true).build().unwrap());
        let saved = upload(&f, "a.jpg").await;

        let path = f.service.resolve_path(&saved, Some(&"medium".into())).await.unwrap();
        assert!(path.exists());
        assert_eq!(f.tool.conversions(), 1);
    }

    #[tokio::test]
    async fn test_regenerate_thumbnails() {
        let f = fixture();
        let first = upload(&f, "a.jpg").await;
        let second = upload(&f, "b.jpg").await;
        let spec = f.service.specification();
        for attachment in [&first, &second] {
            for key in ["medium", "preview"] {
                f.service.engine().ensure(attachment, spec, &key.into()).await.unwrap();
            }
        }

        assert_eq!(f.service.regenerate_thumbnails(Some(&"medium".into())).await.unwrap(), 2);
        assert_eq!(names_in(&f.dir(1)), vec!["a.jpg", "a_preview.jpg"]);

        // left behind by a variant that is no longer registered
        std::fs::write(f.dir(1).join("a_thumb.jpg"), b"stale").unwrap();
        assert_eq!(f.service.regenerate_thumbnails(None).await.unwrap(), 3);
        assert_eq!(names_in(&f.dir(1)), vec!["a.jpg"]);
        assert_eq!(names_in(&f.dir(2)), vec!["b.jpg"]);
        assert!(f.service.regenerate_thumbnails(Some(&"huge".into())).await.is_err());
    }
}
