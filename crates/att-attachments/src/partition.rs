//! Path partitioning
//!
//! Every record gets its own directory derived from its id, so that no
//! directory grows past 10,000 entries:
//!
//! ```text
//! <root>/<prefix>/0000/0001/photo.jpg          original of id 1
//! <root>/<prefix>/0000/0001/photo_medium.jpg   variant "medium"
//! <root>/<prefix>/0000/0001/photo_3f2a...jpg   variant "120x" (hashed)
//! ```
//!
//! Everything in this module is pure: the same inputs always give the same
//! path.

use std::path::{Path, PathBuf};

use att_core::StorageConfig;
use sha2::{Digest, Sha256};

use crate::spec::{AttachmentSpecification, VariantKey};

/// Hex characters of the SHA-256 digest kept for raw dimension specs
pub const TOKEN_HEX_LEN: usize = 12;

const SEGMENT_RADIX: u64 = 10_000;

/// Directory segments for a record id: `1 -> ["0000", "0001"]`
///
/// Ids of 10^8 and above keep all their leading digits in the first segment.
pub fn partition(id: u64) -> [String; 2] {
    [
        format!("{:04}", id / SEGMENT_RADIX),
        format!("{:04}", id % SEGMENT_RADIX),
    ]
}

/// Inverse of [`partition`]; `None` unless the segments are canonical
pub fn id_from_segments(first: &str, second: &str) -> Option<u64> {
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if second.len() != 4 || first.len() < 4 || !digits(first) || !digits(second) {
        return None;
    }

    let high: u64 = first.parse().ok()?;
    let low: u64 = second.parse().ok()?;
    let id = high.checked_mul(SEGMENT_RADIX)?.checked_add(low)?;

    let [a, b] = partition(id);
    (a == first && b == second).then_some(id)
}

/// Split at the last `.`; a leading dot does not start an extension
pub fn split_extension(filename: &str) -> (&str, &str) {
    match filename.rfind('.') {
        Some(idx) if idx > 0 => filename.split_at(idx),
        _ => (filename, ""),
    }
}

/// File name token for a variant: the name itself, or a short stable hash
/// for raw dimension specs
pub fn variant_token(key: &VariantKey) -> String {
    if key.is_dimension_spec() {
        let digest = Sha256::digest(key.as_str().as_bytes());
        let mut token = hex::encode(digest);
        token.truncate(TOKEN_HEX_LEN);
        token
    } else {
        key.as_str().to_string()
    }
}

/// `photo.jpg` + `medium` -> `photo_medium.jpg`; no key -> `photo.jpg`
pub fn variant_file_name(original: &str, key: Option<&VariantKey>) -> String {
    match key {
        None => original.to_string(),
        Some(key) => {
            let (base, ext) = split_extension(original);
            format!("{}_{}{}", base, variant_token(key), ext)
        }
    }
}

/// Match `requested` against `^(base)_(token)(ext)$` for the given original.
///
/// Returns `Some(None)` for the original itself, `Some(Some(key))` for a
/// registered variant, and `None` for anything else.
pub fn parse_variant_file_name(
    requested: &str,
    original: &str,
    spec: &AttachmentSpecification,
) -> Option<Option<VariantKey>> {
    if requested == original {
        return Some(None);
    }

    let (base, ext) = split_extension(original);
    let token = requested
        .strip_prefix(base)?
        .strip_prefix('_')?
        .strip_suffix(ext)?;
    if token.is_empty() {
        return None;
    }

    spec.variant_for_token(token).cloned().map(Some)
}

/// Resolves partitioned paths against a storage root
#[derive(Debug, Clone)]
pub struct Partitioner {
    root: PathBuf,
    public_base: PathBuf,
}

impl Partitioner {
    pub fn new(root: impl Into<PathBuf>, public_base: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            public_base: public_base.into(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.root.clone(), config.public_base())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<prefix>/<seg1>/<seg2>`
    pub fn partition_dir(&self, spec: &AttachmentSpecification, id: u64) -> PathBuf {
        let [first, second] = partition(id);
        self.root.join(spec.path_prefix()).join(first).join(second)
    }

    /// Full path of the original (`key == None`) or of a variant
    pub fn file_path(
        &self,
        spec: &AttachmentSpecification,
        id: u64,
        filename: &str,
        key: Option<&VariantKey>,
    ) -> PathBuf {
        self.partition_dir(spec, id)
            .join(variant_file_name(filename, key))
    }

    /// URL-style path relative to the public base, when the file lives under it
    pub fn public_path(
        &self,
        spec: &AttachmentSpecification,
        id: u64,
        filename: &str,
        key: Option<&VariantKey>,
    ) -> Option<String> {
        let full = self.file_path(spec, id, filename, key);
        let relative = full.strip_prefix(&self.public_base).ok()?;
        let segments: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(format!("/{}", segments.join("/")))
    }
}
