//! Specification table
//!
//! Per record type: variant boxes, which variants are center-cropped, where
//! files live, which file types uploads may have, and where originals are
//! replicated. Built once, validated, then shared read-only behind an `Arc`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geometry::{Geometry, GeometryError};
use crate::partition::variant_token;

/// File type tags accepted when nothing else is configured
pub const DEFAULT_FILE_TYPES: &[&str] = &["jpeg", "gif", "png", "psd"];

/// Specification errors, raised when a type is registered
#[derive(Debug, Error)]
pub enum SpecificationError {
    #[error("Invalid path prefix {0:?}: must be relative and stay inside the storage root")]
    InvalidPathPrefix(String),
    #[error("Invalid variant key {0:?}")]
    InvalidVariantKey(String),
    #[error("Invalid geometry for variant {key}: {source}")]
    InvalidGeometry {
        key: String,
        #[source]
        source: GeometryError,
    },
    #[error("Croppable variant {0} has no geometry")]
    UnknownCroppable(String),
    #[error("Croppable variant {0} needs both width and height")]
    CropNeedsBox(String),
    #[error("Variants {0} and {1} map to the same file name token")]
    DuplicateToken(String, String),
}

/// Identifies a derived rendering: a symbolic name or a raw dimension spec
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariantKey(String);

impl VariantKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raw dimension specs (`120x`, `800x600>`) are hashed in file names
    pub fn is_dimension_spec(&self) -> bool {
        Geometry::is_dimension_spec(&self.0)
    }

    /// The part of a file name that identifies this variant
    pub fn token(&self) -> String {
        variant_token(self)
    }
}

impl fmt::Display for VariantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VariantKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for VariantKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// File types an upload may have
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "AcceptedTypesRepr", into = "AcceptedTypesRepr")]
pub enum AcceptedTypes {
    All,
    Only(BTreeSet<String>),
}

impl AcceptedTypes {
    pub fn only<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::Only(
            tags.into_iter()
                .map(|t| t.as_ref().to_ascii_lowercase())
                .collect(),
        )
    }

    /// Whether an upload classified as `tag` (`None` for non-images) passes
    pub fn accepts(&self, tag: Option<&str>) -> bool {
        match self {
            Self::All => true,
            Self::Only(tags) => tag.is_some_and(|t| tags.contains(&t.to_ascii_lowercase())),
        }
    }

    /// Human-readable list for validation messages
    pub fn describe(&self) -> String {
        match self {
            Self::All => "any".to_string(),
            Self::Only(tags) => tags.iter().cloned().collect::<Vec<_>>().join(", "),
        }
    }
}

impl Default for AcceptedTypes {
    fn default() -> Self {
        Self::only(DEFAULT_FILE_TYPES)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum AcceptedTypesRepr {
    Keyword(String),
    List(Vec<String>),
}

impl TryFrom<AcceptedTypesRepr> for AcceptedTypes {
    type Error = String;

    fn try_from(value: AcceptedTypesRepr) -> Result<Self, Self::Error> {
        match value {
            AcceptedTypesRepr::Keyword(k) if k == "all" => Ok(Self::All),
            AcceptedTypesRepr::Keyword(k) => Err(format!("expected \"all\" or a list, got {:?}", k)),
            AcceptedTypesRepr::List(tags) => Ok(Self::only(tags)),
        }
    }
}

impl From<AcceptedTypes> for AcceptedTypesRepr {
    fn from(value: AcceptedTypes) -> Self {
        match value {
            AcceptedTypes::All => Self::Keyword("all".to_string()),
            AcceptedTypes::Only(tags) => Self::List(tags.into_iter().collect()),
        }
    }
}

/// Remote host receiving a copy of every committed original
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    pub host: String,
    pub user: String,
}

impl Replica {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
        }
    }

    /// `user@host` destination
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

impl fmt::Display for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}

/// What to do when a variant file already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegeneratePolicy {
    #[default]
    SkipExisting,
    Force,
}

/// Attachment configuration for one record type
#[derive(Debug, Clone)]
pub struct AttachmentSpecification {
    name: String,
    path_prefix: PathBuf,
    variants: BTreeMap<VariantKey, Geometry>,
    croppable: BTreeSet<VariantKey>,
    accepted_types: AcceptedTypes,
    replicas: Vec<Replica>,
    regenerate: RegeneratePolicy,
    autocreate: bool,
}

impl AttachmentSpecification {
    pub fn builder(name: impl Into<String>) -> SpecificationBuilder {
        SpecificationBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path_prefix(&self) -> &Path {
        &self.path_prefix
    }

    pub fn variants(&self) -> &BTreeMap<VariantKey, Geometry> {
        &self.variants
    }

    pub fn geometry(&self, key: &VariantKey) -> Option<&Geometry> {
        self.variants.get(key)
    }

    pub fn has_variant(&self, key: &VariantKey) -> bool {
        self.variants.contains_key(key)
    }

    pub fn is_croppable(&self, key: &VariantKey) -> bool {
        self.croppable.contains(key)
    }

    pub fn accepted_types(&self) -> &AcceptedTypes {
        &self.accepted_types
    }

    pub fn replicas(&self) -> &[Replica] {
        &self.replicas
    }

    pub fn regenerate(&self) -> RegeneratePolicy {
        self.regenerate
    }

    pub fn autocreate(&self) -> bool {
        self.autocreate
    }

    /// Registered key whose file name token is `token`
    pub fn variant_for_token(&self, token: &str) -> Option<&VariantKey> {
        self.variants.keys().find(|key| key.token() == token)
    }
}

/// Builder for [`AttachmentSpecification`]; problems surface from `build`
#[derive(Debug, Clone)]
pub struct SpecificationBuilder {
    name: String,
    path_prefix: Option<String>,
    thumbnails: Vec<(String, String)>,
    croppable: Vec<String>,
    accepted_types: AcceptedTypes,
    replicas: Vec<Replica>,
    regenerate: RegeneratePolicy,
    autocreate: bool,
}

impl SpecificationBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path_prefix: None,
            thumbnails: Vec::new(),
            croppable: Vec::new(),
            accepted_types: AcceptedTypes::default(),
            replicas: Vec::new(),
            regenerate: RegeneratePolicy::default(),
            autocreate: false,
        }
    }

    pub fn path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
    }

    /// Aspect-preserving variant fitting inside `geometry`
    pub fn thumbnail(mut self, key: impl Into<String>, geometry: impl Into<String>) -> Self {
        self.thumbnails.push((key.into(), geometry.into()));
        self
    }

    /// Center-cropped variant of exactly `geometry`
    pub fn croppable_thumbnail(
        mut self,
        key: impl Into<String>,
        geometry: impl Into<String>,
    ) -> Self {
        let key = key.into();
        self.croppable.push(key.clone());
        self.thumbnails.push((key, geometry.into()));
        self
    }

    /// Mark an already declared variant as croppable
    pub fn crop(mut self, key: impl Into<String>) -> Self {
        self.croppable.push(key.into());
        self
    }

    pub fn accept(mut self, types: AcceptedTypes) -> Self {
        self.accepted_types = types;
        self
    }

    pub fn replica(mut self, replica: Replica) -> Self {
        self.replicas.push(replica);
        self
    }

    pub fn regenerate(mut self, policy: RegeneratePolicy) -> Self {
        self.regenerate = policy;
        self
    }

    pub fn autocreate(mut self, autocreate: bool) -> Self {
        self.autocreate = autocreate;
        self
    }

    pub fn build(self) -> Result<AttachmentSpecification, SpecificationError> {
        let prefix = self
            .path_prefix
            .unwrap_or_else(|| format!("public/system/{}", self.name));
        let path_prefix = PathBuf::from(&prefix);
        let escapes = path_prefix
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if prefix.is_empty() || escapes {
            return Err(SpecificationError::InvalidPathPrefix(prefix));
        }

        let mut variants = BTreeMap::new();
        for (key, geometry) in self.thumbnails {
            let variant = VariantKey::new(key.clone());
            if !variant.is_dimension_spec() && !is_symbolic_name(&key) {
                return Err(SpecificationError::InvalidVariantKey(key));
            }
            let geometry = Geometry::parse(&geometry)
                .map_err(|source| SpecificationError::InvalidGeometry { key, source })?;
            variants.insert(variant, geometry);
        }

        let mut croppable = BTreeSet::new();
        for key in self.croppable {
            let variant = VariantKey::new(key.clone());
            match variants.get(&variant) {
                None => return Err(SpecificationError::UnknownCroppable(key)),
                Some(g) if g.dimensions().is_none() => {
                    return Err(SpecificationError::CropNeedsBox(key))
                }
                Some(_) => {
                    croppable.insert(variant);
                }
            }
        }

        let mut seen: BTreeMap<String, &VariantKey> = BTreeMap::new();
        for key in variants.keys() {
            if let Some(other) = seen.insert(key.token(), key) {
                return Err(SpecificationError::DuplicateToken(
                    other.to_string(),
                    key.to_string(),
                ));
            }
        }

        Ok(AttachmentSpecification {
            name: self.name,
            path_prefix,
            variants,
            croppable,
            accepted_types: self.accepted_types,
            replicas: self.replicas,
            regenerate: self.regenerate,
            autocreate: self.autocreate,
        })
    }
}

fn is_symbolic_name(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Serialized form of a specification, e.g. one entry of a YAML file keyed
/// by type name
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SpecificationDef {
    pub path_prefix: Option<String>,
    pub thumbnails: BTreeMap<String, String>,
    pub croppable_thumbnails: Vec<String>,
    pub valid_filetypes: Option<AcceptedTypes>,
    pub replicas: Vec<Replica>,
    pub regenerate: RegeneratePolicy,
    pub autocreate: bool,
}

impl SpecificationDef {
    pub fn into_specification(
        self,
        name: impl Into<String>,
    ) -> Result<AttachmentSpecification, SpecificationError> {
        let mut builder = AttachmentSpecification::builder(name)
            .regenerate(self.regenerate)
            .autocreate(self.autocreate);
        if let Some(prefix) = self.path_prefix {
            builder = builder.path_prefix(prefix);
        }
        if let Some(types) = self.valid_filetypes {
            builder = builder.accept(types);
        }
        for (key, geometry) in self.thumbnails {
            builder = builder.thumbnail(key, geometry);
        }
        for key in self.croppable_thumbnails {
            builder = builder.crop(key);
        }
        for replica in self.replicas {
            builder = builder.replica(replica);
        }
        builder.build()
    }
}
