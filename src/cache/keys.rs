//! Cache key definitions.
//!
//! `RequestKey` is the in-memory identity used for job de-duplication and the
//! live/memory tiers. `SourceCacheKey` and `ArtifactCacheKey` are the persistent
//! identities; they are turned into store identifiers by feeding their parts to
//! a SHA-256 digest in a fixed order.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use bytes::Bytes;
use sha2::{Digest, Sha256};

use super::artifact::{ArtifactType, Model};
use super::error::BuildError;

/// Width/height sentinel meaning "use the source's own dimensions".
pub const ORIGINAL_SIZE: i32 = i32::MIN;

/// Something that can append its identity to a running persistent-key digest.
pub trait DigestKey {
    fn update_digest(&self, hasher: &mut Sha256);

    /// Hex-encoded SHA-256 of [`DigestKey::update_digest`]'s output.
    fn digest_hex(&self) -> String {
        let mut hasher = Sha256::new();
        self.update_digest(&mut hasher);
        hex::encode(hasher.finalize().as_slice())
    }
}

/// A source identity or user supplied signature.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheKey {
    /// Contributes nothing to a digest. The default signature.
    #[default]
    Empty,
    Object(String),
    Bytes(Bytes),
    /// A named version marker, e.g. "version 3 of this model".
    Versioned { name: String, version: u64 },
}

impl DigestKey for CacheKey {
    fn update_digest(&self, hasher: &mut Sha256) {
        match self {
            CacheKey::Empty => {}
            CacheKey::Object(value) => hasher.update(value.as_bytes()),
            CacheKey::Bytes(bytes) => hasher.update(bytes),
            CacheKey::Versioned { name, version } => {
                hasher.update(name.as_bytes());
                hasher.update(version.to_be_bytes());
            }
        }
    }
}

/// Identifier of a transformation, stable across processes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransformationId(String);

impl TransformationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Name of a decode option. Options flagged `memory_only` take part in the
/// in-memory identity but not in persistent keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OptionKey {
    name: Cow<'static, str>,
    memory_only: bool,
}

impl OptionKey {
    pub const fn persistent(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
            memory_only: false,
        }
    }

    pub const fn memory_only(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
            memory_only: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(Bytes),
}

impl OptionValue {
    fn update_digest(&self, hasher: &mut Sha256) {
        match self {
            OptionValue::Bool(value) => hasher.update([u8::from(*value)]),
            OptionValue::Int(value) => hasher.update(value.to_be_bytes()),
            OptionValue::Text(value) => hasher.update(value.as_bytes()),
            OptionValue::Bytes(value) => hasher.update(value),
        }
    }
}

/// Ordered decode options. Equality ignores insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Options {
    values: BTreeMap<OptionKey, OptionValue>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: OptionKey, value: OptionValue) -> Self {
        self.values.insert(key, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&OptionValue> {
        self.values
            .iter()
            .find(|(key, _)| key.name() == name)
            .map(|(_, value)| value)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl DigestKey for Options {
    fn update_digest(&self, hasher: &mut Sha256) {
        for (key, value) in &self.values {
            if key.memory_only {
                continue;
            }
            hasher.update(key.name.as_bytes());
            value.update_digest(hasher);
        }
    }
}

/// In-memory identity of a request. Immutable; the hash is computed once.
#[derive(Debug, Clone)]
pub struct RequestKey {
    model: Model,
    signature: CacheKey,
    width: i32,
    height: i32,
    transformations: BTreeMap<ArtifactType, TransformationId>,
    source_type: ArtifactType,
    output_type: ArtifactType,
    options: Options,
    hash: u64,
}

impl RequestKey {
    pub fn builder() -> RequestKeyBuilder {
        RequestKeyBuilder::default()
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn signature(&self) -> &CacheKey {
        &self.signature
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn transformations(&self) -> &BTreeMap<ArtifactType, TransformationId> {
        &self.transformations
    }

    pub fn source_type(&self) -> ArtifactType {
        self.source_type
    }

    pub fn output_type(&self) -> ArtifactType {
        self.output_type
    }

    pub fn options(&self) -> &Options {
        &self.options
    }
}

impl PartialEq for RequestKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
            && self.width == other.width
            && self.height == other.height
            && self.source_type == other.source_type
            && self.output_type == other.output_type
            && self.model == other.model
            && self.signature == other.signature
            && self.transformations == other.transformations
            && self.options == other.options
    }
}

impl Eq for RequestKey {}

impl Hash for RequestKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

/// Collects the parts of a [`RequestKey`]; every part is required.
#[derive(Debug, Default)]
pub struct RequestKeyBuilder {
    model: Option<Model>,
    signature: Option<CacheKey>,
    width: Option<i32>,
    height: Option<i32>,
    transformations: Option<BTreeMap<ArtifactType, TransformationId>>,
    source_type: Option<ArtifactType>,
    output_type: Option<ArtifactType>,
    options: Option<Options>,
}

impl RequestKeyBuilder {
    pub fn model(mut self, model: Model) -> Self {
        self.model = Some(model);
        self
    }

    pub fn signature(mut self, signature: CacheKey) -> Self {
        self.signature = Some(signature);
        self
    }

    pub fn size(mut self, width: i32, height: i32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn transformations(
        mut self,
        transformations: BTreeMap<ArtifactType, TransformationId>,
    ) -> Self {
        self.transformations = Some(transformations);
        self
    }

    pub fn source_type(mut self, source_type: ArtifactType) -> Self {
        self.source_type = Some(source_type);
        self
    }

    pub fn output_type(mut self, output_type: ArtifactType) -> Self {
        self.output_type = Some(output_type);
        self
    }

    pub fn options(mut self, options: Options) -> Self {
        self.options = Some(options);
        self
    }

    pub fn build(self) -> Result<RequestKey, BuildError> {
        let model = self.model.ok_or(BuildError::missing_field("model"))?;
        let signature = self.signature.ok_or(BuildError::missing_field("signature"))?;
        let width = self.width.ok_or(BuildError::missing_field("width"))?;
        let height = self.height.ok_or(BuildError::missing_field("height"))?;
        let transformations = self
            .transformations
            .ok_or(BuildError::missing_field("transformations"))?;
        let source_type = self
            .source_type
            .ok_or(BuildError::missing_field("source_type"))?;
        let output_type = self
            .output_type
            .ok_or(BuildError::missing_field("output_type"))?;
        let options = self.options.ok_or(BuildError::missing_field("options"))?;

        validate_dimension("width", width)?;
        validate_dimension("height", height)?;

        let mut hasher = DefaultHasher::new();
        model.hash(&mut hasher);
        signature.hash(&mut hasher);
        width.hash(&mut hasher);
        height.hash(&mut hasher);
        transformations.hash(&mut hasher);
        source_type.hash(&mut hasher);
        output_type.hash(&mut hasher);
        options.hash(&mut hasher);

        Ok(RequestKey {
            model,
            signature,
            width,
            height,
            transformations,
            source_type,
            output_type,
            options,
            hash: hasher.finish(),
        })
    }
}

fn validate_dimension(dimension: &'static str, value: i32) -> Result<(), BuildError> {
    if value > 0 || value == ORIGINAL_SIZE {
        Ok(())
    } else {
        Err(BuildError::InvalidDimension { dimension, value })
    }
}

/// Identity of unmodified source bytes in the persistent source tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceCacheKey {
    source_key: CacheKey,
    signature: CacheKey,
}

impl SourceCacheKey {
    pub fn new(source_key: CacheKey, signature: CacheKey) -> Self {
        Self {
            source_key,
            signature,
        }
    }

    pub fn source_key(&self) -> &CacheKey {
        &self.source_key
    }
}

impl DigestKey for SourceCacheKey {
    fn update_digest(&self, hasher: &mut Sha256) {
        self.source_key.update_digest(hasher);
        self.signature.update_digest(hasher);
    }
}

/// Identity of a decoded, transformed artifact in the persistent artifact tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactCacheKey {
    source_key: CacheKey,
    signature: CacheKey,
    width: i32,
    height: i32,
    transformation: Option<TransformationId>,
    output_type: ArtifactType,
    options: Options,
}

impl ArtifactCacheKey {
    pub fn new(
        source_key: CacheKey,
        signature: CacheKey,
        width: i32,
        height: i32,
        transformation: Option<TransformationId>,
        output_type: ArtifactType,
        options: Options,
    ) -> Self {
        Self {
            source_key,
            signature,
            width,
            height,
            transformation,
            output_type,
            options,
        }
    }

    pub fn source_key(&self) -> &CacheKey {
        &self.source_key
    }

    pub fn transformation(&self) -> Option<&TransformationId> {
        self.transformation.as_ref()
    }
}

impl DigestKey for ArtifactCacheKey {
    /// Order: source key, signature, width and height (4 big-endian bytes
    /// each), transformation id when present, options, output type id. This
    /// order is the on-disk format.
    fn update_digest(&self, hasher: &mut Sha256) {
        self.source_key.update_digest(hasher);
        self.signature.update_digest(hasher);

        let mut dimensions = [0_u8; 8];
        dimensions[..4].copy_from_slice(&self.width.to_be_bytes());
        dimensions[4..].copy_from_slice(&self.height.to_be_bytes());
        hasher.update(dimensions);

        if let Some(transformation) = &self.transformation {
            hasher.update(transformation.as_str().as_bytes());
        }
        self.options.update_digest(hasher);
        hasher.update(self.output_type.stable_id().as_bytes());
    }
}

/// Either persistent identity; what the persistent stores are keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PersistentKey {
    Source(SourceCacheKey),
    Artifact(ArtifactCacheKey),
}

impl DigestKey for PersistentKey {
    fn update_digest(&self, hasher: &mut Sha256) {
        match self {
            PersistentKey::Source(key) => key.update_digest(hasher),
            PersistentKey::Artifact(key) => key.update_digest(hasher),
        }
    }
}

impl From<SourceCacheKey> for PersistentKey {
    fn from(key: SourceCacheKey) -> Self {
        Self::Source(key)
    }
}

impl From<ArtifactCacheKey> for PersistentKey {
    fn from(key: ArtifactCacheKey) -> Self {
        Self::Artifact(key)
    }
}
