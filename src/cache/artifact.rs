//! Artifact, data and model types.
//!
//! Types are a closed set of variants with an explicit subtype relation so
//! that decode stages and transformations can be selected without runtime
//! reflection.

use std::any::Any;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;

use super::keys::CacheKey;

/// Kind of a piece of data or of a produced artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArtifactType {
    /// Matches every other type.
    Any,
    /// Raw bytes held in memory.
    Bytes,
    /// UTF-8 text; a specialisation of `Bytes`.
    Text,
    /// A file on the local file system.
    File,
    /// A decoded still image.
    Image,
    /// A decoded animated image; a specialisation of `Image`.
    AnimatedImage,
}

impl ArtifactType {
    /// Stable identifier written into persistent cache keys. Never change an
    /// existing value: doing so orphans every entry on disk.
    pub fn stable_id(self) -> &'static str {
        match self {
            Self::Any => "stratacache/any",
            Self::Bytes => "stratacache/bytes",
            Self::Text => "stratacache/text",
            Self::File => "stratacache/file",
            Self::Image => "stratacache/image",
            Self::AnimatedImage => "stratacache/animated-image",
        }
    }

    /// Direct supertype, `None` for `Any`.
    pub fn parent(self) -> Option<Self> {
        match self {
            Self::Any => None,
            Self::Bytes | Self::File | Self::Image => Some(Self::Any),
            Self::Text => Some(Self::Bytes),
            Self::AnimatedImage => Some(Self::Image),
        }
    }

    /// True when a value of `self` may be used where `target` is expected.
    pub fn is_assignable_to(self, target: Self) -> bool {
        let mut current = Some(self);
        while let Some(kind) = current {
            if kind == target {
                return true;
            }
            current = kind.parent();
        }
        false
    }

    fn short_name(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Bytes => "bytes",
            Self::Text => "text",
            Self::File => "file",
            Self::Image => "image",
            Self::AnimatedImage => "animated-image",
        }
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

impl FromStr for ArtifactType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let kind = match value.trim().to_ascii_lowercase().as_str() {
            "any" => Self::Any,
            "bytes" => Self::Bytes,
            "text" => Self::Text,
            "file" => Self::File,
            "image" => Self::Image,
            "animated-image" => Self::AnimatedImage,
            other => return Err(format!("unknown artifact type `{other}`")),
        };
        Ok(kind)
    }
}

/// The subject of a request: what the caller wants an artifact of.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Model {
    Uri(String),
    Path(PathBuf),
    Bytes(Bytes),
    Resource(u32),
}

impl Model {
    /// Primary source identity of the model.
    pub fn cache_key(&self) -> CacheKey {
        match self {
            Model::Uri(uri) => CacheKey::Object(uri.clone()),
            Model::Path(path) => CacheKey::Object(path.display().to_string()),
            Model::Bytes(bytes) => CacheKey::Bytes(bytes.clone()),
            Model::Resource(id) => CacheKey::Object(format!("resource:{id}")),
        }
    }
}

/// Raw data produced by a fetch, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Data {
    Bytes { data_type: ArtifactType, bytes: Bytes },
    File(PathBuf),
}

impl Data {
    pub fn bytes(bytes: impl Into<Bytes>) -> Self {
        Self::Bytes {
            data_type: ArtifactType::Bytes,
            bytes: bytes.into(),
        }
    }

    pub fn data_type(&self) -> ArtifactType {
        match self {
            Data::Bytes { data_type, .. } => *data_type,
            Data::File(_) => ArtifactType::File,
        }
    }

    /// Materialise the data as bytes, reading the file when necessary.
    pub fn read_bytes(&self) -> io::Result<Bytes> {
        match self {
            Data::Bytes { bytes, .. } => Ok(bytes.clone()),
            Data::File(path) => std::fs::read(path).map(Bytes::from),
        }
    }
}

/// A computed payload plus the resource cost it occupies while cached.
pub trait Artifact: Send + Sync + fmt::Debug {
    fn artifact_type(&self) -> ArtifactType;

    /// Approximate cost in bytes, used by the memory tier budget.
    fn cost(&self) -> usize;

    /// Return pooled resources. Called at most once per artifact by the
    /// lifetime primitives.
    fn recycle(&self) {}

    fn as_any(&self) -> &dyn Any;
}

pub type BoxedArtifact = Box<dyn Artifact>;

/// Bytes payload tagged with its artifact type.
#[derive(Debug, Clone)]
pub struct BytesArtifact {
    artifact_type: ArtifactType,
    bytes: Bytes,
    recycled: Arc<AtomicUsize>,
}

impl BytesArtifact {
    pub fn new(artifact_type: ArtifactType, bytes: impl Into<Bytes>) -> Self {
        Self {
            artifact_type,
            bytes: bytes.into(),
            recycled: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Share an external recycle counter, letting callers observe recycling
    /// after the artifact has moved into the cache.
    pub fn with_recycle_counter(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.recycled = counter;
        self
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn recycle_count(&self) -> usize {
        self.recycled.load(Ordering::SeqCst)
    }
}

impl Artifact for BytesArtifact {
    fn artifact_type(&self) -> ArtifactType {
        self.artifact_type
    }

    fn cost(&self) -> usize {
        self.bytes.len()
    }

    fn recycle(&self) {
        self.recycled.fetch_add(1, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
