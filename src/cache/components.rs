//! Built-in resolvers, fetchers, stages and encoders.
//!
//! These cover the models and artifact types the crate understands without
//! any caller-supplied components: local files, in-memory bytes and UTF-8
//! text.

use std::any::Any;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tracing::trace;

use super::artifact::{Artifact, ArtifactType, BoxedArtifact, BytesArtifact, Data, Model};
use super::decode::DecodeStage;
use super::error::{FetchError, StageError};
use super::fetch::{DataFetcher, FetchCallback};
use super::keys::{Options, TransformationId};
use super::registry::{ArtifactEncoder, FetchPlan, SourceResolver, Transformation};
use super::strategy::{EncodeStrategy, Provenance};

const SOURCE: &str = "cache::components";

// ============================================================================
// Sources
// ============================================================================

/// Serves `Model::Path` from the local file system.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileResolver;

impl SourceResolver for FileResolver {
    fn name(&self) -> &str {
        "file"
    }

    fn handles(&self, model: &Model) -> bool {
        matches!(model, Model::Path(_))
    }

    fn build_fetch(
        &self,
        model: &Model,
        _width: i32,
        _height: i32,
        _options: &Options,
    ) -> Option<FetchPlan> {
        let Model::Path(path) = model else {
            return None;
        };
        Some(FetchPlan {
            source_key: model.cache_key(),
            alternate_keys: Vec::new(),
            fetcher: Arc::new(FileFetcher::new(path.clone())),
        })
    }
}

/// Hands out a local path once it is known to exist.
#[derive(Debug)]
pub struct FileFetcher {
    path: PathBuf,
    cancelled: AtomicBool,
}

impl FileFetcher {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            cancelled: AtomicBool::new(false),
        }
    }
}

impl DataFetcher for FileFetcher {
    fn load_data(&self, callback: FetchCallback) {
        if self.cancelled.load(Ordering::SeqCst) {
            callback(Err(FetchError::Cancelled));
            return;
        }
        let target = self.path.display().to_string();
        let result = match std::fs::metadata(&self.path) {
            Ok(metadata) if metadata.is_file() => Ok(Data::File(self.path.clone())),
            Ok(_) => Err(FetchError::not_found(target)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(FetchError::not_found(target))
            }
            Err(err) => Err(FetchError::io(target, err)),
        };
        callback(result);
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn data_type(&self) -> ArtifactType {
        ArtifactType::File
    }

    fn provenance(&self) -> Provenance {
        Provenance::Local
    }
}

/// Serves `Model::Bytes` straight from memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesResolver;

impl SourceResolver for BytesResolver {
    fn name(&self) -> &str {
        "bytes"
    }

    fn handles(&self, model: &Model) -> bool {
        matches!(model, Model::Bytes(_))
    }

    fn build_fetch(
        &self,
        model: &Model,
        _width: i32,
        _height: i32,
        _options: &Options,
    ) -> Option<FetchPlan> {
        let Model::Bytes(bytes) = model else {
            return None;
        };
        Some(FetchPlan {
            source_key: model.cache_key(),
            alternate_keys: Vec::new(),
            fetcher: Arc::new(BytesFetcher {
                bytes: bytes.clone(),
            }),
        })
    }
}

/// Completes inline with the bytes it was built from.
#[derive(Debug)]
pub struct BytesFetcher {
    bytes: Bytes,
}

impl DataFetcher for BytesFetcher {
    fn load_data(&self, callback: FetchCallback) {
        callback(Ok(Data::bytes(self.bytes.clone())));
    }

    fn data_type(&self) -> ArtifactType {
        ArtifactType::Bytes
    }

    fn provenance(&self) -> Provenance {
        Provenance::Local
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Reads the data's bytes into a [`BytesArtifact`] unchanged.
#[derive(Debug, Clone, Copy)]
pub struct PassthroughStage {
    data_type: ArtifactType,
}

impl PassthroughStage {
    pub fn new(data_type: ArtifactType) -> Self {
        Self { data_type }
    }
}

impl DecodeStage for PassthroughStage {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn data_type(&self) -> ArtifactType {
        self.data_type
    }

    fn intermediate_type(&self) -> ArtifactType {
        ArtifactType::Bytes
    }

    fn output_type(&self) -> ArtifactType {
        ArtifactType::Bytes
    }

    fn decode(
        &self,
        data: &Data,
        _width: i32,
        _height: i32,
        _options: &Options,
    ) -> Result<Option<BoxedArtifact>, StageError> {
        if !data.data_type().is_assignable_to(self.data_type) {
            return Ok(None);
        }
        let bytes = data.read_bytes()?;
        Ok(Some(Box::new(BytesArtifact::new(ArtifactType::Bytes, bytes))))
    }
}

/// Validates UTF-8 and tags the result as [`ArtifactType::Text`].
#[derive(Debug, Clone, Copy)]
pub struct TextStage {
    data_type: ArtifactType,
}

impl TextStage {
    pub fn new(data_type: ArtifactType) -> Self {
        Self { data_type }
    }
}

impl DecodeStage for TextStage {
    fn name(&self) -> &str {
        "text"
    }

    fn data_type(&self) -> ArtifactType {
        self.data_type
    }

    fn intermediate_type(&self) -> ArtifactType {
        ArtifactType::Text
    }

    fn output_type(&self) -> ArtifactType {
        ArtifactType::Text
    }

    fn decode(
        &self,
        data: &Data,
        _width: i32,
        _height: i32,
        _options: &Options,
    ) -> Result<Option<BoxedArtifact>, StageError> {
        if !data.data_type().is_assignable_to(self.data_type) {
            return Ok(None);
        }
        let bytes = data.read_bytes()?;
        if let Err(err) = std::str::from_utf8(&bytes) {
            return Err(StageError::format(self.name(), err.to_string()));
        }
        Ok(Some(Box::new(BytesArtifact::new(ArtifactType::Text, bytes))))
    }
}

// ============================================================================
// Transformations and encoding
// ============================================================================

/// Leaves the artifact untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnitTransformation;

impl Transformation for UnitTransformation {
    fn id(&self) -> TransformationId {
        TransformationId::new("stratacache/unit")
    }

    fn is_identity(&self) -> bool {
        true
    }

    fn transform(
        &self,
        artifact: BoxedArtifact,
        _width: i32,
        _height: i32,
    ) -> Result<BoxedArtifact, StageError> {
        Ok(artifact)
    }
}

/// Writes any [`BytesArtifact`] verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesEncoder;

impl ArtifactEncoder for BytesEncoder {
    fn encode_strategy(&self, _options: &Options) -> EncodeStrategy {
        EncodeStrategy::Transformed
    }

    fn encode(&self, artifact: &dyn Artifact, out: &mut dyn Write) -> io::Result<()> {
        let Some(bytes) = downcast_bytes(artifact) else {
            trace!(
                target_module = SOURCE,
                artifact_type = %artifact.artifact_type(),
                "Encoder received a non-bytes artifact"
            );
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot encode {} artifact as bytes", artifact.artifact_type()),
            ));
        };
        out.write_all(bytes.bytes())
    }
}

/// Sees through wrappers that expose their inner artifact via `as_any`.
fn downcast_bytes(artifact: &dyn Artifact) -> Option<&BytesArtifact> {
    let any: &dyn Any = artifact.as_any();
    any.downcast_ref::<BytesArtifact>()
}
