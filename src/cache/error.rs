//! Error taxonomy for the cache core.
//!
//! Per-attempt failures (`FetchError`, `StageError`) are collected as
//! [`Cause`]s and only surface once every candidate is exhausted, wrapped in a
//! single [`PipelineError`]. Construction and lifetime errors are returned
//! immediately and never aggregated.

use std::error::Error as StdError;
use std::fmt::{self, Write as _};
use std::io;
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use super::artifact::ArtifactType;
use super::keys::CacheKey;
use super::strategy::Provenance;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("required key field `{field}` is missing")]
    MissingField { field: &'static str },
    #[error("invalid {dimension} `{value}`: must be positive or ORIGINAL_SIZE")]
    InvalidDimension { dimension: &'static str, value: i32 },
    #[error(
        "decode pipeline for {data_type} -> {intermediate_type} -> {output_type} has no stages"
    )]
    EmptyDecodePipeline {
        data_type: ArtifactType,
        intermediate_type: ArtifactType,
        output_type: ArtifactType,
    },
}

impl BuildError {
    pub fn missing_field(field: &'static str) -> Self {
        Self::MissingField { field }
    }
}

/// Contract breaches on artifact lifetimes. Always a programming error.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LifetimeError {
    #[error("cannot acquire a recycled artifact")]
    AcquireAfterRecycle,
    #[error("cannot release an artifact that has not been acquired")]
    ReleaseWithoutAcquire,
    #[error("cannot recycle an artifact that is still acquired {acquired} time(s)")]
    RecycleWhileAcquired { acquired: usize },
    #[error("artifact has already been recycled")]
    AlreadyRecycled,
    #[error("cannot unlock an artifact that is not locked")]
    UnlockWhileUnlocked,
}

/// A single fetch attempt failed.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("i/o error while fetching `{target}`: {source}")]
    Io {
        target: String,
        #[source]
        source: io::Error,
    },
    #[error("nothing found at `{target}`")]
    NotFound { target: String },
    #[error("fetch cancelled")]
    Cancelled,
    #[error("fetch failed: {0}")]
    Other(String),
}

impl FetchError {
    pub fn io(target: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            target: target.into(),
            source,
        }
    }

    pub fn not_found(target: impl Into<String>) -> Self {
        Self::NotFound {
            target: target.into(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("no transformation registered for required type {artifact_type}")]
pub struct MissingTransformationError {
    pub artifact_type: ArtifactType,
}

/// A single decode stage failed.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("stage `{stage}` cannot handle the supplied data")]
    Unsupported { stage: String },
    #[error("stage `{stage}` could not decode: {message}")]
    Format { stage: String, message: String },
    #[error("transformation `{id}` failed: {message}")]
    Transform { id: String, message: String },
    #[error("encoding failed: {message}")]
    Encode { message: String },
    #[error(transparent)]
    MissingTransformation(#[from] MissingTransformationError),
    #[error("failed to read data: {0}")]
    Io(#[from] io::Error),
}

impl StageError {
    pub fn format(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Format {
            stage: stage.into(),
            message: message.into(),
        }
    }

    pub fn unsupported(stage: impl Into<String>) -> Self {
        Self::Unsupported {
            stage: stage.into(),
        }
    }
}

/// A non-aggregate failure plus the name of its type.
#[derive(Debug, Clone)]
pub struct LeafCause {
    kind: &'static str,
    error: Arc<dyn StdError + Send + Sync>,
}

impl LeafCause {
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.error.as_ref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.error.downcast_ref::<E>()
    }
}

/// A node in the cause tree.
#[derive(Debug, Clone)]
pub enum Cause {
    Leaf(LeafCause),
    Aggregate(PipelineError),
}

impl Cause {
    pub fn leaf<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        let full = std::any::type_name::<E>();
        let kind = full.rsplit("::").next().unwrap_or(full);
        Self::Leaf(LeafCause {
            kind,
            error: Arc::new(error),
        })
    }
}

impl From<PipelineError> for Cause {
    fn from(error: PipelineError) -> Self {
        Self::Aggregate(error)
    }
}

/// Where the failing attempt was reading from. Attached after construction
/// and not part of the error's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingContext {
    pub key: CacheKey,
    pub provenance: Provenance,
    pub data_type: ArtifactType,
}

/// Aggregate failure: every candidate was tried and none produced a result.
///
/// Rust errors carry no backtrace unless asked, and this type never asks;
/// each cause describes its own attempt.
#[derive(Debug, Clone)]
pub struct PipelineError {
    message: String,
    causes: Vec<Cause>,
    context: Option<LoggingContext>,
}

impl PipelineError {
    pub fn new(message: impl Into<String>, causes: Vec<Cause>) -> Self {
        Self {
            message: message.into(),
            causes,
            context: None,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn causes(&self) -> &[Cause] {
        &self.causes
    }

    pub fn context(&self) -> Option<&LoggingContext> {
        self.context.as_ref()
    }

    pub fn set_logging_context(
        &mut self,
        key: CacheKey,
        provenance: Provenance,
        data_type: ArtifactType,
    ) {
        self.context = Some(LoggingContext {
            key,
            provenance,
            data_type,
        });
    }

    /// Leaves of the cause tree in depth-first order.
    pub fn root_causes(&self) -> Vec<&LeafCause> {
        let mut roots = Vec::new();
        self.collect_roots(&mut roots);
        roots
    }

    fn collect_roots<'a>(&'a self, roots: &mut Vec<&'a LeafCause>) {
        for cause in &self.causes {
            match cause {
                Cause::Leaf(leaf) => roots.push(leaf),
                Cause::Aggregate(inner) => inner.collect_roots(roots),
            }
        }
    }

    /// Human readable tree of every cause, one `Cause (i of N): ` header per
    /// node, nested causes indented under their parent.
    pub fn formatted_trace(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = writeln!(out, "PipelineError: {self}");
        let _ = self.write_causes(&mut out, 1);
        out
    }

    fn write_causes(&self, out: &mut String, depth: usize) -> fmt::Result {
        let indent = "  ".repeat(depth);
        let total = self.causes.len();
        for (index, cause) in self.causes.iter().enumerate() {
            write!(out, "{indent}Cause ({} of {total}): ", index + 1)?;
            match cause {
                Cause::Leaf(leaf) => writeln!(out, "{}: {}", leaf.kind, leaf.error)?,
                Cause::Aggregate(inner) => {
                    writeln!(out, "PipelineError: {inner}")?;
                    inner.write_causes(out, depth + 1)?;
                }
            }
        }
        Ok(())
    }

    /// Emit one warning per root cause.
    pub fn log_root_causes(&self, target: &'static str) {
        let roots = self.root_causes();
        let total = roots.len();
        for (index, leaf) in roots.iter().enumerate() {
            warn!(
                target_module = target,
                cause_index = index + 1,
                cause_total = total,
                cause_kind = leaf.kind,
                error = %leaf.error,
                "Root cause"
            );
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if let Some(context) = &self.context {
            write!(
                f,
                ", {:?}, {}, {:?}",
                context.provenance, context.data_type, context.key
            )?;
        }
        if !self.causes.is_empty() {
            write!(f, " ({} causes)", self.causes.len())?;
        }
        Ok(())
    }
}

impl StdError for PipelineError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self.causes.first()? {
            Cause::Leaf(leaf) => Some(leaf.error.as_ref() as &(dyn StdError + 'static)),
            Cause::Aggregate(inner) => Some(inner as &(dyn StdError + 'static)),
        }
    }
}

/// Errors returned to callers of the engine.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Lifetime(#[from] LifetimeError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    MissingTransformation(#[from] MissingTransformationError),
    #[error("load cancelled")]
    Cancelled,
    #[error("engine is shut down")]
    EngineShutdown,
}
