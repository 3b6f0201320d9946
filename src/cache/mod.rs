//! Stratacache core
//!
//! Deduplicating, multi-tier artifact cache:
//!
//! - **Live tier**: artifacts currently held by callers
//! - **Memory tier**: released artifacts under a byte budget
//! - **Artifact tier**: transformed artifacts in a persistent store
//! - **Source tier**: raw source bytes in a persistent store
//!
//! Concurrent loads of one key share a single job; a job falls back through
//! every candidate key, loader and decode stage before failing with one
//! aggregated [`PipelineError`].
//!
//! ## Configuration
//!
//! Engine behavior is controlled via `stratacache.toml`:
//!
//! ```toml
//! [cache]
//! enable_memory_cache = true
//! memory_cache_bytes = 67108864
//! default_strategy = "automatic"
//! # ... see config.rs for all options
//! ```

mod artifact;
mod components;
mod config;
mod context;
mod decode;
mod deferred;
mod engine;
mod error;
mod fetch;
mod jobs;
mod keys;
mod lock;
mod recycler;
mod refcount;
mod registry;
mod store;
mod strategy;
mod tiers;

pub use artifact::{Artifact, ArtifactType, BoxedArtifact, BytesArtifact, Data, Model};
pub use components::{
    BytesEncoder, BytesFetcher, BytesResolver, FileFetcher, FileResolver, PassthroughStage,
    TextStage, UnitTransformation,
};
pub use config::CacheConfig;
pub use context::{LoadRequest, RequestContext};
pub use decode::{DecodePipeline, DecodeStage, StageCallback};
pub use deferred::{DeferredRecycleArtifact, DeferredRecyclePool};
pub use engine::{
    Engine, EngineBuilder, Executor, InlineExecutor, LoadTicket, PendingLoad, Task, TokioExecutor,
};
pub use error::{
    BuildError, CacheError, Cause, FetchError, LeafCause, LifetimeError, LoggingContext,
    MissingTransformationError, PipelineError, StageError,
};
pub use fetch::{
    ArtifactCacheFetchGenerator, CachedSourceFetchGenerator, DataFetcher, FetchCallback,
    FetchCancellation, FetchEvent, FetchGenerator, FetchState, SourceFetchGenerator,
};
pub use jobs::{JobRegistry, RegisteredJob};
pub(crate) use lock::mutex_lock;
pub use keys::{
    ArtifactCacheKey, CacheKey, DigestKey, ORIGINAL_SIZE, OptionKey, OptionValue, Options,
    PersistentKey, RequestKey, RequestKeyBuilder, SourceCacheKey, TransformationId,
};
pub use recycler::RecycleScheduler;
pub use refcount::{ArtifactHandle, RefCountedArtifact, ReleaseListener};
pub use registry::{
    ArtifactEncoder, ComponentRegistry, FetchPlan, Registry, SourceResolver, Transformation,
};
pub use store::{CachedFile, EntryWriter, MemoryStore, PersistentStore, SafeKeyGenerator};
pub use strategy::{EncodeStrategy, PersistenceStrategy, Provenance};
pub use tiers::{LiveResources, MemoryCache};
