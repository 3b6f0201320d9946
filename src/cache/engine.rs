//! Load orchestration.
//!
//! A load is answered from the live tier, then the memory tier, then by
//! joining an in-flight job for the same key, and only then by a new job. A
//! job walks the persistent artifact tier, the persistent source tier and the
//! origin in that order, decoding whatever each fetch returns until one
//! attempt produces an artifact.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, Weak};

use metrics::{counter, gauge};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::artifact::{BoxedArtifact, Data};
use super::config::CacheConfig;
use super::context::{LoadRequest, RequestContext};
use super::deferred::{DeferredRecycleArtifact, DeferredRecyclePool};
use super::error::{CacheError, Cause, PipelineError, StageError};
use super::fetch::{
    ArtifactCacheFetchGenerator, CachedSourceFetchGenerator, FetchCancellation, FetchEvent,
    FetchGenerator, SourceFetchGenerator,
};
use super::jobs::{JobRegistry, RegisteredJob};
use super::keys::{ArtifactCacheKey, CacheKey, PersistentKey, RequestKey, TransformationId};
use super::lock::mutex_lock;
use super::recycler::RecycleScheduler;
use super::refcount::{ArtifactHandle, RefCountedArtifact, ReleaseListener};
use super::registry::{ArtifactEncoder, ComponentRegistry};
use super::store::{MemoryStore, PersistentStore, SafeKeyGenerator};
use super::strategy::{EncodeStrategy, PersistenceStrategy, Provenance};
use super::tiers::{LiveResources, MemoryCache};

const SOURCE: &str = "cache::engine";

// ============================================================================
// Executors
// ============================================================================

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs off the caller's thread.
pub trait Executor: Send + Sync {
    fn submit(&self, task: Task);
}

/// Runs each job on the tokio blocking pool.
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    handle: Handle,
}

impl TokioExecutor {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Executor bound to the runtime the caller is running on.
    pub fn current() -> Result<Self, tokio::runtime::TryCurrentError> {
        Handle::try_current().map(Self::new)
    }
}

impl Executor for TokioExecutor {
    fn submit(&self, task: Task) {
        // Jobs report through their waiters; the join handle is not needed.
        drop(self.handle.spawn_blocking(task));
    }
}

/// Runs each job to completion inside `submit`.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn submit(&self, task: Task) {
        task();
    }
}

// ============================================================================
// Tickets
// ============================================================================

type JobResult = Result<ArtifactHandle, CacheError>;

/// Result of [`Engine::load`].
#[derive(Debug)]
pub enum LoadTicket {
    /// Served from the live or memory tier.
    Ready(ArtifactHandle),
    /// A job is producing the artifact.
    Pending(PendingLoad),
}

impl LoadTicket {
    pub async fn wait(self) -> Result<ArtifactHandle, CacheError> {
        match self {
            LoadTicket::Ready(handle) => Ok(handle),
            LoadTicket::Pending(pending) => pending.wait().await,
        }
    }

    /// Blocking variant of [`LoadTicket::wait`]. Must not be called from
    /// inside an async runtime.
    pub fn wait_blocking(self) -> Result<ArtifactHandle, CacheError> {
        match self {
            LoadTicket::Ready(handle) => Ok(handle),
            LoadTicket::Pending(pending) => pending.wait_blocking(),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, LoadTicket::Ready(_))
    }
}

/// A caller waiting on a job. Dropping it without waiting cancels the wait;
/// the job itself is cancelled once its last waiter is gone.
pub struct PendingLoad {
    engine: Arc<EngineInner>,
    job: Arc<EngineJob>,
    waiter: u64,
    receiver: Option<oneshot::Receiver<JobResult>>,
}

impl PendingLoad {
    pub fn job_id(&self) -> Uuid {
        self.job.id
    }

    pub async fn wait(mut self) -> Result<ArtifactHandle, CacheError> {
        let Some(receiver) = self.receiver.take() else {
            return Err(CacheError::Cancelled);
        };
        receiver.await.unwrap_or(Err(CacheError::Cancelled))
    }

    pub fn wait_blocking(mut self) -> Result<ArtifactHandle, CacheError> {
        let Some(receiver) = self.receiver.take() else {
            return Err(CacheError::Cancelled);
        };
        receiver.blocking_recv().unwrap_or(Err(CacheError::Cancelled))
    }

    /// Stop waiting.
    pub fn cancel(self) {}
}

impl Drop for PendingLoad {
    fn drop(&mut self) {
        // `receiver` is taken once the caller starts waiting; a dropped wait
        // future still counts as leaving.
        if self.job.unsubscribe(self.waiter) {
            debug!(
                target_module = SOURCE,
                job_id = %self.job.id,
                "Last waiter left, cancelling job"
            );
            self.job.cancellation.cancel();
            self.engine.jobs.remove_if_current(&self.job.key, &self.job);
        }
    }
}

impl fmt::Debug for PendingLoad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingLoad")
            .field("job_id", &self.job.id)
            .field("waiter", &self.waiter)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Jobs
// ============================================================================

#[derive(Default)]
struct Waiters {
    next_id: u64,
    pending: HashMap<u64, oneshot::Sender<JobResult>>,
    finished: bool,
    cancelled: bool,
}

struct EngineJob {
    id: Uuid,
    key: RequestKey,
    request: Arc<LoadRequest>,
    cancellation: Arc<FetchCancellation>,
    waiters: Mutex<Waiters>,
}

impl EngineJob {
    fn new(key: RequestKey, request: Arc<LoadRequest>) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            request,
            cancellation: FetchCancellation::new(),
            waiters: Mutex::new(Waiters::default()),
        }
    }

    /// Add a waiter. `None` once the job finished or was abandoned.
    fn subscribe(&self) -> Option<(u64, oneshot::Receiver<JobResult>)> {
        let mut waiters = mutex_lock(&self.waiters, SOURCE, "job.subscribe");
        if waiters.finished || waiters.cancelled {
            return None;
        }
        let id = waiters.next_id;
        waiters.next_id += 1;
        let (sender, receiver) = oneshot::channel();
        waiters.pending.insert(id, sender);
        Some((id, receiver))
    }

    /// Remove a waiter. True when it was the last one of an unfinished job,
    /// which is then marked abandoned.
    fn unsubscribe(&self, id: u64) -> bool {
        let mut waiters = mutex_lock(&self.waiters, SOURCE, "job.unsubscribe");
        if waiters.pending.remove(&id).is_none() || waiters.finished {
            return false;
        }
        if waiters.pending.is_empty() {
            waiters.cancelled = true;
            return true;
        }
        false
    }

    fn finish(&self) -> Vec<oneshot::Sender<JobResult>> {
        let mut waiters = mutex_lock(&self.waiters, SOURCE, "job.finish");
        waiters.finished = true;
        waiters.pending.drain().map(|(_, sender)| sender).collect()
    }
}

impl RegisteredJob for EngineJob {
    fn only_retrieve_from_cache(&self) -> bool {
        self.request.cache_only
    }
}

/// A transformed artifact waiting to be written to the artifact tier. The
/// deferred handle stays locked until the write is done.
struct PendingWrite {
    key: ArtifactCacheKey,
    encoder: Arc<dyn ArtifactEncoder>,
    locked: DeferredRecycleArtifact,
}

struct Produced {
    artifact: Arc<RefCountedArtifact>,
    provenance: Provenance,
    write: Option<PendingWrite>,
}

// ============================================================================
// Engine
// ============================================================================

/// Builds an [`Engine`].
pub struct EngineBuilder {
    registry: Arc<dyn ComponentRegistry>,
    config: CacheConfig,
    source_store: Option<Arc<dyn PersistentStore>>,
    artifact_store: Option<Arc<dyn PersistentStore>>,
    executor: Option<Arc<dyn Executor>>,
    key_names: Option<Arc<SafeKeyGenerator>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Use one store for both persistent tiers.
    pub fn store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.source_store = Some(store.clone());
        self.artifact_store = Some(store);
        self
    }

    pub fn source_store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.source_store = Some(store);
        self
    }

    pub fn artifact_store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.artifact_store = Some(store);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Share a key-encoding cache with stores built elsewhere.
    pub fn key_names(mut self, names: Arc<SafeKeyGenerator>) -> Self {
        self.key_names = Some(names);
        self
    }

    /// Fails only when the recycle thread cannot be spawned.
    pub fn build(self) -> io::Result<Engine> {
        let names = self.key_names.unwrap_or_else(|| {
            Arc::new(SafeKeyGenerator::new(
                self.config.key_encoding_capacity_non_zero(),
            ))
        });
        let fallback: Arc<dyn PersistentStore> = Arc::new(MemoryStore::new(names));
        let source_store = self.source_store.unwrap_or_else(|| fallback.clone());
        let artifact_store = self.artifact_store.unwrap_or(fallback);
        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(InlineExecutor) as Arc<dyn Executor>);
        let memory = self
            .config
            .enable_memory_cache
            .then(|| MemoryCache::new(self.config.memory_cache_bytes_non_zero().get()));
        let recycler = RecycleScheduler::new()?;
        let deferred = DeferredRecyclePool::new(self.config.deferred_pool_capacity);
        let default_strategy = self.config.default_strategy;
        let registry = self.registry;

        let inner = Arc::new_cyclic(|weak| EngineInner {
            registry,
            source_store,
            artifact_store,
            jobs: JobRegistry::new(),
            live: LiveResources::new(),
            memory,
            recycler,
            deferred,
            executor,
            default_strategy,
            shut_down: AtomicBool::new(false),
            this: weak.clone(),
        });

        info!(
            target_module = SOURCE,
            memory_cache = inner.memory.is_some(),
            default_strategy = %default_strategy,
            "Engine ready"
        );
        Ok(Engine { inner })
    }
}

/// Deduplicating multi-tier artifact loader.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder(registry: Arc<dyn ComponentRegistry>) -> EngineBuilder {
        EngineBuilder {
            registry,
            config: CacheConfig::default(),
            source_store: None,
            artifact_store: None,
            executor: None,
            key_names: None,
        }
    }

    /// Start or join a load for `request`.
    pub fn load(&self, request: LoadRequest) -> Result<LoadTicket, CacheError> {
        let inner = &self.inner;
        if inner.shut_down.load(Ordering::SeqCst) {
            return Err(CacheError::EngineShutdown);
        }

        let key = request.request_key()?;
        if request.memory_cacheable
            && let Some(handle) = inner.acquire_cached(&key)?
        {
            return Ok(LoadTicket::Ready(handle));
        }

        let request = Arc::new(request);
        loop {
            let (job, created) = inner.jobs.get_or_register(&key, request.cache_only, || {
                Arc::new(EngineJob::new(key.clone(), request.clone()))
            });

            let Some((waiter, receiver)) = job.subscribe() else {
                // Finished or abandoned but not yet deregistered.
                inner.jobs.remove_if_current(&key, &job);
                if request.memory_cacheable
                    && let Some(handle) = inner.live.acquire(&key)
                {
                    return Ok(LoadTicket::Ready(handle));
                }
                continue;
            };

            let pending = PendingLoad {
                engine: inner.clone(),
                job: job.clone(),
                waiter,
                receiver: Some(receiver),
            };

            if created {
                counter!("stratacache_job_started_total").increment(1);
                let runner = inner.clone();
                inner
                    .executor
                    .submit(Box::new(move || runner.run_job(&job)));
            } else {
                counter!("stratacache_job_joined_total").increment(1);
                debug!(target_module = SOURCE, job_id = %job.id, "Joined in-flight job");
            }
            return Ok(LoadTicket::Pending(pending));
        }
    }

    /// Recycle everything held by the memory tier.
    pub fn clear_memory(&self) {
        self.inner.clear_memory();
    }

    /// Stop accepting loads, empty the memory tier and drain pending
    /// recycles.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.clear_memory();
        self.inner.recycler.flush();
        self.inner.recycler.shutdown();
        info!(target_module = SOURCE, "Engine shut down");
    }

    pub fn live_len(&self) -> usize {
        self.inner.live.len()
    }

    pub fn memory_len(&self) -> usize {
        self.inner.memory.as_ref().map_or(0, MemoryCache::len)
    }

    pub fn memory_bytes(&self) -> usize {
        self.inner
            .memory
            .as_ref()
            .map_or(0, MemoryCache::used_bytes)
    }

    pub fn active_jobs(&self) -> usize {
        self.inner.jobs.len()
    }

    /// Block until deferred recycles queued so far have run.
    pub fn flush_recycles(&self) {
        self.inner.recycler.flush();
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("live", &self.inner.live)
            .field("memory", &self.inner.memory)
            .field("jobs", &self.inner.jobs)
            .field("default_strategy", &self.inner.default_strategy)
            .finish_non_exhaustive()
    }
}

struct EngineInner {
    registry: Arc<dyn ComponentRegistry>,
    source_store: Arc<dyn PersistentStore>,
    artifact_store: Arc<dyn PersistentStore>,
    jobs: JobRegistry<EngineJob>,
    live: LiveResources,
    memory: Option<MemoryCache>,
    recycler: Arc<RecycleScheduler>,
    deferred: Arc<DeferredRecyclePool>,
    executor: Arc<dyn Executor>,
    default_strategy: PersistenceStrategy,
    shut_down: AtomicBool,
    this: Weak<EngineInner>,
}

impl EngineInner {
    fn acquire_cached(&self, key: &RequestKey) -> Result<Option<ArtifactHandle>, CacheError> {
        if let Some(handle) = self.live.acquire(key) {
            return Ok(Some(handle));
        }
        let Some(memory) = &self.memory else {
            return Ok(None);
        };
        let Some(handle) = memory.acquire(key)? else {
            return Ok(None);
        };
        self.live.insert(key.clone(), handle.shared());
        Ok(Some(handle))
    }

    fn clear_memory(&self) {
        let Some(memory) = &self.memory else {
            return;
        };
        for artifact in memory.clear() {
            self.recycle(artifact, false);
        }
    }

    fn recycle(&self, artifact: Arc<RefCountedArtifact>, force_deferred: bool) {
        if let Err(err) = self.recycler.recycle(artifact, force_deferred) {
            warn!(target_module = SOURCE, error = %err, "Failed to recycle artifact");
        }
    }

    #[instrument(skip_all, fields(job_id = %job.id))]
    fn run_job(&self, job: &Arc<EngineJob>) {
        gauge!("stratacache_active_jobs").increment(1.0);
        let outcome = self.execute(job);
        self.complete(job, outcome);
        gauge!("stratacache_active_jobs").decrement(1.0);
    }

    fn execute(&self, job: &EngineJob) -> Result<Produced, CacheError> {
        let request = &job.request;
        let strategy = request.strategy.unwrap_or(self.default_strategy);
        let context = RequestContext::new(
            request.clone(),
            job.key.clone(),
            strategy,
            self.registry.clone(),
        );
        let (events, received) = std_mpsc::channel();
        let cancellation = job.cancellation.clone();
        cancellation.notify(events.clone());

        let mut generators: Vec<Box<dyn FetchGenerator + '_>> = Vec::new();
        if strategy.should_read_artifact_cache() {
            generators.push(Box::new(ArtifactCacheFetchGenerator::new(
                &context,
                self.artifact_store.clone(),
                events.clone(),
                cancellation.clone(),
            )));
        }
        if strategy.should_read_source_cache() {
            generators.push(Box::new(CachedSourceFetchGenerator::new(
                &context,
                self.source_store.clone(),
                events.clone(),
                cancellation.clone(),
            )));
        }
        if !request.cache_only {
            generators.push(Box::new(SourceFetchGenerator::new(
                &context,
                events.clone(),
                cancellation.clone(),
            )));
        }

        let mut causes = Vec::new();
        let mut last_attempt = None;
        for generator in &mut generators {
            while generator.start_next() {
                let Ok(event) = received.recv() else {
                    return Err(CacheError::Cancelled);
                };
                match event {
                    FetchEvent::Cancelled => return Err(CacheError::Cancelled),
                    FetchEvent::Failed {
                        attempted_key,
                        error,
                        fetcher,
                        provenance,
                    } => {
                        fetcher.cleanup();
                        debug!(
                            target_module = SOURCE,
                            provenance = ?provenance,
                            error = %error,
                            "Fetch attempt failed"
                        );
                        last_attempt = Some((attempted_key, provenance, fetcher.data_type()));
                        causes.push(Cause::leaf(error));
                    }
                    FetchEvent::Ready {
                        source_key,
                        data,
                        fetcher,
                        provenance,
                        ..
                    } => {
                        let outcome = self.decode_fetched(&context, &source_key, &data, provenance);
                        fetcher.cleanup();
                        match outcome {
                            Ok(produced) => return Ok(produced),
                            Err(err) => {
                                last_attempt = Some((source_key, provenance, data.data_type()));
                                causes.push(Cause::from(err));
                            }
                        }
                    }
                }
            }
        }

        if cancellation.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        let mut err = PipelineError::new(
            format!("Failed to load {:?}", job.key.model()),
            causes,
        );
        if let Some((key, provenance, data_type)) = last_attempt {
            err.set_logging_context(key, provenance, data_type);
        }
        warn!(target_module = SOURCE, error = %err, "Load failed");
        err.log_root_causes(SOURCE);
        Err(err.into())
    }

    fn decode_fetched(
        &self,
        context: &RequestContext,
        source_key: &CacheKey,
        data: &Data,
        provenance: Provenance,
    ) -> Result<Produced, PipelineError> {
        let request = context.request();
        let strategy = context.strategy();
        let data_type = data.data_type();

        let Some(pipeline) = context.candidate_decode_stages(data_type) else {
            let mut err = PipelineError::new(
                format!("No decode path for {data_type}"),
                vec![Cause::leaf(StageError::unsupported(data_type.to_string()))],
            );
            err.set_logging_context(source_key.clone(), provenance, data_type);
            return Err(err);
        };

        let from_artifact_tier = provenance == Provenance::ArtifactDiskCache;
        if !from_artifact_tier && strategy.should_cache_source(provenance) {
            let key = PersistentKey::from(context.source_cache_key(source_key));
            let written = self
                .source_store
                .put(&key, &mut |out: &mut dyn Write| write_data(data, out));
            if written {
                counter!("stratacache_persistent_write_total", "tier" => "source").increment(1);
            }
        }

        // Id of the transformation applied to the artifact that is returned;
        // the artifact key written below records exactly this.
        let mut applied: Option<TransformationId> = None;
        let mut transform = |artifact: BoxedArtifact| -> Result<BoxedArtifact, StageError> {
            if from_artifact_tier {
                return Ok(artifact);
            }
            let transformation = context.resolve_transformation(artifact.artifact_type())?;
            applied = (!transformation.is_identity()).then(|| transformation.id());
            transformation.transform(artifact, request.width, request.height)
        };
        let artifact = pipeline
            .decode(data, &request.options, request.width, request.height, &mut transform)
            .map_err(|mut err| {
                err.set_logging_context(source_key.clone(), provenance, data_type);
                err
            })?;

        let encoder = if from_artifact_tier {
            None
        } else {
            self.registry.artifact_encoder(artifact.as_ref())
        };
        let encode_strategy = encoder
            .as_ref()
            .map_or(EncodeStrategy::None, |encoder| {
                encoder.encode_strategy(&request.options)
            });
        let write_artifact = encoder.is_some()
            && strategy.should_cache_artifact(
                context.is_alternate_key(source_key),
                provenance,
                encode_strategy,
            );

        let listener: Weak<dyn ReleaseListener> = self.this.clone();
        let (stored, write) = match encoder.filter(|_| write_artifact) {
            Some(encoder) => {
                let locked = self.deferred.obtain(artifact);
                let write = PendingWrite {
                    key: context.artifact_cache_key(source_key, applied),
                    encoder,
                    locked: locked.clone(),
                };
                (Box::new(locked) as BoxedArtifact, Some(write))
            }
            None => (artifact, None),
        };

        let shared = Arc::new(RefCountedArtifact::new(
            stored,
            context.key().clone(),
            request.memory_cacheable,
            true,
            Some(listener),
        ));
        Ok(Produced {
            artifact: shared,
            provenance,
            write,
        })
    }

    fn complete(&self, job: &Arc<EngineJob>, outcome: Result<Produced, CacheError>) {
        let produced = match outcome {
            Ok(produced) => produced,
            Err(err) => {
                if !matches!(err, CacheError::Cancelled) {
                    counter!("stratacache_job_failed_total").increment(1);
                }
                self.jobs.remove_if_current(&job.key, job);
                for waiter in job.finish() {
                    let _ = waiter.send(Err(err.clone()));
                }
                return;
            }
        };

        // The job holds its own acquisition while fanning out so the
        // artifact cannot be released to zero before every waiter has one.
        let hold = match ArtifactHandle::acquire(produced.artifact.clone(), produced.provenance) {
            Ok(hold) => hold,
            Err(err) => {
                warn!(target_module = SOURCE, error = %err, "Produced artifact unusable");
                self.jobs.remove_if_current(&job.key, job);
                for waiter in job.finish() {
                    let _ = waiter.send(Err(err.into()));
                }
                return;
            }
        };

        if produced.artifact.is_memory_cacheable() {
            self.live.insert(job.key.clone(), &produced.artifact);
        }
        self.jobs.remove_if_current(&job.key, job);

        let waiters = job.finish();
        debug!(
            target_module = SOURCE,
            waiters = waiters.len(),
            provenance = ?produced.provenance,
            "Job complete"
        );
        for waiter in waiters {
            let result = hold.try_clone().map_err(CacheError::from);
            // A waiter that left meanwhile drops its handle right here.
            let _ = waiter.send(result);
        }

        if let Some(write) = produced.write {
            self.write_artifact(write);
        }
        drop(hold);
    }

    fn write_artifact(&self, write: PendingWrite) {
        let PendingWrite {
            key,
            encoder,
            locked,
        } = write;
        let written = self
            .artifact_store
            .put(&PersistentKey::from(key), &mut |out: &mut dyn Write| {
                encoder.encode(&locked, out)
            });
        if written {
            counter!("stratacache_persistent_write_total", "tier" => "artifact").increment(1);
        }
        if let Err(err) = locked.unlock() {
            warn!(target_module = SOURCE, error = %err, "Failed to unlock written artifact");
        }
    }
}

impl ReleaseListener for EngineInner {
    fn on_released(&self, key: &RequestKey, artifact: &Arc<RefCountedArtifact>) {
        if !artifact.is_memory_cacheable() {
            self.recycle(artifact.clone(), false);
            return;
        }
        if !self.live.retire(key, artifact) {
            return;
        }

        match &self.memory {
            Some(memory) if !self.shut_down.load(Ordering::SeqCst) => {
                for evicted in memory.put(key.clone(), artifact.clone()) {
                    self.recycle(evicted, true);
                }
            }
            _ => self.recycle(artifact.clone(), false),
        }
    }
}

fn write_data(data: &Data, out: &mut dyn Write) -> io::Result<()> {
    match data {
        Data::Bytes { bytes, .. } => out.write_all(bytes),
        Data::File(path) => {
            let mut file = File::open(path)?;
            io::copy(&mut file, out).map(|_| ())
        }
    }
}
