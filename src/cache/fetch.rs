//! Resumable enumeration of fetch attempts.
//!
//! A generator walks its candidates lazily. `start_next` starts at most one
//! fetch and returns; the outcome arrives later as a [`FetchEvent`] on the
//! channel the generator was built with. The owner decides whether to call
//! `start_next` again after a failure or a decode error.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use super::artifact::{ArtifactType, Data};
use super::context::RequestContext;
use super::error::FetchError;
use super::keys::{CacheKey, PersistentKey};
use super::lock::mutex_lock;
use super::registry::SourceResolver;
use super::store::{CachedFile, PersistentStore};
use super::strategy::Provenance;

const SOURCE: &str = "cache::fetch";

pub type FetchCallback = Box<dyn FnOnce(Result<Data, FetchError>) + Send>;

/// Produces raw data asynchronously. `load_data` must invoke the callback
/// exactly once, possibly before returning.
pub trait DataFetcher: Send + Sync {
    fn load_data(&self, callback: FetchCallback);

    /// Best effort; a cancelled fetch still reports through its callback.
    fn cancel(&self) {}

    /// Release anything held for the data once it has been consumed.
    fn cleanup(&self) {}

    fn data_type(&self) -> ArtifactType;

    fn provenance(&self) -> Provenance;
}

/// Message on a job's event channel: the outcome of one fetch attempt, or
/// notice that the job was cancelled.
pub enum FetchEvent {
    Ready {
        source_key: CacheKey,
        data: Data,
        fetcher: Arc<dyn DataFetcher>,
        provenance: Provenance,
        attempted_key: CacheKey,
    },
    Failed {
        attempted_key: CacheKey,
        error: FetchError,
        fetcher: Arc<dyn DataFetcher>,
        provenance: Provenance,
    },
    Cancelled,
}

impl fmt::Debug for FetchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchEvent::Ready {
                source_key,
                provenance,
                data,
                ..
            } => f
                .debug_struct("Ready")
                .field("source_key", source_key)
                .field("data_type", &data.data_type())
                .field("provenance", provenance)
                .finish_non_exhaustive(),
            FetchEvent::Failed {
                attempted_key,
                error,
                provenance,
                ..
            } => f
                .debug_struct("Failed")
                .field("attempted_key", attempted_key)
                .field("error", error)
                .field("provenance", provenance)
                .finish_non_exhaustive(),
            FetchEvent::Cancelled => f.write_str("Cancelled"),
        }
    }
}

/// Cancellation shared by every generator of one job.
///
/// `cancel` takes short locks to find the outstanding fetcher and to wake the
/// job; it never waits for a generator to finish advancing.
#[derive(Default)]
pub struct FetchCancellation {
    cancelled: AtomicBool,
    current: Mutex<Option<Arc<dyn DataFetcher>>>,
    waiting: Mutex<Option<Sender<FetchEvent>>>,
}

impl FetchCancellation {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let current = mutex_lock(&self.current, SOURCE, "cancel").take();
        if let Some(fetcher) = current {
            fetcher.cancel();
        }
        if let Some(events) = mutex_lock(&self.waiting, SOURCE, "cancel").as_ref() {
            let _ = events.send(FetchEvent::Cancelled);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Deliver [`FetchEvent::Cancelled`] on `events` when the job is
    /// cancelled, immediately if it already was.
    pub fn notify(&self, events: Sender<FetchEvent>) {
        let mut waiting = mutex_lock(&self.waiting, SOURCE, "notify");
        if self.is_cancelled() {
            let _ = events.send(FetchEvent::Cancelled);
        }
        *waiting = Some(events);
    }

    fn begin(&self, fetcher: &Arc<dyn DataFetcher>) {
        *mutex_lock(&self.current, SOURCE, "begin") = Some(fetcher.clone());
        // A cancel that raced with `begin` saw no fetcher; forward it now.
        if self.is_cancelled() {
            fetcher.cancel();
        }
    }

    fn finish(&self, fetcher: &Arc<dyn DataFetcher>) {
        let mut current = mutex_lock(&self.current, SOURCE, "finish");
        if current
            .as_ref()
            .is_some_and(|outstanding| Arc::ptr_eq(outstanding, fetcher))
        {
            *current = None;
        }
    }
}

impl fmt::Debug for FetchCancellation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchCancellation")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Where a generator is in its walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    AdvancingKey,
    ResolvingLoader,
    Fetching,
    Exhausted,
}

pub trait FetchGenerator {
    /// Start the next viable fetch. `false` once every candidate is used up
    /// or the job was cancelled.
    fn start_next(&mut self) -> bool;

    /// Forward cancellation to the outstanding fetch, if any.
    fn cancel(&self);

    fn state(&self) -> FetchState;
}

fn start_fetch(
    fetcher: Arc<dyn DataFetcher>,
    key: CacheKey,
    provenance: Provenance,
    events: &Sender<FetchEvent>,
    cancellation: &Arc<FetchCancellation>,
) {
    cancellation.begin(&fetcher);
    let events = events.clone();
    let cancellation = cancellation.clone();
    let reported = fetcher.clone();
    fetcher.load_data(Box::new(move |result| {
        cancellation.finish(&reported);
        let event = match result {
            Ok(data) => FetchEvent::Ready {
                source_key: key.clone(),
                data,
                fetcher: reported,
                provenance,
                attempted_key: key,
            },
            Err(error) => FetchEvent::Failed {
                attempted_key: key,
                error,
                fetcher: reported,
                provenance,
            },
        };
        if events.send(event).is_err() {
            trace!(target_module = SOURCE, "Fetch finished after its job went away");
        }
    }));
}

// ============================================================================
// Persistent tier walk
// ============================================================================

/// Walks candidate keys × derived store keys × loaders for the file cached
/// under each derived key.
struct CachedTierCursor<'a> {
    context: &'a RequestContext,
    store: Arc<dyn PersistentStore>,
    provenance: Provenance,
    derive: fn(&RequestContext, &CacheKey) -> Vec<PersistentKey>,
    events: Sender<FetchEvent>,
    cancellation: Arc<FetchCancellation>,
    key_index: usize,
    derived: VecDeque<PersistentKey>,
    current: Option<(CacheKey, CachedFile)>,
    loaders: Vec<Arc<dyn SourceResolver>>,
    loader_index: usize,
    state: FetchState,
}

impl<'a> CachedTierCursor<'a> {
    fn new(
        context: &'a RequestContext,
        store: Arc<dyn PersistentStore>,
        provenance: Provenance,
        derive: fn(&RequestContext, &CacheKey) -> Vec<PersistentKey>,
        events: Sender<FetchEvent>,
        cancellation: Arc<FetchCancellation>,
    ) -> Self {
        Self {
            context,
            store,
            provenance,
            derive,
            events,
            cancellation,
            key_index: 0,
            derived: VecDeque::new(),
            current: None,
            loaders: Vec::new(),
            loader_index: 0,
            state: FetchState::AdvancingKey,
        }
    }

    fn start_next(&mut self) -> bool {
        loop {
            if self.cancellation.is_cancelled() {
                self.state = FetchState::Exhausted;
                return false;
            }

            if let Some((source_key, file)) = &self.current {
                self.state = FetchState::ResolvingLoader;
                while let Some(loader) = self.loaders.get(self.loader_index).cloned() {
                    self.loader_index += 1;
                    let request = self.context.request();
                    let Some(plan) = loader.build_fetch(
                        &file.to_model(),
                        request.width,
                        request.height,
                        &request.options,
                    ) else {
                        continue;
                    };
                    if !self.context.has_decode_pipeline(plan.fetcher.data_type()) {
                        trace!(
                            target_module = SOURCE,
                            loader = loader.name(),
                            data_type = %plan.fetcher.data_type(),
                            "Skipping loader without a decode path"
                        );
                        continue;
                    }

                    self.state = FetchState::Fetching;
                    start_fetch(
                        plan.fetcher,
                        source_key.clone(),
                        self.provenance,
                        &self.events,
                        &self.cancellation,
                    );
                    return true;
                }
            }

            self.state = FetchState::AdvancingKey;
            self.current = None;
            if self.derived.is_empty() {
                let Some(candidate) = self.context.candidate_source_keys().get(self.key_index)
                else {
                    self.state = FetchState::Exhausted;
                    return false;
                };
                self.key_index += 1;
                self.derived = (self.derive)(self.context, candidate).into();
            }
            let Some(persistent_key) = self.derived.pop_front() else {
                continue;
            };
            // Derived keys all belong to the most recent candidate.
            let candidate = &self.context.candidate_source_keys()[self.key_index - 1];

            match self.store.get(&persistent_key) {
                Some(file) => {
                    debug!(
                        target_module = SOURCE,
                        provenance = ?self.provenance,
                        source_key = ?candidate,
                        "Found cached entry"
                    );
                    self.loaders = self.context.registry().resolvers_for_cached_file(&file);
                    self.loader_index = 0;
                    self.current = Some((candidate.clone(), file));
                }
                None => self.loaders.clear(),
            }
        }
    }
}

fn derive_source_key(context: &RequestContext, key: &CacheKey) -> Vec<PersistentKey> {
    vec![context.source_cache_key(key).into()]
}

fn derive_artifact_key(context: &RequestContext, key: &CacheKey) -> Vec<PersistentKey> {
    context
        .artifact_cache_keys(key)
        .into_iter()
        .map(PersistentKey::from)
        .collect()
}

/// Reads raw source bytes back from the persistent source tier.
///
/// Successful fetches report provenance [`Provenance::SourceDiskCache`] and
/// the candidate key the entry was found under.
pub struct CachedSourceFetchGenerator<'a> {
    cursor: CachedTierCursor<'a>,
}

impl<'a> CachedSourceFetchGenerator<'a> {
    pub fn new(
        context: &'a RequestContext,
        store: Arc<dyn PersistentStore>,
        events: Sender<FetchEvent>,
        cancellation: Arc<FetchCancellation>,
    ) -> Self {
        Self {
            cursor: CachedTierCursor::new(
                context,
                store,
                Provenance::SourceDiskCache,
                derive_source_key,
                events,
                cancellation,
            ),
        }
    }
}

impl FetchGenerator for CachedSourceFetchGenerator<'_> {
    fn start_next(&mut self) -> bool {
        self.cursor.start_next()
    }

    fn cancel(&self) {
        self.cursor.cancellation.cancel();
    }

    fn state(&self) -> FetchState {
        self.cursor.state
    }
}

/// Reads transformed artifacts back from the persistent artifact tier.
pub struct ArtifactCacheFetchGenerator<'a> {
    cursor: CachedTierCursor<'a>,
}

impl<'a> ArtifactCacheFetchGenerator<'a> {
    pub fn new(
        context: &'a RequestContext,
        store: Arc<dyn PersistentStore>,
        events: Sender<FetchEvent>,
        cancellation: Arc<FetchCancellation>,
    ) -> Self {
        Self {
            cursor: CachedTierCursor::new(
                context,
                store,
                Provenance::ArtifactDiskCache,
                derive_artifact_key,
                events,
                cancellation,
            ),
        }
    }
}

impl FetchGenerator for ArtifactCacheFetchGenerator<'_> {
    fn start_next(&mut self) -> bool {
        self.cursor.start_next()
    }

    fn cancel(&self) {
        self.cursor.cancellation.cancel();
    }

    fn state(&self) -> FetchState {
        self.cursor.state
    }
}

// ============================================================================
// Origin walk
// ============================================================================

/// Fetches from the origin through the request's own fetch plans.
pub struct SourceFetchGenerator<'a> {
    context: &'a RequestContext,
    events: Sender<FetchEvent>,
    cancellation: Arc<FetchCancellation>,
    plan_index: usize,
    state: FetchState,
}

impl<'a> SourceFetchGenerator<'a> {
    pub fn new(
        context: &'a RequestContext,
        events: Sender<FetchEvent>,
        cancellation: Arc<FetchCancellation>,
    ) -> Self {
        Self {
            context,
            events,
            cancellation,
            plan_index: 0,
            state: FetchState::AdvancingKey,
        }
    }
}

impl FetchGenerator for SourceFetchGenerator<'_> {
    fn start_next(&mut self) -> bool {
        let plans = self.context.fetch_plans();
        while let Some(plan) = plans.get(self.plan_index) {
            self.plan_index += 1;
            if self.cancellation.is_cancelled() {
                break;
            }
            self.state = FetchState::ResolvingLoader;
            let data_type = plan.fetcher.data_type();
            if !self.context.has_decode_pipeline(data_type) {
                continue;
            }

            self.state = FetchState::Fetching;
            start_fetch(
                plan.fetcher.clone(),
                plan.source_key.clone(),
                plan.fetcher.provenance(),
                &self.events,
                &self.cancellation,
            );
            return true;
        }
        self.state = FetchState::Exhausted;
        false
    }

    fn cancel(&self) {
        self.cancellation.cancel();
    }

    fn state(&self) -> FetchState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::num::NonZeroUsize;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    use super::*;
    use crate::cache::artifact::Model;
    use crate::cache::components::{BytesResolver, PassthroughStage};
    use crate::cache::context::LoadRequest;
    use crate::cache::keys::{Options, SourceCacheKey};
    use crate::cache::registry::{FetchPlan, Registry};
    use crate::cache::store::{MemoryStore, SafeKeyGenerator};
    use crate::cache::strategy::PersistenceStrategy;

    /// Remote fetcher that never completes on its own.
    #[derive(Default)]
    struct Hanging {
        loads: AtomicUsize,
        cancels: AtomicUsize,
    }

    impl DataFetcher for Hanging {
        fn load_data(&self, _callback: FetchCallback) {
            self.loads.fetch_add(1, Ordering::SeqCst);
        }

        fn cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }

        fn data_type(&self) -> ArtifactType {
            ArtifactType::Bytes
        }

        fn provenance(&self) -> Provenance {
            Provenance::Remote
        }
    }

    /// Resolves `Model::Uri` to two candidate keys served by one fetcher.
    struct UriResolver {
        fetcher: Arc<Hanging>,
    }

    impl SourceResolver for UriResolver {
        fn name(&self) -> &str {
            "uri"
        }

        fn handles(&self, model: &Model) -> bool {
            matches!(model, Model::Uri(_))
        }

        fn build_fetch(
            &self,
            model: &Model,
            _width: i32,
            _height: i32,
            _options: &Options,
        ) -> Option<FetchPlan> {
            Some(FetchPlan {
                source_key: model.cache_key(),
                alternate_keys: vec![CacheKey::Object("mirror".to_string())],
                fetcher: self.fetcher.clone(),
            })
        }
    }

    struct Fixture {
        context: RequestContext,
        store: Arc<MemoryStore>,
        origin: Arc<Hanging>,
    }

    fn fixture(with_decoder: bool) -> Fixture {
        let origin = Arc::new(Hanging::default());
        let mut registry = Registry::new();
        registry
            .append_resolver(Arc::new(UriResolver {
                fetcher: origin.clone(),
            }))
            .append_resolver(Arc::new(BytesResolver));
        if with_decoder {
            registry.append_stage(Arc::new(PassthroughStage::new(ArtifactType::Bytes)));
        }

        let request = LoadRequest::new(Model::Uri("https://example.com/a".to_string()));
        let key = request.request_key().expect("key");
        let context = RequestContext::new(
            Arc::new(request),
            key,
            PersistenceStrategy::All,
            Arc::new(registry),
        );
        let names = Arc::new(SafeKeyGenerator::new(NonZeroUsize::new(16).expect("capacity")));
        Fixture {
            context,
            store: Arc::new(MemoryStore::new(names)),
            origin,
        }
    }

    fn seed(store: &MemoryStore, key: &str, payload: &'static [u8]) {
        let key = SourceCacheKey::new(CacheKey::Object(key.to_string()), CacheKey::Empty);
        assert!(store.put(&key.into(), &mut |out: &mut dyn Write| out.write_all(payload)));
    }

    #[test]
    fn exhausts_without_fetching_when_nothing_is_cached() {
        let fixture = fixture(true);
        let (events, received) = mpsc::channel();
        let mut generator = CachedSourceFetchGenerator::new(
            &fixture.context,
            fixture.store.clone(),
            events,
            FetchCancellation::new(),
        );

        assert_eq!(fixture.context.candidate_source_keys().len(), 2);
        assert!(!generator.start_next());
        assert_eq!(generator.state(), FetchState::Exhausted);
        assert!(received.try_recv().is_err());
        assert_eq!(fixture.origin.loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reads_the_entry_cached_under_an_alternate_key() {
        let fixture = fixture(true);
        seed(&fixture.store, "mirror", b"cached");
        let (events, received) = mpsc::channel();
        let mut generator = CachedSourceFetchGenerator::new(
            &fixture.context,
            fixture.store.clone(),
            events,
            FetchCancellation::new(),
        );

        assert!(generator.start_next());
        match received.try_recv().expect("bytes fetch completes inline") {
            FetchEvent::Ready {
                source_key,
                data,
                provenance,
                attempted_key,
                ..
            } => {
                assert_eq!(source_key, CacheKey::Object("mirror".to_string()));
                assert_eq!(attempted_key, source_key);
                assert_eq!(provenance, Provenance::SourceDiskCache);
                assert_eq!(data.read_bytes().expect("bytes").as_ref(), b"cached");
            }
            other => panic!("unexpected event {other:?}"),
        }

        assert!(!generator.start_next());
        assert_eq!(fixture.origin.loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn loaders_without_a_decode_path_are_skipped() {
        let fixture = fixture(false);
        seed(&fixture.store, "https://example.com/a", b"cached");
        let (events, received) = mpsc::channel();
        let mut generator = CachedSourceFetchGenerator::new(
            &fixture.context,
            fixture.store.clone(),
            events,
            FetchCancellation::new(),
        );

        assert!(!generator.start_next());
        assert!(received.try_recv().is_err());
    }

    #[test]
    fn cancelled_job_starts_no_fetch() {
        let fixture = fixture(true);
        let (events, _received) = mpsc::channel();
        let cancellation = FetchCancellation::new();
        let mut generator = SourceFetchGenerator::new(&fixture.context, events, cancellation.clone());

        generator.cancel();
        assert_eq!(fixture.origin.cancels.load(Ordering::SeqCst), 0);
        assert!(!generator.start_next());
        assert_eq!(fixture.origin.loads.load(Ordering::SeqCst), 0);
    }

    /// Completes inside `load_data`.
    #[derive(Default)]
    struct Immediate {
        cancels: AtomicUsize,
    }

    impl DataFetcher for Immediate {
        fn load_data(&self, callback: FetchCallback) {
            callback(Ok(Data::bytes(bytes::Bytes::from_static(b"done"))));
        }

        fn cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }

        fn data_type(&self) -> ArtifactType {
            ArtifactType::Bytes
        }

        fn provenance(&self) -> Provenance {
            Provenance::Local
        }
    }

    #[test]
    fn cancel_after_completion_is_not_forwarded() {
        let (events, received) = mpsc::channel();
        let cancellation = FetchCancellation::new();
        let fetcher = Arc::new(Immediate::default());

        start_fetch(
            fetcher.clone(),
            CacheKey::Object("a".to_string()),
            Provenance::Local,
            &events,
            &cancellation,
        );
        assert!(matches!(received.try_recv(), Ok(FetchEvent::Ready { .. })));

        cancellation.cancel();
        assert_eq!(fetcher.cancels.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_wakes_the_waiting_job() {
        let (events, received) = mpsc::channel();
        let cancellation = FetchCancellation::new();
        cancellation.notify(events);
        assert!(received.try_recv().is_err());

        let remote = {
            let cancellation = cancellation.clone();
            std::thread::spawn(move || cancellation.cancel())
        };
        assert!(matches!(received.recv(), Ok(FetchEvent::Cancelled)));
        remote.join().expect("cancel thread");

        let (late, late_received) = mpsc::channel();
        cancellation.notify(late);
        assert!(matches!(late_received.try_recv(), Ok(FetchEvent::Cancelled)));
    }

    #[test]
    fn cancel_during_fetch_is_forwarded() {
        let fixture = fixture(true);
        let (events, _received) = mpsc::channel();
        let cancellation = FetchCancellation::new();
        let mut generator = SourceFetchGenerator::new(&fixture.context, events, cancellation.clone());

        assert!(generator.start_next());
        assert_eq!(generator.state(), FetchState::Fetching);
        assert_eq!(fixture.origin.loads.load(Ordering::SeqCst), 1);

        let remote = std::thread::spawn(move || cancellation.cancel());
        remote.join().expect("cancel thread");
        assert_eq!(fixture.origin.cancels.load(Ordering::SeqCst), 1);
        assert!(!generator.start_next());
    }
}
