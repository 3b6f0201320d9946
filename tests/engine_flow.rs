use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use stratacache::cache::{
    ArtifactHandle, ArtifactType, BytesArtifact, BytesEncoder, BytesResolver, CacheError, Data,
    DataFetcher, Engine, Executor, FetchCallback, FetchError, FetchPlan, LoadRequest, LoadTicket,
    Model, Options, PassthroughStage, PersistenceStrategy, Provenance, Registry, SourceResolver,
    Task, TokioExecutor,
};

/// Runs every job on its own thread.
struct ThreadExecutor;

impl Executor for ThreadExecutor {
    fn submit(&self, task: Task) {
        thread::spawn(task);
    }
}

#[derive(Default)]
struct Gate {
    open: Mutex<bool>,
    opened: Condvar,
}

impl Gate {
    fn open(&self) {
        *self.open.lock().expect("gate lock") = true;
        self.opened.notify_all();
    }

    fn wait(&self) {
        let mut open = self.open.lock().expect("gate lock");
        while !*open {
            open = self.opened.wait(open).expect("gate wait");
        }
    }
}

/// Remote origin that counts its fetches and holds each one until the gate opens.
#[derive(Default)]
struct Origin {
    fetches: AtomicUsize,
    cancelled: AtomicBool,
    gate: Gate,
}

impl Origin {
    fn opened() -> Arc<Self> {
        let origin = Arc::new(Self::default());
        origin.gate.open();
        origin
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

struct OriginFetcher {
    origin: Arc<Origin>,
    body: Bytes,
}

impl DataFetcher for OriginFetcher {
    fn load_data(&self, callback: FetchCallback) {
        self.origin.fetches.fetch_add(1, Ordering::SeqCst);
        self.origin.gate.wait();
        if self.origin.cancelled.load(Ordering::SeqCst) {
            callback(Err(FetchError::Cancelled));
        } else {
            callback(Ok(Data::bytes(self.body.clone())));
        }
    }

    fn cancel(&self) {
        self.origin.cancelled.store(true, Ordering::SeqCst);
        self.origin.gate.open();
    }

    fn data_type(&self) -> ArtifactType {
        ArtifactType::Bytes
    }

    fn provenance(&self) -> Provenance {
        Provenance::Remote
    }
}

struct OriginResolver {
    origin: Arc<Origin>,
}

impl SourceResolver for OriginResolver {
    fn name(&self) -> &str {
        "origin"
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
        let Model::Uri(uri) = model else {
            return None;
        };
        Some(FetchPlan {
            source_key: model.cache_key(),
            alternate_keys: Vec::new(),
            fetcher: Arc::new(OriginFetcher {
                origin: self.origin.clone(),
                body: Bytes::from(format!("body of {uri}")),
            }),
        })
    }
}

fn registry(origin: &Arc<Origin>) -> Arc<Registry> {
    let mut registry = Registry::new();
    registry
        .append_resolver(Arc::new(OriginResolver {
            origin: origin.clone(),
        }))
        .append_resolver(Arc::new(BytesResolver))
        .append_stage(Arc::new(PassthroughStage::new(ArtifactType::Bytes)))
        .register_encoder(ArtifactType::Bytes, Arc::new(BytesEncoder));
    Arc::new(registry)
}

fn inline_engine(origin: &Arc<Origin>) -> Engine {
    Engine::builder(registry(origin)).build().expect("engine")
}

fn threaded_engine(origin: &Arc<Origin>) -> Engine {
    Engine::builder(registry(origin))
        .executor(Arc::new(ThreadExecutor))
        .build()
        .expect("engine")
}

fn remote(uri: &str) -> LoadRequest {
    LoadRequest::new(Model::Uri(uri.to_string()))
}

fn payload(handle: &ArtifactHandle) -> Bytes {
    handle
        .downcast_ref::<BytesArtifact>()
        .expect("bytes artifact")
        .bytes()
        .clone()
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn loads_walk_live_memory_and_artifact_tiers() {
    let origin = Origin::opened();
    let engine = inline_engine(&origin);
    let request = || LoadRequest::new(Model::Bytes(Bytes::from_static(b"local payload")));

    let first = engine
        .load(request())
        .expect("load")
        .wait_blocking()
        .expect("artifact");
    assert_eq!(first.provenance(), Provenance::Local);

    let LoadTicket::Ready(live) = engine.load(request()).expect("load") else {
        panic!("expected a live hit");
    };
    assert_eq!(live.provenance(), Provenance::MemoryCache);
    assert!(Arc::ptr_eq(first.shared(), live.shared()));
    drop(live);
    drop(first);
    assert_eq!(engine.memory_len(), 1);

    let LoadTicket::Ready(cached) = engine.load(request()).expect("load") else {
        panic!("expected a memory hit");
    };
    assert_eq!(cached.provenance(), Provenance::MemoryCache);
    drop(cached);

    engine.clear_memory();
    assert_eq!(engine.memory_len(), 0);

    let reloaded = engine
        .load(request())
        .expect("load")
        .wait_blocking()
        .expect("artifact");
    assert_eq!(reloaded.provenance(), Provenance::ArtifactDiskCache);
    assert_eq!(payload(&reloaded), Bytes::from_static(b"local payload"));
}

#[test]
fn remote_sources_are_served_from_the_source_tier_after_release() {
    let origin = Origin::opened();
    let engine = inline_engine(&origin);

    let first = engine
        .load(remote("https://example.com/a"))
        .expect("load")
        .wait_blocking()
        .expect("artifact");
    assert_eq!(first.provenance(), Provenance::Remote);
    drop(first);
    engine.clear_memory();

    let second = engine
        .load(remote("https://example.com/a"))
        .expect("load")
        .wait_blocking()
        .expect("artifact");
    assert_eq!(second.provenance(), Provenance::SourceDiskCache);
    assert_eq!(
        payload(&second),
        Bytes::from_static(b"body of https://example.com/a")
    );
    assert_eq!(origin.fetches(), 1);
}

#[test]
fn concurrent_loads_share_one_fetch() {
    let origin = Arc::new(Origin::default());
    let engine = threaded_engine(&origin);

    let tickets: Vec<LoadTicket> = thread::scope(|scope| {
        let workers: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| engine.load(remote("https://example.com/shared")).expect("load")))
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().expect("worker"))
            .collect()
    });
    origin.gate.open();

    let handles: Vec<ArtifactHandle> = tickets
        .into_iter()
        .map(|ticket| ticket.wait_blocking().expect("artifact"))
        .collect();

    assert_eq!(origin.fetches(), 1);
    assert_eq!(handles.len(), 8);
    for handle in &handles {
        assert!(Arc::ptr_eq(handles[0].shared(), handle.shared()));
    }
    assert_eq!(engine.active_jobs(), 0);
    // The job lets go of its own acquisition right after fanning out.
    wait_until(|| handles[0].shared().acquired() == 8);
}

#[test]
fn cache_only_load_never_reaches_the_origin() {
    let origin = Origin::opened();
    let engine = inline_engine(&origin);

    let err = engine
        .load(remote("https://example.com/missing").cache_only())
        .expect("load")
        .wait_blocking()
        .expect_err("nothing cached");

    assert!(matches!(err, CacheError::Pipeline(_)), "got {err:?}");
    assert_eq!(origin.fetches(), 0);
}

#[test]
fn cache_only_load_is_served_once_the_source_is_cached() {
    let origin = Origin::opened();
    let engine = inline_engine(&origin);

    drop(
        engine
            .load(remote("https://example.com/b"))
            .expect("load")
            .wait_blocking()
            .expect("artifact"),
    );
    engine.clear_memory();

    let handle = engine
        .load(remote("https://example.com/b").cache_only())
        .expect("load")
        .wait_blocking()
        .expect("cached");
    assert_eq!(handle.provenance(), Provenance::SourceDiskCache);
    assert_eq!(origin.fetches(), 1);
}

#[test]
fn strategy_none_refetches_after_memory_is_cleared() {
    let origin = Origin::opened();
    let engine = inline_engine(&origin);
    let request = || remote("https://example.com/c").strategy(PersistenceStrategy::None);

    drop(engine.load(request()).expect("load").wait_blocking().expect("artifact"));
    engine.clear_memory();
    let handle = engine.load(request()).expect("load").wait_blocking().expect("artifact");

    assert_eq!(handle.provenance(), Provenance::Remote);
    assert_eq!(origin.fetches(), 2);
}

#[test]
fn last_waiter_leaving_cancels_the_fetch() {
    let origin = Arc::new(Origin::default());
    let engine = threaded_engine(&origin);

    let ticket = engine.load(remote("https://example.com/slow")).expect("load");
    wait_until(|| origin.fetches() == 1);
    assert_eq!(engine.active_jobs(), 1);

    let LoadTicket::Pending(pending) = ticket else {
        panic!("expected a pending load");
    };
    pending.cancel();

    assert!(origin.cancelled.load(Ordering::SeqCst));
    assert_eq!(engine.active_jobs(), 0);
}

#[test]
fn failures_reach_every_waiter() {
    let origin = Origin::opened();
    let engine = threaded_engine(&origin);

    let first = engine.load(LoadRequest::new(Model::Resource(7))).expect("load");
    let second = engine.load(LoadRequest::new(Model::Resource(7))).expect("load");

    for ticket in [first, second] {
        let err = ticket.wait_blocking().expect_err("unresolvable");
        assert!(matches!(err, CacheError::Pipeline(_)), "got {err:?}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tokio_executor_runs_jobs_off_the_caller() {
    let origin = Origin::opened();
    let engine = Engine::builder(registry(&origin))
        .executor(Arc::new(TokioExecutor::current().expect("runtime")))
        .build()
        .expect("engine");

    let handle = engine
        .load(remote("https://example.com/async"))
        .expect("load")
        .wait()
        .await
        .expect("artifact");

    assert_eq!(
        payload(&handle),
        Bytes::from_static(b"body of https://example.com/async")
    );
    assert_eq!(origin.fetches(), 1);
}
