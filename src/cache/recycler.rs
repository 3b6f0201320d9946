use std::collections::HashSet;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, mpsc as std_mpsc};
use std::thread::{self, JoinHandle, ThreadId};

use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::error::LifetimeError;
use super::lock::mutex_lock;
use super::refcount::RefCountedArtifact;

const SOURCE: &str = "cache::recycler";
const THREAD_NAME: &str = "stratacache-recycler";

enum Task {
    Recycle(Arc<RefCountedArtifact>),
    Flush(std_mpsc::Sender<()>),
}

/// Threads currently inside a recycle call on one scheduler.
#[derive(Default)]
struct Reentrancy {
    active: Mutex<HashSet<ThreadId>>,
}

impl Reentrancy {
    fn is_active(&self) -> bool {
        mutex_lock(&self.active, SOURCE, "reentrancy.check").contains(&thread::current().id())
    }

    fn enter(self: &Arc<Self>) -> ReentrancyGuard {
        mutex_lock(&self.active, SOURCE, "reentrancy.enter").insert(thread::current().id());
        ReentrancyGuard {
            owner: self.clone(),
        }
    }
}

struct ReentrancyGuard {
    owner: Arc<Reentrancy>,
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        mutex_lock(&self.owner.active, SOURCE, "reentrancy.exit").remove(&thread::current().id());
    }
}

/// Runs artifact recycles, deferring them to a single drain thread whenever a
/// recycle would otherwise start inside another one.
pub struct RecycleScheduler {
    reentrancy: Arc<Reentrancy>,
    sender: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RecycleScheduler {
    pub fn new() -> io::Result<Arc<Self>> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Task>();
        let reentrancy = Arc::new(Reentrancy::default());

        let drain_reentrancy = reentrancy.clone();
        let worker = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                // Everything run here counts as nested, so recycles triggered
                // by a recycle are queued behind it instead of recursing.
                let _guard = drain_reentrancy.enter();
                while let Some(task) = receiver.blocking_recv() {
                    match task {
                        Task::Recycle(artifact) => run_recycle(&artifact, true),
                        Task::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
                debug!(target_module = SOURCE, "Recycle drain stopped");
            })?;

        Ok(Arc::new(Self {
            reentrancy,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }))
    }

    /// Recycle `artifact` now, or queue it when `force_deferred` is set or the
    /// caller is already inside a recycle on this scheduler.
    ///
    /// Errors are returned only for immediate recycles; deferred failures are
    /// logged by the drain thread.
    pub fn recycle(
        &self,
        artifact: Arc<RefCountedArtifact>,
        force_deferred: bool,
    ) -> Result<(), LifetimeError> {
        if force_deferred || self.reentrancy.is_active() {
            self.defer(artifact);
            return Ok(());
        }

        let _guard = self.reentrancy.enter();
        artifact.recycle()
    }

    /// Block until every recycle queued before this call has run. Returns
    /// immediately when called from the drain thread or after shutdown.
    pub fn flush(&self) {
        if self.is_drain_thread() {
            return;
        }
        let (done, wait) = std_mpsc::channel();
        let queued = {
            let sender = mutex_lock(&self.sender, SOURCE, "flush");
            sender
                .as_ref()
                .is_some_and(|sender| sender.send(Task::Flush(done)).is_ok())
        };
        if queued {
            let _ = wait.recv();
        }
    }

    /// Stop accepting deferred work, drain what is queued and join the thread.
    pub fn shutdown(&self) {
        mutex_lock(&self.sender, SOURCE, "shutdown").take();
        if self.is_drain_thread() {
            return;
        }
        let worker = mutex_lock(&self.worker, SOURCE, "shutdown.join").take();
        if let Some(worker) = worker
            && worker.join().is_err()
        {
            warn!(target_module = SOURCE, "Recycle drain thread panicked");
        }
    }

    fn defer(&self, artifact: Arc<RefCountedArtifact>) {
        counter!("stratacache_recycle_deferred_total").increment(1);
        let rejected = {
            let sender = mutex_lock(&self.sender, SOURCE, "defer");
            match sender.as_ref() {
                Some(sender) => sender
                    .send(Task::Recycle(artifact))
                    .err()
                    .and_then(|err| match err.0 {
                        Task::Recycle(artifact) => Some(artifact),
                        Task::Flush(_) => None,
                    }),
                None => Some(artifact),
            }
        };

        if let Some(artifact) = rejected {
            warn!(
                target_module = SOURCE,
                "Recycle scheduler stopped; recycling inline"
            );
            run_recycle(&artifact, false);
        }
    }

    fn is_drain_thread(&self) -> bool {
        thread::current().name() == Some(THREAD_NAME) && self.reentrancy.is_active()
    }
}

impl fmt::Debug for RecycleScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let running = mutex_lock(&self.sender, SOURCE, "debug").is_some();
        f.debug_struct("RecycleScheduler")
            .field("running", &running)
            .finish_non_exhaustive()
    }
}

impl Drop for RecycleScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_recycle(artifact: &RefCountedArtifact, deferred: bool) {
    if let Err(err) = artifact.recycle() {
        warn!(
            target_module = SOURCE,
            deferred,
            error = %err,
            "Failed to recycle artifact"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::collections::BTreeMap;
    use std::sync::OnceLock;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::cache::artifact::{Artifact, ArtifactType, BytesArtifact, Model};
    use crate::cache::keys::{CacheKey, Options, RequestKey};

    fn key(id: u32) -> RequestKey {
        RequestKey::builder()
            .model(Model::Resource(id))
            .signature(CacheKey::Empty)
            .size(1, 1)
            .transformations(BTreeMap::new())
            .source_type(ArtifactType::Bytes)
            .output_type(ArtifactType::Bytes)
            .options(Options::new())
            .build()
            .expect("key")
    }

    fn wrap(artifact: Box<dyn Artifact>, id: u32) -> Arc<RefCountedArtifact> {
        Arc::new(RefCountedArtifact::new(artifact, key(id), true, true, None))
    }

    /// Recycling the child recycles its parent through the same scheduler.
    #[derive(Debug)]
    struct Child {
        scheduler: Arc<RecycleScheduler>,
        parent: Arc<RefCountedArtifact>,
        parent_recycled_inline: Arc<AtomicBool>,
        recycled_on: Arc<OnceLock<ThreadId>>,
    }

    impl Artifact for Child {
        fn artifact_type(&self) -> ArtifactType {
            ArtifactType::Any
        }

        fn cost(&self) -> usize {
            0
        }

        fn recycle(&self) {
            let _ = self.recycled_on.set(thread::current().id());
            self.scheduler
                .recycle(self.parent.clone(), false)
                .expect("parent recycle accepted");
            self.parent_recycled_inline
                .store(self.parent.is_recycled(), Ordering::SeqCst);
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn immediate_recycle_runs_on_the_caller() {
        let scheduler = RecycleScheduler::new().expect("scheduler");
        let counter = Arc::new(AtomicUsize::new(0));
        let artifact = wrap(
            Box::new(BytesArtifact::new(ArtifactType::Bytes, "x").with_recycle_counter(counter.clone())),
            1,
        );

        scheduler.recycle(artifact.clone(), false).expect("recycle");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(
            scheduler.recycle(artifact, false),
            Err(LifetimeError::AlreadyRecycled)
        );
    }

    #[test]
    fn forced_recycle_runs_on_the_drain_thread() {
        let scheduler = RecycleScheduler::new().expect("scheduler");
        let counter = Arc::new(AtomicUsize::new(0));
        let artifact = wrap(
            Box::new(BytesArtifact::new(ArtifactType::Bytes, "x").with_recycle_counter(counter.clone())),
            1,
        );

        scheduler.recycle(artifact, true).expect("queued");
        scheduler.flush();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn nested_recycle_is_deferred_not_recursed() {
        let scheduler = RecycleScheduler::new().expect("scheduler");
        let parent_counter = Arc::new(AtomicUsize::new(0));
        let parent = wrap(
            Box::new(
                BytesArtifact::new(ArtifactType::Bytes, "parent")
                    .with_recycle_counter(parent_counter.clone()),
            ),
            1,
        );
        let inline = Arc::new(AtomicBool::new(true));
        let recycled_on = Arc::new(OnceLock::new());
        let child = wrap(
            Box::new(Child {
                scheduler: scheduler.clone(),
                parent: parent.clone(),
                parent_recycled_inline: inline.clone(),
                recycled_on: recycled_on.clone(),
            }),
            2,
        );

        scheduler.recycle(child, false).expect("child recycle");
        assert_eq!(recycled_on.get(), Some(&thread::current().id()));
        assert!(!inline.load(Ordering::SeqCst));

        scheduler.flush();
        assert!(parent.is_recycled());
        assert_eq!(parent_counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deferred_chain_on_drain_thread_is_also_queued() {
        let scheduler = RecycleScheduler::new().expect("scheduler");
        let parent = wrap(Box::new(BytesArtifact::new(ArtifactType::Bytes, "p")), 1);
        let inline = Arc::new(AtomicBool::new(true));
        let recycled_on = Arc::new(OnceLock::new());
        let child = wrap(
            Box::new(Child {
                scheduler: scheduler.clone(),
                parent: parent.clone(),
                parent_recycled_inline: inline.clone(),
                recycled_on: recycled_on.clone(),
            }),
            2,
        );

        scheduler.recycle(child, true).expect("queued");
        scheduler.flush();
        scheduler.flush();

        assert_ne!(recycled_on.get(), Some(&thread::current().id()));
        assert!(!inline.load(Ordering::SeqCst));
        assert!(parent.is_recycled());
    }

    #[test]
    fn shutdown_falls_back_to_inline_recycling() {
        let scheduler = RecycleScheduler::new().expect("scheduler");
        scheduler.shutdown();
        let artifact = wrap(Box::new(BytesArtifact::new(ArtifactType::Bytes, "x")), 1);
        scheduler.recycle(artifact.clone(), true).expect("accepted");
        assert!(artifact.is_recycled());
    }
}
