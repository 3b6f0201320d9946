use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use tracing::{error, warn};

use super::artifact::Artifact;
use super::artifact::BoxedArtifact;
use super::error::LifetimeError;
use super::keys::RequestKey;
use super::lock::mutex_lock;
use super::strategy::Provenance;

const SOURCE: &str = "cache::refcount";

/// Notified when the last acquirer of a [`RefCountedArtifact`] releases it.
pub trait ReleaseListener: Send + Sync {
    fn on_released(&self, key: &RequestKey, artifact: &Arc<RefCountedArtifact>);
}

#[derive(Debug, Default)]
struct LifetimeState {
    acquired: usize,
    recycled: bool,
}

/// An artifact shared by every caller currently holding it.
///
/// The count is explicit rather than tied to `Arc` so the artifact can outlive
/// its last holder in the memory tier and still be recycled exactly once.
pub struct RefCountedArtifact {
    state: Mutex<LifetimeState>,
    artifact: BoxedArtifact,
    key: RequestKey,
    memory_cacheable: bool,
    recyclable: bool,
    listener: Option<Weak<dyn ReleaseListener>>,
}

impl RefCountedArtifact {
    pub fn new(
        artifact: BoxedArtifact,
        key: RequestKey,
        memory_cacheable: bool,
        recyclable: bool,
        listener: Option<Weak<dyn ReleaseListener>>,
    ) -> Self {
        Self {
            state: Mutex::new(LifetimeState::default()),
            artifact,
            key,
            memory_cacheable,
            recyclable,
            listener,
        }
    }

    pub fn artifact(&self) -> &dyn Artifact {
        self.artifact.as_ref()
    }

    pub fn key(&self) -> &RequestKey {
        &self.key
    }

    pub fn is_memory_cacheable(&self) -> bool {
        self.memory_cacheable
    }

    pub fn is_recyclable(&self) -> bool {
        self.recyclable
    }

    pub fn acquired(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "acquired").acquired
    }

    pub fn is_recycled(&self) -> bool {
        mutex_lock(&self.state, SOURCE, "is_recycled").recycled
    }

    pub fn acquire(&self) -> Result<(), LifetimeError> {
        let mut state = mutex_lock(&self.state, SOURCE, "acquire");
        if state.recycled {
            return Err(LifetimeError::AcquireAfterRecycle);
        }
        state.acquired += 1;
        Ok(())
    }

    /// Drop one acquisition. The listener runs outside the lock, once per
    /// transition to zero.
    pub fn release(self: &Arc<Self>) -> Result<(), LifetimeError> {
        let reached_zero = {
            let mut state = mutex_lock(&self.state, SOURCE, "release");
            if state.acquired == 0 {
                return Err(LifetimeError::ReleaseWithoutAcquire);
            }
            state.acquired -= 1;
            state.acquired == 0
        };

        if reached_zero
            && let Some(listener) = self.listener.as_ref().and_then(Weak::upgrade)
        {
            listener.on_released(&self.key, self);
        }
        Ok(())
    }

    /// Return the payload's pooled resources. Only legal once, with no
    /// outstanding acquisitions.
    pub fn recycle(&self) -> Result<(), LifetimeError> {
        {
            let mut state = mutex_lock(&self.state, SOURCE, "recycle");
            if state.acquired > 0 {
                return Err(LifetimeError::RecycleWhileAcquired {
                    acquired: state.acquired,
                });
            }
            if state.recycled {
                return Err(LifetimeError::AlreadyRecycled);
            }
            state.recycled = true;
        }

        if self.recyclable {
            self.artifact.recycle();
        }
        Ok(())
    }
}

impl fmt::Debug for RefCountedArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefCountedArtifact")
            .field("artifact", &self.artifact)
            .field("key", &self.key)
            .field("memory_cacheable", &self.memory_cacheable)
            .field("recyclable", &self.recyclable)
            .finish_non_exhaustive()
    }
}

impl Drop for RefCountedArtifact {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.acquired > 0 {
            error!(
                target_module = SOURCE,
                acquired = state.acquired,
                "Artifact dropped while still acquired"
            );
        }
    }
}

/// One acquisition of a shared artifact, released when dropped.
pub struct ArtifactHandle {
    inner: Arc<RefCountedArtifact>,
    provenance: Provenance,
}

impl ArtifactHandle {
    pub fn acquire(
        inner: Arc<RefCountedArtifact>,
        provenance: Provenance,
    ) -> Result<Self, LifetimeError> {
        inner.acquire()?;
        Ok(Self { inner, provenance })
    }

    pub fn artifact(&self) -> &dyn Artifact {
        self.inner.artifact()
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.inner.artifact().as_any().downcast_ref::<T>()
    }

    pub fn key(&self) -> &RequestKey {
        self.inner.key()
    }

    /// Where this handle's artifact came from on the load that produced it.
    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub fn shared(&self) -> &Arc<RefCountedArtifact> {
        &self.inner
    }

    pub fn try_clone(&self) -> Result<Self, LifetimeError> {
        Self::acquire(self.inner.clone(), self.provenance)
    }
}

impl fmt::Debug for ArtifactHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactHandle")
            .field("artifact", &self.inner.artifact)
            .field("provenance", &self.provenance)
            .finish()
    }
}

impl Drop for ArtifactHandle {
    fn drop(&mut self) {
        if let Err(err) = self.inner.release() {
            warn!(
                target_module = SOURCE,
                error = %err,
                "Failed to release artifact handle"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;
    use crate::cache::artifact::{ArtifactType, BytesArtifact, Model};
    use crate::cache::keys::{CacheKey, Options};

    #[derive(Default)]
    struct CountingListener {
        calls: AtomicUsize,
    }

    impl ReleaseListener for CountingListener {
        fn on_released(&self, _key: &RequestKey, _artifact: &Arc<RefCountedArtifact>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn key() -> RequestKey {
        RequestKey::builder()
            .model(Model::Resource(1))
            .signature(CacheKey::Empty)
            .size(1, 1)
            .transformations(BTreeMap::new())
            .source_type(ArtifactType::Bytes)
            .output_type(ArtifactType::Bytes)
            .options(Options::new())
            .build()
            .expect("key")
    }

    fn shared(listener: Option<Weak<dyn ReleaseListener>>) -> Arc<RefCountedArtifact> {
        Arc::new(RefCountedArtifact::new(
            Box::new(BytesArtifact::new(ArtifactType::Bytes, "abc")),
            key(),
            true,
            true,
            listener,
        ))
    }

    #[test]
    fn listener_fires_once_when_count_reaches_zero() {
        let listener = Arc::new(CountingListener::default());
        let weak: Weak<dyn ReleaseListener> = Arc::<CountingListener>::downgrade(&listener);
        let artifact = shared(Some(weak));

        artifact.acquire().expect("first acquire");
        artifact.acquire().expect("second acquire");
        artifact.release().expect("first release");
        assert_eq!(artifact.acquired(), 1);
        assert_eq!(
            artifact.recycle(),
            Err(LifetimeError::RecycleWhileAcquired { acquired: 1 })
        );
        assert_eq!(listener.calls.load(Ordering::SeqCst), 0);

        artifact.release().expect("second release");
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_without_acquire_is_rejected() {
        let artifact = shared(None);
        assert_eq!(artifact.release(), Err(LifetimeError::ReleaseWithoutAcquire));
    }

    #[test]
    fn recycled_artifact_cannot_be_acquired_or_recycled_again() {
        let artifact = shared(None);
        artifact.recycle().expect("recycle");
        assert_eq!(artifact.acquire(), Err(LifetimeError::AcquireAfterRecycle));
        assert_eq!(artifact.recycle(), Err(LifetimeError::AlreadyRecycled));
        let bytes = artifact
            .artifact()
            .as_any()
            .downcast_ref::<BytesArtifact>()
            .expect("bytes artifact");
        assert_eq!(bytes.recycle_count(), 1);
    }

    #[test]
    fn concurrent_acquire_release_pairs_balance() {
        let listener = Arc::new(CountingListener::default());
        let weak: Weak<dyn ReleaseListener> = Arc::<CountingListener>::downgrade(&listener);
        let artifact = shared(Some(weak));
        artifact.acquire().expect("anchor");

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let artifact = artifact.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        artifact.acquire().expect("acquire");
                        artifact.release().expect("release");
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker");
        }

        assert_eq!(artifact.acquired(), 1);
        assert_eq!(listener.calls.load(Ordering::SeqCst), 0);
        artifact.release().expect("anchor release");
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handle_releases_on_drop() {
        let listener = Arc::new(CountingListener::default());
        let weak: Weak<dyn ReleaseListener> = Arc::<CountingListener>::downgrade(&listener);
        let artifact = shared(Some(weak));

        let handle = ArtifactHandle::acquire(artifact.clone(), Provenance::Local).expect("handle");
        let second = handle.try_clone().expect("clone");
        assert_eq!(artifact.acquired(), 2);
        assert_eq!(
            handle.downcast_ref::<BytesArtifact>().map(|b| b.bytes().len()),
            Some(3)
        );

        drop(handle);
        drop(second);
        assert_eq!(artifact.acquired(), 0);
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
    }
}
