//! Artifacts whose recycling can be postponed while a consumer still reads them.
//!
//! The engine locks a freshly produced artifact while it is being written to
//! the persistent artifact tier. If every caller releases it and the memory
//! tier evicts it during the write, the recycle request is recorded and only
//! carried out by the matching `unlock`.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::warn;

use super::artifact::{Artifact, ArtifactType, BoxedArtifact};
use super::error::LifetimeError;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::deferred";

#[derive(Debug, Default)]
struct DeferredState {
    locked: bool,
    recycle_requested: bool,
    recycled: bool,
}

impl DeferredState {
    fn locked() -> Self {
        Self {
            locked: true,
            ..Self::default()
        }
    }
}

struct Shell {
    state: Mutex<DeferredState>,
    artifact: Option<BoxedArtifact>,
}

/// Shared handle to a lockable artifact. Clones refer to the same payload.
#[derive(Clone)]
pub struct DeferredRecycleArtifact {
    shell: Arc<Shell>,
    pool: Arc<DeferredRecyclePool>,
}

impl DeferredRecycleArtifact {
    pub fn inner(&self) -> Option<&dyn Artifact> {
        self.shell.artifact.as_deref()
    }

    pub fn is_locked(&self) -> bool {
        mutex_lock(&self.shell.state, SOURCE, "is_locked").locked
    }

    pub fn is_recycled(&self) -> bool {
        mutex_lock(&self.shell.state, SOURCE, "is_recycled").recycled
    }

    pub fn lock(&self) -> Result<(), LifetimeError> {
        let mut state = mutex_lock(&self.shell.state, SOURCE, "lock");
        if state.recycled {
            return Err(LifetimeError::AlreadyRecycled);
        }
        state.locked = true;
        Ok(())
    }

    /// Release the lock, performing a recycle that was requested meanwhile.
    pub fn unlock(&self) -> Result<(), LifetimeError> {
        let recycle_now = {
            let mut state = mutex_lock(&self.shell.state, SOURCE, "unlock");
            if !state.locked {
                return Err(LifetimeError::UnlockWhileUnlocked);
            }
            state.locked = false;
            if state.recycle_requested {
                state.recycle_requested = false;
                state.recycled = true;
                true
            } else {
                false
            }
        };
        if recycle_now {
            self.finish_recycle();
        }
        Ok(())
    }

    /// Recycle the payload, or record the request when locked.
    pub fn try_recycle(&self) -> Result<(), LifetimeError> {
        let recycle_now = {
            let mut state = mutex_lock(&self.shell.state, SOURCE, "recycle");
            if state.recycled || state.recycle_requested {
                return Err(LifetimeError::AlreadyRecycled);
            }
            if state.locked {
                state.recycle_requested = true;
                false
            } else {
                state.recycled = true;
                true
            }
        };
        if recycle_now {
            self.finish_recycle();
        }
        Ok(())
    }

    fn finish_recycle(&self) {
        if let Some(artifact) = self.shell.artifact.as_deref() {
            artifact.recycle();
        }
        self.pool.give_back(self.shell.clone());
    }
}

impl fmt::Debug for DeferredRecycleArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = mutex_lock(&self.shell.state, SOURCE, "debug");
        f.debug_struct("DeferredRecycleArtifact")
            .field("artifact", &self.shell.artifact)
            .field("locked", &state.locked)
            .field("recycled", &state.recycled)
            .finish()
    }
}

impl Artifact for DeferredRecycleArtifact {
    fn artifact_type(&self) -> ArtifactType {
        self.inner()
            .map_or(ArtifactType::Any, |artifact| artifact.artifact_type())
    }

    fn cost(&self) -> usize {
        self.inner().map_or(0, |artifact| artifact.cost())
    }

    fn recycle(&self) {
        if let Err(err) = self.try_recycle() {
            warn!(
                target_module = SOURCE,
                error = %err,
                "Ignoring repeated recycle of deferred artifact"
            );
        }
    }

    fn as_any(&self) -> &dyn Any {
        match self.inner() {
            Some(artifact) => artifact.as_any(),
            None => self,
        }
    }
}

/// Keeps recycled shells for reuse, up to a fixed capacity.
///
/// A shell goes back to the pool as soon as its payload is recycled, but it is
/// only handed out again once no [`DeferredRecycleArtifact`] refers to it. The
/// previous payload is dropped at that point.
pub struct DeferredRecyclePool {
    capacity: usize,
    idle: Mutex<Vec<Arc<Shell>>>,
}

impl DeferredRecyclePool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            idle: Mutex::new(Vec::with_capacity(capacity)),
        })
    }

    /// Wrap `artifact` in a locked deferred-recycle handle.
    pub fn obtain(self: &Arc<Self>, artifact: BoxedArtifact) -> DeferredRecycleArtifact {
        let reused = {
            let mut idle = mutex_lock(&self.idle, SOURCE, "obtain");
            let unused = idle
                .iter_mut()
                .position(|shell| Arc::get_mut(shell).is_some());
            unused.map(|index| idle.swap_remove(index))
        };

        let shell = match reused {
            Some(mut shell) => match Arc::get_mut(&mut shell) {
                Some(unique) => {
                    unique.artifact = Some(artifact);
                    let state = match unique.state.get_mut() {
                        Ok(state) => state,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    *state = DeferredState::locked();
                    shell
                }
                None => Self::fresh(artifact),
            },
            None => Self::fresh(artifact),
        };

        DeferredRecycleArtifact {
            shell,
            pool: self.clone(),
        }
    }

    pub fn idle(&self) -> usize {
        mutex_lock(&self.idle, SOURCE, "idle").len()
    }

    fn fresh(artifact: BoxedArtifact) -> Arc<Shell> {
        Arc::new(Shell {
            state: Mutex::new(DeferredState::locked()),
            artifact: Some(artifact),
        })
    }

    fn give_back(&self, shell: Arc<Shell>) {
        let mut idle = mutex_lock(&self.idle, SOURCE, "give_back");
        if idle.len() < self.capacity {
            idle.push(shell);
        }
    }
}

impl fmt::Debug for DeferredRecyclePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredRecyclePool")
            .field("capacity", &self.capacity)
            .field("idle", &self.idle())
            .finish()
    }
}
