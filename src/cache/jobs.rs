use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::keys::RequestKey;

/// A job as seen by the registry.
pub trait RegisteredJob: Send + Sync {
    /// True when the job may only read the cache tiers, never the origin.
    fn only_retrieve_from_cache(&self) -> bool;
}

/// In-flight jobs by request key.
///
/// Jobs allowed to reach the origin and cache-only jobs live in disjoint maps,
/// so a caller never joins a job with a different reach than it asked for,
/// even when the keys are equal.
pub struct JobRegistry<J> {
    jobs: DashMap<RequestKey, Arc<J>>,
    cache_only_jobs: DashMap<RequestKey, Arc<J>>,
}

impl<J: RegisteredJob> JobRegistry<J> {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
            cache_only_jobs: DashMap::new(),
        }
    }

    fn map(&self, cache_only: bool) -> &DashMap<RequestKey, Arc<J>> {
        if cache_only {
            &self.cache_only_jobs
        } else {
            &self.jobs
        }
    }

    pub fn get(&self, key: &RequestKey, cache_only: bool) -> Option<Arc<J>> {
        self.map(cache_only)
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Register `job`, replacing any job previously held under `key`.
    pub fn put(&self, key: RequestKey, job: Arc<J>) {
        self.map(job.only_retrieve_from_cache()).insert(key, job);
    }

    /// Remove the registration for `key` only if it is still `expected`.
    /// Returns whether anything was removed.
    pub fn remove_if_current(&self, key: &RequestKey, expected: &Arc<J>) -> bool {
        self.map(expected.only_retrieve_from_cache())
            .remove_if(key, |_, current| Arc::ptr_eq(current, expected))
            .is_some()
    }

    /// Return the job registered under `key`, or register the one built by
    /// `create`. The flag is true when `create` ran.
    pub fn get_or_register<F>(&self, key: &RequestKey, cache_only: bool, create: F) -> (Arc<J>, bool)
    where
        F: FnOnce() -> Arc<J>,
    {
        match self.map(cache_only).entry(key.clone()) {
            Entry::Occupied(occupied) => (Arc::clone(occupied.get()), false),
            Entry::Vacant(vacant) => {
                let job = create();
                vacant.insert(Arc::clone(&job));
                (job, true)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len() + self.cache_only_jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<J: RegisteredJob> Default for JobRegistry<J> {
    fn default() -> Self {
        Self::new()
    }
}

impl<J> fmt::Debug for JobRegistry<J> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.jobs.len())
            .field("cache_only_jobs", &self.cache_only_jobs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;
    use crate::cache::artifact::{ArtifactType, Model};
    use crate::cache::keys::{CacheKey, Options};

    #[derive(Debug)]
    struct TestJob {
        cache_only: bool,
    }

    impl RegisteredJob for TestJob {
        fn only_retrieve_from_cache(&self) -> bool {
            self.cache_only
        }
    }

    fn key(id: u32) -> RequestKey {
        RequestKey::builder()
            .model(Model::Resource(id))
            .signature(CacheKey::Empty)
            .size(10, 10)
            .transformations(BTreeMap::new())
            .source_type(ArtifactType::Bytes)
            .output_type(ArtifactType::Bytes)
            .options(Options::new())
            .build()
            .expect("key")
    }

    #[test]
    fn partitions_are_disjoint() {
        let registry = JobRegistry::new();
        let full = Arc::new(TestJob { cache_only: false });
        registry.put(key(1), full.clone());

        assert!(registry.get(&key(1), true).is_none());
        let found = registry.get(&key(1), false).expect("full job");
        assert!(Arc::ptr_eq(&found, &full));

        let cached = Arc::new(TestJob { cache_only: true });
        registry.put(key(1), cached.clone());
        assert_eq!(registry.len(), 2);
        assert!(Arc::ptr_eq(&registry.get(&key(1), true).expect("cache-only"), &cached));
    }

    #[test]
    fn remove_if_current_keeps_a_replacement() {
        let registry = JobRegistry::new();
        let stale = Arc::new(TestJob { cache_only: false });
        let fresh = Arc::new(TestJob { cache_only: false });

        registry.put(key(1), stale.clone());
        registry.put(key(1), fresh.clone());

        assert!(!registry.remove_if_current(&key(1), &stale));
        assert!(Arc::ptr_eq(&registry.get(&key(1), false).expect("fresh"), &fresh));

        assert!(registry.remove_if_current(&key(1), &fresh));
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_lookups_register_exactly_one_job() {
        const CALLERS: usize = 16;
        let registry = Arc::new(JobRegistry::new());
        let created = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(CALLERS));

        let callers: Vec<_> = (0..CALLERS)
            .map(|_| {
                let registry = registry.clone();
                let created = created.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let (job, _) = registry.get_or_register(&key(7), false, || {
                        created.fetch_add(1, Ordering::SeqCst);
                        Arc::new(TestJob { cache_only: false })
                    });
                    job
                })
            })
            .collect();

        let jobs: Vec<Arc<TestJob>> = callers
            .into_iter()
            .map(|caller| caller.join().expect("caller"))
            .collect();

        assert_eq!(created.load(Ordering::SeqCst), 1);
        let registered = registry.get(&key(7), false).expect("registered");
        assert!(jobs.iter().all(|job| Arc::ptr_eq(job, &registered)));
    }
}
