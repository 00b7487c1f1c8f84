//! Waiting for a resource's bytes to arrive in the object store.
//!
//! A resource is registered in the catalog before (or while) its data is
//! uploaded, and the object may only become visible some time later. The
//! [`AvailabilitySynchronizer`] polls until the object exists and has the
//! size the catalog declares.
//!
//! Positive results are remembered for a short while in a bounded cache.
//! Entries past their lifetime are dropped whenever a new one is recorded.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dcor_storage_models::{Artifact, ResourceId};
use lru::LruCache;

use crate::StorageError;
use crate::clock::Clock;
use crate::resource::ResourceStore;
use crate::retry::RetryPolicy;

/// Default upper bound for [`AvailabilitySynchronizer::wait_for_resource`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// How long a positive check is trusted.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// Maximum number of positive results remembered at once.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

type AvailableCache = LruCache<(ResourceId, Artifact), DateTime<Utc>>;

/// Observed state of a resource's artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    /// No object yet.
    Pending,
    /// The object exists but does not have the declared size yet.
    Verifying,
    /// The object is complete.
    Available,
    /// The catalog does not know the resource.
    Missing,
}

/// Polls the store until resources become available.
pub struct AvailabilitySynchronizer {
    resources: Arc<ResourceStore>,
    clock: Arc<dyn Clock>,
    poll: RetryPolicy,
    cache_ttl: Duration,
    default_timeout: Duration,
    available: Mutex<AvailableCache>,
}

impl std::fmt::Debug for AvailabilitySynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvailabilitySynchronizer")
            .field("poll", &self.poll)
            .field("cache_ttl", &self.cache_ttl)
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl AvailabilitySynchronizer {
    /// Creates a synchronizer using the clock of the resource store's
    /// client.
    #[must_use]
    pub fn new(resources: Arc<ResourceStore>) -> Self {
        let clock = resources.client().clock();
        Self {
            resources,
            clock,
            poll: RetryPolicy::polling(),
            cache_ttl: DEFAULT_CACHE_TTL,
            default_timeout: DEFAULT_TIMEOUT,
            available: Mutex::new(LruCache::new(capacity(DEFAULT_CACHE_CAPACITY))),
        }
    }

    /// Replaces the polling schedule. Its `max_attempts` bounds the number
    /// of checks per wait in addition to the timeout.
    #[must_use]
    pub fn with_poll_policy(mut self, policy: RetryPolicy) -> Self {
        self.poll = policy;
        self
    }

    /// Replaces how long positive checks are trusted.
    #[must_use]
    pub const fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Replaces how many positive results are remembered at once.
    #[must_use]
    pub fn with_cache_capacity(self, entries: usize) -> Self {
        self.lock_available().resize(capacity(entries));
        self
    }

    /// Replaces the timeout used when none is given.
    #[must_use]
    pub const fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Checks the state of `artifact` of `id` once.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Store`] if the store or catalog cannot be
    /// queried.
    pub async fn check_resource(
        &self,
        id: &ResourceId,
        artifact: Artifact,
    ) -> Result<ResourceState, StorageError> {
        let now = self.clock.now();
        if self.is_cached(id, artifact, now) {
            return Ok(ResourceState::Available);
        }

        let info = match self.resources.resource_info(id).await {
            Ok(info) => info,
            Err(StorageError::ResourceNotFound { .. }) => return Ok(ResourceState::Missing),
            Err(e) => return Err(e),
        };
        let location = self.resources.location(id, artifact).await?;
        let Some(meta) = self
            .resources
            .client()
            .head_object(&location.bucket, &location.key)
            .await?
        else {
            return Ok(ResourceState::Pending);
        };

        let expected = if artifact == Artifact::Resource {
            info.size
        } else {
            None
        };
        if let Some(expected) = expected
            && meta.size != expected
        {
            log::debug!(
                "{location} has {} of {expected} bytes",
                meta.size
            );
            return Ok(ResourceState::Verifying);
        }

        let mut available = self.lock_available();
        let key = (id.clone(), artifact);
        if !available.contains(&key) {
            let purged = purge(&mut available, now, self.cache_ttl);
            if purged > 0 {
                log::debug!("Dropped {purged} stale availability entries");
            }
        }
        available.put(key, now);
        drop(available);
        Ok(ResourceState::Available)
    }

    /// Waits until `artifact` of `resource_id` is complete in the store.
    ///
    /// Polls with increasing intervals for at most `timeout` (default
    /// [`DEFAULT_TIMEOUT`]). Dropping the future stops waiting and leaves
    /// any ongoing upload alone.
    ///
    /// # Errors
    ///
    /// - [`StorageError::InvalidInput`] if `resource_id` is malformed
    /// - [`StorageError::ResourceNotFound`] if the catalog does not know it
    /// - [`StorageError::Timeout`] if it is still incomplete at the deadline
    /// - [`StorageError::Store`] if the store cannot be queried
    pub async fn wait_for_resource(
        &self,
        resource_id: &str,
        artifact: Artifact,
        timeout: Option<Duration>,
    ) -> Result<(), StorageError> {
        let id = ResourceId::parse(resource_id)?;
        let timeout = timeout.unwrap_or(self.default_timeout);
        let start = self.clock.now();
        let max_attempts = self.poll.max_attempts.max(1);

        let mut attempt = 1;
        loop {
            match self.check_resource(&id, artifact).await? {
                ResourceState::Available => return Ok(()),
                ResourceState::Missing => {
                    return Err(StorageError::ResourceNotFound {
                        resource_id: id.to_string(),
                    });
                }
                ResourceState::Pending | ResourceState::Verifying => {}
            }

            let waited = (self.clock.now() - start).to_std().unwrap_or_default();
            if waited >= timeout || attempt >= max_attempts {
                return Err(StorageError::Timeout {
                    resource_id: id.to_string(),
                    artifact,
                    waited,
                });
            }

            let delay = self.poll.next_delay(attempt).min(timeout - waited);
            log::debug!("{id} ({artifact}) not available yet, checking again in {delay:.1?}");
            self.clock.sleep(delay).await;
            attempt += 1;
        }
    }

    /// Forgets cached positive results for `id`.
    pub fn invalidate(&self, id: &ResourceId) {
        let mut available = self.lock_available();
        for artifact in Artifact::ALL {
            available.pop(&(id.clone(), *artifact));
        }
    }

    /// Number of positive results currently remembered.
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.lock_available().len()
    }

    fn is_cached(&self, id: &ResourceId, artifact: Artifact, now: DateTime<Utc>) -> bool {
        let mut available = self.lock_available();
        let key = (id.clone(), artifact);
        let Some(checked) = available.get(&key) else {
            return false;
        };
        let fresh = is_fresh(*checked, now, self.cache_ttl);
        if !fresh {
            available.pop(&key);
        }
        fresh
    }

    fn lock_available(&self) -> MutexGuard<'_, AvailableCache> {
        self.available.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_fresh(checked: DateTime<Utc>, now: DateTime<Utc>, ttl: Duration) -> bool {
    (now - checked).to_std().is_ok_and(|age| age < ttl)
}

fn purge(available: &mut AvailableCache, now: DateTime<Utc>, ttl: Duration) -> usize {
    let stale: Vec<_> = available
        .iter()
        .filter(|(_, checked)| !is_fresh(**checked, now, ttl))
        .map(|(key, _)| key.clone())
        .collect();
    for key in &stale {
        available.pop(key);
    }
    stale.len()
}

fn capacity(entries: usize) -> NonZeroUsize {
    NonZeroUsize::new(entries).unwrap_or(NonZeroUsize::MIN)
}

#[cfg(test)]
mod tests {
    use dcor_storage_models::ResourceInfo;

    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::clock::ManualClock;
    use crate::config::BucketNaming;
    use crate::facade::StoreClient;
    use crate::memory::MemoryStore;
    use crate::presign::PresignCache;

    const RID: &str = "bd0fa0a6-4b8a-4c5b-9a3e-2f5e4d1c0b9a";
    const ORG: &str = "5a3c9a5e-7b8f-4c1d-9e2a-3f4b5c6d7e8f";

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        sync: AvailabilitySynchronizer,
    }

    fn rid() -> ResourceId {
        ResourceId::parse(RID).unwrap()
    }

    fn key() -> String {
        Artifact::Resource.object_key(&rid())
    }

    fn bucket() -> String {
        format!("circle-{ORG}")
    }

    fn fixture(size: Option<u64>) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let catalog = Arc::new(StaticCatalog::new());
        catalog.insert(ResourceInfo {
            id: rid(),
            organization_id: ORG.to_string(),
            size,
            private: true,
        });
        let client = StoreClient::new(store.clone(), BucketNaming::default())
            .with_clock(clock.clone());
        let presign = PresignCache::with_clock(store.clone(), clock.clone());
        let resources = ResourceStore::new(
            Arc::new(client),
            catalog,
            Arc::new(presign),
            "https://s3.example.org",
        );
        Fixture {
            clock,
            store,
            sync: AvailabilitySynchronizer::new(Arc::new(resources)),
        }
    }

    #[tokio::test]
    async fn reports_resource_states() {
        let f = fixture(Some(4));
        assert_eq!(
            f.sync.check_resource(&rid(), Artifact::Resource).await.unwrap(),
            ResourceState::Pending
        );
        f.store.insert_object(&bucket(), &key(), b"ab".to_vec());
        assert_eq!(
            f.sync.check_resource(&rid(), Artifact::Resource).await.unwrap(),
            ResourceState::Verifying
        );
        f.store.insert_object(&bucket(), &key(), b"abcd".to_vec());
        assert_eq!(
            f.sync.check_resource(&rid(), Artifact::Resource).await.unwrap(),
            ResourceState::Available
        );

        let unknown = ResourceId::parse("0f1e2d3c-4b5a-4968-8776-655443322110").unwrap();
        assert_eq!(
            f.sync.check_resource(&unknown, Artifact::Resource).await.unwrap(),
            ResourceState::Missing
        );
    }

    #[tokio::test]
    async fn returns_once_available() {
        let f = fixture(None);
        f.store.insert_object(&bucket(), &key(), b"abc".to_vec());
        f.sync
            .wait_for_resource(RID, Artifact::Resource, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn times_out_when_bytes_never_appear() {
        let f = fixture(Some(3));
        let start = f.clock.now();
        let err = f
            .sync
            .wait_for_resource(RID, Artifact::Resource, Some(Duration::from_secs(10)))
            .await
            .unwrap_err();

        let StorageError::Timeout { waited, .. } = err else {
            panic!("expected a timeout, got {err:?}");
        };
        assert_eq!(waited, Duration::from_secs(10));
        assert_eq!(f.clock.now() - start, chrono::Duration::seconds(10));
    }

    #[tokio::test]
    async fn polls_with_increasing_intervals() {
        let f = fixture(Some(3));
        f.sync
            .wait_for_resource(RID, Artifact::Resource, Some(Duration::from_secs(3)))
            .await
            .unwrap_err();
        // 0.5 s + 0.75 s + 1.125 s + 0.625 s (clamped to the deadline)
        assert_eq!(f.store.counts().head_object, 5);
    }

    #[tokio::test]
    async fn zero_delay_policy_is_bounded_by_attempts() {
        let f = fixture(Some(3));
        let sync = f.sync.with_poll_policy(RetryPolicy::immediate(4));
        let err = sync
            .wait_for_resource(RID, Artifact::Resource, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Timeout { .. }));
        assert_eq!(f.store.counts().head_object, 4);
    }

    #[tokio::test]
    async fn invalid_ids_fail_fast() {
        let f = fixture(None);
        let err = f
            .sync
            .wait_for_resource("not-a-uuid", Artifact::Resource, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidInput(_)));
        assert_eq!(f.store.counts().head_object, 0);
    }

    #[tokio::test]
    async fn unknown_resources_are_not_found() {
        let f = fixture(None);
        let err = f
            .sync
            .wait_for_resource(
                "0f1e2d3c-4b5a-4968-8776-655443322110",
                Artifact::Resource,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ResourceNotFound { .. }));
    }

    #[tokio::test]
    async fn positive_results_are_cached_briefly() {
        let f = fixture(None);
        f.store.insert_object(&bucket(), &key(), b"abc".to_vec());
        f.sync.check_resource(&rid(), Artifact::Resource).await.unwrap();
        f.store.remove_object(&bucket(), &key());

        assert_eq!(
            f.sync.check_resource(&rid(), Artifact::Resource).await.unwrap(),
            ResourceState::Available
        );
        f.clock.advance(DEFAULT_CACHE_TTL);
        assert_eq!(
            f.sync.check_resource(&rid(), Artifact::Resource).await.unwrap(),
            ResourceState::Pending
        );
    }

    #[tokio::test]
    async fn invalidation_drops_cached_results() {
        let f = fixture(None);
        f.store.insert_object(&bucket(), &key(), b"abc".to_vec());
        f.sync.check_resource(&rid(), Artifact::Resource).await.unwrap();
        f.store.remove_object(&bucket(), &key());
        f.sync.invalidate(&rid());
        assert_eq!(
            f.sync.check_resource(&rid(), Artifact::Resource).await.unwrap(),
            ResourceState::Pending
        );
    }

    async fn cache_artifacts(f: &Fixture, artifacts: &[Artifact]) {
        for artifact in artifacts {
            f.store
                .insert_object(&bucket(), &artifact.object_key(&rid()), b"abc".to_vec());
            assert_eq!(
                f.sync.check_resource(&rid(), *artifact).await.unwrap(),
                ResourceState::Available
            );
        }
    }

    #[tokio::test]
    async fn stale_results_are_dropped_when_new_ones_arrive() {
        let f = fixture(None);
        cache_artifacts(
            &f,
            &[Artifact::Condensed, Artifact::Preview, Artifact::Logs],
        )
        .await;
        assert_eq!(f.sync.cached_len(), 3);

        f.clock.advance(DEFAULT_CACHE_TTL);
        cache_artifacts(&f, &[Artifact::Resource]).await;
        assert_eq!(f.sync.cached_len(), 1);
    }

    #[tokio::test]
    async fn cache_keeps_the_most_recent_results() {
        let f = fixture(None);
        let sync = f.sync.with_cache_capacity(2);
        let f = Fixture { sync, ..f };
        cache_artifacts(&f, Artifact::ALL).await;
        assert_eq!(f.sync.cached_len(), 2);

        for artifact in Artifact::ALL {
            f.store
                .remove_object(&bucket(), &artifact.object_key(&rid()));
        }
        assert_eq!(
            f.sync.check_resource(&rid(), Artifact::Logs).await.unwrap(),
            ResourceState::Available
        );
        assert_eq!(
            f.sync.check_resource(&rid(), Artifact::Resource).await.unwrap(),
            ResourceState::Pending
        );
    }
}
