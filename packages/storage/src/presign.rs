//! Presigned URL issuance with reuse of still-fresh URLs.
//!
//! Clients poll for upload URLs in bursts (retries, page reloads). Every
//! request for the same bucket, key, mode and lifetime is answered from the
//! cache while the cached URL still has at least
//! [`URL_REUSE_TOLERANCE_PERCENT`] of the requested lifetime left. Callers
//! get the true absolute expiry so they know when to ask again.
//!
//! The cache is bounded: expired entries are dropped whenever a new key is
//! added, and the least recently used entries go once
//! [`DEFAULT_CAPACITY`] (or the configured capacity) is reached.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dcor_storage_models::{PresignedUpload, URL_REUSE_TOLERANCE_PERCENT, UploadMode};
use lru::LruCache;

use crate::StorageError;
use crate::backend::{ObjectStore, PresignRequest};
use crate::clock::{Clock, SystemClock};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    bucket: String,
    key: String,
    mode: UploadMode,
    expires_in: Duration,
}

type Slot = Arc<tokio::sync::Mutex<Option<PresignedUpload>>>;

/// Default number of cached URL sets.
pub const DEFAULT_CAPACITY: usize = 4096;

/// Issues presigned URLs and memoizes them.
pub struct PresignCache {
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    slots: Mutex<LruCache<CacheKey, Slot>>,
}

impl std::fmt::Debug for PresignCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresignCache")
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

impl PresignCache {
    /// Creates an empty cache using the system clock.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Creates an empty cache using `clock`.
    #[must_use]
    pub fn with_clock(store: Arc<dyn ObjectStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            slots: Mutex::new(LruCache::new(capacity(DEFAULT_CAPACITY))),
        }
    }

    /// Limits the cache to `capacity` entries (at least one).
    #[must_use]
    pub fn with_capacity(self, entries: usize) -> Self {
        self.lock().resize(capacity(entries));
        self
    }

    /// Returns presigned URL(s) for `mode`, reusing a cached set if enough
    /// of its lifetime remains.
    ///
    /// For [`UploadMode::Multipart`] a new multipart session is created
    /// whenever the URLs are (re)generated.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidInput`] for a zero lifetime or a
    /// multipart request without parts, and [`StorageError::Store`] if the
    /// store fails to create the session or sign a request.
    pub async fn create_presigned_upload_url(
        &self,
        bucket: &str,
        key: &str,
        mode: UploadMode,
        expires_in: Duration,
    ) -> Result<PresignedUpload, StorageError> {
        if expires_in.is_zero() {
            return Err(StorageError::InvalidInput(
                "presigned URL lifetime must be positive".to_string(),
            ));
        }
        if mode == (UploadMode::Multipart { parts: 0 }) {
            return Err(StorageError::InvalidInput(format!(
                "multipart upload of s3://{bucket}/{key} needs at least one part"
            )));
        }

        let cache_key = CacheKey {
            bucket: bucket.to_string(),
            key: key.to_string(),
            mode,
            expires_in,
        };
        let slot = self.slot(&cache_key);
        let mut entry = slot.lock().await;

        let now = self.clock.now();
        if let Some(cached) = entry.as_ref()
            && is_reusable(cached, now, expires_in)
        {
            log::debug!("Reusing presigned URL for s3://{bucket}/{key}");
            return Ok(cached.clone());
        }

        let fresh = self.generate(&cache_key, now).await?;
        *entry = Some(fresh.clone());
        drop(entry);
        Ok(fresh)
    }

    /// Presigned `GET` URL, optionally forcing a download file name.
    ///
    /// # Errors
    ///
    /// See [`Self::create_presigned_upload_url`].
    pub async fn create_presigned_download_url(
        &self,
        bucket: &str,
        key: &str,
        filename: Option<&str>,
        expires_in: Duration,
    ) -> Result<String, StorageError> {
        let mode = UploadMode::Download {
            filename: filename.map(String::from),
        };
        let mut presigned = self
            .create_presigned_upload_url(bucket, key, mode, expires_in)
            .await?;
        presigned
            .urls
            .pop()
            .ok_or_else(|| StorageError::store("GetObject", bucket, key, "no URL was signed"))
    }

    /// Forgets all cached URLs for `bucket`/`key`, e.g. once an upload has
    /// completed.
    ///
    /// Waits for requests that are generating URLs for the same key, so the
    /// entries stay serialized per key.
    pub async fn invalidate(&self, bucket: &str, key: &str) {
        let slots: Vec<Slot> = self
            .lock()
            .iter()
            .filter(|(k, _)| k.bucket == bucket && k.key == key)
            .map(|(_, slot)| Arc::clone(slot))
            .collect();
        for slot in slots {
            slot.lock().await.take();
        }
    }

    /// Drops all idle entries that have expired or were invalidated.
    /// Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        purge(&mut self.lock(), now)
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, key: &CacheKey) -> Slot {
        let mut slots = self.lock();
        if let Some(slot) = slots.get(key) {
            return Arc::clone(slot);
        }

        let purged = purge(&mut slots, self.clock.now());
        if purged > 0 {
            log::debug!("Dropped {purged} expired presigned URL sets");
        }
        let slot = Slot::default();
        slots.put(key.clone(), Arc::clone(&slot));
        slot
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<CacheKey, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn generate(
        &self,
        cache_key: &CacheKey,
        now: DateTime<Utc>,
    ) -> Result<PresignedUpload, StorageError> {
        let CacheKey {
            bucket,
            key,
            mode,
            expires_in,
        } = cache_key;
        let lifetime = chrono::Duration::from_std(*expires_in)
            .map_err(|e| StorageError::InvalidInput(format!("presigned URL lifetime: {e}")))?;
        let expires_at = now + lifetime;

        let presigned = match mode {
            UploadMode::Single => {
                let request = PresignRequest::PutObject {
                    bucket: bucket.clone(),
                    key: key.clone(),
                };
                PresignedUpload {
                    urls: vec![self.store.presign(&request, *expires_in).await?],
                    upload_id: None,
                    expires_at,
                }
            }
            UploadMode::Download { filename } => {
                let request = PresignRequest::GetObject {
                    bucket: bucket.clone(),
                    key: key.clone(),
                    filename: filename.clone(),
                };
                PresignedUpload {
                    urls: vec![self.store.presign(&request, *expires_in).await?],
                    upload_id: None,
                    expires_at,
                }
            }
            UploadMode::Multipart { parts } => {
                let upload_id = self.store.create_multipart_upload(bucket, key).await?;
                let mut urls = Vec::new();
                for part_number in 1..=*parts {
                    let request = PresignRequest::UploadPart {
                        bucket: bucket.clone(),
                        key: key.clone(),
                        upload_id: upload_id.clone(),
                        part_number,
                    };
                    urls.push(self.store.presign(&request, *expires_in).await?);
                }
                log::info!(
                    "Started multipart upload {upload_id} for s3://{bucket}/{key} ({parts} parts)"
                );
                PresignedUpload {
                    urls,
                    upload_id: Some(upload_id),
                    expires_at,
                }
            }
        };

        Ok(presigned)
    }
}

fn capacity(entries: usize) -> NonZeroUsize {
    NonZeroUsize::new(entries).unwrap_or(NonZeroUsize::MIN)
}

/// Removes slots nobody else holds whose URL set is gone or expired.
fn purge(slots: &mut LruCache<CacheKey, Slot>, now: DateTime<Utc>) -> usize {
    let stale: Vec<CacheKey> = slots
        .iter()
        .filter(|(_, slot)| {
            Arc::strong_count(slot) == 1
                && slot
                    .try_lock()
                    .is_ok_and(|entry| entry.as_ref().is_none_or(|e| e.expires_at <= now))
        })
        .map(|(key, _)| key.clone())
        .collect();
    for key in &stale {
        slots.pop(key);
    }
    stale.len()
}

/// Whether `cached` still has at least [`URL_REUSE_TOLERANCE_PERCENT`] of
/// `expires_in` left at `now`.
fn is_reusable(cached: &PresignedUpload, now: DateTime<Utc>, expires_in: Duration) -> bool {
    let threshold = expires_in * URL_REUSE_TOLERANCE_PERCENT / 100;
    (cached.expires_at - now)
        .to_std()
        .is_ok_and(|remaining| !remaining.is_zero() && remaining >= threshold)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::MemoryStore;

    const HOUR: Duration = Duration::from_secs(3600);

    fn setup() -> (Arc<MemoryStore>, Arc<ManualClock>, PresignCache) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        store.insert_bucket("b");
        let cache = PresignCache::with_clock(store.clone(), clock.clone());
        (store, clock, cache)
    }

    #[tokio::test]
    async fn reuses_urls_within_ninety_percent_of_lifetime() {
        let (store, clock, cache) = setup();
        let first = cache
            .create_presigned_upload_url("b", "k", UploadMode::Single, HOUR)
            .await
            .unwrap();
        assert_eq!(first.expires_at, clock.now() + chrono::Duration::hours(1));

        clock.advance(HOUR * 9 / 10);
        let second = cache
            .create_presigned_upload_url("b", "k", UploadMode::Single, HOUR)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(store.counts().presign, 1);
    }

    #[tokio::test]
    async fn regenerates_past_the_reuse_threshold() {
        let (store, clock, cache) = setup();
        let first = cache
            .create_presigned_upload_url("b", "k", UploadMode::Single, HOUR)
            .await
            .unwrap();

        clock.advance(HOUR * 9 / 10 + Duration::from_secs(1));
        let second = cache
            .create_presigned_upload_url("b", "k", UploadMode::Single, HOUR)
            .await
            .unwrap();
        assert!(second.expires_at > first.expires_at);
        assert_ne!(first.urls, second.urls);
        assert_eq!(store.counts().presign, 2);
    }

    #[tokio::test]
    async fn modes_and_lifetimes_are_cached_separately() {
        let (store, _clock, cache) = setup();
        cache
            .create_presigned_upload_url("b", "k", UploadMode::Single, HOUR)
            .await
            .unwrap();
        cache
            .create_presigned_upload_url("b", "k", UploadMode::Single, HOUR * 2)
            .await
            .unwrap();
        cache
            .create_presigned_download_url("b", "k", Some("data.rtdc"), HOUR)
            .await
            .unwrap();
        assert_eq!(cache.len(), 3);
        assert_eq!(store.counts().presign, 3);
    }

    #[tokio::test]
    async fn multipart_mode_creates_a_session() {
        let (store, _clock, cache) = setup();
        let presigned = cache
            .create_presigned_upload_url("b", "k", UploadMode::Multipart { parts: 3 }, HOUR)
            .await
            .unwrap();

        assert!(presigned.is_multipart());
        assert_eq!(presigned.urls.len(), 3);
        assert!(presigned.urls[2].contains("partNumber=3"));
        let upload_id = presigned.upload_id.clone().unwrap();
        assert!(presigned.urls.iter().all(|url| url.contains(&upload_id)));
        assert_eq!(store.open_upload_ids("b"), vec![upload_id]);

        // Reuse does not open another session.
        cache
            .create_presigned_upload_url("b", "k", UploadMode::Multipart { parts: 3 }, HOUR)
            .await
            .unwrap();
        assert_eq!(store.counts().create_multipart_upload, 1);
    }

    #[tokio::test]
    async fn download_urls_carry_the_file_name() {
        let (_store, _clock, cache) = setup();
        let url = cache
            .create_presigned_download_url("b", "k", Some("data.rtdc"), HOUR)
            .await
            .unwrap();
        assert!(url.contains("op=GetObject"));
        assert!(url.contains("filename=data.rtdc"));
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_url() {
        let (store, _clock, cache) = setup();
        let cache = Arc::new(cache);
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    cache
                        .create_presigned_upload_url("b", "k", UploadMode::Single, HOUR)
                        .await
                        .unwrap()
                })
            })
            .collect();
        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }
        assert!(results.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.counts().presign, 1);
    }

    #[tokio::test]
    async fn rejects_invalid_requests() {
        let (_store, _clock, cache) = setup();
        let err = cache
            .create_presigned_upload_url("b", "k", UploadMode::Single, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidInput(_)));
        let err = cache
            .create_presigned_upload_url("b", "k", UploadMode::Multipart { parts: 0 }, HOUR)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn invalidation_forces_regeneration() {
        let (store, _clock, cache) = setup();
        cache
            .create_presigned_upload_url("b", "k", UploadMode::Single, HOUR)
            .await
            .unwrap();
        cache.invalidate("b", "k").await;
        assert_eq!(cache.purge_expired(), 1);

        cache
            .create_presigned_upload_url("b", "k", UploadMode::Single, HOUR)
            .await
            .unwrap();
        assert_eq!(store.counts().presign, 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn purging_drops_only_expired_entries() {
        let (_store, clock, cache) = setup();
        cache
            .create_presigned_upload_url("b", "k", UploadMode::Single, HOUR)
            .await
            .unwrap();
        cache
            .create_presigned_upload_url("b", "other", UploadMode::Single, HOUR * 2)
            .await
            .unwrap();

        clock.advance(HOUR - Duration::from_secs(1));
        assert_eq!(cache.purge_expired(), 0);
        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.purge_expired(), 1);
        clock.advance(HOUR);
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn expired_entries_go_when_new_keys_arrive() {
        let (_store, clock, cache) = setup();
        for i in 0..1000 {
            cache
                .create_presigned_upload_url("b", &format!("k{i}"), UploadMode::Single, HOUR)
                .await
                .unwrap();
        }
        assert_eq!(cache.len(), 1000);

        clock.advance(Duration::from_secs(86_400));
        cache
            .create_presigned_upload_url("b", "fresh", UploadMode::Single, HOUR)
            .await
            .unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn capacity_bounds_live_entries() {
        let (store, _clock, cache) = setup();
        let cache = cache.with_capacity(2);
        for key in ["a", "b", "c"] {
            cache
                .create_presigned_upload_url("b", key, UploadMode::Single, HOUR)
                .await
                .unwrap();
        }
        assert_eq!(cache.len(), 2);

        // "a" was least recently used and is signed again.
        cache
            .create_presigned_upload_url("b", "a", UploadMode::Single, HOUR)
            .await
            .unwrap();
        assert_eq!(store.counts().presign, 4);
    }

    #[tokio::test]
    async fn invalidation_waits_for_the_slot_holder() {
        let (store, _clock, cache) = setup();
        let cache = Arc::new(cache);
        cache
            .create_presigned_upload_url("b", "k", UploadMode::Single, HOUR)
            .await
            .unwrap();
        let key = CacheKey {
            bucket: "b".to_string(),
            key: "k".to_string(),
            mode: UploadMode::Single,
            expires_in: HOUR,
        };
        let slot = cache.slot(&key);
        let guard = slot.lock().await;

        let invalidation = tokio::spawn({
            let cache = cache.clone();
            async move { cache.invalidate("b", "k").await }
        });
        tokio::task::yield_now().await;
        assert!(!invalidation.is_finished());
        assert!(Arc::ptr_eq(&cache.slot(&key), &slot));

        drop(guard);
        invalidation.await.unwrap();
        assert!(Arc::ptr_eq(&cache.slot(&key), &slot));
        assert!(slot.lock().await.is_none());

        cache
            .create_presigned_upload_url("b", "k", UploadMode::Single, HOUR)
            .await
            .unwrap();
        assert_eq!(store.counts().presign, 2);
    }
}
