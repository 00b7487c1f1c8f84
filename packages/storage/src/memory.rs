//! In-memory [`ObjectStore`].
//!
//! Behaves like a single-node S3 endpoint: buckets, objects, tags, bucket
//! policies and multipart sessions. Used by the test suites and for dry runs.
//! A few knobs inject faults (flaky tagging, corrupted uploads, failing reads)
//! and [`MemoryStore::counts`] reports how many requests of each kind were
//! served.

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dcor_storage_models::{BucketEntry, MultipartUploadInfo, ObjectEntry, ObjectMeta, Tag};
use sha2::{Digest, Sha256};

use crate::StorageError;
use crate::backend::{CompletedPart, FileSlice, ObjectStore, Page, PresignRequest, UploadMarker};
use crate::clock::{Clock, SystemClock};

/// Number of requests served, per operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RequestCounts {
    /// `HeadObject` calls.
    pub head_object: u64,
    /// Ranged `GetObject` calls.
    pub get_range: u64,
    /// `PutObject` calls.
    pub put_object: u64,
    /// `CreateMultipartUpload` calls.
    pub create_multipart_upload: u64,
    /// `UploadPart` calls.
    pub upload_part: u64,
    /// `CompleteMultipartUpload` calls.
    pub complete_multipart_upload: u64,
    /// `AbortMultipartUpload` calls.
    pub abort_multipart_upload: u64,
    /// `PutObjectTagging` calls (including injected failures).
    pub put_object_tagging: u64,
    /// Presigned URLs generated.
    pub presign: u64,
}

#[derive(Debug)]
struct MemObject {
    data: Vec<u8>,
    tags: Vec<Tag>,
    last_modified: DateTime<Utc>,
}

#[derive(Debug)]
struct MemUpload {
    key: String,
    initiated: DateTime<Utc>,
    parts: BTreeMap<u32, (String, Vec<u8>)>,
}

#[derive(Debug)]
struct MemBucket {
    created: DateTime<Utc>,
    policy: Option<String>,
    objects: BTreeMap<String, MemObject>,
    uploads: BTreeMap<String, MemUpload>,
    stale_listings: BTreeMap<String, (String, DateTime<Utc>)>,
}

impl MemBucket {
    fn new(created: DateTime<Utc>) -> Self {
        Self {
            created,
            policy: None,
            objects: BTreeMap::new(),
            uploads: BTreeMap::new(),
            stale_listings: BTreeMap::new(),
        }
    }
}

/// In-memory S3 stand-in.
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    buckets: Mutex<BTreeMap<String, MemBucket>>,
    counts: Mutex<RequestCounts>,
    page_size: usize,
    next_id: AtomicU64,
    corrupt_uploads: AtomicBool,
    fail_reads: AtomicBool,
    fail_heads: AtomicBool,
    tagging_failures: AtomicU32,
    overwrite_before_read: Mutex<Option<Vec<u8>>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    /// Creates an empty store using the system clock for timestamps.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty store that timestamps objects and sessions with
    /// `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            buckets: Mutex::new(BTreeMap::new()),
            counts: Mutex::new(RequestCounts::default()),
            page_size: 1000,
            next_id: AtomicU64::new(1),
            corrupt_uploads: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            fail_heads: AtomicBool::new(false),
            tagging_failures: AtomicU32::new(0),
            overwrite_before_read: Mutex::new(None),
        }
    }

    /// Limits listing pages to `page_size` entries.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Stores an object directly, creating the bucket if needed.
    pub fn insert_object(&self, bucket: &str, key: &str, data: impl Into<Vec<u8>>) {
        let now = self.clock.now();
        self.lock()
            .entry(bucket.to_string())
            .or_insert_with(|| MemBucket::new(now))
            .objects
            .insert(
                key.to_string(),
                MemObject {
                    data: data.into(),
                    tags: Vec::new(),
                    last_modified: now,
                },
            );
    }

    /// Creates an empty bucket directly.
    pub fn insert_bucket(&self, bucket: &str) {
        let now = self.clock.now();
        self.lock()
            .entry(bucket.to_string())
            .or_insert_with(|| MemBucket::new(now));
    }

    /// Removes an object directly.
    pub fn remove_object(&self, bucket: &str, key: &str) {
        if let Some(b) = self.lock().get_mut(bucket) {
            b.objects.remove(key);
        }
    }

    /// Opens a multipart session with an explicit start time, creating the
    /// bucket if needed. Returns the session ID.
    pub fn insert_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        initiated: DateTime<Utc>,
    ) -> String {
        let upload_id = self.next_upload_id();
        let now = self.clock.now();
        self.lock()
            .entry(bucket.to_string())
            .or_insert_with(|| MemBucket::new(now))
            .uploads
            .insert(
                upload_id.clone(),
                MemUpload {
                    key: key.to_string(),
                    initiated,
                    parts: BTreeMap::new(),
                },
            );
        upload_id
    }

    /// Makes `ListMultipartUploads` report a session that has already been
    /// completed or aborted, as an eventually consistent listing may.
    pub fn insert_stale_upload_listing(
        &self,
        bucket: &str,
        key: &str,
        initiated: DateTime<Utc>,
    ) -> String {
        let upload_id = self.next_upload_id();
        let now = self.clock.now();
        self.lock()
            .entry(bucket.to_string())
            .or_insert_with(|| MemBucket::new(now))
            .stale_listings
            .insert(upload_id.clone(), (key.to_string(), initiated));
        upload_id
    }

    /// Bytes of an object.
    #[must_use]
    pub fn object_data(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.lock()
            .get(bucket)
            .and_then(|b| b.objects.get(key))
            .map(|o| o.data.clone())
    }

    /// Tags of an object.
    #[must_use]
    pub fn object_tags(&self, bucket: &str, key: &str) -> Option<Vec<Tag>> {
        self.lock()
            .get(bucket)
            .and_then(|b| b.objects.get(key))
            .map(|o| o.tags.clone())
    }

    /// Policy installed on a bucket.
    #[must_use]
    pub fn bucket_policy(&self, bucket: &str) -> Option<String> {
        self.lock().get(bucket).and_then(|b| b.policy.clone())
    }

    /// IDs of the open multipart sessions in a bucket.
    #[must_use]
    pub fn open_upload_ids(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .get(bucket)
            .map(|b| b.uploads.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Flips one byte of every object written from now on.
    pub fn corrupt_uploads(&self, enabled: bool) {
        self.corrupt_uploads.store(enabled, Ordering::SeqCst);
    }

    /// Makes every ranged read fail with a store error.
    pub fn fail_reads(&self, enabled: bool) {
        self.fail_reads.store(enabled, Ordering::SeqCst);
    }

    /// Makes every `HeadObject` fail with an access-denied store error.
    pub fn fail_heads(&self, enabled: bool) {
        self.fail_heads.store(enabled, Ordering::SeqCst);
    }

    /// Replaces the data of whatever object the next ranged read targets,
    /// as if another writer overwrote it in between.
    pub fn overwrite_before_next_read(&self, data: impl Into<Vec<u8>>) {
        *self
            .overwrite_before_read
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(data.into());
    }

    /// Makes the next `n` `PutObjectTagging` calls fail with a store error.
    pub fn fail_next_taggings(&self, n: u32) {
        self.tagging_failures.store(n, Ordering::SeqCst);
    }

    /// Requests served so far.
    #[must_use]
    pub fn counts(&self) -> RequestCounts {
        *self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn count(&self, f: impl FnOnce(&mut RequestCounts)) {
        f(&mut self.counts.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, MemBucket>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_upload_id(&self) -> String {
        format!("upload-{:06}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn maybe_corrupt(&self, mut data: Vec<u8>) -> Vec<u8> {
        if self.corrupt_uploads.load(Ordering::SeqCst)
            && let Some(byte) = data.first_mut()
        {
            *byte ^= 0xff;
        }
        data
    }

    fn paginate<T: Clone>(&self, items: &[T], continuation: Option<&str>) -> Page<T> {
        let start = continuation.and_then(|c| c.parse().ok()).unwrap_or(0usize);
        let end = (start + self.page_size).min(items.len());
        Page {
            items: items.get(start..end).unwrap_or_default().to_vec(),
            next: (end < items.len()).then(|| end.to_string()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads a slice of a local file on a blocking thread.
async fn read_slice(slice: FileSlice) -> Result<Vec<u8>, StorageError> {
    tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
        let mut file = std::fs::File::open(&slice.path)?;
        file.seek(SeekFrom::Start(slice.offset))?;
        let capacity = usize::try_from(slice.length).map_err(std::io::Error::other)?;
        let mut data = Vec::with_capacity(capacity);
        file.take(slice.length).read_to_end(&mut data)?;
        Ok(data)
    })
    .await
    .map_err(std::io::Error::other)?
    .map_err(StorageError::from)
}

fn etag_of(data: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(data));
    digest[..32].to_string()
}

fn no_such_bucket(operation: &'static str, bucket: &str, key: &str) -> StorageError {
    StorageError::store(operation, bucket, key, "NoSuchBucket")
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn head_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectMeta>, StorageError> {
        self.count(|c| c.head_object += 1);
        if self.fail_heads.load(Ordering::SeqCst) {
            return Err(StorageError::store("HeadObject", bucket, key, "AccessDenied (403)"));
        }
        Ok(self
            .lock()
            .get(bucket)
            .and_then(|b| b.objects.get(key))
            .map(|o| ObjectMeta {
                size: o.data.len() as u64,
                etag: Some(etag_of(&o.data)),
                last_modified: Some(o.last_modified),
            }))
    }

    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        range: Range<u64>,
    ) -> Result<Vec<u8>, StorageError> {
        self.count(|c| c.get_range += 1);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::store(
                "GetObject",
                bucket,
                key,
                "connection reset",
            ));
        }
        let overwrite = self
            .overwrite_before_read
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let mut buckets = self.lock();
        let object = buckets
            .get_mut(bucket)
            .and_then(|b| b.objects.get_mut(key))
            .ok_or_else(|| StorageError::not_found(bucket, key))?;
        if let Some(data) = overwrite {
            object.data = data;
        }
        let len = object.data.len();
        let start = usize::try_from(range.start).unwrap_or(usize::MAX).min(len);
        let end = usize::try_from(range.end).unwrap_or(usize::MAX).min(len);
        Ok(object.data.get(start..end).unwrap_or_default().to_vec())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: FileSlice,
    ) -> Result<(), StorageError> {
        self.count(|c| c.put_object += 1);
        let data = self.maybe_corrupt(read_slice(body).await?);
        let now = self.clock.now();
        let mut buckets = self.lock();
        let b = buckets
            .get_mut(bucket)
            .ok_or_else(|| no_such_bucket("PutObject", bucket, key))?;
        b.objects.insert(
            key.to_string(),
            MemObject {
                data,
                tags: Vec::new(),
                last_modified: now,
            },
        );
        Ok(())
    }

    async fn list_buckets(
        &self,
        continuation: Option<String>,
    ) -> Result<Page<BucketEntry>, StorageError> {
        let all: Vec<BucketEntry> = self
            .lock()
            .iter()
            .map(|(name, b)| BucketEntry {
                name: name.clone(),
                created: Some(b.created),
            })
            .collect();
        Ok(self.paginate(&all, continuation.as_deref()))
    }

    async fn list_objects(
        &self,
        bucket: &str,
        continuation: Option<String>,
    ) -> Result<Page<ObjectEntry>, StorageError> {
        let all: Vec<ObjectEntry> = self
            .lock()
            .get(bucket)
            .ok_or_else(|| no_such_bucket("ListObjectsV2", bucket, ""))?
            .objects
            .iter()
            .map(|(key, o)| ObjectEntry {
                bucket: bucket.to_string(),
                key: key.clone(),
                size: o.data.len() as u64,
                last_modified: Some(o.last_modified),
            })
            .collect();
        Ok(self.paginate(&all, continuation.as_deref()))
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError> {
        Ok(self.lock().contains_key(bucket))
    }

    async fn create_bucket(&self, bucket: &str) -> Result<bool, StorageError> {
        let now = self.clock.now();
        let mut buckets = self.lock();
        if buckets.contains_key(bucket) {
            return Ok(false);
        }
        buckets.insert(bucket.to_string(), MemBucket::new(now));
        Ok(true)
    }

    async fn put_bucket_policy(&self, bucket: &str, policy: &str) -> Result<(), StorageError> {
        self.lock()
            .get_mut(bucket)
            .ok_or_else(|| no_such_bucket("PutBucketPolicy", bucket, ""))?
            .policy = Some(policy.to_string());
        Ok(())
    }

    async fn get_object_tagging(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<Vec<Tag>>, StorageError> {
        Ok(self
            .lock()
            .get(bucket)
            .and_then(|b| b.objects.get(key))
            .map(|o| o.tags.clone()))
    }

    async fn put_object_tagging(
        &self,
        bucket: &str,
        key: &str,
        tags: &[Tag],
    ) -> Result<(), StorageError> {
        self.count(|c| c.put_object_tagging += 1);
        let pending_failure = self
            .tagging_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if pending_failure {
            return Err(StorageError::store(
                "PutObjectTagging",
                bucket,
                key,
                "tag propagation pending",
            ));
        }
        let mut buckets = self.lock();
        let object = buckets
            .get_mut(bucket)
            .and_then(|b| b.objects.get_mut(key))
            .ok_or_else(|| StorageError::not_found(bucket, key))?;
        object.tags = tags.to_vec();
        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<String, StorageError> {
        self.count(|c| c.create_multipart_upload += 1);
        let upload_id = self.next_upload_id();
        let now = self.clock.now();
        self.lock()
            .get_mut(bucket)
            .ok_or_else(|| no_such_bucket("CreateMultipartUpload", bucket, key))?
            .uploads
            .insert(
                upload_id.clone(),
                MemUpload {
                    key: key.to_string(),
                    initiated: now,
                    parts: BTreeMap::new(),
                },
            );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: FileSlice,
    ) -> Result<String, StorageError> {
        self.count(|c| c.upload_part += 1);
        let data = self.maybe_corrupt(read_slice(body).await?);
        let etag = etag_of(&data);
        let mut buckets = self.lock();
        let upload = buckets
            .get_mut(bucket)
            .and_then(|b| b.uploads.get_mut(upload_id))
            .filter(|u| u.key == key)
            .ok_or_else(|| StorageError::store("UploadPart", bucket, key, "NoSuchUpload"))?;
        upload.parts.insert(part_number, (etag.clone(), data));
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), StorageError> {
        self.count(|c| c.complete_multipart_upload += 1);
        let now = self.clock.now();
        let mut buckets = self.lock();
        let b = buckets
            .get_mut(bucket)
            .ok_or_else(|| no_such_bucket("CompleteMultipartUpload", bucket, key))?;
        let upload = b
            .uploads
            .get(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| {
                StorageError::store("CompleteMultipartUpload", bucket, key, "NoSuchUpload")
            })?;

        let mut data = Vec::new();
        for part in parts {
            match upload.parts.get(&part.part_number) {
                Some((etag, bytes)) if *etag == part.etag => data.extend_from_slice(bytes),
                _ => {
                    return Err(StorageError::store(
                        "CompleteMultipartUpload",
                        bucket,
                        key,
                        format!("InvalidPart {}", part.part_number),
                    ));
                }
            }
        }

        b.uploads.remove(upload_id);
        b.objects.insert(
            key.to_string(),
            MemObject {
                data,
                tags: Vec::new(),
                last_modified: now,
            },
        );
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StorageError> {
        self.count(|c| c.abort_multipart_upload += 1);
        let mut buckets = self.lock();
        let b = buckets
            .get_mut(bucket)
            .ok_or_else(|| no_such_bucket("AbortMultipartUpload", bucket, key))?;
        match b.uploads.get(upload_id) {
            Some(upload) if upload.key == key => {
                b.uploads.remove(upload_id);
                Ok(())
            }
            _ => Err(StorageError::not_found(bucket, key)),
        }
    }

    async fn list_multipart_uploads(
        &self,
        bucket: &str,
        marker: Option<UploadMarker>,
    ) -> Result<Page<MultipartUploadInfo, UploadMarker>, StorageError> {
        let buckets = self.lock();
        let b = buckets
            .get(bucket)
            .ok_or_else(|| no_such_bucket("ListMultipartUploads", bucket, ""))?;
        let mut all: Vec<MultipartUploadInfo> = b
            .uploads
            .iter()
            .map(|(upload_id, u)| MultipartUploadInfo {
                bucket: bucket.to_string(),
                key: u.key.clone(),
                upload_id: upload_id.clone(),
                initiated: u.initiated,
            })
            .chain(
                b.stale_listings
                    .iter()
                    .map(|(upload_id, (key, initiated))| MultipartUploadInfo {
                        bucket: bucket.to_string(),
                        key: key.clone(),
                        upload_id: upload_id.clone(),
                        initiated: *initiated,
                    }),
            )
            .collect();
        all.sort_by(|a, b| (&a.key, &a.upload_id).cmp(&(&b.key, &b.upload_id)));

        let start = marker.map_or(0, |m| {
            all.iter()
                .position(|u| (&u.key, &u.upload_id) > (&m.key, &m.upload_id))
                .unwrap_or(all.len())
        });
        let end = (start + self.page_size).min(all.len());
        let items = all[start..end].to_vec();
        let next = if end < all.len() {
            items.last().map(|u| UploadMarker {
                key: u.key.clone(),
                upload_id: u.upload_id.clone(),
            })
        } else {
            None
        };
        Ok(Page { items, next })
    }

    async fn presign(
        &self,
        request: &PresignRequest,
        expires_in: Duration,
    ) -> Result<String, StorageError> {
        self.count(|c| c.presign += 1);
        let serial = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (bucket, key) = request.target();
        let lifetime = i64::try_from(expires_in.as_secs()).unwrap_or(i64::MAX / 2);
        let expires = self.clock.now().timestamp().saturating_add(lifetime);
        let extra = match request {
            PresignRequest::GetObject {
                filename: Some(filename),
                ..
            } => format!("&filename={filename}"),
            PresignRequest::UploadPart {
                upload_id,
                part_number,
                ..
            } => format!("&uploadId={upload_id}&partNumber={part_number}"),
            PresignRequest::GetObject { filename: None, .. } | PresignRequest::PutObject { .. } => {
                String::new()
            }
        };
        Ok(format!(
            "memory://{bucket}/{key}?op={}&expires={expires}&sig={serial}{extra}",
            request.operation()
        ))
    }
}
