//! Retrying convenience layer over an [`ObjectStore`].

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use dcor_storage_models::{BucketEntry, ObjectEntry, ObjectMeta, Tag};
use futures::Stream;

use crate::StorageError;
use crate::backend::{CompletedPart, ObjectStore};
use crate::clock::{Clock, SystemClock};
use crate::config::BucketNaming;
use crate::retry::RetryPolicy;

/// Object-store client used by everything that deals with resources.
pub struct StoreClient {
    store: Arc<dyn ObjectStore>,
    naming: BucketNaming,
    clock: Arc<dyn Clock>,
    tagging_retry: RetryPolicy,
    required_buckets: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for StoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreClient")
            .field("naming", &self.naming)
            .field("tagging_retry", &self.tagging_retry)
            .finish_non_exhaustive()
    }
}

impl StoreClient {
    /// Creates a client with the system clock and the default tagging
    /// retry policy.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, naming: BucketNaming) -> Self {
        Self {
            store,
            naming,
            clock: Arc::new(SystemClock),
            tagging_retry: RetryPolicy::tagging(),
            required_buckets: Mutex::new(HashSet::new()),
        }
    }

    /// Replaces the clock used for retry delays.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the retry policy for `PutObjectTagging`.
    #[must_use]
    pub fn with_tagging_retry(mut self, policy: RetryPolicy) -> Self {
        self.tagging_retry = policy;
        self
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &dyn ObjectStore {
        self.store.as_ref()
    }

    /// A shared reference to the underlying store.
    #[must_use]
    pub fn store_arc(&self) -> Arc<dyn ObjectStore> {
        Arc::clone(&self.store)
    }

    /// The bucket naming scheme.
    #[must_use]
    pub const fn naming(&self) -> &BucketNaming {
        &self.naming
    }

    /// The clock.
    #[must_use]
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Whether `key` exists in `bucket`.
    ///
    /// A missing bucket counts as a missing object.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Store`] for any failure other than absence.
    pub async fn object_exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        Ok(self.store.head_object(bucket, key).await?.is_some())
    }

    /// Metadata of `key`, or `None` if it (or its bucket) does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Store`] for any failure other than absence.
    pub async fn head_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectMeta>, StorageError> {
        self.store.head_object(bucket, key).await
    }

    /// Streams all buckets, paginating transparently.
    ///
    /// With `circles_only`, buckets not following the circle naming scheme
    /// are skipped.
    pub fn iter_buckets(
        &self,
        circles_only: bool,
    ) -> impl Stream<Item = Result<BucketEntry, StorageError>> + Send + '_ {
        async_stream::try_stream! {
            let mut continuation = None;
            loop {
                let page = self.store.list_buckets(continuation.take()).await?;
                for bucket in page.items {
                    if !circles_only || self.naming.is_circle_bucket(&bucket.name) {
                        yield bucket;
                    }
                }
                match page.next {
                    Some(next) => continuation = Some(next),
                    None => break,
                }
            }
        }
    }

    /// Streams all objects of `bucket`, paginating transparently.
    ///
    /// With `circles_only`, the stream is empty unless `bucket` follows the
    /// circle naming scheme.
    pub fn iter_bucket_objects<'a>(
        &'a self,
        bucket: &'a str,
        circles_only: bool,
    ) -> impl Stream<Item = Result<ObjectEntry, StorageError>> + Send + 'a {
        async_stream::try_stream! {
            if !circles_only || self.naming.is_circle_bucket(bucket) {
                let mut continuation = None;
                loop {
                    let page = self.store.list_objects(bucket, continuation.take()).await?;
                    for object in page.items {
                        yield object;
                    }
                    match page.next {
                        Some(next) => continuation = Some(next),
                        None => break,
                    }
                }
            }
        }
    }

    /// Tags of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the object does not exist.
    pub async fn get_object_tagging(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Vec<Tag>, StorageError> {
        self.store
            .get_object_tagging(bucket, key)
            .await?
            .ok_or_else(|| StorageError::not_found(bucket, key))
    }

    /// Replaces the tags of `key`, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns the last error once the retry policy is exhausted.
    pub async fn set_object_tagging(
        &self,
        bucket: &str,
        key: &str,
        tags: &[Tag],
    ) -> Result<(), StorageError> {
        let what = format!("tagging s3://{bucket}/{key}");
        self.tagging_retry
            .run(self.clock.as_ref(), &what, || {
                self.store.put_object_tagging(bucket, key, tags)
            })
            .await
    }

    /// Adds the `public=true` tag to `key`, keeping existing tags.
    ///
    /// Returns whether the object was found.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the object does not exist and
    /// `missing_ok` is `false`.
    pub async fn make_object_public(
        &self,
        bucket: &str,
        key: &str,
        missing_ok: bool,
    ) -> Result<bool, StorageError> {
        let Some(mut tags) = self.store.get_object_tagging(bucket, key).await? else {
            if missing_ok {
                log::debug!("s3://{bucket}/{key} does not exist, not making it public");
                return Ok(false);
            }
            return Err(StorageError::not_found(bucket, key));
        };

        let public = Tag::public();
        if tags.contains(&public) {
            return Ok(true);
        }
        tags.retain(|t| t.key != public.key);
        tags.push(public);

        match self.set_object_tagging(bucket, key, &tags).await {
            Ok(()) => {
                log::info!("Made s3://{bucket}/{key} public");
                Ok(true)
            }
            Err(e) if e.is_not_found() && missing_ok => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Finalizes a multipart session whose parts were uploaded through
    /// presigned URLs. `parts` are sorted by part number before sending.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidInput`] if `parts` is empty or lists a
    /// part number twice, and [`StorageError::Store`] if the store rejects
    /// the completion (e.g. unknown session or wrong `ETag`).
    pub async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), StorageError> {
        let mut parts = parts.to_vec();
        parts.sort_by_key(|p| p.part_number);
        if parts.is_empty() || parts.windows(2).any(|w| w[0].part_number == w[1].part_number) {
            return Err(StorageError::InvalidInput(format!(
                "multipart upload {upload_id} of s3://{bucket}/{key} needs distinct parts"
            )));
        }

        self.store
            .complete_multipart_upload(bucket, key, upload_id, &parts)
            .await?;
        log::info!(
            "Completed multipart upload {upload_id} of s3://{bucket}/{key} ({} parts)",
            parts.len()
        );
        Ok(())
    }

    /// Makes sure `bucket` exists and grants anonymous read access to
    /// objects tagged `public=true`. Only the first call per bucket talks to
    /// the store.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Store`] if creating the bucket or installing
    /// the policy fails.
    pub async fn require_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        if self.is_required(bucket) {
            return Ok(());
        }

        if !self.store.bucket_exists(bucket).await? {
            if self.store.create_bucket(bucket).await? {
                log::info!("Created bucket {bucket}");
            }
            self.store
                .put_bucket_policy(bucket, &public_read_policy(bucket))
                .await?;
        }

        if let Ok(mut required) = self.required_buckets.lock() {
            required.insert(bucket.to_string());
        }
        Ok(())
    }

    fn is_required(&self, bucket: &str) -> bool {
        self.required_buckets
            .lock()
            .is_ok_and(|required| required.contains(bucket))
    }
}

/// Bucket policy allowing anonymous downloads of objects tagged
/// `public=true`.
#[must_use]
pub fn public_read_policy(bucket: &str) -> String {
    serde_json::json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Sid": "AllowPublicResourcesToBeDownloaded",
            "Effect": "Allow",
            "Principal": {"AWS": "*"},
            "Action": ["s3:GetObject"],
            "Resource": [format!("arn:aws:s3:::{bucket}/*")],
            "Condition": {
                "StringEquals": {"s3:ExistingObjectTag/public": "true"}
            }
        }]
    })
    .to_string()
}
