//! The object-store port.
//!
//! [`ObjectStore`] is the complete set of S3 operations the storage layer
//! relies on. Everything above it (facade, uploads, presigning, handles) is
//! written against this trait so that it can run against a real endpoint
//! ([`crate::s3::S3Backend`]) or in memory ([`crate::memory::MemoryStore`]).

use std::ops::Range;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use dcor_storage_models::{BucketEntry, MultipartUploadInfo, ObjectEntry, ObjectMeta, Tag};

use crate::StorageError;

/// A contiguous byte range of a local file used as a request body.
///
/// Bodies are streamed from disk rather than buffered so that 1 GiB parts
/// do not have to be held in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSlice {
    /// Local file.
    pub path: PathBuf,
    /// First byte.
    pub offset: u64,
    /// Number of bytes.
    pub length: u64,
}

impl FileSlice {
    /// Creates a slice.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, offset: u64, length: u64) -> Self {
        Self {
            path: path.into(),
            offset,
            length,
        }
    }
}

/// One page of a paginated listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T, M = String> {
    /// Entries on this page.
    pub items: Vec<T>,
    /// Marker to request the next page with; `None` on the last page.
    pub next: Option<M>,
}

/// Continuation marker for `ListMultipartUploads`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadMarker {
    /// Key marker.
    pub key: String,
    /// Upload ID marker.
    pub upload_id: String,
}

/// A part that has been uploaded to a multipart session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    /// 1-based part number.
    pub part_number: u32,
    /// `ETag` returned by `UploadPart`.
    pub etag: String,
}

/// A request to presign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresignRequest {
    /// `GetObject`, optionally forcing a download file name.
    GetObject {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// Value for the `Content-Disposition` filename.
        filename: Option<String>,
    },
    /// `PutObject`.
    PutObject {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
    },
    /// `UploadPart` of an existing session.
    UploadPart {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// Session ID.
        upload_id: String,
        /// 1-based part number.
        part_number: u32,
    },
}

impl PresignRequest {
    /// S3 operation name, for error context.
    #[must_use]
    pub const fn operation(&self) -> &'static str {
        match self {
            Self::GetObject { .. } => "GetObject",
            Self::PutObject { .. } => "PutObject",
            Self::UploadPart { .. } => "UploadPart",
        }
    }

    /// Bucket and key the request targets.
    #[must_use]
    pub fn target(&self) -> (&str, &str) {
        match self {
            Self::GetObject { bucket, key, .. }
            | Self::PutObject { bucket, key }
            | Self::UploadPart { bucket, key, .. } => (bucket, key),
        }
    }
}

/// Low-level S3 operations.
///
/// Implementations map backend "not found" conditions as documented per
/// method and wrap every other failure in [`StorageError::Store`].
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// `HeadObject`. Returns `None` if the object or its bucket is missing.
    async fn head_object(&self, bucket: &str, key: &str)
    -> Result<Option<ObjectMeta>, StorageError>;

    /// Ranged `GetObject` (`range` is end-exclusive). Ranges reaching past
    /// the end of the object are truncated; a range starting at or after
    /// the end yields no bytes.
    ///
    /// Fails with [`StorageError::NotFound`] if the object is missing.
    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        range: Range<u64>,
    ) -> Result<Vec<u8>, StorageError>;

    /// `PutObject` with the bytes of `body`.
    async fn put_object(&self, bucket: &str, key: &str, body: FileSlice)
    -> Result<(), StorageError>;

    /// One page of `ListBuckets`.
    async fn list_buckets(
        &self,
        continuation: Option<String>,
    ) -> Result<Page<BucketEntry>, StorageError>;

    /// One page of `ListObjectsV2`.
    async fn list_objects(
        &self,
        bucket: &str,
        continuation: Option<String>,
    ) -> Result<Page<ObjectEntry>, StorageError>;

    /// `HeadBucket`.
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError>;

    /// `CreateBucket`. Returns `false` if we already own the bucket.
    async fn create_bucket(&self, bucket: &str) -> Result<bool, StorageError>;

    /// `PutBucketPolicy`.
    async fn put_bucket_policy(&self, bucket: &str, policy: &str) -> Result<(), StorageError>;

    /// `GetObjectTagging`. Returns `None` if the object or bucket is missing.
    async fn get_object_tagging(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<Vec<Tag>>, StorageError>;

    /// `PutObjectTagging` (replaces the whole tag set).
    async fn put_object_tagging(
        &self,
        bucket: &str,
        key: &str,
        tags: &[Tag],
    ) -> Result<(), StorageError>;

    /// `CreateMultipartUpload`. Returns the session ID.
    async fn create_multipart_upload(&self, bucket: &str, key: &str)
    -> Result<String, StorageError>;

    /// `UploadPart`. Returns the part's `ETag`.
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: FileSlice,
    ) -> Result<String, StorageError>;

    /// `CompleteMultipartUpload`.
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), StorageError>;

    /// `AbortMultipartUpload`. A session that no longer exists (already
    /// completed or aborted) is [`StorageError::NotFound`].
    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StorageError>;

    /// One page of `ListMultipartUploads`.
    async fn list_multipart_uploads(
        &self,
        bucket: &str,
        marker: Option<UploadMarker>,
    ) -> Result<Page<MultipartUploadInfo, UploadMarker>, StorageError>;

    /// Presigns `request` for `expires_in`.
    async fn presign(
        &self,
        request: &PresignRequest,
        expires_in: Duration,
    ) -> Result<String, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presign_requests_report_their_target() {
        let request = PresignRequest::UploadPart {
            bucket: "circle-a".to_string(),
            key: "resource/abc".to_string(),
            upload_id: "u1".to_string(),
            part_number: 3,
        };
        assert_eq!(request.operation(), "UploadPart");
        assert_eq!(request.target(), ("circle-a", "resource/abc"));
    }
}
