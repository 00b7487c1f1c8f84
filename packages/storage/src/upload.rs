//! Server-side uploads and presigned URLs for client-side uploads.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dcor_storage_models::{MULTIPART_PART_SIZE, MULTIPART_THRESHOLD, PresignedUpload, UploadMode};

use crate::StorageError;
use crate::backend::{CompletedPart, FileSlice};
use crate::checksum::{compute_checksum, sha256_file};
use crate::facade::StoreClient;
use crate::presign::PresignCache;

/// Options for [`Uploader::upload_file`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOptions {
    /// Replace an existing object. Without it, an occupied key fails the
    /// upload before any bytes are sent.
    pub override_existing: bool,
    /// Compare the SHA-256 of the stored object with the local file.
    pub verify_checksum: bool,
    /// Leave the object private. Otherwise it is tagged `public=true`.
    pub private: bool,
    /// Known SHA-256 of the local file; computed if absent.
    pub sha256: Option<String>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            override_existing: true,
            verify_checksum: true,
            private: true,
            sha256: None,
        }
    }
}

/// Uploads files to the object store.
#[derive(Debug)]
pub struct Uploader {
    client: Arc<StoreClient>,
    presign: Arc<PresignCache>,
    multipart_threshold: u64,
    part_size: u64,
}

impl Uploader {
    /// Creates an uploader.
    #[must_use]
    pub const fn new(client: Arc<StoreClient>, presign: Arc<PresignCache>) -> Self {
        Self {
            client,
            presign,
            multipart_threshold: MULTIPART_THRESHOLD,
            part_size: MULTIPART_PART_SIZE,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_part_size(mut self, part_size: u64) -> Self {
        self.multipart_threshold = part_size;
        self.part_size = part_size;
        self
    }

    /// Uploads `path` to `bucket`/`key` and returns the key.
    ///
    /// Files below 1 GiB are sent with one `PUT`; larger files go through a
    /// multipart session with 1 GiB parts uploaded one after another. A
    /// failed part aborts the session.
    ///
    /// The existence check for `override_existing == false` and the upload
    /// are not atomic: two concurrent uploads to the same key may both pass
    /// the check.
    ///
    /// # Errors
    ///
    /// - [`StorageError::AlreadyExists`] if the key is taken and overriding
    ///   is disabled
    /// - [`StorageError::Integrity`] if the stored object does not match
    ///   the local file (the object is left in place)
    /// - [`StorageError::Io`] if the local file cannot be read
    /// - [`StorageError::Store`] if a request fails
    pub async fn upload_file(
        &self,
        path: &Path,
        bucket: &str,
        key: &str,
        options: &UploadOptions,
    ) -> Result<String, StorageError> {
        let size = tokio::fs::metadata(path).await?.len();

        if !options.override_existing && self.client.object_exists(bucket, key).await? {
            return Err(StorageError::AlreadyExists {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }

        let expected = if options.verify_checksum {
            Some(match &options.sha256 {
                Some(sha256) => sha256.to_ascii_lowercase(),
                None => sha256_file(path).await?,
            })
        } else {
            None
        };

        self.client.require_bucket(bucket).await?;

        log::info!(
            "Uploading {} ({size} bytes) to s3://{bucket}/{key}",
            path.display()
        );
        if size < self.multipart_threshold {
            self.client
                .store()
                .put_object(bucket, key, FileSlice::new(path, 0, size))
                .await?;
        } else {
            self.upload_multipart(path, size, bucket, key).await?;
        }
        self.presign.invalidate(bucket, key).await;

        if let Some(expected) = expected {
            let actual = compute_checksum(self.client.store(), bucket, key, Some(size)).await?;
            if actual != expected {
                return Err(StorageError::Integrity {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    expected,
                    actual,
                });
            }
        }

        if !options.private {
            self.client.make_object_public(bucket, key, false).await?;
        }

        Ok(key.to_string())
    }

    async fn upload_multipart(
        &self,
        path: &Path,
        size: u64,
        bucket: &str,
        key: &str,
    ) -> Result<(), StorageError> {
        let store = self.client.store();
        let upload_id = store.create_multipart_upload(bucket, key).await?;

        let result = async {
            let mut parts = Vec::new();
            let mut offset = 0;
            let mut part_number = 1;
            while offset < size {
                let length = self.part_size.min(size - offset);
                log::debug!("Uploading part {part_number} of s3://{bucket}/{key}");
                let etag = store
                    .upload_part(
                        bucket,
                        key,
                        &upload_id,
                        part_number,
                        FileSlice::new(path, offset, length),
                    )
                    .await?;
                parts.push(CompletedPart { part_number, etag });
                offset += length;
                part_number += 1;
            }
            store
                .complete_multipart_upload(bucket, key, &upload_id, &parts)
                .await
        }
        .await;

        if let Err(e) = &result {
            log::warn!("Multipart upload {upload_id} of s3://{bucket}/{key} failed: {e}");
            if let Err(abort) = store.abort_multipart_upload(bucket, key, &upload_id).await {
                log::warn!("Failed to abort multipart upload {upload_id}: {abort}");
            }
        }
        result
    }

    /// Presigned URL(s) for a client uploading `file_size` bytes to
    /// `bucket`/`key`: one `PUT` URL below 1 GiB, a multipart session with
    /// one URL per 1 GiB part above.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Store`] if the bucket cannot be provisioned
    /// or a request cannot be signed.
    pub async fn create_presigned_upload_urls(
        &self,
        bucket: &str,
        key: &str,
        file_size: u64,
        expires_in: Duration,
    ) -> Result<PresignedUpload, StorageError> {
        self.client.require_bucket(bucket).await?;
        let mode = if file_size < self.multipart_threshold {
            UploadMode::Single
        } else {
            UploadMode::Multipart {
                parts: u32::try_from(file_size.div_ceil(self.part_size)).map_err(|_| {
                    StorageError::InvalidInput(format!("{file_size} bytes is too large"))
                })?,
            }
        };
        self.presign
            .create_presigned_upload_url(bucket, key, mode, expires_in)
            .await
    }

    /// Completes a multipart session started by
    /// [`Self::create_presigned_upload_urls`] once the client has uploaded
    /// every part, and forgets the session's cached URLs.
    ///
    /// # Errors
    ///
    /// See [`StoreClient::complete_multipart_upload`].
    pub async fn complete_presigned_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), StorageError> {
        self.client
            .complete_multipart_upload(bucket, key, upload_id, parts)
            .await?;
        self.presign.invalidate(bucket, key).await;
        Ok(())
    }
}
