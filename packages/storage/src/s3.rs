//! [`ObjectStore`] backed by `aws-sdk-s3`.
//!
//! Works against any S3-compatible endpoint (`MinIO`, Ceph RGW, `OpenStack`
//! Swift, AWS). Path-style addressing is always used because most
//! self-hosted deployments do not serve virtual-hosted buckets.

use std::ops::Range;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_s3::config::{Credentials, StalledStreamProtectionConfig};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::{ByteStream, Length};
use aws_sdk_s3::types::{CompletedMultipartUpload, Tagging};
use chrono::{DateTime, Utc};
use dcor_storage_models::{BucketEntry, MultipartUploadInfo, ObjectEntry, ObjectMeta, Tag};

use crate::StorageError;
use crate::backend::{CompletedPart, FileSlice, ObjectStore, Page, PresignRequest, UploadMarker};
use crate::config::ObjectStoreConfig;

/// S3 client for DCOR object storage.
#[derive(Debug, Clone)]
pub struct S3Backend {
    client: aws_sdk_s3::Client,
}

impl S3Backend {
    /// Creates a client for the configured endpoint.
    ///
    /// Object-store-native checksums are only computed when the service
    /// requires them; several supported backends reject the newer checksum
    /// headers, and uploads are verified by SHA-256 afterwards anyway.
    #[must_use]
    pub fn new(config: &ObjectStoreConfig) -> Self {
        let creds = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "dcor-object-store",
        );

        let sdk_config = aws_sdk_s3::Config::builder()
            .endpoint_url(config.effective_endpoint())
            .region(Region::new(config.region.clone()))
            .credentials_provider(creds)
            .force_path_style(true)
            .request_checksum_calculation(
                aws_sdk_s3::config::RequestChecksumCalculation::WhenRequired,
            )
            .response_checksum_validation(
                aws_sdk_s3::config::ResponseChecksumValidation::WhenRequired,
            )
            .stalled_stream_protection(StalledStreamProtectionConfig::disabled())
            .build();

        Self {
            client: aws_sdk_s3::Client::from_conf(sdk_config),
        }
    }

    /// Creates a client from `DCOR_OBJECT_STORE_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::MissingEnv`] if any required variable is unset.
    pub fn from_env() -> Result<Self, StorageError> {
        Ok(Self::new(&ObjectStoreConfig::from_env()?))
    }

    /// Wraps an already configured SDK client.
    #[must_use]
    pub const fn from_client(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }
}

type HttpResponse = aws_sdk_s3::config::http::HttpResponse;

/// HTTP status of a failed request, if a response was received.
fn http_status<E>(err: &SdkError<E, HttpResponse>) -> Option<u16> {
    err.raw_response().map(|r| r.status().as_u16())
}

/// Whether the error is a `NoSuchKey`/`NoSuchBucket`/404 condition.
fn is_missing<E>(err: &SdkError<E, HttpResponse>) -> bool
where
    E: ProvideErrorMetadata,
{
    let code = err.as_service_error().and_then(ProvideErrorMetadata::code);
    matches!(
        code,
        Some("NoSuchKey" | "NoSuchBucket" | "NoSuchUpload" | "NotFound")
    ) || http_status(err) == Some(404)
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(dt.secs(), dt.subsec_nanos())
}

fn to_u64(value: Option<i64>) -> u64 {
    value.and_then(|v| u64::try_from(v).ok()).unwrap_or(0)
}

fn clean_etag(etag: &str) -> String {
    etag.trim_matches('"').trim_matches('\'').to_string()
}

async fn body_of(
    operation: &'static str,
    bucket: &str,
    key: &str,
    slice: &FileSlice,
) -> Result<ByteStream, StorageError> {
    ByteStream::read_from()
        .path(&slice.path)
        .offset(slice.offset)
        .length(Length::Exact(slice.length))
        .build()
        .await
        .map_err(|e| StorageError::store(operation, bucket, key, e))
}

#[async_trait]
impl ObjectStore for S3Backend {
    async fn head_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectMeta>, StorageError> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(output) => Ok(Some(ObjectMeta {
                size: to_u64(output.content_length()),
                etag: output.e_tag().map(clean_etag),
                last_modified: output.last_modified().and_then(to_chrono),
            })),
            Err(err) if is_missing(&err) => Ok(None),
            Err(err) => Err(StorageError::store("HeadObject", bucket, key, err)),
        }
    }

    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        range: Range<u64>,
    ) -> Result<Vec<u8>, StorageError> {
        if range.start >= range.end {
            return Ok(Vec::new());
        }
        let result = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .range(format!("bytes={}-{}", range.start, range.end - 1))
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(err) if http_status(&err) == Some(416) => return Ok(Vec::new()),
            Err(err) if is_missing(&err) => return Err(StorageError::not_found(bucket, key)),
            Err(err) => return Err(StorageError::store("GetObject", bucket, key, err)),
        };

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::store("GetObject", bucket, key, e))?;
        Ok(bytes.into_bytes().to_vec())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: FileSlice,
    ) -> Result<(), StorageError> {
        let length = i64::try_from(body.length).unwrap_or(i64::MAX);
        let stream = body_of("PutObject", bucket, key, &body).await?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(stream)
            .content_length(length)
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(|e| StorageError::store("PutObject", bucket, key, e))?;
        Ok(())
    }

    async fn list_buckets(
        &self,
        continuation: Option<String>,
    ) -> Result<Page<BucketEntry>, StorageError> {
        let output = self
            .client
            .list_buckets()
            .set_continuation_token(continuation)
            .send()
            .await
            .map_err(|e| StorageError::store("ListBuckets", "*", "", e))?;

        let items = output
            .buckets()
            .iter()
            .filter_map(|b| {
                b.name().map(|name| BucketEntry {
                    name: name.to_string(),
                    created: b.creation_date().and_then(to_chrono),
                })
            })
            .collect();

        Ok(Page {
            items,
            next: output.continuation_token().map(String::from),
        })
    }

    async fn list_objects(
        &self,
        bucket: &str,
        continuation: Option<String>,
    ) -> Result<Page<ObjectEntry>, StorageError> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .set_continuation_token(continuation)
            .send()
            .await
            .map_err(|e| StorageError::store("ListObjectsV2", bucket, "", e))?;

        let items = output
            .contents()
            .iter()
            .filter_map(|obj| {
                obj.key().map(|key| ObjectEntry {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    size: to_u64(obj.size()),
                    last_modified: obj.last_modified().and_then(to_chrono),
                })
            })
            .collect();

        let next = if output.is_truncated() == Some(true) {
            output.next_continuation_token().map(String::from)
        } else {
            None
        };

        Ok(Page { items, next })
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(err) if is_missing(&err) => Ok(false),
            Err(err) => Err(StorageError::store("HeadBucket", bucket, "", err)),
        }
    }

    async fn create_bucket(&self, bucket: &str) -> Result<bool, StorageError> {
        match self.client.create_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_bucket_already_owned_by_you()) =>
            {
                Ok(false)
            }
            Err(err) => Err(StorageError::store("CreateBucket", bucket, "", err)),
        }
    }

    async fn put_bucket_policy(&self, bucket: &str, policy: &str) -> Result<(), StorageError> {
        self.client
            .put_bucket_policy()
            .bucket(bucket)
            .policy(policy)
            .send()
            .await
            .map_err(|e| StorageError::store("PutBucketPolicy", bucket, "", e))?;
        Ok(())
    }

    async fn get_object_tagging(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<Vec<Tag>>, StorageError> {
        match self
            .client
            .get_object_tagging()
            .bucket(bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(
                output
                    .tag_set()
                    .iter()
                    .map(|t| Tag::new(t.key(), t.value()))
                    .collect(),
            )),
            Err(err) if is_missing(&err) => Ok(None),
            Err(err) => Err(StorageError::store("GetObjectTagging", bucket, key, err)),
        }
    }

    async fn put_object_tagging(
        &self,
        bucket: &str,
        key: &str,
        tags: &[Tag],
    ) -> Result<(), StorageError> {
        let tag_set = tags
            .iter()
            .map(|t| {
                aws_sdk_s3::types::Tag::builder()
                    .key(&t.key)
                    .value(&t.value)
                    .build()
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::store("PutObjectTagging", bucket, key, e))?;
        let tagging = Tagging::builder()
            .set_tag_set(Some(tag_set))
            .build()
            .map_err(|e| StorageError::store("PutObjectTagging", bucket, key, e))?;

        match self
            .client
            .put_object_tagging()
            .bucket(bucket)
            .key(key)
            .tagging(tagging)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_missing(&err) => Err(StorageError::not_found(bucket, key)),
            Err(err) => Err(StorageError::store("PutObjectTagging", bucket, key, err)),
        }
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<String, StorageError> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::store("CreateMultipartUpload", bucket, key, e))?;
        output.upload_id().map(String::from).ok_or_else(|| {
            StorageError::store("CreateMultipartUpload", bucket, key, "response lacks UploadId")
        })
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: FileSlice,
    ) -> Result<String, StorageError> {
        let length = i64::try_from(body.length).unwrap_or(i64::MAX);
        let number = i32::try_from(part_number)
            .map_err(|e| StorageError::InvalidInput(format!("part number {part_number}: {e}")))?;
        let stream = body_of("UploadPart", bucket, key, &body).await?;
        let output = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(number)
            .content_length(length)
            .body(stream)
            .send()
            .await
            .map_err(|e| StorageError::store("UploadPart", bucket, key, e))?;
        output
            .e_tag()
            .map(clean_etag)
            .ok_or_else(|| StorageError::store("UploadPart", bucket, key, "response lacks ETag"))
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), StorageError> {
        let completed = parts
            .iter()
            .map(|p| {
                aws_sdk_s3::types::CompletedPart::builder()
                    .part_number(i32::try_from(p.part_number).unwrap_or(i32::MAX))
                    .e_tag(&p.etag)
                    .build()
            })
            .collect();
        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| StorageError::store("CompleteMultipartUpload", bucket, key, e))?;
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StorageError> {
        match self
            .client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_missing(&e) => Err(StorageError::not_found(bucket, key)),
            Err(e) => Err(StorageError::store("AbortMultipartUpload", bucket, key, e)),
        }
    }

    async fn list_multipart_uploads(
        &self,
        bucket: &str,
        marker: Option<UploadMarker>,
    ) -> Result<Page<MultipartUploadInfo, UploadMarker>, StorageError> {
        let (key_marker, upload_id_marker) =
            marker.map_or((None, None), |m| (Some(m.key), Some(m.upload_id)));
        let output = self
            .client
            .list_multipart_uploads()
            .bucket(bucket)
            .set_key_marker(key_marker)
            .set_upload_id_marker(upload_id_marker)
            .send()
            .await
            .map_err(|e| StorageError::store("ListMultipartUploads", bucket, "", e))?;

        let items = output
            .uploads()
            .iter()
            .filter_map(|u| {
                Some(MultipartUploadInfo {
                    bucket: bucket.to_string(),
                    key: u.key()?.to_string(),
                    upload_id: u.upload_id()?.to_string(),
                    initiated: u.initiated().and_then(to_chrono)?,
                })
            })
            .collect();

        let next = if output.is_truncated() == Some(true) {
            match (output.next_key_marker(), output.next_upload_id_marker()) {
                (Some(key), Some(upload_id)) => Some(UploadMarker {
                    key: key.to_string(),
                    upload_id: upload_id.to_string(),
                }),
                _ => None,
            }
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
        let config = PresigningConfig::expires_in(expires_in)
            .map_err(|e| StorageError::InvalidInput(format!("presign expiry: {e}")))?;
        let (bucket, key) = request.target();
        let operation = request.operation();
        let wrap = |e: Box<dyn std::error::Error + Send + Sync>| {
            StorageError::store(operation, bucket, key, e)
        };

        let presigned = match request {
            PresignRequest::GetObject { filename, .. } => self
                .client
                .get_object()
                .bucket(bucket)
                .key(key)
                .set_response_content_disposition(
                    filename
                        .as_ref()
                        .map(|f| format!("attachment; filename = {f}")),
                )
                .presigned(config)
                .await
                .map_err(|e| wrap(e.into()))?,
            PresignRequest::PutObject { .. } => self
                .client
                .put_object()
                .bucket(bucket)
                .key(key)
                .presigned(config)
                .await
                .map_err(|e| wrap(e.into()))?,
            PresignRequest::UploadPart {
                upload_id,
                part_number,
                ..
            } => self
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(i32::try_from(*part_number).unwrap_or(i32::MAX))
                .presigned(config)
                .await
                .map_err(|e| wrap(e.into()))?,
        };

        Ok(presigned.uri().to_string())
    }
}
