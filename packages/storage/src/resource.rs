//! Resource-level storage operations.
//!
//! Maps a resource ID and [`Artifact`] to a bucket and key (through the
//! catalog, which knows the owning organization) and exposes the storage
//! operations in those terms.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dcor_storage_models::{
    Artifact, Basin, ObjectLocation, PresignedUpload, ResourceId, ResourceInfo,
};
use lru::LruCache;

use crate::StorageError;
use crate::backend::CompletedPart;
use crate::catalog::Catalog;
use crate::checksum;
use crate::clock::Clock;
use crate::config::ObjectStoreConfig;
use crate::facade::StoreClient;
use crate::handle::{DatasetHandle, DatasetHandleBuilder};
use crate::presign::PresignCache;
use crate::s3::S3Backend;
use crate::upload::{UploadOptions, Uploader};

/// Number of resource-to-bucket mappings kept.
const BUCKET_CACHE_CAPACITY: usize = 100;

/// Storage operations on catalog resources.
pub struct ResourceStore {
    client: Arc<StoreClient>,
    catalog: Arc<dyn Catalog>,
    presign: Arc<PresignCache>,
    uploader: Uploader,
    endpoint_url: String,
    buckets: Mutex<LruCache<ResourceId, String>>,
}

impl std::fmt::Debug for ResourceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceStore")
            .field("endpoint_url", &self.endpoint_url)
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

impl ResourceStore {
    /// Creates a resource store. `endpoint_url` is used to build public
    /// object URLs.
    #[must_use]
    pub fn new(
        client: Arc<StoreClient>,
        catalog: Arc<dyn Catalog>,
        presign: Arc<PresignCache>,
        endpoint_url: impl Into<String>,
    ) -> Self {
        let uploader = Uploader::new(Arc::clone(&client), Arc::clone(&presign));
        Self {
            client,
            catalog,
            presign,
            uploader,
            endpoint_url: endpoint_url.into().trim_end_matches('/').to_string(),
            buckets: Mutex::new(LruCache::new(
                NonZeroUsize::new(BUCKET_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    /// Creates a resource store talking to the S3 endpoint in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`] if the bucket template is invalid.
    pub fn from_config(
        config: &ObjectStoreConfig,
        catalog: Arc<dyn Catalog>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StorageError> {
        let store = Arc::new(S3Backend::new(config));
        let client = StoreClient::new(store.clone(), config.bucket_naming()?)
            .with_clock(Arc::clone(&clock));
        let presign = PresignCache::with_clock(store, clock);
        Ok(Self::new(
            Arc::new(client),
            catalog,
            Arc::new(presign),
            config.effective_endpoint(),
        ))
    }

    /// The object-store client.
    #[must_use]
    pub const fn client(&self) -> &Arc<StoreClient> {
        &self.client
    }

    /// The uploader.
    #[must_use]
    pub const fn uploader(&self) -> &Uploader {
        &self.uploader
    }

    /// The presigned URL cache.
    #[must_use]
    pub const fn presign_cache(&self) -> &Arc<PresignCache> {
        &self.presign
    }

    /// The catalog record of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ResourceNotFound`] if the catalog does not
    /// know the resource.
    pub async fn resource_info(&self, id: &ResourceId) -> Result<ResourceInfo, StorageError> {
        self.catalog
            .resource_info(id)
            .await?
            .ok_or_else(|| StorageError::ResourceNotFound {
                resource_id: id.to_string(),
            })
    }

    /// Bucket holding the artifacts of `id`.
    ///
    /// # Errors
    ///
    /// See [`Self::resource_info`].
    pub async fn bucket_for_resource(&self, id: &ResourceId) -> Result<String, StorageError> {
        let cached = self.lock_buckets().get(id).cloned();
        if let Some(bucket) = cached {
            return Ok(bucket);
        }
        let info = self.resource_info(id).await?;
        let bucket = self.client.naming().bucket_for(&info.organization_id);
        self.lock_buckets().put(id.clone(), bucket.clone());
        Ok(bucket)
    }

    /// Bucket and key of `artifact` of `id`.
    ///
    /// # Errors
    ///
    /// See [`Self::resource_info`].
    pub async fn location(
        &self,
        id: &ResourceId,
        artifact: Artifact,
    ) -> Result<ObjectLocation, StorageError> {
        let bucket = self.bucket_for_resource(id).await?;
        Ok(ObjectLocation::new(bucket, artifact.object_key(id)))
    }

    /// Whether `artifact` of `id` is in the store.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ResourceNotFound`] for resources unknown to
    /// the catalog and [`StorageError::Store`] if the check fails.
    pub async fn artifact_exists(
        &self,
        id: &ResourceId,
        artifact: Artifact,
    ) -> Result<bool, StorageError> {
        let location = self.location(id, artifact).await?;
        self.client
            .object_exists(&location.bucket, &location.key)
            .await
    }

    /// SHA-256 of the stored `artifact` of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the object is missing.
    pub async fn compute_checksum(
        &self,
        id: &ResourceId,
        artifact: Artifact,
    ) -> Result<String, StorageError> {
        let location = self.location(id, artifact).await?;
        checksum::compute_checksum(
            self.client.store(),
            &location.bucket,
            &location.key,
            None,
        )
        .await
    }

    /// Presigned download URL for `artifact` of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ResourceNotFound`] for resources unknown to
    /// the catalog and [`StorageError::Store`] if signing fails.
    pub async fn create_presigned_url(
        &self,
        id: &ResourceId,
        artifact: Artifact,
        expires_in: Duration,
        filename: Option<&str>,
    ) -> Result<String, StorageError> {
        let location = self.location(id, artifact).await?;
        self.presign
            .create_presigned_download_url(&location.bucket, &location.key, filename, expires_in)
            .await
    }

    /// Presigned upload URL(s) for a client uploading `file_size` bytes of
    /// `artifact` of `id`.
    ///
    /// # Errors
    ///
    /// See [`Uploader::create_presigned_upload_urls`].
    pub async fn create_presigned_upload_urls(
        &self,
        id: &ResourceId,
        artifact: Artifact,
        file_size: u64,
        expires_in: Duration,
    ) -> Result<PresignedUpload, StorageError> {
        let location = self.location(id, artifact).await?;
        self.uploader
            .create_presigned_upload_urls(&location.bucket, &location.key, file_size, expires_in)
            .await
    }

    /// Completes a client-side multipart upload of `artifact` of `id`.
    ///
    /// # Errors
    ///
    /// See [`Uploader::complete_presigned_upload`].
    pub async fn complete_presigned_upload(
        &self,
        id: &ResourceId,
        artifact: Artifact,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), StorageError> {
        let location = self.location(id, artifact).await?;
        self.uploader
            .complete_presigned_upload(&location.bucket, &location.key, upload_id, parts)
            .await
    }

    /// Uploads `path` as `artifact` of `id` and returns the object key.
    ///
    /// Without an explicit `private` flag, the resource's catalog record
    /// decides whether the object is made public.
    ///
    /// # Errors
    ///
    /// See [`Uploader::upload_file`].
    pub async fn upload_artifact(
        &self,
        id: &ResourceId,
        artifact: Artifact,
        path: &Path,
        override_existing: bool,
        private: Option<bool>,
    ) -> Result<String, StorageError> {
        let info = self.resource_info(id).await?;
        let location = self.location(id, artifact).await?;
        let options = UploadOptions {
            override_existing,
            private: private.unwrap_or(info.private),
            ..UploadOptions::default()
        };
        self.uploader
            .upload_file(path, &location.bucket, &location.key, &options)
            .await
    }

    /// Tags all artifacts of `id` that can be served publicly with
    /// `public=true`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if an artifact is missing and
    /// `missing_ok` is `false`.
    pub async fn make_resource_public(
        &self,
        id: &ResourceId,
        missing_ok: bool,
    ) -> Result<(), StorageError> {
        for artifact in [Artifact::Condensed, Artifact::Preview, Artifact::Resource] {
            let location = self.location(id, artifact).await?;
            self.client
                .make_object_public(&location.bucket, &location.key, missing_ok)
                .await?;
        }
        Ok(())
    }

    /// Unsigned URL of `artifact` of `id` (only usable for public
    /// objects).
    ///
    /// # Errors
    ///
    /// See [`Self::resource_info`].
    pub async fn url_for_artifact(
        &self,
        id: &ResourceId,
        artifact: Artifact,
    ) -> Result<String, StorageError> {
        let location = self.location(id, artifact).await?;
        Ok(format!(
            "{}/{}/{}",
            self.endpoint_url, location.bucket, location.key
        ))
    }

    /// Opens a read handle on `artifact` of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the object is missing.
    pub async fn get_s3_dc_handle(
        &self,
        id: &ResourceId,
        artifact: Artifact,
    ) -> Result<DatasetHandle, StorageError> {
        self.handle_builder(id, artifact).await?.open().await
    }

    /// Opens a read handle on the primary data of `id`.
    ///
    /// With `enable_basins`, the derived artifacts (condensed data,
    /// preview) are attached as perishable basins. They are looked up on
    /// first access, so resources that have not been processed yet still
    /// open fine.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the primary data is missing.
    pub async fn get_s3_dc_handle_basin_based(
        &self,
        id: &ResourceId,
        enable_basins: bool,
    ) -> Result<DatasetHandle, StorageError> {
        let mut builder = self.handle_builder(id, Artifact::Resource).await?;
        if enable_basins {
            let bucket = self.bucket_for_resource(id).await?;
            builder = builder.basins(
                Artifact::DERIVED
                    .iter()
                    .map(|artifact| Basin::for_artifact(&bucket, id, *artifact, true)),
            );
        }
        builder.open().await
    }

    async fn handle_builder(
        &self,
        id: &ResourceId,
        artifact: Artifact,
    ) -> Result<DatasetHandleBuilder, StorageError> {
        let location = self.location(id, artifact).await?;
        let url = format!("{}/{}/{}", self.endpoint_url, location.bucket, location.key);
        Ok(
            DatasetHandleBuilder::new(self.client.store_arc(), id.clone(), artifact, location)
                .url(url),
        )
    }

    fn lock_buckets(&self) -> std::sync::MutexGuard<'_, LruCache<ResourceId, String>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use dcor_storage_models::Tag;

    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::clock::ManualClock;
    use crate::config::BucketNaming;
    use crate::memory::MemoryStore;
    use crate::retry::RetryPolicy;

    const RID: &str = "bd0fa0a6-4b8a-4c5b-9a3e-2f5e4d1c0b9a";
    const ORG: &str = "5a3c9a5e-7b8f-4c1d-9e2a-3f4b5c6d7e8f";

    fn rid() -> ResourceId {
        ResourceId::parse(RID).unwrap()
    }

    fn bucket() -> String {
        format!("circle-{ORG}")
    }

    fn setup(private: bool) -> (Arc<MemoryStore>, Arc<StaticCatalog>, ResourceStore) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let catalog = Arc::new(StaticCatalog::new());
        catalog.insert(ResourceInfo {
            id: rid(),
            organization_id: ORG.to_string(),
            size: Some(3),
            private,
        });
        let client = StoreClient::new(store.clone(), BucketNaming::default())
            .with_clock(clock.clone())
            .with_tagging_retry(RetryPolicy::immediate(5));
        let presign = PresignCache::with_clock(store.clone(), clock);
        let resources = ResourceStore::new(
            Arc::new(client),
            catalog.clone(),
            Arc::new(presign),
            "https://s3.example.org/",
        );
        (store, catalog, resources)
    }

    #[tokio::test]
    async fn maps_resources_to_buckets_and_keys() {
        let (_store, _catalog, resources) = setup(true);
        let location = resources.location(&rid(), Artifact::Condensed).await.unwrap();
        assert_eq!(location.bucket, bucket());
        assert_eq!(location.key, "condensed/bd0/fa0/a6-4b8a-4c5b-9a3e-2f5e4d1c0b9a");
        assert_eq!(
            resources.url_for_artifact(&rid(), Artifact::Resource).await.unwrap(),
            format!(
                "https://s3.example.org/{}/resource/bd0/fa0/a6-4b8a-4c5b-9a3e-2f5e4d1c0b9a",
                bucket()
            )
        );
    }

    #[tokio::test]
    async fn bucket_lookup_is_cached() {
        let (_store, catalog, resources) = setup(true);
        resources.bucket_for_resource(&rid()).await.unwrap();
        catalog.remove(&rid());
        assert_eq!(resources.bucket_for_resource(&rid()).await.unwrap(), bucket());
    }

    #[tokio::test]
    async fn unknown_resources_are_reported() {
        let (_store, _catalog, resources) = setup(true);
        let other = ResourceId::parse("0f1e2d3c-4b5a-4968-8776-655443322110").unwrap();
        let err = resources
            .artifact_exists(&other, Artifact::Resource)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ResourceNotFound { .. }));
    }

    #[tokio::test]
    async fn upload_follows_catalog_privacy() {
        let (store, _catalog, resources) = setup(false);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();

        let key = resources
            .upload_artifact(&rid(), Artifact::Resource, file.path(), true, None)
            .await
            .unwrap();
        assert!(resources.artifact_exists(&rid(), Artifact::Resource).await.unwrap());
        assert!(!resources.artifact_exists(&rid(), Artifact::Condensed).await.unwrap());
        assert_eq!(store.object_tags(&bucket(), &key).unwrap(), vec![Tag::public()]);
        assert_eq!(
            resources.compute_checksum(&rid(), Artifact::Resource).await.unwrap(),
            checksum::sha256_bytes(b"abc")
        );
    }

    #[tokio::test]
    async fn makes_existing_artifacts_public() {
        let (store, _catalog, resources) = setup(true);
        let key = Artifact::Resource.object_key(&rid());
        store.insert_object(&bucket(), &key, b"abc".to_vec());

        resources.make_resource_public(&rid(), true).await.unwrap();
        assert_eq!(store.object_tags(&bucket(), &key).unwrap(), vec![Tag::public()]);
        assert!(resources.make_resource_public(&rid(), false).await.is_err());
    }

    #[tokio::test]
    async fn basin_based_handles_attach_perishable_derived_artifacts() {
        let (store, _catalog, resources) = setup(true);
        store.insert_object(&bucket(), &Artifact::Resource.object_key(&rid()), b"abc".to_vec());

        let handle = resources
            .get_s3_dc_handle_basin_based(&rid(), true)
            .await
            .unwrap();
        assert_eq!(
            handle.basin_names(),
            vec!["condensed-bd0fa0a64b8a", "preview-bd0fa0a64b8a"]
        );
        assert!(handle.basins().all(|b| b.perishable));
        assert!(handle.available_basins().await.unwrap().is_empty());

        let plain = resources
            .get_s3_dc_handle_basin_based(&rid(), false)
            .await
            .unwrap();
        assert!(plain.basin_names().is_empty());
    }

    #[tokio::test]
    async fn direct_handle_requires_the_artifact() {
        let (store, _catalog, resources) = setup(true);
        let err = resources
            .get_s3_dc_handle(&rid(), Artifact::Condensed)
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        store.insert_object(&bucket(), &Artifact::Condensed.object_key(&rid()), b"c".to_vec());
        let handle = resources
            .get_s3_dc_handle(&rid(), Artifact::Condensed)
            .await
            .unwrap();
        assert_eq!(handle.read_all().await.unwrap(), b"c");
    }

    #[tokio::test]
    async fn presigned_download_url_uses_the_artifact_key() {
        let (_store, _catalog, resources) = setup(true);
        let url = resources
            .create_presigned_url(&rid(), Artifact::Preview, Duration::from_secs(60), Some("p.png"))
            .await
            .unwrap();
        assert!(url.contains("preview/bd0/fa0/"));
        assert!(url.contains("filename=p.png"));
    }

    fn numbered(i: u32) -> ResourceId {
        ResourceId::parse(&format!("00000000-0000-4000-8000-{i:012}")).unwrap()
    }

    #[tokio::test]
    async fn bucket_cache_evicts_least_recently_used() {
        let (_store, catalog, resources) = setup(true);
        for i in 0..150u32 {
            catalog.insert(ResourceInfo {
                id: numbered(i),
                organization_id: ORG.to_string(),
                size: None,
                private: true,
            });
        }

        resources.bucket_for_resource(&rid()).await.unwrap();
        for i in 0..100u32 {
            resources.bucket_for_resource(&numbered(i)).await.unwrap();
            resources.bucket_for_resource(&rid()).await.unwrap();
        }
        assert_eq!(resources.lock_buckets().len(), BUCKET_CACHE_CAPACITY);

        // Served from the cache even though the catalog forgot it.
        catalog.remove(&rid());
        assert_eq!(resources.bucket_for_resource(&rid()).await.unwrap(), bucket());

        // The oldest untouched entry was evicted and needs the catalog again.
        catalog.remove(&numbered(0));
        let err = resources.bucket_for_resource(&numbered(0)).await.unwrap_err();
        assert!(matches!(err, StorageError::ResourceNotFound { .. }));
        resources.bucket_for_resource(&numbered(99)).await.unwrap();
    }
}
