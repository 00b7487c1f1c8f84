//! End-to-end behavior of the storage layer against the in-memory store.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use dcor_storage::StorageError;
use dcor_storage::availability::AvailabilitySynchronizer;
use dcor_storage::catalog::StaticCatalog;
use dcor_storage::checksum::{compute_checksum, sha256_file};
use dcor_storage::clock::{Clock, ManualClock};
use dcor_storage::config::BucketNaming;
use dcor_storage::facade::StoreClient;
use dcor_storage::maintenance::MultipartPruner;
use dcor_storage::memory::MemoryStore;
use dcor_storage::models::{Artifact, ResourceId, ResourceInfo, UploadMode};
use dcor_storage::presign::PresignCache;
use dcor_storage::resource::ResourceStore;
use dcor_storage::retry::RetryPolicy;
use dcor_storage::upload::{UploadOptions, Uploader};

const RID: &str = "f3e1c2d4-5a6b-4c7d-8e9f-0a1b2c3d4e5f";
const ORG: &str = "5a3c9a5e-7b8f-4c1d-9e2a-3f4b5c6d7e8f";

struct Env {
    clock: Arc<ManualClock>,
    store: Arc<MemoryStore>,
    catalog: Arc<StaticCatalog>,
    client: Arc<StoreClient>,
    presign: Arc<PresignCache>,
    resources: Arc<ResourceStore>,
}

fn env() -> Env {
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let catalog = Arc::new(StaticCatalog::new());
    let client = Arc::new(
        StoreClient::new(store.clone(), BucketNaming::default())
            .with_clock(clock.clone())
            .with_tagging_retry(RetryPolicy::immediate(5)),
    );
    let presign = Arc::new(PresignCache::with_clock(store.clone(), clock.clone()));
    let resources = Arc::new(ResourceStore::new(
        client.clone(),
        catalog.clone(),
        presign.clone(),
        "https://objectstore.example.org",
    ));
    Env {
        clock,
        store,
        catalog,
        client,
        presign,
        resources,
    }
}

fn rid() -> ResourceId {
    ResourceId::parse(RID).unwrap()
}

fn bucket() -> String {
    format!("circle-{ORG}")
}

fn local_file(data: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(data).unwrap();
    file
}

#[tokio::test]
async fn two_kib_upload_without_override() {
    let env = env();
    let uploader = Uploader::new(env.client.clone(), env.presign.clone());
    let file = local_file(&[42u8; 2048]);
    let options = UploadOptions {
        override_existing: false,
        ..UploadOptions::default()
    };

    let key = uploader
        .upload_file(file.path(), &bucket(), "resource/abc", &options)
        .await
        .unwrap();
    assert_eq!(key, "resource/abc");
    assert_eq!(env.store.counts().put_object, 1);

    let err = uploader
        .upload_file(file.path(), &bucket(), "resource/abc", &options)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::AlreadyExists { .. }));
}

#[tokio::test]
async fn checksum_of_verified_upload_matches_local_digest() {
    let env = env();
    let uploader = Uploader::new(env.client.clone(), env.presign.clone());
    let data: Vec<u8> = (0..3_000_000u32).map(|i| (i % 253) as u8).collect();
    let file = local_file(&data);
    let local = sha256_file(file.path()).await.unwrap();

    uploader
        .upload_file(
            file.path(),
            &bucket(),
            "k",
            &UploadOptions {
                sha256: Some(local.clone()),
                ..UploadOptions::default()
            },
        )
        .await
        .unwrap();
    let remote = compute_checksum(env.client.store(), &bucket(), "k", None)
        .await
        .unwrap();
    assert_eq!(remote, local);
}

#[tokio::test]
async fn existence_check_in_missing_bucket_is_false() {
    let env = env();
    assert!(
        !env
            .client
            .object_exists("bucket-that-does-not-exist", "resource/abc")
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn presigned_urls_are_reused_until_ten_percent_remain() {
    let env = env();
    env.store.insert_bucket(&bucket());
    let lifetime = Duration::from_secs(1000);

    let first = env
        .presign
        .create_presigned_upload_url(&bucket(), "k", UploadMode::Multipart { parts: 2 }, lifetime)
        .await
        .unwrap();
    env.clock.advance(Duration::from_secs(899));
    let second = env
        .presign
        .create_presigned_upload_url(&bucket(), "k", UploadMode::Multipart { parts: 2 }, lifetime)
        .await
        .unwrap();
    assert_eq!(first, second);

    env.clock.advance(Duration::from_secs(2));
    let third = env
        .presign
        .create_presigned_upload_url(&bucket(), "k", UploadMode::Multipart { parts: 2 }, lifetime)
        .await
        .unwrap();
    assert!(third.expires_at > first.expires_at);
    assert_ne!(third.upload_id, first.upload_id);
}

#[tokio::test]
async fn waiting_for_a_resource_that_never_arrives_times_out() {
    let env = env();
    env.catalog.insert(ResourceInfo {
        id: rid(),
        organization_id: ORG.to_string(),
        size: Some(10),
        private: true,
    });
    let sync = AvailabilitySynchronizer::new(env.resources.clone());

    let err = sync
        .wait_for_resource(RID, Artifact::Resource, Some(Duration::from_secs(60)))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Timeout { .. }));
}

#[tokio::test]
async fn upload_then_wait_then_open_handle() {
    let env = env();
    let data = b"fluorescence traces".to_vec();
    env.catalog.insert(ResourceInfo {
        id: rid(),
        organization_id: ORG.to_string(),
        size: Some(data.len() as u64),
        private: false,
    });
    let file = local_file(&data);

    env.resources
        .upload_artifact(&rid(), Artifact::Resource, file.path(), false, None)
        .await
        .unwrap();
    AvailabilitySynchronizer::new(env.resources.clone())
        .wait_for_resource(RID, Artifact::Resource, None)
        .await
        .unwrap();

    let handle = env
        .resources
        .get_s3_dc_handle_basin_based(&rid(), true)
        .await
        .unwrap();
    assert_eq!(handle.read_all().await.unwrap(), data);
    assert!(handle.available_basins().await.unwrap().is_empty());
    assert!(handle.read_basin("condensed-f3e1c2d45a6b").await.unwrap().is_none());
    assert_eq!(
        handle.url(),
        Some(
            format!(
                "https://objectstore.example.org/{}/resource/f3e/1c2/d4-5a6b-4c7d-8e9f-0a1b2c3d4e5f",
                bucket()
            )
            .as_str()
        )
    );
    handle.close();
}

#[tokio::test]
async fn pruning_keeps_sessions_up_to_the_threshold() {
    let env = env();
    let threshold = Duration::from_secs(3600);
    let now = env.clock.now();
    let at_age = |secs: i64| now - chrono::Duration::seconds(secs);

    let younger = env.store.insert_multipart_upload(&bucket(), "a", at_age(3599));
    let exact = env.store.insert_multipart_upload(&bucket(), "b", at_age(3600));
    let older = env.store.insert_multipart_upload(&bucket(), "c", at_age(3601));

    let pruner = MultipartPruner::new(env.client.clone());
    assert_eq!(
        pruner
            .prune_multipart_uploads(&bucket(), threshold)
            .await
            .unwrap(),
        1
    );
    let open = env.store.open_upload_ids(&bucket());
    assert_eq!(open.len(), 2);
    assert!(open.contains(&younger) && open.contains(&exact));
    assert!(!open.contains(&older));
}
