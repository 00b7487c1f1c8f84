#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Operator CLI for DCOR object storage.
//!
//! Talks to the object store configured through the
//! `DCOR_OBJECT_STORE_*` environment variables (see [`dcor_storage`]).
//! Provides existence and checksum diagnostics, manual uploads, presigned
//! URL generation and completion, bucket listing and the multipart-upload
//! cleanup sweep.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use dcor_storage::backend::CompletedPart;
use dcor_storage::checksum::compute_checksum;
use dcor_storage::config::ObjectStoreConfig;
use dcor_storage::facade::StoreClient;
use dcor_storage::maintenance::MultipartPruner;
use dcor_storage::presign::PresignCache;
use dcor_storage::s3::S3Backend;
use dcor_storage::upload::{UploadOptions, Uploader};
use futures::TryStreamExt;

/// Inspect and maintain DCOR object storage.
#[derive(Parser)]
#[command(name = "dcor_storage")]
#[command(about = "Inspect and maintain DCOR object storage")]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Check whether an object exists.
    Exists {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
    },

    /// Compute the SHA-256 of a stored object.
    Checksum {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
    },

    /// Upload a local file.
    Upload {
        /// Local file.
        path: PathBuf,
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// Fail if the key is already taken.
        #[arg(long)]
        no_override: bool,
        /// Skip the post-upload checksum comparison.
        #[arg(long)]
        no_verify: bool,
        /// Tag the object `public=true`.
        #[arg(long)]
        public: bool,
        /// Known SHA-256 of the file.
        #[arg(long)]
        sha256: Option<String>,
    },

    /// Print presigned upload URL(s) for a file of the given size.
    Presign {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// Size of the file to be uploaded, in bytes.
        #[arg(long)]
        size: u64,
        /// URL lifetime in seconds.
        #[arg(long, default_value_t = 3600)]
        expires_in: u64,
    },

    /// Complete a multipart upload made through presigned part URLs.
    Complete {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// Upload ID printed by `presign`.
        upload_id: String,
        /// `ETag` of each part, in part order.
        #[arg(long = "etag", required = true)]
        etags: Vec<String>,
    },

    /// List buckets.
    Buckets {
        /// Only list buckets following the circle naming scheme.
        #[arg(long)]
        circles_only: bool,
    },

    /// Abort stale multipart uploads.
    Prune {
        /// Only prune this bucket (default: all buckets).
        #[arg(long)]
        bucket: Option<String>,
        /// Abort sessions older than this many hours.
        #[arg(long, default_value_t = 24)]
        older_than_hours: u64,
        /// When sweeping, include buckets outside the circle naming scheme.
        #[arg(long)]
        all_buckets: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();
    let cli = Cli::parse();

    let config = ObjectStoreConfig::from_env()?;
    let store = Arc::new(S3Backend::new(&config));
    let client = Arc::new(StoreClient::new(store.clone(), config.bucket_naming()?));

    match cli.command {
        Commands::Exists { bucket, key } => {
            println!("{}", client.object_exists(&bucket, &key).await?);
        }
        Commands::Checksum { bucket, key } => {
            println!("{}", compute_checksum(store.as_ref(), &bucket, &key, None).await?);
        }
        Commands::Upload {
            path,
            bucket,
            key,
            no_override,
            no_verify,
            public,
            sha256,
        } => {
            let uploader = Uploader::new(client, Arc::new(PresignCache::new(store)));
            let options = UploadOptions {
                override_existing: !no_override,
                verify_checksum: !no_verify,
                private: !public,
                sha256,
            };
            let key = uploader.upload_file(&path, &bucket, &key, &options).await?;
            println!("Uploaded s3://{bucket}/{key}");
        }
        Commands::Presign {
            bucket,
            key,
            size,
            expires_in,
        } => {
            let uploader = Uploader::new(client, Arc::new(PresignCache::new(store)));
            let presigned = uploader
                .create_presigned_upload_urls(
                    &bucket,
                    &key,
                    size,
                    Duration::from_secs(expires_in),
                )
                .await?;
            if let Some(upload_id) = &presigned.upload_id {
                println!("upload id: {upload_id}");
            }
            for (i, url) in presigned.urls.iter().enumerate() {
                println!("part {}: {url}", i + 1);
            }
            println!("expires: {}", presigned.expires_at.to_rfc3339());
        }
        Commands::Complete {
            bucket,
            key,
            upload_id,
            etags,
        } => {
            let parts: Vec<CompletedPart> = (1..)
                .zip(etags)
                .map(|(part_number, etag)| CompletedPart { part_number, etag })
                .collect();
            let uploader = Uploader::new(client, Arc::new(PresignCache::new(store)));
            uploader
                .complete_presigned_upload(&bucket, &key, &upload_id, &parts)
                .await?;
            println!("Completed s3://{bucket}/{key} from {} parts", parts.len());
        }
        Commands::Buckets { circles_only } => {
            let buckets: Vec<_> = client.iter_buckets(circles_only).try_collect().await?;
            for bucket in &buckets {
                println!("{}", bucket.name);
            }
            log::info!("{} buckets", buckets.len());
        }
        Commands::Prune {
            bucket,
            older_than_hours,
            all_buckets,
        } => {
            let older_than = Duration::from_secs(older_than_hours.saturating_mul(3600));
            let pruner = MultipartPruner::new(client);
            if let Some(bucket) = bucket {
                let aborted = pruner.prune_multipart_uploads(&bucket, older_than).await?;
                println!("{bucket}: {aborted} aborted");
            } else {
                let report = pruner
                    .prune_all_multipart_uploads(older_than, !all_buckets)
                    .await?;
                println!("{report}");
            }
        }
    }

    Ok(())
}
