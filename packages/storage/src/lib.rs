#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Object-storage integration for DCOR resources.
//!
//! Reconciles catalog records ("resources") with the objects that hold their
//! bytes in an S3-compatible store:
//!
//! - [`upload::Uploader`] puts files into the store (single `PUT` below
//!   1 GiB, sequential multipart above) and verifies them by SHA-256.
//! - [`presign::PresignCache`] hands out presigned URLs for client-driven
//!   uploads and downloads and reuses them while they are fresh enough.
//! - [`availability::AvailabilitySynchronizer`] waits until a registered
//!   resource's bytes are complete in the store.
//! - [`handle::DatasetHandle`] reads a resource, optionally layered with
//!   derived "basins".
//! - [`maintenance::MultipartPruner`] aborts abandoned multipart uploads.
//!
//! All store access goes through the [`backend::ObjectStore`] trait, which is
//! implemented for S3 ([`s3::S3Backend`]) and in memory
//! ([`memory::MemoryStore`]).
//!
//! # Environment Variables
//!
//! | Variable | Required | Description |
//! |---|---|---|
//! | `DCOR_OBJECT_STORE_ENDPOINT_URL` | Yes | S3 endpoint, e.g. `https://s3.example.org` |
//! | `DCOR_OBJECT_STORE_ACCESS_KEY_ID` | Yes | Access key |
//! | `DCOR_OBJECT_STORE_SECRET_ACCESS_KEY` | Yes | Secret key |
//! | `DCOR_OBJECT_STORE_BUCKET_NAME` | No | Bucket template, default `circle-{organization_id}` |
//! | `DCOR_OBJECT_STORE_SSL_VERIFY` | No | `true` (default) or `false` |
//! | `DCOR_OBJECT_STORE_REGION` | No | Signing region, default `us-east-1` |

use std::time::Duration;

use dcor_storage_models::{Artifact, ModelError};

pub mod availability;
pub mod backend;
pub mod catalog;
pub mod checksum;
pub mod clock;
pub mod config;
pub mod facade;
pub mod handle;
pub mod maintenance;
pub mod memory;
pub mod presign;
pub mod resource;
pub mod retry;
pub mod s3;
pub mod upload;

pub use dcor_storage_models as models;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The object (or its bucket) does not exist.
    #[error("s3://{bucket}/{key} does not exist")]
    NotFound {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
    },

    /// The catalog does not know the resource.
    #[error("Resource {resource_id} does not exist in the catalog")]
    ResourceNotFound {
        /// The requested resource ID.
        resource_id: String,
    },

    /// An object-store request failed.
    #[error("S3 {operation} failed for s3://{bucket}/{key}: {source}")]
    Store {
        /// S3 operation name, e.g. `PutObject`.
        operation: &'static str,
        /// Bucket name.
        bucket: String,
        /// Object key (empty for bucket-level operations).
        key: String,
        /// Underlying SDK error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The stored object does not hash to the expected digest.
    #[error("Checksum mismatch for s3://{bucket}/{key}: expected {expected}, got {actual}")]
    Integrity {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// SHA-256 of the local source.
        expected: String,
        /// SHA-256 of the stored object.
        actual: String,
    },

    /// The resource did not become available in time.
    #[error("Resource {resource_id} ({artifact}) not available after {waited:.1?}")]
    Timeout {
        /// Resource ID.
        resource_id: String,
        /// Artifact that was awaited.
        artifact: Artifact,
        /// How long we waited.
        waited: Duration,
    },

    /// Overriding was disabled and the key is taken.
    #[error("s3://{bucket}/{key} already exists")]
    AlreadyExists {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
    },

    /// Malformed caller input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Missing required environment variable.
    #[error("Missing environment variable: {name}")]
    MissingEnv {
        /// Name of the missing environment variable.
        name: String,
    },

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// I/O error reading local files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Wraps an SDK error with the operation and object it concerns.
    pub fn store(
        operation: &'static str,
        bucket: &str,
        key: &str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Store {
            operation,
            bucket: bucket.to_string(),
            key: key.to_string(),
            source: source.into(),
        }
    }

    /// Creates a [`StorageError::NotFound`].
    #[must_use]
    pub fn not_found(bucket: &str, key: &str) -> Self {
        Self::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }

    /// Whether the error means "absent" rather than "broken".
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::ResourceNotFound { .. })
    }

    /// Whether a retry policy may try again after this error.
    ///
    /// Only transport/backend failures qualify; absent objects, integrity
    /// failures and bad input never get better by retrying.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Store { .. })
    }
}

impl From<ModelError> for StorageError {
    fn from(value: ModelError) -> Self {
        Self::InvalidInput(value.to_string())
    }
}
