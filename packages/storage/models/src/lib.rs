#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Value types shared by the DCOR object-storage layer.
//!
//! A DCOR resource is a catalog record whose bytes live in an S3-compatible
//! object store. Each resource owns one object per [`Artifact`], stored under
//! a key derived from its [`ResourceId`]. Everything in this crate is plain
//! data: no I/O, no clocks.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// One gibibyte.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Payloads of at least this size are uploaded via multipart.
pub const MULTIPART_THRESHOLD: u64 = GIB;

/// Size of every multipart part except the last one.
///
/// The part count doubles as a rough size estimate in GiB when looking at
/// the multipart `ETag` suffix.
pub const MULTIPART_PART_SIZE: u64 = GIB;

/// Size of the ranged reads used when hashing remote objects.
pub const CHECKSUM_CHUNK_SIZE: u64 = 1024 * 1024;

/// A cached presigned URL is reused while at least this percentage of its
/// requested lifetime remains.
pub const URL_REUSE_TOLERANCE_PERCENT: u32 = 10;

/// Errors produced while constructing model values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    /// The string is not a canonical resource identifier.
    #[error("Invalid resource ID {id:?}: {reason}")]
    InvalidResourceId {
        /// The rejected input.
        id: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Identifier of a catalog resource.
///
/// Resource IDs are canonical, lowercase, hyphenated UUIDs. The object keys
/// of all artifacts are derived from the textual form, so the textual form
/// is what gets validated and stored.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId(String);

impl ResourceId {
    /// Parses and validates a resource ID.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidResourceId`] if `id` is not a canonical
    /// lowercase hyphenated UUID.
    pub fn parse(id: &str) -> Result<Self, ModelError> {
        let invalid = |reason: &str| ModelError::InvalidResourceId {
            id: id.to_string(),
            reason: reason.to_string(),
        };

        if id.len() != 36 {
            return Err(invalid("expected 36 characters"));
        }
        if id.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(invalid("must be lowercase"));
        }
        uuid::Uuid::parse_str(id).map_err(|e| invalid(&e.to_string()))?;

        Ok(Self(id.to_string()))
    }

    /// Returns the textual form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the sharded path fragment `abc/def/ghij…` used in object keys.
    #[must_use]
    pub fn object_path(&self) -> String {
        let rid = &self.0;
        format!("{}/{}/{}", &rid[..3], &rid[3..6], &rid[6..])
    }

    /// Returns the shortened identifier used to name basins.
    ///
    /// The first two UUID groups (12 hex digits). Previously uploaded
    /// basins are looked up by this name, so it must never change.
    #[must_use]
    pub fn partial(&self) -> String {
        format!("{}{}", &self.0[..8], &self.0[9..13])
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ResourceId {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ResourceId {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ResourceId> for String {
    fn from(value: ResourceId) -> Self {
        value.0
    }
}

/// Selects which object of a resource an operation touches.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Artifact {
    /// The primary data file as uploaded by the user.
    #[default]
    Resource,
    /// Condensed (per-event scalar) data derived from the resource.
    Condensed,
    /// Preview image.
    Preview,
    /// Processing logs.
    Logs,
}

impl Artifact {
    /// All artifacts, primary first.
    pub const ALL: &[Self] = &[Self::Resource, Self::Condensed, Self::Preview, Self::Logs];

    /// Artifacts derived from the primary data that can be layered onto it
    /// as basins.
    pub const DERIVED: &[Self] = &[Self::Condensed, Self::Preview];

    /// Returns the object key of this artifact for `resource_id`.
    #[must_use]
    pub fn object_key(self, resource_id: &ResourceId) -> String {
        format!("{self}/{}", resource_id.object_path())
    }
}

/// A bucket plus key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectLocation {
    /// Bucket name.
    pub bucket: String,
    /// Object key.
    pub key: String,
}

impl ObjectLocation {
    /// Creates a new location.
    #[must_use]
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// A secondary object-store location layered onto a dataset handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Basin {
    /// Name under which the basin's data is exposed.
    pub name: String,
    /// Where the basin lives.
    pub location: ObjectLocation,
    /// A missing perishable basin is ignored instead of reported.
    pub perishable: bool,
}

impl Basin {
    /// Creates a basin.
    #[must_use]
    pub fn new(name: impl Into<String>, location: ObjectLocation, perishable: bool) -> Self {
        Self {
            name: name.into(),
            location,
            perishable,
        }
    }

    /// Creates the basin that layers `artifact` of `resource_id` (stored in
    /// `bucket`) onto a dataset.
    #[must_use]
    pub fn for_artifact(
        bucket: &str,
        resource_id: &ResourceId,
        artifact: Artifact,
        perishable: bool,
    ) -> Self {
        Self::new(
            basin_name(resource_id, artifact),
            ObjectLocation::new(bucket, artifact.object_key(resource_id)),
            perishable,
        )
    }
}

/// Returns the name of the basin holding `artifact` of `resource_id`.
#[must_use]
pub fn basin_name(resource_id: &ResourceId, artifact: Artifact) -> String {
    format!("{artifact}-{}", resource_id.partial())
}

/// What kind of presigned URL set to issue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum UploadMode {
    /// One presigned `PUT` URL.
    Single,
    /// A multipart session with one presigned URL per part.
    Multipart {
        /// Number of parts.
        parts: u32,
    },
    /// One presigned `GET` URL.
    Download {
        /// File name for the `Content-Disposition` response header.
        filename: Option<String>,
    },
}

impl UploadMode {
    /// Picks the upload mode for a payload of `size` bytes.
    #[must_use]
    pub fn for_size(size: u64) -> Self {
        if size < MULTIPART_THRESHOLD {
            Self::Single
        } else {
            Self::Multipart {
                parts: part_count(size),
            }
        }
    }
}

/// Number of [`MULTIPART_PART_SIZE`] parts needed for `size` bytes.
#[must_use]
pub fn part_count(size: u64) -> u32 {
    u32::try_from(size.div_ceil(MULTIPART_PART_SIZE).max(1)).unwrap_or(u32::MAX)
}

/// A set of presigned URLs handed to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresignedUpload {
    /// One URL for single uploads/downloads, one URL per part (in part
    /// order) for multipart uploads.
    pub urls: Vec<String>,
    /// Multipart session ID. The client reports the part `ETag`s back so
    /// the session can be completed server-side.
    pub upload_id: Option<String>,
    /// Absolute point in time after which the URLs stop working.
    pub expires_at: DateTime<Utc>,
}

impl PresignedUpload {
    /// Whether this is a multipart session.
    #[must_use]
    pub const fn is_multipart(&self) -> bool {
        self.upload_id.is_some()
    }
}

/// Object metadata from `HeadObject`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Content length in bytes.
    pub size: u64,
    /// `ETag` with quotes stripped.
    pub etag: Option<String>,
    /// Last modification time.
    pub last_modified: Option<DateTime<Utc>>,
}

/// One entry of a bucket listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntry {
    /// Bucket the object lives in.
    pub bucket: String,
    /// Object key.
    pub key: String,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time.
    pub last_modified: Option<DateTime<Utc>>,
}

/// One entry of a bucket enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketEntry {
    /// Bucket name.
    pub name: String,
    /// Creation time as reported by the store.
    pub created: Option<DateTime<Utc>>,
}

/// An object tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    /// Tag key.
    pub key: String,
    /// Tag value.
    pub value: String,
}

impl Tag {
    /// Creates a tag.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// The tag that the bucket policy grants anonymous read access for.
    #[must_use]
    pub fn public() -> Self {
        Self::new("public", "true")
    }
}

/// A multipart upload that has been started but not completed or aborted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartUploadInfo {
    /// Bucket name.
    pub bucket: String,
    /// Object key.
    pub key: String,
    /// Session ID issued by the store.
    pub upload_id: String,
    /// When the session was created.
    pub initiated: DateTime<Utc>,
}

impl MultipartUploadInfo {
    /// Age of the session at `now` (zero for sessions from the future).
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> std::time::Duration {
        (now - self.initiated).to_std().unwrap_or_default()
    }
}

/// What the storage layer needs to know about a catalog resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    /// Resource ID.
    pub id: ResourceId,
    /// Organization (circle) owning the dataset; selects the bucket.
    pub organization_id: String,
    /// Size of the primary data as declared in the catalog, if known.
    pub size: Option<u64>,
    /// Whether the dataset is private.
    pub private: bool,
}
