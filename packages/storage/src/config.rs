//! Object-store connection settings and the bucket naming scheme.

use crate::StorageError;

/// Placeholder in the bucket name template.
pub const ORGANIZATION_PLACEHOLDER: &str = "{organization_id}";

/// Default bucket name template.
pub const DEFAULT_BUCKET_TEMPLATE: &str = "circle-{organization_id}";

/// Connection settings for the S3-compatible store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStoreConfig {
    /// Endpoint URL, e.g. `https://objectstore.example.org`.
    pub endpoint_url: String,
    /// Access key ID.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Bucket name template containing [`ORGANIZATION_PLACEHOLDER`].
    pub bucket_name: String,
    /// Whether to talk TLS to the endpoint.
    pub ssl_verify: bool,
    /// Signing region.
    pub region: String,
}

impl ObjectStoreConfig {
    /// Reads the configuration from `DCOR_OBJECT_STORE_*` environment
    /// variables.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::MissingEnv`] if the endpoint or credentials
    /// are unset, [`StorageError::Config`] for malformed values.
    pub fn from_env() -> Result<Self, StorageError> {
        let config = Self {
            endpoint_url: require_env("DCOR_OBJECT_STORE_ENDPOINT_URL")?,
            access_key_id: require_env("DCOR_OBJECT_STORE_ACCESS_KEY_ID")?,
            secret_access_key: require_env("DCOR_OBJECT_STORE_SECRET_ACCESS_KEY")?,
            bucket_name: optional_env("DCOR_OBJECT_STORE_BUCKET_NAME")
                .unwrap_or_else(|| DEFAULT_BUCKET_TEMPLATE.to_string()),
            ssl_verify: optional_env("DCOR_OBJECT_STORE_SSL_VERIFY")
                .map_or(Ok(true), |v| parse_bool("DCOR_OBJECT_STORE_SSL_VERIFY", &v))?,
            region: optional_env("DCOR_OBJECT_STORE_REGION")
                .unwrap_or_else(|| "us-east-1".to_string()),
        };
        config.bucket_naming()?;
        Ok(config)
    }

    /// Whether object-store credentials are present in the environment.
    #[must_use]
    pub fn is_available() -> bool {
        optional_env("DCOR_OBJECT_STORE_ACCESS_KEY_ID").is_some()
            && optional_env("DCOR_OBJECT_STORE_SECRET_ACCESS_KEY").is_some()
    }

    /// The bucket naming scheme configured by [`Self::bucket_name`].
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`] if the template lacks the placeholder.
    pub fn bucket_naming(&self) -> Result<BucketNaming, StorageError> {
        BucketNaming::new(&self.bucket_name)
    }

    /// Endpoint URL as used for requests. Without TLS verification the
    /// endpoint is contacted over plain `http`.
    #[must_use]
    pub fn effective_endpoint(&self) -> String {
        let endpoint = self.endpoint_url.trim_end_matches('/');
        if self.ssl_verify {
            endpoint.to_string()
        } else {
            endpoint.strip_prefix("https://").map_or_else(
                || endpoint.to_string(),
                |rest| format!("http://{rest}"),
            )
        }
    }
}

/// Maps organizations to bucket names and recognizes circle buckets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketNaming {
    prefix: String,
    suffix: String,
}

impl BucketNaming {
    /// Creates the naming scheme from a template such as
    /// `circle-{organization_id}`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`] if `template` does not contain
    /// [`ORGANIZATION_PLACEHOLDER`] exactly once.
    pub fn new(template: &str) -> Result<Self, StorageError> {
        let mut parts = template.split(ORGANIZATION_PLACEHOLDER);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(prefix), Some(suffix), None) => Ok(Self {
                prefix: prefix.to_string(),
                suffix: suffix.to_string(),
            }),
            _ => Err(StorageError::Config(format!(
                "bucket name template {template:?} must contain {ORGANIZATION_PLACEHOLDER} once"
            ))),
        }
    }

    /// Bucket holding the resources of `organization_id`.
    #[must_use]
    pub fn bucket_for(&self, organization_id: &str) -> String {
        format!("{}{organization_id}{}", self.prefix, self.suffix)
    }

    /// Whether `bucket` is a circle bucket, i.e. the template filled in with
    /// an organization UUID.
    #[must_use]
    pub fn is_circle_bucket(&self, bucket: &str) -> bool {
        bucket
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_suffix(self.suffix.as_str()))
            .is_some_and(|id| id.len() == 36 && uuid::Uuid::parse_str(id).is_ok())
    }
}

impl Default for BucketNaming {
    fn default() -> Self {
        Self {
            prefix: "circle-".to_string(),
            suffix: String::new(),
        }
    }
}

/// Reads a required environment variable.
fn require_env(name: &str) -> Result<String, StorageError> {
    optional_env(name).ok_or_else(|| StorageError::MissingEnv {
        name: name.to_string(),
    })
}

/// Reads an environment variable, treating empty values as unset.
fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(name: &str, value: &str) -> Result<bool, StorageError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(StorageError::Config(format!(
            "{name} must be true or false, got {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORG: &str = "5a3c9a5e-7b8f-4c1d-9e2a-3f4b5c6d7e8f";

    #[test]
    fn fills_in_bucket_template() {
        let naming = BucketNaming::new("circle-{organization_id}").unwrap();
        assert_eq!(naming.bucket_for(ORG), format!("circle-{ORG}"));
    }

    #[test]
    fn recognizes_circle_buckets() {
        let naming = BucketNaming::new("dcor-{organization_id}-data").unwrap();
        assert!(naming.is_circle_bucket(&format!("dcor-{ORG}-data")));
        assert!(!naming.is_circle_bucket(&format!("dcor-{ORG}")));
        assert!(!naming.is_circle_bucket("dcor-hansguenter-data"));
        assert!(!naming.is_circle_bucket("backups"));
    }

    #[test]
    fn rejects_templates_without_placeholder() {
        assert!(matches!(
            BucketNaming::new("circle-bucket"),
            Err(StorageError::Config(_))
        ));
        assert!(BucketNaming::new("{organization_id}-{organization_id}").is_err());
    }

    #[test]
    fn downgrades_endpoint_without_ssl_verification() {
        let mut config = ObjectStoreConfig {
            endpoint_url: "https://s3.example.org/".to_string(),
            access_key_id: "id".to_string(),
            secret_access_key: "secret".to_string(),
            bucket_name: DEFAULT_BUCKET_TEMPLATE.to_string(),
            ssl_verify: true,
            region: "us-east-1".to_string(),
        };
        assert_eq!(config.effective_endpoint(), "https://s3.example.org");
        config.ssl_verify = false;
        assert_eq!(config.effective_endpoint(), "http://s3.example.org");
    }

    #[test]
    fn parses_boolean_flags() {
        assert!(parse_bool("X", "True").unwrap());
        assert!(!parse_bool("X", "false").unwrap());
        assert!(parse_bool("X", "maybe").is_err());
    }
}
