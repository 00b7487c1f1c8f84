//! The boundary to the metadata catalog.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use dcor_storage_models::{ResourceId, ResourceInfo};

use crate::StorageError;

/// Looks up what the storage layer needs to know about a resource.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Returns the resource's record, or `None` if the catalog does not
    /// know it (yet).
    async fn resource_info(&self, id: &ResourceId) -> Result<Option<ResourceInfo>, StorageError>;
}

/// A catalog held in memory.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    resources: Mutex<HashMap<ResourceId, ResourceInfo>>,
}

impl StaticCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a resource.
    pub fn insert(&self, info: ResourceInfo) {
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(info.id.clone(), info);
    }

    /// Removes a resource.
    pub fn remove(&self, id: &ResourceId) -> Option<ResourceInfo> {
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }
}

impl FromIterator<ResourceInfo> for StaticCatalog {
    fn from_iter<T: IntoIterator<Item = ResourceInfo>>(iter: T) -> Self {
        let catalog = Self::new();
        for info in iter {
            catalog.insert(info);
        }
        catalog
    }
}

#[async_trait]
impl Catalog for StaticCatalog {
    async fn resource_info(&self, id: &ResourceId) -> Result<Option<ResourceInfo>, StorageError> {
        Ok(self
            .resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn looks_up_inserted_resources() {
        let id = ResourceId::parse("bd0fa0a6-4b8a-4c5b-9a3e-2f5e4d1c0b9a").unwrap();
        let info = ResourceInfo {
            id: id.clone(),
            organization_id: "5a3c9a5e-7b8f-4c1d-9e2a-3f4b5c6d7e8f".to_string(),
            size: Some(10),
            private: false,
        };
        let catalog: StaticCatalog = std::iter::once(info.clone()).collect();

        assert_eq!(catalog.resource_info(&id).await.unwrap(), Some(info));
        catalog.remove(&id);
        assert_eq!(catalog.resource_info(&id).await.unwrap(), None);
    }
}
