//! Read handles for datasets stored in the object store.
//!
//! A [`DatasetHandle`] reads one primary object and may carry a list of
//! [`Basin`]s: further objects (condensed data, previews, ...) layered onto
//! the dataset. Basins are not looked up when the handle is built, only
//! when their data is first requested. A missing perishable basin is
//! skipped; a missing non-perishable basin is an error at that point.

use std::ops::Range;
use std::sync::Arc;

use dcor_storage_models::{Artifact, Basin, ObjectLocation, ObjectMeta, ResourceId};
use tokio::sync::OnceCell;

use crate::StorageError;
use crate::backend::ObjectStore;

#[derive(Debug)]
struct BasinSlot {
    basin: Basin,
    meta: OnceCell<Option<ObjectMeta>>,
}

/// A composed read view of a remote dataset.
pub struct DatasetHandle {
    store: Arc<dyn ObjectStore>,
    resource_id: ResourceId,
    artifact: Artifact,
    primary: ObjectLocation,
    meta: ObjectMeta,
    url: Option<String>,
    basins: Vec<BasinSlot>,
}

impl std::fmt::Debug for DatasetHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetHandle")
            .field("resource_id", &self.resource_id)
            .field("artifact", &self.artifact)
            .field("primary", &self.primary)
            .field("basins", &self.basins)
            .finish_non_exhaustive()
    }
}

impl DatasetHandle {
    /// Resource the handle reads.
    #[must_use]
    pub const fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }

    /// Artifact the handle reads.
    #[must_use]
    pub const fn artifact(&self) -> Artifact {
        self.artifact
    }

    /// Location of the primary object.
    #[must_use]
    pub const fn location(&self) -> &ObjectLocation {
        &self.primary
    }

    /// Size of the primary object when the handle was opened.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.meta.size
    }

    /// URL of the primary object, if one was attached.
    #[must_use]
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Reads `range` (end-exclusive) of the primary object.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the object has disappeared.
    pub async fn read_range(&self, range: Range<u64>) -> Result<Vec<u8>, StorageError> {
        self.store
            .get_range(&self.primary.bucket, &self.primary.key, range)
            .await
    }

    /// Reads the whole primary object.
    ///
    /// # Errors
    ///
    /// See [`Self::read_range`].
    pub async fn read_all(&self) -> Result<Vec<u8>, StorageError> {
        self.read_range(0..self.meta.size).await
    }

    /// Names of all attached basins, in attachment order. Does not touch
    /// the store.
    #[must_use]
    pub fn basin_names(&self) -> Vec<&str> {
        self.basins.iter().map(|s| s.basin.name.as_str()).collect()
    }

    /// The attached basins.
    pub fn basins(&self) -> impl Iterator<Item = &Basin> {
        self.basins.iter().map(|s| &s.basin)
    }

    /// Reads the data of basin `name`.
    ///
    /// Returns `Ok(None)` if the basin is perishable and missing.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidInput`] for an unknown basin name and
    /// [`StorageError::NotFound`] if a non-perishable basin is missing.
    pub async fn read_basin(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let slot = self
            .basins
            .iter()
            .find(|s| s.basin.name == name)
            .ok_or_else(|| {
                StorageError::InvalidInput(format!(
                    "dataset {} has no basin {name:?}",
                    self.resource_id
                ))
            })?;

        let Some(meta) = resolve(self.store.as_ref(), slot).await? else {
            return Ok(None);
        };
        let location = &slot.basin.location;
        let data = self
            .store
            .get_range(&location.bucket, &location.key, 0..meta.size)
            .await?;
        Ok(Some(data))
    }

    /// Names of the basins whose data exists. Missing perishable basins
    /// are left out.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if a non-perishable basin is
    /// missing.
    pub async fn available_basins(&self) -> Result<Vec<&str>, StorageError> {
        let mut available = Vec::new();
        for slot in &self.basins {
            if resolve(self.store.as_ref(), slot).await?.is_some() {
                available.push(slot.basin.name.as_str());
            }
        }
        Ok(available)
    }

    /// Forgets every basin lookup made so far, so the next access goes to
    /// the store again. Returns how many resolved basins were dropped.
    #[must_use]
    pub fn release_basins(&mut self) -> usize {
        self.basins
            .iter_mut()
            .filter_map(|slot| slot.meta.take())
            .count()
    }

    /// Releases the handle along with any resolved basins.
    pub fn close(mut self) {
        let released = self.release_basins();
        log::debug!(
            "Closing handle for {} ({}), released {released} basins",
            self.resource_id,
            self.artifact
        );
    }
}

/// Looks up a basin once. Missing perishable basins resolve to `None`.
async fn resolve<'a>(
    store: &dyn ObjectStore,
    slot: &'a BasinSlot,
) -> Result<Option<&'a ObjectMeta>, StorageError> {
    let location = &slot.basin.location;
    let meta = slot
        .meta
        .get_or_try_init(|| store.head_object(&location.bucket, &location.key))
        .await?;

    match meta {
        Some(meta) => Ok(Some(meta)),
        None if slot.basin.perishable => {
            log::warn!(
                "Perishable basin {} ({location}) is missing, ignoring it",
                slot.basin.name
            );
            Ok(None)
        }
        None => Err(StorageError::not_found(&location.bucket, &location.key)),
    }
}

/// Builds a [`DatasetHandle`].
pub struct DatasetHandleBuilder {
    store: Arc<dyn ObjectStore>,
    resource_id: ResourceId,
    artifact: Artifact,
    primary: ObjectLocation,
    url: Option<String>,
    basins: Vec<Basin>,
}

impl DatasetHandleBuilder {
    /// Starts a handle over `primary`.
    #[must_use]
    pub fn new(
        store: Arc<dyn ObjectStore>,
        resource_id: ResourceId,
        artifact: Artifact,
        primary: ObjectLocation,
    ) -> Self {
        Self {
            store,
            resource_id,
            artifact,
            primary,
            url: None,
            basins: Vec::new(),
        }
    }

    /// Attaches the primary object's URL.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Appends a basin.
    #[must_use]
    pub fn basin(mut self, basin: Basin) -> Self {
        self.basins.push(basin);
        self
    }

    /// Appends several basins.
    #[must_use]
    pub fn basins(mut self, basins: impl IntoIterator<Item = Basin>) -> Self {
        self.basins.extend(basins);
        self
    }

    /// Opens the handle. Only the primary object is looked up.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the primary object does not
    /// exist.
    pub async fn open(self) -> Result<DatasetHandle, StorageError> {
        let meta = self
            .store
            .head_object(&self.primary.bucket, &self.primary.key)
            .await?
            .ok_or_else(|| StorageError::not_found(&self.primary.bucket, &self.primary.key))?;

        Ok(DatasetHandle {
            store: self.store,
            resource_id: self.resource_id,
            artifact: self.artifact,
            primary: self.primary,
            meta,
            url: self.url,
            basins: self
                .basins
                .into_iter()
                .map(|basin| BasinSlot {
                    basin,
                    meta: OnceCell::new(),
                })
                .collect(),
        })
    }
}
