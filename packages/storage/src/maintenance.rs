//! Cleanup of abandoned multipart uploads.
//!
//! Clients that start a presigned multipart upload and never finish it
//! leave sessions (and their parts) behind in the store. The pruner aborts
//! sessions older than a staleness window. Younger sessions are never
//! touched, since they may belong to an upload that is still running.
//! Sessions that finish between listing and aborting are counted as gone.

use std::sync::Arc;
use std::time::Duration;

use dcor_storage_models::MultipartUploadInfo;
use futures::TryStreamExt;

use crate::StorageError;
use crate::facade::StoreClient;

/// Outcome of pruning one bucket.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneStats {
    /// Sessions aborted.
    pub aborted: u64,
    /// Sessions kept because they are not old enough.
    pub kept: u64,
    /// Stale sessions that were completed or aborted by someone else before
    /// they could be aborted.
    pub gone: u64,
}

impl PruneStats {
    /// Merge another stats into this one.
    pub const fn merge(&mut self, other: Self) {
        self.aborted += other.aborted;
        self.kept += other.kept;
        self.gone += other.gone;
    }

    /// Total number of sessions considered.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.aborted + self.kept + self.gone
    }
}

impl std::fmt::Display for PruneStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} aborted, {} kept", self.aborted, self.kept)?;
        if self.gone > 0 {
            write!(f, ", {} already gone", self.gone)?;
        }
        Ok(())
    }
}

/// Outcome of a sweep over all buckets.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneReport {
    /// Per-bucket results, in listing order.
    pub buckets: Vec<(String, PruneStats)>,
}

impl PruneReport {
    /// Sum over all buckets.
    #[must_use]
    pub fn total(&self) -> PruneStats {
        let mut total = PruneStats::default();
        for (_, stats) in &self.buckets {
            total.merge(*stats);
        }
        total
    }
}

impl std::fmt::Display for PruneReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (bucket, stats) in &self.buckets {
            writeln!(f, "{bucket}: {stats}")?;
        }
        write!(f, "{} buckets: {}", self.buckets.len(), self.total())
    }
}

/// Aborts stale multipart uploads.
#[derive(Debug)]
pub struct MultipartPruner {
    client: Arc<StoreClient>,
}

impl MultipartPruner {
    /// Creates a pruner.
    #[must_use]
    pub const fn new(client: Arc<StoreClient>) -> Self {
        Self { client }
    }

    /// Lists the open multipart uploads of `bucket`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Store`] if listing fails.
    pub async fn list_multipart_uploads(
        &self,
        bucket: &str,
    ) -> Result<Vec<MultipartUploadInfo>, StorageError> {
        let store = self.client.store();
        let mut uploads = Vec::new();
        let mut marker = None;
        loop {
            let page = store.list_multipart_uploads(bucket, marker).await?;
            uploads.extend(page.items);
            match page.next {
                Some(next) => marker = Some(next),
                None => break,
            }
        }
        Ok(uploads)
    }

    /// Aborts the multipart uploads in `bucket` that are older than
    /// `older_than` and returns how many were aborted.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Store`] if listing or aborting fails.
    pub async fn prune_multipart_uploads(
        &self,
        bucket: &str,
        older_than: Duration,
    ) -> Result<u64, StorageError> {
        Ok(self.prune_bucket(bucket, older_than).await?.aborted)
    }

    /// Prunes every bucket (only circle buckets with `circles_only`).
    ///
    /// # Errors
    ///
    /// Returns the first [`StorageError::Store`] encountered.
    pub async fn prune_all_multipart_uploads(
        &self,
        older_than: Duration,
        circles_only: bool,
    ) -> Result<PruneReport, StorageError> {
        let buckets: Vec<String> = self
            .client
            .iter_buckets(circles_only)
            .map_ok(|b| b.name)
            .try_collect()
            .await?;

        let mut report = PruneReport::default();
        for bucket in buckets {
            let stats = self.prune_bucket(&bucket, older_than).await?;
            report.buckets.push((bucket, stats));
        }
        log::info!("Pruned multipart uploads: {}", report.total());
        Ok(report)
    }

    async fn prune_bucket(
        &self,
        bucket: &str,
        older_than: Duration,
    ) -> Result<PruneStats, StorageError> {
        let now = self.client.clock().now();
        let store = self.client.store();
        let mut stats = PruneStats::default();

        for upload in self.list_multipart_uploads(bucket).await? {
            let age = upload.age(now);
            if age > older_than {
                log::info!(
                    "Aborting multipart upload {} of s3://{bucket}/{} (age {age:.0?})",
                    upload.upload_id,
                    upload.key
                );
                match store
                    .abort_multipart_upload(bucket, &upload.key, &upload.upload_id)
                    .await
                {
                    Ok(()) => stats.aborted += 1,
                    Err(e) if e.is_not_found() => {
                        log::debug!(
                            "Multipart upload {} of s3://{bucket}/{} is already gone",
                            upload.upload_id,
                            upload.key
                        );
                        stats.gone += 1;
                    }
                    Err(e) => return Err(e),
                }
            } else {
                stats.kept += 1;
            }
        }

        Ok(stats)
    }
}
