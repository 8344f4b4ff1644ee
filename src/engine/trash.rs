// Bulk permanent deletion of trashed items.

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, info};

use super::batch::process_batch_concurrently;
use super::retry::{retry_with_backoff, RetryOptions};
use crate::config::EngineConfig;
use crate::error::TransferError;
use crate::source::traits::{TrashClient, TrashItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrashConfig {
    pub batch_size: usize,
    pub max_concurrent_batches: usize,
}

impl Default for TrashConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            max_concurrent_batches: 3,
        }
    }
}

impl From<&EngineConfig> for TrashConfig {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            batch_size: cfg.trash_batch_size,
            max_concurrent_batches: cfg.trash_max_concurrent_batches,
        }
    }
}

/// Permanently delete `items`, batch by batch. Returns how many items were deleted.
///
/// Each batch call waits out rate limits. The first failing wave stops the purge; batches
/// already deleted stay deleted.
pub async fn purge_trash(
    client: &dyn TrashClient,
    items: Vec<TrashItem>,
    config: TrashConfig,
    retry: RetryOptions,
) -> Result<usize, TransferError> {
    let total = items.len();
    let deleted = AtomicUsize::new(0);

    process_batch_concurrently(items, config.batch_size, config.max_concurrent_batches, |batch| {
        let retry = retry.clone();
        let deleted = &deleted;
        async move {
            retry_with_backoff(|| client.delete_items(&batch), retry).await?;
            deleted.fetch_add(batch.len(), Ordering::Relaxed);
            debug!("deleted batch of {} trash items", batch.len());
            Ok::<_, TransferError>(())
        }
    })
    .await?;

    let deleted = deleted.load(Ordering::Relaxed);
    info!("purged {}/{} trash items", deleted, total);
    Ok(deleted)
}
