// Chunk controller: answers bridged range requests by fetching and decrypting shard ranges.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::future::try_join_all;
use parking_lot::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::bridge::RangeStreamBridge;
use super::protocol::{ChunkRequest, ChunkResponse};
use crate::config::CONTROLLER_QUEUE_DEPTH;
use crate::crypto::{FileKeys, Mnemonic};
use crate::engine::downloader::fetch_and_decrypt;
use crate::engine::layout::ShardLayout;
use crate::engine::retry::{retry_with_backoff, RetryOptions};
use crate::error::TransferError;
use crate::source::traits::{ShardTransport, StorageNetwork};

/// Produces the plaintext for one chunk request.
#[async_trait]
pub trait RangeFetcher: Send + Sync {
    async fn fetch(&self, request: &ChunkRequest) -> Result<Bytes, TransferError>;
}

/// Keys and shard layout of a file opened for streaming.
struct OpenFile {
    keys: FileKeys,
    layout: ShardLayout,
}

/// Fetches shard ranges from the network and decrypts them at their plaintext offsets.
/// Download links are resolved once per file and cached.
pub struct DecryptingRangeFetcher {
    network: Arc<dyn StorageNetwork>,
    transport: Arc<dyn ShardTransport>,
    mnemonic: Mnemonic,
    retry: RetryOptions,
    files: Mutex<HashMap<(String, String), Arc<OpenFile>>>,
}

impl DecryptingRangeFetcher {
    pub fn new(
        network: Arc<dyn StorageNetwork>,
        transport: Arc<dyn ShardTransport>,
        mnemonic: Mnemonic,
    ) -> Self {
        Self {
            network,
            transport,
            mnemonic,
            retry: RetryOptions::default(),
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    /// Drop the cached links and keys of a file.
    pub fn forget(&self, bucket_id: &str, file_id: &str) -> bool {
        self.files
            .lock()
            .remove(&(bucket_id.to_string(), file_id.to_string()))
            .is_some()
    }

    pub fn cached_files(&self) -> usize {
        self.files.lock().len()
    }

    async fn open(&self, bucket_id: &str, file_id: &str) -> Result<Arc<OpenFile>, TransferError> {
        let key = (bucket_id.to_string(), file_id.to_string());
        let cached = self.files.lock().get(&key).cloned();
        if let Some(file) = cached {
            return Ok(file);
        }

        let links = retry_with_backoff(
            || self.network.get_download_links(bucket_id, file_id),
            self.retry.clone(),
        )
        .await?;
        match links.version {
            None | Some(1) => return Err(TransferError::UnsupportedVersion(links.version)),
            Some(_) => {}
        }

        let file = Arc::new(OpenFile {
            keys: FileKeys::derive_hex(&self.mnemonic, bucket_id, &links.index)?,
            layout: ShardLayout::new(links.shards, links.size)?,
        });
        debug!(
            "opened file {} for streaming ({} shards)",
            file_id,
            file.layout.shards().len()
        );
        self.files.lock().insert(key, Arc::clone(&file));
        Ok(file)
    }
}

#[async_trait]
impl RangeFetcher for DecryptingRangeFetcher {
    async fn fetch(&self, request: &ChunkRequest) -> Result<Bytes, TransferError> {
        let file = self.open(&request.bucket_id, &request.file_id).await?;
        let ranges = file.layout.window(request.start, request.end)?;

        let parts = try_join_all(ranges.iter().map(|range| {
            fetch_and_decrypt(self.transport.as_ref(), range, &file.keys, self.retry.clone())
        }))
        .await?;

        if parts.len() == 1 {
            return Ok(parts.into_iter().next().unwrap_or_default());
        }
        let mut out = BytesMut::with_capacity(request.len() as usize);
        for part in parts {
            out.extend_from_slice(&part);
        }
        Ok(out.freeze())
    }
}

/// Serves chunk requests from a bridge until cancelled or detached.
pub struct ChunkController;

impl ChunkController {
    /// Attach to `bridge` and answer each request concurrently with `fetcher`.
    pub fn spawn(
        bridge: &Arc<RangeStreamBridge>,
        fetcher: Arc<dyn RangeFetcher>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let mut link = bridge.attach_controller(CONTROLLER_QUEUE_DEPTH);
        let replier = link.replier();

        tokio::spawn(async move {
            let mut inflight = JoinSet::new();
            info!("chunk controller started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    Some(_) = inflight.join_next(), if !inflight.is_empty() => {}
                    request = link.recv() => {
                        let Some(request) = request else { break };
                        let fetcher = Arc::clone(&fetcher);
                        let replier = replier.clone();
                        inflight.spawn(async move {
                            let response = match fetcher.fetch(&request).await {
                                Ok(data) => ChunkResponse::data(request.request_id.clone(), data),
                                Err(e) => {
                                    warn!("chunk request {} failed: {}", request.request_id, e);
                                    ChunkResponse::error(request.request_id.clone(), e.to_string())
                                }
                            };
                            if !replier.reply(response) {
                                debug!("reply for {} arrived after the request settled", request.request_id);
                            }
                        });
                    }
                }
            }
            inflight.abort_all();
            info!("chunk controller stopped");
        })
    }
}
