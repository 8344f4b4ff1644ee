use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::crypto::Mnemonic;
use crate::engine::retry::RetryOptions;
use crate::engine::transfer::{DownloadStream, EncryptedTransfer, TransferHandle};
use crate::engine::trash::{purge_trash, TrashConfig};
use crate::error::TransferError;
use crate::server::bridge::RangeStreamBridge;
use crate::server::controller::{ChunkController, DecryptingRangeFetcher, RangeFetcher};
use crate::server::handler::StreamServer;
use crate::server::protocol::RegisterVideoSession;
use crate::source::traits::{ShardTransport, StorageNetwork, TrashClient, TrashItem};

/// Information about a registered stream session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSessionInfo {
    pub session_id: String,
    pub stream_url: String,
}

struct Streaming {
    server: StreamServer,
    fetcher: Arc<DecryptingRangeFetcher>,
    controller_cancel: CancellationToken,
    controller: JoinHandle<()>,
}

/// One engine per signed-in user: transfers, trash purge and playback streaming.
pub struct TransferEngine {
    config: EngineConfig,
    network: Arc<dyn StorageNetwork>,
    transport: Arc<dyn ShardTransport>,
    mnemonic: Mnemonic,
    bridge: Arc<RangeStreamBridge>,
    streaming: Mutex<Option<Streaming>>,
    /// Held across a whole `start_streaming` so only one server and controller attach.
    start_lock: tokio::sync::Mutex<()>,
}

impl TransferEngine {
    pub fn new(
        config: EngineConfig,
        network: Arc<dyn StorageNetwork>,
        transport: Arc<dyn ShardTransport>,
        mnemonic: Mnemonic,
    ) -> Self {
        let bridge = Arc::new(RangeStreamBridge::from_config(&config));
        Self {
            config,
            network,
            transport,
            mnemonic,
            bridge,
            streaming: Mutex::new(None),
            start_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bridge(&self) -> &Arc<RangeStreamBridge> {
        &self.bridge
    }

    fn retry_options(&self) -> RetryOptions {
        RetryOptions::with_max_retries(self.config.max_retries)
    }

    fn transfer(&self) -> EncryptedTransfer {
        EncryptedTransfer::new(
            Arc::clone(&self.network),
            Arc::clone(&self.transport),
            self.mnemonic.clone(),
        )
        .with_retry(self.retry_options())
        .with_memory_poll_interval(Duration::from_millis(self.config.memory_poll_interval_ms))
    }

    /// Encrypt and upload `size` bytes from `source`. Returns the new file id.
    pub async fn upload_file<R>(
        &self,
        bucket_id: &str,
        source: R,
        size: u64,
        handle: &TransferHandle,
    ) -> Result<String, TransferError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.transfer()
            .upload_file(bucket_id, source, size, handle)
            .await
    }

    pub async fn download_file(
        &self,
        bucket_id: &str,
        file_id: &str,
        handle: &TransferHandle,
    ) -> Result<DownloadStream, TransferError> {
        self.transfer().download_file(bucket_id, file_id, handle).await
    }

    pub async fn download_to_file(
        &self,
        bucket_id: &str,
        file_id: &str,
        path: &Path,
        handle: &TransferHandle,
    ) -> Result<u64, TransferError> {
        self.transfer()
            .download_to_file(bucket_id, file_id, path, handle)
            .await
    }

    /// Permanently delete trashed items using the configured batch shape.
    pub async fn purge_trash(
        &self,
        client: &dyn TrashClient,
        items: Vec<TrashItem>,
    ) -> Result<usize, TransferError> {
        purge_trash(
            client,
            items,
            TrashConfig::from(&self.config),
            self.retry_options(),
        )
        .await
    }

    /// Start the stream server and attach a decrypting controller. Idempotent, including
    /// under concurrent calls.
    pub async fn start_streaming(&self) -> Result<()> {
        let _starting = self.start_lock.lock().await;
        if self.streaming.lock().is_some() {
            return Ok(());
        }

        let server = StreamServer::start(Arc::clone(&self.bridge), &self.config.bind_addr).await?;
        let fetcher = Arc::new(
            DecryptingRangeFetcher::new(
                Arc::clone(&self.network),
                Arc::clone(&self.transport),
                self.mnemonic.clone(),
            )
            .with_retry(self.retry_options()),
        );
        let controller_cancel = CancellationToken::new();
        let controller = ChunkController::spawn(
            &self.bridge,
            Arc::clone(&fetcher) as Arc<dyn RangeFetcher>,
            controller_cancel.clone(),
        );

        info!("streaming ready on port {}", server.port());
        *self.streaming.lock() = Some(Streaming {
            server,
            fetcher,
            controller_cancel,
            controller,
        });
        Ok(())
    }

    /// Register a file for playback and return the URL a player should open.
    pub fn register_video_session(
        &self,
        file_id: &str,
        bucket_id: &str,
        file_size: u64,
    ) -> Result<StreamSessionInfo> {
        let streaming = self.streaming.lock();
        let server = &streaming
            .as_ref()
            .ok_or_else(|| anyhow!("streaming not started"))?
            .server;
        let session = self.bridge.register(RegisterVideoSession {
            file_id: file_id.to_string(),
            bucket_id: bucket_id.to_string(),
            file_size,
        });
        Ok(StreamSessionInfo {
            stream_url: server.url_for_session(&session.session_id),
            session_id: session.session_id,
        })
    }

    /// Close a playback session. The cached links and keys of its file are dropped once
    /// no other session plays the same file.
    pub fn close_session(&self, session_id: &str) -> bool {
        let Some(session) = self.bridge.session(session_id) else {
            return false;
        };
        if !self.bridge.unregister(session_id) {
            return false;
        }
        if self.bridge.sessions_for_file(&session.bucket_id, &session.file_id) == 0 {
            if let Some(streaming) = self.streaming.lock().as_ref() {
                if streaming.fetcher.forget(&session.bucket_id, &session.file_id) {
                    debug!("released stream keys for file {}", session.file_id);
                }
            }
        }
        true
    }

    /// Files whose links and keys the stream controller currently holds.
    pub fn cached_stream_files(&self) -> usize {
        self.streaming
            .lock()
            .as_ref()
            .map_or(0, |streaming| streaming.fetcher.cached_files())
    }

    /// Stop streaming and release the server.
    pub fn dispose(&self) {
        if let Some(streaming) = self.streaming.lock().take() {
            streaming.controller_cancel.cancel();
            streaming.controller.abort();
            self.bridge.detach_controller();
            streaming.server.shutdown();
            info!("transfer engine disposed");
        }
    }
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}
