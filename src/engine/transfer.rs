// Whole-file encrypted upload and download orchestration.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::chunk_policy::{MemoryProbe, SystemMemoryProbe};
use super::downloader::{ChunkOutput, Downloader};
use super::layout::ShardLayout;
use super::retry::{retry_with_backoff, RetryOptions};
use super::session::{TransferSession, UploadSlot};
use super::sink::ChunkFile;
use super::stats::{StatsCollector, StatsSnapshot};
use crate::crypto::{random_index, FileCipher, FileKeys, Mnemonic, ShardHasher};
use crate::error::{TransferError, TransportError};
use crate::source::traits::{
    DownloadLinks, FinishUploadRequest, ShardTransport, StartUploadRequest, StorageNetwork,
    UploadRequestPart, UploadedShard,
};

/// Caller-side control over one transfer: cancel it, watch its progress.
#[derive(Clone, Default)]
pub struct TransferHandle {
    cancel: CancellationToken,
    stats: Arc<StatsCollector>,
}

impl TransferHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort outstanding chunk work. The transfer fails with [`TransferError::Aborted`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn stats_collector(&self) -> Arc<StatsCollector> {
        Arc::clone(&self.stats)
    }
}

/// Plaintext of a download, delivered in file order.
pub struct DownloadStream {
    rx: mpsc::Receiver<Bytes>,
    task: JoinHandle<Result<(), TransferError>>,
    file_size: u64,
}

impl DownloadStream {
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Next plaintext chunk, or `None` once the download has ended (successfully or not).
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Outcome of the download. Call after [`DownloadStream::next_chunk`] returned `None`;
    /// calling it earlier abandons the remaining chunks.
    pub async fn finish(self) -> Result<(), TransferError> {
        drop(self.rx);
        self.task
            .await
            .map_err(|e| TransferError::Unknown(format!("download task failed: {}", e)))?
    }

    /// Collect the whole file in memory.
    pub async fn read_to_end(mut self) -> Result<Vec<u8>, TransferError> {
        let mut out = Vec::with_capacity(self.file_size as usize);
        while let Some(chunk) = self.next_chunk().await {
            out.extend_from_slice(&chunk);
        }
        self.finish().await?;
        Ok(out)
    }
}

/// Encrypts, uploads and downloads whole files against the storage network.
pub struct EncryptedTransfer {
    network: Arc<dyn StorageNetwork>,
    transport: Arc<dyn ShardTransport>,
    mnemonic: Mnemonic,
    retry: RetryOptions,
    probe: Arc<dyn MemoryProbe>,
    memory_poll_interval: Duration,
}

impl EncryptedTransfer {
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
            probe: Arc::new(SystemMemoryProbe::new()),
            memory_poll_interval: Duration::from_millis(2_000),
        }
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_memory_poll_interval(mut self, interval: Duration) -> Self {
        self.memory_poll_interval = interval;
        self
    }

    /// Encrypt `size` bytes from `source` and upload them as one shard. Returns the file id.
    pub async fn upload_file<R>(
        &self,
        bucket_id: &str,
        mut source: R,
        size: u64,
        handle: &TransferHandle,
    ) -> Result<String, TransferError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let stats = handle.stats_collector();
        stats.set_total_bytes(size);

        let request = StartUploadRequest {
            uploads: vec![UploadRequestPart { index: 0, size }],
        };
        let started = retry_with_backoff(
            || self.network.start_upload(bucket_id, request.clone()),
            self.retry.clone(),
        )
        .await?;
        let slots: Vec<UploadSlot> = started
            .uploads
            .into_iter()
            .enumerate()
            .map(|(i, u)| UploadSlot {
                index: i as u32,
                url: u.url,
                uuid: u.uuid,
            })
            .collect();
        let index = random_index();
        let keys = FileKeys::derive(&self.mnemonic, bucket_id, &index)?;
        let session = TransferSession::upload(size, keys, slots);
        let Some(slot) = session.upload_slots().first().cloned() else {
            return Err(TransferError::Protocol("start_upload returned no upload urls".into()));
        };
        let plan = session.plan();
        info!(
            "{} of {} bytes to bucket {} (chunk_size={}, concurrency={})",
            session.direction(),
            size,
            bucket_id,
            plan.chunk_size,
            plan.concurrency
        );

        let (tx, rx) = mpsc::channel::<Bytes>(plan.concurrency.max(1) as usize);
        let encrypt = encrypt_into(
            &mut source,
            session.cipher(),
            size,
            plan.chunk_size,
            tx,
            &stats,
            &handle.cancel,
        );
        let put = async {
            tokio::select! {
                biased;
                _ = handle.cancel.cancelled() => Err(TransportError::Aborted),
                res = self.transport.put(&slot.url, rx, size) => res,
            }
        };
        let (encrypted, put) = tokio::join!(encrypt, put);

        let hash = match (encrypted, put) {
            (Err(e), _) => return Err(e),
            (_, Err(e)) => {
                warn!("shard upload failed: {}", e);
                return Err(TransferError::from_upload(e));
            }
            (Ok(Some(hash)), Ok(())) => hash,
            (Ok(None), Ok(())) => {
                return Err(TransferError::Unknown("upload body closed before the source was read".into()))
            }
        };
        drop(session);

        let finish = FinishUploadRequest {
            index: hex::encode(index),
            shards: vec![UploadedShard {
                hash,
                uuid: slot.uuid.clone(),
            }],
        };
        let finished = retry_with_backoff(
            || self.network.finish_upload(bucket_id, finish.clone()),
            self.retry.clone(),
        )
        .await?;
        info!("upload finished: file {}", finished.id);
        Ok(finished.id)
    }

    /// Start downloading `file_id`. Plaintext arrives in order through the returned stream.
    pub async fn download_file(
        &self,
        bucket_id: &str,
        file_id: &str,
        handle: &TransferHandle,
    ) -> Result<DownloadStream, TransferError> {
        let session = self.open_download(bucket_id, file_id, handle).await?;
        let plan = session.plan();
        let file_size = session.file_size();
        let ranges = match session.layout() {
            Some(layout) => layout.chunk_ranges(plan.chunk_size),
            None => Vec::new(),
        };

        let (tx, rx) = mpsc::channel(plan.concurrency.max(1) as usize);
        let downloader = self.downloader(handle);
        let task = tokio::spawn(async move {
            let result = downloader
                .run(ranges, session.keys(), plan.concurrency, ChunkOutput::Ordered(tx))
                .await;
            drop(session);
            if let Err(e) = &result {
                warn!("download failed: {}", e);
            }
            result
        });

        Ok(DownloadStream {
            rx,
            task,
            file_size,
        })
    }

    /// Download `file_id` straight into `path`, writing chunks as they complete.
    /// Returns the number of bytes written.
    pub async fn download_to_file(
        &self,
        bucket_id: &str,
        file_id: &str,
        path: &Path,
        handle: &TransferHandle,
    ) -> Result<u64, TransferError> {
        let session = self.open_download(bucket_id, file_id, handle).await?;
        let plan = session.plan();
        let ranges = match session.layout() {
            Some(layout) => layout.chunk_ranges(plan.chunk_size),
            None => Vec::new(),
        };

        let file = Arc::new(
            ChunkFile::create(path, session.file_size(), ranges.len()).map_err(sink_error)?,
        );
        self.downloader(handle)
            .run(ranges, session.keys(), plan.concurrency, ChunkOutput::File(file.clone()))
            .await?;

        if !file.is_complete() {
            return Err(TransferError::Protocol(format!(
                "download ended with pieces {:?} missing",
                file.missing_pieces()
            )));
        }
        file.flush().map_err(sink_error)?;
        info!("downloaded {} bytes to {}", file.written_bytes(), file.path().display());
        Ok(file.written_bytes())
    }

    /// Fetch links, check the format version, derive keys and order the shards.
    async fn open_download(
        &self,
        bucket_id: &str,
        file_id: &str,
        handle: &TransferHandle,
    ) -> Result<TransferSession, TransferError> {
        let links: DownloadLinks = retry_with_backoff(
            || self.network.get_download_links(bucket_id, file_id),
            self.retry.clone(),
        )
        .await?;

        match links.version {
            None | Some(1) => return Err(TransferError::UnsupportedVersion(links.version)),
            Some(_) => {}
        }

        let keys = FileKeys::derive_hex(&self.mnemonic, bucket_id, &links.index)?;
        let layout = ShardLayout::new(links.shards, links.size)?;
        let session = TransferSession::download(keys, layout);
        handle.stats.set_total_bytes(session.file_size());
        info!(
            "{} of file {} ({} bytes, chunk_size={}, concurrency={})",
            session.direction(),
            file_id,
            session.file_size(),
            session.plan().chunk_size,
            session.plan().concurrency
        );
        Ok(session)
    }

    fn downloader(&self, handle: &TransferHandle) -> Downloader {
        Downloader::new(
            Arc::clone(&self.transport),
            handle.stats_collector(),
            handle.cancel.clone(),
        )
        .with_probe(Arc::clone(&self.probe))
        .with_retry(self.retry.clone())
        .with_memory_poll_interval(self.memory_poll_interval)
    }
}

/// Read `size` bytes, encrypt them chunk by chunk and feed the PUT body.
///
/// Returns the shard hash, or `None` if the body receiver went away first.
async fn encrypt_into<R>(
    source: &mut R,
    mut cipher: FileCipher,
    size: u64,
    chunk_size: u64,
    tx: mpsc::Sender<Bytes>,
    stats: &StatsCollector,
    cancel: &CancellationToken,
) -> Result<Option<String>, TransferError>
where
    R: AsyncRead + Unpin + Send,
{
    let chunk_size = chunk_size.max(1);
    let mut hasher = ShardHasher::new();
    let mut done = 0u64;

    while done < size {
        let want = chunk_size.min(size - done) as usize;
        let mut buf = vec![0u8; want];
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Aborted),
            res = source.read_exact(&mut buf) => res,
        };
        if let Err(e) = read {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Err(TransferError::Protocol(format!(
                    "source ended early: expected {} bytes",
                    size
                )));
            }
            return Err(TransferError::Io(e));
        }

        cipher.apply(&mut buf);
        hasher.update(&buf);
        let len = buf.len() as u64;

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Aborted),
            res = tx.send(Bytes::from(buf)) => res.is_ok(),
        };
        if !sent {
            debug!("upload body closed after {} bytes", done);
            return Ok(None);
        }
        done += len;
        stats.record_transferred(len);
        debug!("encrypted {}/{} bytes", done, size);
    }

    Ok(Some(hasher.finalize()))
}

fn sink_error(e: anyhow::Error) -> TransferError {
    TransferError::Io(std::io::Error::other(e.to_string()))
}
