// Multi-connection chunk downloader: fetches shard ranges in parallel, decrypts, and emits them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::chunk_policy::{adjust_concurrency_for_memory_pressure, MemoryProbe, SystemMemoryProbe};
use super::layout::ShardRange;
use super::retry::{retry_with_backoff, RetryOptions};
use super::sink::ChunkFile;
use super::stats::StatsCollector;
use crate::crypto::FileKeys;
use crate::error::TransferError;
use crate::source::traits::ShardTransport;

/// Where decrypted chunks go.
pub enum ChunkOutput {
    /// Strictly in plaintext order through a bounded channel.
    Ordered(mpsc::Sender<Bytes>),
    /// Straight into a mapped file at each chunk's offset, in completion order.
    File(Arc<ChunkFile>),
}

/// Fetch one shard range (retrying rate limits) and decrypt it at its plaintext offset.
pub async fn fetch_and_decrypt(
    transport: &dyn ShardTransport,
    range: &ShardRange,
    keys: &FileKeys,
    retry: RetryOptions,
) -> Result<Bytes, TransferError> {
    let data = retry_with_backoff(
        || transport.fetch_range(&range.url, range.start, range.end),
        retry,
    )
    .await?;

    if data.len() as u64 != range.byte_len() {
        return Err(TransferError::Protocol(format!(
            "chunk {} returned {} bytes, expected {}",
            range.seq,
            data.len(),
            range.byte_len()
        )));
    }

    let mut buf = data.to_vec();
    keys.cipher().apply_at(range.file_offset, &mut buf);
    Ok(Bytes::from(buf))
}

pub struct Downloader {
    transport: Arc<dyn ShardTransport>,
    stats: Arc<StatsCollector>,
    probe: Arc<dyn MemoryProbe>,
    retry: RetryOptions,
    memory_poll_interval: Duration,
    cancel: CancellationToken,
}

impl Downloader {
    pub fn new(
        transport: Arc<dyn ShardTransport>,
        stats: Arc<StatsCollector>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            stats,
            probe: Arc::new(SystemMemoryProbe::new()),
            retry: RetryOptions::default(),
            memory_poll_interval: Duration::from_millis(2_000),
            cancel,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_memory_poll_interval(mut self, interval: Duration) -> Self {
        self.memory_poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Download every range in `ranges` with at most `max_concurrency` fetches in flight.
    ///
    /// The running concurrency starts at `max_concurrency` and follows memory pressure.
    /// For ordered output, fetched-but-unsent chunks count against the same limit.
    pub async fn run(
        &self,
        ranges: Vec<ShardRange>,
        keys: Arc<FileKeys>,
        max_concurrency: u32,
        output: ChunkOutput,
    ) -> Result<(), TransferError> {
        let max_concurrency = max_concurrency.max(1);
        let total = ranges.len();
        let mut ranges = ranges.into_iter();
        let mut tasks: JoinSet<Result<(usize, u64, Bytes), TransferError>> = JoinSet::new();
        let mut buffered: BTreeMap<usize, Bytes> = BTreeMap::new();
        let mut next_spawn = 0usize;
        let mut next_emit = 0usize;
        let mut running = max_concurrency;
        self.stats.set_concurrency(running);

        let mut ticker = tokio::time::interval(self.memory_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately.
        ticker.tick().await;

        debug!("downloading {} chunks, concurrency {}", total, running);

        loop {
            while next_spawn < total && tasks.len() < running as usize {
                let window_open = match &output {
                    ChunkOutput::Ordered(_) => next_spawn < next_emit + running as usize,
                    ChunkOutput::File(_) => true,
                };
                if !window_open {
                    break;
                }
                let Some(range) = ranges.next() else {
                    break;
                };
                next_spawn += 1;
                self.spawn_chunk(&mut tasks, range, keys.clone());
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tasks.abort_all();
                    debug!("download cancelled with {} chunks in flight", tasks.len());
                    return Err(TransferError::Aborted);
                }
                _ = ticker.tick() => {
                    let next = adjust_concurrency_for_memory_pressure(running, max_concurrency, self.probe.as_ref());
                    if next != running {
                        info!("download concurrency {} -> {}", running, next);
                        running = next;
                        self.stats.set_concurrency(running);
                    }
                }
                joined = tasks.join_next() => {
                    let (seq, offset, data) = match joined {
                        Some(Ok(Ok(done))) => done,
                        Some(Ok(Err(e))) => {
                            warn!("chunk download failed: {}", e);
                            tasks.abort_all();
                            return Err(e);
                        }
                        Some(Err(e)) => {
                            tasks.abort_all();
                            return Err(TransferError::Unknown(format!("chunk task failed: {}", e)));
                        }
                        None => continue,
                    };

                    match &output {
                        ChunkOutput::Ordered(tx) => {
                            buffered.insert(seq, data);
                            while let Some(data) = buffered.remove(&next_emit) {
                                let sent = tokio::select! {
                                    _ = self.cancel.cancelled() => false,
                                    res = tx.send(data) => res.is_ok(),
                                };
                                if !sent {
                                    tasks.abort_all();
                                    debug!("download receiver gone at chunk {}", next_emit);
                                    return Err(TransferError::Aborted);
                                }
                                next_emit += 1;
                            }
                        }
                        ChunkOutput::File(file) => {
                            file.put_piece(seq, offset, &data)
                                .map_err(|e| TransferError::Io(std::io::Error::other(e.to_string())))?;
                            next_emit += 1;
                        }
                    }
                }
            }
        }

        debug!("download finished: {} chunks", next_emit);
        Ok(())
    }

    fn spawn_chunk(
        &self,
        tasks: &mut JoinSet<Result<(usize, u64, Bytes), TransferError>>,
        range: ShardRange,
        keys: Arc<FileKeys>,
    ) {
        let transport = Arc::clone(&self.transport);
        let stats = Arc::clone(&self.stats);
        let retry = self.retry.clone();

        tasks.spawn(async move {
            stats.increment_workers();
            let result = fetch_and_decrypt(transport.as_ref(), &range, &keys, retry).await;
            stats.decrement_workers();

            let data = result?;
            stats.record_transferred(data.len() as u64);
            debug!("chunk {} downloaded ({} bytes)", range.seq, data.len());
            Ok((range.seq, range.file_offset, data))
        });
    }
}
