use anyhow::{Context, Result};
use serde::Deserialize;

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

/// Files below this size are transferred as a single chunk.
pub const SINGLE_CHUNK_LIMIT_BYTES: u64 = 100 * MIB;

/// Upper bound (exclusive) of the fixed 50 MiB chunk tier.
pub const FIXED_CHUNK_LIMIT_BYTES: u64 = 500 * MIB;

/// Chunk size used by the fixed tier.
pub const FIXED_CHUNK_SIZE_BYTES: u64 = 50 * MIB;

/// Upper bound (inclusive) of the 16-way split tier.
pub const SIXTEEN_WAY_LIMIT_BYTES: u64 = 2 * GIB;

/// Upper bound (inclusive) of the 36-way split tier (3.43 GiB).
pub const THIRTY_SIX_WAY_LIMIT_BYTES: u64 = 343 * GIB / 100;

/// Hard ceiling for per-transfer parallelism.
pub const MAX_TRANSFER_CONCURRENCY: u32 = 16;

/// Below this used/limit ratio the downloader may add a worker.
pub const MEMORY_LOW_WATERMARK: f64 = 0.70;

/// At or above this used/limit ratio the downloader sheds a worker.
pub const MEMORY_HIGH_WATERMARK: f64 = 0.80;

/// Largest window served for an open-ended range request (5 MiB).
pub const STREAM_WINDOW_BYTES: u64 = 5 * MIB;

/// How long a range request waits for the controller before failing.
pub const CHUNK_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Chunk requests queued for the controller before the endpoint waits.
pub const CONTROLLER_QUEUE_DEPTH: usize = 64;

/// Default number of rate-limit retries before the final attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Header carrying the rate-limit reset delay in milliseconds.
pub const RATE_LIMIT_RESET_HEADER: &str = "x-internxt-ratelimit-reset";
pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-internxt-ratelimit-limit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-internxt-ratelimit-remaining";

/// Path prefix intercepted by the stream bridge.
pub const STREAM_PATH_PREFIX: &str = "/video-stream/";

/// Content type advertised for streamed files.
pub const STREAM_CONTENT_TYPE: &str = "video/mp4";

/// Top-level configuration for the transfer engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Rate-limit retries before the final unconditional attempt.
    pub max_retries: u32,
    /// How often long downloads re-evaluate memory pressure.
    pub memory_poll_interval_ms: u64,
    /// Window served for open-ended range requests.
    pub stream_window_bytes: u64,
    /// Deadline for a single controller chunk request.
    pub chunk_request_timeout_ms: u64,
    /// Items per trash deletion batch.
    pub trash_batch_size: usize,
    /// Trash batches allowed in flight per wave.
    pub trash_max_concurrent_batches: usize,
    /// Address the stream server binds to.
    pub bind_addr: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            memory_poll_interval_ms: 2_000,
            stream_window_bytes: STREAM_WINDOW_BYTES,
            chunk_request_timeout_ms: CHUNK_REQUEST_TIMEOUT_MS,
            trash_batch_size: 20,
            trash_max_concurrent_batches: 3,
            bind_addr: "127.0.0.1:0".to_string(),
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document; absent keys keep their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("invalid engine config")
    }
}
