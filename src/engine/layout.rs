// Shard layout: orders a file's shards and maps plaintext byte windows onto shard ranges.

use crate::error::TransferError;
use crate::source::traits::ShardRef;

/// One contiguous range fetch inside a single shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardRange {
    /// Position of this range in plaintext order.
    pub seq: usize,
    pub url: String,
    /// Inclusive start within the shard object.
    pub start: u64,
    /// Inclusive end within the shard object.
    pub end: u64,
    /// Absolute plaintext offset of `start`.
    pub file_offset: u64,
}

impl ShardRange {
    pub fn byte_len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Shards of one file in index order, with their plaintext offsets.
#[derive(Debug, Clone)]
pub struct ShardLayout {
    shards: Vec<ShardRef>,
    offsets: Vec<u64>,
    total: u64,
}

impl ShardLayout {
    /// Sort `shards` by index. Duplicate indices are rejected, and so is a size mismatch
    /// when `declared_size` is non-zero.
    pub fn new(mut shards: Vec<ShardRef>, declared_size: u64) -> Result<Self, TransferError> {
        shards.sort_by_key(|s| s.index);
        if let Some(pair) = shards.windows(2).find(|w| w[0].index == w[1].index) {
            return Err(TransferError::Protocol(format!(
                "duplicate shard index {}",
                pair[0].index
            )));
        }

        let mut offsets = Vec::with_capacity(shards.len());
        let mut total = 0u64;
        for shard in &shards {
            offsets.push(total);
            total += shard.size;
        }

        if declared_size > 0 && total != declared_size {
            return Err(TransferError::Protocol(format!(
                "shards hold {} bytes but file size is {}",
                total, declared_size
            )));
        }

        Ok(Self {
            shards,
            offsets,
            total,
        })
    }

    pub fn shards(&self) -> &[ShardRef] {
        &self.shards
    }

    pub fn total_size(&self) -> u64 {
        self.total
    }

    /// Split every shard into range fetches of at most `chunk_size` bytes, in plaintext order.
    pub fn chunk_ranges(&self, chunk_size: u64) -> Vec<ShardRange> {
        let chunk_size = chunk_size.max(1);
        let mut out = Vec::new();
        for (shard, &base) in self.shards.iter().zip(&self.offsets) {
            let mut start = 0u64;
            while start < shard.size {
                let end = (start + chunk_size).min(shard.size) - 1;
                out.push(ShardRange {
                    seq: out.len(),
                    url: shard.url.clone(),
                    start,
                    end,
                    file_offset: base + start,
                });
                start = end + 1;
            }
        }
        out
    }

    /// Ranges covering the inclusive plaintext window `[start, end]`.
    pub fn window(&self, start: u64, end: u64) -> Result<Vec<ShardRange>, TransferError> {
        if start > end || end >= self.total {
            return Err(TransferError::Protocol(format!(
                "window {}-{} outside file of {} bytes",
                start, end, self.total
            )));
        }

        let mut out = Vec::new();
        for (shard, &base) in self.shards.iter().zip(&self.offsets) {
            if shard.size == 0 {
                continue;
            }
            let shard_last = base + shard.size - 1;
            if shard_last < start || base > end {
                continue;
            }
            let from = start.max(base);
            let to = end.min(shard_last);
            out.push(ShardRange {
                seq: out.len(),
                url: shard.url.clone(),
                start: from - base,
                end: to - base,
                file_offset: from,
            });
        }
        Ok(out)
    }
}
