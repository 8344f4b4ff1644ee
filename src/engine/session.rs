// Per-file transfer session: direction, sizing plan, key material and shard bookkeeping.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::chunk_policy::{calculate_chunk_size_and_concurrency, ChunkPlan};
use super::layout::ShardLayout;
use crate::crypto::{FileCipher, FileKeys};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => f.write_str("upload"),
            Direction::Download => f.write_str("download"),
        }
    }
}

/// Upload target handed out by the network for one declared part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSlot {
    pub index: u32,
    pub url: String,
    pub uuid: String,
}

/// What the session moves: slots for uploads, the ordered shard layout for downloads.
#[derive(Debug)]
pub enum SessionParts {
    Upload(Vec<UploadSlot>),
    Download(ShardLayout),
}

/// One file in flight. Sizing is fixed at creation; keys are dropped (and zeroed) with it.
pub struct TransferSession {
    direction: Direction,
    file_size: u64,
    plan: ChunkPlan,
    keys: Arc<FileKeys>,
    parts: SessionParts,
}

impl TransferSession {
    pub fn upload(file_size: u64, keys: FileKeys, slots: Vec<UploadSlot>) -> Self {
        Self::new(Direction::Upload, file_size, keys, SessionParts::Upload(slots))
    }

    pub fn download(keys: FileKeys, layout: ShardLayout) -> Self {
        let size = layout.total_size();
        Self::new(Direction::Download, size, keys, SessionParts::Download(layout))
    }

    fn new(direction: Direction, file_size: u64, keys: FileKeys, parts: SessionParts) -> Self {
        let plan = calculate_chunk_size_and_concurrency(file_size);
        debug!(
            "{} session: {} bytes, chunk_size={} concurrency={}",
            direction, file_size, plan.chunk_size, plan.concurrency
        );
        Self {
            direction,
            file_size,
            plan,
            keys: Arc::new(keys),
            parts,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn plan(&self) -> ChunkPlan {
        self.plan
    }

    pub fn cipher(&self) -> FileCipher {
        self.keys.cipher()
    }

    /// Shared handle for chunk workers; the key is zeroed when the last handle drops.
    pub fn keys(&self) -> Arc<FileKeys> {
        Arc::clone(&self.keys)
    }

    pub fn upload_slots(&self) -> &[UploadSlot] {
        match &self.parts {
            SessionParts::Upload(slots) => slots,
            SessionParts::Download(_) => &[],
        }
    }

    pub fn layout(&self) -> Option<&ShardLayout> {
        match &self.parts {
            SessionParts::Download(layout) => Some(layout),
            SessionParts::Upload(_) => None,
        }
    }
}

impl fmt::Debug for TransferSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferSession")
            .field("direction", &self.direction)
            .field("file_size", &self.file_size)
            .field("plan", &self.plan)
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}
