// Download destination backed by a memory-mapped file and a bitvec completion map.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, Result};
use bitvec::prelude::*;
use memmap2::MmapMut;
use parking_lot::{Mutex, RwLock};

/// Plaintext file assembled from pieces that may arrive in any order.
pub struct ChunkFile {
    /// `None` for empty files, which cannot be mapped.
    mmap: Option<RwLock<MmapMut>>,
    bitmap: Mutex<BitVec>,
    content_length: u64,
    path: PathBuf,
    written_bytes: AtomicU64,
}

impl ChunkFile {
    /// Create (or truncate) `path`, size it to `content_length` and map it.
    ///
    /// `total_pieces` is the number of writes expected before the file is complete.
    pub fn create(path: &Path, content_length: u64, total_pieces: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(content_length)?;

        let mmap = if content_length > 0 {
            // SAFETY: we just created the file and own it exclusively.
            Some(RwLock::new(unsafe { MmapMut::map_mut(&file)? }))
        } else {
            None
        };

        Ok(Self {
            mmap,
            bitmap: Mutex::new(bitvec![0; total_pieces]),
            content_length,
            path: path.to_path_buf(),
            written_bytes: AtomicU64::new(0),
        })
    }

    /// Copy piece `piece` to byte `offset` and mark it written.
    pub fn put_piece(&self, piece: usize, offset: u64, data: &[u8]) -> Result<()> {
        let total = self.total_pieces();
        if piece >= total {
            return Err(anyhow!("piece {} out of range (total {})", piece, total));
        }
        let end = offset + data.len() as u64;
        if end > self.content_length {
            return Err(anyhow!(
                "write {}..{} past end of {} byte file",
                offset,
                end,
                self.content_length
            ));
        }

        if !data.is_empty() {
            let mmap = self
                .mmap
                .as_ref()
                .ok_or_else(|| anyhow!("cannot write into an empty file"))?;
            let mut mmap = mmap.write();
            mmap[offset as usize..end as usize].copy_from_slice(data);
        }

        let mut bitmap = self.bitmap.lock();
        if !bitmap[piece] {
            bitmap.set(piece, true);
            self.written_bytes
                .fetch_add(data.len() as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn has_piece(&self, piece: usize) -> bool {
        let bitmap = self.bitmap.lock();
        piece < bitmap.len() && bitmap[piece]
    }

    pub fn is_complete(&self) -> bool {
        self.bitmap.lock().all()
    }

    /// Indices of pieces not yet written.
    pub fn missing_pieces(&self) -> Vec<usize> {
        self.bitmap.lock().iter_zeros().collect()
    }

    /// Flush the mapping to disk.
    pub fn flush(&self) -> Result<()> {
        if let Some(mmap) = &self.mmap {
            mmap.read().flush()?;
        }
        Ok(())
    }

    pub fn total_pieces(&self) -> usize {
        self.bitmap.lock().len()
    }

    pub fn written_bytes(&self) -> u64 {
        self.written_bytes.load(Ordering::Relaxed)
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
