// Live transfer statistics: bytes moved, active chunk workers, throughput between snapshots.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

struct StatsSample {
    at: Instant,
    bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    /// Throughput since the previous snapshot.
    pub bps: u64,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub active_workers: u32,
    /// Current running concurrency (after memory-pressure adjustment).
    pub concurrency: u32,
}

impl StatsSnapshot {
    /// Fraction of the file transferred, in `[0, 1]`. Empty files count as done.
    pub fn progress(&self) -> f64 {
        if self.total_bytes == 0 {
            1.0
        } else {
            (self.bytes_transferred as f64 / self.total_bytes as f64).min(1.0)
        }
    }
}

pub struct StatsCollector {
    total_bytes: AtomicU64,
    bytes_total: AtomicU64,
    active_workers: AtomicU32,
    concurrency: AtomicU32,
    last_sample: Mutex<StatsSample>,
}

impl StatsCollector {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes: AtomicU64::new(total_bytes),
            bytes_total: AtomicU64::new(0),
            active_workers: AtomicU32::new(0),
            concurrency: AtomicU32::new(0),
            last_sample: Mutex::new(StatsSample {
                at: Instant::now(),
                bytes: 0,
            }),
        }
    }

    /// Set the file size once it is known (downloads learn it from the network).
    pub fn set_total_bytes(&self, total_bytes: u64) {
        self.total_bytes.store(total_bytes, Ordering::Relaxed);
    }

    pub fn record_transferred(&self, bytes: u64) {
        self.bytes_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn increment_workers(&self) {
        self.active_workers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_workers(&self) {
        self.active_workers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn set_concurrency(&self, concurrency: u32) {
        self.concurrency.store(concurrency, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let now = Instant::now();
        let current = self.bytes_total.load(Ordering::Relaxed);

        let bps = {
            let mut sample = self.last_sample.lock();
            let elapsed = now.duration_since(sample.at).as_secs_f64();
            let bps = if elapsed > 0.1 {
                ((current - sample.bytes) as f64 / elapsed) as u64
            } else {
                0
            };
            sample.at = now;
            sample.bytes = current;
            bps
        };

        StatsSnapshot {
            bps,
            bytes_transferred: current,
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            active_workers: self.active_workers.load(Ordering::Relaxed),
            concurrency: self.concurrency.load(Ordering::Relaxed),
        }
    }

    pub fn total_transferred(&self) -> u64 {
        self.bytes_total.load(Ordering::Relaxed)
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new(0)
    }
}
