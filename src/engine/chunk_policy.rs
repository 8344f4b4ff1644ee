// Chunk sizing and live parallelism control for whole-file transfers.

use anyhow::Result;
use parking_lot::Mutex;
use sysinfo::System;
use tracing::debug;

use crate::config::{
    FIXED_CHUNK_LIMIT_BYTES, FIXED_CHUNK_SIZE_BYTES, MAX_TRANSFER_CONCURRENCY,
    MEMORY_HIGH_WATERMARK, MEMORY_LOW_WATERMARK, SINGLE_CHUNK_LIMIT_BYTES,
    SIXTEEN_WAY_LIMIT_BYTES, THIRTY_SIX_WAY_LIMIT_BYTES,
};

/// Chunk size and parallelism chosen for one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub chunk_size: u64,
    pub concurrency: u32,
}

impl ChunkPlan {
    /// Number of chunks needed to cover `file_size` bytes. Empty files still have one chunk.
    pub fn chunk_count(&self, file_size: u64) -> u64 {
        if file_size == 0 || self.chunk_size == 0 {
            return 1;
        }
        file_size.div_ceil(self.chunk_size)
    }

    /// Half-open byte window `[start, end)` of chunk `index`; the last chunk takes the remainder.
    pub fn chunk_bounds(&self, index: u64, file_size: u64) -> (u64, u64) {
        let start = (index * self.chunk_size).min(file_size);
        let end = start.saturating_add(self.chunk_size).min(file_size);
        (start, end)
    }
}

/// Pick chunk size and concurrency for a file of `file_size` bytes.
pub fn calculate_chunk_size_and_concurrency(file_size: u64) -> ChunkPlan {
    let split = |parts: u64, concurrency: u32| ChunkPlan {
        chunk_size: file_size.div_ceil(parts),
        concurrency,
    };

    if file_size < SINGLE_CHUNK_LIMIT_BYTES {
        ChunkPlan {
            chunk_size: file_size,
            concurrency: 1,
        }
    } else if file_size < FIXED_CHUNK_LIMIT_BYTES {
        ChunkPlan {
            chunk_size: FIXED_CHUNK_SIZE_BYTES,
            concurrency: 6,
        }
    } else if file_size <= SIXTEEN_WAY_LIMIT_BYTES {
        split(16, 10)
    } else if file_size <= THIRTY_SIX_WAY_LIMIT_BYTES {
        split(36, MAX_TRANSFER_CONCURRENCY)
    } else {
        split(103, MAX_TRANSFER_CONCURRENCY)
    }
}

/// Source of the current memory usage ratio (used / limit).
pub trait MemoryProbe: Send + Sync {
    /// `Ok(None)` when the platform offers no usable figure.
    fn usage_ratio(&self) -> Result<Option<f64>>;
}

/// Reads system memory pressure through `sysinfo`.
#[derive(Default)]
pub struct SystemMemoryProbe {
    system: Mutex<System>,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn usage_ratio(&self) -> Result<Option<f64>> {
        let mut system = self.system.lock();
        system.refresh_memory();
        Ok(memory_ratio(system.total_memory(), system.available_memory()))
    }
}

/// Used/total ratio from total and available byte counts. `None` when the total is unknown.
pub fn memory_ratio(total: u64, available: u64) -> Option<f64> {
    if total == 0 {
        return None;
    }
    Some(total.saturating_sub(available) as f64 / total as f64)
}

/// Nudge a running concurrency value according to memory pressure.
///
/// Probe failures and missing data leave `current` as is. The result always lies in `[1, max]`.
pub fn adjust_concurrency_for_memory_pressure(
    current: u32,
    max: u32,
    probe: &dyn MemoryProbe,
) -> u32 {
    let ratio = match probe.usage_ratio() {
        Ok(ratio) => ratio,
        Err(e) => {
            debug!("memory probe failed, keeping concurrency {}: {}", current, e);
            None
        }
    };
    adjust_concurrency(current, max, ratio)
}

/// Pure form of [`adjust_concurrency_for_memory_pressure`].
pub fn adjust_concurrency(current: u32, max: u32, ratio: Option<f64>) -> u32 {
    let max = max.max(1);
    let next = match ratio {
        Some(r) if r < MEMORY_LOW_WATERMARK => current.saturating_add(1),
        Some(r) if r >= MEMORY_HIGH_WATERMARK && current > 1 => current - 1,
        _ => current,
    };
    next.clamp(1, max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GIB, MIB};

    struct FixedProbe(Option<f64>);

    impl MemoryProbe for FixedProbe {
        fn usage_ratio(&self) -> Result<Option<f64>> {
            Ok(self.0)
        }
    }

    struct BrokenProbe;

    impl MemoryProbe for BrokenProbe {
        fn usage_ratio(&self) -> Result<Option<f64>> {
            Err(anyhow::anyhow!("probe offline"))
        }
    }

    #[test]
    fn test_small_files_are_single_chunk() {
        for size in [0, 1, 4096, 99 * MIB, 100 * MIB - 1] {
            let plan = calculate_chunk_size_and_concurrency(size);
            assert_eq!(plan.chunk_size, size);
            assert_eq!(plan.concurrency, 1);
            assert_eq!(plan.chunk_count(size), 1);
        }
    }

    #[test]
    fn test_fixed_tier() {
        let plan = calculate_chunk_size_and_concurrency(100 * MIB);
        assert_eq!(plan, ChunkPlan { chunk_size: 50 * MIB, concurrency: 6 });
        let plan = calculate_chunk_size_and_concurrency(500 * MIB - 1);
        assert_eq!(plan.chunk_size, 50 * MIB);
        assert_eq!(plan.chunk_count(500 * MIB - 1), 10);
    }

    #[test]
    fn test_sixteen_way_tier() {
        for size in [500 * MIB, 500 * MIB + 7, GIB, 2 * GIB - 3, 2 * GIB] {
            let plan = calculate_chunk_size_and_concurrency(size);
            assert_eq!(plan.chunk_size, size.div_ceil(16));
            assert_eq!(plan.concurrency, 10);
            assert_eq!(plan.chunk_count(size), 16);
        }
    }

    #[test]
    fn test_large_tiers_cap_concurrency() {
        let plan = calculate_chunk_size_and_concurrency(3 * GIB);
        assert_eq!(plan.chunk_size, (3 * GIB).div_ceil(36));
        assert_eq!(plan.concurrency, 16);

        let huge = 50 * GIB;
        let plan = calculate_chunk_size_and_concurrency(huge);
        assert_eq!(plan.chunk_size, huge.div_ceil(103));
        assert_eq!(plan.chunk_count(huge), 103);
        assert_eq!(plan.concurrency, 16);
    }

    #[test]
    fn test_chunk_bounds_cover_file() {
        let size = 1000;
        let plan = ChunkPlan { chunk_size: 300, concurrency: 2 };
        assert_eq!(plan.chunk_count(size), 4);
        assert_eq!(plan.chunk_bounds(0, size), (0, 300));
        assert_eq!(plan.chunk_bounds(3, size), (900, 1000));

        let empty = calculate_chunk_size_and_concurrency(0);
        assert_eq!(empty.chunk_bounds(0, 0), (0, 0));
    }

    #[test]
    fn test_adjust_follows_watermarks() {
        assert_eq!(adjust_concurrency_for_memory_pressure(4, 10, &FixedProbe(Some(0.5))), 5);
        assert_eq!(adjust_concurrency_for_memory_pressure(10, 10, &FixedProbe(Some(0.1))), 10);
        assert_eq!(adjust_concurrency_for_memory_pressure(4, 10, &FixedProbe(Some(0.75))), 4);
        assert_eq!(adjust_concurrency_for_memory_pressure(4, 10, &FixedProbe(Some(0.80))), 3);
        assert_eq!(adjust_concurrency_for_memory_pressure(1, 10, &FixedProbe(Some(0.99))), 1);
    }

    #[test]
    fn test_adjust_ignores_unavailable_probe() {
        assert_eq!(adjust_concurrency_for_memory_pressure(3, 10, &FixedProbe(None)), 3);
        assert_eq!(adjust_concurrency_for_memory_pressure(3, 10, &BrokenProbe), 3);
    }

    #[test]
    fn test_adjust_stays_in_bounds() {
        let ratios = [None, Some(0.0), Some(0.69), Some(0.7), Some(0.79), Some(0.8), Some(1.5)];
        for max in 0..=17u32 {
            for current in 0..=20u32 {
                for ratio in ratios {
                    let next = adjust_concurrency(current, max, ratio);
                    assert!(next >= 1, "current={current} max={max} ratio={ratio:?}");
                    assert!(next <= max.max(1), "current={current} max={max} ratio={ratio:?}");
                }
            }
        }
    }

    #[test]
    fn test_memory_ratio() {
        let ratio = memory_ratio(16_000, 4_000).unwrap();
        assert!((ratio - 0.75).abs() < 1e-9);
        assert_eq!(memory_ratio(16_000, 20_000), Some(0.0));
        assert_eq!(memory_ratio(0, 0), None);
    }

    #[test]
    fn test_system_probe_reports_a_ratio_in_range() {
        if let Some(ratio) = SystemMemoryProbe::new().usage_ratio().unwrap() {
            assert!((0.0..=1.0).contains(&ratio), "ratio {ratio}");
        }
    }
}
