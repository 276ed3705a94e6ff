//! Statistics collection
//!
//! Five counters describe the workload: total blocks, blocks read, blocks
//! written, KiB read, KiB written. Engines publish one [`Stats`] delta per
//! completed request (or one per completion batch); the shared
//! [`StatsAccumulator`] sums them with relaxed atomics so the multi-worker
//! engine never contends on a lock.
//!
//! Counters are individually monotone while the workload runs. A snapshot
//! may be torn across counters with respect to in-flight publishes; interval
//! aggregates are approximate by design.

use std::ops::{AddAssign, Sub};
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-request (or per-batch) statistics delta.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub blocks: u64,
    pub blocks_read: u64,
    pub blocks_write: u64,
    pub kib_read: u64,
    pub kib_write: u64,
}

impl Stats {
    /// Delta for a single completed request of `block_size_kib` KiB.
    pub fn one_block(block_size_kib: u32, write: bool) -> Self {
        Self {
            blocks: 1,
            blocks_read: if write { 0 } else { 1 },
            blocks_write: if write { 1 } else { 0 },
            kib_read: if write { 0 } else { block_size_kib as u64 },
            kib_write: if write { block_size_kib as u64 } else { 0 },
        }
    }
}

impl AddAssign for Stats {
    fn add_assign(&mut self, rhs: Self) {
        self.blocks += rhs.blocks;
        self.blocks_read += rhs.blocks_read;
        self.blocks_write += rhs.blocks_write;
        self.kib_read += rhs.kib_read;
        self.kib_write += rhs.kib_write;
    }
}

impl Sub for Stats {
    type Output = Stats;

    fn sub(self, rhs: Self) -> Stats {
        Stats {
            blocks: self.blocks - rhs.blocks,
            blocks_read: self.blocks_read - rhs.blocks_read,
            blocks_write: self.blocks_write - rhs.blocks_write,
            kib_read: self.kib_read - rhs.kib_read,
            kib_write: self.kib_write - rhs.kib_write,
        }
    }
}

/// Cache-line aligned atomic counter to prevent false sharing
///
/// Each counter occupies its own 64-byte cache line so that the worker
/// threads of the multi-worker engine do not invalidate each other's lines
/// when publishing.
#[repr(align(64))]
#[derive(Debug, Default)]
struct AlignedCounter {
    value: AtomicU64,
}

impl AlignedCounter {
    #[inline]
    fn add(&self, val: u64) {
        self.value.fetch_add(val, Ordering::Relaxed);
    }

    #[inline]
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Shared, lock-free accumulator of workload statistics.
#[derive(Debug, Default)]
pub struct StatsAccumulator {
    blocks: AlignedCounter,
    blocks_read: AlignedCounter,
    blocks_write: AlignedCounter,
    kib_read: AlignedCounter,
    kib_write: AlignedCounter,
}

impl StatsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a delta to the cumulative counters.
    #[inline]
    pub fn add(&self, delta: &Stats) {
        self.blocks.add(delta.blocks);
        self.blocks_read.add(delta.blocks_read);
        self.blocks_write.add(delta.blocks_write);
        self.kib_read.add(delta.kib_read);
        self.kib_write.add(delta.kib_write);
    }

    /// Snapshot the cumulative counters.
    pub fn snapshot(&self) -> Stats {
        Stats {
            blocks: self.blocks.get(),
            blocks_read: self.blocks_read.get(),
            blocks_write: self.blocks_write.get(),
            kib_read: self.kib_read.get(),
            kib_write: self.kib_write.get(),
        }
    }

    /// Cumulative written blocks, used for flush pacing.
    #[inline]
    pub fn blocks_write(&self) -> u64 {
        self.blocks_write.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_one_block_read() {
        let s = Stats::one_block(4, false);
        assert_eq!(s.blocks, 1);
        assert_eq!(s.blocks_read, 1);
        assert_eq!(s.blocks_write, 0);
        assert_eq!(s.kib_read, 4);
        assert_eq!(s.kib_write, 0);
    }

    #[test]
    fn test_one_block_write() {
        let s = Stats::one_block(64, true);
        assert_eq!(s.blocks, 1);
        assert_eq!(s.blocks_read, 0);
        assert_eq!(s.blocks_write, 1);
        assert_eq!(s.kib_read, 0);
        assert_eq!(s.kib_write, 64);
    }

    #[test]
    fn test_add_sub_roundtrip() {
        let mut total = Stats::default();
        total += Stats::one_block(4, false);
        total += Stats::one_block(4, true);
        total += Stats::one_block(4, true);

        assert_eq!(total.blocks, 3);
        assert_eq!(total.blocks, total.blocks_read + total.blocks_write);

        let earlier = Stats::one_block(4, false);
        let delta = total - earlier;
        assert_eq!(delta.blocks, 2);
        assert_eq!(delta.blocks_read, 0);
        assert_eq!(delta.blocks_write, 2);
    }

    #[test]
    fn test_accumulator_accounting() {
        let acc = StatsAccumulator::new();
        for i in 0..100 {
            acc.add(&Stats::one_block(8, i % 3 == 0));
        }

        let snap = acc.snapshot();
        assert_eq!(snap.blocks, 100);
        assert_eq!(snap.blocks, snap.blocks_read + snap.blocks_write);
        assert_eq!(snap.kib_read, snap.blocks_read * 8);
        assert_eq!(snap.kib_write, snap.blocks_write * 8);
        assert_eq!(acc.blocks_write(), snap.blocks_write);
    }

    #[test]
    fn test_accumulator_monotonic_concurrent() {
        let acc = Arc::new(StatsAccumulator::new());
        let mut handles = Vec::new();

        for _ in 0..4 {
            let acc = acc.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    acc.add(&Stats::one_block(4, true));
                }
            }));
        }

        let mut last = 0u64;
        for _ in 0..100 {
            let cur = acc.snapshot().blocks;
            assert!(cur >= last);
            last = cur;
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(acc.snapshot().blocks, 4000);
    }
}
