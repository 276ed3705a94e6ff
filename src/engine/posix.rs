//! Synchronous posix engine
//!
//! The baseline engine: one aligned buffer, one blocking syscall per
//! iteration. It deliberately uses `lseek` + `read`/`write` instead of
//! positional I/O so that sequential runs keep the kernel's file-position
//! based readahead behavior; the seek is skipped whenever the next offset
//! continues where the previous request ended.

use super::Engine;
use crate::shaper::Shaper;
use crate::stats::{Stats, StatsAccumulator};
use crate::util::buffer::AlignedBuffer;
use crate::util::rng::{Randomizer, REWRITE_REFRESH_STRIDE};
use crate::Result;
use anyhow::Context;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

pub struct PosixEngine {
    fd: RawFd,
    shaper: Arc<Shaper>,
    stats: Arc<StatsAccumulator>,
    rng: Randomizer,

    buffer: Option<AlignedBuffer>,
    cur_size: usize,
    cur_offset: u64,
    cur_write: bool,
}

impl PosixEngine {
    pub fn new(fd: RawFd, shaper: Arc<Shaper>, stats: Arc<StatsAccumulator>) -> Self {
        Self {
            fd,
            shaper,
            stats,
            rng: Randomizer::new(),
            buffer: None,
            cur_size: 0,
            cur_offset: 0,
            cur_write: false,
        }
    }
}

impl Engine for PosixEngine {
    fn make_requests(&mut self, stop: &AtomicBool) -> Result<()> {
        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }

        let params = self.shaper.next_params();
        debug_assert!(params.size > 0);

        if self.cur_size != params.size {
            debug!("request size changed from {} to {}", self.cur_size, params.size);
            self.cur_size = params.size;
            let mut buffer = AlignedBuffer::new(params.size)?;
            self.rng.fill_buffer(buffer.as_mut_slice());
            self.buffer = Some(buffer);
        } else if params.write && self.cur_write {
            // refresh ~5% of the payload between repeated writes
            let buffer = self.buffer.as_mut().expect("buffer allocated");
            self.rng
                .fill_buffer_sparse(buffer.as_mut_slice(), REWRITE_REFRESH_STRIDE);
        }

        let delta = Stats::one_block(params.block_size_kib, params.write);

        if self.cur_offset + self.cur_size as u64 != params.offset {
            let ret = unsafe { libc::lseek(self.fd, params.offset as libc::off_t, libc::SEEK_SET) };
            if ret == -1 {
                return Err(std::io::Error::last_os_error())
                    .with_context(|| format!("seek to offset {} failed", params.offset));
            }
        }
        self.cur_offset = params.offset;
        self.cur_write = params.write;

        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }

        let buffer = self.buffer.as_mut().expect("buffer allocated");
        let ret = if params.write {
            unsafe {
                libc::write(
                    self.fd,
                    buffer.as_ptr() as *const libc::c_void,
                    self.cur_size,
                )
            }
        } else {
            unsafe {
                libc::read(
                    self.fd,
                    buffer.as_mut_ptr() as *mut libc::c_void,
                    self.cur_size,
                )
            }
        };
        if ret == -1 {
            let op = if params.write { "write" } else { "read" };
            return Err(std::io::Error::last_os_error()).with_context(|| {
                format!(
                    "{} of {} bytes at offset {} failed",
                    op, self.cur_size, self.cur_offset
                )
            });
        }

        self.shaper.offset_released(self.cur_offset);
        self.stats.add(&delta);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IoEngineKind, LiveConfig};
    use std::fs::OpenOptions;
    use std::os::unix::io::AsRawFd;
    use tempfile::TempDir;

    fn setup(write_ratio: f64, random_ratio: f64) -> (TempDir, std::fs::File, Arc<Shaper>) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("target.dat");
        std::fs::write(&path, vec![0u8; 10 * 1024 * 1024]).unwrap();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();

        let live = Arc::new(LiveConfig::new(
            IoEngineKind::Posix,
            false,
            10,
            4,
            1,
            0,
            write_ratio,
            random_ratio,
            false,
        ));
        let shaper = Arc::new(Shaper::with_seed(live, 11));
        (dir, file, shaper)
    }

    #[test]
    fn test_sequential_reads_advance_stats() {
        let (_dir, file, shaper) = setup(0.0, 0.0);
        let stats = Arc::new(StatsAccumulator::new());
        let mut engine = PosixEngine::new(file.as_raw_fd(), shaper, stats.clone());
        let stop = AtomicBool::new(false);

        for _ in 0..100 {
            engine.make_requests(&stop).unwrap();
        }

        let snap = stats.snapshot();
        assert_eq!(snap.blocks, 100);
        assert_eq!(snap.blocks_read, 100);
        assert_eq!(snap.blocks_write, 0);
        assert_eq!(snap.kib_read, 400);
    }

    #[test]
    fn test_writes_land_in_file() {
        let (dir, file, shaper) = setup(1.0, 0.0);
        let stats = Arc::new(StatsAccumulator::new());
        let mut engine = PosixEngine::new(file.as_raw_fd(), shaper, stats.clone());
        let stop = AtomicBool::new(false);

        for _ in 0..10 {
            engine.make_requests(&stop).unwrap();
        }

        assert_eq!(stats.snapshot().blocks_write, 10);

        // payload is random noise: the first blocks are no longer zero
        use std::io::Read;
        let mut check = std::fs::File::open(dir.path().join("target.dat")).unwrap();
        let mut head = vec![0u8; 4096];
        check.read_exact(&mut head).unwrap();
        assert!(head.iter().any(|&b| b != 0));
    }

    #[test]
    fn test_stop_skips_io() {
        let (_dir, file, shaper) = setup(0.0, 0.0);
        let stats = Arc::new(StatsAccumulator::new());
        let mut engine = PosixEngine::new(file.as_raw_fd(), shaper, stats.clone());
        let stop = AtomicBool::new(true);

        engine.make_requests(&stop).unwrap();
        assert_eq!(stats.snapshot().blocks, 0);
    }

    #[test]
    fn test_bad_fd_is_fatal() {
        let (_dir, _file, shaper) = setup(0.0, 1.0);
        let stats = Arc::new(StatsAccumulator::new());
        let mut engine = PosixEngine::new(-1, shaper, stats);
        let stop = AtomicBool::new(false);

        // either the seek or the read fails on the invalid descriptor
        assert!(engine.make_requests(&stop).is_err());
    }
}
