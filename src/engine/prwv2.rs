//! Multi-worker positional I/O engine
//!
//! Spawns [`MAX_IODEPTH`] worker threads at construction; only workers with
//! index below the live `iodepth` issue I/O, the rest idle on a short sleep,
//! so a live depth change needs no thread management. Each worker owns its
//! aligned buffer and randomizer and blocks in one `preadv`/`pwritev2` call
//! at a time.
//!
//! The driver side of this engine does no I/O: `make_requests` just sleeps
//! and polls the shared failure slot where the first worker error lands.

use super::Engine;
use crate::config::{LiveConfig, MAX_IODEPTH};
use crate::shaper::Shaper;
use crate::stats::{Stats, StatsAccumulator};
use crate::util::buffer::AlignedBuffer;
use crate::util::rng::{Randomizer, REWRITE_REFRESH_STRIDE};
use crate::Result;
use anyhow::Context;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, error};

/// Driver sleep per iteration and pause poll interval.
const DRIVER_POLL: Duration = Duration::from_millis(200);
/// Sleep for workers whose index is at or above the live iodepth.
const DISABLED_WORKER_POLL: Duration = Duration::from_millis(500);

struct WorkerShared {
    fd: RawFd,
    live: Arc<LiveConfig>,
    shaper: Arc<Shaper>,
    stats: Arc<StatsAccumulator>,
    stop: AtomicBool,
    waiting: AtomicBool,
    /// First fatal worker error; polled by the driver.
    failure: Mutex<Option<anyhow::Error>>,
}

pub struct PrwEngine {
    shared: Arc<WorkerShared>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl PrwEngine {
    pub fn new(
        fd: RawFd,
        live: Arc<LiveConfig>,
        shaper: Arc<Shaper>,
        stats: Arc<StatsAccumulator>,
    ) -> Self {
        let shared = Arc::new(WorkerShared {
            fd,
            live,
            shaper,
            stats,
            stop: AtomicBool::new(false),
            // workers start idle until the first driver iteration
            waiting: AtomicBool::new(true),
            failure: Mutex::new(None),
        });

        let threads = (0..MAX_IODEPTH as usize)
            .map(|pos| {
                let shared = shared.clone();
                thread::spawn(move || worker_main(shared, pos))
            })
            .collect();

        Self { shared, threads }
    }
}

impl Engine for PrwEngine {
    fn make_requests(&mut self, stop: &AtomicBool) -> Result<()> {
        if let Some(err) = self.shared.failure.lock().unwrap().take() {
            self.shared.stop.store(true, Ordering::Relaxed);
            return Err(err);
        }

        if stop.load(Ordering::Relaxed) {
            self.shared.stop.store(true, Ordering::Relaxed);
        }
        self.shared.waiting.store(false, Ordering::Relaxed);

        thread::sleep(DRIVER_POLL);
        Ok(())
    }

    fn wait(&mut self) {
        self.shared.waiting.store(true, Ordering::Relaxed);
    }

    fn is_multi_thread(&self) -> bool {
        true
    }
}

impl Drop for PrwEngine {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_main(shared: Arc<WorkerShared>, pos: usize) {
    if let Err(err) = worker_loop(&shared, pos) {
        debug!("worker {} failed: {:#}", pos, err);
        let mut failure = shared.failure.lock().unwrap();
        if failure.is_none() {
            *failure = Some(err);
        }
    }
}

fn worker_loop(shared: &WorkerShared, pos: usize) -> Result<()> {
    let mut rng = Randomizer::new();
    let mut buffer: Option<AlignedBuffer> = None;
    let mut cur_size = 0usize;
    let mut wrote = false;

    while !shared.stop.load(Ordering::Relaxed) {
        while shared.waiting.load(Ordering::Relaxed) && !shared.stop.load(Ordering::Relaxed) {
            thread::sleep(DRIVER_POLL);
        }
        if shared.stop.load(Ordering::Relaxed) {
            break;
        }

        if pos >= shared.live.iodepth() as usize {
            thread::sleep(DISABLED_WORKER_POLL);
            continue;
        }

        let params = shared.shaper.next_params();
        debug_assert!(params.size > 0);

        if cur_size != params.size {
            debug!(
                "worker {} request size changed from {} to {}",
                pos, cur_size, params.size
            );
            cur_size = params.size;
            let mut fresh = AlignedBuffer::new(params.size)?;
            rng.fill_buffer(fresh.as_mut_slice());
            buffer = Some(fresh);
        } else if params.write && wrote {
            let buf = buffer.as_mut().expect("buffer allocated");
            rng.fill_buffer_sparse(buf.as_mut_slice(), REWRITE_REFRESH_STRIDE);
        }
        wrote = params.write;

        let buf = buffer.as_mut().expect("buffer allocated");
        let iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: cur_size,
        };

        let ret = if params.write {
            let flags = if params.dsync { libc::RWF_DSYNC } else { 0 };
            unsafe { libc::pwritev2(shared.fd, &iov, 1, params.offset as libc::off_t, flags) }
        } else {
            unsafe { libc::preadv(shared.fd, &iov, 1, params.offset as libc::off_t) }
        };

        if shared.stop.load(Ordering::Relaxed) {
            break;
        }

        shared.shaper.offset_released(params.offset);

        if ret > 0 {
            shared
                .stats
                .add(&Stats::one_block(params.block_size_kib, params.write));
        } else if ret == 0 {
            error!("worker {}: read/write returned zero", pos);
        } else {
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => {} // transient, retry
                _ => {
                    return Err(err).with_context(|| {
                        format!(
                            "worker {}: {} at offset {} failed",
                            pos,
                            if params.write { "pwritev2" } else { "preadv" },
                            params.offset
                        )
                    });
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IoEngineKind;
    use std::fs::OpenOptions;
    use std::os::unix::io::AsRawFd;
    use tempfile::TempDir;

    fn engine_over_tempfile(
        iodepth: u32,
        write_ratio: f64,
    ) -> (TempDir, std::fs::File, PrwEngine, Arc<StatsAccumulator>) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("target.dat");
        std::fs::write(&path, vec![0u8; 10 * 1024 * 1024]).unwrap();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();

        let live = Arc::new(LiveConfig::new(
            IoEngineKind::Prwv2,
            false,
            10,
            4,
            iodepth,
            0,
            write_ratio,
            0.5,
            false,
        ));
        let shaper = Arc::new(Shaper::with_seed(live.clone(), 31));
        let stats = Arc::new(StatsAccumulator::new());
        let engine = PrwEngine::new(file.as_raw_fd(), live, shaper, stats.clone());
        (dir, file, engine, stats)
    }

    #[test]
    fn test_workers_produce_stats() {
        let (_dir, _file, mut engine, stats) = engine_over_tempfile(4, 0.5);
        let stop = AtomicBool::new(false);

        // first iteration releases the initial pause; a few more give the
        // workers time to run
        for _ in 0..3 {
            engine.make_requests(&stop).unwrap();
        }

        let snap = stats.snapshot();
        assert!(snap.blocks > 0);
        assert_eq!(snap.blocks, snap.blocks_read + snap.blocks_write);

        stop.store(true, Ordering::Relaxed);
        engine.make_requests(&stop).unwrap();
        drop(engine); // joins all workers
    }

    #[test]
    fn test_wait_pauses_workers() {
        let (_dir, _file, mut engine, stats) = engine_over_tempfile(2, 0.0);
        let stop = AtomicBool::new(false);

        engine.make_requests(&stop).unwrap();
        engine.wait();
        thread::sleep(Duration::from_millis(300));

        let before = stats.snapshot().blocks;
        thread::sleep(Duration::from_millis(400));
        let after = stats.snapshot().blocks;
        // paused workers publish nothing
        assert_eq!(before, after);

        stop.store(true, Ordering::Relaxed);
        engine.make_requests(&stop).unwrap();
    }

    #[test]
    fn test_drop_joins_quickly() {
        let (_dir, _file, mut engine, _stats) = engine_over_tempfile(8, 0.5);
        let stop = AtomicBool::new(false);
        engine.make_requests(&stop).unwrap();

        let start = std::time::Instant::now();
        drop(engine);
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
