//! Engine controller
//!
//! Owns the target file and the driver thread that runs the engine loop.
//! The controller validates the target against the filesystem, derives the
//! open flags from the configuration, instantiates the selected engine and
//! keeps calling it until the shared stop flag is set. Fatal engine errors
//! land in a failure slot and re-surface on the next [`Controller::is_active`]
//! call.
//!
//! Durability pacing: with `flush_blocks > 0` the driver issues `fdatasync`
//! once the cumulative written-block count has advanced by at least that
//! many blocks since the previous flush. The libaio engine is exempt (its
//! writes carry RWF_DSYNC when durability is requested and its in-flight
//! requests would make the pacing meaningless).

use crate::config::{IoEngineKind, LiveConfig, Settings, MIN_FILESIZE_MIB};
use crate::engine;
use crate::shaper::Shaper;
use crate::stats::StatsAccumulator;
use crate::util::buffer::AlignedBuffer;
use crate::util::rng::Randomizer;
use crate::Result;
use anyhow::Context;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pause poll interval of the driver loop.
const WAIT_POLL: Duration = Duration::from_millis(200);

/// Chunk used to pre-fill a created file.
const CREATE_CHUNK_BYTES: usize = 1024 * 1024;

pub struct Controller {
    settings: Arc<Settings>,
    stats: Arc<StatsAccumulator>,
    stop: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<anyhow::Error>>>,
    driver: Option<thread::JoinHandle<()>>,
    /// Keeps the descriptor open for the driver thread's lifetime.
    file: Option<File>,
    created: bool,
}

impl Controller {
    /// Create/validate/open the target file and start the driver thread.
    pub fn new(
        settings: Arc<Settings>,
        live: Arc<LiveConfig>,
        stop: Arc<AtomicBool>,
    ) -> Result<Self> {
        let mut created = false;
        if settings.create_file {
            create_target(&settings)?;
            created = true;
        }

        check_target(&settings, &live)?;
        let file = open_target(&settings)?;

        let stats = Arc::new(StatsAccumulator::new());
        let shaper = Arc::new(Shaper::new(live.clone()));
        let failure = Arc::new(Mutex::new(None));

        let driver = {
            let fd = file.as_raw_fd();
            let settings = settings.clone();
            let live = live.clone();
            let shaper = shaper.clone();
            let stats = stats.clone();
            let stop = stop.clone();
            let failure = failure.clone();
            thread::spawn(move || {
                info!("engine controller thread initiated");
                if let Err(err) =
                    driver_main(fd, settings.io_engine, &live, &shaper, &stats, &stop)
                {
                    debug!("engine controller thread failed: {:#}", err);
                    *failure.lock().unwrap() = Some(err);
                }
                info!("engine controller thread finished");
            })
        };

        Ok(Self {
            settings,
            stats,
            stop,
            failure,
            driver: Some(driver),
            file: Some(file),
            created,
        })
    }

    /// Shared statistics accumulator (read by the reporter).
    pub fn stats(&self) -> Arc<StatsAccumulator> {
        self.stats.clone()
    }

    /// Whether the workload is still running. Re-raises a captured fatal
    /// engine error.
    pub fn is_active(&self) -> Result<bool> {
        if let Some(err) = self.failure.lock().unwrap().take() {
            return Err(err);
        }
        Ok(!self.stop.load(Ordering::Relaxed))
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.driver.take() {
            let _ = handle.join();
        }

        if self.file.take().is_some() {
            debug!("closed file {}", self.settings.filename.display());
        }
        if self.created && self.settings.delete_file {
            info!("deleting file {}", self.settings.filename.display());
            if let Err(err) = std::fs::remove_file(&self.settings.filename) {
                warn!("failed to delete file: {}", err);
            }
        }
    }
}

/// Engine loop, run on the driver thread. Returns when `stop` is observed
/// or an engine error surfaces; dropping the engine on return cancels any
/// in-flight requests and joins worker threads.
fn driver_main(
    fd: RawFd,
    kind: IoEngineKind,
    live: &Arc<LiveConfig>,
    shaper: &Arc<Shaper>,
    stats: &Arc<StatsAccumulator>,
    stop: &Arc<AtomicBool>,
) -> Result<()> {
    info!("using {} engine", kind);
    let mut engine = engine::create(kind, fd, live.clone(), shaper.clone(), stats.clone())?;

    let flush_capable = kind != IoEngineKind::Libaio;
    let mut last_flush_writes = 0u64;

    while !stop.load(Ordering::Relaxed) {
        if live.wait() {
            info!("engine controller thread in wait mode");
            while !stop.load(Ordering::Relaxed) && live.wait() {
                engine.wait();
                thread::sleep(WAIT_POLL);
            }
            if !stop.load(Ordering::Relaxed) {
                info!("exit wait mode");
            }
        }
        if stop.load(Ordering::Relaxed) {
            break;
        }

        shaper.apply_config_changes();
        engine.make_requests(stop)?;

        if flush_capable && !stop.load(Ordering::Relaxed) {
            let flush_blocks = live.flush_blocks();
            if flush_blocks > 0 {
                let written = stats.blocks_write();
                if written - last_flush_writes >= flush_blocks {
                    let ret = unsafe { libc::fdatasync(fd) };
                    if ret < 0 {
                        return Err(std::io::Error::last_os_error()).context("fdatasync failed");
                    }
                    last_flush_writes = written;
                }
            }
        }
    }

    Ok(())
}

/// Pre-fill a new target file with random data, 1 MiB at a time.
///
/// The fill chunk is written through O_DIRECT, so its size must be a
/// multiple of the filesystem block size; this is validated against the
/// freshly created file instead of assumed.
fn create_target(settings: &Settings) -> Result<()> {
    info!("creating file {}", settings.filename.display());

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(0o640)
        .custom_flags(libc::O_DIRECT)
        .open(&settings.filename)
        .with_context(|| format!("can't create file {}", settings.filename.display()))?;

    let fill = |file: &mut File| -> Result<()> {
        let fs_block = file.metadata()?.blksize();
        anyhow::ensure!(
            CREATE_CHUNK_BYTES as u64 % fs_block == 0,
            "fill chunk of {} bytes is not a multiple of the filesystem block size {}",
            CREATE_CHUNK_BYTES,
            fs_block
        );

        let mut rng = Randomizer::new();
        let mut chunk = AlignedBuffer::new(CREATE_CHUNK_BYTES)?;
        rng.fill_buffer(chunk.as_mut_slice());

        for _ in 0..settings.filesize_mib {
            file.write_all(chunk.as_slice()).context("write error")?;
        }
        Ok(())
    };

    if let Err(err) = fill(&mut file) {
        drop(file);
        let _ = std::fs::remove_file(&settings.filename);
        return Err(err).context("create file error");
    }

    debug!("file created");
    Ok(())
}

/// Validate block alignment against the filesystem and reconcile the file
/// size for pre-existing targets.
fn check_target(settings: &Settings, live: &LiveConfig) -> Result<()> {
    let metadata = std::fs::metadata(&settings.filename).with_context(|| {
        format!("can't read file stats for {}", settings.filename.display())
    })?;

    let block_bytes = live.block_size_kib() as u64 * 1024;
    anyhow::ensure!(
        block_bytes % metadata.blksize() == 0,
        "block size of {} bytes must be a multiple of the filesystem block size {}",
        block_bytes,
        metadata.blksize()
    );

    if !settings.create_file {
        let size_mib = metadata.len() / 1024 / 1024;
        info!("file already exists, using --filesize={}", size_mib);
        anyhow::ensure!(
            size_mib >= MIN_FILESIZE_MIB,
            "existing file is only {} MiB; at least {} MiB required",
            size_mib,
            MIN_FILESIZE_MIB
        );
        live.set_filesize_mib(size_mib);
    }

    Ok(())
}

/// Open the target with flags derived from the configuration.
///
/// O_DSYNC only applies to the posix engine; the async engines request
/// durability per-write through RWF_DSYNC instead.
fn open_target(settings: &Settings) -> Result<File> {
    let mut custom_flags = 0;
    let mut flags_str = String::from("O_RDWR");

    if settings.o_direct {
        custom_flags |= libc::O_DIRECT;
        flags_str.push_str("|O_DIRECT");
    }
    if settings.io_engine == IoEngineKind::Posix && settings.o_dsync {
        custom_flags |= libc::O_DSYNC;
        flags_str.push_str("|O_DSYNC");
    }

    info!(
        "opening file '{}' with flags {}",
        settings.filename.display(),
        flags_str
    );
    if settings.o_dsync && settings.io_engine != IoEngineKind::Posix {
        info!("write requests will use flag RWF_DSYNC");
    }

    OpenOptions::new()
        .read(true)
        .write(true)
        .mode(0o640)
        .custom_flags(custom_flags)
        .open(&settings.filename)
        .with_context(|| format!("can't open file {}", settings.filename.display()))
}
