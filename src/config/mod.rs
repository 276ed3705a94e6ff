//! Configuration module
//!
//! Handles CLI argument parsing, startup validation, and the live-mutable
//! parameter set.
//!
//! Configuration splits in two:
//!
//! - [`Settings`]: decided once at startup (target file, engine, open flags,
//!   socket path, duration, command script).
//! - [`LiveConfig`]: the knobs that may change while the workload runs
//!   (block size, iodepth, ratios, flush pacing, pause). Stored as atomics so
//!   the command channel can mutate them while engines read them.

pub mod cli;
pub mod script;

use crate::command::OutputSink;
use crate::Result;
use anyhow::{bail, Context};
use clap::ValueEnum;
use script::CommandScript;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Maximum number of in-flight requests any engine supports.
pub const MAX_IODEPTH: u32 = 128;

/// Minimum block size in KiB.
pub const MIN_BLOCK_SIZE_KIB: u32 = 4;

/// Minimum target file size in MiB.
pub const MIN_FILESIZE_MIB: u64 = 10;

/// I/O engine selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum IoEngineKind {
    /// Single-threaded blocking read/write.
    Posix,
    /// Multi-threaded positional I/O (preadv/pwritev2).
    Prwv2,
    /// Linux native async I/O with batched submission.
    Libaio,
}

impl fmt::Display for IoEngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoEngineKind::Posix => write!(f, "posix"),
            IoEngineKind::Prwv2 => write!(f, "prwv2"),
            IoEngineKind::Libaio => write!(f, "libaio"),
        }
    }
}

/// Immutable startup configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub filename: PathBuf,
    pub create_file: bool,
    pub delete_file: bool,
    /// Requested file size in MiB; overridden from disk for existing files.
    pub filesize_mib: u64,
    pub socket: Option<PathBuf>,
    /// Run duration in seconds; 0 runs until stopped.
    pub duration_s: u64,
    pub stats_interval_s: u32,
    pub io_engine: IoEngineKind,
    pub o_direct: bool,
    pub o_dsync: bool,
    pub command_script: CommandScript,
}

/// Live-mutable parameter set shared between the command channel, the
/// shaper, the engines and the reporter.
///
/// Ratios are stored as `f64` bit patterns in `AtomicU64` slots; readers and
/// writers never tear.
#[derive(Debug)]
pub struct LiveConfig {
    io_engine: IoEngineKind,
    o_dsync: bool,
    filesize_mib: AtomicU64,
    block_size_kib: AtomicU32,
    iodepth: AtomicU32,
    flush_blocks: AtomicU64,
    write_ratio: AtomicU64,
    random_ratio: AtomicU64,
    wait: AtomicBool,
    /// Set by a successful parameter mutation; consumed by the reporter,
    /// which skips one emission so a delta never mixes two regimes.
    changed: AtomicBool,
}

impl LiveConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        io_engine: IoEngineKind,
        o_dsync: bool,
        filesize_mib: u64,
        block_size_kib: u32,
        iodepth: u32,
        flush_blocks: u64,
        write_ratio: f64,
        random_ratio: f64,
        wait: bool,
    ) -> Self {
        Self {
            io_engine,
            o_dsync,
            filesize_mib: AtomicU64::new(filesize_mib),
            block_size_kib: AtomicU32::new(block_size_kib),
            iodepth: AtomicU32::new(iodepth),
            flush_blocks: AtomicU64::new(flush_blocks),
            write_ratio: AtomicU64::new(write_ratio.to_bits()),
            random_ratio: AtomicU64::new(random_ratio.to_bits()),
            wait: AtomicBool::new(wait),
            changed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn io_engine(&self) -> IoEngineKind {
        self.io_engine
    }

    #[inline]
    pub fn o_dsync(&self) -> bool {
        self.o_dsync
    }

    #[inline]
    pub fn filesize_mib(&self) -> u64 {
        self.filesize_mib.load(Ordering::Relaxed)
    }

    /// Called by the controller when an existing file overrides the
    /// requested size.
    pub fn set_filesize_mib(&self, mib: u64) {
        self.filesize_mib.store(mib, Ordering::Relaxed);
    }

    #[inline]
    pub fn block_size_kib(&self) -> u32 {
        self.block_size_kib.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn iodepth(&self) -> u32 {
        self.iodepth.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn flush_blocks(&self) -> u64 {
        self.flush_blocks.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn write_ratio(&self) -> f64 {
        f64::from_bits(self.write_ratio.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn random_ratio(&self) -> f64 {
        f64::from_bits(self.random_ratio.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn wait(&self) -> bool {
        self.wait.load(Ordering::Relaxed)
    }

    pub fn set_wait(&self, value: bool) {
        self.wait.store(value, Ordering::Relaxed);
    }

    pub fn mark_changed(&self) {
        self.changed.store(true, Ordering::Relaxed);
    }

    /// Consume the changed flag, returning whether a mutation happened since
    /// the last call.
    pub fn take_changed(&self) -> bool {
        self.changed.swap(false, Ordering::Relaxed)
    }

    /// Apply a `name=value` mutation command from stdin, the socket, or the
    /// command script. Invalid commands leave the workload untouched and are
    /// reported through `sink`.
    pub fn apply_command(&self, line: &str, sink: &mut OutputSink<'_>) -> Result<()> {
        let (name, value) = match line.split_once('=') {
            Some((n, v)) => (n.trim(), v.trim()),
            None => (line.trim(), ""),
        };

        match name {
            "help" => {
                sink.info(&format!(
                    "COMMANDS:\n\
                     \x20   stop           - terminate\n\
                     \x20   wait           - (true|false)\n\
                     \x20   block_size     - [{MIN_BLOCK_SIZE_KIB}..]\n\
                     \x20   iodepth        - [1..{MAX_IODEPTH}]\n\
                     \x20   write_ratio    - [0..1]\n\
                     \x20   random_ratio   - [0..1]\n\
                     \x20   flush_blocks   - [0..]"
                ));
            }
            "wait" => {
                // a bare "wait" pauses; "wait=false" resumes
                let value = if value.is_empty() {
                    true
                } else {
                    parse_bool(value).context("invalid value for the command wait")?
                };
                self.set_wait(value);
                sink.info(&format!("set wait={}", value));
            }
            "block_size" => {
                let kib: u32 = value
                    .parse()
                    .context("invalid value for the command block_size")?;
                validate_block_size(kib)?;
                self.block_size_kib.store(kib, Ordering::Relaxed);
                self.mark_changed();
                sink.info(&format!("set block_size={}", kib));
            }
            "iodepth" => {
                if self.io_engine == IoEngineKind::Posix {
                    bail!("parameter iodepth is immutable with the posix engine");
                }
                let depth: u32 = value
                    .parse()
                    .context("invalid value for the command iodepth")?;
                validate_iodepth(depth)?;
                self.iodepth.store(depth, Ordering::Relaxed);
                self.mark_changed();
                sink.info(&format!("set iodepth={}", depth));
            }
            "write_ratio" => {
                let ratio: f64 = value
                    .parse()
                    .context("invalid value for the command write_ratio")?;
                validate_ratio("write_ratio", ratio)?;
                self.write_ratio.store(ratio.to_bits(), Ordering::Relaxed);
                self.mark_changed();
                sink.info(&format!("set write_ratio={}", ratio));
            }
            "random_ratio" => {
                let ratio: f64 = value
                    .parse()
                    .context("invalid value for the command random_ratio")?;
                validate_ratio("random_ratio", ratio)?;
                self.random_ratio.store(ratio.to_bits(), Ordering::Relaxed);
                self.mark_changed();
                sink.info(&format!("set random_ratio={}", ratio));
            }
            "flush_blocks" => {
                let blocks: u64 = value
                    .parse()
                    .context("invalid value for the command flush_blocks")?;
                self.flush_blocks.store(blocks, Ordering::Relaxed);
                self.mark_changed();
                sink.info(&format!("set flush_blocks={}", blocks));
            }
            other => bail!("invalid command: {}", other),
        }

        Ok(())
    }
}

pub(crate) fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => bail!("not a boolean: {}", other),
    }
}

pub(crate) fn validate_block_size(kib: u32) -> Result<()> {
    if kib < MIN_BLOCK_SIZE_KIB {
        bail!(
            "block_size must be at least {} KiB, got {}",
            MIN_BLOCK_SIZE_KIB,
            kib
        );
    }
    Ok(())
}

pub(crate) fn validate_iodepth(depth: u32) -> Result<()> {
    if depth == 0 || depth > MAX_IODEPTH {
        bail!("iodepth must be between 1 and {}, got {}", MAX_IODEPTH, depth);
    }
    Ok(())
}

pub(crate) fn validate_ratio(name: &str, ratio: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&ratio) {
        bail!("{} must be between 0 and 1, got {}", name, ratio);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::OutputSink;

    fn live(engine: IoEngineKind) -> LiveConfig {
        LiveConfig::new(engine, false, 10, 4, 1, 0, 0.0, 0.0, false)
    }

    #[test]
    fn test_apply_block_size() {
        let cfg = live(IoEngineKind::Posix);
        let mut sink = OutputSink::log();

        cfg.apply_command("block_size=8", &mut sink).unwrap();
        assert_eq!(cfg.block_size_kib(), 8);
        assert!(cfg.take_changed());
        assert!(!cfg.take_changed());

        assert!(cfg.apply_command("block_size=2", &mut sink).is_err());
        assert_eq!(cfg.block_size_kib(), 8);
    }

    #[test]
    fn test_iodepth_immutable_under_posix() {
        let cfg = live(IoEngineKind::Posix);
        let mut sink = OutputSink::log();

        let err = cfg.apply_command("iodepth=4", &mut sink).unwrap_err();
        assert!(err.to_string().contains("immutable"));
        assert_eq!(cfg.iodepth(), 1);
        assert!(!cfg.take_changed());
    }

    #[test]
    fn test_iodepth_mutable_under_prwv2() {
        let cfg = live(IoEngineKind::Prwv2);
        let mut sink = OutputSink::log();

        cfg.apply_command("iodepth=32", &mut sink).unwrap();
        assert_eq!(cfg.iodepth(), 32);
        assert!(cfg.take_changed());

        assert!(cfg.apply_command("iodepth=129", &mut sink).is_err());
        assert!(cfg.apply_command("iodepth=0", &mut sink).is_err());
    }

    #[test]
    fn test_apply_ratios() {
        let cfg = live(IoEngineKind::Prwv2);
        let mut sink = OutputSink::log();

        cfg.apply_command("write_ratio=0.3", &mut sink).unwrap();
        assert_eq!(cfg.write_ratio(), 0.3);
        cfg.apply_command("random_ratio=1.0", &mut sink).unwrap();
        assert_eq!(cfg.random_ratio(), 1.0);

        assert!(cfg.apply_command("write_ratio=1.5", &mut sink).is_err());
        assert!(cfg.apply_command("random_ratio=-0.1", &mut sink).is_err());
    }

    #[test]
    fn test_apply_wait() {
        let cfg = live(IoEngineKind::Posix);
        let mut sink = OutputSink::log();

        cfg.apply_command("wait", &mut sink).unwrap();
        assert!(cfg.wait());
        cfg.apply_command("wait=false", &mut sink).unwrap();
        assert!(!cfg.wait());
        // pause toggling does not skip a report interval
        assert!(!cfg.take_changed());
    }

    #[test]
    fn test_invalid_command() {
        let cfg = live(IoEngineKind::Posix);
        let mut sink = OutputSink::log();

        assert!(cfg.apply_command("bogus=1", &mut sink).is_err());
        assert!(cfg.apply_command("block_size=abc", &mut sink).is_err());
    }

    #[test]
    fn test_help_command() {
        let cfg = live(IoEngineKind::Posix);
        let mut out = Vec::new();
        let mut sink = OutputSink::to_peer(&mut out);

        cfg.apply_command("help", &mut sink).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("COMMANDS"));
        assert!(text.contains("iodepth"));
    }
}
