//! CLI argument parsing using clap
//!
//! All flags take `--name=value`. Boolean flags may be given bare
//! (`--create_file` means `--create_file=true`), mirroring gflags-style
//! tooling this generator is usually driven by.

use super::script::CommandScript;
use super::{
    validate_block_size, validate_iodepth, validate_ratio, IoEngineKind, LiveConfig, Settings,
    MIN_FILESIZE_MIB,
};
use crate::Result;
use anyhow::bail;
use clap::{ArgAction, Parser, ValueEnum};
use std::path::PathBuf;
use tracing::info;

/// Log verbosity selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// Only the per-interval STATS records (plus warnings and errors).
    Output,
    /// Operational logs and STATS records.
    Info,
    /// Everything, including per-request diagnostics.
    Debug,
}

/// ioforge - storage workload generator
#[derive(Parser, Debug)]
#[command(name = "ioforge")]
#[command(version, about, long_about = None)]
#[command(rename_all = "snake_case")]
pub struct Cli {
    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Print date and time in each log line
    #[arg(long, action = ArgAction::Set, num_args = 0..=1,
          default_missing_value = "true", default_value_t = true)]
    pub log_time_prefix: bool,

    /// Path of a control socket to create (must not exist)
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Duration of the experiment in seconds (0 = run until stopped)
    #[arg(long, default_value_t = 0)]
    pub duration: u64,

    /// Target file name
    #[arg(long)]
    pub filename: PathBuf,

    /// Create the target file
    #[arg(long, action = ArgAction::Set, num_args = 0..=1,
          default_missing_value = "true", default_value_t = false)]
    pub create_file: bool,

    /// Delete the target file on exit if it was created by this run
    #[arg(long, action = ArgAction::Set, num_args = 0..=1,
          default_missing_value = "true", default_value_t = false)]
    pub delete_file: bool,

    /// Target file size in MiB (required when creating)
    #[arg(long, default_value_t = 0)]
    pub filesize: u64,

    /// I/O engine
    #[arg(long, value_enum, default_value = "posix")]
    pub io_engine: IoEngineKind,

    /// Maximum number of in-flight requests
    #[arg(long, default_value_t = 1)]
    pub iodepth: u32,

    /// Block size in KiB
    #[arg(long, default_value_t = 4)]
    pub block_size: u32,

    /// Written blocks between fdatasync calls (0 = no flush)
    #[arg(long, default_value_t = 0)]
    pub flush_blocks: u64,

    /// Fraction of requests that are writes (0-1)
    #[arg(long, default_value_t = 0.0)]
    pub write_ratio: f64,

    /// Fraction of requests at random offsets (0-1)
    #[arg(long, default_value_t = 0.0)]
    pub random_ratio: f64,

    /// Legacy alias for --o_direct=true --o_dsync=true
    #[arg(long, action = ArgAction::Set, num_args = 0..=1,
          default_missing_value = "true", default_value_t = false)]
    pub direct_io: bool,

    /// Open the file with O_DIRECT
    #[arg(long, action = ArgAction::Set, num_args = 0..=1,
          default_missing_value = "true", default_value_t = true)]
    pub o_direct: bool,

    /// Request synchronous durability (O_DSYNC or per-write RWF_DSYNC)
    #[arg(long, action = ArgAction::Set, num_args = 0..=1,
          default_missing_value = "true", default_value_t = false)]
    pub o_dsync: bool,

    /// Statistics interval in seconds
    #[arg(long, default_value_t = 5)]
    pub stats_interval: u32,

    /// Start paused
    #[arg(long, action = ArgAction::Set, num_args = 0..=1,
          default_missing_value = "true", default_value_t = false)]
    pub wait: bool,

    /// Timed commands: "t1:cmd1=val1;t2:cmd2=val2" (t with optional s/m suffix)
    #[arg(long, default_value = "")]
    pub command_script: String,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed flags and split them into the immutable settings
    /// and the live-mutable parameter set.
    pub fn build(self) -> Result<(Settings, LiveConfig)> {
        self.log_parameters();

        let (o_direct, o_dsync) = if self.direct_io {
            (true, true)
        } else {
            (self.o_direct, self.o_dsync)
        };

        if let Some(ref socket) = self.socket {
            if socket.exists() {
                bail!("socket path {} already exists", socket.display());
            }
        }
        if self.create_file && self.filesize < MIN_FILESIZE_MIB {
            bail!(
                "--filesize must be at least {} MiB when creating a file, got {}",
                MIN_FILESIZE_MIB,
                self.filesize
            );
        }
        validate_block_size(self.block_size)?;
        validate_iodepth(self.iodepth)?;
        validate_ratio("write_ratio", self.write_ratio)?;
        validate_ratio("random_ratio", self.random_ratio)?;
        if self.stats_interval == 0 {
            bail!("--stats_interval must be greater than zero");
        }
        if self.io_engine == IoEngineKind::Posix && self.iodepth > 1 {
            bail!("io_engine posix only supports iodepth 1");
        }
        if self.io_engine == IoEngineKind::Libaio && !o_direct {
            bail!("libaio engine only supports --o_direct=true");
        }

        let command_script: CommandScript = self.command_script.parse()?;

        let settings = Settings {
            filename: self.filename,
            create_file: self.create_file,
            delete_file: self.delete_file,
            filesize_mib: self.filesize,
            socket: self.socket,
            duration_s: self.duration,
            stats_interval_s: self.stats_interval,
            io_engine: self.io_engine,
            o_direct,
            o_dsync,
            command_script,
        };
        let live = LiveConfig::new(
            self.io_engine,
            o_dsync,
            self.filesize,
            self.block_size,
            self.iodepth,
            self.flush_blocks,
            self.write_ratio,
            self.random_ratio,
            self.wait,
        );

        Ok((settings, live))
    }

    fn log_parameters(&self) {
        info!(
            "parameters: --log_level={:?} --log_time_prefix={} --socket={:?} --duration={} \
             --filename={} --create_file={} --delete_file={} --filesize={} --io_engine={} \
             --iodepth={} --block_size={} --flush_blocks={} --write_ratio={} --random_ratio={} \
             --direct_io={} --o_direct={} --o_dsync={} --stats_interval={} --wait={} \
             --command_script=\"{}\"",
            self.log_level,
            self.log_time_prefix,
            self.socket,
            self.duration,
            self.filename.display(),
            self.create_file,
            self.delete_file,
            self.filesize,
            self.io_engine,
            self.iodepth,
            self.block_size,
            self.flush_blocks,
            self.write_ratio,
            self.random_ratio,
            self.direct_io,
            self.o_direct,
            self.o_dsync,
            self.stats_interval,
            self.wait,
            self.command_script,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut full = vec!["ioforge"];
        full.extend_from_slice(args);
        Cli::try_parse_from(full).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&["--filename=/tmp/target"]);
        assert_eq!(cli.io_engine, IoEngineKind::Posix);
        assert_eq!(cli.iodepth, 1);
        assert_eq!(cli.block_size, 4);
        assert_eq!(cli.stats_interval, 5);
        assert!(cli.o_direct);
        assert!(!cli.o_dsync);
        assert!(!cli.wait);
    }

    #[test]
    fn test_filename_required() {
        assert!(Cli::try_parse_from(["ioforge"]).is_err());
    }

    #[test]
    fn test_bare_bool_flag() {
        let cli = parse(&["--filename=/tmp/t", "--create_file", "--filesize=10"]);
        assert!(cli.create_file);
        let cli = parse(&["--filename=/tmp/t", "--o_direct=false"]);
        assert!(!cli.o_direct);
    }

    #[test]
    fn test_direct_io_alias() {
        let cli = parse(&["--filename=/tmp/t", "--direct_io", "--o_direct=false"]);
        let (settings, _) = cli.build().unwrap();
        assert!(settings.o_direct);
        assert!(settings.o_dsync);
    }

    #[test]
    fn test_posix_rejects_deep_queue() {
        let cli = parse(&["--filename=/tmp/t", "--io_engine=posix", "--iodepth=4"]);
        assert!(cli.build().is_err());
    }

    #[test]
    fn test_libaio_requires_o_direct() {
        let cli = parse(&["--filename=/tmp/t", "--io_engine=libaio", "--o_direct=false"]);
        assert!(cli.build().is_err());

        let cli = parse(&["--filename=/tmp/t", "--io_engine=libaio", "--iodepth=16"]);
        let (settings, live) = cli.build().unwrap();
        assert!(settings.o_direct);
        assert_eq!(live.iodepth(), 16);
    }

    #[test]
    fn test_create_requires_min_filesize() {
        let cli = parse(&["--filename=/tmp/t", "--create_file", "--filesize=5"]);
        assert!(cli.build().is_err());
    }

    #[test]
    fn test_ratio_validation() {
        let cli = parse(&["--filename=/tmp/t", "--write_ratio=1.5"]);
        assert!(cli.build().is_err());
        let cli = parse(&["--filename=/tmp/t", "--random_ratio=0.7", "--write_ratio=0.3"]);
        let (_, live) = cli.build().unwrap();
        assert_eq!(live.random_ratio(), 0.7);
        assert_eq!(live.write_ratio(), 0.3);
    }

    #[test]
    fn test_command_script_flag() {
        let cli = parse(&["--filename=/tmp/t", "--command_script=5:wait=true;1m:stop"]);
        let (settings, _) = cli.build().unwrap();
        assert_eq!(settings.command_script.len(), 2);
    }
}
