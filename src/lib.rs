//! ioforge - storage workload generator
//!
//! ioforge issues a tunable stream of read and write requests against a
//! regular file on a block-backed filesystem, measures throughput over fixed
//! intervals, and accepts live workload-shape changes over stdin or a local
//! stream socket.
//!
//! # Architecture
//!
//! - **Interchangeable engines**: blocking posix, libaio batched submission,
//!   multi-threaded positional I/O (prwv2)
//! - **One request shaper**: converts the live configuration knobs plus
//!   randomness into aligned request descriptors
//! - **Live control**: block size, iodepth, ratios, flush pacing and pause
//!   are all mutable while the workload runs
//! - **Periodic reporter**: drift-corrected interval statistics on the log
//!   channel

pub mod command;
pub mod config;
pub mod controller;
pub mod engine;
pub mod program;
pub mod reporter;
pub mod shaper;
pub mod stats;
pub mod util;

// Re-export commonly used types
pub use config::{LiveConfig, Settings};
pub use shaper::{AccessParams, Shaper};

/// Result type used throughout ioforge
pub type Result<T> = anyhow::Result<T>;
