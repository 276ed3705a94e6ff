//! IO engine abstraction
//!
//! An engine turns [`AccessParams`](crate::shaper::AccessParams) into actual
//! I/O against the target file and publishes completion statistics. Three
//! engines share the contract:
//!
//! - **posix**: one blocking `read`/`write` per iteration (baseline)
//! - **libaio**: up to `iodepth` requests in flight through the kernel async
//!   I/O context, completions harvested in batches
//! - **prwv2**: `iodepth` active worker threads, each blocking in one
//!   positional syscall at a time
//!
//! # Contract
//!
//! The controller's driver loop calls [`Engine::make_requests`] repeatedly.
//! Engines must observe `stop` between any two blocking operations, must
//! never hold the shaper lock across a syscall, and must cancel or join any
//! in-flight work in their `Drop` implementation. Fatal errors surface as
//! the `Err` of the next `make_requests` call.

use crate::config::{IoEngineKind, LiveConfig};
use crate::shaper::Shaper;
use crate::stats::StatsAccumulator;
use crate::Result;
use std::os::unix::io::RawFd;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub mod libaio;
pub mod posix;
pub mod prwv2;

/// Common contract of the three back-ends.
pub trait Engine: Send {
    /// Run one engine iteration: submit and/or complete requests.
    ///
    /// Called in a loop by the controller driver. Blocking is bounded:
    /// one syscall for the posix engine, a 200 ms completion wait for
    /// libaio, a 200 ms sleep for prwv2.
    fn make_requests(&mut self, stop: &AtomicBool) -> Result<()>;

    /// The workload is paused; idle any worker threads.
    fn wait(&mut self) {}

    /// Whether the engine publishes stats from multiple threads.
    fn is_multi_thread(&self) -> bool {
        false
    }
}

/// Instantiate the selected engine over an open file descriptor.
///
/// The descriptor stays owned by the controller and must outlive the engine.
pub fn create(
    kind: IoEngineKind,
    fd: RawFd,
    live: Arc<LiveConfig>,
    shaper: Arc<Shaper>,
    stats: Arc<StatsAccumulator>,
) -> Result<Box<dyn Engine>> {
    Ok(match kind {
        IoEngineKind::Posix => Box::new(posix::PosixEngine::new(fd, shaper, stats)),
        IoEngineKind::Prwv2 => Box::new(prwv2::PrwEngine::new(fd, live, shaper, stats)),
        IoEngineKind::Libaio => Box::new(libaio::AioEngine::new(fd, live, shaper, stats)?),
    })
}
