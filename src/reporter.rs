//! Interval statistics reporter
//!
//! Every `stats_interval` seconds the reporter snapshots the cumulative
//! counters, diffs them against the previous snapshot, and emits one STATS
//! record on the log channel (target `stats`, so `--log_level=output` can
//! isolate the records).
//!
//! The sleep for each period is drift-corrected: it subtracts the time spent
//! outside the previous sleep and adds the externally requested shift, so
//! record timestamps do not drift over long runs. A computed sleep outside
//! `[0, 2*interval)` means the bookkeeping is broken and fails loudly.
//!
//! After any successful configuration mutation one emission is skipped, so
//! a record never averages two workload regimes.

use crate::config::LiveConfig;
use crate::stats::{Stats, StatsAccumulator};
use crate::Result;
use anyhow::bail;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Attempts before a pending shift is forcibly overwritten.
const MAX_SHIFT_REPORT_TIME_TRIES: u32 = 2;

/// Pending report-time shift, published by the command channel and consumed
/// by the reporter.
///
/// A shift is accepted only while no earlier shift is pending; after
/// [`MAX_SHIFT_REPORT_TIME_TRIES`] rejected attempts the pending value is
/// overwritten anyway.
#[derive(Debug, Default)]
pub struct ShiftSlot {
    ms: AtomicI64,
    tries: AtomicU32,
}

impl ShiftSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a shift of the next report by `ms` milliseconds.
    ///
    /// Returns the confirmation message to report back to the caller.
    pub fn request(&self, ms: i64, stats_interval_s: u32) -> Result<String> {
        let limit = 700 * stats_interval_s as i64;
        if ms.abs() >= limit {
            bail!(
                "invalid shift time; must be between -{} and {} ms",
                limit,
                limit
            );
        }

        if self
            .ms
            .compare_exchange(0, ms, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.tries.store(0, Ordering::Relaxed);
            Ok(format!("set shift_report_time = {}ms", ms))
        } else if self.tries.load(Ordering::Relaxed) >= MAX_SHIFT_REPORT_TIME_TRIES {
            self.tries.store(0, Ordering::Relaxed);
            self.ms.store(ms, Ordering::Release);
            Ok(format!("set shift_report_time = {}ms (overridden)", ms))
        } else {
            self.tries.fetch_add(1, Ordering::Relaxed);
            bail!(
                "failed to set shift_report_time = {}ms; the previous value has not been applied yet, try again later",
                ms
            );
        }
    }

    /// Consume the pending shift, in microseconds.
    pub fn take_us(&self) -> i64 {
        self.ms.swap(0, Ordering::AcqRel) * 1000
    }
}

pub struct Reporter {
    active: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<anyhow::Error>>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Reporter {
    pub fn spawn(
        live: Arc<LiveConfig>,
        stats: Arc<StatsAccumulator>,
        shift: Arc<ShiftSlot>,
        stop: Arc<AtomicBool>,
        stats_interval_s: u32,
        start: Instant,
    ) -> Self {
        let active = Arc::new(AtomicBool::new(true));
        let failure = Arc::new(Mutex::new(None));

        let handle = {
            let active = active.clone();
            let failure = failure.clone();
            thread::spawn(move || {
                info!("report thread initiated");
                if let Err(err) = report_main(&live, &stats, &shift, &stop, stats_interval_s, start)
                {
                    debug!("report thread failed: {:#}", err);
                    *failure.lock().unwrap() = Some(err);
                }
                info!("report thread finished");
                active.store(false, Ordering::Release);
            })
        };

        Self {
            active,
            failure,
            handle: Some(handle),
        }
    }

    /// Re-raise a captured reporter error, if any.
    pub fn check(&self) -> Result<()> {
        if let Some(err) = self.failure.lock().unwrap().take() {
            return Err(err);
        }
        Ok(())
    }

    /// Join the report thread with a 2 s grace window; a reporter still
    /// sleeping past the window is abandoned rather than blocking teardown.
    pub fn join_with_grace(mut self) {
        for _ in 0..20 {
            if !self.active.load(Ordering::Acquire) {
                break;
            }
            thread::sleep(Duration::from_millis(100));
        }

        if self.active.load(Ordering::Acquire) {
            warn!("report thread unresponsive, abandoning it");
            self.handle.take();
        } else if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn report_main(
    live: &LiveConfig,
    stats: &StatsAccumulator,
    shift: &ShiftSlot,
    stop: &AtomicBool,
    stats_interval_s: u32,
    start: Instant,
) -> Result<()> {
    let interval_us = stats_interval_s as i64 * 1_000_000;
    let mut correction = Instant::now();
    let mut last_ms = 0u64;
    let mut last_stats = stats.snapshot();

    // the first interval is partial; skip it like any config change
    live.mark_changed();

    while !stop.load(Ordering::Relaxed) {
        let shift_us = shift.take_us();
        let sleep_us = interval_us - correction.elapsed().as_micros() as i64 + shift_us;
        if !(0..2 * interval_us).contains(&sleep_us) {
            bail!("BUG: invalid sleep time in report thread: {}us", sleep_us);
        }

        thread::sleep(Duration::from_micros(sleep_us as u64));
        if stop.load(Ordering::Relaxed) {
            break;
        }
        correction = Instant::now();

        let cur_ms = start.elapsed().as_millis() as u64;
        let cur_stats = stats.snapshot();

        if !live.take_changed() {
            let elapsed_ms = (cur_ms - last_ms).max(1);
            let delta = cur_stats - last_stats;
            info!(
                target: "stats",
                "STATS: {}",
                format_record(start.elapsed().as_secs(), elapsed_ms, &delta, live)
            );
        }

        last_stats = cur_stats;
        last_ms = cur_ms;
    }

    Ok(())
}

/// Render one interval record. All values are strings, throughput with two
/// decimals and block rates with one.
fn format_record(time_s: u64, elapsed_ms: u64, delta: &Stats, live: &LiveConfig) -> String {
    let mib_s = |kib: u64| (kib * 1000) as f64 / (elapsed_ms * 1024) as f64;
    let per_s = |count: u64| (count * 1000) as f64 / elapsed_ms as f64;

    format!(
        "{{\"time\":\"{}\", \"total_MiB/s\":\"{:.2}\", \"read_MiB/s\":\"{:.2}\", \
         \"write_MiB/s\":\"{:.2}\", \"blocks/s\":\"{:.1}\", \"blocks_read/s\":\"{:.1}\", \
         \"blocks_write/s\":\"{:.1}\", \"wait\":\"{}\", \"filesize\":\"{}\", \
         \"block_size\":\"{}\", \"iodepth\":\"{}\", \"flush_blocks\":\"{}\", \
         \"write_ratio\":\"{}\", \"random_ratio\":\"{}\"}}",
        time_s,
        mib_s(delta.kib_read + delta.kib_write),
        mib_s(delta.kib_read),
        mib_s(delta.kib_write),
        per_s(delta.blocks),
        per_s(delta.blocks_read),
        per_s(delta.blocks_write),
        live.wait(),
        live.filesize_mib(),
        live.block_size_kib(),
        live.iodepth(),
        live.flush_blocks(),
        live.write_ratio(),
        live.random_ratio(),
    )
}
