//! libaio batched engine
//!
//! Asynchronous engine over Linux native AIO (`io_setup`/`io_submit`/
//! `io_getevents`). The submission context is created with capacity
//! [`MAX_IODEPTH`] and owns that many request slots, each carrying its own
//! aligned buffer, so a live `iodepth` increase never allocates in the hot
//! path.
//!
//! Slot lifecycle: `Idle -> Submitted -> Completed -> Idle`. Only slots with
//! index below the live `iodepth` are (re)submitted; when `iodepth` shrinks,
//! in-flight requests on now-disabled slots drain naturally and their slots
//! simply stay idle.
//!
//! Native AIO is only asynchronous with O_DIRECT on most filesystems, so
//! startup validation rejects this engine without `--o_direct`.
//!
//! # Implementation
//!
//! Uses direct syscalls via libc rather than a binding crate (the libaio
//! library is LGPL). Completion events carry the slot index in `data`.

use super::Engine;
use crate::config::{LiveConfig, MAX_IODEPTH};
use crate::shaper::Shaper;
use crate::stats::{Stats, StatsAccumulator};
use crate::util::buffer::AlignedBuffer;
use crate::util::rng::{Randomizer, REWRITE_REFRESH_STRIDE};
use crate::Result;
use anyhow::Context;
use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

type AioContext = libc::c_ulong;

const IOCB_CMD_PREAD: u16 = 0;
const IOCB_CMD_PWRITE: u16 = 1;

/// Bounded completion wait per iteration.
const GETEVENTS_TIMEOUT_NS: i64 = 200 * 1_000_000;
/// Drain window for in-flight requests during teardown.
const TEARDOWN_TIMEOUT_NS: i64 = 300 * 1_000_000;

// struct iocb, x86_64 little-endian layout
#[repr(C)]
#[derive(Clone, Copy)]
struct IoControlBlock {
    data: u64,          // returned in the completion event (slot index)
    key: u32,
    aio_rw_flags: u32,  // RWF_* flags
    lio_opcode: u16,
    aio_reqprio: i16,
    aio_fildes: u32,
    buf: u64,
    nbytes: u64,
    offset: i64,
    aio_reserved2: u64,
    flags: u32,
    aio_resfd: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct IoEvent {
    data: u64,
    obj: u64,
    res: i64,
    res2: i64,
}

unsafe fn io_setup(maxevents: libc::c_int, ctxp: *mut AioContext) -> libc::c_int {
    libc::syscall(libc::SYS_io_setup, maxevents as i64, ctxp) as libc::c_int
}

unsafe fn io_destroy(ctx: AioContext) -> libc::c_int {
    libc::syscall(libc::SYS_io_destroy, ctx) as libc::c_int
}

unsafe fn io_submit(
    ctx: AioContext,
    nr: libc::c_long,
    iocbpp: *mut *mut IoControlBlock,
) -> libc::c_int {
    libc::syscall(libc::SYS_io_submit, ctx, nr, iocbpp) as libc::c_int
}

unsafe fn io_getevents(
    ctx: AioContext,
    min_nr: libc::c_long,
    nr: libc::c_long,
    events: *mut IoEvent,
    timeout: *mut libc::timespec,
) -> libc::c_int {
    libc::syscall(libc::SYS_io_getevents, ctx, min_nr, nr, events, timeout) as libc::c_int
}

unsafe fn io_cancel(
    ctx: AioContext,
    iocb: *mut IoControlBlock,
    result: *mut IoEvent,
) -> libc::c_int {
    libc::syscall(libc::SYS_io_cancel, ctx, iocb, result) as libc::c_int
}

/// One pre-allocated request slot.
struct AioSlot {
    active: bool,
    write: bool,
    size: usize,
    offset: u64,
    stats: Stats,
    iocb: IoControlBlock,
    buffer: Option<AlignedBuffer>,
}

impl AioSlot {
    fn idle() -> Self {
        Self {
            active: false,
            write: false,
            size: 0,
            offset: 0,
            stats: Stats::default(),
            iocb: unsafe { MaybeUninit::zeroed().assume_init() },
            buffer: None,
        }
    }
}

pub struct AioEngine {
    ctx: AioContext,
    fd: RawFd,
    live: Arc<LiveConfig>,
    shaper: Arc<Shaper>,
    stats: Arc<StatsAccumulator>,
    rng: Randomizer,

    /// MAX_IODEPTH slots; the vector is never resized, so iocb addresses
    /// stay stable while requests are in flight.
    slots: Vec<AioSlot>,
    events: Vec<IoEvent>,
}

impl AioEngine {
    pub fn new(
        fd: RawFd,
        live: Arc<LiveConfig>,
        shaper: Arc<Shaper>,
        stats: Arc<StatsAccumulator>,
    ) -> Result<Self> {
        let mut ctx: AioContext = 0;
        let ret = unsafe { io_setup(MAX_IODEPTH as libc::c_int, &mut ctx) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("io_setup failed with capacity {}", MAX_IODEPTH));
        }

        let slots = (0..MAX_IODEPTH).map(|_| AioSlot::idle()).collect();
        let events: Vec<IoEvent> = vec![
            unsafe { MaybeUninit::zeroed().assume_init() };
            MAX_IODEPTH as usize
        ];

        Ok(Self {
            ctx,
            fd,
            live,
            shaper,
            stats,
            rng: Randomizer::new(),
            slots,
            events,
        })
    }

    /// Prepare and submit one request on an idle slot.
    ///
    /// Returns whether the slot became active. Transient submission results
    /// (0, EINTR, EAGAIN) leave the slot idle for the next iteration.
    fn submit_slot(&mut self, index: usize) -> Result<bool> {
        let params = self.shaper.next_params();
        debug_assert!(params.size > 0);

        let slot = &mut self.slots[index];
        debug_assert!(!slot.active);

        if slot.size != params.size {
            debug!(
                "slot {} request size changed from {} to {}",
                index, slot.size, params.size
            );
            slot.size = params.size;
            let mut buffer = AlignedBuffer::new(params.size)?;
            self.rng.fill_buffer(buffer.as_mut_slice());
            slot.buffer = Some(buffer);
        } else if params.write && slot.write {
            let buffer = slot.buffer.as_mut().expect("buffer allocated");
            self.rng
                .fill_buffer_sparse(buffer.as_mut_slice(), REWRITE_REFRESH_STRIDE);
        }

        slot.stats = Stats::one_block(params.block_size_kib, params.write);
        slot.write = params.write;
        slot.offset = params.offset;

        let buffer = slot.buffer.as_mut().expect("buffer allocated");
        slot.iocb = IoControlBlock {
            data: index as u64,
            key: 0,
            aio_rw_flags: if params.write && params.dsync {
                libc::RWF_DSYNC as u32
            } else {
                0
            },
            lio_opcode: if params.write {
                IOCB_CMD_PWRITE
            } else {
                IOCB_CMD_PREAD
            },
            aio_reqprio: 0,
            aio_fildes: self.fd as u32,
            buf: buffer.as_mut_ptr() as u64,
            nbytes: slot.size as u64,
            offset: slot.offset as i64,
            aio_reserved2: 0,
            flags: 0,
            aio_resfd: 0,
        };

        let mut iocb_ptr = &mut slot.iocb as *mut IoControlBlock;
        let ret = unsafe { io_submit(self.ctx, 1, &mut iocb_ptr) };

        if ret == 1 {
            slot.active = true;
            Ok(true)
        } else if ret == 0 {
            warn!("aio submit returned 0");
            Ok(false)
        } else {
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) => {
                    warn!("aio submit returned transient error: {}", err);
                    Ok(false)
                }
                _ => Err(err).context("failed to submit aio request"),
            }
        }
    }

    fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.active).count()
    }
}

impl Engine for AioEngine {
    fn make_requests(&mut self, stop: &AtomicBool) -> Result<()> {
        let iodepth = self.live.iodepth() as usize;

        for i in 0..iodepth {
            if !self.slots[i].active {
                self.submit_slot(i)?;
            }
        }

        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }

        let mut timeout = libc::timespec {
            tv_sec: 0,
            tv_nsec: GETEVENTS_TIMEOUT_NS,
        };
        let nevents = unsafe {
            io_getevents(
                self.ctx,
                1,
                MAX_IODEPTH as libc::c_long,
                self.events.as_mut_ptr(),
                &mut timeout,
            )
        };

        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }

        if nevents < 0 {
            let err = std::io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) => {
                    warn!("io_getevents returned transient error: {}", err);
                    Ok(())
                }
                _ => Err(err).context("io_getevents failed"),
            };
        }

        if nevents > 0 {
            let mut batch = Stats::default();
            for i in 0..nevents as usize {
                let index = self.events[i].data as usize;
                debug_assert!(index < self.slots.len());

                let slot = &mut self.slots[index];
                slot.active = false;
                self.shaper.offset_released(slot.offset);
                batch += slot.stats;

                if index < iodepth {
                    self.submit_slot(index)?;
                }
            }
            self.stats.add(&batch);
        }

        Ok(())
    }
}

impl Drop for AioEngine {
    fn drop(&mut self) {
        let in_flight = self.active_count();
        if in_flight > 0 {
            info!("waiting for {} in-flight aio requests", in_flight);
            let mut timeout = libc::timespec {
                tv_sec: 0,
                tv_nsec: TEARDOWN_TIMEOUT_NS,
            };
            let ret = unsafe {
                io_getevents(
                    self.ctx,
                    in_flight as libc::c_long,
                    MAX_IODEPTH as libc::c_long,
                    self.events.as_mut_ptr(),
                    &mut timeout,
                )
            };
            if ret < 0 {
                error!(
                    "io_getevents during teardown failed: {}",
                    std::io::Error::last_os_error()
                );
            } else {
                for i in 0..ret as usize {
                    let index = self.events[i].data as usize;
                    if let Some(slot) = self.slots.get_mut(index) {
                        slot.active = false;
                    }
                }
            }

            for (index, slot) in self.slots.iter_mut().enumerate() {
                if slot.active {
                    info!("aio request on slot {} is still active, canceling it", index);
                    let mut event: IoEvent = unsafe { MaybeUninit::zeroed().assume_init() };
                    let ret = unsafe { io_cancel(self.ctx, &mut slot.iocb, &mut event) };
                    if ret < 0 {
                        warn!("io_cancel failed: {}", std::io::Error::last_os_error());
                    }
                    slot.active = false;
                }
            }
        }

        let ret = unsafe { io_destroy(self.ctx) };
        if ret < 0 {
            error!("io_destroy failed: {}", std::io::Error::last_os_error());
        }
    }
}
