//! Request shaper
//!
//! Converts the live configuration knobs plus randomness into one concrete
//! request descriptor per call. Random and sequential steps share a single
//! block cursor: a random draw teleports the cursor, a sequential draw
//! advances it by one block with wrap-around. Interleaving both from one
//! cursor gives realistic mixed-locality patterns and lets the
//! `random_ratio` knob shift the mix instantly without any state
//! discontinuity.
//!
//! Offsets are derived from block numbers, so every offset is naturally
//! aligned to the block size and `offset + size` never exceeds the file.

use crate::config::LiveConfig;
use crate::util::lock::SpinLock;
use crate::util::rng::Randomizer;
use std::sync::Arc;
use tracing::debug;

/// One concrete request descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessParams {
    pub block_size_kib: u32,
    /// Request length in bytes; always `block_size_kib * 1024`.
    pub size: usize,
    /// Byte offset; always a multiple of `size`.
    pub offset: u64,
    pub write: bool,
    /// Writes carry RWF_DSYNC when set (engines opened without O_DSYNC).
    pub dsync: bool,
}

/// Cursor state, guarded by the shaper lock.
#[derive(Debug)]
struct ShaperState {
    block_size_kib: u32,
    buffer_size: u64,
    file_blocks: u64,
    cursor_block: u64,
    rng: Randomizer,
}

/// Shared request shaper.
///
/// Engines call [`next_params`](Shaper::next_params) from one or many
/// threads; the controller calls
/// [`apply_config_changes`](Shaper::apply_config_changes) between engine
/// iterations so a live `block_size` mutation rebuilds the cursor state
/// atomically.
pub struct Shaper {
    live: Arc<LiveConfig>,
    state: SpinLock<ShaperState>,
}

impl Shaper {
    pub fn new(live: Arc<LiveConfig>) -> Self {
        let shaper = Self {
            live,
            state: SpinLock::new(ShaperState {
                block_size_kib: 0,
                buffer_size: 0,
                file_blocks: 0,
                cursor_block: 0,
                rng: Randomizer::new(),
            }),
        };
        shaper.apply_config_changes();
        shaper
    }

    #[cfg(test)]
    pub(crate) fn with_seed(live: Arc<LiveConfig>, seed: u64) -> Self {
        let shaper = Self {
            live,
            state: SpinLock::new(ShaperState {
                block_size_kib: 0,
                buffer_size: 0,
                file_blocks: 0,
                cursor_block: 0,
                rng: Randomizer::with_seed(seed),
            }),
        };
        shaper.apply_config_changes();
        shaper
    }

    /// Rebuild the cursor state if the live block size changed.
    ///
    /// Resetting the cursor to `file_blocks` makes the next sequential
    /// request wrap to offset 0, so the first post-change offset is aligned
    /// for the new block size.
    pub fn apply_config_changes(&self) {
        let block_size_kib = self.live.block_size_kib();
        let mut state = self.state.lock();

        if state.block_size_kib != block_size_kib {
            debug!(
                "block_size changed from {} to {}",
                state.block_size_kib, block_size_kib
            );
            state.block_size_kib = block_size_kib;
            state.buffer_size = block_size_kib as u64 * 1024;
            state.file_blocks = (self.live.filesize_mib() * 1024) / block_size_kib as u64;
            state.cursor_block = state.file_blocks;
        }
    }

    /// Produce the next request descriptor.
    pub fn next_params(&self) -> AccessParams {
        let write_ratio = self.live.write_ratio();
        let random_ratio = self.live.random_ratio();
        let dsync = self.live.o_dsync();

        let mut state = self.state.lock();

        let write = state.rng.hit_ratio(write_ratio);

        if state.rng.hit_ratio(random_ratio) {
            let file_blocks = state.file_blocks;
            state.cursor_block = state.rng.next_block(file_blocks);
        } else {
            state.cursor_block += 1;
            if state.cursor_block >= state.file_blocks {
                state.cursor_block = 0;
            }
        }

        AccessParams {
            block_size_kib: state.block_size_kib,
            size: state.buffer_size as usize,
            offset: state.cursor_block * state.buffer_size,
            write,
            dsync,
        }
    }

    /// Completion hook: the engine no longer has `offset` in flight.
    pub fn offset_released(&self, _offset: u64) {}
}
