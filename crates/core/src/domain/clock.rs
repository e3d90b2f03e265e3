//! Virtual clock timeline arithmetic
//!
//! Emulates a hardware DMA pointer with a fixed-resolution tick counter:
//! positions are kept scaled by [`TICK_RESOLUTION`] so that arbitrary
//! rate/tick ratios accumulate without rounding. The timeline is pure
//! arithmetic; the rearming wake timer that drives it lives in
//! `virtuoso-infra`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Ticks per second of the virtual clock (the `R` scale of all fractional
/// position arithmetic)
pub const TICK_RESOLUTION: u64 = 1000;

/// Convert a tick count into wall-clock time
pub fn ticks_to_duration(ticks: u64) -> Duration {
    Duration::from_nanos(ticks.saturating_mul(1_000_000_000 / TICK_RESOLUTION))
}

/// Source of the current tick count
pub trait TickSource: Send + Sync + fmt::Debug {
    fn now_ticks(&self) -> u64;
}

/// Wall-clock tick source anchored at its creation instant
#[derive(Debug)]
pub struct SystemTicks {
    origin: Instant,
}

impl SystemTicks {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemTicks {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for SystemTicks {
    fn now_ticks(&self) -> u64 {
        let elapsed = self.origin.elapsed();
        elapsed.as_secs() * TICK_RESOLUTION
            + u64::from(elapsed.subsec_nanos()) / (1_000_000_000 / TICK_RESOLUTION)
    }
}

/// Hand-driven tick source for deterministic tests
#[derive(Debug, Clone, Default)]
pub struct ManualTicks(Arc<AtomicU64>);

impl ManualTicks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ticks: u64) {
        self.0.fetch_add(ticks, Ordering::SeqCst);
    }

    pub fn set(&self, ticks: u64) {
        self.0.store(ticks, Ordering::SeqCst);
    }
}

impl TickSource for ManualTicks {
    fn now_ticks(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Fractional DMA-pointer state for one open device instance
///
/// All byte quantities are carried scaled by [`TICK_RESOLUTION`]; the
/// sub-byte residue left by each advance is the drift debt that keeps the
/// long-run position error below one byte regardless of run length.
#[derive(Debug, Clone, Default)]
pub struct ClockTimeline {
    byte_rate: u64,
    buffer_bytes: u64,
    frac_pos: u64,
    frac_period_rest: u64,
    frac_buffer: u64,
    frac_period: u64,
    base_ticks: u64,
    elapsed: u32,
}

impl ClockTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset for a new run with the given geometry
    pub fn prepare(&mut self, byte_rate: u64, buffer_bytes: u64, period_bytes: u64) {
        self.byte_rate = byte_rate;
        self.buffer_bytes = buffer_bytes;
        self.frac_pos = 0;
        self.frac_buffer = buffer_bytes * TICK_RESOLUTION;
        self.frac_period = period_bytes * TICK_RESOLUTION;
        self.frac_period_rest = self.frac_period;
        self.elapsed = 0;
    }

    /// Anchor the timeline at `now`; the next advance counts from here
    pub fn start(&mut self, now_ticks: u64) {
        self.base_ticks = now_ticks;
    }

    /// Advance the position to `now`, returning the whole bytes gained
    ///
    /// Accumulates period-boundary crossings into the pending elapsed
    /// count; the caller drains it with [`take_elapsed`](Self::take_elapsed)
    /// once it is safe to notify.
    pub fn advance(&mut self, now_ticks: u64) -> u64 {
        let delta = now_ticks.saturating_sub(self.base_ticks);
        if delta == 0 || self.byte_rate == 0 {
            return 0;
        }
        self.base_ticks += delta;

        let delta_frac = delta * self.byte_rate;
        let advanced = (self.frac_pos % TICK_RESOLUTION + delta_frac) / TICK_RESOLUTION;

        self.frac_pos += delta_frac;
        if self.frac_buffer > 0 {
            self.frac_pos %= self.frac_buffer;
        }
        while self.frac_period_rest <= delta_frac {
            self.elapsed += 1;
            self.frac_period_rest += self.frac_period;
        }
        self.frac_period_rest -= delta_frac;

        advanced
    }

    /// Current pointer as a byte offset into the buffer
    ///
    /// Never regresses except by wraparound at the buffer size.
    pub fn pos_bytes(&self) -> u64 {
        self.frac_pos / TICK_RESOLUTION
    }

    /// Ticks until one more period's worth of bytes will have been produced
    pub fn wake_in_ticks(&self) -> u64 {
        if self.byte_rate == 0 {
            return 0;
        }
        self.frac_period_rest.div_ceil(self.byte_rate)
    }

    /// Drain the pending elapsed-period count (coalesced, never dropped)
    pub fn take_elapsed(&mut self) -> u32 {
        std::mem::take(&mut self.elapsed)
    }

    pub fn pending_elapsed(&self) -> u32 {
        self.elapsed
    }

    pub fn byte_rate(&self) -> u64 {
        self.byte_rate
    }

    pub fn buffer_bytes(&self) -> u64 {
        self.buffer_bytes
    }
}
