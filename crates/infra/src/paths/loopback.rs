//! Loopback Audio Path
//!
//! Pairs a playback stream with a capture stream through a shared cable:
//! whatever the application writes on the playback side reappears on the
//! capture side one copy window later. Each side runs its own virtual
//! clock; the cable bounds the copy window by the slower side's advance
//! and lets the faster side run ahead pointer-only, so the long-run
//! timing error never exceeds one byte-rate quantum.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use virtuoso_core::domain::clock::{ClockTimeline, TickSource};
use virtuoso_core::domain::path::{AudioPath, AudioPathOps, HardwareParams, PathInstance};
use virtuoso_core::domain::pcm::{
    copy_between_rings, ring_fill, EventSink, PcmContext, PcmError, PcmResult, PcmState,
    SampleBuffer, SampleFormat, SubstreamInfo, TriggerCommand,
};
use virtuoso_core::domain::stream::{Direction, Stream};

use crate::clock::WakeTimer;

pub const LOOPBACK_UID: &str = "ap_loopback";

const LOOPBACK_SAMPLE_RATE: u32 = 48000;
const LOOPBACK_BLOCKSIZE: u32 = 512;

const PLAYBACK: usize = 0;
const CAPTURE: usize = 1;

/// Key space for cables that never got a peer from configure
const UNPAIRED_KEY_BASE: u64 = 1 << 32;

fn side_of(direction: Direction) -> usize {
    match direction {
        Direction::Playback => PLAYBACK,
        Direction::Capture => CAPTURE,
    }
}

/// Descriptor for the loopback Audio Path
pub fn loopback_path() -> AudioPath {
    AudioPath::new(
        LOOPBACK_UID,
        "Loopback Audio Path",
        [0, 0, 1],
        HardwareParams {
            formats: vec![SampleFormat::S16Le],
            rate_min: LOOPBACK_SAMPLE_RATE,
            rate_max: LOOPBACK_SAMPLE_RATE,
            channels_min: 1,
            channels_max: 8,
            periods_min: 1,
            periods_max: 8,
            blocksize: LOOPBACK_BLOCKSIZE,
        },
        Arc::new(LoopbackOps::default()),
    )
}

/// Capability snapshot negotiated by the first side to commit parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CableParams {
    pub format: SampleFormat,
    pub rate: u32,
    pub channels: u32,
}

impl std::fmt::Display for CableParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}Hz {}ch", self.format, self.rate, self.channels)
    }
}

struct SideState {
    timeline: ClockTimeline,
    ring: SampleBuffer,
    sink: EventSink,
    device: u32,
    /// Committed hardware parameters (the cable's valid mask)
    valid: bool,
    running: bool,
    /// Set by suspend, cleared by resume/stop (the cable's pause mask)
    paused: bool,
    /// Playback only: bytes written ahead of the loop cursor
    unread: u64,
}

impl SideState {
    fn active(&self) -> bool {
        self.valid && self.running && !self.paused
    }
}

struct CableState {
    params: Option<CableParams>,
    open: [bool; 2],
    sides: [Option<SideState>; 2],
}

impl Default for CableState {
    fn default() -> Self {
        Self {
            params: None,
            open: [false; 2],
            sides: [None, None],
        }
    }
}

/// Shared playback/capture state for one loopback pairing
///
/// One lock guards the whole cable: both sides' timelines, the valid and
/// running masks and the negotiated snapshot. Notifications are emitted by
/// the per-side wakes after this lock is released.
#[derive(Default)]
pub struct Cable {
    state: Mutex<CableState>,
}

impl Cable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance both sides to `now` and run the copy/silence window
    ///
    /// Safe to call from either side's wake or from a pointer query; each
    /// side only ever advances by its own elapsed ticks.
    pub fn update(&self, now_ticks: u64) {
        let mut state = self.lock();
        Self::advance_locked(&mut state, now_ticks);
    }

    /// Post-update pointer of one side, in bytes
    pub fn pointer(&self, direction: Direction, now_ticks: u64) -> PcmResult<u64> {
        let mut state = self.lock();
        Self::advance_locked(&mut state, now_ticks);
        state.sides[side_of(direction)]
            .as_ref()
            .map(|s| s.timeline.pos_bytes())
            .ok_or(PcmError::InvalidState {
                op: "pointer",
                state: PcmState::Open,
            })
    }

    fn advance_locked(state: &mut CableState, now: u64) {
        let (play_half, capture_half) = state.sides.split_at_mut(1);
        let play = play_half[0].as_mut().filter(|s| s.active());
        let capture = capture_half[0].as_mut().filter(|s| s.active());

        match (play, capture) {
            (Some(play), Some(capture)) => {
                let play_old = play.timeline.pos_bytes() as usize;
                let capture_old = capture.timeline.pos_bytes() as usize;
                let play_adv = play.timeline.advance(now);
                let capture_adv = capture.timeline.advance(now);
                // Positions wrap at each side's runtime buffer, not at the
                // larger ring allocation
                let play_window = play.timeline.buffer_bytes() as usize;
                let capture_window = capture.timeline.buffer_bytes() as usize;

                // The slower side bounds the common copy window; the
                // faster side's excess is pointer-only self-advance with
                // its sub-byte residue kept in the timeline
                let window = play_adv.min(capture_adv);
                let copied = window.min(play.unread);

                if copied > 0 {
                    play.ring.with(|src| {
                        capture.ring.with(|dst| {
                            copy_between_rings(
                                &src[..play_window],
                                play_old,
                                &mut dst[..capture_window],
                                capture_old,
                                copied as usize,
                            );
                        });
                    });
                }
                // Anything the playback side could not cover, and any
                // capture excess beyond the window, reads as silence
                // rather than stale ring data
                if capture_adv > copied {
                    capture.ring.with(|dst| {
                        ring_fill(
                            &mut dst[..capture_window],
                            capture_old + copied as usize,
                            (capture_adv - copied) as usize,
                            SampleFormat::S16Le.silence_byte(),
                        );
                    });
                }
                // The loop cursor is the playback pointer: data it passed
                // over is gone whether or not the capture side kept up
                play.unread = play.unread.saturating_sub(play_adv);
            }
            (None, Some(capture)) => {
                // No valid playback peer: self-fill silence, never block
                let capture_old = capture.timeline.pos_bytes() as usize;
                let capture_adv = capture.timeline.advance(now);
                let capture_window = capture.timeline.buffer_bytes() as usize;
                if capture_adv > 0 {
                    capture.ring.with(|dst| {
                        ring_fill(
                            &mut dst[..capture_window],
                            capture_old,
                            capture_adv as usize,
                            SampleFormat::S16Le.silence_byte(),
                        );
                    });
                }
            }
            (Some(play), None) => {
                let play_adv = play.timeline.advance(now);
                play.unread = play.unread.saturating_sub(play_adv);
            }
            (None, None) => {}
        }
    }

    fn claim(&self, side: usize) -> PcmResult<()> {
        let mut state = self.lock();
        if state.open[side] {
            return Err(PcmError::CableConflict(
                "cable side is already open".to_string(),
            ));
        }
        state.open[side] = true;
        Ok(())
    }

    /// Drop one side; returns true when the cable is now fully closed
    fn release(&self, side: usize) -> bool {
        let mut state = self.lock();
        state.open[side] = false;
        state.sides[side] = None;
        !state.open[PLAYBACK] && !state.open[CAPTURE]
    }

    fn wake_side(&self, side: usize, now: u64) -> Option<u64> {
        let (elapsed, sink, device, next) = {
            let mut state = self.lock();
            let active = state.sides[side]
                .as_ref()
                .map(SideState::active)
                .unwrap_or(false);
            if !active {
                return None;
            }
            Self::advance_locked(&mut state, now);
            let side_state = state.sides[side].as_mut()?;
            let elapsed = side_state.timeline.take_elapsed();
            (
                elapsed,
                side_state.sink.clone(),
                side_state.device,
                now + side_state.timeline.wake_in_ticks(),
            )
        };
        if elapsed > 0 {
            sink.period_elapsed(device, elapsed);
        }
        Some(next)
    }

    fn lock(&self) -> MutexGuard<'_, CableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
struct LoopbackShared {
    /// Device index -> cable key, built by configure
    pairing: HashMap<u32, u64>,
    cables: HashMap<u64, Arc<Cable>>,
}

#[derive(Default)]
struct LoopbackOps {
    shared: Arc<Mutex<LoopbackShared>>,
}

fn lock_shared(shared: &Arc<Mutex<LoopbackShared>>) -> MutexGuard<'_, LoopbackShared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AudioPathOps for LoopbackOps {
    fn configure(&self, streams: &[Stream]) -> virtuoso_core::domain::path::Result<()> {
        let mut shared = lock_shared(&self.shared);
        shared.pairing.clear();

        let mine: Vec<&Stream> = streams.iter().filter(|s| s.map() == LOOPBACK_UID).collect();
        for stream in &mine {
            info!(
                "{}: stream name:{} device:{} channels:{}",
                LOOPBACK_UID,
                stream.name(),
                stream.device(),
                stream.channels()
            );
        }

        // The nth playback stream on this path pairs with the nth capture
        // stream; leftovers run peerless
        let playbacks = mine.iter().filter(|s| s.direction() == Direction::Playback);
        let captures = mine.iter().filter(|s| s.direction() == Direction::Capture);
        for (pair, stream) in playbacks.enumerate() {
            shared.pairing.insert(stream.device(), pair as u64);
        }
        for (pair, stream) in captures.enumerate() {
            shared.pairing.insert(stream.device(), pair as u64);
        }
        Ok(())
    }

    fn open(&self, info: &SubstreamInfo) -> PcmResult<Box<dyn PathInstance>> {
        let side = side_of(info.direction);
        let (key, cable) = {
            let mut shared = lock_shared(&self.shared);
            let key = shared
                .pairing
                .get(&info.device)
                .copied()
                .unwrap_or(UNPAIRED_KEY_BASE + u64::from(info.device));
            let cable = Arc::clone(shared.cables.entry(key).or_default());
            (key, cable)
        };

        cable.claim(side)?;
        debug!(
            "{}: device {} opened as {:?} on cable {}",
            LOOPBACK_UID, info.device, info.direction, key
        );

        Ok(Box::new(LoopbackInstance {
            shared: Arc::clone(&self.shared),
            cable,
            key,
            side,
            timer: None,
            ticks: None,
        }))
    }
}

struct LoopbackInstance {
    shared: Arc<Mutex<LoopbackShared>>,
    cable: Arc<Cable>,
    key: u64,
    side: usize,
    timer: Option<WakeTimer>,
    ticks: Option<Arc<dyn TickSource>>,
}

impl LoopbackInstance {
    fn now(&self) -> PcmResult<u64> {
        self.ticks
            .as_ref()
            .map(|t| t.now_ticks())
            .ok_or(PcmError::InvalidState {
                op: "tick access",
                state: PcmState::Open,
            })
    }

    fn with_side<R>(&self, f: impl FnOnce(&mut SideState) -> R) -> PcmResult<R> {
        let mut state = self.cable.lock();
        state.sides[self.side]
            .as_mut()
            .map(f)
            .ok_or(PcmError::InvalidState {
                op: "cable side access",
                state: PcmState::Open,
            })
    }

    fn stop_side(&mut self, paused: bool) -> PcmResult<()> {
        self.with_side(|side| {
            side.running = false;
            side.paused = paused;
        })?;
        if let Some(timer) = &self.timer {
            timer.cancel();
        }
        Ok(())
    }
}

impl PathInstance for LoopbackInstance {
    fn prepare(&mut self, ctx: &mut PcmContext) -> PcmResult<()> {
        let runtime = *ctx.runtime()?;
        let ring = ctx.ring()?.clone();
        let ticks = Arc::clone(&ctx.ticks);

        let proposed = CableParams {
            format: runtime.format,
            rate: runtime.rate,
            channels: runtime.channels,
        };

        let stopped_capture = {
            let mut state = self.cable.lock();
            let mut stopped = None;
            match state.params {
                None => state.params = Some(proposed),
                Some(established) if established == proposed => {}
                Some(established) => {
                    if self.side == CAPTURE {
                        return Err(PcmError::CableConflict(format!(
                            "capture requested {}, cable established {}",
                            proposed, established
                        )));
                    }
                    // Playback wins the conflict: the capture side is
                    // force-stopped and told to renegotiate
                    if let Some(capture) = state.sides[CAPTURE].as_mut() {
                        capture.running = false;
                        capture.paused = false;
                        capture.valid = false;
                        stopped = Some((capture.sink.clone(), capture.device));
                    }
                    state.params = Some(proposed);
                }
            }

            let mut timeline = ClockTimeline::new();
            timeline.prepare(runtime.byte_rate(), runtime.buffer_bytes, runtime.period_bytes);
            state.sides[self.side] = Some(SideState {
                timeline,
                ring,
                sink: ctx.notifier.clone(),
                device: ctx.info.device,
                valid: true,
                running: false,
                paused: false,
                unread: 0,
            });
            stopped
        };

        if let Some((sink, device)) = stopped_capture {
            warn!(
                "{}: playback parameters changed, capture device {} stopped",
                LOOPBACK_UID, device
            );
            sink.params_changed(device);
        }

        if self.timer.is_none() {
            let cable = Arc::clone(&self.cable);
            let side = self.side;
            let timer_ticks = Arc::clone(&ticks);
            self.timer = Some(WakeTimer::spawn(Arc::clone(&ticks), move || {
                cable.wake_side(side, timer_ticks.now_ticks())
            }));
        }
        self.ticks = Some(ticks);
        Ok(())
    }

    fn trigger(&mut self, _ctx: &mut PcmContext, cmd: TriggerCommand) -> PcmResult<()> {
        match cmd {
            TriggerCommand::Start | TriggerCommand::Resume => {
                let now = self.now()?;
                let next = self.with_side(|side| {
                    side.running = true;
                    side.paused = false;
                    side.timeline.start(now);
                    now + side.timeline.wake_in_ticks()
                })?;
                if let Some(timer) = &self.timer {
                    timer.arm_at(next);
                }
                Ok(())
            }
            TriggerCommand::Suspend => self.stop_side(true),
            TriggerCommand::Stop => self.stop_side(false),
            other => Err(PcmError::InvalidCommand(other)),
        }
    }

    fn pointer(&mut self, ctx: &mut PcmContext) -> PcmResult<u64> {
        let now = self.now()?;
        self.cable.pointer(ctx.info.direction, now)
    }

    fn copy_user(&mut self, ctx: &mut PcmContext, pos: u64, data: &[u8]) -> PcmResult<()> {
        ctx.copy_into_ring(pos, data)?;
        if self.side == PLAYBACK {
            let buffer_bytes = ctx.runtime()?.buffer_bytes;
            self.with_side(|side| {
                side.unread = (side.unread + data.len() as u64).min(buffer_bytes);
            })?;
        }
        Ok(())
    }

    fn copy_kernel(&mut self, ctx: &mut PcmContext, pos: u64, data: &[u8]) -> PcmResult<()> {
        self.copy_user(ctx, pos, data)
    }

    fn hw_free(&mut self, _ctx: &mut PcmContext) -> PcmResult<()> {
        // Wakes must be impossible before the ring is released
        if let Some(timer) = &self.timer {
            timer.cancel();
        }
        let mut state = self.cable.lock();
        state.sides[self.side] = None;
        Ok(())
    }

    fn close(&mut self, _ctx: &mut PcmContext) -> PcmResult<()> {
        if let Some(timer) = &self.timer {
            timer.cancel();
        }
        if self.cable.release(self.side) {
            let mut shared = lock_shared(&self.shared);
            shared.cables.remove(&self.key);
            debug!("{}: cable {} torn down", LOOPBACK_UID, self.key);
        }
        Ok(())
    }
}
