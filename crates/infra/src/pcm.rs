//! Device dispatch layer: binding open instances to their Audio Path
//!
//! `PcmHandle` is the application-facing device surface for one open
//! instance. The Audio Path resolved at open time is stored on the handle
//! and every operation goes through that per-instance binding; there is no
//! process-wide "current path", so concurrent instances bound to
//! different paths cannot interfere.

use crossbeam::channel::{unbounded, Receiver};
use tracing::debug;

use virtuoso_core::domain::card::VirtualCard;
use virtuoso_core::domain::path::{AudioPath, HardwareParams, PathInstance};
use virtuoso_core::domain::pcm::{
    EventSink, HwRequest, PcmContext, PcmError, PcmEvent, PcmResult, PcmRuntime, PcmState,
    SampleBuffer, SampleFormat, SubstreamInfo, TimeInfo, TriggerCommand,
};
use virtuoso_core::domain::stream::Direction;
use std::sync::Arc;

/// One open device instance
///
/// Lifecycle operations take `&mut self` and run on the caller's thread;
/// clock wakes run on the bound path's timer thread and only touch the
/// instance's shared ring and clock state, never the handle itself.
pub struct PcmHandle {
    path: Arc<AudioPath>,
    /// Capability view narrowed to this stream: channel bounds collapse to
    /// the configured count
    hw: HardwareParams,
    /// Byte ceiling for buffer requests on this instance
    buffer_limit: u64,
    ctx: PcmContext,
    instance: Box<dyn PathInstance>,
    state: PcmState,
    /// Application-side ring cursor for interleaved transfers
    appl_pos: u64,
    events: Receiver<PcmEvent>,
}

impl PcmHandle {
    /// Open the device at `device`, binding it to its stream's Audio Path
    ///
    /// Fails with a binding error if the device index or the stream's map
    /// cannot be resolved; a failed open leaves no instance state bound.
    pub fn open(card: &VirtualCard, device: u32) -> PcmResult<Self> {
        let (info, path) = card.resolve_open(device)?;

        let mut hw = path.hw().clone();
        hw.channels_min = info.channels;
        hw.channels_max = info.channels;
        let format = hw.formats.first().copied().unwrap_or(SampleFormat::S16Le);
        let buffer_limit = hw.buffer_bytes_max(info.channels, format);

        let (tx, events) = unbounded();
        let notifier = EventSink::new(move |ev| {
            let _ = tx.send(ev);
        });

        let instance = path.ops().open(&info)?;
        debug!(
            "Opened device {} ('{}') on Audio Path '{}'",
            device,
            info.name,
            path.uid()
        );

        Ok(Self {
            path,
            hw,
            buffer_limit,
            ctx: PcmContext {
                info,
                runtime: None,
                buffer: None,
                notifier,
                ticks: card.ticks(),
            },
            instance,
            state: PcmState::Open,
            appl_pos: 0,
            events,
        })
    }

    pub fn info(&self) -> &SubstreamInfo {
        &self.ctx.info
    }

    pub fn state(&self) -> PcmState {
        self.state
    }

    /// The bound Audio Path (captured at open, per-instance)
    pub fn path(&self) -> &Arc<AudioPath> {
        &self.path
    }

    pub fn hw(&self) -> &HardwareParams {
        &self.hw
    }

    pub fn runtime(&self) -> Option<&PcmRuntime> {
        self.ctx.runtime.as_ref()
    }

    /// Receiver for period-elapsed and parameter-change notifications
    pub fn events(&self) -> Receiver<PcmEvent> {
        self.events.clone()
    }

    /// Commit hardware parameters and allocate the instance ring
    ///
    /// The ring is allocated at `period_bytes * periods_max` so any later
    /// period count up to the declared maximum fits without reallocation.
    pub fn hw_params(&mut self, req: HwRequest) -> PcmResult<()> {
        self.ensure_state("hw_params", &[PcmState::Open, PcmState::Setup, PcmState::Prepared])?;

        if !self.hw.supports_format(req.format) {
            return Err(PcmError::UnsupportedFormat(req.format));
        }
        if !self.hw.supports_rate(req.rate) {
            return Err(PcmError::UnsupportedRate {
                rate: req.rate,
                min: self.hw.rate_min,
                max: self.hw.rate_max,
            });
        }
        if req.channels != self.ctx.info.channels {
            return Err(PcmError::ChannelMismatch {
                requested: req.channels,
                configured: self.ctx.info.channels,
            });
        }
        if !(self.hw.periods_min..=self.hw.periods_max).contains(&req.periods) {
            return Err(PcmError::UnsupportedPeriods {
                periods: req.periods,
                min: self.hw.periods_min,
                max: self.hw.periods_max,
            });
        }

        let alloc_bytes = req.period_bytes() * u64::from(self.hw.periods_max);
        if alloc_bytes > self.buffer_limit {
            return Err(PcmError::BufferTooLarge {
                requested: alloc_bytes,
                limit: self.buffer_limit,
            });
        }

        self.ctx.runtime = Some(PcmRuntime::from_request(&req));
        self.ctx.buffer = Some(SampleBuffer::zeroed(alloc_bytes as usize));

        if let Err(err) = self.instance.hw_params(&mut self.ctx, &req) {
            self.ctx.runtime = None;
            self.ctx.buffer = None;
            return Err(err);
        }

        debug!(
            "Device {} params: rate {}, {} ch, period {} frames x {}",
            self.ctx.info.device, req.rate, req.channels, req.period_frames, req.periods
        );
        self.state = PcmState::Setup;
        Ok(())
    }

    /// Release the resources committed by `hw_params`
    pub fn hw_free(&mut self) -> PcmResult<()> {
        self.ensure_state("hw_free", &[PcmState::Setup, PcmState::Prepared])?;
        // The hook runs first so the path can cancel its wakes before the
        // ring goes away
        self.instance.hw_free(&mut self.ctx)?;
        self.ctx.runtime = None;
        self.ctx.buffer = None;
        self.state = PcmState::Open;
        Ok(())
    }

    pub fn prepare(&mut self) -> PcmResult<()> {
        self.ensure_state("prepare", &[PcmState::Setup, PcmState::Prepared])?;
        self.appl_pos = 0;
        self.instance.prepare(&mut self.ctx)?;
        self.state = PcmState::Prepared;
        Ok(())
    }

    /// Start/stop/suspend/resume; pause commands are rejected here and
    /// never reach the Audio Path
    pub fn trigger(&mut self, cmd: TriggerCommand) -> PcmResult<()> {
        if !cmd.is_dispatchable() {
            return Err(PcmError::InvalidCommand(cmd));
        }

        let next = match cmd {
            TriggerCommand::Start => {
                self.ensure_state("trigger(start)", &[PcmState::Prepared])?;
                PcmState::Running
            }
            TriggerCommand::Resume => {
                self.ensure_state("trigger(resume)", &[PcmState::Suspended])?;
                PcmState::Running
            }
            TriggerCommand::Stop => {
                self.ensure_state("trigger(stop)", &[PcmState::Running, PcmState::Suspended])?;
                PcmState::Setup
            }
            TriggerCommand::Suspend => {
                self.ensure_state("trigger(suspend)", &[PcmState::Running])?;
                PcmState::Suspended
            }
            TriggerCommand::PausePush | TriggerCommand::PauseRelease => {
                return Err(PcmError::InvalidCommand(cmd));
            }
        };

        self.instance.trigger(&mut self.ctx, cmd)?;
        self.state = next;
        Ok(())
    }

    /// Current emulated DMA pointer as a byte offset into the ring
    pub fn pointer(&mut self) -> PcmResult<u64> {
        self.ensure_state(
            "pointer",
            &[PcmState::Prepared, PcmState::Running, PcmState::Suspended],
        )?;
        self.instance.pointer(&mut self.ctx)
    }

    /// Pointer expressed in frames
    pub fn pointer_frames(&mut self) -> PcmResult<u64> {
        let frame_bytes = self.ctx.runtime()?.frame_bytes();
        Ok(self.pointer()? / frame_bytes)
    }

    /// Write interleaved sample data at the application cursor
    ///
    /// The transfer is split at the ring boundary and forwarded chunk by
    /// chunk to the path's copy hook.
    pub fn write_interleaved(&mut self, data: &[u8]) -> PcmResult<usize> {
        if self.ctx.info.direction != Direction::Playback {
            return Err(PcmError::WrongDirection {
                op: "write_interleaved",
                direction: self.ctx.info.direction,
            });
        }
        self.ensure_transfer_state("write_interleaved")?;

        let buffer_bytes = self.ctx.runtime()?.buffer_bytes;
        let mut written = 0;
        while written < data.len() {
            let pos = self.appl_pos;
            let contig = (buffer_bytes - pos).min((data.len() - written) as u64) as usize;
            self.instance
                .copy_user(&mut self.ctx, pos, &data[written..written + contig])?;
            written += contig;
            self.appl_pos = (pos + contig as u64) % buffer_bytes;
        }
        Ok(written)
    }

    /// Read interleaved sample data at the application cursor
    pub fn read_interleaved(&mut self, out: &mut [u8]) -> PcmResult<usize> {
        if self.ctx.info.direction != Direction::Capture {
            return Err(PcmError::WrongDirection {
                op: "read_interleaved",
                direction: self.ctx.info.direction,
            });
        }
        self.ensure_transfer_state("read_interleaved")?;

        let buffer_bytes = self.ctx.runtime()?.buffer_bytes;
        let ring = self.ctx.ring()?.clone();
        let mut read = 0;
        while read < out.len() {
            let pos = self.appl_pos;
            let contig = (buffer_bytes - pos).min((out.len() - read) as u64) as usize;
            ring.read_at(pos as usize, &mut out[read..read + contig]);
            read += contig;
            self.appl_pos = (pos + contig as u64) % buffer_bytes;
        }
        Ok(read)
    }

    /// Fill a region of the ring with silence through the path's hook
    pub fn fill_silence(&mut self, pos: u64, len: u64) -> PcmResult<()> {
        self.ensure_transfer_state("fill_silence")?;
        self.instance.fill_silence(&mut self.ctx, pos, len)
    }

    pub fn ack(&mut self) -> PcmResult<()> {
        self.instance.ack(&mut self.ctx)
    }

    pub fn get_time_info(&mut self) -> PcmResult<TimeInfo> {
        self.ensure_state(
            "get_time_info",
            &[PcmState::Prepared, PcmState::Running, PcmState::Suspended],
        )?;
        self.instance.get_time_info(&mut self.ctx)
    }

    /// Close the instance; further operations fail with a state error
    pub fn close(&mut self) -> PcmResult<()> {
        if self.state == PcmState::Closed {
            return Ok(());
        }
        self.instance.close(&mut self.ctx)?;
        self.ctx.runtime = None;
        self.ctx.buffer = None;
        self.state = PcmState::Closed;
        debug!("Closed device {}", self.ctx.info.device);
        Ok(())
    }

    fn ensure_state(&self, op: &'static str, allowed: &[PcmState]) -> PcmResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(PcmError::InvalidState {
                op,
                state: self.state,
            })
        }
    }

    fn ensure_transfer_state(&self, op: &'static str) -> PcmResult<()> {
        self.ensure_state(
            op,
            &[
                PcmState::Setup,
                PcmState::Prepared,
                PcmState::Running,
                PcmState::Suspended,
            ],
        )
    }
}

impl Drop for PcmHandle {
    fn drop(&mut self) {
        if self.state != PcmState::Closed {
            let _ = self.close();
        }
    }
}
