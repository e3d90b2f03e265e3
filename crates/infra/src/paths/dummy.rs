//! Dummy Audio Path
//!
//! Pure timing backend: no signal ever flows, but the virtual clock keeps
//! the DMA pointer and period notifications running exactly as a real
//! device would. Useful as a sink for applications and as the minimal
//! example of an Audio Path.

use std::sync::Arc;
use tracing::info;

use virtuoso_core::domain::path::{AudioPath, AudioPathOps, HardwareParams, PathInstance};
use virtuoso_core::domain::pcm::{
    PcmContext, PcmError, PcmResult, PcmState, SampleFormat, SubstreamInfo, TriggerCommand,
};
use virtuoso_core::domain::stream::Stream;

use crate::clock::VirtualClock;

pub const DUMMY_UID: &str = "ap_dummy";

const DUMMY_SAMPLE_RATE: u32 = 48000;
const DUMMY_BLOCKSIZE: u32 = 512;
const DUMMY_PERIODS_MIN: u32 = 1;
const DUMMY_PERIODS_MAX: u32 = 8;

/// Descriptor for the dummy Audio Path
pub fn dummy_path() -> AudioPath {
    AudioPath::new(
        DUMMY_UID,
        "Dummy Audio Path",
        [0, 0, 1],
        HardwareParams {
            formats: vec![SampleFormat::S16Le],
            rate_min: DUMMY_SAMPLE_RATE,
            rate_max: DUMMY_SAMPLE_RATE,
            channels_min: 1,
            channels_max: 8,
            periods_min: DUMMY_PERIODS_MIN,
            periods_max: DUMMY_PERIODS_MAX,
            blocksize: DUMMY_BLOCKSIZE,
        },
        Arc::new(DummyOps),
    )
}

struct DummyOps;

impl AudioPathOps for DummyOps {
    fn configure(&self, streams: &[Stream]) -> virtuoso_core::domain::path::Result<()> {
        for stream in streams.iter().filter(|s| s.map() == DUMMY_UID) {
            info!(
                "{}: stream name:{} device:{} channels:{}",
                DUMMY_UID,
                stream.name(),
                stream.device(),
                stream.channels()
            );
        }
        Ok(())
    }

    fn open(&self, _info: &SubstreamInfo) -> PcmResult<Box<dyn PathInstance>> {
        Ok(Box::new(DummyInstance { clock: None }))
    }
}

struct DummyInstance {
    clock: Option<VirtualClock>,
}

impl DummyInstance {
    fn clock(&self) -> PcmResult<&VirtualClock> {
        self.clock.as_ref().ok_or(PcmError::InvalidState {
            op: "clock access",
            state: PcmState::Open,
        })
    }
}

impl PathInstance for DummyInstance {
    fn prepare(&mut self, ctx: &mut PcmContext) -> PcmResult<()> {
        let runtime = *ctx.runtime()?;
        let clock = self.clock.get_or_insert_with(|| {
            VirtualClock::new(ctx.info.device, ctx.notifier.clone(), Arc::clone(&ctx.ticks))
        });
        clock.prepare(runtime.byte_rate(), runtime.buffer_bytes, runtime.period_bytes);
        Ok(())
    }

    fn trigger(&mut self, _ctx: &mut PcmContext, cmd: TriggerCommand) -> PcmResult<()> {
        match cmd {
            TriggerCommand::Start | TriggerCommand::Resume => {
                self.clock()?.start();
                Ok(())
            }
            TriggerCommand::Stop | TriggerCommand::Suspend => {
                self.clock()?.stop();
                Ok(())
            }
            other => Err(PcmError::InvalidCommand(other)),
        }
    }

    fn pointer(&mut self, _ctx: &mut PcmContext) -> PcmResult<u64> {
        Ok(self.clock()?.pointer())
    }

    fn hw_free(&mut self, _ctx: &mut PcmContext) -> PcmResult<()> {
        // The ring is about to be released; make sure no wake can still
        // touch this instance
        if let Some(clock) = &self.clock {
            clock.stop();
        }
        Ok(())
    }

    fn close(&mut self, _ctx: &mut PcmContext) -> PcmResult<()> {
        if let Some(clock) = &self.clock {
            clock.stop();
        }
        Ok(())
    }
}
