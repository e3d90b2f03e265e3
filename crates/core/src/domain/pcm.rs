//! PCM data model shared by the dispatch layer and Audio Paths
//!
//! The wire format is fixed: 16-bit little-endian interleaved samples.
//! Everything here is denominated in bytes so that the pointer and copy
//! arithmetic stays exact; frame helpers exist for the call sites that
//! think in frames.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::trace;

use super::stream::Direction;

pub type PcmResult<T> = std::result::Result<T, PcmError>;

/// Runtime PCM errors surfaced synchronously to the calling operation
#[derive(Debug, Error)]
pub enum PcmError {
    /// No stream exists for the requested device index
    #[error("No stream for device index {0}")]
    NoSuchDevice(u32),

    /// A stream's map names an Audio Path that is not registered
    #[error("Stream '{stream}' maps to unknown Audio Path '{map}'")]
    UnresolvedPath { stream: String, map: String },

    /// Device opened before the card topology was sealed
    #[error("Card is not sealed")]
    NotSealed,

    /// Requested channel count differs from the stream's configured count
    #[error("Requested {requested} channel(s), stream is configured for {configured}")]
    ChannelMismatch { requested: u32, configured: u32 },

    /// The two sides of a loopback cable disagree on parameters
    #[error("Cable parameter conflict: {0}")]
    CableConflict(String),

    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(SampleFormat),

    #[error("Rate {rate} outside supported range {min}..={max}")]
    UnsupportedRate { rate: u32, min: u32, max: u32 },

    #[error("Period count {periods} outside supported range {min}..={max}")]
    UnsupportedPeriods { periods: u32, min: u32, max: u32 },

    /// Buffer request exceeding the instance ceiling; retryable with a
    /// smaller request
    #[error("Buffer request of {requested} bytes exceeds limit of {limit} bytes")]
    BufferTooLarge { requested: u64, limit: u64 },

    /// Operation invoked out of lifecycle order
    #[error("Operation '{op}' invalid in state {state:?}")]
    InvalidState { op: &'static str, state: PcmState },

    /// Sample transfer in the wrong direction for this stream
    #[error("Operation '{op}' not valid for a {direction:?} stream")]
    WrongDirection {
        op: &'static str,
        direction: Direction,
    },

    /// Trigger command outside the supported set
    #[error("Invalid trigger command: {0:?}")]
    InvalidCommand(TriggerCommand),
}

/// Supported sample formats; the baseline fixes exactly one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// Signed 16-bit little-endian, interleaved
    S16Le,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> u32 {
        match self {
            SampleFormat::S16Le => 2,
        }
    }

    /// The byte value silence is filled with
    pub fn silence_byte(&self) -> u8 {
        match self {
            SampleFormat::S16Le => 0,
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleFormat::S16Le => write!(f, "S16_LE"),
        }
    }
}

/// PCM trigger commands
///
/// The dispatch layer forwards start/stop/suspend/resume; the pause pair
/// exists on the device surface but is rejected before reaching any
/// Audio Path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerCommand {
    Start,
    Stop,
    Suspend,
    Resume,
    PausePush,
    PauseRelease,
}

impl TriggerCommand {
    /// Commands accepted by the dispatch layer
    pub fn is_dispatchable(&self) -> bool {
        matches!(
            self,
            TriggerCommand::Start
                | TriggerCommand::Stop
                | TriggerCommand::Suspend
                | TriggerCommand::Resume
        )
    }
}

/// Lifecycle state of one open device instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmState {
    /// Opened, no hardware parameters committed
    Open,
    /// Parameters committed, buffer allocated
    Setup,
    Prepared,
    Running,
    Suspended,
    Closed,
}

/// Identity of one open device instance, fixed at open time
#[derive(Debug, Clone)]
pub struct SubstreamInfo {
    pub device: u32,
    pub name: String,
    pub direction: Direction,
    /// Channel count configured on the stream; `hw_params` requests must
    /// match it exactly
    pub channels: u32,
}

/// Hardware parameter request from the application
#[derive(Debug, Clone, Copy)]
pub struct HwRequest {
    pub rate: u32,
    pub channels: u32,
    pub format: SampleFormat,
    pub period_frames: u32,
    pub periods: u32,
}

impl HwRequest {
    pub fn frame_bytes(&self) -> u64 {
        u64::from(self.channels) * u64::from(self.format.bytes_per_sample())
    }

    pub fn period_bytes(&self) -> u64 {
        u64::from(self.period_frames) * self.frame_bytes()
    }
}

/// Negotiated runtime parameters of one open device instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmRuntime {
    pub rate: u32,
    pub channels: u32,
    pub format: SampleFormat,
    pub period_bytes: u64,
    /// Ring size visible to the application: `period_bytes * periods`
    pub buffer_bytes: u64,
}

impl PcmRuntime {
    pub fn from_request(req: &HwRequest) -> Self {
        let period_bytes = req.period_bytes();
        Self {
            rate: req.rate,
            channels: req.channels,
            format: req.format,
            period_bytes,
            buffer_bytes: period_bytes * u64::from(req.periods),
        }
    }

    pub fn frame_bytes(&self) -> u64 {
        u64::from(self.channels) * u64::from(self.format.bytes_per_sample())
    }

    /// Bytes produced or consumed per second
    pub fn byte_rate(&self) -> u64 {
        u64::from(self.rate) * self.frame_bytes()
    }
}

/// Timestamp pair reported by `get_time_info`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeInfo {
    /// Wall-clock ticks at query time
    pub system_ticks: u64,
    /// Byte position of the emulated DMA pointer
    pub audio_bytes: u64,
}

/// Notifications flowing out of a device instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmEvent {
    /// One or more periods' worth of data is ready; counts within one wake
    /// are coalesced
    PeriodElapsed { device: u32, periods: u32 },
    /// The peer side of a cable renegotiated parameters underneath us
    ParamsChanged { device: u32 },
}

/// Consumer-facing notification sink for one device instance
///
/// Audio Paths and the clock engine call this; the dispatch layer decides
/// where the events go. Always invoked after the caller has released its
/// own locks.
#[derive(Clone)]
pub struct EventSink(Arc<dyn Fn(PcmEvent) + Send + Sync>);

impl EventSink {
    pub fn new(f: impl Fn(PcmEvent) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Sink that drops every event
    pub fn sink_to_nowhere() -> Self {
        Self(Arc::new(|_| {}))
    }

    /// Signal that `periods` period boundaries have elapsed on `device`
    pub fn period_elapsed(&self, device: u32, periods: u32) {
        trace!("Period elapsed on device {}: {} period(s)", device, periods);
        (self.0)(PcmEvent::PeriodElapsed { device, periods });
    }

    pub fn params_changed(&self, device: u32) {
        trace!("Parameters changed on device {}", device);
        (self.0)(PcmEvent::ParamsChanged { device });
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventSink")
    }
}

/// Shared, lock-guarded sample ring standing in for the DMA area
///
/// Cloning is shallow; the loopback engine holds clones of both sides'
/// rings and copies between them under the cable lock.
#[derive(Clone)]
pub struct SampleBuffer(Arc<Mutex<Vec<u8>>>);

impl SampleBuffer {
    pub fn zeroed(len: usize) -> Self {
        Self(Arc::new(Mutex::new(vec![0u8; len])))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` with exclusive access to the raw bytes
    pub fn with<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.lock())
    }

    /// Wrap-aware write of `src` starting at byte offset `pos`
    pub fn write_at(&self, pos: usize, src: &[u8]) {
        let mut ring = self.lock();
        ring_write(&mut ring, pos, src);
    }

    /// Wrap-aware read into `dst` starting at byte offset `pos`
    pub fn read_at(&self, pos: usize, dst: &mut [u8]) {
        let ring = self.lock();
        ring_read(&ring, pos, dst);
    }

    /// Wrap-aware silence fill of `len` bytes starting at `pos`
    pub fn silence_at(&self, pos: usize, len: usize, format: SampleFormat) {
        let mut ring = self.lock();
        ring_fill(&mut ring, pos, len, format.silence_byte());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for SampleBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SampleBuffer({} bytes)", self.len())
    }
}

/// Per-instance context handed to every Audio Path hook
///
/// Holds the identity fixed at open time plus the negotiated runtime and
/// ring, both absent until `hw_params` commits them. The bound Audio Path
/// itself is stored on the instance by the dispatch layer, never in
/// shared state.
#[derive(Debug)]
pub struct PcmContext {
    pub info: SubstreamInfo,
    pub runtime: Option<PcmRuntime>,
    pub buffer: Option<SampleBuffer>,
    pub notifier: EventSink,
    pub ticks: Arc<dyn super::clock::TickSource>,
}

impl PcmContext {
    /// The committed runtime, or a state error when `hw_params` has not run
    pub fn runtime(&self) -> PcmResult<&PcmRuntime> {
        self.runtime.as_ref().ok_or(PcmError::InvalidState {
            op: "runtime access",
            state: PcmState::Open,
        })
    }

    pub fn ring(&self) -> PcmResult<&SampleBuffer> {
        self.buffer.as_ref().ok_or(PcmError::InvalidState {
            op: "ring access",
            state: PcmState::Open,
        })
    }

    /// Default copy hook body: wrap-aware memcpy into the instance ring
    ///
    /// Positions wrap at the runtime buffer size, not at the (larger)
    /// allocation the ring was reserved with.
    pub fn copy_into_ring(&self, pos: u64, data: &[u8]) -> PcmResult<()> {
        let window = self.runtime()?.buffer_bytes as usize;
        self.ring()?
            .with(|ring| ring_write(&mut ring[..window], pos as usize, data));
        Ok(())
    }

    /// Default fill_silence hook body
    pub fn silence_ring(&self, pos: u64, len: u64) -> PcmResult<()> {
        let runtime = self.runtime()?;
        let window = runtime.buffer_bytes as usize;
        let silence = runtime.format.silence_byte();
        self.ring()?
            .with(|ring| ring_fill(&mut ring[..window], pos as usize, len as usize, silence));
        Ok(())
    }
}

/// Wrap-aware write into a ring, chunked at the ring boundary
pub fn ring_write(ring: &mut [u8], pos: usize, src: &[u8]) {
    if ring.is_empty() {
        return;
    }
    // A span longer than the ring would overwrite itself; only the tail
    // survives, so clamp to it.
    let (mut pos, src) = clamp_span(ring.len(), pos, src.len(), |skip| &src[skip..]);
    let mut written = 0;
    while written < src.len() {
        let contig = (ring.len() - pos).min(src.len() - written);
        ring[pos..pos + contig].copy_from_slice(&src[written..written + contig]);
        written += contig;
        pos = (pos + contig) % ring.len();
    }
}

/// Wrap-aware read from a ring into `dst`
pub fn ring_read(ring: &[u8], pos: usize, dst: &mut [u8]) {
    if ring.is_empty() {
        return;
    }
    let mut pos = pos % ring.len();
    let mut read = 0;
    while read < dst.len() {
        let contig = (ring.len() - pos).min(dst.len() - read);
        dst[read..read + contig].copy_from_slice(&ring[pos..pos + contig]);
        read += contig;
        pos = (pos + contig) % ring.len();
    }
}

/// Wrap-aware constant fill
pub fn ring_fill(ring: &mut [u8], pos: usize, len: usize, value: u8) {
    if ring.is_empty() {
        return;
    }
    let (mut pos, len) = clamp_span(ring.len(), pos, len, |skip| len - skip);
    let mut filled = 0;
    while filled < len {
        let contig = (ring.len() - pos).min(len - filled);
        ring[pos..pos + contig].fill(value);
        filled += contig;
        pos = (pos + contig) % ring.len();
    }
}

/// Copy `len` bytes between two rings, honouring both rings' boundaries
///
/// Reads from `src` starting at `src_pos`, writes into `dst` starting at
/// `dst_pos`. Each step copies the largest span contiguous in both rings.
pub fn copy_between_rings(
    src: &[u8],
    src_pos: usize,
    dst: &mut [u8],
    dst_pos: usize,
    len: usize,
) {
    if src.is_empty() || dst.is_empty() {
        return;
    }
    let mut src_pos = src_pos % src.len();
    let mut dst_pos = dst_pos % dst.len();
    let mut copied = 0;
    let len = len.min(dst.len());
    while copied < len {
        let contig = (src.len() - src_pos)
            .min(dst.len() - dst_pos)
            .min(len - copied);
        dst[dst_pos..dst_pos + contig].copy_from_slice(&src[src_pos..src_pos + contig]);
        copied += contig;
        src_pos = (src_pos + contig) % src.len();
        dst_pos = (dst_pos + contig) % dst.len();
    }
}

/// Clamp an over-long span to the part of it that survives in the ring,
/// returning the effective start position and the mapped remainder.
fn clamp_span<T>(
    ring_len: usize,
    pos: usize,
    span: usize,
    map: impl FnOnce(usize) -> T,
) -> (usize, T) {
    let pos = pos % ring_len;
    if span > ring_len {
        let skip = span - ring_len;
        ((pos + skip) % ring_len, map(skip))
    } else {
        (pos, map(0))
    }
}
