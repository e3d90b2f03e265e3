//! Audio Path descriptors and their registry
//!
//! An Audio Path is a pluggable backend providing signal logic and
//! lifecycle hooks for one or more virtual devices. Paths register a
//! descriptor and get back an opaque handle; the registry owns the
//! descriptor for its registered lifetime and resolves it by uid in O(1)
//! when a device is opened.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use super::pcm::{
    HwRequest, PcmContext, PcmResult, SampleFormat, SubstreamInfo, TimeInfo, TriggerCommand,
};
use super::stream::Stream;

pub type Result<T> = std::result::Result<T, PathError>;

/// Errors from Audio Path registration and configuration
#[derive(Debug, Error)]
pub enum PathError {
    #[error("Audio Path uid already registered: {0}")]
    DuplicateUid(String),

    #[error("Audio Path is not registered")]
    NotRegistered,

    /// A path's configure callback rejected the final stream set
    #[error("Audio Path '{uid}' configure failed: {reason}")]
    Configure { uid: String, reason: String },
}

/// Hardware capability descriptor advertised by an Audio Path
///
/// The dispatch layer narrows this generic view per stream: channel bounds
/// collapse to the stream's configured count, and the byte ceiling for
/// buffer requests derives from `blocksize * periods_max`.
#[derive(Debug, Clone)]
pub struct HardwareParams {
    pub formats: Vec<SampleFormat>,
    pub rate_min: u32,
    pub rate_max: u32,
    pub channels_min: u32,
    pub channels_max: u32,
    pub periods_min: u32,
    pub periods_max: u32,
    /// Transfer block unit in frames
    pub blocksize: u32,
}

impl HardwareParams {
    pub fn supports_format(&self, format: SampleFormat) -> bool {
        self.formats.contains(&format)
    }

    pub fn supports_rate(&self, rate: u32) -> bool {
        (self.rate_min..=self.rate_max).contains(&rate)
    }

    /// Largest instance buffer this path will back for `channels` channels
    pub fn buffer_bytes_max(&self, channels: u32, format: SampleFormat) -> u64 {
        u64::from(self.blocksize)
            * u64::from(self.periods_max)
            * u64::from(format.bytes_per_sample())
            * u64::from(channels)
    }
}

/// Per-path operations: the configure callback plus the instance factory
///
/// `open` yields the per-instance hook table; a path that does not override
/// it gets an instance whose hooks all take the default behavior.
pub trait AudioPathOps: Send + Sync {
    /// Invoked once per topology finalization (at seal, or immediately on
    /// registration if sealing already occurred)
    fn configure(&self, streams: &[Stream]) -> Result<()> {
        let _ = streams;
        Ok(())
    }

    /// Open one device instance bound to this path
    fn open(&self, info: &SubstreamInfo) -> PcmResult<Box<dyn PathInstance>> {
        let _ = info;
        Ok(Box::new(NullPathInstance))
    }
}

/// Optional per-instance lifecycle hooks
///
/// Default implementations stand in for absent hooks: they succeed, and
/// the copy/silence defaults operate on the instance ring so a hook-less
/// path still behaves like a plain memory-backed device.
pub trait PathInstance: Send {
    fn close(&mut self, ctx: &mut PcmContext) -> PcmResult<()> {
        let _ = ctx;
        Ok(())
    }

    fn hw_params(&mut self, ctx: &mut PcmContext, req: &HwRequest) -> PcmResult<()> {
        let _ = (ctx, req);
        Ok(())
    }

    fn hw_free(&mut self, ctx: &mut PcmContext) -> PcmResult<()> {
        let _ = ctx;
        Ok(())
    }

    fn prepare(&mut self, ctx: &mut PcmContext) -> PcmResult<()> {
        let _ = ctx;
        Ok(())
    }

    fn trigger(&mut self, ctx: &mut PcmContext, cmd: TriggerCommand) -> PcmResult<()> {
        let _ = (ctx, cmd);
        Ok(())
    }

    /// Current emulated DMA position as a byte offset into the ring
    fn pointer(&mut self, ctx: &mut PcmContext) -> PcmResult<u64> {
        let _ = ctx;
        Ok(0)
    }

    /// Application sample data arriving at byte offset `pos`
    fn copy_user(&mut self, ctx: &mut PcmContext, pos: u64, data: &[u8]) -> PcmResult<()> {
        ctx.copy_into_ring(pos, data)
    }

    /// In-process sample data arriving at byte offset `pos`
    fn copy_kernel(&mut self, ctx: &mut PcmContext, pos: u64, data: &[u8]) -> PcmResult<()> {
        ctx.copy_into_ring(pos, data)
    }

    fn ack(&mut self, ctx: &mut PcmContext) -> PcmResult<()> {
        let _ = ctx;
        Ok(())
    }

    fn fill_silence(&mut self, ctx: &mut PcmContext, pos: u64, len: u64) -> PcmResult<()> {
        ctx.silence_ring(pos, len)
    }

    fn get_time_info(&mut self, ctx: &mut PcmContext) -> PcmResult<TimeInfo> {
        let system_ticks = ctx.ticks.now_ticks();
        let audio_bytes = self.pointer(ctx)?;
        Ok(TimeInfo {
            system_ticks,
            audio_bytes,
        })
    }
}

/// Instance with every hook left at its default
pub struct NullPathInstance;

impl PathInstance for NullPathInstance {}

/// Registered Audio Path descriptor
pub struct AudioPath {
    uid: String,
    name: String,
    version: [u32; 3],
    hw: HardwareParams,
    ops: Arc<dyn AudioPathOps>,
}

impl AudioPath {
    pub fn new(
        uid: impl Into<String>,
        name: impl Into<String>,
        version: [u32; 3],
        hw: HardwareParams,
        ops: Arc<dyn AudioPathOps>,
    ) -> Self {
        Self {
            uid: uid.into(),
            name: name.into(),
            version,
            hw,
            ops,
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> [u32; 3] {
        self.version
    }

    pub fn hw(&self) -> &HardwareParams {
        &self.hw
    }

    pub fn ops(&self) -> &Arc<dyn AudioPathOps> {
        &self.ops
    }
}

impl fmt::Debug for AudioPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioPath")
            .field("uid", &self.uid)
            .field("name", &self.name)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Opaque registration handle kept by the registrant for deregistration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PathHandle(u64);

/// Per-path registration lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathState {
    Registered,
    /// Configure has run for the final topology; entered once
    Configured,
}

struct Registration {
    path: Arc<AudioPath>,
    handle: PathHandle,
    state: PathState,
}

/// Owner of all registered Audio Paths, keyed by unique uid
#[derive(Default)]
pub struct AudioPathRegistry {
    paths: HashMap<String, Registration>,
    handles: HashMap<PathHandle, String>,
    next_handle: u64,
}

impl AudioPathRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a descriptor, taking ownership for its registered lifetime
    pub fn register(&mut self, path: AudioPath) -> Result<PathHandle> {
        if self.paths.contains_key(path.uid()) {
            return Err(PathError::DuplicateUid(path.uid().to_string()));
        }

        let handle = PathHandle(self.next_handle);
        self.next_handle += 1;

        info!(
            "Registered Audio Path '{}' ({} v{}.{}.{}), blocksize {}",
            path.uid(),
            path.name(),
            path.version()[0],
            path.version()[1],
            path.version()[2],
            path.hw().blocksize,
        );

        let uid = path.uid().to_string();
        self.handles.insert(handle, uid.clone());
        self.paths.insert(
            uid,
            Registration {
                path: Arc::new(path),
                handle,
                state: PathState::Registered,
            },
        );
        Ok(handle)
    }

    /// Remove a registration; the descriptor is dropped once all open
    /// instances release their bindings
    pub fn deregister(&mut self, handle: PathHandle) -> Result<Arc<AudioPath>> {
        let uid = self.handles.remove(&handle).ok_or(PathError::NotRegistered)?;
        let registration = self.paths.remove(&uid).ok_or(PathError::NotRegistered)?;
        info!("Deregistered Audio Path '{}'", uid);
        Ok(registration.path)
    }

    pub fn get(&self, uid: &str) -> Option<Arc<AudioPath>> {
        self.paths.get(uid).map(|r| Arc::clone(&r.path))
    }

    pub fn mark_configured(&mut self, uid: &str) {
        if let Some(registration) = self.paths.get_mut(uid) {
            debug!("Audio Path '{}' configured", uid);
            registration.state = PathState::Configured;
        }
    }

    pub fn is_configured(&self, uid: &str) -> bool {
        self.paths
            .get(uid)
            .map(|r| r.state == PathState::Configured)
            .unwrap_or(false)
    }

    pub fn handle_of(&self, uid: &str) -> Option<PathHandle> {
        self.paths.get(uid).map(|r| r.handle)
    }

    /// Snapshot of all registered descriptors
    pub fn paths(&self) -> Vec<Arc<AudioPath>> {
        self.paths.values().map(|r| Arc::clone(&r.path)).collect()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_hw() -> HardwareParams {
        HardwareParams {
            formats: vec![SampleFormat::S16Le],
            rate_min: 48000,
            rate_max: 48000,
            channels_min: 1,
            channels_max: 8,
            periods_min: 1,
            periods_max: 8,
            blocksize: 512,
        }
    }

    struct NoopOps;
    impl AudioPathOps for NoopOps {}

    fn test_path(uid: &str) -> AudioPath {
        AudioPath::new(uid, "Test Path", [0, 0, 1], test_hw(), Arc::new(NoopOps))
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = AudioPathRegistry::new();
        registry.register(test_path("ap_a")).unwrap();
        registry.register(test_path("ap_b")).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("ap_a").unwrap().uid(), "ap_a");
        assert!(registry.get("ap_missing").is_none());
    }

    #[test]
    fn test_duplicate_uid_rejected() {
        let mut registry = AudioPathRegistry::new();
        registry.register(test_path("ap_a")).unwrap();
        let err = registry.register(test_path("ap_a"));
        assert!(matches!(err, Err(PathError::DuplicateUid(_))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_deregister_by_handle() {
        let mut registry = AudioPathRegistry::new();
        let handle = registry.register(test_path("ap_a")).unwrap();

        registry.deregister(handle).unwrap();
        assert!(registry.get("ap_a").is_none());
        assert!(matches!(
            registry.deregister(handle),
            Err(PathError::NotRegistered)
        ));
    }

    #[test]
    fn test_configured_state_entered_once() {
        let mut registry = AudioPathRegistry::new();
        registry.register(test_path("ap_a")).unwrap();

        assert!(!registry.is_configured("ap_a"));
        registry.mark_configured("ap_a");
        assert!(registry.is_configured("ap_a"));
    }

    #[test]
    fn test_buffer_bytes_max() {
        let hw = test_hw();
        // 512 frames * 8 periods * 2 bytes * 2 channels
        assert_eq!(hw.buffer_bytes_max(2, SampleFormat::S16Le), 512 * 8 * 2 * 2);
    }

    #[test]
    fn test_default_hooks_succeed() {
        let ops = NoopOps;
        let info = SubstreamInfo {
            device: 0,
            name: "playback_test".to_string(),
            direction: crate::domain::stream::Direction::Playback,
            channels: 2,
        };
        let mut instance = ops.open(&info).unwrap();

        let mut ctx = PcmContext {
            info,
            runtime: None,
            buffer: None,
            notifier: crate::domain::pcm::EventSink::sink_to_nowhere(),
            ticks: Arc::new(crate::domain::clock::ManualTicks::new()),
        };

        assert!(instance.prepare(&mut ctx).is_ok());
        assert!(instance.trigger(&mut ctx, TriggerCommand::Start).is_ok());
        assert_eq!(instance.pointer(&mut ctx).unwrap(), 0);
        assert!(instance.ack(&mut ctx).is_ok());
        assert!(instance.close(&mut ctx).is_ok());
    }
}
