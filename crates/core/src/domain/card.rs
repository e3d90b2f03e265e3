//! The virtual card: registries, registration channel and seal sequence
//!
//! `VirtualCard` owns the stream and Audio Path registries behind one
//! lock. Configure callbacks and the discovery publisher run strictly
//! after that lock is released, so a path is free to call back into the
//! card from its own hooks.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{error, info, warn};

use super::clock::{SystemTicks, TickSource};
use super::path::{AudioPath, AudioPathRegistry, PathError, PathHandle};
use super::pcm::{PcmError, PcmResult, SubstreamInfo};
use super::stream::{Direction, Stream, StreamError, StreamRegistry};

pub type Result<T> = std::result::Result<T, CardError>;

/// Core version advertised to Audio Paths
pub const CARD_VERSION: [u32; 3] = [0, 0, 1];

/// Errors from card-level orchestration
#[derive(Debug, Error)]
pub enum CardError {
    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Path(#[from] PathError),

    /// A stream reached seal with no channel count configured
    #[error("Stream '{0}' has no channel count configured")]
    MissingChannels(String),

    #[error("Card publish failed: {0}")]
    Publish(String),
}

/// Makes a sealed card visible to applications (external collaborator)
pub trait CardPublisher: Send + Sync {
    fn publish(&self, card_name: &str, streams: &[Stream]) -> std::result::Result<(), String>;
}

/// Publisher that only announces the card in the log
#[derive(Debug, Default)]
pub struct LogPublisher;

impl CardPublisher for LogPublisher {
    fn publish(&self, card_name: &str, streams: &[Stream]) -> std::result::Result<(), String> {
        info!(
            "Card '{}' published with {} device(s)",
            card_name,
            streams.len()
        );
        Ok(())
    }
}

struct CardState {
    streams: StreamRegistry,
    paths: AudioPathRegistry,
}

/// A configurable virtual sound card
pub struct VirtualCard {
    name: String,
    state: Mutex<CardState>,
    publisher: Arc<dyn CardPublisher>,
    ticks: Arc<dyn TickSource>,
}

impl VirtualCard {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_publisher(name, Arc::new(LogPublisher))
    }

    pub fn with_publisher(name: impl Into<String>, publisher: Arc<dyn CardPublisher>) -> Self {
        let name = name.into();
        info!(
            "Virtual sound card '{}' (core v{}.{}.{})",
            name, CARD_VERSION[0], CARD_VERSION[1], CARD_VERSION[2]
        );
        Self {
            name,
            state: Mutex::new(CardState {
                streams: StreamRegistry::new(),
                paths: AudioPathRegistry::new(),
            }),
            publisher,
            ticks: Arc::new(SystemTicks::new()),
        }
    }

    /// Replace the tick source driving this card's clocks (tests)
    pub fn with_ticks(mut self, ticks: Arc<dyn TickSource>) -> Self {
        self.ticks = ticks;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ticks(&self) -> Arc<dyn TickSource> {
        Arc::clone(&self.ticks)
    }

    /// Register an Audio Path (the plugin-facing registration channel)
    ///
    /// A path arriving after the seal is configured immediately with the
    /// final stream set; if that configure fails the registration is
    /// rolled back.
    pub fn register_path(&self, path: AudioPath) -> Result<PathHandle> {
        let uid = path.uid().to_string();
        let (handle, late_configure) = {
            let mut state = self.lock();
            let handle = state.paths.register(path)?;
            let late = if state.streams.is_sealed() {
                Some((
                    state.paths.get(&uid).ok_or(PathError::NotRegistered)?,
                    state.streams.streams().to_vec(),
                ))
            } else {
                None
            };
            (handle, late)
        };

        if let Some((path, streams)) = late_configure {
            if let Err(err) = path.ops().configure(&streams) {
                warn!("Late configure of '{}' failed: {}", uid, err);
                let mut state = self.lock();
                let _ = state.paths.deregister(handle);
                return Err(PathError::Configure {
                    uid,
                    reason: err.to_string(),
                }
                .into());
            }
            self.lock().paths.mark_configured(&uid);
        }

        Ok(handle)
    }

    pub fn deregister_path(&self, handle: PathHandle) -> Result<()> {
        self.lock().paths.deregister(handle)?;
        Ok(())
    }

    pub fn path(&self, uid: &str) -> Option<Arc<AudioPath>> {
        self.lock().paths.get(uid)
    }

    pub fn create_stream(&self, name: &str, direction: Direction) -> Result<u32> {
        let mut state = self.lock();
        let stream = state.streams.create(name, direction)?;
        Ok(stream.device())
    }

    pub fn set_stream_map(&self, name: &str, map: &str) -> Result<()> {
        self.lock().streams.set_map(name, map)?;
        Ok(())
    }

    pub fn set_stream_channels(&self, name: &str, channels: u32) -> Result<()> {
        self.lock().streams.set_channels(name, channels)?;
        Ok(())
    }

    pub fn stream_by_name(&self, name: &str) -> Option<Stream> {
        self.lock().streams.find_by_name(name).cloned()
    }

    pub fn find_by_device(&self, device: u32) -> Option<Stream> {
        self.lock().streams.find_by_device(device).cloned()
    }

    pub fn stream_count(&self, direction: Direction) -> usize {
        self.lock().streams.count(direction)
    }

    pub fn streams(&self) -> Vec<Stream> {
        self.lock().streams.streams().to_vec()
    }

    pub fn is_sealed(&self) -> bool {
        self.lock().streams.is_sealed()
    }

    /// Seal the topology: back every stream with a device, configure every
    /// registered Audio Path, then publish the card for discovery
    ///
    /// All-or-nothing: any failure rolls the registry back to unsealed.
    pub fn seal(&self) -> Result<()> {
        let (snapshot, paths) = {
            let mut state = self.lock();
            for stream in state.streams.streams() {
                if stream.channels() == 0 {
                    return Err(CardError::MissingChannels(stream.name().to_string()));
                }
            }
            let snapshot = state.streams.seal()?;
            (snapshot, state.paths.paths())
        };

        for path in &paths {
            if let Err(err) = path.ops().configure(&snapshot) {
                error!("Configure of '{}' failed, unsealing: {}", path.uid(), err);
                self.lock().streams.rollback_seal();
                return Err(PathError::Configure {
                    uid: path.uid().to_string(),
                    reason: err.to_string(),
                }
                .into());
            }
        }

        if let Err(reason) = self.publisher.publish(&self.name, &snapshot) {
            error!("Publish of card '{}' failed, unsealing: {}", self.name, reason);
            self.lock().streams.rollback_seal();
            return Err(CardError::Publish(reason));
        }

        let mut state = self.lock();
        for path in &paths {
            state.paths.mark_configured(path.uid());
        }
        Ok(())
    }

    /// Resolve an open request to the stream identity and its bound path
    ///
    /// Fails without leaving any state bound when the device index or the
    /// stream's map cannot be resolved.
    pub fn resolve_open(&self, device: u32) -> PcmResult<(SubstreamInfo, Arc<AudioPath>)> {
        let state = self.lock();
        if !state.streams.is_sealed() {
            return Err(PcmError::NotSealed);
        }
        let stream = state
            .streams
            .find_by_device(device)
            .ok_or(PcmError::NoSuchDevice(device))?;
        let path = state
            .paths
            .get(stream.map())
            .ok_or_else(|| PcmError::UnresolvedPath {
                stream: stream.name().to_string(),
                map: stream.map().to_string(),
            })?;

        let info = SubstreamInfo {
            device,
            name: stream.name().to_string(),
            direction: stream.direction(),
            channels: stream.channels(),
        };
        Ok((info, path))
    }

    fn lock(&self) -> MutexGuard<'_, CardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::path::AudioPathOps;
    use crate::domain::pcm::SampleFormat;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_hw() -> crate::domain::path::HardwareParams {
        crate::domain::path::HardwareParams {
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

    struct CountingOps {
        configured: Arc<AtomicUsize>,
        fail: bool,
    }

    impl AudioPathOps for CountingOps {
        fn configure(&self, _streams: &[Stream]) -> crate::domain::path::Result<()> {
            if self.fail {
                return Err(PathError::Configure {
                    uid: "ap_failing".to_string(),
                    reason: "rejected".to_string(),
                });
            }
            self.configured.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counting_path(uid: &str, configured: Arc<AtomicUsize>, fail: bool) -> AudioPath {
        AudioPath::new(
            uid,
            "Counting Path",
            [0, 0, 1],
            test_hw(),
            Arc::new(CountingOps { configured, fail }),
        )
    }

    fn two_channel_stream(card: &VirtualCard, name: &str, direction: Direction, map: &str) {
        card.create_stream(name, direction).unwrap();
        card.set_stream_map(name, map).unwrap();
        card.set_stream_channels(name, 2).unwrap();
    }

    #[test]
    fn test_seal_configures_registered_paths() {
        let card = VirtualCard::new("testcard");
        let configured = Arc::new(AtomicUsize::new(0));
        card.register_path(counting_path("ap_a", Arc::clone(&configured), false))
            .unwrap();

        two_channel_stream(&card, "playback_media", Direction::Playback, "ap_a");
        card.seal().unwrap();

        assert!(card.is_sealed());
        assert_eq!(configured.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_registration_is_configured_immediately() {
        let card = VirtualCard::new("testcard");
        two_channel_stream(&card, "playback_media", Direction::Playback, "ap_late");
        card.seal().unwrap();

        let configured = Arc::new(AtomicUsize::new(0));
        card.register_path(counting_path("ap_late", Arc::clone(&configured), false))
            .unwrap();
        assert_eq!(configured.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_configure_rolls_back_seal() {
        let card = VirtualCard::new("testcard");
        let configured = Arc::new(AtomicUsize::new(0));
        card.register_path(counting_path("ap_failing", configured, true))
            .unwrap();

        two_channel_stream(&card, "playback_media", Direction::Playback, "ap_failing");
        assert!(card.seal().is_err());
        assert!(!card.is_sealed());

        // The registry reopened: stream mutation works again
        card.set_stream_channels("playback_media", 4).unwrap();
    }

    #[test]
    fn test_failed_late_configure_rolls_back_registration() {
        let card = VirtualCard::new("testcard");
        two_channel_stream(&card, "playback_media", Direction::Playback, "ap_failing");
        card.seal().unwrap();

        let configured = Arc::new(AtomicUsize::new(0));
        let err = card.register_path(counting_path("ap_failing", configured, true));
        assert!(err.is_err());
        assert!(card.path("ap_failing").is_none());
    }

    #[test]
    fn test_seal_requires_channel_counts() {
        let card = VirtualCard::new("testcard");
        card.create_stream("playback_media", Direction::Playback)
            .unwrap();
        card.set_stream_map("playback_media", "ap_a").unwrap();

        assert!(matches!(card.seal(), Err(CardError::MissingChannels(_))));
        assert!(!card.is_sealed());
    }

    #[test]
    fn test_resolve_open_binding_errors() {
        let card = VirtualCard::new("testcard");
        two_channel_stream(&card, "playback_media", Direction::Playback, "ap_missing");

        // Open before seal
        assert!(matches!(card.resolve_open(0), Err(PcmError::NotSealed)));

        card.seal().unwrap();

        // Unknown device index
        assert!(matches!(card.resolve_open(7), Err(PcmError::NoSuchDevice(7))));

        // Map names an unregistered path
        assert!(matches!(
            card.resolve_open(0),
            Err(PcmError::UnresolvedPath { .. })
        ));
    }

    #[test]
    fn test_second_seal_fails_and_preserves_state() {
        let card = VirtualCard::new("testcard");
        let configured = Arc::new(AtomicUsize::new(0));
        card.register_path(counting_path("ap_a", Arc::clone(&configured), false))
            .unwrap();
        two_channel_stream(&card, "playback_media", Direction::Playback, "ap_a");
        two_channel_stream(&card, "capture_mic", Direction::Capture, "ap_a");

        card.seal().unwrap();
        let err = card.seal();
        assert!(matches!(
            err,
            Err(CardError::Stream(StreamError::AlreadySealed))
        ));

        // Devices and bindings from the first seal stay queryable
        assert_eq!(card.find_by_device(0).unwrap().name(), "playback_media");
        assert_eq!(card.find_by_device(1).unwrap().name(), "capture_mic");
        assert_eq!(card.find_by_device(0).unwrap().channels(), 2);
        assert_eq!(configured.load(Ordering::SeqCst), 1);
        assert!(card.resolve_open(0).is_ok());
    }
}
