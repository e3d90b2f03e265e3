//! Stream definitions and the sealable stream registry
//!
//! A stream is a named, directional PCM device definition bound to exactly
//! one Audio Path via its `map` attribute. Streams are created during the
//! configuration phase and frozen by the one-way seal transition, at which
//! point each stream gets its backing device and the card becomes
//! discoverable.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub type Result<T> = std::result::Result<T, StreamError>;

/// Errors from stream creation and the seal transition
#[derive(Debug, Error)]
pub enum StreamError {
    /// A stream with this name already exists
    #[error("Duplicate stream name: {0}")]
    DuplicateName(String),

    /// Mutation attempted after the topology was sealed
    #[error("Stream topology is sealed")]
    Sealed,

    /// Seal invoked a second time
    #[error("Streams are already sealed")]
    AlreadySealed,

    /// No stream with the given name
    #[error("Unknown stream: {0}")]
    UnknownStream(String),
}

/// PCM data direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Playback,
    Capture,
}

impl Direction {
    /// Stream name prefix used by the configuration channel
    pub fn prefix(&self) -> &'static str {
        match self {
            Direction::Playback => "playback_",
            Direction::Capture => "capture_",
        }
    }
}

/// A named, directional virtual PCM device definition
///
/// Immutable after seal, except for the backing-device marker which is
/// attached by the seal transition itself.
#[derive(Debug, Clone)]
pub struct Stream {
    name: String,
    direction: Direction,
    channels: u32,
    map: String,
    device: u32,
    backed: bool,
}

impl Stream {
    fn new(name: String, direction: Direction, device: u32) -> Self {
        Self {
            name,
            direction,
            channels: 0,
            map: String::new(),
            device,
            backed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    /// Uid of the Audio Path this stream is mapped to
    pub fn map(&self) -> &str {
        &self.map
    }

    /// PCM device index, assigned monotonically at creation
    pub fn device(&self) -> u32 {
        self.device
    }

    /// Whether the backing device has been instantiated (true after seal)
    pub fn is_backed(&self) -> bool {
        self.backed
    }
}

/// Owner of all stream definitions and the one-way seal state machine
#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: Vec<Stream>,
    sealed: bool,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a stream with the next device index
    ///
    /// Fails once the topology is sealed, or when the name is taken; a
    /// failed create leaves the registry untouched.
    pub fn create(&mut self, name: &str, direction: Direction) -> Result<&Stream> {
        if self.sealed {
            return Err(StreamError::Sealed);
        }
        if self.streams.iter().any(|s| s.name == name) {
            return Err(StreamError::DuplicateName(name.to_string()));
        }

        let device = self.streams.len() as u32;
        let stream = Stream::new(name.to_string(), direction, device);
        info!(
            "Created stream '{}' ({:?}), device index {}",
            name, direction, device
        );
        self.streams.push(stream);
        Ok(&self.streams[device as usize])
    }

    /// Set the Audio Path mapping for a stream (pre-seal only)
    pub fn set_map(&mut self, name: &str, map: &str) -> Result<()> {
        if self.sealed {
            return Err(StreamError::Sealed);
        }
        let stream = self.get_mut(name)?;
        debug!("Stream '{}' mapped to '{}'", name, map);
        stream.map = map.to_string();
        Ok(())
    }

    /// Set the channel count for a stream (pre-seal only)
    pub fn set_channels(&mut self, name: &str, channels: u32) -> Result<()> {
        if self.sealed {
            return Err(StreamError::Sealed);
        }
        let stream = self.get_mut(name)?;
        debug!("Stream '{}' channels set to {}", name, channels);
        stream.channels = channels;
        Ok(())
    }

    /// One-way seal transition
    ///
    /// Attaches the backing device to every stream and returns a snapshot
    /// of the final stream set for the configure callbacks. A second call
    /// fails without mutating anything. The caller is responsible for
    /// invoking [`rollback_seal`](Self::rollback_seal) if a later stage of
    /// the seal sequence fails.
    pub fn seal(&mut self) -> Result<Vec<Stream>> {
        if self.sealed {
            return Err(StreamError::AlreadySealed);
        }
        for stream in &mut self.streams {
            stream.backed = true;
        }
        self.sealed = true;
        info!("Sealed stream topology with {} stream(s)", self.streams.len());
        Ok(self.streams.clone())
    }

    /// Undo a seal whose finalization failed partway
    ///
    /// Detaches backing devices and reopens the registry for mutation.
    pub fn rollback_seal(&mut self) {
        for stream in &mut self.streams {
            stream.backed = false;
        }
        self.sealed = false;
        debug!("Rolled back seal");
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Look up a stream by its PCM device index
    pub fn find_by_device(&self, device: u32) -> Option<&Stream> {
        self.streams.get(device as usize)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Stream> {
        self.streams.iter().find(|s| s.name == name)
    }

    /// Number of streams in the given direction
    pub fn count(&self, direction: Direction) -> usize {
        self.streams
            .iter()
            .filter(|s| s.direction == direction)
            .count()
    }

    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }

    fn get_mut(&mut self, name: &str) -> Result<&mut Stream> {
        self.streams
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| StreamError::UnknownStream(name.to_string()))
    }
}
