//! Configuration channel for the virtual card
//!
//! This module provides:
//! - Stream creation through direction-prefixed names (`playback_*` /
//!   `capture_*`)
//! - Typed, validated runtime requests replacing free-form attribute
//!   writes
//! - The one-shot `sealed` write that freezes the topology
//! - TOML card layouts with async load/save
//! - Change notifications over a broadcast channel

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::card::{CardError, VirtualCard};
use super::stream::Direction;

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors surfaced synchronously to the configuration writer
///
/// Every failed request leaves the card untouched.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Stream names must carry a direction prefix
    #[error("Invalid stream name '{0}': must begin with playback_ or capture_")]
    InvalidStreamName(String),

    /// Channel counts are strictly positive
    #[error("Stream '{0}': channel count must be greater than zero")]
    ZeroChannels(String),

    /// The sealed flag only accepts the value 1; topologies cannot be
    /// unsealed
    #[error("Streams can only be sealed, not unsealed (got {0})")]
    SealValue(u32),

    #[error("Unknown stream: {0}")]
    UnknownStream(String),

    /// A layout would collide with itself or with existing streams
    #[error("Layout declares stream '{0}' more than once")]
    DuplicateLayoutStream(String),

    #[error(transparent)]
    Card(#[from] CardError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// A validated configuration write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigRequest {
    /// Create a stream; direction comes from the name prefix
    CreateStream { name: String },
    SetMap { stream: String, map: String },
    SetChannels { stream: String, channels: u32 },
    /// One-shot write; only the value 1 is accepted
    Seal { value: u32 },
}

/// Notifications emitted after a request commits
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigEvent {
    StreamCreated { name: String, device: u32 },
    ConfigChanged { stream: String },
    Sealed,
}

/// Declarative card layout, applied atomically before sealing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardLayout {
    pub name: String,
    #[serde(default)]
    pub streams: Vec<StreamLayout>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamLayout {
    pub name: String,
    pub map: String,
    pub channels: u32,
}

impl CardLayout {
    /// Load a layout from a TOML file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).await?;
        let layout: CardLayout = toml::from_str(&content)?;
        debug!(
            "Loaded layout '{}' with {} stream(s)",
            layout.name,
            layout.streams.len()
        );
        Ok(layout)
    }

    /// Save a layout to a TOML file
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path.as_ref(), content).await?;
        debug!("Saved layout '{}'", self.name);
        Ok(())
    }
}

/// Parse the direction prefix off a stream name
pub fn parse_direction(name: &str) -> Result<Direction> {
    for direction in [Direction::Playback, Direction::Capture] {
        let prefix = direction.prefix();
        if name.len() > prefix.len() && name.starts_with(prefix) {
            return Ok(direction);
        }
    }
    Err(ConfigError::InvalidStreamName(name.to_string()))
}

/// Typed front end over the card's configuration surface
///
/// Requests are validated before anything is committed; successful writes
/// are announced on the broadcast channel.
pub struct CardController {
    card: Arc<VirtualCard>,
    events: broadcast::Sender<ConfigEvent>,
}

impl CardController {
    pub fn new(card: Arc<VirtualCard>) -> Self {
        let (events, _) = broadcast::channel(32);
        Self { card, events }
    }

    pub fn card(&self) -> &Arc<VirtualCard> {
        &self.card
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.events.subscribe()
    }

    /// Apply one validated configuration request
    pub fn apply(&self, request: ConfigRequest) -> Result<()> {
        match request {
            ConfigRequest::CreateStream { name } => {
                let direction = parse_direction(&name)?;
                let device = self.card.create_stream(&name, direction)?;
                self.emit(ConfigEvent::StreamCreated { name, device });
            }
            ConfigRequest::SetMap { stream, map } => {
                self.card.set_stream_map(&stream, &map)?;
                self.emit(ConfigEvent::ConfigChanged { stream });
            }
            ConfigRequest::SetChannels { stream, channels } => {
                if channels == 0 {
                    return Err(ConfigError::ZeroChannels(stream));
                }
                self.card.set_stream_channels(&stream, channels)?;
                self.emit(ConfigEvent::ConfigChanged { stream });
            }
            ConfigRequest::Seal { value } => {
                if value != 1 {
                    return Err(ConfigError::SealValue(value));
                }
                self.card.seal()?;
                info!("Card '{}' sealed via configuration channel", self.card.name());
                self.emit(ConfigEvent::Sealed);
            }
        }
        Ok(())
    }

    /// Apply a whole layout, validating every entry before the first write
    pub fn apply_layout(&self, layout: &CardLayout) -> Result<()> {
        for (i, entry) in layout.streams.iter().enumerate() {
            parse_direction(&entry.name)?;
            if entry.channels == 0 {
                return Err(ConfigError::ZeroChannels(entry.name.clone()));
            }
            if layout.streams[..i].iter().any(|e| e.name == entry.name) {
                return Err(ConfigError::DuplicateLayoutStream(entry.name.clone()));
            }
        }

        for entry in &layout.streams {
            self.apply(ConfigRequest::CreateStream {
                name: entry.name.clone(),
            })?;
            self.apply(ConfigRequest::SetMap {
                stream: entry.name.clone(),
                map: entry.map.clone(),
            })?;
            self.apply(ConfigRequest::SetChannels {
                stream: entry.name.clone(),
                channels: entry.channels,
            })?;
        }
        Ok(())
    }

    // Read-back getters for the per-stream attributes

    pub fn direction(&self, stream: &str) -> Result<Direction> {
        self.stream_attr(stream, |s| s.direction())
    }

    pub fn map(&self, stream: &str) -> Result<String> {
        self.stream_attr(stream, |s| s.map().to_string())
    }

    pub fn channels(&self, stream: &str) -> Result<u32> {
        self.stream_attr(stream, |s| s.channels())
    }

    pub fn sealed(&self) -> bool {
        self.card.is_sealed()
    }

    fn stream_attr<T>(
        &self,
        stream: &str,
        get: impl FnOnce(&super::stream::Stream) -> T,
    ) -> Result<T> {
        self.card
            .stream_by_name(stream)
            .map(|s| get(&s))
            .ok_or_else(|| ConfigError::UnknownStream(stream.to_string()))
    }

    fn emit(&self, event: ConfigEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }
}
