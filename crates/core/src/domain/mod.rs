//! Domain entities and business rules

pub mod card;
pub mod clock;
pub mod config;
pub mod path;
pub mod pcm;
pub mod stream;

// Re-export specific items to avoid ambiguous glob imports
pub use card::{CardError, CardPublisher, LogPublisher, VirtualCard};
pub use clock::{ClockTimeline, ManualTicks, SystemTicks, TickSource, TICK_RESOLUTION};
pub use config::{CardController, CardLayout, ConfigError, ConfigEvent, ConfigRequest};
pub use path::{AudioPath, AudioPathOps, AudioPathRegistry, HardwareParams, PathHandle, PathInstance};
pub use pcm::{
    EventSink, HwRequest, PcmContext, PcmError, PcmEvent, PcmRuntime, PcmState, SampleBuffer,
    SampleFormat, SubstreamInfo, TimeInfo, TriggerCommand,
};
pub use stream::{Direction, Stream, StreamError, StreamRegistry};
