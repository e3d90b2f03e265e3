//! Runtime machinery for the Virtuoso virtual sound card
//!
//! Builds on the `virtuoso-core` domain model:
//! - The per-device dispatch layer and application-facing device surface
//! - Rearming wake timers driving the virtual clocks
//! - The bundled reference Audio Paths (dummy and loopback)

pub mod clock;
pub mod paths;
pub mod pcm;

// Re-export specific items to avoid ambiguous glob imports
pub use clock::{VirtualClock, WakeTimer};
pub use paths::dummy::{dummy_path, DUMMY_UID};
pub use paths::loopback::{loopback_path, Cable, CableParams, LOOPBACK_UID};
pub use pcm::PcmHandle;
