//! Core domain logic for the Virtuoso virtual sound card.
//!
//! This crate is platform-free: it holds the stream and audio-path
//! registries, the sealable configuration channel, the PCM data model and
//! the virtual-clock arithmetic. Timer threads, the device dispatch layer
//! and the bundled Audio Paths live in the `virtuoso-infra` crate.

pub mod domain;
