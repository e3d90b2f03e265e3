//! Integration tests for the virtual card
//!
//! These drive the whole stack the way an embedding application would:
//! configuration channel in, seal, device surface out, with the bundled
//! dummy and loopback Audio Paths doing the timing and copying.

use std::sync::Arc;
use std::time::Duration;

use virtuoso_core::domain::card::{CardError, VirtualCard};
use virtuoso_core::domain::clock::{ManualTicks, TickSource};
use virtuoso_core::domain::config::{CardController, ConfigError, ConfigRequest};
use virtuoso_core::domain::pcm::{
    HwRequest, PcmError, PcmEvent, SampleFormat, TriggerCommand,
};
use virtuoso_core::domain::stream::{Direction, StreamError};
use virtuoso_infra::{dummy_path, loopback_path, PcmHandle, DUMMY_UID, LOOPBACK_UID};

fn manual_card() -> (Arc<VirtualCard>, Arc<ManualTicks>) {
    let ticks = Arc::new(ManualTicks::new());
    let card = Arc::new(
        VirtualCard::new("virtuoso").with_ticks(Arc::clone(&ticks) as Arc<dyn TickSource>),
    );
    (card, ticks)
}

fn controller_for(card: &Arc<VirtualCard>) -> CardController {
    CardController::new(Arc::clone(card))
}

fn create_stream(ctl: &CardController, name: &str, map: &str, channels: u32) {
    ctl.apply(ConfigRequest::CreateStream {
        name: name.to_string(),
    })
    .unwrap();
    ctl.apply(ConfigRequest::SetMap {
        stream: name.to_string(),
        map: map.to_string(),
    })
    .unwrap();
    ctl.apply(ConfigRequest::SetChannels {
        stream: name.to_string(),
        channels,
    })
    .unwrap();
}

fn stereo_request(period_frames: u32) -> HwRequest {
    HwRequest {
        rate: 48000,
        channels: 2,
        format: SampleFormat::S16Le,
        period_frames,
        periods: 4,
    }
}

// ============================================================================
// DUMMY PATH END TO END
// ============================================================================

#[test]
fn test_dummy_playback_first_period() {
    // Register the path before any stream exists, then build the topology
    let (card, ticks) = manual_card();
    card.register_path(dummy_path()).unwrap();

    let ctl = controller_for(&card);
    create_stream(&ctl, "playback_test", DUMMY_UID, 2);
    ctl.apply(ConfigRequest::Seal { value: 1 }).unwrap();

    let mut handle = PcmHandle::open(&card, 0).unwrap();
    // 480-frame periods tick over exactly every 10 virtual ticks at 48kHz
    handle.hw_params(stereo_request(480)).unwrap();
    handle.prepare().unwrap();

    let events = handle.events();
    handle.trigger(TriggerCommand::Start).unwrap();

    ticks.advance(10);
    let event = events
        .recv_timeout(Duration::from_secs(2))
        .expect("first period notification");
    assert_eq!(event, PcmEvent::PeriodElapsed { device: 0, periods: 1 });

    // Exactly one period's worth of frames produced
    assert_eq!(handle.pointer_frames().unwrap(), 480);
    // Exactly one notification: nothing else is pending
    assert!(events.try_recv().is_err());

    handle.trigger(TriggerCommand::Stop).unwrap();
    handle.close().unwrap();
}

#[test]
fn test_dummy_pointer_tracks_simulated_time() {
    let (card, ticks) = manual_card();
    card.register_path(dummy_path()).unwrap();

    let ctl = controller_for(&card);
    create_stream(&ctl, "playback_test", DUMMY_UID, 2);
    ctl.apply(ConfigRequest::Seal { value: 1 }).unwrap();

    let mut handle = PcmHandle::open(&card, 0).unwrap();
    handle.hw_params(stereo_request(480)).unwrap();
    handle.prepare().unwrap();
    handle.trigger(TriggerCommand::Start).unwrap();

    let buffer_frames = 480 * 4;
    let mut last = 0u64;
    for step in 1..=200u64 {
        ticks.advance(3);
        let frames = handle.pointer_frames().unwrap();
        // 48 frames per tick, modulo the ring
        assert_eq!(frames, (step * 3 * 48) % buffer_frames);
        // Monotonic except for wraparound
        assert!(frames >= last || frames < 48 * 3);
        last = frames;
    }

    handle.trigger(TriggerCommand::Stop).unwrap();
}

// ============================================================================
// SEAL SEMANTICS
// ============================================================================

#[test]
fn test_seal_preserves_configured_channel_counts() {
    let (card, _ticks) = manual_card();
    card.register_path(dummy_path()).unwrap();

    let ctl = controller_for(&card);
    create_stream(&ctl, "playback_front", DUMMY_UID, 2);
    create_stream(&ctl, "playback_rear", DUMMY_UID, 4);
    create_stream(&ctl, "capture_mic", DUMMY_UID, 1);
    ctl.apply(ConfigRequest::Seal { value: 1 }).unwrap();

    for (device, channels) in [(0u32, 2u32), (1, 4), (2, 1)] {
        let stream = card.find_by_device(device).expect("stream after seal");
        assert_eq!(stream.channels(), channels);
        assert!(stream.is_backed());
    }
    assert_eq!(card.stream_count(Direction::Playback), 2);
    assert_eq!(card.stream_count(Direction::Capture), 1);
}

#[test]
fn test_double_seal_fails_without_mutating() {
    let (card, _ticks) = manual_card();
    card.register_path(dummy_path()).unwrap();

    let ctl = controller_for(&card);
    create_stream(&ctl, "playback_test", DUMMY_UID, 2);
    ctl.apply(ConfigRequest::Seal { value: 1 }).unwrap();

    let err = ctl.apply(ConfigRequest::Seal { value: 1 });
    assert!(matches!(
        err,
        Err(ConfigError::Card(CardError::Stream(StreamError::AlreadySealed)))
    ));

    // Devices and bindings from the first seal remain queryable
    let stream = card.find_by_device(0).expect("device survives second seal");
    assert_eq!(stream.name(), "playback_test");
    assert_eq!(stream.channels(), 2);
    assert!(PcmHandle::open(&card, 0).is_ok());
}

#[test]
fn test_open_with_unresolved_map_is_clean() {
    let (card, _ticks) = manual_card();
    card.register_path(dummy_path()).unwrap();

    let ctl = controller_for(&card);
    create_stream(&ctl, "playback_test", "ap_late_joiner", 2);
    ctl.apply(ConfigRequest::Seal { value: 1 }).unwrap();

    let err = PcmHandle::open(&card, 0);
    assert!(matches!(err, Err(PcmError::UnresolvedPath { .. })));

    // Nothing was left bound: once a path with that uid registers, the
    // same open succeeds from scratch
    let late = virtuoso_core::domain::path::AudioPath::new(
        "ap_late_joiner",
        "Late Joiner",
        [0, 0, 1],
        dummy_path().hw().clone(),
        Arc::new(NullOps),
    );
    card.register_path(late).unwrap();
    assert!(PcmHandle::open(&card, 0).is_ok());
}

struct NullOps;
impl virtuoso_core::domain::path::AudioPathOps for NullOps {}

// ============================================================================
// LOOPBACK END TO END
// ============================================================================

#[test]
fn test_loopback_pattern_roundtrip() {
    let (card, ticks) = manual_card();
    card.register_path(loopback_path()).unwrap();

    let ctl = controller_for(&card);
    create_stream(&ctl, "playback_loop", LOOPBACK_UID, 2);
    create_stream(&ctl, "capture_loop", LOOPBACK_UID, 2);
    ctl.apply(ConfigRequest::Seal { value: 1 }).unwrap();

    let mut playback = PcmHandle::open(&card, 0).unwrap();
    let mut capture = PcmHandle::open(&card, 1).unwrap();
    playback.hw_params(stereo_request(512)).unwrap();
    capture.hw_params(stereo_request(512)).unwrap();
    playback.prepare().unwrap();
    capture.prepare().unwrap();

    let period_bytes = playback.runtime().unwrap().period_bytes as usize;
    let pattern: Vec<u8> = (0..period_bytes).map(|i| (i * 7 % 251) as u8).collect();
    playback.write_interleaved(&pattern).unwrap();

    playback.trigger(TriggerCommand::Start).unwrap();
    capture.trigger(TriggerCommand::Start).unwrap();

    // One 512-frame period has elapsed by tick 11; the pointer query runs
    // the cable update synchronously
    ticks.advance(11);
    assert!(capture.pointer().unwrap() >= period_bytes as u64);

    let mut looped = vec![0u8; period_bytes];
    capture.read_interleaved(&mut looped).unwrap();
    assert_eq!(looped, pattern);

    playback.trigger(TriggerCommand::Stop).unwrap();
    capture.trigger(TriggerCommand::Stop).unwrap();
}

#[test]
fn test_loopback_capture_period_notification() {
    let (card, ticks) = manual_card();
    card.register_path(loopback_path()).unwrap();

    let ctl = controller_for(&card);
    create_stream(&ctl, "playback_loop", LOOPBACK_UID, 2);
    create_stream(&ctl, "capture_loop", LOOPBACK_UID, 2);
    ctl.apply(ConfigRequest::Seal { value: 1 }).unwrap();

    let mut playback = PcmHandle::open(&card, 0).unwrap();
    let mut capture = PcmHandle::open(&card, 1).unwrap();
    playback.hw_params(stereo_request(480)).unwrap();
    capture.hw_params(stereo_request(480)).unwrap();
    playback.prepare().unwrap();
    capture.prepare().unwrap();

    let capture_events = capture.events();
    playback.trigger(TriggerCommand::Start).unwrap();
    capture.trigger(TriggerCommand::Start).unwrap();

    ticks.advance(10);
    let event = capture_events
        .recv_timeout(Duration::from_secs(2))
        .expect("capture period notification");
    assert_eq!(event, PcmEvent::PeriodElapsed { device: 1, periods: 1 });

    playback.trigger(TriggerCommand::Stop).unwrap();
    capture.trigger(TriggerCommand::Stop).unwrap();
}

#[test]
fn test_peerless_capture_reads_full_silence() {
    let (card, ticks) = manual_card();
    card.register_path(loopback_path()).unwrap();

    let ctl = controller_for(&card);
    // A capture stream with no playback stream on the path at all
    create_stream(&ctl, "capture_alone", LOOPBACK_UID, 2);
    ctl.apply(ConfigRequest::Seal { value: 1 }).unwrap();

    let mut capture = PcmHandle::open(&card, 0).unwrap();
    capture.hw_params(stereo_request(480)).unwrap();
    capture.prepare().unwrap();
    capture.trigger(TriggerCommand::Start).unwrap();

    // Three periods of self-filled silence (a fourth would wrap the ring)
    ticks.advance(30);
    let pos = capture.pointer().unwrap();
    assert!(pos > 0);

    let buffer_bytes = capture.runtime().unwrap().buffer_bytes as usize;
    let mut looped = vec![0xaau8; buffer_bytes];
    capture.read_interleaved(&mut looped).unwrap();
    assert!(looped.iter().all(|&b| b == 0));

    capture.trigger(TriggerCommand::Stop).unwrap();
}

// ============================================================================
// CONFIGURATION CHANNEL GUARDRAILS
// ============================================================================

#[test]
fn test_writes_after_seal_rejected() {
    let (card, _ticks) = manual_card();
    card.register_path(dummy_path()).unwrap();

    let ctl = controller_for(&card);
    create_stream(&ctl, "playback_test", DUMMY_UID, 2);
    ctl.apply(ConfigRequest::Seal { value: 1 }).unwrap();

    assert!(ctl
        .apply(ConfigRequest::CreateStream {
            name: "playback_more".to_string()
        })
        .is_err());
    assert!(ctl
        .apply(ConfigRequest::SetChannels {
            stream: "playback_test".to_string(),
            channels: 6
        })
        .is_err());
    assert_eq!(ctl.channels("playback_test").unwrap(), 2);
}

#[test]
fn test_late_path_registration_after_seal_serves_opens() {
    let (card, ticks) = manual_card();

    let ctl = controller_for(&card);
    create_stream(&ctl, "playback_test", DUMMY_UID, 2);
    ctl.apply(ConfigRequest::Seal { value: 1 }).unwrap();

    // Not resolvable yet
    assert!(matches!(
        PcmHandle::open(&card, 0),
        Err(PcmError::UnresolvedPath { .. })
    ));

    // Late joiner is configured immediately and serves the open
    card.register_path(dummy_path()).unwrap();
    let mut handle = PcmHandle::open(&card, 0).unwrap();
    handle.hw_params(stereo_request(480)).unwrap();
    handle.prepare().unwrap();
    handle.trigger(TriggerCommand::Start).unwrap();
    ticks.advance(10);
    assert_eq!(handle.pointer_frames().unwrap(), 480);
}
