//! Virtuoso CLI Application
//!
//! Builds a virtual sound card from a TOML layout (or a stereo default),
//! seals it, then runs one of its streams against the bundled Audio Paths
//! and reports the observed period cadence.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use virtuoso_core::domain::card::VirtualCard;
use virtuoso_core::domain::config::{CardController, CardLayout, ConfigRequest, StreamLayout};
use virtuoso_core::domain::pcm::{HwRequest, PcmEvent, SampleFormat, TriggerCommand};
use virtuoso_core::domain::stream::Direction;
use virtuoso_infra::{dummy_path, loopback_path, PcmHandle, DUMMY_UID};

#[derive(Parser)]
#[command(name = "virtuoso")]
#[command(about = "A configurable virtual sound card", long_about = None)]
struct Cli {
    /// Card layout TOML; a stereo dummy playback stream is used if omitted
    #[arg(short, long)]
    layout: Option<PathBuf>,

    /// Stream to run after sealing (defaults to the first playback stream)
    #[arg(short, long)]
    stream: Option<String>,

    /// How long to run the stream, in seconds
    #[arg(short, long, default_value_t = 2)]
    duration: u64,

    /// Period size in frames
    #[arg(long, default_value_t = 512)]
    period_frames: u32,

    /// Periods per buffer
    #[arg(long, default_value_t = 4)]
    periods: u32,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn default_layout() -> CardLayout {
    CardLayout {
        name: "virtuoso".to_string(),
        streams: vec![StreamLayout {
            name: "playback_main".to_string(),
            map: DUMMY_UID.to_string(),
            channels: 2,
        }],
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    let layout = match &cli.layout {
        Some(path) => CardLayout::load(path).await?,
        None => default_layout(),
    };

    tracing::info!("🎚 Virtuoso starting card '{}'...", layout.name);

    let card = Arc::new(VirtualCard::new(layout.name.clone()));
    card.register_path(dummy_path())?;
    card.register_path(loopback_path())?;

    let controller = CardController::new(Arc::clone(&card));
    controller.apply_layout(&layout)?;
    controller.apply(ConfigRequest::Seal { value: 1 })?;

    for stream in card.streams() {
        tracing::info!(
            "device {}: {} ({:?}) -> {} [{} ch]",
            stream.device(),
            stream.name(),
            stream.direction(),
            stream.map(),
            stream.channels()
        );
    }

    let stream = match &cli.stream {
        Some(name) => card
            .stream_by_name(name)
            .ok_or_else(|| anyhow::anyhow!("no stream named '{}'", name))?,
        None => card
            .streams()
            .into_iter()
            .find(|s| s.direction() == Direction::Playback)
            .ok_or_else(|| anyhow::anyhow!("layout has no playback stream"))?,
    };

    let mut handle = PcmHandle::open(&card, stream.device())?;
    handle.hw_params(HwRequest {
        rate: handle.hw().rate_max,
        channels: stream.channels(),
        format: SampleFormat::S16Le,
        period_frames: cli.period_frames,
        periods: cli.periods,
    })?;
    handle.prepare()?;

    let events = handle.events();
    handle.trigger(TriggerCommand::Start)?;
    tracing::info!(
        "Running '{}' for {}s ({} frames/period x {})",
        stream.name(),
        cli.duration,
        cli.period_frames,
        cli.periods
    );

    let deadline = Instant::now() + Duration::from_secs(cli.duration);
    let mut periods_seen: u64 = 0;
    let mut notifications: u64 = 0;
    while Instant::now() < deadline {
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(PcmEvent::PeriodElapsed { periods, .. }) => {
                periods_seen += u64::from(periods);
                notifications += 1;
            }
            Ok(PcmEvent::ParamsChanged { device }) => {
                tracing::warn!("device {} parameters changed underneath us", device);
            }
            Err(_) => {}
        }
    }

    let frames = handle.pointer_frames()?;
    handle.trigger(TriggerCommand::Stop)?;
    handle.close()?;

    tracing::info!(
        "Done: {} notification(s), {} period(s) elapsed, pointer at frame {}",
        notifications,
        periods_seen,
        frames
    );
    Ok(())
}
