//! # callq-sim
//!
//! Builds an in-memory call, attaches a quality controller to it and prints
//! every controller event followed by the final state, one JSON document per
//! line.

use std::sync::Arc;
use std::time::Duration;

use callq_throttle::memory::{MemoryLocalMedia, MemoryRoster, MemorySignaling};
use callq_throttle::{ControllerOptions, QualityController, ThrottlerEvent};
use clap::Parser;
use tokio::sync::broadcast;

/// Time given to the controller to react to a change.
const SETTLE: Duration = Duration::from_millis(50);

/// Simulate a group call and report how the sent video is throttled
#[derive(Parser, Debug)]
#[command(version)]
struct Cli {
    /// Remote peers sending video (and audio)
    #[arg(long, default_value_t = 0)]
    video_peers: usize,
    /// Additional remote peers sending audio only
    #[arg(long, default_value_t = 0)]
    audio_peers: usize,
    /// Speak once, then stay silent until the grace period is over
    #[arg(long)]
    speaking: bool,
    /// Start with the local camera disabled
    #[arg(long)]
    video_disabled: bool,
    /// Make every constraint application fail
    #[arg(long)]
    fail_apply: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = callq_common::config::load()?;

    // Logs go to stderr, stdout carries the JSON report
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "callq=debug".into()),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        video_peers = cli.video_peers,
        audio_peers = cli.audio_peers,
        grace_period_ms = config.grace_period_ms,
        "Starting simulated call"
    );

    let roster = Arc::new(MemoryRoster::new());
    for _ in 0..cli.video_peers {
        roster.add(true, true);
    }
    for _ in 0..cli.audio_peers {
        roster.add(false, true);
    }

    let media = Arc::new(MemoryLocalMedia::with_video());
    if cli.video_disabled {
        media.set_video_enabled(false);
    }
    if cli.fail_apply {
        media.fail_applications(Some("simulated failure".into()));
    }

    let signaling = MemorySignaling::new();
    let options = ControllerOptions::from(&config);
    let grace_period = options.grace_period;

    let controller = QualityController::spawn(roster, media.clone(), &signaling, options)?;
    let mut events = controller.subscribe();

    tokio::time::sleep(SETTLE).await;
    print_events(&mut events)?;

    if cli.speaking {
        media.set_speaking(true);
        tokio::time::sleep(SETTLE).await;
        print_events(&mut events)?;

        media.set_speaking(false);
        tracing::info!(?grace_period, "Stopped speaking, waiting for the grace period");
        tokio::time::sleep(grace_period + SETTLE).await;
        print_events(&mut events)?;
    }

    let snapshot = controller.snapshot().await?;
    println!("{}", serde_json::to_string(&snapshot)?);

    controller.destroy();
    Ok(())
}

fn print_events(events: &mut broadcast::Receiver<ThrottlerEvent>) -> anyhow::Result<()> {
    loop {
        match events.try_recv() {
            Ok(event) => println!("{}", serde_json::to_string(&event)?),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Missed controller events");
            }
            Err(_) => return Ok(()),
        }
    }
}
