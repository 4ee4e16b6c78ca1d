//! Command line driver for the capture wall.
//!
//! Runs a wall of sessions against the synthetic backend: each tile is fed a
//! test pattern and consumed while the wall is paused, resumed and rebuilt
//! at a lower frame rate. The engine's metrics are printed at the end.

mod config;
mod pattern;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use futures::future::join_all;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wallcap_capture::synthetic::SyntheticBackend;
use wallcap_capture::{FrameStream, NativeError};
use wallcap_engine::create_engine;
use wallcap_ipc::{event_channel, SessionConfig, SessionId, StreamParameters};

use crate::config::WallConfig;
use crate::pattern::PatternFeed;

#[derive(Debug, Parser)]
#[command(name = "wallcap", version, about = "Drive a capture wall with synthetic sources")]
struct Args {
    /// JSON wall configuration. Without it, `--sessions` display tiles are used.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of display tiles when no config file is given.
    #[arg(short, long, default_value_t = 4)]
    sessions: usize,

    /// Length of each phase of the run, in milliseconds.
    #[arg(long, default_value_t = 1_000)]
    phase_ms: u64,

    /// Override every tile's frame rate.
    #[arg(long)]
    fps: Option<u32>,

    /// Fail the native stream of this tile halfway through the run.
    #[arg(long)]
    fail_tile: Option<usize>,
}

/// Initialize logging.
fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "wallcap=info,wallcap_engine=debug,wallcap_capture=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(args: &Args) -> Result<WallConfig> {
    let mut config = match args.config {
        Some(ref path) => WallConfig::load(path)?,
        None => WallConfig::with_displays(
            args.sessions,
            StreamParameters {
                width: 640,
                height: 360,
                frame_rate: 30,
                ..Default::default()
            },
        ),
    };

    if let Some(fps) = args.fps {
        for session in &mut config.sessions {
            session.parameters.frame_rate = fps;
        }
    }
    config.validate()?;
    Ok(config)
}

/// Pull every frame of one tile until its sequence ends.
async fn consume(id: SessionId, mut frames: FrameStream) -> (SessionId, u64) {
    let mut received = 0u64;
    while let Some(item) = frames.recv().await {
        match item {
            Ok(frame) => {
                if received == 0 {
                    debug!(session = %id, size = ?frame.size(), "First frame");
                }
                received += 1;
            }
            Err(e) => warn!(session = %id, error = %e, "Tile ended with error"),
        }
    }
    (id, received)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();
    let config = load_config(&args)?;
    let phase = Duration::from_millis(args.phase_ms);

    info!(tiles = config.sessions.len(), "Starting capture wall");

    let (event_tx, event_rx) = event_channel();
    let events = thread::Builder::new()
        .name("wallcap.events".into())
        .spawn(move || {
            for event in event_rx.iter() {
                if let Some(session) = event.session() {
                    debug!(%session, ?event, "Session event");
                }
            }
        })
        .context("Failed to spawn event thread")?;

    let backend = Arc::new(SyntheticBackend::new());
    let engine = create_engine(backend.clone(), config.engine.clone(), event_tx)
        .context("Failed to create engine")?;

    let mut consumers = Vec::new();
    for session in &config.sessions {
        let (id, frames) = engine
            .start_session(session.parameters.clone(), session.filter.clone())
            .await;
        consumers.push(tokio::spawn(consume(id, frames)));
    }

    let mut feeds: Vec<PatternFeed> = backend
        .streams()
        .into_iter()
        .map(PatternFeed::spawn)
        .collect();

    tokio::time::sleep(phase / 2).await;
    if let Some(stream) = args.fail_tile.and_then(|index| backend.stream(index)) {
        info!("Injecting native failure");
        stream.fail(NativeError::new(-3821, "display disconnected"));
    }
    tokio::time::sleep(phase / 2).await;

    info!("Pausing wall");
    engine.stop_capture(false).await;
    tokio::time::sleep(phase / 2).await;

    info!("Resuming wall");
    engine.resume_capture().await;
    tokio::time::sleep(phase).await;

    // Rebuild every tile at half rate, as a mode switch of the wall would.
    let slower: Vec<SessionConfig> = config
        .sessions
        .iter()
        .cloned()
        .map(|mut session| {
            session.parameters.frame_rate = (session.parameters.frame_rate / 2).max(1);
            session
        })
        .collect();
    info!("Resetting wall at half rate");
    let frames = engine.reset_capture(slower).await;
    for (id, frames) in engine.session_ids().into_iter().zip(frames) {
        consumers.push(tokio::spawn(consume(id, frames)));
    }
    let fresh = backend.streams().split_off(feeds.len());
    feeds.extend(fresh.into_iter().map(PatternFeed::spawn));
    tokio::time::sleep(phase).await;

    engine.emit_metrics();
    let metrics = engine.metrics();

    engine.stop_capture(true).await;
    let accepted: u64 = join_all(feeds.into_iter().map(PatternFeed::stop))
        .await
        .into_iter()
        .sum();

    for result in join_all(consumers).await {
        let (id, received) = result.context("Consumer task panicked")?;
        info!(session = %id, received, "Tile finished");
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&metrics).context("Failed to encode metrics")?
    );
    info!(accepted, "Capture wall stopped");

    drop(engine);
    if events.join().is_err() {
        warn!("Event thread panicked");
    }
    Ok(())
}
