//! Segue player - demo entry point
//!
//! Runs the playback core against the simulated backend in real time and
//! prints every lifecycle event as a JSON line. Media are given as
//! `LOCATOR[=DURATION_MS]`; local paths are turned into `file://` URIs and
//! probed for their duration.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use segue_common::config::{resolve_settings_path, CONFIG_ENV_VAR};
use segue_common::events::PlaybackState;
use segue_common::settings::keys;
use segue_common::SettingsStore;
use segue_player::backend::sim::SimBackend;
use segue_player::clock::{SharedClock, SystemClock};
use segue_player::track::{MediaTrack, Track};
use segue_player::{uri, Player};
use tokio::signal;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for segue-player
#[derive(Parser, Debug)]
#[command(name = "segue-player")]
#[command(about = "Playback-transition core running on a simulated backend")]
#[command(version)]
struct Args {
    /// Settings file (TOML)
    #[arg(short, long, env = CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    /// Playback engine: normal, gapless or unified
    #[arg(short, long)]
    engine: Option<String>,

    /// Crossfade duration in milliseconds (enables crossfading)
    #[arg(short = 'x', long)]
    crossfade: Option<u64>,

    /// Loop tick in milliseconds
    #[arg(long, default_value = "10")]
    tick_ms: u64,

    /// Media to play, as LOCATOR[=DURATION_MS]
    #[arg(required = true)]
    media: Vec<String>,
}

/// One media argument
#[derive(Debug)]
struct MediaArg {
    locator: String,
    duration_ms: Option<u64>,
}

fn parse_media(arg: &str) -> Result<MediaArg> {
    let (target, duration_ms) = match arg.rsplit_once('=') {
        Some((target, ms)) if !ms.is_empty() && ms.chars().all(|c| c.is_ascii_digit()) => {
            (target, Some(ms.parse::<u64>().context("duration out of range")?))
        }
        _ => (arg, None),
    };

    if uri::scheme(target).is_some() {
        return Ok(MediaArg {
            locator: target.to_string(),
            duration_ms,
        });
    }

    let path = std::path::absolute(Path::new(target))
        .with_context(|| format!("Cannot resolve path {}", target))?;
    let track = MediaTrack::from_path(&path)
        .with_context(|| format!("Invalid media path {}", path.display()))?;
    let probed = track.duration().map(|secs| (secs * 1000.0).round() as u64);
    Ok(MediaArg {
        locator: track.locator().to_string(),
        duration_ms: duration_ms.or(probed),
    })
}

fn load_settings(args: &Args) -> Result<SettingsStore> {
    let settings = match resolve_settings_path(args.config.as_deref(), CONFIG_ENV_VAR) {
        Some(path) => {
            info!("Settings file: {}", path.display());
            SettingsStore::load(&path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?
        }
        None => SettingsStore::new(),
    };

    if let Some(engine) = &args.engine {
        settings.set(keys::ENGINE, engine.as_str())?;
    }
    if let Some(ms) = args.crossfade {
        settings.set(keys::CROSSFADING, true)?;
        settings.set(keys::CROSSFADE_DURATION, i64::try_from(ms).context("crossfade too long")?)?;
    }
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "segue_player=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let settings = Arc::new(load_settings(&args)?);

    let clock: SharedClock = Arc::new(SystemClock::new());
    let sim = SimBackend::new(clock.clone());
    let mut player = Player::new(Box::new(sim.clone()), clock, settings)
        .context("Failed to initialize player")?;

    for arg in &args.media {
        let media = parse_media(arg)?;
        if media.duration_ms.is_none() {
            warn!("{} has no known duration; it will play until stopped", media.locator);
        }
        sim.add_media(&media.locator, media.duration_ms);
        let duration = media.duration_ms.map(|ms| ms as f64 / 1000.0);
        let track = MediaTrack::new(media.locator.clone(), duration)
            .with_context(|| format!("Invalid locator {}", media.locator))?;
        player.queue_mut().enqueue(track.into_ref());
    }
    if player.queue().is_empty() {
        bail!("Nothing to play");
    }

    let mut events = player.subscribe();
    player.play(None).context("Failed to start playback")?;
    info!("Playing {} track(s)", args.media.len());

    let mut ticker = tokio::time::interval(Duration::from_millis(args.tick_ms.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                player.iterate();
                loop {
                    match events.try_recv() {
                        Ok(event) => println!("{}", serde_json::to_string(&event)?),
                        Err(TryRecvError::Lagged(n)) => warn!("Dropped {} events", n),
                        Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                    }
                }
                if player.state() == PlaybackState::Stopped {
                    info!("Queue finished");
                    break;
                }
            }
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, stopping");
                player.stop();
                break;
            }
        }
    }

    Ok(())
}
