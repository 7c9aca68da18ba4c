// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::{error::Error, path::PathBuf, sync::Arc, time::Duration};

use clap::{crate_version, Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hapsync::{
    config,
    controller::{Controller, Event},
    link,
    playback::SimulatedEngine,
    tempo::{BeatPause, TempoMap, TempoSegment},
};

/// How often the song position is logged during playback.
const STATUS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = crate_version!(),
    about = "Drives haptic metronome peripherals in sync with a score."
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Prints the tempo map of a score.
    TempoMap {
        /// The path to the score file.
        score_path: String,
        /// Prints the tempo map as JSON.
        #[arg(short, long)]
        json: bool,
    },
    /// Plays a score through the simulated engine, driving the configured devices.
    Play {
        /// The path to the player config.
        player_path: String,
        /// The path to the score file.
        score_path: String,
        /// The tick to start playing from.
        #[arg(short, long)]
        from_tick: Option<u64>,
    },
}

#[derive(Serialize)]
struct TempoMapOutput<'a> {
    segments: &'a [TempoSegment],
    beat_pauses: &'a [BeatPause],
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::TempoMap { score_path, json } => {
            let score = config::load_score(&PathBuf::from(&score_path))?;
            let tempo_map = TempoMap::build(score.bars(), score.duration());
            let beat_pauses = tempo_map.beat_pauses();

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&TempoMapOutput {
                        segments: tempo_map.segments(),
                        beat_pauses: &beat_pauses,
                    })?
                );
                return Ok(());
            }

            println!("{}", score);
            println!("\nSegments (count: {}):", tempo_map.segments().len());
            for segment in tempo_map.segments() {
                println!("- tick {}: {} ms", segment.tick_start, segment.period_ms);
            }
            println!("\nBeats (count: {}):", beat_pauses.len());
            for (index, pause) in beat_pauses.iter().enumerate() {
                println!(
                    "- {}: {:.3}s{}",
                    index,
                    pause.wait_time,
                    if pause.is_first_beat { " (bar)" } else { "" }
                );
            }
        }
        Commands::Play {
            player_path,
            score_path,
            from_tick,
        } => {
            let player = config::load_player(&PathBuf::from(&player_path))?;
            let score = Arc::new(config::load_score(&PathBuf::from(&score_path))?);
            let start_tick = from_tick.unwrap_or(0);

            let link = link::get_link(player.link()).await?;
            let (updates_tx, updates_rx) = mpsc::unbounded_channel();
            let engine = Arc::new(SimulatedEngine::spawn(
                score.clone(),
                player.ticks_per_quarter(),
                player.sample_interval()?,
                start_tick,
                updates_tx,
            ));
            let controller =
                Controller::new(link, engine, updates_rx, player.note_min_interval()?)?;
            controller.send(Event::LoadScore(score.clone()))?;

            for _ in 0..player.devices() {
                match controller.connect(player.link().service_filter()).await {
                    Ok(id) => info!(id = %id, "Device connected."),
                    Err(e) => warn!(err = %e, "Unable to connect device."),
                }
            }
            if controller.status().await?.connected.is_empty() {
                return Err("no devices connected".into());
            }

            // Wait for the engine to report where it starts.
            let positioned = tokio::time::timeout(STATUS_INTERVAL, async {
                loop {
                    match controller.status().await {
                        Ok(status) if status.current_tick == start_tick => return,
                        Ok(_) => tokio::time::sleep(Duration::from_millis(10)).await,
                        Err(_) => return,
                    }
                }
            })
            .await;
            if positioned.is_err() {
                warn!(start_tick, "Engine did not report its start position.");
            }

            controller.send(Event::Play)?;
            loop {
                tokio::time::sleep(STATUS_INTERVAL).await;
                let status = controller.status().await?;
                if let Some(position) = status.position.as_ref() {
                    info!(
                        position,
                        devices = status.connected.len(),
                        period_ms = status.period_ms,
                        "Playing {}.",
                        score.title()
                    );
                }
                if !status.playing {
                    break;
                }
            }

            controller.send(Event::Stop)?;
            controller.shutdown().await?;
            info!("Done.");
        }
    }

    Ok(())
}
