use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use compute::{CompiledBatch, compile_batch};
use runtime::scheduler::FrameDriver;
use scene::live::RenderRecord;
use scene::trip::RawTrip;
use serde::Serialize;
use streaming::{HttpSource, MemorySource, Playback, PlaybackConfig, PlaybackStatus, TripSource};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Headless trip playback and compilation")]
struct Args {
    /// JSON config file; fields it leaves out keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Window start (RFC 3339), overrides the config file and REPLAY_WINDOW_START
    #[arg(long)]
    window_start: Option<DateTime<Utc>>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the playback loop in real time and log its status
    Play {
        /// JSON array of trip rows to serve from memory
        #[arg(long)]
        trips: Option<PathBuf>,

        /// Base URL of a trip store (default: TRIPS_URL)
        #[arg(long)]
        source_url: Option<String>,

        /// Simulated seconds per real second
        #[arg(long)]
        speed: Option<f64>,

        /// Simulated second to start from
        #[arg(long, default_value_t = 0.0)]
        start_at: f64,

        /// Real seconds to run for
        #[arg(long, default_value_t = 10.0)]
        seconds: f64,

        #[arg(long, default_value_t = 30)]
        fps: u32,

        /// Print the final status and render records as JSON
        #[arg(long)]
        dump: bool,
    },

    /// Compile a JSON array of trip rows and print a summary
    Compile {
        #[arg(long)]
        trips: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => PlaybackConfig::from_json_file(path)?,
        None => PlaybackConfig::default(),
    };
    let window_start = match args.window_start {
        Some(at) => Some(at),
        None => env::var("REPLAY_WINDOW_START")
            .ok()
            .map(|s| s.parse::<DateTime<Utc>>())
            .transpose()?,
    };
    if let Some(at) = window_start {
        config.window_start_ms = at.timestamp_millis();
    }

    match args.command {
        Command::Play {
            trips,
            source_url,
            speed,
            start_at,
            seconds,
            fps,
            dump,
        } => {
            if let Some(speed) = speed {
                config.speed_multiplier = speed;
            }
            config.validate()?;
            let source = open_source(trips.as_deref(), source_url).await?;
            play(config, source, start_at, seconds, fps, dump).await?
        }
        Command::Compile { trips } => {
            config.validate()?;
            let summary = compile_file(&config, &trips).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}

async fn open_source(
    trips: Option<&Path>,
    source_url: Option<String>,
) -> Result<Arc<dyn TripSource>, Box<dyn std::error::Error>> {
    if let Some(path) = trips {
        let source = MemorySource::from_json_file(path).await?;
        info!(path = %path.display(), rows = source.len(), "loaded trips");
        return Ok(Arc::new(source));
    }
    match source_url.or_else(|| env::var("TRIPS_URL").ok()) {
        Some(url) => Ok(Arc::new(HttpSource::new(url))),
        None => Err("either --trips or --source-url (or TRIPS_URL) is required".into()),
    }
}

#[derive(Serialize)]
struct Dump {
    status: PlaybackStatus,
    records: Vec<RenderRecord>,
}

async fn play(
    config: PlaybackConfig,
    source: Arc<dyn TripSource>,
    start_at: f64,
    seconds: f64,
    fps: u32,
    dump: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut playback = Playback::new(config, source, tokio::runtime::Handle::current())?;
    playback.scrub_to(start_at);

    let mut driver = FrameDriver::new();
    let mut interval = tokio::time::interval(Duration::from_secs_f64(1.0 / f64::from(fps.max(1))));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let run_for = Duration::from_secs_f64(seconds.max(0.0));
    let started = Instant::now();
    let mut last_report = started;
    while started.elapsed() < run_for {
        let now = interval.tick().await;
        driver.drive(now.into_std(), &mut playback);

        if last_report.elapsed() >= Duration::from_secs(1) {
            let status = playback.status();
            info!(
                t = status.sim_time_seconds,
                chunk = status.current_chunk.0,
                loading = status.loading,
                live = status.live_trips,
                visible = status.visible_trips,
                resident = ?status.resident_batches,
                "playback"
            );
            if !status.failed_batches.is_empty() {
                warn!(failed = ?status.failed_batches, "batches failed; retrying");
                playback.retry_failed();
            }
            last_report = Instant::now();
        }
    }

    let status = playback.status();
    info!(
        frames = driver.frames(),
        t = status.sim_time_seconds,
        visible = status.visible_trips,
        "replay finished"
    );
    if dump {
        let records = playback.records();
        println!("{}", serde_json::to_string_pretty(&Dump { status, records })?);
    }
    Ok(())
}

#[derive(Debug, Serialize, PartialEq)]
struct CompileSummary {
    rows: usize,
    zero_length: usize,
    compiled: usize,
    dropped: usize,
    total_route_km: f64,
    earliest_visible_seconds: Option<f64>,
    latest_visible_seconds: Option<f64>,
}

async fn compile_file(
    config: &PlaybackConfig,
    path: &Path,
) -> Result<CompileSummary, Box<dyn std::error::Error>> {
    let text = tokio::fs::read_to_string(path).await?;
    let rows: Vec<RawTrip> = serde_json::from_str(&text)?;
    let params = config.compile_params()?;

    let usable: Vec<RawTrip> = rows.iter().filter(|r| !r.is_zero_length()).cloned().collect();
    let batch = compile_batch(&usable, &params);
    Ok(summarize(rows.len(), rows.len() - usable.len(), &batch))
}

fn summarize(rows: usize, zero_length: usize, batch: &CompiledBatch) -> CompileSummary {
    let meters: f64 = batch.trips.iter().map(|t| t.route_distance_meters()).sum();
    let earliest = batch
        .trips
        .iter()
        .map(|t| t.visible_start_seconds)
        .reduce(f64::min);
    let latest = batch
        .trips
        .iter()
        .map(|t| t.visible_end_seconds)
        .reduce(f64::max);
    CompileSummary {
        rows,
        zero_length,
        compiled: batch.trips.len(),
        dropped: batch.dropped,
        total_route_km: meters / 1000.0,
        earliest_visible_seconds: earliest,
        latest_visible_seconds: latest,
    }
}
