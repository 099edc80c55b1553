//! Offline replay driver: feed a recorded event log through the engine.
//!
//! Reads a deployment config and a JSON event log (plain or gzipped),
//! runs one pipeline per tag, and writes `FusionResult` rows as JSONL.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use clap::Parser;
use flate2::read::GzDecoder;
use serde::Deserialize;

use tag_tracker_rs::{BleMeasurement, EngineConfig, FusionPipeline, ImuSample, TwrMeasurement};

#[derive(Parser, Debug)]
#[command(name = "replay")]
#[command(about = "Replay a recorded tag event log through the fusion engine")]
struct Args {
    /// Deployment config JSON (.json or .json.gz)
    #[arg(long)]
    config: PathBuf,

    /// Event log JSON (.json or .json.gz)
    #[arg(long)]
    log: PathBuf,

    /// Output JSONL path (defaults to stdout)
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Deserialize)]
struct Event {
    timestamp_ms: i64,
    tag_id: u32,
    #[serde(default)]
    ble: Vec<BleMeasurement>,
    #[serde(default)]
    twr: Vec<TwrMeasurement>,
    #[serde(default)]
    tag_height_m: f64,
    #[serde(default)]
    imu: Option<ImuSample>,
}

#[derive(Deserialize)]
struct EventLog {
    events: Vec<Event>,
}

fn load_events(path: &Path) -> anyhow::Result<EventLog> {
    let file = File::open(path)?;
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        let gz = GzDecoder::new(file);
        Ok(serde_json::from_reader(BufReader::new(gz))?)
    } else {
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = EngineConfig::load(&args.config)?;
    let world = config.build();
    let log = load_events(&args.log)?;

    let mut sink: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(std::io::stdout().lock()),
    };

    let mut pipelines: HashMap<u32, FusionPipeline> = HashMap::new();
    let mut flag_counts: HashMap<i32, usize> = HashMap::new();
    let mut imu_events = 0usize;

    for event in &log.events {
        let pipeline = pipelines
            .entry(event.tag_id)
            .or_insert_with(|| FusionPipeline::new(world.clone()));

        if let Some(imu) = &event.imu {
            pipeline.process_imu(imu.timestamp_ms, imu.cumulative_distance_m, imu.yaw_deg);
            imu_events += 1;
            continue;
        }

        let result = pipeline.process(
            event.timestamp_ms,
            event.tag_id,
            &event.ble,
            &event.twr,
            event.tag_height_m,
        );
        *flag_counts.entry(result.flag).or_insert(0) += 1;
        serde_json::to_writer(&mut sink, &result)?;
        sink.write_all(b"\n")?;
    }
    sink.flush()?;

    let mut flags: Vec<(i32, usize)> = flag_counts.into_iter().collect();
    flags.sort_unstable();
    eprintln!(
        "[{}] replayed {} events ({} IMU) for {} tag(s); flags: {:?}",
        Utc::now().format("%H:%M:%S%.3f"),
        log.events.len(),
        imu_events,
        pipelines.len(),
        flags
    );
    Ok(())
}
