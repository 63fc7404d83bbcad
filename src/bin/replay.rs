use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use flate2::read::GzDecoder;
use platform_telemetry::codec::FrameCodec;
use platform_telemetry::config::AppConfig;
use platform_telemetry::connection::{ConnectionState, LinkStats, SessionFrame};
use platform_telemetry::pipeline::{PipelineInputs, TelemetryPipeline};
use serde_json::json;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

#[derive(Parser, Debug)]
struct Args {
    /// Raw serial capture (optionally .gz)
    #[arg(long, conflicts_with = "capture_dir")]
    capture: Option<PathBuf>,

    /// Directory of captures to batch replay (*.log, *.txt, *.gz)
    #[arg(long)]
    capture_dir: Option<PathBuf>,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bytes handed to the decoder per read
    #[arg(long, default_value = "64")]
    chunk_bytes: usize,

    /// Seconds between reads at the capture's line rate
    #[arg(long, default_value = "0.005")]
    chunk_period: f64,
}

fn load_capture(path: &Path) -> anyhow::Result<Vec<u8>> {
    let file = File::open(path)?;
    let mut bytes = Vec::new();
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        BufReader::new(GzDecoder::new(file)).read_to_end(&mut bytes)?;
    } else {
        BufReader::new(file).read_to_end(&mut bytes)?;
    }
    Ok(bytes)
}

fn run_once(path: &Path, config: &AppConfig, args: &Args) -> anyhow::Result<serde_json::Value> {
    let bytes = load_capture(path)?;
    let mut codec = FrameCodec::new(config.frame.clone());

    let (frames_tx, frames) = mpsc::channel(config.pipeline.queue_capacity);
    let (_commands_tx, commands) = mpsc::channel(1);
    let (_state_tx, connection) = watch::channel(ConnectionState::Connected {
        port: path.display().to_string(),
    });
    let mut pipeline = TelemetryPipeline::new(
        config,
        PipelineInputs {
            frames,
            commands,
            connection,
            link: Arc::new(LinkStats::default()),
        },
    );

    let mut max_speed: f64 = 0.0;
    let mut tick = |pipeline: &mut TelemetryPipeline| {
        let snapshot = pipeline.tick();
        max_speed = max_speed.max(snapshot.ball.speed());
        snapshot
    };

    for (i, chunk) in bytes.chunks(args.chunk_bytes).enumerate() {
        let received_at = i as f64 * args.chunk_period;
        for frame in codec.decode(chunk, received_at).filter_map(Result::ok) {
            let mut pending = SessionFrame { session: 1, frame };
            // a full queue is drained by ticking, as the live runner would
            loop {
                match frames_tx.try_send(pending) {
                    Ok(()) => break,
                    Err(TrySendError::Full(back)) => {
                        tick(&mut pipeline);
                        pending = back;
                    }
                    Err(TrySendError::Closed(_)) => anyhow::bail!("pipeline queue closed"),
                }
            }
        }

        // advance the ball to the capture clock
        while pipeline.latest().sim_time < received_at {
            tick(&mut pipeline);
        }
    }

    let mut snapshot = tick(&mut pipeline);
    while frames_tx.capacity() < frames_tx.max_capacity() {
        snapshot = tick(&mut pipeline);
    }

    let stats = codec.stats();
    let summary = pipeline.error_summary();
    let g = snapshot.gravity;

    Ok(json!({
        "capture": path.display().to_string(),
        "comparison": config.pipeline.comparison,
        "bytes": bytes.len(),
        "frames": stats.frames,
        "frame_errors": stats.errors,
        "bytes_skipped": stats.bytes_skipped,
        "imu_primary_frames": snapshot.health.imu1.samples,
        "imu_secondary_frames": snapshot.health.imu2.samples,
        "servo_frames": snapshot.health.servo.samples,
        "ignored_frames": snapshot.ignored_frames,
        "paired": snapshot.pairing.paired,
        "pairing_drop_rate": snapshot.pairing.drop_rate,
        "pairing_degraded": snapshot.pairing.degraded,
        "error_samples": summary.count,
        "error_mean": summary.mean,
        "error_rms": summary.rms,
        "gravity": [g.x, g.y, g.z],
        "gravity_rejected": pipeline.gravity_rejected(),
        "physics_steps": snapshot.tick,
        "sim_time": snapshot.sim_time,
        "ball_position": [snapshot.ball.position.x, snapshot.ball.position.y],
        "ball_max_speed": max_speed,
        "bounces": snapshot.bounces
    }))
}

fn is_capture(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    name.ends_with(".log") || name.ends_with(".txt") || name.ends_with(".gz")
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if args.chunk_bytes == 0 {
        anyhow::bail!("--chunk-bytes must be positive");
    }
    let config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    let mut results = Vec::new();

    if let Some(dir) = args.capture_dir.as_ref() {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && is_capture(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        for path in paths {
            match run_once(&path, &config, &args) {
                Ok(res) => results.push(res),
                Err(e) => eprintln!("Failed {}: {}", path.display(), e),
            }
        }
    } else if let Some(capture) = args.capture.as_ref() {
        results.push(run_once(capture, &config, &args)?);
    } else {
        anyhow::bail!("Provide --capture or --capture-dir");
    }

    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}
