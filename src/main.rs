use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use log::{info, warn};
use tokio::time::{interval, Duration, MissedTickBehavior};

use platform_telemetry::config::AppConfig;
use platform_telemetry::connection::{available_ports, PortOpener, SerialPortOpener};
use platform_telemetry::dashboard::start_dashboard;
use platform_telemetry::health_monitor::HealthMonitor;
use platform_telemetry::live_status::LiveStatus;
use platform_telemetry::service::TelemetryService;
use platform_telemetry::simulator::SimulatedPortOpener;

#[derive(Parser, Debug)]
#[command(name = "platform_telemetry")]
#[command(about = "Dual-IMU platform telemetry with gravity-driven ball simulation", long_about = None)]
struct Args {
    /// Duration in seconds (0 = continuous)
    #[arg(value_name = "SECONDS", default_value = "0")]
    duration: u64,

    /// Serial port to connect to (e.g. /dev/ttyUSB0, COM3)
    #[arg(long)]
    port: Option<String>,

    /// List available serial ports and exit
    #[arg(long)]
    list_ports: bool,

    /// Feed the pipeline from a simulated board instead of a serial port
    #[arg(long, conflicts_with = "port")]
    simulate: bool,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Initial gravity scale for the ball simulation
    #[arg(long)]
    gravity: Option<f64>,

    /// Output directory
    #[arg(long, default_value = "platform_sessions")]
    output_dir: String,

    /// Serve snapshots over HTTP/WebSocket on this port
    #[arg(long)]
    dashboard_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if args.list_ports {
        let ports = available_ports()?;
        if ports.is_empty() {
            println!("No serial ports found");
        }
        for port in ports {
            println!("{}", port);
        }
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    if let Some(port) = &args.port {
        config.serial.port = Some(port.clone());
    }
    if args.simulate && config.serial.port.is_none() {
        config.serial.port = Some("sim".to_string());
    }
    let Some(port) = config.serial.port.clone() else {
        bail!("No port given; pass --port, --simulate or --list-ports");
    };

    println!("[{}] Platform Telemetry Starting", ts_now());
    println!("  Duration: {} seconds (0=continuous)", args.duration);
    println!("  Port: {}{}", port, if args.simulate { " (simulated)" } else { "" });
    println!("  Comparison: {:?}", config.pipeline.comparison);
    println!("  Output Dir: {}", args.output_dir);

    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("creating {}", args.output_dir))?;

    let opener: Arc<dyn PortOpener> = if args.simulate {
        Arc::new(SimulatedPortOpener::new(
            config.simulator.clone(),
            config.frame.clone(),
        ))
    } else {
        Arc::new(SerialPortOpener)
    };
    let service = TelemetryService::start(&config, opener)?;

    if let Some(scale) = args.gravity {
        service.set_gravity_scale(scale)?;
    }

    if let Some(dashboard_port) = args.dashboard_port {
        let snapshots = service.subscribe();
        tokio::spawn(async move {
            if let Err(e) = start_dashboard(snapshots, dashboard_port).await {
                warn!("[DASHBOARD] Stopped: {}", e);
            }
        });
    }

    if let Err(e) = service.connect(&port) {
        // the service stays up in the Error state; the status file reports it
        warn!("{}", e);
    }

    let start = Utc::now();
    let status_path = format!("{}/live_status.json", args.output_dir);
    let mut status_ticker = interval(Duration::from_secs(2));
    status_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let deadline = async {
        if args.duration > 0 {
            tokio::time::sleep(Duration::from_secs(args.duration)).await;
        } else {
            std::future::pending::<()>().await;
        }
    };
    tokio::pin!(deadline);

    println!("[{}] Streaming...", ts_now());
    loop {
        tokio::select! {
            _ = &mut deadline => {
                println!("[{}] Duration reached, stopping...", ts_now());
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                println!("[{}] Interrupted, stopping...", ts_now());
                break;
            }
            _ = status_ticker.tick() => {
                let snapshot = service.snapshot();
                let status = LiveStatus::from_snapshot(&snapshot, uptime_secs(start));
                if let Err(e) = status.save(&status_path) {
                    warn!("Failed to write {}: {}", status_path, e);
                }
                info!(
                    "{} | {}",
                    snapshot.status_text,
                    HealthMonitor::format_status(&snapshot.health)
                );
            }
        }
    }

    let snapshot = service.snapshot();
    service.shutdown().await;

    let final_status = LiveStatus::from_snapshot(&snapshot, uptime_secs(start));
    let final_path = format!(
        "{}/live_status_{}_final.json",
        args.output_dir,
        ts_now_clean()
    );
    final_status.save(&final_path)?;
    println!("[{}] Final status saved to {}", ts_now(), final_path);

    println!("\n=== Summary ===");
    println!(
        "Frames: {} ({} errors, {} dropped)",
        snapshot.link.frames, snapshot.link.frame_errors, snapshot.link.queue_drops
    );
    println!(
        "Pairs: {} (drop rate {:.1}%)",
        snapshot.pairing.paired,
        snapshot.pairing.drop_rate * 100.0
    );
    if let Some(error) = &snapshot.latest_error {
        println!(
            "Last accel delta: [{:.3}, {:.3}, {:.3}] m/s²",
            error.delta_accel.x, error.delta_accel.y, error.delta_accel.z
        );
    }
    println!("Ball bounces: {}", snapshot.bounces);

    Ok(())
}

fn uptime_secs(start: chrono::DateTime<Utc>) -> u64 {
    Utc::now().signed_duration_since(start).num_seconds().max(0) as u64
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}

fn ts_now_clean() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}
