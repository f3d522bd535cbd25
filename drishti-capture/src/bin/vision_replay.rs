//! Replay a recorded detection sequence over UDP multicast.
//!
//! Sends the geometry once, then every detection frame with the recorded
//! inter-frame delays multiplied by the speed factor.
//!
//! # Usage
//!
//! ```bash
//! vision_replay geometry.yml 1.0 clip.vision.yml
//! vision_replay geometry.yml 2.0 clip.json --ip 224.5.23.2 --port 10006
//! ```

use clap::Parser;
use drishti_capture::geometry::load_geometry;
use drishti_capture::records::DetectionLog;
use drishti_capture::{AppConfig, MulticastAddress, MulticastSocket, ReplayScheduler};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Vision replay
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Geometry configuration file
    geometry: PathBuf,

    /// Replay speed factor (multiplies recorded delays)
    speed: f64,

    /// Vision detections file (YAML or JSON)
    detections: PathBuf,

    /// Multicast group to send to
    #[arg(long, default_value = "224.5.23.2")]
    ip: Ipv4Addr,

    /// UDP port (defaults to [network] port)
    #[arg(long)]
    port: Option<u16>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match AppConfig::load_or_default(args.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();

    if let Err(e) = run(&args, &config) {
        log::error!("{}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run(args: &Args, config: &AppConfig) -> drishti_capture::Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        r.store(false, Ordering::Relaxed);
    })
    .map_err(|e| drishti_capture::Error::Other(format!("Error setting Ctrl-C handler: {}", e)))?;

    let geometry = load_geometry(&args.geometry)?;
    let detections = DetectionLog::load(&args.detections)?;

    let address = MulticastAddress::new(args.ip, args.port.unwrap_or(config.network.port));
    let socket = MulticastSocket::sender(address, &config.network)?;
    log::info!("Replaying {} to {}", args.detections.display(), address);

    let summary = ReplayScheduler::new(args.speed)
        .with_stop_flag(running)
        .replay(&socket, &geometry, &detections)?;

    log::info!(
        "Sent {} packets over {:.2}s",
        summary.packets_sent,
        summary.total_delay.as_secs_f64()
    );
    Ok(())
}
