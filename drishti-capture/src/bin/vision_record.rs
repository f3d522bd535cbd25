//! Record vision detections for a list of media items.
//!
//! Each job runs the configured binary against one media file until the
//! number of captured detection frames matches the expected frame count,
//! then writes the frames next to the media.
//!
//! # Usage
//!
//! ```bash
//! vision_record jobs.toml
//! vision_record jobs.toml --config drishti.toml --workers 8
//! ```

use clap::Parser;
use drishti_capture::jobs::{run_jobs, JobFile};
use drishti_capture::{AddressAllocator, AppConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// Vision recorder
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Job file (TOML, one [[job]] per media item)
    jobs: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of parallel workers (overrides [capture] workers)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Give up on a media item after this many attempts
    #[arg(long)]
    max_attempts: Option<u32>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match AppConfig::load_or_default(args.config.as_ref()) {
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

    if let Some(workers) = args.workers {
        config.capture.workers = workers;
    }
    if args.max_attempts.is_some() {
        config.capture.max_attempts = args.max_attempts;
    }

    match run(&args, &config) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args, config: &AppConfig) -> drishti_capture::Result<bool> {
    let job_file = JobFile::load(&args.jobs)?;
    log::info!(
        "Loaded {} jobs from {} ({} workers)",
        job_file.jobs.len(),
        args.jobs.display(),
        config.capture.workers
    );

    let allocator = Arc::new(AddressAllocator::new(
        config.network.group_base,
        config.network.port,
    )?);
    let reports = run_jobs(job_file.jobs, config, allocator);

    let mut failed = 0;
    for report in &reports {
        match &report.outcome {
            Ok(recorded) => log::info!(
                "{}: {} frames in {} attempt(s) -> {}",
                report.media.display(),
                recorded.frames,
                recorded.attempts,
                recorded.output.display()
            ),
            Err(e) => {
                failed += 1;
                log::error!("{}: {}", report.media.display(), e);
            }
        }
    }

    log::info!("{} of {} jobs recorded", reports.len() - failed, reports.len());
    Ok(failed == 0)
}
