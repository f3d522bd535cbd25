//! Recording jobs and the parallel worker pool.
//!
//! A job file lists media items to record:
//!
//! ```toml
//! [[job]]
//! media = "data/field_a/clip.mp4"
//! frames = 300
//! binary = "bin/vision"
//! args = ["-s", "-c", "1"]
//! working_dir = "data/field_a"
//! completion = "sentinel"
//! env = { QT_QPA_PLATFORM = "offscreen" }
//! config_template = "data/field_a/settings.xml.in"
//! config_path = "data/field_a/settings.xml"
//!
//! [[job]]
//! media = "data/field_a/still.png"
//! binary = "bin/processor"
//! args = ["{config}"]
//! geometry = "data/field_a/geometry.yml"
//! ```
//!
//! `{ip}`, `{port}`, `{media}` and `{config}` are substituted in args, env
//! values and the config template. Each worker thread gets its multicast
//! group from the shared allocator the first time it picks up a job and keeps
//! it for every later job.

use crate::allocator::{AddressAllocator, MulticastAddress};
use crate::config::{AppConfig, ProcessConfig};
use crate::convergence::{capture_until_complete, BinarySource, RetryPolicy};
use crate::driver::{Completion, LaunchSpec};
use crate::error::{Error, Result};
use crate::geometry::load_geometry;
use crate::proto::FieldKey;
use crate::records::{output_path_for, DetectionLog};
use crossbeam_channel::{bounded, unbounded};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How the job's binary signals completion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMode {
    Sentinel,
    #[default]
    Exit,
}

/// One media item to record.
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub media: PathBuf,
    /// Expected detection frames (1 for a still image)
    #[serde(default = "default_frames")]
    pub frames: usize,
    pub binary: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub completion: CompletionMode,
    /// Overrides `[process] sentinel`
    #[serde(default)]
    pub sentinel: Option<String>,
    /// Overrides `[process] warmup_ms`
    #[serde(default)]
    pub warmup_ms: Option<u64>,
    /// Geometry sent after warm-up
    #[serde(default)]
    pub geometry: Option<PathBuf>,
    #[serde(default)]
    pub config_template: Option<PathBuf>,
    #[serde(default)]
    pub config_path: Option<PathBuf>,
    /// Defaults to `<media stem>.<binary name>.yml`
    #[serde(default)]
    pub output: Option<PathBuf>,
}

fn default_frames() -> usize {
    1
}

/// Parsed job file
#[derive(Debug, Clone, Deserialize)]
pub struct JobFile {
    #[serde(rename = "job", default)]
    pub jobs: Vec<Job>,
}

impl JobFile {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }
}

impl Job {
    /// Output path for the recording
    pub fn output_path(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| output_path_for(&self.media, &self.binary))
    }

    fn substitute(&self, text: &str, address: &MulticastAddress) -> String {
        let config = self
            .config_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        text.replace("{ip}", &address.ip.to_string())
            .replace("{port}", &address.port.to_string())
            .replace("{media}", &self.media.display().to_string())
            .replace("{config}", &config)
    }

    /// Render the config template (if any) for `address`.
    pub fn prepare(&self, address: &MulticastAddress) -> Result<()> {
        let Some(template) = &self.config_template else {
            return Ok(());
        };
        let target = self.config_path.as_ref().ok_or_else(|| {
            Error::InvalidParameter(format!(
                "{}: config_template requires config_path",
                self.media.display()
            ))
        })?;

        let text = fs::read_to_string(template)?;
        fs::write(target, self.substitute(&text, address))?;
        log::debug!("Rendered {} for {}", target.display(), address);
        Ok(())
    }

    /// Launch description targeting `address`
    pub fn launch_spec(&self, address: &MulticastAddress, process: &ProcessConfig) -> LaunchSpec {
        let mut spec = LaunchSpec::new(&self.binary)
            .args(self.args.iter().map(|a| self.substitute(a, address)));

        for (key, value) in &self.env {
            spec = spec.env(key, self.substitute(value, address));
        }
        if let Some(dir) = &self.working_dir {
            spec = spec.working_dir(dir);
        }

        spec = match self.completion {
            CompletionMode::Sentinel => spec.completion(Completion::Sentinel(
                self.sentinel
                    .clone()
                    .unwrap_or_else(|| process.sentinel.clone()),
            )),
            CompletionMode::Exit => spec.completion(Completion::Exit),
        };

        // The processor kind needs time to open its socket before geometry arrives
        let warmup = match (self.warmup_ms, &self.geometry) {
            (Some(ms), _) => Some(Duration::from_millis(ms)),
            (None, Some(_)) => Some(process.warmup()),
            (None, None) => None,
        };
        if let Some(warmup) = warmup {
            spec = spec.warmup(warmup);
        }
        spec
    }
}

/// A successfully recorded job
#[derive(Debug, Clone)]
pub struct Recorded {
    pub output: PathBuf,
    pub frames: usize,
    pub attempts: u32,
    pub address: MulticastAddress,
}

/// Outcome of one job
#[derive(Debug)]
pub struct JobReport {
    /// Position in the job list
    pub index: usize,
    pub media: PathBuf,
    pub outcome: Result<Recorded>,
}

/// Record one job on the calling worker's multicast group
pub fn run_job(job: &Job, config: &AppConfig, allocator: &AddressAllocator) -> Result<Recorded> {
    let address = allocator.address_for_current_thread()?;
    log::info!("Recording {} on {}", job.media.display(), address);

    job.prepare(&address)?;
    let spec = job.launch_spec(&address, &config.process);

    let media = job.media.display().to_string();
    let mut source = BinarySource::new(spec)
        .with_consumer(move |line: &str| log::trace!("[{}] {}", media, line));
    if let Some(geometry) = &job.geometry {
        source = source.with_geometry(load_geometry(geometry)?);
    }

    let policy = RetryPolicy {
        max_attempts: config.capture.max_attempts,
    };
    let converged = capture_until_complete(
        &mut source,
        address,
        &config.network,
        job.frames,
        FieldKey::Detection,
        policy,
    )?;

    let attempts = converged.attempts;
    let frames = converged.into_detections();
    let output = job.output_path();
    DetectionLog::save(&output, &frames)?;

    Ok(Recorded {
        output,
        frames: frames.len(),
        attempts,
        address,
    })
}

/// Run `jobs` on `workers` threads. A failing job does not stop the others.
///
/// Reports come back in job order.
pub fn run_jobs(
    jobs: Vec<Job>,
    config: &AppConfig,
    allocator: Arc<AddressAllocator>,
) -> Vec<JobReport> {
    let workers = config.capture.workers.max(1).min(jobs.len().max(1));
    let (job_tx, job_rx) = bounded::<(usize, Job)>(workers);
    let (report_tx, report_rx) = unbounded::<JobReport>();

    thread::scope(|scope| {
        for worker in 0..workers {
            let job_rx = job_rx.clone();
            let report_tx = report_tx.clone();
            let allocator = Arc::clone(&allocator);
            let spawned = thread::Builder::new()
                .name(format!("record-worker-{}", worker))
                .spawn_scoped(scope, move || {
                    while let Ok((index, job)) = job_rx.recv() {
                        let outcome = run_job(&job, config, &allocator);
                        if let Err(e) = &outcome {
                            log::error!("{}: {}", job.media.display(), e);
                        }
                        let report = JobReport {
                            index,
                            media: job.media,
                            outcome,
                        };
                        if report_tx.send(report).is_err() {
                            break;
                        }
                    }
                });
            if let Err(e) = spawned {
                log::error!("Failed to spawn record worker {}: {}", worker, e);
            }
        }
        drop(job_rx);
        drop(report_tx);

        for (index, job) in jobs.into_iter().enumerate() {
            if let Err(e) = job_tx.send((index, job)) {
                log::error!("No worker left to take job {}", e.0 .0);
                break;
            }
        }
        drop(job_tx);
    });

    let mut reports: Vec<JobReport> = report_rx.into_iter().collect();
    reports.sort_by_key(|r| r.index);
    reports
}
