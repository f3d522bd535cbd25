//! External process driver.
//!
//! Launches a vision binary for one capture attempt, streams its stdout line
//! by line, and reports how it ended. Two completion styles exist:
//!
//! | Completion | Binary kind | End of attempt |
//! |------------|-------------|----------------|
//! | `Sentinel` | SSL-Vision (templated config) | a marker line on stdout, then we kill it |
//! | `Exit`     | processor (config file arg)   | natural process exit |
//!
//! Launch failures are fatal. A non-zero exit code is only logged: whether an
//! attempt was good is decided by the captured detection count.
//!
//! No timeout is enforced; a hung process stalls its worker.

use crate::error::{Error, Result};
use std::ffi::OsString;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

/// How an attempt signals that the binary is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Done once this exact stdout line (without newline) appears
    Sentinel(String),
    /// Done when the process exits
    Exit,
}

/// Everything needed to start one run of an external binary.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(OsString, OsString)>,
    pub completion: Completion,
    /// Delay after spawn before the post-launch hook runs
    pub warmup: Option<Duration>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            completion: Completion::Exit,
            warmup: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn completion(mut self, completion: Completion) -> Self {
        self.completion = completion;
        self
    }

    pub fn warmup(mut self, warmup: Duration) -> Self {
        self.warmup = Some(warmup);
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
    }
}

/// Why the process stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Sentinel line seen; we terminated the process
    Sentinel,
    /// Process exited on its own
    Natural,
}

/// Outcome of one process run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Termination {
    /// Exit code, `None` when ended by a signal
    pub exit_code: Option<i32>,
    pub reason: TerminationReason,
}

/// Runs external binaries for capture attempts.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessDriver;

impl ProcessDriver {
    pub fn new() -> Self {
        Self
    }

    /// Run `spec` to completion.
    ///
    /// `after_warmup` runs once, `spec.warmup` after spawn (immediately if no
    /// warm-up is set). Every stdout line is passed to `consumer`.
    pub fn run<H, C>(&self, spec: &LaunchSpec, after_warmup: H, mut consumer: C) -> Result<Termination>
    where
        H: FnOnce() -> Result<()>,
        C: FnMut(&str),
    {
        let mut child = spec.command().spawn().map_err(|source| Error::Launch {
            program: spec.program.clone(),
            source,
        })?;
        log::debug!("Launched {} (pid {})", spec.program.display(), child.id());

        if let Some(warmup) = spec.warmup {
            std::thread::sleep(warmup);
        }
        if let Err(e) = after_warmup() {
            stop(&mut child, &spec.program);
            return Err(e);
        }

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                stop(&mut child, &spec.program);
                return Err(Error::Other("child stdout was not captured".to_string()));
            }
        };

        let mut reason = TerminationReason::Natural;
        for line in BufReader::new(stdout).lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    // Non UTF-8 output is not fatal; the sentinel is plain ASCII
                    log::debug!("Unreadable output from {}: {}", spec.program.display(), e);
                    continue;
                }
            };
            consumer(&line);

            if let Completion::Sentinel(sentinel) = &spec.completion {
                if line == *sentinel {
                    reason = TerminationReason::Sentinel;
                    break;
                }
            }
        }

        if reason == TerminationReason::Sentinel {
            if let Err(e) = child.kill() {
                log::debug!("Kill after sentinel failed for {}: {}", spec.program.display(), e);
            }
        } else if matches!(spec.completion, Completion::Sentinel(_)) {
            log::warn!(
                "{} closed stdout before the sentinel line",
                spec.program.display()
            );
        }

        let status = child.wait()?;
        let termination = Termination {
            exit_code: status.code(),
            reason,
        };

        match reason {
            TerminationReason::Sentinel => log::debug!(
                "{} stopped after sentinel: {}",
                spec.program.display(),
                describe_exit(status.code())
            ),
            TerminationReason::Natural if status.code() != Some(0) => log::warn!(
                "Nonzero return code from {}: {}",
                spec.program.display(),
                describe_exit(status.code())
            ),
            TerminationReason::Natural => {}
        }

        Ok(termination)
    }
}

fn stop(child: &mut Child, program: &Path) {
    if let Err(e) = child.kill() {
        log::debug!("Failed to kill {}: {}", program.display(), e);
    }
    let _ = child.wait();
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "terminated by signal".to_string(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn shell(script: &str) -> LaunchSpec {
        LaunchSpec::new("/bin/sh").arg("-c").arg(script)
    }

    #[test]
    fn test_natural_exit_reports_code() {
        let mut lines = Vec::new();
        let termination = ProcessDriver::new()
            .run(&shell("echo one; echo two; exit 3"), || Ok(()), |l| {
                lines.push(l.to_string())
            })
            .unwrap();

        assert_eq!(lines, vec!["one", "two"]);
        assert_eq!(termination.exit_code, Some(3));
        assert_eq!(termination.reason, TerminationReason::Natural);
    }

    #[test]
    fn test_sentinel_stops_long_running_process() {
        let spec = shell("echo frame; echo 'End of video stream reached'; sleep 30")
            .completion(Completion::Sentinel("End of video stream reached".to_string()));

        let start = std::time::Instant::now();
        let termination = ProcessDriver::new().run(&spec, || Ok(()), |_| {}).unwrap();

        assert_eq!(termination.reason, TerminationReason::Sentinel);
        // Stopped by the driver, so no exit code of its own
        assert_eq!(termination.exit_code, None);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_eof_before_sentinel_is_natural() {
        let spec = shell("echo nothing here")
            .completion(Completion::Sentinel("End of video stream reached".to_string()));
        let termination = ProcessDriver::new().run(&spec, || Ok(()), |_| {}).unwrap();

        assert_eq!(termination.reason, TerminationReason::Natural);
        assert_eq!(termination.exit_code, Some(0));
    }

    #[test]
    fn test_hook_runs_after_warmup() {
        let hooked = Cell::new(false);
        let spec = shell("exit 0").warmup(Duration::from_millis(20));
        let start = std::time::Instant::now();

        ProcessDriver::new()
            .run(
                &spec,
                || {
                    assert!(start.elapsed() >= Duration::from_millis(20));
                    hooked.set(true);
                    Ok(())
                },
                |_| {},
            )
            .unwrap();

        assert!(hooked.get());
    }

    #[test]
    fn test_working_dir_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let spec = shell("pwd; echo $DRISHTI_TEST")
            .working_dir(dir.path())
            .env("DRISHTI_TEST", "offscreen");

        let mut lines = Vec::new();
        ProcessDriver::new()
            .run(&spec, || Ok(()), |l| lines.push(l.to_string()))
            .unwrap();

        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(Path::new(&lines[0]).canonicalize().unwrap(), expected);
        assert_eq!(lines[1], "offscreen");
    }

    #[test]
    fn test_missing_binary_is_launch_error() {
        let spec = LaunchSpec::new("/nonexistent/vision-binary");
        let result = ProcessDriver::new().run(&spec, || Ok(()), |_| {});
        assert!(matches!(result, Err(Error::Launch { .. })));
    }

    #[test]
    fn test_hook_error_propagates() {
        let spec = shell("sleep 30");
        let result = ProcessDriver::new().run(
            &spec,
            || Err(Error::Other("geometry send failed".to_string())),
            |_| {},
        );
        assert!(matches!(result, Err(Error::Other(_))));
    }
}
