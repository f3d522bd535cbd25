//! Replay of a recorded detection sequence with its original timing.
//!
//! Geometry goes out first, exactly once. Then each record is wrapped and
//! sent, followed by a sleep of `(t_capture - previous) * speed`, where
//! `previous` starts at 0. Negative or non-finite delays (out-of-order
//! timestamps, speed ≤ 0) collapse to an immediate send.
//!
//! ```text
//! t_capture:  0.0        0.5              1.5
//! speed 2.0:  send─0s─►send──1.0s──►send──2.0s──►done
//! ```

use crate::error::Result;
use crate::proto::{DetectionFrame, WrapperPacket};
use crate::transport::PacketSink;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Longest single sleep while a stop flag is attached
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Blocking wait between packets
pub trait Sleeper {
    fn sleep(&mut self, duration: Duration);
}

/// Sleeps the calling thread
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Result of a finished replay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Geometry packet included
    pub packets_sent: usize,
    pub total_delay: Duration,
    /// False if stopped early through the stop flag
    pub completed: bool,
}

/// Re-emits detection records at their recorded pace.
pub struct ReplayScheduler<S = ThreadSleeper> {
    speed: f64,
    sleeper: S,
    running: Option<Arc<AtomicBool>>,
}

impl ReplayScheduler {
    pub fn new(speed: f64) -> Self {
        Self {
            speed,
            sleeper: ThreadSleeper,
            running: None,
        }
    }
}

impl<S: Sleeper> ReplayScheduler<S> {
    pub fn with_sleeper<T: Sleeper>(self, sleeper: T) -> ReplayScheduler<T> {
        ReplayScheduler {
            speed: self.speed,
            sleeper,
            running: self.running,
        }
    }

    /// Stop once `running` turns false, also in the middle of a long delay
    pub fn with_stop_flag(mut self, running: Arc<AtomicBool>) -> Self {
        self.running = Some(running);
        self
    }

    pub fn sleeper(&self) -> &S {
        &self.sleeper
    }

    /// Send `geometry`, then every record in order with scaled delays.
    pub fn replay(
        &mut self,
        sink: &dyn PacketSink,
        geometry: &WrapperPacket,
        records: &[DetectionFrame],
    ) -> Result<ReplaySummary> {
        sink.send(geometry)?;
        let mut summary = ReplaySummary {
            packets_sent: 1,
            total_delay: Duration::ZERO,
            completed: true,
        };

        log::info!(
            "Replaying {} detection frames at speed factor {}",
            records.len(),
            self.speed
        );

        let mut previous = 0.0;
        for record in records {
            if !self.is_running() {
                log::info!("Replay stopped after {} packets", summary.packets_sent);
                summary.completed = false;
                break;
            }

            sink.send(&WrapperPacket::from_detection(record.clone()))?;
            summary.packets_sent += 1;

            let delay = scaled_delay(record.t_capture - previous, self.speed);
            log::trace!(
                "Sent frame {} (t_capture {:.3}), next in {:?}",
                record.frame_number,
                record.t_capture,
                delay
            );
            summary.total_delay += self.pause(delay);
            previous = record.t_capture;
        }

        Ok(summary)
    }

    /// Sleep for `delay`, in slices when a stop flag is attached. Returns the time slept.
    fn pause(&mut self, delay: Duration) -> Duration {
        if self.running.is_none() {
            self.sleeper.sleep(delay);
            return delay;
        }

        let mut slept = Duration::ZERO;
        while slept < delay && self.is_running() {
            let slice = (delay - slept).min(STOP_POLL_INTERVAL);
            self.sleeper.sleep(slice);
            slept += slice;
        }
        slept
    }

    fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .map_or(true, |flag| flag.load(Ordering::Relaxed))
    }
}

/// Delay following each record, in send order
pub fn replay_delays(records: &[DetectionFrame], speed: f64) -> Vec<Duration> {
    let mut previous = 0.0;
    records
        .iter()
        .map(|record| {
            let delay = scaled_delay(record.t_capture - previous, speed);
            previous = record.t_capture;
            delay
        })
        .collect()
}

fn scaled_delay(delta_secs: f64, speed: f64) -> Duration {
    Duration::try_from_secs_f64(delta_secs * speed).unwrap_or(Duration::ZERO)
}
