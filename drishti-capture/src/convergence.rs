//! Convergence loop: rerun the external binary until the capture is complete.
//!
//! UDP multicast from a freshly launched process is lossy: early datagrams
//! can go out before our group join completes, and packets get dropped under
//! load. The binary cannot resume a partial stream, so the unit of retry is a
//! whole launch:
//!
//! ```text
//! loop {
//!     open session (empty store)
//!     run binary against the session's group
//!     close session → store
//!     count(key) == expected ? return drained records : retry
//! }
//! ```
//!
//! Nothing from a short attempt is carried into the next one.

use crate::allocator::MulticastAddress;
use crate::config::NetworkConfig;
use crate::driver::{LaunchSpec, ProcessDriver, Termination};
use crate::error::{Error, Result};
use crate::proto::{DetectionFrame, FieldKey, Payload, WrapperPacket};
use crate::session::{with_session, CaptureSession, PacketStore};
use crate::transport::PacketSink;

/// Upper bound on attempts. Unbounded by default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn at_most(attempts: u32) -> Self {
        Self {
            max_attempts: Some(attempts),
        }
    }
}

/// Records of a converged capture
#[derive(Debug, Clone, PartialEq)]
pub struct Converged {
    /// Payloads for the subject key in arrival order
    pub records: Vec<Payload>,
    /// Attempts used, including the successful one
    pub attempts: u32,
}

impl Converged {
    pub fn into_detections(self) -> Vec<DetectionFrame> {
        self.records
            .into_iter()
            .filter_map(Payload::into_detection)
            .collect()
    }
}

/// Compares each attempt's count against the expected frame count.
#[derive(Debug, Clone)]
pub struct ConvergenceLoop {
    expected: usize,
    key: FieldKey,
    policy: RetryPolicy,
    label: String,
}

impl ConvergenceLoop {
    pub fn new(expected: usize, key: FieldKey) -> Self {
        Self {
            expected,
            key,
            policy: RetryPolicy::default(),
            label: String::from("capture"),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Name used in log lines (usually the media path)
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Run attempts until one yields exactly `expected` records for the key.
    ///
    /// `attempt` receives the 1-based attempt number and must return a store
    /// holding only that attempt's packets.
    pub fn run<F>(&self, mut attempt: F) -> Result<Converged>
    where
        F: FnMut(u32) -> Result<PacketStore>,
    {
        if self.expected == 0 {
            return Err(Error::InvalidParameter(format!(
                "{}: expected frame count must be at least 1",
                self.label
            )));
        }

        let mut n = 0u32;
        loop {
            n += 1;
            let store = attempt(n)?;
            let count = store.count_for(self.key);

            if count == self.expected {
                log::info!(
                    "{}: captured {} {} frame(s) after {} attempt(s)",
                    self.label,
                    count,
                    self.key,
                    n
                );
                return Ok(Converged {
                    records: store.drain_for(self.key),
                    attempts: n,
                });
            }

            log::warn!(
                "{}: {} size mismatch: expected {} got {}, repeating",
                self.label,
                self.key,
                self.expected,
                count
            );

            if let Some(max) = self.policy.max_attempts {
                if n >= max {
                    return Err(Error::RetriesExhausted {
                        attempts: n,
                        expected: self.expected,
                        last: count,
                    });
                }
            }
        }
    }
}

/// Something that produces detections on a session's group for one attempt.
pub trait DetectionSource {
    fn run_attempt(&mut self, session: &CaptureSession, attempt: u32) -> Result<Termination>;
}

/// Runs an external binary through [`ProcessDriver`].
///
/// If a geometry packet is set it is sent to the session once the launch
/// spec's warm-up has elapsed.
pub struct BinarySource<C = fn(&str)> {
    driver: ProcessDriver,
    spec: LaunchSpec,
    geometry: Option<WrapperPacket>,
    consumer: C,
}

impl BinarySource {
    pub fn new(spec: LaunchSpec) -> Self {
        Self {
            driver: ProcessDriver::new(),
            spec,
            geometry: None,
            consumer: discard,
        }
    }
}

impl<C: FnMut(&str)> BinarySource<C> {
    pub fn with_geometry(mut self, geometry: WrapperPacket) -> Self {
        self.geometry = Some(geometry);
        self
    }

    /// Receive every stdout line of the binary
    pub fn with_consumer<D: FnMut(&str)>(self, consumer: D) -> BinarySource<D> {
        BinarySource {
            driver: self.driver,
            spec: self.spec,
            geometry: self.geometry,
            consumer,
        }
    }
}

impl<C: FnMut(&str)> DetectionSource for BinarySource<C> {
    fn run_attempt(&mut self, session: &CaptureSession, attempt: u32) -> Result<Termination> {
        log::debug!(
            "Attempt {}: running {} against {}",
            attempt,
            self.spec.program.display(),
            session.address()
        );

        let geometry = self.geometry.as_ref();
        self.driver.run(
            &self.spec,
            || match geometry {
                Some(packet) => session.send(packet),
                None => Ok(()),
            },
            &mut self.consumer,
        )
    }
}

fn discard(_line: &str) {}

/// Capture from `source` on `address` until `expected` records arrive for `key`.
pub fn capture_until_complete<S: DetectionSource>(
    source: &mut S,
    address: MulticastAddress,
    config: &NetworkConfig,
    expected: usize,
    key: FieldKey,
    policy: RetryPolicy,
) -> Result<Converged> {
    ConvergenceLoop::new(expected, key)
        .with_policy(policy)
        .with_label(address.to_string())
        .run(|attempt| {
            let (termination, store) =
                with_session(address, config, |session| source.run_attempt(session, attempt))?;
            log::debug!("Attempt {} ended: {:?}", attempt, termination);
            Ok(store)
        })
}
