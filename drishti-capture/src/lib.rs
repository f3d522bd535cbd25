//! Drishti capture - record and replay SSL-Vision detection streams
//!
//! Drives an external vision binary (SSL-Vision or a detection processor)
//! against recorded media, captures the UDP multicast detections it emits,
//! and replays captured sequences with their original timing.
//!
//! ```text
//! AddressAllocator ─► CaptureSession ─► ProcessDriver ─► ConvergenceLoop ─► DetectionLog
//!                                                                              │
//!                                             ReplayScheduler ◄────────────────┘
//! ```
//!
//! Every concurrent worker captures on its own multicast group, so many
//! recordings can run side by side without cross-talk.

pub mod allocator;
pub mod config;
pub mod convergence;
pub mod driver;
pub mod error;
pub mod geometry;
pub mod jobs;
pub mod proto;
pub mod records;
pub mod replay;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use allocator::{AddressAllocator, MulticastAddress};
pub use config::AppConfig;
pub use convergence::{
    capture_until_complete, BinarySource, Converged, ConvergenceLoop, DetectionSource, RetryPolicy,
};
pub use driver::{Completion, LaunchSpec, ProcessDriver, Termination, TerminationReason};
pub use error::{Error, Result};
pub use proto::{DetectionFrame, FieldKey, GeometryData, Payload, WrapperPacket};
pub use replay::{ReplayScheduler, ReplaySummary};
pub use session::{with_session, CaptureSession, PacketStore};
pub use transport::{MulticastSocket, PacketSink};
