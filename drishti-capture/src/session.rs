//! Capture session: one multicast socket plus a receive thread.
//!
//! A session joins its group on open, accumulates every decoded payload in a
//! [`PacketStore`] keyed by payload kind, and leaves the group when it is
//! closed or dropped.
//!
//! ```text
//!  external process ──UDP──► MulticastSocket ──► receive thread ──► PacketStore
//!                                  ▲                                   │
//!  geometry (send) ────────────────┘                 count_for / drain_for
//! ```
//!
//! Malformed datagrams are logged and dropped; the convergence loop is the
//! only recovery mechanism for lost or garbled packets.

use crate::allocator::MulticastAddress;
use crate::config::NetworkConfig;
use crate::error::{Error, Result};
use crate::proto::{DetectionFrame, FieldKey, Payload, WrapperPacket};
use crate::transport::{MulticastSocket, PacketSink, MAX_DATAGRAM_SIZE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Consecutive receive errors after which the receive thread gives up
const MAX_RECV_ERRORS: u32 = 50;

/// Payloads received during one session, in arrival order per key.
#[derive(Debug, Default)]
pub struct PacketStore {
    entries: Mutex<HashMap<FieldKey, Vec<Payload>>>,
}

impl PacketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one datagram and append its payloads.
    ///
    /// Returns the number of payloads stored (0 for an empty wrapper).
    pub fn ingest(&self, datagram: &[u8]) -> Result<usize> {
        let packet = WrapperPacket::decode_datagram(datagram)?;
        let payloads = packet.into_payloads();
        let stored = payloads.len();

        let mut entries = self.entries.lock();
        for payload in payloads {
            entries.entry(payload.key()).or_default().push(payload);
        }
        Ok(stored)
    }

    /// Append an already decoded payload
    pub fn push(&self, payload: Payload) {
        self.entries
            .lock()
            .entry(payload.key())
            .or_default()
            .push(payload);
    }

    pub fn count_for(&self, key: FieldKey) -> usize {
        self.entries.lock().get(&key).map_or(0, Vec::len)
    }

    /// Remove and return everything stored under `key`
    pub fn drain_for(&self, key: FieldKey) -> Vec<Payload> {
        self.entries.lock().remove(&key).unwrap_or_default()
    }

    /// Move the contents out, leaving this store empty
    pub fn take(&self) -> PacketStore {
        let entries = std::mem::take(&mut *self.entries.lock());
        PacketStore {
            entries: Mutex::new(entries),
        }
    }

    /// Detection frames in arrival order, draining them
    pub fn drain_detections(&self) -> Vec<DetectionFrame> {
        self.drain_for(FieldKey::Detection)
            .into_iter()
            .filter_map(Payload::into_detection)
            .collect()
    }
}

/// Active capture on one multicast group.
pub struct CaptureSession {
    socket: Arc<MulticastSocket>,
    store: Arc<PacketStore>,
    running: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
}

impl CaptureSession {
    /// Join `address` and start receiving. The store starts empty.
    pub fn open(address: MulticastAddress, config: &NetworkConfig) -> Result<Self> {
        let socket = Arc::new(MulticastSocket::open(address, config)?);
        let store = Arc::new(PacketStore::new());
        let running = Arc::new(AtomicBool::new(true));

        let receiver = {
            let socket = Arc::clone(&socket);
            let store = Arc::clone(&store);
            let running = Arc::clone(&running);
            let backoff = config.recv_timeout();
            thread::Builder::new()
                .name(format!("capture-{}", address.ip))
                .spawn(move || receive_loop(&socket, &store, &running, backoff))
                .map_err(|e| Error::Other(format!("Failed to spawn capture thread: {}", e)))?
        };

        log::info!("Capture session open on {}", address);

        Ok(Self {
            socket,
            store,
            running,
            receiver: Some(receiver),
        })
    }

    pub fn address(&self) -> MulticastAddress {
        self.socket.address()
    }

    pub fn count_for(&self, key: FieldKey) -> usize {
        self.store.count_for(key)
    }

    pub fn drain_for(&self, key: FieldKey) -> Vec<Payload> {
        self.store.drain_for(key)
    }

    pub fn store(&self) -> &PacketStore {
        &self.store
    }

    /// Stop receiving, leave the group and hand the accumulated payloads over.
    pub fn close(mut self) -> PacketStore {
        self.shutdown();
        self.store.take()
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.receiver.take() {
            if handle.join().is_err() {
                log::error!("Capture thread for {} panicked", self.socket.address());
            }
            log::info!(
                "Capture session closed on {} ({} detections)",
                self.socket.address(),
                self.store.count_for(FieldKey::Detection)
            );
        }
        self.socket.leave();
    }
}

impl PacketSink for CaptureSession {
    fn send(&self, packet: &WrapperPacket) -> Result<()> {
        self.socket.send(packet)
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Open a session, run `work` against it, and close it on every exit path.
///
/// Returns the closure's value together with everything captured.
pub fn with_session<T, F>(
    address: MulticastAddress,
    config: &NetworkConfig,
    work: F,
) -> Result<(T, PacketStore)>
where
    F: FnOnce(&CaptureSession) -> Result<T>,
{
    let session = CaptureSession::open(address, config)?;
    // On error `session` is dropped here, which stops the thread and leaves the group
    let value = work(&session)?;
    Ok((value, session.close()))
}

/// Backs off after socket errors and gives up once they keep repeating.
#[derive(Debug)]
struct RecvErrors {
    consecutive: u32,
    backoff: Duration,
}

impl RecvErrors {
    fn new(backoff: Duration) -> Self {
        Self {
            consecutive: 0,
            backoff,
        }
    }

    fn reset(&mut self) {
        self.consecutive = 0;
    }

    /// Record one error. Returns false when the receive loop should stop.
    fn record(&mut self, address: MulticastAddress, error: &Error) -> bool {
        self.consecutive += 1;
        if self.consecutive >= MAX_RECV_ERRORS {
            log::error!(
                "Giving up on {} after {} consecutive recv errors: {}",
                address,
                self.consecutive,
                error
            );
            return false;
        }
        if self.consecutive == 1 {
            log::error!("UDP recv error on {}: {}", address, error);
        } else {
            log::debug!("UDP recv error #{} on {}: {}", self.consecutive, address, error);
        }
        thread::sleep(self.backoff);
        true
    }
}

fn receive_loop(
    socket: &MulticastSocket,
    store: &PacketStore,
    running: &AtomicBool,
    backoff: Duration,
) {
    let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut errors = RecvErrors::new(backoff);

    while running.load(Ordering::Acquire) {
        match socket.recv(&mut buffer) {
            Ok(Some(len)) => {
                errors.reset();
                handle_datagram(store, &buffer[..len], socket.address());
            }
            Ok(None) => errors.reset(),
            Err(e) => {
                if !errors.record(socket.address(), &e) {
                    return;
                }
            }
        }
    }

    // Pick up datagrams that were already queued when we were told to stop
    if let Err(e) = socket.set_nonblocking(true) {
        log::warn!("Failed to switch {} to non-blocking: {}", socket.address(), e);
        return;
    }
    while let Ok(Some(len)) = socket.recv(&mut buffer) {
        handle_datagram(store, &buffer[..len], socket.address());
    }
}

fn handle_datagram(store: &PacketStore, datagram: &[u8], address: MulticastAddress) {
    match store.ingest(datagram) {
        Ok(0) => log::trace!("Empty wrapper packet on {}", address),
        Ok(n) => log::trace!("Stored {} payload(s) from {} bytes on {}", n, datagram.len(), address),
        Err(e) => log::warn!("Dropping malformed datagram on {}: {}", address, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::GeometryData;
    use prost::Message as ProstMessage;

    fn detection_bytes(frame_number: u32, t_capture: f64) -> Vec<u8> {
        WrapperPacket::from_detection(DetectionFrame::at(frame_number, 0, t_capture))
            .encode_to_vec()
    }

    #[test]
    fn test_count_and_drain_in_arrival_order() {
        let store = PacketStore::new();
        for i in 0..5 {
            store.ingest(&detection_bytes(i, i as f64 * 0.1)).unwrap();
        }

        assert_eq!(store.count_for(FieldKey::Detection), 5);
        let frames = store.drain_detections();
        let numbers: Vec<_> = frames.iter().map(|f| f.frame_number).collect();
        assert_eq!(numbers, vec![0, 1, 2, 3, 4]);
        assert_eq!(store.count_for(FieldKey::Detection), 0);
    }

    #[test]
    fn test_other_keys_retained_separately() {
        let store = PacketStore::new();
        store.ingest(&detection_bytes(1, 0.0)).unwrap();
        store
            .ingest(&WrapperPacket::from_geometry(GeometryData::default()).encode_to_vec())
            .unwrap();

        assert_eq!(store.count_for(FieldKey::Detection), 1);
        assert_eq!(store.count_for(FieldKey::Geometry), 1);

        store.drain_for(FieldKey::Detection);
        assert_eq!(store.count_for(FieldKey::Geometry), 1);
    }

    #[test]
    fn test_malformed_datagram_is_rejected_without_side_effects() {
        let store = PacketStore::new();
        store.ingest(&detection_bytes(1, 0.0)).unwrap();

        assert!(store.ingest(&[0x0a, 0xff, 0xff, 0x03]).is_err());
        assert_eq!(store.count_for(FieldKey::Detection), 1);
    }

    #[test]
    fn test_empty_wrapper_stores_nothing() {
        let store = PacketStore::new();
        assert_eq!(store.ingest(&[]).unwrap(), 0);
        assert_eq!(store.count_for(FieldKey::Detection), 0);
        assert_eq!(store.count_for(FieldKey::Geometry), 0);
    }

    #[test]
    fn test_take_empties_source() {
        let store = PacketStore::new();
        store.ingest(&detection_bytes(1, 0.0)).unwrap();

        let taken = store.take();
        assert_eq!(taken.count_for(FieldKey::Detection), 1);
        assert_eq!(store.count_for(FieldKey::Detection), 0);
    }

    #[test]
    fn test_recv_errors_back_off_then_give_up() {
        let address = MulticastAddress::new(std::net::Ipv4Addr::new(224, 83, 83, 1), 10006);
        let error = Error::Io(std::io::Error::other("network down"));
        let mut errors = RecvErrors::new(Duration::from_millis(2));

        let start = std::time::Instant::now();
        for _ in 1..MAX_RECV_ERRORS {
            assert!(errors.record(address, &error));
        }
        assert!(start.elapsed() >= Duration::from_millis(2 * (MAX_RECV_ERRORS as u64 - 1)));
        assert!(!errors.record(address, &error));
    }

    #[test]
    fn test_recv_errors_reset_on_success() {
        let address = MulticastAddress::new(std::net::Ipv4Addr::new(224, 83, 83, 1), 10006);
        let error = Error::Other("transient".to_string());
        let mut errors = RecvErrors::new(Duration::ZERO);

        for _ in 1..MAX_RECV_ERRORS {
            assert!(errors.record(address, &error));
        }
        errors.reset();
        assert!(errors.record(address, &error));
    }

    #[test]
    fn test_concurrent_ingest_and_count() {
        let store = Arc::new(PacketStore::new());
        let writer = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..200 {
                    store.ingest(&detection_bytes(i, 0.0)).unwrap();
                }
            })
        };

        let mut last = 0;
        while !writer.is_finished() {
            let count = store.count_for(FieldKey::Detection);
            assert!(count >= last);
            last = count;
        }
        writer.join().unwrap();
        assert_eq!(store.count_for(FieldKey::Detection), 200);
    }
}
