//! Capture and replay over real multicast sockets.
//!
//! Packets go through the loopback interface. Each test first checks that a
//! group can be joined and a packet looped back; where that is not possible
//! (no multicast route, sandboxed network) the test returns early.

use drishti_capture::config::NetworkConfig;
use drishti_capture::{
    capture_until_complete, with_session, AddressAllocator, CaptureSession, DetectionFrame,
    DetectionSource, FieldKey, GeometryData, MulticastAddress, PacketSink, ReplayScheduler,
    RetryPolicy, Termination, TerminationReason, WrapperPacket,
};
use std::net::Ipv4Addr;
use std::thread;
use std::time::{Duration, Instant};

const PORT: u16 = 10916;

fn network() -> NetworkConfig {
    NetworkConfig {
        port: PORT,
        recv_timeout_ms: 20,
        ..NetworkConfig::default()
    }
}

fn allocator(third_octet: u8) -> AddressAllocator<u32> {
    AddressAllocator::new(Ipv4Addr::new(239, 255, third_octet, 0), PORT).unwrap()
}

fn wait_for(session: &CaptureSession, key: FieldKey, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while session.count_for(key) < count && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
}

/// Join a scratch group next to the test's own and loop one packet back
fn multicast_loopback_works(third_octet: u8) -> bool {
    let address = MulticastAddress::new(Ipv4Addr::new(239, 255, third_octet, 200), PORT);
    let looped = CaptureSession::open(address, &network()).and_then(|session| {
        session.send(&WrapperPacket::from_detection(DetectionFrame::at(0, 0, 0.0)))?;
        wait_for(&session, FieldKey::Detection, 1);
        Ok(session.count_for(FieldKey::Detection) >= 1)
    });

    match looped {
        Ok(true) => true,
        Ok(false) => {
            eprintln!("multicast loopback on {} delivered nothing, skipping", address);
            false
        }
        Err(e) => {
            eprintln!("cannot join {}: {}, skipping", address, e);
            false
        }
    }
}

/// Sends `per_attempt[n - 1]` detections from inside the session.
///
/// Frame numbers are `attempt * 100 + i` so the attempt a record came from
/// can be told apart.
struct LoopbackSource {
    per_attempt: Vec<u32>,
}

impl DetectionSource for LoopbackSource {
    fn run_attempt(
        &mut self,
        session: &CaptureSession,
        attempt: u32,
    ) -> drishti_capture::Result<Termination> {
        let frames = self.per_attempt[(attempt - 1) as usize];
        for n in 0..frames {
            let frame = DetectionFrame::at(attempt * 100 + n, 0, 0.0);
            session.send(&WrapperPacket::from_detection(frame))?;
        }
        wait_for(session, FieldKey::Detection, frames as usize);
        Ok(Termination {
            exit_code: Some(0),
            reason: TerminationReason::Natural,
        })
    }
}

#[test]
fn session_counts_looped_back_packets() {
    if !multicast_loopback_works(42) {
        return;
    }
    let address = allocator(42).address_for(1).unwrap();

    let ((), store) = with_session(address, &network(), |session| {
        for n in 0..3 {
            session.send(&WrapperPacket::from_detection(DetectionFrame::at(n, 0, 0.0)))?;
        }
        wait_for(session, FieldKey::Detection, 3);
        Ok(())
    })
    .unwrap();

    let numbers: Vec<_> = store
        .drain_detections()
        .iter()
        .map(|f| f.frame_number)
        .collect();
    assert_eq!(numbers, vec![0, 1, 2]);
}

#[test]
fn sessions_on_different_groups_are_isolated() {
    if !multicast_loopback_works(43) {
        return;
    }
    let allocator = allocator(43);
    let a = CaptureSession::open(allocator.address_for(1).unwrap(), &network()).unwrap();
    let b = CaptureSession::open(allocator.address_for(2).unwrap(), &network()).unwrap();

    a.send(&WrapperPacket::from_detection(DetectionFrame::at(0, 0, 0.0)))
        .unwrap();
    wait_for(&a, FieldKey::Detection, 1);
    thread::sleep(Duration::from_millis(50));

    assert_eq!(a.count_for(FieldKey::Detection), 1);
    assert_eq!(b.count_for(FieldKey::Detection), 0);
}

#[test]
fn convergence_over_multicast() {
    if !multicast_loopback_works(44) {
        return;
    }
    let mut source = LoopbackSource {
        per_attempt: vec![0, 2, 1],
    };

    let converged = capture_until_complete(
        &mut source,
        allocator(44).address_for(1).unwrap(),
        &network(),
        1,
        FieldKey::Detection,
        RetryPolicy::at_most(5),
    )
    .unwrap();

    assert_eq!(converged.attempts, 3);
    let numbers: Vec<_> = converged
        .into_detections()
        .iter()
        .map(|f| f.frame_number)
        .collect();
    assert_eq!(numbers, vec![300]);
}

#[test]
fn earlier_attempt_packets_are_not_carried_over() {
    if !multicast_loopback_works(46) {
        return;
    }
    // Attempt 1 alone would match 2; with carry-over attempt 2 would count 3
    let mut source = LoopbackSource {
        per_attempt: vec![1, 2],
    };

    let converged = capture_until_complete(
        &mut source,
        allocator(46).address_for(1).unwrap(),
        &network(),
        2,
        FieldKey::Detection,
        RetryPolicy::at_most(2),
    )
    .unwrap();

    assert_eq!(converged.attempts, 2);
    let numbers: Vec<_> = converged
        .into_detections()
        .iter()
        .map(|f| f.frame_number)
        .collect();
    assert_eq!(numbers, vec![200, 201]);
}

#[test]
fn replay_into_capture_session() {
    if !multicast_loopback_works(45) {
        return;
    }
    let session = CaptureSession::open(allocator(45).address_for(1).unwrap(), &network()).unwrap();
    let records: Vec<_> = [0.0, 0.01, 0.02]
        .iter()
        .enumerate()
        .map(|(i, t)| DetectionFrame::at(i as u32, 0, *t))
        .collect();

    let geometry = WrapperPacket::from_geometry(GeometryData::default());
    let summary = ReplayScheduler::new(1.0)
        .replay(&session, &geometry, &records)
        .unwrap();
    assert_eq!(summary.packets_sent, 4);

    wait_for(&session, FieldKey::Detection, 3);
    let store = session.close();
    assert_eq!(store.count_for(FieldKey::Geometry), 1);
    assert_eq!(store.drain_detections(), records);
}

#[cfg(unix)]
mod external_binary {
    use super::*;
    use drishti_capture::driver::Completion;
    use drishti_capture::records::DetectionLog;
    use drishti_capture::{BinarySource, LaunchSpec};

    fn shell(script: &str) -> LaunchSpec {
        LaunchSpec::new("/bin/sh").arg("-c").arg(script)
    }

    /// The replay binary stands in for a vision binary: the first launch
    /// sends nothing, every later one sends the recorded clip.
    #[test]
    fn binary_source_relaunches_until_converged() {
        if !multicast_loopback_works(47) {
            return;
        }
        let address = allocator(47).address_for(1).unwrap();
        let dir = tempfile::tempdir().unwrap();

        std::fs::write(
            dir.path().join("geometry.yml"),
            serde_yaml::to_string(&GeometryData::default()).unwrap(),
        )
        .unwrap();
        let clip = vec![DetectionFrame::at(7, 0, 0.0)];
        DetectionLog::save(dir.path().join("clip.yml"), &clip).unwrap();

        let script = format!(
            "if [ -f launched ]; then exec \"$0\" geometry.yml 1.0 clip.yml --ip {} --port {}; \
             else touch launched; fi",
            address.ip, address.port
        );
        let spec = shell(&script)
            .arg(env!("CARGO_BIN_EXE_vision_replay"))
            .working_dir(dir.path());

        let converged = capture_until_complete(
            &mut BinarySource::new(spec),
            address,
            &network(),
            1,
            FieldKey::Detection,
            RetryPolicy::at_most(5),
        )
        .unwrap();

        assert_eq!(converged.attempts, 2);
        assert_eq!(converged.into_detections(), clip);
    }

    #[test]
    fn binary_source_sends_geometry_after_warmup() {
        if !multicast_loopback_works(48) {
            return;
        }
        let address = allocator(48).address_for(1).unwrap();
        let sentinel = "End of video stream reached";
        let spec = shell(&format!("echo frame; echo '{}'; sleep 30", sentinel))
            .completion(Completion::Sentinel(sentinel.to_string()))
            .warmup(Duration::from_millis(20));

        let mut lines = Vec::new();
        let mut source = BinarySource::new(spec)
            .with_geometry(WrapperPacket::from_geometry(GeometryData::default()))
            .with_consumer(|line: &str| lines.push(line.to_string()));

        let start = Instant::now();
        let (termination, store) = with_session(address, &network(), |session| {
            let termination = source.run_attempt(session, 1)?;
            wait_for(session, FieldKey::Geometry, 1);
            Ok(termination)
        })
        .unwrap();
        drop(source);

        assert_eq!(termination.reason, TerminationReason::Sentinel);
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(store.count_for(FieldKey::Geometry), 1);
        assert_eq!(store.count_for(FieldKey::Detection), 0);
        assert_eq!(lines, vec!["frame", sentinel]);
    }
}
