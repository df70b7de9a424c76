//! End-to-end tests over real loopback UDP with synthetic capture and
//! collecting renders.

use chrono::TimeDelta;
use std::net::UdpSocket;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use syncwave::audio::device::DeviceHandle;
use syncwave::audio::mock::{CaptureCounters, CollectingRender, RenderLog, SyntheticCapture};
use syncwave::audio::source::FrameSource;
use syncwave::config::AppConfig;
use syncwave::endpoints::{BroadcastSession, CalibrationStatus, EndpointId, EndpointTarget};
use syncwave::error::{CalibrationError, CaptureError, EndpointError, Error, SessionError};
use syncwave::protocol::{ControlMessage, Datagram, SampleFormat, StreamFormat};
use syncwave::SessionClock;

fn format() -> StreamFormat {
    StreamFormat::new(48000, 2, SampleFormat::I16)
}

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.playout.nominal_delay_ms = 80;
    config.jitter.target_depth = 4;
    config
}

fn session_with(capture: SyntheticCapture) -> (BroadcastSession, Arc<CaptureCounters>) {
    let counters = capture.counters();
    let clock = SessionClock::new();
    let source = FrameSource::new(Box::new(capture), clock, Duration::from_millis(10));
    let session = BroadcastSession::new(config(), clock, source).unwrap();
    (session, counters)
}

fn session() -> (BroadcastSession, Arc<CaptureCounters>) {
    session_with(SyntheticCapture::new(format()))
}

fn add_local(session: &BroadcastSession, id: &str) -> RenderLog {
    let (render, log) = CollectingRender::new();
    add_render(session, id, render);
    log
}

fn add_render(session: &BroadcastSession, id: &str, render: CollectingRender) {
    session
        .add_endpoint(
            EndpointId::new(id),
            EndpointTarget::Local {
                device: DeviceHandle::new(format!("output:{}", id)),
                render: Box::new(render),
            },
        )
        .unwrap();
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn test_manual_delay_shifts_playout() {
    let (session, _) = session();
    let a = add_local(&session, "a");
    let b = add_local(&session, "b");
    session
        .set_delay(&EndpointId::new("b"), TimeDelta::milliseconds(30))
        .unwrap();

    session.start().unwrap();
    assert!(wait_until(Duration::from_secs(3), || a.len() > 120 && b.len() > 120));
    session.stop();

    let mut compared = 0;
    for marker in 10..50 {
        let (Some(ta), Some(tb)) = (a.first_with_marker(marker), b.first_with_marker(marker)) else {
            continue;
        };
        let skew = tb.duration_since(ta).as_secs_f64() * 1e3 - 30.0;
        assert!(skew.abs() <= 20.0, "frame {} skew {:.1} ms", marker, skew);
        compared += 1;
    }
    assert!(compared >= 30, "only {} frames compared", compared);
    assert!(a.opens() >= 1);
    assert_eq!(a.opens(), a.closes());
}

#[test]
fn test_frames_rendered_in_capture_order() {
    let (session, _) = session();
    let log = add_local(&session, "a");
    session.start().unwrap();
    assert!(wait_until(Duration::from_secs(3), || log.len() > 60));
    session.stop();

    let markers: Vec<u64> = log.frames().iter().filter_map(|f| f.marker).collect();
    assert!(markers.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(markers.first(), Some(&0));
}

#[test]
fn test_repeated_start_stop_releases_everything() {
    let (session, counters) = session();
    for cycle in 1..=5 {
        let log = add_local(&session, "a");
        session.start().unwrap();
        assert!(session.is_running());
        assert!(wait_until(Duration::from_secs(2), || !log.is_empty()));
        session.stop();

        assert!(!session.is_running());
        assert!(session.endpoint_ids().is_empty());
        assert!(counters.balanced());
        assert_eq!(counters.opens.load(Ordering::SeqCst), cycle);
        assert_eq!(log.opens(), log.closes());
    }
}

#[test]
fn test_start_twice_fails() {
    let (session, _) = session();
    session.start().unwrap();
    assert!(matches!(
        session.start(),
        Err(Error::Session(SessionError::AlreadyRunning))
    ));
    session.stop();
    session.stop();
}

#[test]
fn test_readded_endpoint_starts_fresh() {
    let (session, _) = session();
    let id = EndpointId::new("kitchen");
    add_local(&session, "kitchen");
    session.set_volume(&id, 0.3).unwrap();
    session.set_delay(&id, TimeDelta::milliseconds(40)).unwrap();

    assert!(matches!(
        session.add_endpoint(id.clone(), EndpointTarget::Remote("127.0.0.1:9".parse().unwrap())),
        Err(Error::Endpoint(EndpointError::AlreadyExists(_)))
    ));

    session.remove_endpoint(&id).unwrap();
    assert!(matches!(
        session.remove_endpoint(&id),
        Err(Error::Endpoint(EndpointError::NotFound(_)))
    ));

    add_local(&session, "kitchen");
    let snapshot = session.endpoint_snapshot(&id).unwrap();
    assert_eq!(snapshot.volume, 1.0);
    assert_eq!(snapshot.delay_ms, 0.0);
    assert_eq!(snapshot.calibration, CalibrationStatus::Uncalibrated);
}

#[test]
fn test_volume_out_of_range_rejected() {
    let (session, _) = session();
    let id = EndpointId::new("a");
    add_local(&session, "a");
    assert!(matches!(
        session.set_volume(&id, 1.2),
        Err(Error::Endpoint(EndpointError::InvalidVolume(_)))
    ));
    assert_eq!(session.endpoint_snapshot(&id).unwrap().volume, 1.0);
}

#[test]
fn test_endpoint_added_mid_session_receives_audio() {
    let (session, _) = session();
    let first = add_local(&session, "first");
    session.start().unwrap();
    assert!(wait_until(Duration::from_secs(2), || !first.is_empty()));

    let late = add_local(&session, "late");
    assert!(wait_until(Duration::from_secs(2), || late.len() > 10));
    session.stop();
}

#[test]
fn test_remote_endpoint_receives_hello_and_audio() {
    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    receiver
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let addr = receiver.local_addr().unwrap();

    let (session, _) = session();
    let id = EndpointId::new("remote");
    session.add_endpoint(id.clone(), EndpointTarget::Remote(addr)).unwrap();
    session.start().unwrap();

    let mut buf = [0u8; 2048];
    let (len, _) = receiver.recv_from(&mut buf).unwrap();
    let stream_id = match Datagram::decode(&buf[..len]).unwrap() {
        Datagram::Control(ControlMessage::Hello { session: name, stream_id }) => {
            assert_eq!(name, session.id().to_string());
            stream_id
        }
        other => panic!("expected hello, got {:?}", other),
    };

    let mut audio = 0;
    while audio < 10 {
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        if let Datagram::Audio(packet) = Datagram::decode(&buf[..len]).unwrap() {
            assert_eq!(packet.stream_id, stream_id);
            assert_eq!(packet.format(), format());
            audio += 1;
        }
    }

    session.set_volume(&id, 0.5).unwrap();
    let mut saw_volume = false;
    for _ in 0..500 {
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        if let Datagram::Control(ControlMessage::SetVolume { volume }) =
            Datagram::decode(&buf[..len]).unwrap()
        {
            assert_eq!(volume, 0.5);
            saw_volume = true;
            break;
        }
    }
    assert!(saw_volume);

    assert!(matches!(
        session.calibrate(&id),
        Err(Error::Calibration(CalibrationError::NotCalibratable(_)))
    ));
    session.stop();
}

#[test]
fn test_calibration_measures_output_latency() {
    let (session, _) = session();
    let id = EndpointId::new("speaker");
    let (render, log) = CollectingRender::with_latency(Duration::from_millis(50));
    add_render(&session, "speaker", render);
    let (other, _) = CollectingRender::new();
    add_render(&session, "other", other);

    session.start().unwrap();
    let latency = session.calibrate(&id).unwrap();
    let ms = latency.num_microseconds().unwrap() as f64 / 1e3;
    assert!((ms - 50.0).abs() < 5.0, "calibrated to {:.2} ms", ms);

    let snapshot = session.endpoint_snapshot(&id).unwrap();
    assert_eq!(snapshot.calibration, CalibrationStatus::Calibrated);
    assert!((snapshot.latency_ms.unwrap() - ms).abs() < 0.001);
    // The slowest endpoint is not held back
    assert_eq!(snapshot.delay_ms, 0.0);
    assert_eq!(snapshot.compensation_ms, 0.0);
    // Playback carried on during the run
    assert!(!log.is_empty());

    // The faster endpoint waits out the difference
    let other = session.endpoint_snapshot(&EndpointId::new("other")).unwrap();
    assert_eq!(other.calibration, CalibrationStatus::Uncalibrated);
    assert!((other.compensation_ms - ms).abs() < 0.001);
    session.stop();
}

#[test]
fn test_calibrated_endpoints_audible_together() {
    let (session, _) = session();
    let (render, slow) = CollectingRender::with_latency(Duration::from_millis(100));
    add_render(&session, "slow", render);
    let (render, fast) = CollectingRender::with_latency(Duration::ZERO);
    add_render(&session, "fast", render);

    session.start().unwrap();
    let slow_latency = session.calibrate(&EndpointId::new("slow")).unwrap();
    let fast_latency = session.calibrate(&EndpointId::new("fast")).unwrap();
    assert!((slow_latency.num_milliseconds() - 100).abs() <= 5);
    assert!(fast_latency.num_milliseconds() <= 5);

    // Let the new alignment settle, then compare what was heard
    let from = slow.last_marker().unwrap_or(0).max(fast.last_marker().unwrap_or(0)) + 20;
    assert!(wait_until(Duration::from_secs(3), || {
        slow.last_marker().unwrap_or(0) > from + 40 && fast.last_marker().unwrap_or(0) > from + 40
    }));
    session.stop();

    let mut compared = 0;
    for marker in from..from + 40 {
        let (Some(ts), Some(tf)) = (
            slow.first_audible_with_marker(marker),
            fast.first_audible_with_marker(marker),
        ) else {
            continue;
        };
        let skew = if ts > tf { ts - tf } else { tf - ts };
        assert!(
            skew <= Duration::from_millis(20),
            "frame {} audible {:.1} ms apart",
            marker,
            skew.as_secs_f64() * 1e3
        );
        compared += 1;
    }
    assert!(compared >= 30, "only {} frames compared", compared);
}

#[test]
fn test_delay_beyond_limit_rejected() {
    let (session, _) = session();
    let id = EndpointId::new("a");
    add_local(&session, "a");
    session.set_delay(&id, TimeDelta::milliseconds(-2000)).unwrap();

    for delay in [TimeDelta::milliseconds(2001), TimeDelta::MAX, TimeDelta::MIN] {
        assert!(matches!(
            session.set_delay(&id, delay),
            Err(Error::Endpoint(EndpointError::InvalidDelay { .. }))
        ));
    }
    assert_eq!(session.endpoint_snapshot(&id).unwrap().delay_ms, -2000.0);
}

#[test]
fn test_calibration_without_feedback_keeps_delay() {
    let (session, _) = session();
    let id = EndpointId::new("mute");
    add_local(&session, "mute");
    session.set_delay(&id, TimeDelta::milliseconds(15)).unwrap();

    assert!(matches!(
        session.calibrate(&id),
        Err(Error::Session(SessionError::NotRunning))
    ));

    session.start().unwrap();
    assert!(matches!(
        session.calibrate(&id),
        Err(Error::Calibration(CalibrationError::NoFeedback))
    ));
    let snapshot = session.endpoint_snapshot(&id).unwrap();
    assert_eq!(snapshot.calibration, CalibrationStatus::Failed);
    assert_eq!(snapshot.delay_ms, 15.0);
    session.stop();
}

#[test]
fn test_removing_endpoint_cancels_calibration() {
    let (session, _) = session();
    let session = Arc::new(session);
    let id = EndpointId::new("speaker");
    let (render, _log) = CollectingRender::with_latency(Duration::from_millis(20));
    add_render(&session, "speaker", render);
    session.start().unwrap();

    let runner = {
        let session = session.clone();
        let id = id.clone();
        thread::spawn(move || session.calibrate(&id))
    };
    assert!(wait_until(Duration::from_secs(2), || {
        session.snapshot().calibrating.is_some()
    }));
    session.remove_endpoint(&id).unwrap();

    let result = runner.join().unwrap();
    assert!(
        matches!(result, Err(Error::Calibration(CalibrationError::Cancelled))),
        "{:?}",
        result
    );
    session.stop();
}

#[test]
fn test_concurrent_stop() {
    let (session, counters) = session();
    let session = Arc::new(session);
    let a = add_local(&session, "a");
    add_local(&session, "b");
    session.start().unwrap();
    assert!(wait_until(Duration::from_secs(2), || a.len() > 5));

    let stoppers: Vec<_> = (0..4)
        .map(|_| {
            let session = session.clone();
            thread::spawn(move || session.stop())
        })
        .collect();
    session.stop();
    for stopper in stoppers {
        stopper.join().unwrap();
    }

    assert!(!session.is_running());
    assert!(session.endpoint_ids().is_empty());
    assert!(counters.balanced());
    assert_eq!(a.opens(), a.closes());
}

#[test]
fn test_capture_loss_stops_session() {
    let (session, counters) = session_with(SyntheticCapture::new(format()).fail_after(20));
    let log = add_local(&session, "a");
    session.start().unwrap();

    assert!(wait_until(Duration::from_secs(3), || !session.is_running()));
    assert!(matches!(
        session.fatal_error(),
        Some(CaptureError::Unavailable(_))
    ));
    assert!(session.endpoint_ids().is_empty());
    assert!(counters.balanced());
    assert_eq!(log.opens(), log.closes());
    assert!(session.snapshot().fatal.is_some());

    // The session can be started again
    session.start().unwrap();
    assert!(session.fatal_error().is_none());
    session.stop();
}

#[test]
fn test_format_change_is_fatal() {
    let capture = SyntheticCapture::new(format());
    let switch = capture.format_switch();
    let (session, _) = session_with(capture);
    session.start().unwrap();
    thread::sleep(Duration::from_millis(50));

    *switch.lock() = StreamFormat::new(44100, 2, SampleFormat::I16);
    assert!(wait_until(Duration::from_secs(2), || !session.is_running()));
    assert!(matches!(
        session.fatal_error(),
        Some(CaptureError::FormatChanged { .. })
    ));
    session.stop();
}

#[test]
fn test_snapshot_serializes_to_json() {
    let (session, _) = session();
    add_local(&session, "a");
    session
        .add_endpoint(
            EndpointId::new("b"),
            EndpointTarget::Remote("127.0.0.1:9".parse().unwrap()),
        )
        .unwrap();

    let json = serde_json::to_value(session.snapshot()).unwrap();
    assert_eq!(json["running"], false);
    assert_eq!(json["endpoints"].as_array().unwrap().len(), 2);
    assert_eq!(json["endpoints"][0]["id"], "a");
    assert_eq!(json["endpoints"][1]["address"], "udp://127.0.0.1:9");
}
