//! End-to-end behaviour of the threaded monitor against in-memory collaborators.

use poolwatch_core::mocks::{MockChannel, MockRecorder, RecorderCall};
use poolwatch_core::util::wait_until;
use poolwatch_core::{
    ConnectionStatus, Device, DeviceId, Monitor, MonitorError, SessionOutcome, SessionStatus,
    Timings, TopicScheme,
};
use poolwatch_traits::{Clock, ManualClock};
use rstest::rstest;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(5);

fn timings() -> Timings {
    Timings {
        connect_timeout: Duration::from_millis(150),
        session_timeout: Duration::from_millis(600),
        grace_period: Duration::from_millis(300),
        remote_call_timeout: Duration::from_millis(400),
        drain_timeout: Duration::from_millis(200),
    }
}

struct Rig {
    monitor: Monitor,
    channel: MockChannel,
    recorder: MockRecorder,
}

fn rig_with(t: Timings) -> Rig {
    let channel = MockChannel::new();
    let recorder = MockRecorder::new();
    let monitor = Monitor::builder()
        .with_channel(channel.clone())
        .with_recorder(recorder.clone())
        .with_timings(t)
        .build()
        .unwrap();
    Rig {
        monitor,
        channel,
        recorder,
    }
}

fn rig() -> Rig {
    rig_with(timings())
}

fn session_status(m: &Monitor, d: &DeviceId) -> Option<SessionStatus> {
    m.session_of(d).map(|s| s.status)
}

fn wait_session(m: &Monitor, d: &DeviceId, want: SessionStatus) -> bool {
    wait_until(|| session_status(m, d) == Some(want), WAIT, POLL)
}

#[test]
fn repeated_ensure_keeps_one_handle() {
    let r = rig();
    let p1 = DeviceId::new("p1");
    for _ in 0..5 {
        r.monitor.ensure(&p1).unwrap();
    }
    assert_eq!(r.channel.subscribe_count("pool/p1"), 1);
    assert_eq!(r.channel.live_count("pool/p1"), 1);
}

#[test]
fn concurrent_ensure_keeps_one_handle() {
    let r = Arc::new(rig());
    let p1 = DeviceId::new("p1");
    let threads: Vec<_> = (0..8)
        .map(|_| {
            let r = Arc::clone(&r);
            let p1 = p1.clone();
            std::thread::spawn(move || r.monitor.ensure(&p1).unwrap())
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
    assert_eq!(r.channel.subscribe_count("pool/p1"), 1);
    assert_eq!(r.channel.live_count("pool/p1"), 1);
}

#[test]
fn connect_timeout_then_message() {
    let r = rig();
    let p1 = DeviceId::new("p1");
    r.monitor.ensure(&p1).unwrap();
    assert_eq!(r.monitor.status_of(&p1), ConnectionStatus::Connecting);

    assert!(wait_until(
        || r.monitor.status_of(&p1) == ConnectionStatus::Disconnected,
        WAIT,
        POLL
    ));
    // The subscription survives the timeout.
    assert_eq!(r.channel.publish("pool/p1", "ph=7.4"), 1);
    assert!(wait_until(
        || r.monitor.status_of(&p1) == ConnectionStatus::Connected,
        WAIT,
        POLL
    ));
    let conn = r.monitor.connection_of(&p1).unwrap();
    assert_eq!(conn.messages, 1);
    assert!(conn.last_message_at.is_some());
}

#[test]
fn concurrent_start_admits_one_session() {
    let r = Arc::new(rig());
    let p1 = DeviceId::new("p1");
    r.monitor.ensure(&p1).unwrap();
    let threads: Vec<_> = (0..6)
        .map(|_| {
            let r = Arc::clone(&r);
            let p1 = p1.clone();
            std::thread::spawn(move || r.monitor.start_session(&p1))
        })
        .collect();
    let results: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
    let ok = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(ok, 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(
            err.downcast_ref::<MonitorError>(),
            Some(&MonitorError::SessionActive(p1.clone()))
        );
    }
    assert!(wait_until(|| r.recorder.starts(&p1) == 1, WAIT, POLL));
}

#[test]
fn silent_session_completes_without_data() {
    let r = rig();
    let p1 = DeviceId::new("p1");
    r.monitor.start_session(&p1).unwrap();
    assert!(wait_session(&r.monitor, &p1, SessionStatus::Completed));

    let s = r.monitor.session_of(&p1).unwrap();
    assert_eq!(s.last_sample_at, None);
    assert_eq!(s.outcome, Some(SessionOutcome::NoDataReceived));
    assert_eq!(r.recorder.stops(&p1), 1);

    // Removed after grace; stop is never repeated.
    assert!(wait_until(
        || r.monitor.session_of(&p1).is_none(),
        WAIT,
        POLL
    ));
    assert_eq!(r.recorder.stops(&p1), 1);
}

#[test]
fn save_failure_does_not_block_later_samples() {
    let r = rig_with(Timings {
        session_timeout: Duration::from_secs(3),
        ..timings()
    });
    let p1 = DeviceId::new("p1");
    r.recorder.fail_save_number(2);
    r.monitor.start_session(&p1).unwrap();
    assert!(wait_session(&r.monitor, &p1, SessionStatus::WaitingForData));

    for payload in ["s1", "s2", "s3"] {
        r.channel.publish("pool/p1", payload);
    }
    assert!(wait_until(|| r.recorder.saves(&p1).len() == 3, WAIT, POLL));
    assert_eq!(
        r.recorder.saves(&p1),
        vec![b"s1".to_vec(), b"s2".to_vec(), b"s3".to_vec()]
    );
    assert!(wait_until(
        || r.monitor.session_of(&p1).is_some_and(|s| s.samples_saved == 2),
        WAIT,
        POLL
    ));
    let s = r.monitor.session_of(&p1).unwrap();
    assert_eq!(s.status, SessionStatus::DataReceived);
    assert!(s.error.is_some());
}

#[test]
fn release_drops_in_flight_messages() {
    let r = rig();
    let p1 = DeviceId::new("p1");
    r.monitor.ensure(&p1).unwrap();

    let ch = r.channel.clone();
    let publisher = std::thread::spawn(move || {
        for i in 0..200 {
            ch.publish("pool/p1", format!("m{i}"));
        }
    });
    r.monitor.release(&p1);
    publisher.join().unwrap();

    assert_eq!(r.monitor.status_of(&p1), ConnectionStatus::Idle);
    assert!(r.monitor.connection_of(&p1).is_none());
    assert_eq!(r.channel.live_count("pool/p1"), 0);
    assert_eq!(r.channel.publish("pool/p1", "late"), 0);
    // Idempotent.
    r.monitor.release(&p1);
}

#[test]
fn pool_a_scenario() {
    let r = rig_with(Timings {
        session_timeout: Duration::from_millis(1500),
        ..timings()
    });
    let pool_a = DeviceId::new("poolA");
    r.monitor.start_session(&pool_a).unwrap();
    assert!(wait_session(&r.monitor, &pool_a, SessionStatus::WaitingForData));

    r.channel.publish("pool/poolA", "sampleX");
    assert!(wait_session(&r.monitor, &pool_a, SessionStatus::DataReceived));
    let s = r.monitor.session_of(&pool_a).unwrap();
    assert!(s.last_sample_at.is_some());
    assert_eq!(r.monitor.status_of(&pool_a), ConnectionStatus::Connected);

    assert!(wait_session(&r.monitor, &pool_a, SessionStatus::Completed));
    let s = r.monitor.session_of(&pool_a).unwrap();
    assert_eq!(s.outcome, Some(SessionOutcome::DataSaved { samples: 1 }));
    assert_eq!(r.recorder.stops(&pool_a), 1);
    assert_eq!(
        r.recorder.calls(),
        vec![
            RecorderCall::Start(pool_a.clone()),
            RecorderCall::Save(
                pool_a.clone(),
                poolwatch_core::TelemetrySample::new("pool/poolA", "sampleX")
            ),
            RecorderCall::Stop(pool_a.clone()),
        ]
    );
}

#[test]
fn start_failure_is_terminal_and_expires() {
    let r = rig();
    let p1 = DeviceId::new("p1");
    r.recorder.fail_start(true);
    r.monitor.start_session(&p1).unwrap();
    assert!(wait_session(&r.monitor, &p1, SessionStatus::Failed));
    let s = r.monitor.session_of(&p1).unwrap();
    assert!(matches!(s.outcome, Some(SessionOutcome::Failed(_))));
    assert!(wait_until(
        || r.monitor.session_of(&p1).is_none(),
        WAIT,
        POLL
    ));
    assert_eq!(r.recorder.stops(&p1), 0);
}

#[test]
fn slow_start_times_out() {
    let r = rig();
    let p1 = DeviceId::new("p1");
    r.recorder.set_delay(Duration::from_millis(800));
    r.monitor.start_session(&p1).unwrap();
    assert!(wait_session(&r.monitor, &p1, SessionStatus::Failed));
    let s = r.monitor.session_of(&p1).unwrap();
    assert_eq!(s.error.as_deref(), Some("start recording timed out"));
}

#[test]
fn stop_failure_still_completes() {
    let r = rig();
    let p1 = DeviceId::new("p1");
    r.recorder.fail_stop(true);
    r.monitor.start_session(&p1).unwrap();
    assert!(wait_session(&r.monitor, &p1, SessionStatus::Completed));
    let s = r.monitor.session_of(&p1).unwrap();
    assert!(s.error.is_some());
    assert_eq!(s.outcome, Some(SessionOutcome::NoDataReceived));
}

#[test]
fn cancel_discards_without_grace() {
    let r = rig();
    let p1 = DeviceId::new("p1");
    r.monitor.start_session(&p1).unwrap();
    assert!(wait_session(&r.monitor, &p1, SessionStatus::WaitingForData));
    r.monitor.cancel_session(&p1).unwrap();
    assert!(r.monitor.session_of(&p1).is_none());
    assert!(wait_until(|| r.recorder.stops(&p1) == 1, WAIT, POLL));

    let err = r.monitor.cancel_session(&p1).unwrap_err();
    assert_eq!(
        err.downcast_ref::<MonitorError>(),
        Some(&MonitorError::NoActiveSession(p1.clone()))
    );
    // A new session may start straight away.
    r.monitor.start_session(&p1).unwrap();
}

/// Rig whose stop call is still in flight when the returned device is handed back.
fn stop_in_flight() -> (Rig, DeviceId) {
    let r = rig_with(Timings {
        remote_call_timeout: Duration::from_millis(1500),
        ..timings()
    });
    let p1 = DeviceId::new("p1");
    r.recorder.set_delay(Duration::from_millis(300));
    r.monitor.start_session(&p1).unwrap();
    assert!(wait_until(|| r.recorder.stops(&p1) == 1, WAIT, POLL));
    (r, p1)
}

#[test]
fn cancel_while_timeout_stop_in_flight_stops_once() {
    let (r, p1) = stop_in_flight();
    r.monitor.cancel_session(&p1).unwrap();
    assert!(r.monitor.session_of(&p1).is_none());
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(r.recorder.stops(&p1), 1);
    assert!(r.monitor.session_of(&p1).is_none());
}

#[test]
fn shutdown_while_timeout_stop_in_flight_stops_once() {
    let (r, p1) = stop_in_flight();
    r.monitor.shutdown();
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(r.recorder.stops(&p1), 1);
    assert_eq!(r.channel.total_live(), 0);
}

#[test]
fn cancel_unknown_device_reports_no_session() {
    let r = rig();
    let err = r.monitor.cancel_session(&DeviceId::new("ghost")).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<MonitorError>(),
        Some(MonitorError::NoActiveSession(_))
    ));
}

#[test]
fn transport_error_then_ensure_resubscribes() {
    let r = rig();
    let p1 = DeviceId::new("p1");
    r.monitor.ensure(&p1).unwrap();
    r.channel.publish("pool/p1", "x");
    assert!(wait_until(
        || r.monitor.status_of(&p1) == ConnectionStatus::Connected,
        WAIT,
        POLL
    ));
    r.channel.transport_error("pool/p1", "broker gone");
    assert!(wait_until(
        || r.monitor.status_of(&p1) == ConnectionStatus::Error,
        WAIT,
        POLL
    ));

    r.monitor.ensure(&p1).unwrap();
    assert_eq!(r.monitor.status_of(&p1), ConnectionStatus::Connecting);
    assert_eq!(r.channel.subscribe_count("pool/p1"), 2);
    assert_eq!(r.channel.live_count("pool/p1"), 1);
}

#[test]
fn subscribe_failure_surfaces_and_can_retry() {
    let r = rig();
    let p1 = DeviceId::new("p1");
    r.channel.fail_next_subscribes(1);
    let err = r.monitor.ensure(&p1).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<MonitorError>(),
        Some(MonitorError::Subscribe { .. })
    ));
    assert_eq!(r.monitor.status_of(&p1), ConnectionStatus::Error);
    r.monitor.ensure(&p1).unwrap();
    assert_eq!(r.monitor.status_of(&p1), ConnectionStatus::Connecting);
}

#[test]
fn shutdown_releases_every_handle() {
    let r = rig();
    for id in ["a", "b", "c"] {
        r.monitor.ensure(&DeviceId::new(id)).unwrap();
    }
    r.monitor.start_session(&DeviceId::new("b")).unwrap();
    assert_eq!(r.channel.total_live(), 3);

    r.monitor.shutdown();
    assert_eq!(r.channel.total_live(), 0);
    assert_eq!(r.channel.unsubscribe_count(), 3);
    assert!(r.monitor.snapshot_all().is_empty());
    assert!(wait_until(
        || r.recorder.stops(&DeviceId::new("b")) == 1,
        WAIT,
        POLL
    ));
    r.monitor.shutdown();
}

#[test]
fn injected_clock_stamps_but_timers_run_in_real_time() {
    let clock = ManualClock::new();
    let channel = MockChannel::new();
    let monitor = Monitor::builder()
        .with_channel(channel.clone())
        .with_recorder(MockRecorder::new())
        .with_timings(Timings {
            connect_timeout: Duration::from_millis(100),
            ..timings()
        })
        .with_clock(Arc::new(clock.clone()))
        .build()
        .unwrap();
    let p1 = DeviceId::new("p1");
    monitor.ensure(&p1).unwrap();
    assert!(wait_until(
        || monitor.status_of(&p1) == ConnectionStatus::Disconnected,
        WAIT,
        POLL
    ));

    clock.advance(Duration::from_secs(60));
    let stamp = clock.now();
    monitor.ensure(&p1).unwrap();
    channel.publish("pool/p1", "x");
    assert!(wait_until(
        || monitor.status_of(&p1) == ConnectionStatus::Connected,
        WAIT,
        POLL
    ));
    assert_eq!(
        monitor.connection_of(&p1).and_then(|c| c.last_message_at),
        Some(stamp)
    );
}

#[test]
fn ensure_racing_shutdown_leaves_no_live_handle() {
    for round in 0..20 {
        let r = Arc::new(rig());
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let r = Arc::clone(&r);
                let id = DeviceId::new(format!("d{round}-{i}"));
                std::thread::spawn(move || {
                    // Either subscribes before shutdown or is refused.
                    if let Err(e) = r.monitor.ensure(&id) {
                        assert!(matches!(
                            e.downcast_ref::<MonitorError>(),
                            Some(MonitorError::ShutDown)
                        ));
                    }
                })
            })
            .collect();
        r.monitor.shutdown();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(r.channel.total_live(), 0, "round {round}");
        assert!(r.monitor.snapshot_all().is_empty());
    }
}

#[test]
fn drop_releases_handles() {
    let r = rig();
    r.monitor.ensure(&DeviceId::new("a")).unwrap();
    let channel = r.channel.clone();
    drop(r);
    assert_eq!(channel.total_live(), 0);
}

#[test]
fn events_follow_status_changes() {
    let channel = MockChannel::new();
    let (builder, events) = Monitor::builder().with_events();
    let monitor = builder
        .with_channel(channel.clone())
        .with_recorder(MockRecorder::new())
        .with_timings(Timings {
            connect_timeout: Duration::from_secs(5),
            ..timings()
        })
        .build()
        .unwrap();
    let p1 = DeviceId::new("p1");
    monitor.ensure(&p1).unwrap();
    channel.publish("pool/p1", "x");

    let mut seen = Vec::new();
    while let Ok(ev) = events.recv_timeout(Duration::from_secs(2)) {
        seen.push(ev.connection);
        if ev.connection == ConnectionStatus::Connected {
            break;
        }
    }
    assert_eq!(
        seen,
        vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]
    );
}

#[test]
fn sync_devices_reconciles_set() {
    let r = rig();
    r.monitor.ensure(&DeviceId::new("old")).unwrap();
    let wanted = vec![
        Device::new("a", "Pool A"),
        Device::new("b", "Pool B").with_topic_key("b-sensor"),
    ];
    r.monitor.sync_devices(&wanted).unwrap();

    let ids: Vec<String> = r
        .monitor
        .snapshot_all()
        .into_iter()
        .map(|s| s.device.to_string())
        .collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert_eq!(r.channel.live_count("pool/old"), 0);
    assert_eq!(r.channel.live_count("pool/b-sensor"), 1);
}

#[rstest]
#[case("pool", "poolA", "pool/poolA")]
#[case("site1/pools/", "p9", "site1/pools/p9")]
fn topic_prefix_is_applied(#[case] prefix: &str, #[case] id: &str, #[case] topic: &str) {
    let channel = MockChannel::new();
    let monitor = Monitor::builder()
        .with_channel(channel.clone())
        .with_recorder(MockRecorder::new())
        .with_topics(TopicScheme::new(prefix))
        .build()
        .unwrap();
    monitor.ensure(&DeviceId::new(id)).unwrap();
    assert_eq!(channel.live_count(topic), 1);
}
