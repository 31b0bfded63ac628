//! Stop, teardown and failure behavior of relay sessions.

use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use transcript_relay::relay::error::SendError;
use transcript_relay::relay::{SessionCoordinator, SessionParts, SessionSettings};
use transcript_relay::stt::{MockRecognitionService, SessionParams};
use transcript_relay::{EndReason, ErrorReporter, SessionState};

fn settings() -> SessionSettings {
    SessionSettings {
        first_audio_grace: Duration::from_secs(2),
        poll_timeout: Duration::from_millis(25),
        keepalive_idle: Duration::from_millis(200),
        drain_timeout: Duration::from_millis(200),
        stop_timeout: Duration::from_millis(800),
        ..SessionSettings::default()
    }
}

#[derive(Default)]
struct CollectingReporter {
    reports: Mutex<Vec<(String, String)>>,
}

impl ErrorReporter for CollectingReporter {
    fn report(&self, component: &str, message: &str) {
        self.reports
            .lock()
            .unwrap()
            .push((component.to_string(), message.to_string()));
    }
}

#[test]
fn stop_with_hung_listener_ends_within_bound() {
    let service = Arc::new(MockRecognitionService::new().with_hung_listener());
    let settings = settings();
    let bound = settings.drain_timeout + settings.poll_timeout * 2;
    let coordinator = SessionCoordinator::new(service.clone(), SessionParams::default(), settings);
    let SessionParts {
        handle, mut audio, ..
    } = coordinator.start().unwrap();

    audio.push(vec![1, 2, 3]);
    thread::sleep(Duration::from_millis(80));
    assert_eq!(handle.state(), SessionState::Streaming);

    let started = Instant::now();
    assert!(handle.request_stop());
    let report = handle
        .await_termination(bound + Duration::from_millis(200))
        .expect("session should end despite the hung listener");

    assert!(started.elapsed() < bound + Duration::from_millis(200));
    assert_eq!(report.state, SessionState::Closed);
    assert_eq!(report.reason, EndReason::StopRequested);
    assert!(report.teardown_timed_out);
    assert_eq!(service.finish_count(), 1);
    assert!(coordinator.registry().is_empty());
}

#[test]
fn concurrent_stops_finish_the_connection_once() {
    let service = Arc::new(MockRecognitionService::new().with_final_on_finish("done"));
    let coordinator = SessionCoordinator::new(service.clone(), SessionParams::default(), settings());
    let SessionParts {
        handle, mut audio, ..
    } = coordinator.start().unwrap();

    audio.push(vec![7; 16]);
    thread::sleep(Duration::from_millis(60));

    let handle = Arc::new(handle);
    let barrier = Arc::new(Barrier::new(8));
    let callers: Vec<_> = (0..8)
        .map(|_| {
            let handle = handle.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                handle.request_stop()
            })
        })
        .collect();
    let winners = callers
        .into_iter()
        .map(|caller| caller.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);

    let report = handle
        .await_termination(Duration::from_secs(2))
        .expect("session should end");
    assert_eq!(report.reason, EndReason::StopRequested);
    assert_eq!(service.finish_count(), 1);
    assert!(!handle.request_stop());
}

#[test]
fn stop_before_first_audio_never_connects() {
    let service = Arc::new(MockRecognitionService::new());
    let coordinator = SessionCoordinator::new(service.clone(), SessionParams::default(), settings());
    let SessionParts { handle, .. } = coordinator.start().unwrap();
    assert_eq!(handle.state(), SessionState::AwaitingFirstAudio);

    let report = handle.stop().expect("session should end");
    assert_eq!(report.state, SessionState::Closed);
    assert_eq!(report.reason, EndReason::StopRequested);
    assert_eq!(service.connect_count(), 0);
    assert!(coordinator.registry().is_empty());
}

#[test]
fn connect_failure_fails_the_session() {
    let service = Arc::new(MockRecognitionService::new().with_connect_failures(3));
    let settings = SessionSettings {
        connect_attempts: 2,
        ..settings()
    };
    let coordinator = SessionCoordinator::new(service.clone(), SessionParams::default(), settings);
    let SessionParts {
        handle, mut audio, ..
    } = coordinator.start().unwrap();

    audio.push(vec![1]);
    let report = handle
        .await_termination(Duration::from_secs(3))
        .expect("session should end");

    assert_eq!(report.state, SessionState::Failed);
    assert_eq!(report.reason, EndReason::ConnectFailure);
    assert_eq!(service.connect_count(), 2);
    assert_eq!(report.frames_sent, 0);
}

#[test]
fn connect_retry_recovers_from_one_failure() {
    let service = Arc::new(MockRecognitionService::new().with_connect_failures(1));
    let settings = SessionSettings {
        connect_attempts: 3,
        ..settings()
    };
    let coordinator = SessionCoordinator::new(service.clone(), SessionParams::default(), settings);
    let SessionParts {
        handle, mut audio, ..
    } = coordinator.start().unwrap();

    audio.push(vec![4, 2]);
    audio.close();
    let report = handle
        .await_termination(Duration::from_secs(3))
        .expect("session should end");

    assert_eq!(report.state, SessionState::Closed);
    assert_eq!(report.reason, EndReason::InputEnded);
    assert_eq!(service.connect_count(), 2);
    assert_eq!(service.audio_sent(), vec![vec![4, 2]]);
}

#[test]
fn fatal_send_fails_without_finishing() {
    let service = Arc::new(
        MockRecognitionService::new().with_send_failure(SendError::Fatal("socket closed".into())),
    );
    let coordinator = SessionCoordinator::new(service.clone(), SessionParams::default(), settings());
    let SessionParts {
        handle, mut audio, ..
    } = coordinator.start().unwrap();

    audio.push(vec![1]);
    let report = handle
        .await_termination(Duration::from_secs(2))
        .expect("session should end");

    assert_eq!(report.state, SessionState::Failed);
    assert_eq!(report.reason, EndReason::SendFailure);
    assert_eq!(service.finish_count(), 0);
}

#[test]
fn recognizer_errors_reach_the_error_reporter() {
    let service = Arc::new(MockRecognitionService::new().with_error_event("quota exceeded"));
    let reporter = Arc::new(CollectingReporter::default());
    let coordinator = SessionCoordinator::new(service, SessionParams::default(), settings())
        .with_error_reporter(reporter.clone());
    let SessionParts {
        handle, mut audio, ..
    } = coordinator.start().unwrap();

    audio.push(vec![1]);
    thread::sleep(Duration::from_millis(80));
    audio.close();
    handle
        .await_termination(Duration::from_secs(2))
        .expect("session should end");

    let reports = reporter.reports.lock().unwrap();
    assert!(
        reports
            .iter()
            .any(|(_, message)| message.contains("quota exceeded")),
        "got {:?}",
        reports
    );
}

#[test]
fn registry_tracks_live_sessions() {
    let service = Arc::new(MockRecognitionService::new());
    let coordinator = SessionCoordinator::new(service, SessionParams::default(), settings());

    let first = coordinator.start().unwrap();
    let second = coordinator.start().unwrap();
    assert_eq!(coordinator.registry().len(), 2);
    assert!(coordinator.registry().contains(first.handle.id()));

    assert_eq!(coordinator.registry().stop_all(), 2);
    assert_eq!(coordinator.registry().stop_all(), 0);
    first.handle.stop().expect("first session should end");
    second.handle.stop().expect("second session should end");
    assert!(coordinator.registry().is_empty());
}
