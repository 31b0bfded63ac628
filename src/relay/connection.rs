//! The per-connection relay loop running on the network task.
//!
//! Pumps client audio into the session queue and transcript events back out
//! to the client until the session ends. Transport-agnostic: the WebSocket
//! server adapts its socket halves to a `Stream` of audio chunks and a
//! `Sink` of JSON text.

use crate::relay::clock::deadline_after;
use crate::relay::queue::PushOutcome;
use crate::relay::session::SessionParts;
use crate::relay::types::{EndReason, SessionReport};
use crate::ws::protocol::OutboundMessage;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use tokio::time::{Instant, sleep_until};

/// Relays one client connection through a started session.
///
/// Ends when the session reaches a terminal state. Once the client's input
/// ends the session drains on its own; if it has not ended within the stop
/// timeout a stop is requested, and after a second timeout the loop gives up
/// waiting and reports the session as timed out.
pub async fn relay_connection<I, O>(parts: SessionParts, inbound: I, mut outbound: O) -> SessionReport
where
    I: Stream<Item = Vec<u8>> + Unpin,
    O: Sink<String> + Unpin,
    O::Error: Display,
{
    let SessionParts {
        handle,
        mut audio,
        mut transcripts,
    } = parts;
    let id = handle.id();
    let stop_timeout = handle.stop_timeout();

    let mut inbound = inbound.fuse();
    let mut input_open = true;
    let mut client_open = true;
    let mut deadline: Option<Instant> = None;
    let mut stop_sent = false;

    let report = loop {
        tokio::select! {
            biased;

            Some(event) = transcripts.recv() => {
                if client_open && !send(&mut outbound, OutboundMessage::from(event)).await {
                    log::debug!("[{}] client gone, stopping session", id);
                    client_open = false;
                    input_open = false;
                    audio.close();
                    handle.request_stop();
                    if deadline.is_none() {
                        deadline = Some(stop_deadline(stop_timeout));
                    }
                }
            }

            Some(report) = handle.terminated() => break report,

            chunk = inbound.next(), if input_open => match chunk {
                Some(data) => {
                    if audio.push_async(data).await == PushOutcome::Closed {
                        input_open = false;
                    }
                }
                None => {
                    log::debug!("[{}] client input ended", id);
                    input_open = false;
                    audio.close();
                    deadline = Some(stop_deadline(stop_timeout));
                }
            },

            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if !stop_sent {
                    stop_sent = true;
                    handle.request_stop();
                    deadline = Some(stop_deadline(stop_timeout));
                } else {
                    log::warn!("[{}] session did not end within {:?}, abandoning", id, stop_timeout);
                    let mut report = handle.report().unwrap_or_else(|| {
                        SessionReport::empty(id, handle.state(), EndReason::StopRequested)
                    });
                    report.teardown_timed_out = true;
                    break report;
                }
            }
        }
    };

    if client_open {
        while let Some(event) = transcripts.try_recv() {
            if !send(&mut outbound, OutboundMessage::from(event)).await {
                client_open = false;
                break;
            }
        }
    }
    if client_open {
        let ended = OutboundMessage::SessionEnded {
            reason: report.reason,
        };
        if send(&mut outbound, ended).await {
            if let Err(e) = outbound.close().await {
                log::debug!("[{}] close failed: {}", id, e);
            }
        }
    }

    report
}

fn stop_deadline(timeout: std::time::Duration) -> Instant {
    Instant::from_std(deadline_after(timeout))
}

/// Sends one message; returns false once the client can no longer be reached.
async fn send<O>(outbound: &mut O, message: OutboundMessage) -> bool
where
    O: Sink<String> + Unpin,
    O::Error: Display,
{
    let json = match message.to_json() {
        Ok(json) => json,
        Err(e) => {
            log::error!("failed to encode {:?}: {}", message, e);
            return true;
        }
    };
    match outbound.send(json).await {
        Ok(()) => true,
        Err(e) => {
            log::debug!("client send failed: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::session::{SessionCoordinator, SessionSettings};
    use crate::relay::types::SessionState;
    use crate::stt::mock::MockRecognitionService;
    use crate::stt::recognizer::SessionParams;
    use futures_util::stream;
    use std::sync::Arc;
    use std::time::Duration;

    fn coordinator(service: Arc<MockRecognitionService>) -> SessionCoordinator {
        let settings = SessionSettings {
            first_audio_grace: Duration::from_millis(300),
            poll_timeout: Duration::from_millis(20),
            keepalive_idle: Duration::from_millis(50),
            drain_timeout: Duration::from_millis(200),
            stop_timeout: Duration::from_millis(500),
            ..SessionSettings::default()
        };
        SessionCoordinator::new(service, SessionParams::default(), settings)
    }

    fn parse(out: &[String]) -> Vec<OutboundMessage> {
        out.iter()
            .map(|json| OutboundMessage::from_json(json).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_relays_audio_and_transcripts_then_ends() {
        let service = Arc::new(
            MockRecognitionService::new()
                .with_transcript("hel", false)
                .with_final_on_finish("hello"),
        );
        let coordinator = coordinator(service.clone());
        let parts = coordinator.start().unwrap();

        let inbound = stream::iter(vec![vec![1u8, 2], vec![3, 4]]);
        let mut out: Vec<String> = Vec::new();
        let report = relay_connection(parts, inbound, &mut out).await;

        assert_eq!(report.state, SessionState::Closed);
        assert_eq!(report.reason, EndReason::InputEnded);
        assert_eq!(service.audio_sent(), vec![vec![1, 2], vec![3, 4]]);
        assert_eq!(
            parse(&out),
            vec![
                OutboundMessage::Transcript {
                    text: "hel".to_string(),
                    is_final: false
                },
                OutboundMessage::Transcript {
                    text: "hello".to_string(),
                    is_final: true
                },
                OutboundMessage::SessionEnded {
                    reason: EndReason::InputEnded
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_client_without_audio_ends_cleanly() {
        let service = Arc::new(MockRecognitionService::new());
        let coordinator = coordinator(service.clone());
        let parts = coordinator.start().unwrap();

        let mut out: Vec<String> = Vec::new();
        let report = relay_connection(parts, stream::empty(), &mut out).await;

        assert_eq!(report.reason, EndReason::InputEnded);
        assert_eq!(service.connect_count(), 0);
        assert_eq!(
            parse(&out),
            vec![OutboundMessage::SessionEnded {
                reason: EndReason::InputEnded
            }]
        );
    }

    #[tokio::test]
    async fn test_connect_failure_reported_to_client() {
        let service = Arc::new(MockRecognitionService::new().with_connect_failures(1));
        let coordinator = coordinator(service);
        let parts = coordinator.start().unwrap();

        // Keep the input open so only the failure can end the session.
        let inbound = stream::iter(vec![vec![0u8; 4]]).chain(stream::pending());
        let mut out: Vec<String> = Vec::new();
        let report = relay_connection(parts, inbound, &mut out).await;

        assert_eq!(report.state, SessionState::Failed);
        assert_eq!(
            parse(&out),
            vec![OutboundMessage::SessionEnded {
                reason: EndReason::ConnectFailure
            }]
        );
        assert!(coordinator.registry().is_empty());
    }

    #[tokio::test]
    async fn test_external_stop_ends_open_connection() {
        let service = Arc::new(MockRecognitionService::new());
        let coordinator = coordinator(service.clone());
        let parts = coordinator.start().unwrap();
        let registry = coordinator.registry().clone();

        let inbound = stream::iter(vec![vec![9u8]]).chain(stream::pending());
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            registry.stop_all()
        });

        let mut out: Vec<String> = Vec::new();
        let report = relay_connection(parts, inbound, &mut out).await;

        assert_eq!(stopper.await.unwrap(), 1);
        assert_eq!(report.reason, EndReason::StopRequested);
        assert_eq!(service.finish_count(), 1);
        assert_eq!(
            parse(&out).last(),
            Some(&OutboundMessage::SessionEnded {
                reason: EndReason::StopRequested
            })
        );
    }

    #[test]
    fn test_stop_deadline_saturates_huge_timeout() {
        let deadline = stop_deadline(Duration::MAX);
        assert!(deadline > Instant::now());
    }
}
