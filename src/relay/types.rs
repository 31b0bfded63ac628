//! Data types for the relay pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use uuid::Uuid;

/// Opaque identifier of one relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Creates a fresh random session id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to correlate log lines.
        let simple = self.0.simple().to_string();
        write!(f, "{}", &simple[..8])
    }
}

/// A chunk of raw client audio as it arrived from the network.
///
/// Frames are immutable; `sequence` only serves diagnostics and is never
/// used to reorder.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    data: Vec<u8>,
    sequence: u64,
    received_at: Instant,
}

impl AudioFrame {
    /// Creates a new audio frame stamped with the current instant.
    pub fn new(data: Vec<u8>, sequence: u64) -> Self {
        Self {
            data,
            sequence,
            received_at: Instant::now(),
        }
    }

    /// Raw audio bytes (16-bit little-endian PCM).
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Arrival order within the session, starting at 0.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// Consumes the frame, returning its bytes.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// A recognized transcript, partial or final.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEvent {
    /// Transcribed text of the best alternative.
    pub text: String,
    /// Whether the recognizer will revise this text again.
    pub is_final: bool,
    /// When the event was received from the recognizer.
    pub timestamp: Instant,
}

impl TranscriptEvent {
    /// Creates an event stamped with the current instant.
    pub fn new(text: impl Into<String>, is_final: bool) -> Self {
        Self {
            text: text.into(),
            is_final,
            timestamp: Instant::now(),
        }
    }
}

/// Lifecycle of a relay session.
///
/// ```text
/// AwaitingFirstAudio → Connecting → Streaming → Draining → Closed
///          └──────────────┴────────────┴───────────┴──────→ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    AwaitingFirstAudio,
    Connecting,
    Streaming,
    Draining,
    Closed,
    Failed,
}

impl SessionState {
    /// Returns true for `Closed` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::AwaitingFirstAudio => "awaiting_first_audio",
            SessionState::Connecting => "connecting",
            SessionState::Streaming => "streaming",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended. This is all the network side ever learns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// No audio arrived within the grace period.
    GracePeriodExpired,
    /// The client closed its audio stream.
    InputEnded,
    /// The session was asked to stop.
    StopRequested,
    /// The recognizer connection could not be established.
    ConnectFailure,
    /// Sending to the recognizer failed fatally.
    SendFailure,
    /// The worker thread panicked.
    WorkerPanicked,
}

impl EndReason {
    /// Returns true if the session ended in `Failed`.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            EndReason::ConnectFailure | EndReason::SendFailure | EndReason::WorkerPanicked
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EndReason::GracePeriodExpired => "grace_period_expired",
            EndReason::InputEnded => "input_ended",
            EndReason::StopRequested => "stop_requested",
            EndReason::ConnectFailure => "connect_failure",
            EndReason::SendFailure => "send_failure",
            EndReason::WorkerPanicked => "worker_panicked",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary produced when a session reaches a terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub id: SessionId,
    pub state: SessionState,
    pub reason: EndReason,
    /// Audio frames delivered to the recognizer.
    pub frames_sent: u64,
    /// Frames given up on after transient send failures.
    pub frames_dropped: u64,
    pub keepalives_sent: u64,
    /// Transcript events handed to the dispatcher.
    pub transcripts_posted: u64,
    /// The recognizer listener outlived the drain timeout.
    pub teardown_timed_out: bool,
}

impl SessionReport {
    /// Report for a session that ended before any work was done.
    pub fn empty(id: SessionId, state: SessionState, reason: EndReason) -> Self {
        Self {
            id,
            state,
            reason,
            frames_sent: 0,
            frames_dropped: 0,
            keepalives_sent: 0,
            transcripts_posted: 0,
            teardown_timed_out: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Closed.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::AwaitingFirstAudio.is_terminal());
        assert!(!SessionState::Connecting.is_terminal());
        assert!(!SessionState::Streaming.is_terminal());
        assert!(!SessionState::Draining.is_terminal());
    }

    #[test]
    fn test_failure_reasons() {
        assert!(EndReason::ConnectFailure.is_failure());
        assert!(EndReason::SendFailure.is_failure());
        assert!(EndReason::WorkerPanicked.is_failure());
        assert!(!EndReason::GracePeriodExpired.is_failure());
        assert!(!EndReason::InputEnded.is_failure());
        assert!(!EndReason::StopRequested.is_failure());
    }

    #[test]
    fn test_end_reason_serializes_like_display() {
        for reason in [
            EndReason::GracePeriodExpired,
            EndReason::InputEnded,
            EndReason::StopRequested,
            EndReason::ConnectFailure,
            EndReason::SendFailure,
            EndReason::WorkerPanicked,
        ] {
            let json = serde_json::to_string(&reason).unwrap();
            assert_eq!(json, format!("\"{}\"", reason));
        }
    }

    #[test]
    fn test_audio_frame_accessors() {
        let frame = AudioFrame::new(vec![1, 2, 3, 4], 7);
        assert_eq!(frame.data(), &[1, 2, 3, 4]);
        assert_eq!(frame.len(), 4);
        assert!(!frame.is_empty());
        assert_eq!(frame.sequence(), 7);
        assert!(frame.received_at() <= Instant::now());
        assert_eq!(frame.into_data(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_session_id_display_is_short_and_unique() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_eq!(a.to_string().len(), 8);
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_report() {
        let id = SessionId::new();
        let report = SessionReport::empty(id, SessionState::Closed, EndReason::GracePeriodExpired);
        assert_eq!(report.id, id);
        assert_eq!(report.frames_sent, 0);
        assert_eq!(report.keepalives_sent, 0);
        assert!(!report.teardown_timed_out);
    }
}
