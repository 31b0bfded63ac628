//! JSON messages exchanged with relay clients.

use crate::relay::types::{EndReason, TranscriptEvent};
use serde::{Deserialize, Serialize};

/// Messages sent from the relay to a connected client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// A partial or final transcript
    Transcript { text: String, is_final: bool },
    /// The session is over; no further messages follow
    SessionEnded { reason: EndReason },
}

impl OutboundMessage {
    /// Serialize message to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize message from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl From<TranscriptEvent> for OutboundMessage {
    fn from(event: TranscriptEvent) -> Self {
        OutboundMessage::Transcript {
            text: event.text,
            is_final: event.is_final,
        }
    }
}

/// Control messages a client may send as text frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// No more audio follows; transcripts keep flowing until the session ends
    CloseStream,
}

impl InboundMessage {
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    /// Sessions that have not yet ended
    pub active_sessions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcript_wire_format() {
        let msg = OutboundMessage::Transcript {
            text: "hello world".to_string(),
            is_final: true,
        };
        let json = msg.to_json().expect("should serialize");
        assert_eq!(
            json,
            r#"{"type":"transcript","text":"hello world","is_final":true}"#
        );
    }

    #[test]
    fn test_session_ended_wire_format() {
        let msg = OutboundMessage::SessionEnded {
            reason: EndReason::GracePeriodExpired,
        };
        let json = msg.to_json().expect("should serialize");
        assert_eq!(
            json,
            r#"{"type":"session_ended","reason":"grace_period_expired"}"#
        );
    }

    #[test]
    fn test_from_transcript_event() {
        let msg = OutboundMessage::from(TranscriptEvent::new("partial", false));
        assert_eq!(
            msg,
            OutboundMessage::Transcript {
                text: "partial".to_string(),
                is_final: false
            }
        );
    }

    #[test]
    fn test_parse_client_side() {
        let msg = OutboundMessage::from_json(r#"{"type":"session_ended","reason":"send_failure"}"#)
            .expect("should deserialize");
        assert_eq!(
            msg,
            OutboundMessage::SessionEnded {
                reason: EndReason::SendFailure
            }
        );

        let result = OutboundMessage::from_json(r#"{"type":"unknown"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_text_is_escaped() {
        let msg = OutboundMessage::Transcript {
            text: "say \"hi\"\n".to_string(),
            is_final: false,
        };
        let json = msg.to_json().expect("should serialize");
        let back = OutboundMessage::from_json(&json).expect("should deserialize");
        assert_eq!(back, msg);
    }

    #[test]
    fn test_inbound_close_stream() {
        assert_eq!(
            InboundMessage::from_json(r#"{"type":"close_stream"}"#).unwrap(),
            InboundMessage::CloseStream
        );
        assert!(InboundMessage::from_json(r#"{"type":"KeepAlive"}"#).is_err());
        assert!(InboundMessage::from_json("hello").is_err());
    }

    #[test]
    fn test_health_status_json() {
        let health = HealthStatus {
            status: "ok".to_string(),
            version: "0.1.0".to_string(),
            active_sessions: 2,
        };
        let json = serde_json::to_string(&health).expect("should serialize");
        assert!(json.contains("\"active_sessions\":2"));
    }
}
