//! transcript-relay - streaming audio-to-transcript relay
//!
//! Accepts live audio from WebSocket clients, forwards it to a streaming
//! speech recognizer, and relays transcript events back as they arrive.

// Enforce error handling discipline
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod config;
pub mod defaults;
pub mod error;
pub mod relay;
pub mod stt;
pub mod ws;

// Core traits (recognizer capability → relay → client)
pub use relay::error::ErrorReporter;
pub use stt::recognizer::{RecognitionConnection, RecognitionService};

// Sessions
pub use relay::connection::relay_connection;
pub use relay::session::{SessionCoordinator, SessionHandle, SessionParts, SessionSettings};
pub use relay::types::{EndReason, SessionReport, SessionState, TranscriptEvent};

// Error handling
pub use error::{RelayError, Result};

// Config
pub use config::Config;

/// Version reported by `/health` and the startup log.
///
/// `"0.1.0+3f2a9c1"` (or `"0.1.0+3f2a9c1-dirty"`) when built from a git
/// checkout, plain `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("RELAY_GIT_REVISION") {
        Some(revision) if !revision.is_empty() => format!("{version}+{revision}"),
        _ => version.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_starts_with_package_version() {
        assert!(version_string().starts_with(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn version_carries_revision_only_when_embedded() {
        let version = version_string();
        match option_env!("RELAY_GIT_REVISION") {
            Some(revision) if !revision.is_empty() => {
                assert_eq!(version.split_once('+').map(|(_, rev)| rev), Some(revision));
            }
            _ => assert_eq!(version, env!("CARGO_PKG_VERSION")),
        }
    }
}
