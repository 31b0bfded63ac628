//! Send failures and error reporting for relay sessions.

use std::fmt;

/// Failure while sending audio or control frames to the recognizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The frame could not be sent right now; retrying may succeed.
    Transient(String),
    /// The connection is unusable; the session must end.
    Fatal(String),
}

impl SendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SendError::Transient(_))
    }
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Transient(msg) => write!(f, "Transient send error: {}", msg),
            SendError::Fatal(msg) => write!(f, "Fatal send error: {}", msg),
        }
    }
}

impl std::error::Error for SendError {}

/// Trait for reporting errors raised in contexts that must not propagate them,
/// such as recognizer callbacks running on a foreign thread.
pub trait ErrorReporter: Send + Sync {
    /// Reports an error from the named context.
    fn report(&self, context: &str, message: &str);
}

/// Reporter that writes to the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, context: &str, message: &str) {
        log::error!("[{}] {}", context, message);
    }
}

/// Extracts a readable message from a caught panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(|s| s.as_str()))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_error_display() {
        let transient = SendError::Transient("buffer full".to_string());
        assert_eq!(transient.to_string(), "Transient send error: buffer full");

        let fatal = SendError::Fatal("socket closed".to_string());
        assert_eq!(fatal.to_string(), "Fatal send error: socket closed");
    }

    #[test]
    fn test_send_error_classification() {
        assert!(SendError::Transient(String::new()).is_transient());
        assert!(!SendError::Fatal(String::new()).is_transient());
    }

    #[test]
    fn test_log_reporter() {
        // Just ensure it doesn't panic without a logger installed
        LogReporter.report("listener", "boom");
    }

    #[test]
    fn test_panic_message_variants() {
        let caught = std::panic::catch_unwind(|| panic!("static message")).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "static message");

        let caught = std::panic::catch_unwind(|| panic!("formatted {}", 42)).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "formatted 42");

        let caught = std::panic::catch_unwind(|| std::panic::panic_any(7u8)).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "unknown panic");
    }
}
