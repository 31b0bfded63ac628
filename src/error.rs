//! Error types for transcript-relay.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    // Configuration errors
    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Recognizer errors
    #[error("Recognizer authentication failed: {message}")]
    RecognizerAuth { message: String },

    #[error("Failed to connect to recognizer {service}: {message}")]
    RecognizerConnect { service: String, message: String },

    // Session errors
    #[error("Failed to spawn session worker: {message}")]
    WorkerSpawn { message: String },

    // Network front end errors
    #[error("Server error: {message}")]
    Server { message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_invalid_value_display() {
        let error = RelayError::ConfigInvalidValue {
            key: "session.poll_timeout_ms".to_string(),
            message: "must be positive".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid configuration value for session.poll_timeout_ms: must be positive"
        );
    }

    #[test]
    fn test_recognizer_connect_display() {
        let error = RelayError::RecognizerConnect {
            service: "deepgram".to_string(),
            message: "401 Unauthorized".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Failed to connect to recognizer deepgram: 401 Unauthorized"
        );
    }

    #[test]
    fn test_recognizer_auth_display() {
        let error = RelayError::RecognizerAuth {
            message: "DEEPGRAM_API_KEY not set".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Recognizer authentication failed: DEEPGRAM_API_KEY not set"
        );
    }

    #[test]
    fn test_worker_spawn_display() {
        let error = RelayError::WorkerSpawn {
            message: "resource temporarily unavailable".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Failed to spawn session worker: resource temporarily unavailable"
        );
    }

    #[test]
    fn test_other_display() {
        let error = RelayError::Other("unexpected error".to_string());
        assert_eq!(error.to_string(), "unexpected error");
    }

    #[test]
    fn test_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::AddrInUse, "address in use");
        let error: RelayError = io_error.into();
        assert!(error.to_string().contains("address in use"));
    }

    #[test]
    fn test_from_toml_error() {
        let toml_error = toml::from_str::<toml::Value>("invalid = toml = syntax").unwrap_err();
        let error: RelayError = toml_error.into();
        assert!(error.to_string().contains("Configuration error"));
    }

    #[test]
    fn test_error_source_chain_io() {
        let io_error = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let error: RelayError = io_error.into();

        let error_trait: &dyn std::error::Error = &error;
        assert!(error_trait.source().is_some());
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RelayError>();
        assert_sync::<RelayError>();
    }
}
