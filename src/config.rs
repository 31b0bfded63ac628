use crate::defaults;
use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub recognizer: RecognizerConfig,
    pub session: SessionConfig,
    pub server: ServerConfig,
}

/// Streaming recognizer connection parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecognizerConfig {
    pub url: String,
    pub model: String,
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub smart_format: bool,
    pub interim_results: bool,
    pub api_key: Option<String>,
    pub connect_timeout_ms: u64,
}

/// Per-session timing and buffering
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub first_audio_grace_ms: u64,
    pub poll_timeout_ms: u64,
    pub keepalive_idle_ms: u64,
    pub drain_timeout_ms: u64,
    pub queue_capacity: usize,
    pub overflow: OverflowMode,
    pub push_timeout_ms: u64,
    pub dispatch_capacity: usize,
    pub post_timeout_ms: u64,
    pub connect_attempts: u32,
    pub send_retries: u32,
    pub stop_timeout_ms: u64,
}

/// What the audio queue does when it is full
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverflowMode {
    /// Wait up to `push_timeout_ms`, then reject the new frame.
    Block,
    /// Evict the oldest buffered frame.
    DropOldest,
}

/// WebSocket front end
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            url: defaults::DEEPGRAM_URL.to_string(),
            model: defaults::DEFAULT_MODEL.to_string(),
            encoding: defaults::AUDIO_ENCODING.to_string(),
            sample_rate: defaults::SAMPLE_RATE,
            channels: defaults::CHANNELS,
            smart_format: true,
            interim_results: true,
            api_key: None,
            connect_timeout_ms: defaults::CONNECT_TIMEOUT_MS,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            first_audio_grace_ms: defaults::FIRST_AUDIO_GRACE_MS,
            poll_timeout_ms: defaults::POLL_TIMEOUT_MS,
            keepalive_idle_ms: defaults::KEEPALIVE_IDLE_MS,
            drain_timeout_ms: defaults::DRAIN_TIMEOUT_MS,
            queue_capacity: defaults::QUEUE_CAPACITY,
            overflow: OverflowMode::Block,
            push_timeout_ms: defaults::PUSH_TIMEOUT_MS,
            dispatch_capacity: defaults::DISPATCH_CAPACITY,
            post_timeout_ms: defaults::POST_TIMEOUT_MS,
            connect_attempts: defaults::CONNECT_ATTEMPTS,
            send_retries: defaults::SEND_RETRIES,
            stop_timeout_ms: defaults::STOP_TIMEOUT_MS,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: defaults::BIND_ADDRESS.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if the file doesn't exist
    ///
    /// Invalid TOML and unreadable files are still errors.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e)
                if e.downcast_ref::<std::io::Error>()
                    .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::NotFound) =>
            {
                Ok(Self::default())
            }
            Err(e) => Err(e.context(format!("Failed to load config from {}", path.display()))),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - DEEPGRAM_API_KEY → recognizer.api_key
    /// - RELAY_MODEL → recognizer.model
    /// - RELAY_BIND → server.bind
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(key) = std::env::var("DEEPGRAM_API_KEY")
            && !key.is_empty()
        {
            self.recognizer.api_key = Some(key);
        }

        if let Ok(model) = std::env::var("RELAY_MODEL")
            && !model.is_empty()
        {
            self.recognizer.model = model;
        }

        if let Ok(bind) = std::env::var("RELAY_BIND")
            && !bind.is_empty()
        {
            self.server.bind = bind;
        }

        self
    }

    /// Reject values that would make a session hang or spin.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("session.poll_timeout_ms", self.session.poll_timeout_ms),
            ("session.keepalive_idle_ms", self.session.keepalive_idle_ms),
            ("session.first_audio_grace_ms", self.session.first_audio_grace_ms),
            ("session.drain_timeout_ms", self.session.drain_timeout_ms),
            ("session.stop_timeout_ms", self.session.stop_timeout_ms),
            ("recognizer.connect_timeout_ms", self.recognizer.connect_timeout_ms),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(invalid(key, "must be greater than zero"));
            }
        }

        let bounded = positive.into_iter().chain([
            ("session.push_timeout_ms", self.session.push_timeout_ms),
            ("session.post_timeout_ms", self.session.post_timeout_ms),
        ]);
        for (key, value) in bounded {
            if value > defaults::MAX_TIMEOUT_MS {
                return Err(invalid(key, "must be at most 86400000 (one day)"));
            }
        }

        if self.session.queue_capacity == 0 {
            return Err(invalid("session.queue_capacity", "must be at least 1"));
        }
        if self.session.dispatch_capacity == 0 {
            return Err(invalid("session.dispatch_capacity", "must be at least 1"));
        }
        if self.session.connect_attempts == 0 {
            return Err(invalid("session.connect_attempts", "must be at least 1"));
        }
        if self.recognizer.sample_rate == 0 {
            return Err(invalid("recognizer.sample_rate", "must be positive"));
        }
        if self.recognizer.channels == 0 {
            return Err(invalid("recognizer.channels", "must be positive"));
        }
        if self.recognizer.model.trim().is_empty() {
            return Err(invalid("recognizer.model", "must not be empty"));
        }

        Ok(())
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/transcript-relay/config.toml on Linux, or `None`
    /// when the platform has no config directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("transcript-relay").join("config.toml"))
    }
}

fn invalid(key: &str, message: &str) -> RelayError {
    RelayError::ConfigInvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
