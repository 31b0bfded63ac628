use crate::config::RecognizerConfig;
use crate::defaults;
use crate::error::Result;
use crate::relay::error::SendError;
use std::sync::Arc;
use std::time::Duration;

/// Parameters sent when a streaming recognition session is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub model: String,
    /// Audio encoding of the frames, e.g. `linear16`.
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub smart_format: bool,
    pub interim_results: bool,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            model: defaults::DEFAULT_MODEL.to_string(),
            encoding: defaults::AUDIO_ENCODING.to_string(),
            sample_rate: defaults::SAMPLE_RATE,
            channels: defaults::CHANNELS,
            smart_format: true,
            interim_results: true,
        }
    }
}

impl From<&RecognizerConfig> for SessionParams {
    fn from(config: &RecognizerConfig) -> Self {
        Self {
            model: config.model.clone(),
            encoding: config.encoding.clone(),
            sample_rate: config.sample_rate,
            channels: config.channels,
            smart_format: config.smart_format,
            interim_results: config.interim_results,
        }
    }
}

/// Notification delivered by a recognizer from its own thread.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    /// The duplex connection is open.
    Opened,
    /// Best alternative for the current utterance.
    Transcript { text: String, is_final: bool },
    /// The recognizer closed the connection.
    Closed,
    /// The recognizer reported an error.
    Error(String),
}

/// Callback invoked by the recognizer for every event.
///
/// Runs on a thread the recognizer owns; implementations must only hand the
/// event off and return.
pub type EventListener = Arc<dyn Fn(RecognitionEvent) + Send + Sync>;

/// A streaming speech recognizer that sessions can connect to.
///
/// This trait allows swapping implementations (Deepgram vs mock).
pub trait RecognitionService: Send + Sync {
    /// Short service name for logs.
    fn name(&self) -> &str;

    /// Opens a duplex session. Events are delivered to `listener` until the
    /// connection's listener terminates.
    fn connect(
        &self,
        params: &SessionParams,
        listener: EventListener,
    ) -> Result<Box<dyn RecognitionConnection>>;
}

/// An open recognition session.
///
/// Dropping the connection releases it immediately, whether or not
/// `finish()` was called.
pub trait RecognitionConnection: Send {
    /// Sends raw audio bytes.
    fn send_audio(&mut self, audio: &[u8]) -> std::result::Result<(), SendError>;

    /// Sends a protocol keepalive so the recognizer does not time out on silence.
    fn send_keepalive(&mut self) -> std::result::Result<(), SendError>;

    /// Asks the recognizer to flush pending results and close.
    fn finish(&mut self) -> std::result::Result<(), SendError>;

    /// Waits up to `timeout` for the listener to terminate. Returns false on timeout.
    fn wait_closed(&mut self, timeout: Duration) -> bool;
}

/// Implement RecognitionService for Arc<T> to allow sharing across sessions.
impl<T: RecognitionService> RecognitionService for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn connect(
        &self,
        params: &SessionParams,
        listener: EventListener,
    ) -> Result<Box<dyn RecognitionConnection>> {
        (**self).connect(params, listener)
    }
}
