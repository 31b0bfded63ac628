//! Streaming speech recognizers the relay can connect to.

#[cfg(feature = "deepgram")]
pub mod deepgram;
pub mod mock;
pub mod recognizer;

#[cfg(feature = "deepgram")]
pub use deepgram::DeepgramService;
pub use mock::{MockRecognitionService, SentItem};
pub use recognizer::{
    EventListener, RecognitionConnection, RecognitionEvent, RecognitionService, SessionParams,
};
