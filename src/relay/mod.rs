//! Per-session relay between a client audio stream and a streaming recognizer.
//!
//! Each session owns one bounded audio queue, one worker thread and one
//! transcript dispatcher:
//!
//! ```text
//! client ──push──▶ AudioFrameQueue ──pull──▶ worker ──send──▶ recognizer
//! client ◀──recv── ResultDispatcher ◀──post── recognizer callback thread
//! ```

pub mod clock;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod keepalive;
pub mod queue;
pub mod registry;
pub mod session;
pub mod types;
mod worker;

pub use clock::{Clock, SystemClock};
pub use connection::relay_connection;
pub use dispatcher::{DispatchStats, PostOutcome, ResultDispatcher, TranscriptReceiver, result_dispatcher};
pub use error::{ErrorReporter, LogReporter, SendError};
pub use keepalive::KeepAliveScheduler;
pub use queue::{
    FrameReceiver, FrameSender, OverflowPolicy, PullOutcome, PushOutcome, QueueStats,
    audio_frame_queue,
};
pub use registry::SessionRegistry;
pub use session::{SessionCoordinator, SessionHandle, SessionParts, SessionSettings};
pub use types::{AudioFrame, EndReason, SessionId, SessionReport, SessionState, TranscriptEvent};
