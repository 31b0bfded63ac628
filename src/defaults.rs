//! Default configuration constants for transcript-relay.
//!
//! Shared between `config` and the relay components so that a session built
//! without a config file behaves like the reference deployment.

/// How long a fresh session waits for its first audio frame, in milliseconds.
///
/// No recognizer connection is opened until audio arrives; a client that
/// never speaks costs nothing beyond this wait.
pub const FIRST_AUDIO_GRACE_MS: u64 = 60_000;

/// Worker poll timeout on the audio queue, in milliseconds.
///
/// Also the worst-case latency for the worker to observe a stop request.
pub const POLL_TIMEOUT_MS: u64 = 2_000;

/// Idle time after which a keepalive frame is sent, in milliseconds.
pub const KEEPALIVE_IDLE_MS: u64 = 2_000;

/// Upper bound on waiting for the recognizer listener after a graceful finish.
pub const DRAIN_TIMEOUT_MS: u64 = 1_000;

/// Maximum number of audio frames buffered between network and worker.
///
/// At 1024-sample chunks of 16 kHz mono this is roughly 16 seconds of audio.
pub const QUEUE_CAPACITY: usize = 256;

/// How long a push may wait for queue space before the frame is rejected.
pub const PUSH_TIMEOUT_MS: u64 = 50;

/// Maximum number of transcript events waiting for the network task.
pub const DISPATCH_CAPACITY: usize = 256;

/// How long a foreign callback may wait for dispatcher space.
pub const POST_TIMEOUT_MS: u64 = 100;

/// Number of connection attempts before a session fails.
///
/// One attempt means no retry.
pub const CONNECT_ATTEMPTS: u32 = 1;

/// Retries for a send that failed with a transient error.
pub const SEND_RETRIES: u32 = 2;

/// How long the network task waits for the worker after asking it to stop.
pub const STOP_TIMEOUT_MS: u64 = 2_000;

/// Largest accepted value for any `*_ms` setting (one day).
pub const MAX_TIMEOUT_MS: u64 = 86_400_000;

/// Timeout for establishing the recognizer connection.
pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Default Deepgram streaming endpoint.
pub const DEEPGRAM_URL: &str = "wss://api.deepgram.com/v1/listen";

/// Default recognition model.
pub const DEFAULT_MODEL: &str = "nova-3";

/// Audio encoding expected from clients (16-bit little-endian PCM).
pub const AUDIO_ENCODING: &str = "linear16";

/// Default client sample rate in Hz.
pub const SAMPLE_RATE: u32 = 16000;

/// Default channel count.
pub const CHANNELS: u16 = 1;

/// Default bind address of the WebSocket front end.
pub const BIND_ADDRESS: &str = "127.0.0.1:8000";
