//! WebSocket front end for relay clients.

pub mod protocol;
#[cfg(feature = "server")]
pub mod server;

pub use protocol::{HealthStatus, InboundMessage, OutboundMessage};
#[cfg(feature = "server")]
pub use server::{router, run_server, serve};
