//! WebSocket server: one relay session per `/listen` connection.

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::relay::connection::relay_connection;
use crate::relay::session::SessionCoordinator;
use crate::stt::recognizer::RecognitionService;
use crate::ws::protocol::{HealthStatus, InboundMessage};
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::future;
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Builds the router serving `GET /listen` and `GET /health`.
pub fn router(coordinator: Arc<SessionCoordinator>) -> Router {
    Router::new()
        .route("/listen", get(listen_handler))
        .route("/health", get(health_handler))
        .with_state(coordinator)
}

/// Serves connections on `listener` until `shutdown` resolves, then stops
/// every live session and waits up to the stop timeout for them to end.
pub async fn serve<F>(
    listener: TcpListener,
    coordinator: Arc<SessionCoordinator>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let registry = coordinator.registry().clone();
    let stop_timeout = coordinator.settings().stop_timeout;
    let app = router(coordinator);

    let stop_registry = registry.clone();
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown.await;
            let stopped = stop_registry.stop_all();
            log::info!("shutting down, stopping {} session(s)", stopped);
        })
        .await
        .map_err(|e| RelayError::Server {
            message: format!("server error: {}", e),
        })?;

    registry.wait_empty(stop_timeout).await;
    Ok(())
}

/// Binds the configured address and runs until SIGINT or SIGTERM.
pub async fn run_server(config: &Config, service: Arc<dyn RecognitionService>) -> Result<()> {
    let listener = TcpListener::bind(&config.server.bind)
        .await
        .map_err(|e| RelayError::Server {
            message: format!("Failed to bind {}: {}", config.server.bind, e),
        })?;
    log::info!(
        "relaying to {} on ws://{}/listen",
        service.name(),
        listener.local_addr()?
    );

    let coordinator = Arc::new(SessionCoordinator::from_config(service, config));
    serve(listener, coordinator, shutdown_signal()).await?;
    log::info!("server stopped");
    Ok(())
}

async fn health_handler(State(coordinator): State<Arc<SessionCoordinator>>) -> impl IntoResponse {
    Json(HealthStatus {
        status: "ok".to_string(),
        version: crate::version_string(),
        active_sessions: coordinator.registry().len(),
    })
}

async fn listen_handler(
    State(coordinator): State<Arc<SessionCoordinator>>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_socket(coordinator, socket))
}

/// One inbound WebSocket frame, classified.
enum Frame {
    Audio(Vec<u8>),
    /// Client close or `close_stream`: the audio input is over
    End,
    Skip,
}

async fn handle_socket(coordinator: Arc<SessionCoordinator>, socket: WebSocket) {
    let parts = match coordinator.start() {
        Ok(parts) => parts,
        Err(e) => {
            log::error!("failed to start session: {}", e);
            return;
        }
    };
    let id = parts.handle.id();
    let (sender, receiver) = socket.split();

    let outbound = sender.with(|text: String| future::ready(Ok::<_, axum::Error>(Message::Text(text))));
    let inbound = receiver
        .map(move |message| match message {
            Ok(Message::Binary(data)) => Frame::Audio(data),
            Ok(Message::Text(text)) => match InboundMessage::from_json(&text) {
                Ok(InboundMessage::CloseStream) => Frame::End,
                Err(_) => {
                    log::warn!("[{}] ignoring text frame: {:.64}", id, text);
                    Frame::Skip
                }
            },
            Ok(Message::Close(_)) => Frame::End,
            Ok(_) => Frame::Skip,
            Err(e) => {
                log::debug!("[{}] receive failed: {}", id, e);
                Frame::End
            }
        })
        .take_while(|frame| future::ready(!matches!(frame, Frame::End)))
        .filter_map(|frame| {
            future::ready(match frame {
                Frame::Audio(data) => Some(data),
                _ => None,
            })
        });

    let report = relay_connection(parts, Box::pin(inbound), Box::pin(outbound)).await;
    log::debug!("[{}] connection finished: {:?}", id, report);
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                log::error!("Error setting up SIGINT handler: {}", e);
            }
            log::info!("Received SIGINT, shutting down...");
        }
        res = wait_for_sigterm() => {
            if let Err(e) = res {
                log::error!("Error setting up signal handler: {}", e);
            }
            log::info!("Received SIGTERM, shutting down...");
        }
    }
}

/// Wait for SIGTERM signal (used by systemd).
#[cfg(unix)]
async fn wait_for_sigterm() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| RelayError::Other(format!("Failed to register SIGTERM handler: {}", e)))?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> Result<()> {
    // On non-Unix, just wait forever (Ctrl+C will still work)
    std::future::pending::<()>().await
}
