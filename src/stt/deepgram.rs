//! Deepgram streaming (`listen v1`) recognizer over WebSocket.
//!
//! Each connection runs on its own thread with a current-thread tokio
//! runtime. The relay worker talks to it through a bounded command channel,
//! so sends never block on the network; transcript events are delivered to
//! the listener from that thread.

use crate::config::RecognizerConfig;
use crate::defaults;
use crate::error::{RelayError, Result};
use crate::relay::error::SendError;
use crate::stt::recognizer::{
    EventListener, RecognitionConnection, RecognitionEvent, RecognitionService, SessionParams,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, Request, header};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::connect_async;

/// Frames buffered between the worker and the socket writer.
const COMMAND_CAPACITY: usize = 64;

/// Bound on the closing handshake once the connection is abandoned.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

const KEEPALIVE_MESSAGE: &str = r#"{"type":"KeepAlive"}"#;
const CLOSE_STREAM_MESSAGE: &str = r#"{"type":"CloseStream"}"#;

/// Recognition service backed by Deepgram's streaming API.
#[derive(Debug, Clone)]
pub struct DeepgramService {
    url: String,
    api_key: String,
    connect_timeout: Duration,
}

impl DeepgramService {
    /// Creates a service for the public endpoint.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            url: defaults::DEEPGRAM_URL.to_string(),
            api_key: api_key.into(),
            connect_timeout: Duration::from_millis(defaults::CONNECT_TIMEOUT_MS),
        }
    }

    /// Creates a service from the `[recognizer]` config section.
    ///
    /// Fails if no API key is configured.
    pub fn from_config(config: &RecognizerConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| RelayError::RecognizerAuth {
                message: "no API key configured (set DEEPGRAM_API_KEY)".to_string(),
            })?;
        Ok(Self::new(api_key)
            .with_url(&config.url)
            .with_connect_timeout(Duration::from_millis(config.connect_timeout_ms)))
    }

    /// Overrides the endpoint (e.g. a self-hosted deployment).
    pub fn with_url(mut self, url: &str) -> Self {
        self.url = url.to_string();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn request(&self, params: &SessionParams) -> Result<Request<()>> {
        let url = listen_url(&self.url, params);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| RelayError::RecognizerConnect {
                service: "deepgram".to_string(),
                message: format!("invalid URL {}: {}", url, e),
            })?;
        let token = HeaderValue::from_str(&format!("Token {}", self.api_key)).map_err(|_| {
            RelayError::RecognizerAuth {
                message: "API key contains invalid characters".to_string(),
            }
        })?;
        request.headers_mut().insert(header::AUTHORIZATION, token);
        Ok(request)
    }
}

impl RecognitionService for DeepgramService {
    fn name(&self) -> &str {
        "deepgram"
    }

    fn connect(
        &self,
        params: &SessionParams,
        listener: EventListener,
    ) -> Result<Box<dyn RecognitionConnection>> {
        let request = self.request(params)?;
        let connect_timeout = self.connect_timeout;
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
        let (done_tx, done_rx) = bounded::<()>(0);
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();

        thread::Builder::new()
            .name("deepgram".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        ready_tx.send(Err(RelayError::Io(e))).ok();
                        return;
                    }
                };
                runtime.block_on(run_connection(
                    request,
                    connect_timeout,
                    command_rx,
                    cancel_rx,
                    listener,
                    ready_tx,
                ));
                drop(done_tx);
            })
            .map_err(|e| RelayError::WorkerSpawn {
                message: e.to_string(),
            })?;

        // The thread enforces the connect timeout; the margin covers startup.
        match ready_rx.recv_timeout(connect_timeout.saturating_add(Duration::from_secs(1))) {
            Ok(Ok(())) => Ok(Box::new(DeepgramConnection {
                commands: Some(command_tx),
                cancel: Some(cancel_tx),
                done_rx,
            })),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RelayError::RecognizerConnect {
                service: "deepgram".to_string(),
                message: format!("no response within {:?}", connect_timeout),
            }),
        }
    }
}

/// Builds the `listen` URL carrying the session parameters.
pub fn listen_url(base: &str, params: &SessionParams) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    format!(
        "{base}{separator}model={}&encoding={}&sample_rate={}&channels={}&smart_format={}&interim_results={}",
        params.model,
        params.encoding,
        params.sample_rate,
        params.channels,
        params.smart_format,
        params.interim_results
    )
}

#[derive(Debug)]
enum Command {
    Audio(Vec<u8>),
    KeepAlive,
    CloseStream,
}

/// How the socket writer stopped.
enum WriterExit {
    /// `CloseStream` was sent; the server will flush and close.
    Finished,
    /// The connection handle was dropped.
    Abandoned,
    Failed(String),
}

async fn run_connection(
    request: Request<()>,
    connect_timeout: Duration,
    mut commands: mpsc::Receiver<Command>,
    mut cancel: oneshot::Receiver<()>,
    listener: EventListener,
    ready_tx: crossbeam_channel::Sender<Result<()>>,
) {
    let stream = match tokio::time::timeout(connect_timeout, connect_async(request)).await {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(e)) => {
            ready_tx.send(Err(classify_connect_error(e))).ok();
            return;
        }
        Err(_) => {
            ready_tx
                .send(Err(RelayError::RecognizerConnect {
                    service: "deepgram".to_string(),
                    message: format!("connect timed out after {:?}", connect_timeout),
                }))
                .ok();
            return;
        }
    };
    ready_tx.send(Ok(())).ok();
    listener(RecognitionEvent::Opened);

    let (mut ws_tx, ws_rx) = stream.split();
    let reader = read_events(ws_rx, &listener);
    tokio::pin!(reader);

    let exit = tokio::select! {
        exit = write_commands(&mut ws_tx, &mut commands) => exit,
        () = &mut reader => {
            listener(RecognitionEvent::Closed);
            return;
        }
        _ = &mut cancel => WriterExit::Abandoned,
    };

    match exit {
        WriterExit::Finished => {
            // Wait for the server to flush and close, unless the handle
            // is released first.
            tokio::select! {
                () = &mut reader => {}
                _ = &mut cancel => {
                    log::debug!("deepgram released before the server closed");
                    close_socket(&mut ws_tx).await;
                }
            }
        }
        WriterExit::Abandoned => close_socket(&mut ws_tx).await,
        WriterExit::Failed(message) => listener(RecognitionEvent::Error(message)),
    }
    listener(RecognitionEvent::Closed);
}

async fn close_socket<S>(ws_tx: &mut S)
where
    S: futures_util::Sink<Message, Error = tungstenite::Error> + Unpin,
{
    match tokio::time::timeout(CLOSE_TIMEOUT, ws_tx.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::debug!("deepgram close failed: {}", e),
        Err(_) => log::debug!("deepgram close timed out after {:?}", CLOSE_TIMEOUT),
    }
}

async fn write_commands<S>(ws_tx: &mut S, commands: &mut mpsc::Receiver<Command>) -> WriterExit
where
    S: futures_util::Sink<Message, Error = tungstenite::Error> + Unpin,
{
    while let Some(command) = commands.recv().await {
        let (message, last) = match command {
            Command::Audio(data) => (Message::Binary(data.into()), false),
            Command::KeepAlive => (Message::Text(KEEPALIVE_MESSAGE.into()), false),
            Command::CloseStream => (Message::Text(CLOSE_STREAM_MESSAGE.into()), true),
        };
        if let Err(e) = ws_tx.send(message).await {
            return WriterExit::Failed(format!("send failed: {}", e));
        }
        if last {
            return WriterExit::Finished;
        }
    }
    WriterExit::Abandoned
}

async fn read_events<S>(mut ws_rx: S, listener: &EventListener)
where
    S: futures_util::Stream<Item = std::result::Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if let Some(event) = parse_server_message(&text) {
                    listener(event);
                }
            }
            Ok(Message::Close(frame)) => {
                if let Some(frame) = frame {
                    log::debug!("deepgram closed: {} {}", frame.code, frame.reason);
                }
                break;
            }
            Ok(_) => {}
            Err(e) => {
                listener(RecognitionEvent::Error(format!("receive failed: {}", e)));
                break;
            }
        }
    }
}

fn classify_connect_error(error: tungstenite::Error) -> RelayError {
    if let tungstenite::Error::Http(response) = &error {
        let status = response.status().as_u16();
        if status == 401 || status == 403 {
            return RelayError::RecognizerAuth {
                message: format!("deepgram rejected the API key (HTTP {})", status),
            };
        }
    }
    RelayError::RecognizerConnect {
        service: "deepgram".to_string(),
        message: error.to_string(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ServerMessage {
    Results {
        #[serde(default)]
        is_final: bool,
        channel: Channel,
    },
    Error {
        #[serde(default)]
        description: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
}

/// Maps one server message to a listener event.
///
/// Results with an empty best alternative produce nothing.
fn parse_server_message(text: &str) -> Option<RecognitionEvent> {
    match serde_json::from_str::<ServerMessage>(text) {
        Ok(ServerMessage::Results { is_final, channel }) => {
            let transcript = channel.alternatives.into_iter().next()?.transcript;
            if transcript.is_empty() {
                None
            } else {
                Some(RecognitionEvent::Transcript {
                    text: transcript,
                    is_final,
                })
            }
        }
        Ok(ServerMessage::Error { description }) => Some(RecognitionEvent::Error(
            description.unwrap_or_else(|| "unspecified error".to_string()),
        )),
        Ok(ServerMessage::Other) => None,
        Err(e) => Some(RecognitionEvent::Error(format!(
            "unparseable message: {}",
            e
        ))),
    }
}

/// Handle to one streaming connection.
///
/// Dropping it cancels the connection thread, which closes the socket
/// without waiting for the server.
struct DeepgramConnection {
    commands: Option<mpsc::Sender<Command>>,
    cancel: Option<oneshot::Sender<()>>,
    done_rx: Receiver<()>,
}

impl DeepgramConnection {
    fn enqueue(&self, command: Command) -> std::result::Result<(), SendError> {
        let Some(commands) = self.commands.as_ref() else {
            return Err(SendError::Fatal("stream already finished".to_string()));
        };
        match commands.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                Err(SendError::Transient("send buffer full".to_string()))
            }
            Err(TrySendError::Closed(_)) => {
                Err(SendError::Fatal("connection closed".to_string()))
            }
        }
    }
}

impl RecognitionConnection for DeepgramConnection {
    fn send_audio(&mut self, audio: &[u8]) -> std::result::Result<(), SendError> {
        self.enqueue(Command::Audio(audio.to_vec()))
    }

    fn send_keepalive(&mut self) -> std::result::Result<(), SendError> {
        self.enqueue(Command::KeepAlive)
    }

    fn finish(&mut self) -> std::result::Result<(), SendError> {
        self.enqueue(Command::CloseStream)?;
        self.commands = None;
        Ok(())
    }

    fn wait_closed(&mut self, timeout: Duration) -> bool {
        match self.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

impl Drop for DeepgramConnection {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.send(()).ok();
        }
    }
}
