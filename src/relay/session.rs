//! Per-connection session: queue, worker thread and dispatcher, started and
//! stopped as one unit.

use crate::config::{Config, OverflowMode, SessionConfig};
use crate::error::{RelayError, Result};
use crate::relay::dispatcher::{TranscriptReceiver, result_dispatcher};
use crate::relay::error::{ErrorReporter, LogReporter, panic_message};
use crate::relay::queue::{FrameSender, OverflowPolicy, audio_frame_queue};
use crate::relay::registry::SessionRegistry;
use crate::relay::types::{EndReason, SessionId, SessionReport, SessionState};
use crate::relay::worker::SessionWorker;
use crate::stt::recognizer::{RecognitionService, SessionParams};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Timing and capacity settings for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    /// How long to wait for the first audio frame before giving up.
    pub first_audio_grace: Duration,
    /// Queue poll timeout; also the worst-case latency of observing a stop.
    pub poll_timeout: Duration,
    /// Idle time after which a keepalive is sent.
    pub keepalive_idle: Duration,
    /// Bound on waiting for the recognizer listener after finish.
    pub drain_timeout: Duration,
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    pub dispatch_capacity: usize,
    pub post_timeout: Duration,
    /// Connection attempts before the session fails (at least 1).
    pub connect_attempts: u32,
    /// Retries of a frame after a transient send failure.
    pub send_retries: u32,
    /// Bound used by [`SessionHandle::stop`] and the connection relay.
    pub stop_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for SessionSettings {
    fn from(config: &SessionConfig) -> Self {
        let overflow = match config.overflow {
            OverflowMode::Block => OverflowPolicy::Block {
                timeout: Duration::from_millis(config.push_timeout_ms),
            },
            OverflowMode::DropOldest => OverflowPolicy::DropOldest,
        };
        Self {
            first_audio_grace: Duration::from_millis(config.first_audio_grace_ms),
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
            keepalive_idle: Duration::from_millis(config.keepalive_idle_ms),
            drain_timeout: Duration::from_millis(config.drain_timeout_ms),
            queue_capacity: config.queue_capacity,
            overflow,
            dispatch_capacity: config.dispatch_capacity,
            post_timeout: Duration::from_millis(config.post_timeout_ms),
            connect_attempts: config.connect_attempts,
            send_retries: config.send_retries,
            stop_timeout: Duration::from_millis(config.stop_timeout_ms),
        }
    }
}

struct Status {
    state: SessionState,
    report: Option<SessionReport>,
}

/// State shared between a session's handle, its worker and the registry.
pub(crate) struct SessionShared {
    id: SessionId,
    stop: AtomicBool,
    status: Mutex<Status>,
    terminated: Condvar,
    report_tx: watch::Sender<Option<SessionReport>>,
}

impl SessionShared {
    pub(crate) fn new(id: SessionId) -> Self {
        let (report_tx, _) = watch::channel(None);
        Self {
            id,
            stop: AtomicBool::new(false),
            status: Mutex::new(Status {
                state: SessionState::AwaitingFirstAudio,
                report: None,
            }),
            terminated: Condvar::new(),
            report_tx,
        }
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    /// Sets the stop flag. Only the first caller gets `true`.
    pub(crate) fn request_stop(&self) -> bool {
        let first = !self.stop.swap(true, Ordering::AcqRel);
        if first {
            log::debug!("[{}] stop requested", self.id);
        }
        first
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> SessionState {
        self.status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .state
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if status.state.is_terminal() {
            return;
        }
        log::debug!("[{}] {} -> {}", self.id, status.state, state);
        status.state = state;
    }

    /// Publishes the terminal report. Later calls are ignored.
    pub(crate) fn finish(&self, report: SessionReport) {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if status.report.is_some() {
            return;
        }
        log::debug!("[{}] {} -> {}", self.id, status.state, report.state);
        status.state = report.state;
        status.report = Some(report.clone());
        drop(status);

        self.terminated.notify_all();
        self.report_tx.send_replace(Some(report));
    }

    pub(crate) fn report(&self) -> Option<SessionReport> {
        self.status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .report
            .clone()
    }

    pub(crate) fn wait(&self, timeout: Duration) -> Option<SessionReport> {
        let status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        let (status, _) = self
            .terminated
            .wait_timeout_while(status, timeout, |s| s.report.is_none())
            .unwrap_or_else(|e| e.into_inner());
        status.report.clone()
    }

    pub(crate) async fn terminated(&self) -> Option<SessionReport> {
        let mut rx = self.report_tx.subscribe();
        let report = rx.wait_for(Option::is_some).await.ok()?;
        report.clone()
    }
}

/// Handle to a running session.
///
/// Dropping the handle requests a stop; the worker then winds down on its own.
pub struct SessionHandle {
    shared: Arc<SessionShared>,
    worker: Option<JoinHandle<()>>,
    stop_timeout: Duration,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.shared.id()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Asks the worker to drain and close.
    ///
    /// Idempotent and safe to call from any thread. Returns true only for the
    /// call that actually set the flag.
    pub fn request_stop(&self) -> bool {
        self.shared.request_stop()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.shared.stop_requested()
    }

    /// Blocks until the session is terminal or `timeout` elapses.
    pub fn await_termination(&self, timeout: Duration) -> Option<SessionReport> {
        self.shared.wait(timeout)
    }

    /// Resolves once the session is terminal.
    pub async fn terminated(&self) -> Option<SessionReport> {
        self.shared.terminated().await
    }

    /// The terminal report, if the session has ended.
    pub fn report(&self) -> Option<SessionReport> {
        self.shared.report()
    }

    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    /// Requests a stop and waits up to the stop timeout for the worker.
    ///
    /// A worker still running after the deadline is detached; it exits on
    /// its own once its current poll or drain wait completes.
    pub fn stop(mut self) -> Option<SessionReport> {
        self.request_stop();
        let report = self.shared.wait(self.stop_timeout);

        if let Some(worker) = self.worker.take() {
            // The report is published just before the thread returns.
            let deadline = Instant::now() + Duration::from_millis(100);
            while !worker.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if worker.is_finished() {
                if worker.join().is_err() {
                    log::error!("[{}] session thread panicked", self.id());
                }
            } else {
                log::warn!(
                    "[{}] session worker still running after {:?}, detaching",
                    self.id(),
                    self.stop_timeout
                );
            }
        }

        report
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.shared.request_stop();
    }
}

/// Everything the network side needs to drive one session.
pub struct SessionParts {
    pub handle: SessionHandle,
    /// Producer half of the audio queue.
    pub audio: FrameSender,
    /// Transcript events for the client, in recognizer order.
    pub transcripts: TranscriptReceiver,
}

/// Starts sessions against one recognition service.
pub struct SessionCoordinator {
    service: Arc<dyn RecognitionService>,
    params: SessionParams,
    settings: SessionSettings,
    registry: SessionRegistry,
    error_reporter: Arc<dyn ErrorReporter>,
}

impl SessionCoordinator {
    /// Creates a coordinator with the default error reporter and an empty registry.
    pub fn new(
        service: Arc<dyn RecognitionService>,
        params: SessionParams,
        settings: SessionSettings,
    ) -> Self {
        Self {
            service,
            params,
            settings,
            registry: SessionRegistry::new(),
            error_reporter: Arc::new(LogReporter),
        }
    }

    /// Creates a coordinator from the `[recognizer]` and `[session]` config sections.
    pub fn from_config(service: Arc<dyn RecognitionService>, config: &Config) -> Self {
        Self::new(
            service,
            SessionParams::from(&config.recognizer),
            SessionSettings::from(&config.session),
        )
    }

    /// Sets a custom error reporter.
    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.error_reporter = reporter;
        self
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Starts a new session in `AwaitingFirstAudio`.
    ///
    /// The recognizer is not contacted until the first frame is pushed.
    pub fn start(&self) -> Result<SessionParts> {
        let id = SessionId::new();
        let (audio, audio_rx) =
            audio_frame_queue(self.settings.queue_capacity.max(1), self.settings.overflow);
        let (dispatcher, transcripts) =
            result_dispatcher(self.settings.dispatch_capacity, self.settings.post_timeout);
        let shared = Arc::new(SessionShared::new(id));

        let worker = SessionWorker::new(
            shared.clone(),
            self.settings.clone(),
            self.params.clone(),
            self.service.clone(),
            audio_rx,
            dispatcher,
            self.error_reporter.clone(),
        );

        self.registry.insert(shared.clone());
        let registry = self.registry.clone();
        let reporter = self.error_reporter.clone();
        let thread_shared = shared.clone();

        let spawned = thread::Builder::new()
            .name(format!("relay-{id}"))
            .spawn(move || {
                let report = match panic::catch_unwind(AssertUnwindSafe(|| worker.run())) {
                    Ok(report) => report,
                    Err(payload) => {
                        reporter.report("session worker", panic_message(payload.as_ref()));
                        SessionReport::empty(id, SessionState::Failed, EndReason::WorkerPanicked)
                    }
                };
                log_report(&report);
                registry.remove(id);
                thread_shared.finish(report);
            });

        let worker = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.registry.remove(id);
                return Err(RelayError::WorkerSpawn {
                    message: e.to_string(),
                });
            }
        };

        log::info!("[{}] session started ({})", id, self.service.name());
        Ok(SessionParts {
            handle: SessionHandle {
                shared,
                worker: Some(worker),
                stop_timeout: self.settings.stop_timeout,
            },
            audio,
            transcripts,
        })
    }
}

fn log_report(report: &SessionReport) {
    if report.reason.is_failure() {
        log::error!(
            "[{}] session {} ({}), {} frames sent",
            report.id,
            report.state,
            report.reason,
            report.frames_sent
        );
    } else {
        log::info!(
            "[{}] session {} ({}), {} frames sent, {} keepalives, {} transcripts",
            report.id,
            report.state,
            report.reason,
            report.frames_sent,
            report.keepalives_sent,
            report.transcripts_posted
        );
    }
}
