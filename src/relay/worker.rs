//! The session worker: a blocking state machine that moves audio from the
//! queue into the recognizer connection.
//!
//! Runs on its own thread so that slow or blocking recognizer calls never
//! stall the network task. The stop flag is checked once per iteration,
//! between sends, so a stop is observed within one poll timeout.

use crate::relay::clock::deadline_after;
use crate::relay::dispatcher::{PostOutcome, ResultDispatcher};
use crate::relay::error::{ErrorReporter, SendError, panic_message};
use crate::relay::keepalive::KeepAliveScheduler;
use crate::relay::queue::{FrameReceiver, PullOutcome};
use crate::relay::session::{SessionSettings, SessionShared};
use crate::relay::types::{AudioFrame, EndReason, SessionId, SessionReport, SessionState, TranscriptEvent};
use crate::stt::recognizer::{
    EventListener, RecognitionConnection, RecognitionEvent, RecognitionService, SessionParams,
};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Pause before connection attempt `n + 1`, multiplied by `n`.
const CONNECT_BACKOFF: Duration = Duration::from_millis(250);

/// Pause between retries of a frame after a transient send failure.
const SEND_RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// How the streaming phase ended.
enum StreamExit {
    /// Finish the connection gracefully.
    Drain(EndReason),
    /// The connection is unusable.
    Failed,
}

pub(crate) struct SessionWorker {
    shared: Arc<SessionShared>,
    settings: SessionSettings,
    params: SessionParams,
    service: Arc<dyn RecognitionService>,
    audio: FrameReceiver,
    dispatcher: ResultDispatcher,
    error_reporter: Arc<dyn ErrorReporter>,
    frames_sent: u64,
    frames_dropped: u64,
    keepalives_sent: u64,
    teardown_timed_out: bool,
}

impl SessionWorker {
    pub(crate) fn new(
        shared: Arc<SessionShared>,
        settings: SessionSettings,
        params: SessionParams,
        service: Arc<dyn RecognitionService>,
        audio: FrameReceiver,
        dispatcher: ResultDispatcher,
        error_reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            shared,
            settings,
            params,
            service,
            audio,
            dispatcher,
            error_reporter,
            frames_sent: 0,
            frames_dropped: 0,
            keepalives_sent: 0,
            teardown_timed_out: false,
        }
    }

    /// Runs the session to a terminal state.
    pub(crate) fn run(mut self) -> SessionReport {
        let (state, reason) = self.drive();
        SessionReport {
            id: self.id(),
            state,
            reason,
            frames_sent: self.frames_sent,
            frames_dropped: self.frames_dropped,
            keepalives_sent: self.keepalives_sent,
            transcripts_posted: self.dispatcher.stats().posted(),
            teardown_timed_out: self.teardown_timed_out,
        }
    }

    fn id(&self) -> SessionId {
        self.shared.id()
    }

    fn drive(&mut self) -> (SessionState, EndReason) {
        let first = match self.await_first_audio() {
            Ok(frame) => frame,
            Err(reason) => return (SessionState::Closed, reason),
        };

        self.shared.set_state(SessionState::Connecting);
        let mut connection = match self.connect() {
            Ok(connection) => connection,
            Err(EndReason::ConnectFailure) => {
                return (SessionState::Failed, EndReason::ConnectFailure);
            }
            Err(reason) => return (SessionState::Closed, reason),
        };

        self.shared.set_state(SessionState::Streaming);
        let result = match self.stream(connection.as_mut(), first) {
            StreamExit::Drain(reason) => {
                self.shared.set_state(SessionState::Draining);
                self.drain(connection.as_mut());
                (SessionState::Closed, reason)
            }
            StreamExit::Failed => (SessionState::Failed, EndReason::SendFailure),
        };

        // The only release of the connection handle.
        drop(connection);
        result
    }

    fn await_first_audio(&mut self) -> Result<AudioFrame, EndReason> {
        let deadline = deadline_after(self.settings.first_audio_grace);
        loop {
            if self.shared.stop_requested() {
                return Err(EndReason::StopRequested);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                log::info!(
                    "[{}] no audio within {:?}, closing",
                    self.id(),
                    self.settings.first_audio_grace
                );
                return Err(EndReason::GracePeriodExpired);
            }

            match self.audio.pull(remaining.min(self.settings.poll_timeout)) {
                PullOutcome::Frame(frame) => return Ok(frame),
                PullOutcome::Empty => {}
                PullOutcome::Closed => return Err(EndReason::InputEnded),
            }
        }
    }

    fn connect(&mut self) -> Result<Box<dyn RecognitionConnection>, EndReason> {
        let attempts = self.settings.connect_attempts.max(1);
        let listener = self.listener();

        for attempt in 1..=attempts {
            match self.service.connect(&self.params, listener.clone()) {
                Ok(connection) => {
                    log::debug!(
                        "[{}] connected to {} (attempt {}/{})",
                        self.id(),
                        self.service.name(),
                        attempt,
                        attempts
                    );
                    return Ok(connection);
                }
                Err(e) => {
                    log::error!(
                        "[{}] connect attempt {}/{} failed: {}",
                        self.id(),
                        attempt,
                        attempts,
                        e
                    );
                }
            }

            if attempt < attempts {
                thread::sleep(CONNECT_BACKOFF * attempt);
                if self.shared.stop_requested() {
                    return Err(EndReason::StopRequested);
                }
            }
        }

        Err(EndReason::ConnectFailure)
    }

    fn stream(&mut self, connection: &mut dyn RecognitionConnection, first: AudioFrame) -> StreamExit {
        let mut keepalive = KeepAliveScheduler::new(self.settings.keepalive_idle);

        if self.forward(connection, &first, &mut keepalive).is_err() {
            return StreamExit::Failed;
        }

        loop {
            if self.shared.stop_requested() {
                return StreamExit::Drain(EndReason::StopRequested);
            }

            match self.audio.pull(self.settings.poll_timeout) {
                PullOutcome::Frame(frame) => {
                    if self.forward(connection, &frame, &mut keepalive).is_err() {
                        return StreamExit::Failed;
                    }
                }
                PullOutcome::Empty => {
                    if keepalive.on_idle_poll() {
                        match connection.send_keepalive() {
                            Ok(()) => {
                                self.keepalives_sent += 1;
                                log::debug!("[{}] keepalive sent", self.id());
                            }
                            Err(e) if e.is_transient() => {
                                log::warn!("[{}] keepalive not sent: {}", self.id(), e);
                            }
                            Err(e) => {
                                log::error!("[{}] keepalive failed: {}", self.id(), e);
                                return StreamExit::Failed;
                            }
                        }
                    }
                }
                PullOutcome::Closed => {
                    log::debug!("[{}] input ended", self.id());
                    return StreamExit::Drain(EndReason::InputEnded);
                }
            }
        }
    }

    /// Sends one frame, retrying transient failures. Only a fatal failure is
    /// returned; a frame that exhausts its retries is dropped and counted.
    fn forward(
        &mut self,
        connection: &mut dyn RecognitionConnection,
        frame: &AudioFrame,
        keepalive: &mut KeepAliveScheduler,
    ) -> Result<(), SendError> {
        let mut retries = 0;
        loop {
            match connection.send_audio(frame.data()) {
                Ok(()) => {
                    self.frames_sent += 1;
                    keepalive.record_activity();
                    return Ok(());
                }
                Err(e) if e.is_transient() && retries < self.settings.send_retries => {
                    retries += 1;
                    log::debug!(
                        "[{}] frame #{} retry {}: {}",
                        self.id(),
                        frame.sequence(),
                        retries,
                        e
                    );
                    thread::sleep(SEND_RETRY_BACKOFF);
                }
                Err(e) if e.is_transient() => {
                    self.frames_dropped += 1;
                    log::warn!("[{}] dropped frame #{}: {}", self.id(), frame.sequence(), e);
                    return Ok(());
                }
                Err(e) => {
                    log::error!("[{}] frame #{}: {}", self.id(), frame.sequence(), e);
                    return Err(e);
                }
            }
        }
    }

    fn drain(&mut self, connection: &mut dyn RecognitionConnection) {
        self.finish(connection);
        if !connection.wait_closed(self.settings.drain_timeout) {
            self.teardown_timed_out = true;
            log::warn!(
                "[{}] recognizer listener still running after {:?}, releasing",
                self.id(),
                self.settings.drain_timeout
            );
        }
    }

    /// Asks the recognizer to flush, retrying transient failures like audio.
    fn finish(&mut self, connection: &mut dyn RecognitionConnection) {
        let mut retries = 0;
        loop {
            match connection.finish() {
                Ok(()) => return,
                Err(e) if e.is_transient() && retries < self.settings.send_retries => {
                    retries += 1;
                    log::debug!("[{}] finish retry {}: {}", self.id(), retries, e);
                    thread::sleep(SEND_RETRY_BACKOFF);
                }
                Err(e) => {
                    log::warn!("[{}] finish failed: {}", self.id(), e);
                    return;
                }
            }
        }
    }

    /// Callback handed to the recognizer. Runs on the recognizer's thread.
    fn listener(&self) -> EventListener {
        let id = self.id();
        let dispatcher = self.dispatcher.clone();
        let reporter = self.error_reporter.clone();

        Arc::new(move |event| {
            let handled = panic::catch_unwind(AssertUnwindSafe(|| {
                handle_event(id, &dispatcher, reporter.as_ref(), event)
            }));
            if let Err(payload) = handled {
                reporter.report("recognizer callback", panic_message(payload.as_ref()));
            }
        })
    }
}

fn handle_event(
    id: SessionId,
    dispatcher: &ResultDispatcher,
    reporter: &dyn ErrorReporter,
    event: RecognitionEvent,
) {
    match event {
        RecognitionEvent::Opened => log::debug!("[{}] recognizer opened", id),
        RecognitionEvent::Transcript { text, is_final } => {
            if text.is_empty() {
                return;
            }
            if dispatcher.post(TranscriptEvent::new(text, is_final)) == PostOutcome::Closed {
                log::debug!("[{}] transcript after client went away", id);
            }
        }
        RecognitionEvent::Closed => log::debug!("[{}] recognizer closed", id),
        RecognitionEvent::Error(message) => reporter.report("recognizer", &message),
    }
}
