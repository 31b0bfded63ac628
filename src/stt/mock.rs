//! Scriptable in-process recognizer for tests.

use crate::error::{RelayError, Result};
use crate::relay::error::SendError;
use crate::stt::recognizer::{
    EventListener, RecognitionConnection, RecognitionEvent, RecognitionService, SessionParams,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Something the relay sent to the mock recognizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentItem {
    Audio(Vec<u8>),
    KeepAlive,
    Finish,
}

/// Mock recognizer for testing.
///
/// Every connection records what it receives into a shared log. Scripted
/// transcripts are delivered from a separate thread with a small jitter,
/// like a network-driven SDK callback.
pub struct MockRecognitionService {
    name: String,
    log: Arc<Mutex<Vec<SentItem>>>,
    keepalive_times: Arc<Mutex<Vec<Instant>>>,
    connects: AtomicU32,
    connect_failures: u32,
    transcripts: Vec<(String, bool)>,
    finals_on_finish: Vec<String>,
    error_events: Vec<String>,
    send_failures: Arc<Mutex<VecDeque<SendError>>>,
    finish_failures: Arc<Mutex<VecDeque<SendError>>>,
    send_delay: Duration,
    hang_listener: bool,
    // Hung listeners wait on this; they are released when the service drops.
    _release_tx: Sender<()>,
    release_rx: Receiver<()>,
    params_seen: Mutex<Vec<SessionParams>>,
}

impl MockRecognitionService {
    /// Create a mock that accepts every connection and emits nothing.
    pub fn new() -> Self {
        let (release_tx, release_rx) = bounded(0);
        Self {
            name: "mock".to_string(),
            log: Arc::new(Mutex::new(Vec::new())),
            keepalive_times: Arc::new(Mutex::new(Vec::new())),
            connects: AtomicU32::new(0),
            connect_failures: 0,
            transcripts: Vec::new(),
            finals_on_finish: Vec::new(),
            error_events: Vec::new(),
            send_failures: Arc::new(Mutex::new(VecDeque::new())),
            finish_failures: Arc::new(Mutex::new(VecDeque::new())),
            send_delay: Duration::ZERO,
            hang_listener: false,
            _release_tx: release_tx,
            release_rx,
            params_seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Fail the first `count` connection attempts.
    pub fn with_connect_failures(mut self, count: u32) -> Self {
        self.connect_failures = count;
        self
    }

    /// Emit a transcript shortly after each connection opens.
    pub fn with_transcript(mut self, text: &str, is_final: bool) -> Self {
        self.transcripts.push((text.to_string(), is_final));
        self
    }

    /// Emit a final transcript only after `finish()` is received.
    pub fn with_final_on_finish(mut self, text: &str) -> Self {
        self.finals_on_finish.push(text.to_string());
        self
    }

    /// Emit an error event after the scripted transcripts.
    pub fn with_error_event(mut self, message: &str) -> Self {
        self.error_events.push(message.to_string());
        self
    }

    /// Fail upcoming audio sends, one scripted error per send.
    pub fn with_send_failure(self, error: SendError) -> Self {
        if let Ok(mut failures) = self.send_failures.lock() {
            failures.push_back(error);
        }
        self
    }

    /// Fail upcoming `finish()` calls, one scripted error per call.
    pub fn with_finish_failure(self, error: SendError) -> Self {
        if let Ok(mut failures) = self.finish_failures.lock() {
            failures.push_back(error);
        }
        self
    }

    /// Make every audio send take `delay`.
    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = delay;
        self
    }

    /// Never let the listener terminate, even after `finish()`.
    pub fn with_hung_listener(mut self) -> Self {
        self.hang_listener = true;
        self
    }

    /// Everything received across all connections, in order.
    pub fn sent(&self) -> Vec<SentItem> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Audio payloads received, in order.
    pub fn audio_sent(&self) -> Vec<Vec<u8>> {
        self.sent()
            .into_iter()
            .filter_map(|item| match item {
                SentItem::Audio(data) => Some(data),
                _ => None,
            })
            .collect()
    }

    pub fn keepalive_count(&self) -> usize {
        self.count(|item| matches!(item, SentItem::KeepAlive))
    }

    /// When each keepalive arrived, in order.
    pub fn keepalive_times(&self) -> Vec<Instant> {
        self.keepalive_times
            .lock()
            .map(|times| times.clone())
            .unwrap_or_default()
    }

    pub fn finish_count(&self) -> usize {
        self.count(|item| matches!(item, SentItem::Finish))
    }

    /// Connection attempts made, including failed ones.
    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Parameters of every successful connection.
    pub fn params_seen(&self) -> Vec<SessionParams> {
        self.params_seen
            .lock()
            .map(|seen| seen.clone())
            .unwrap_or_default()
    }

    fn count(&self, predicate: impl Fn(&SentItem) -> bool) -> usize {
        self.log
            .lock()
            .map(|log| log.iter().filter(|item| predicate(item)).count())
            .unwrap_or(0)
    }
}

impl Default for MockRecognitionService {
    fn default() -> Self {
        Self::new()
    }
}

impl RecognitionService for MockRecognitionService {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(
        &self,
        params: &SessionParams,
        listener: EventListener,
    ) -> Result<Box<dyn RecognitionConnection>> {
        let attempt = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.connect_failures {
            return Err(RelayError::RecognizerConnect {
                service: self.name.clone(),
                message: format!("mock connect failure #{attempt}"),
            });
        }
        if let Ok(mut seen) = self.params_seen.lock() {
            seen.push(params.clone());
        }

        let (finish_tx, finish_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(0);
        let script = ListenerScript {
            transcripts: self.transcripts.clone(),
            finals_on_finish: self.finals_on_finish.clone(),
            error_events: self.error_events.clone(),
            hang: self.hang_listener,
            release_rx: self.release_rx.clone(),
        };

        thread::Builder::new()
            .name("mock-listener".to_string())
            .spawn(move || {
                script.run(&listener, &finish_rx);
                drop(done_tx);
            })
            .map_err(|e| RelayError::WorkerSpawn {
                message: e.to_string(),
            })?;

        Ok(Box::new(MockConnection {
            log: self.log.clone(),
            keepalive_times: self.keepalive_times.clone(),
            send_failures: self.send_failures.clone(),
            finish_failures: self.finish_failures.clone(),
            send_delay: self.send_delay,
            finish_tx: Some(finish_tx),
            done_rx,
            closed: false,
        }))
    }
}

struct ListenerScript {
    transcripts: Vec<(String, bool)>,
    finals_on_finish: Vec<String>,
    error_events: Vec<String>,
    hang: bool,
    release_rx: Receiver<()>,
}

impl ListenerScript {
    fn run(self, listener: &EventListener, finish_rx: &Receiver<()>) {
        listener(RecognitionEvent::Opened);

        for (i, (text, is_final)) in self.transcripts.into_iter().enumerate() {
            thread::sleep(jitter(i));
            listener(RecognitionEvent::Transcript { text, is_final });
        }
        for message in self.error_events {
            listener(RecognitionEvent::Error(message));
        }

        // Finish or connection drop both disconnect or signal this channel.
        finish_rx.recv().ok();

        if self.hang {
            self.release_rx.recv().ok();
            return;
        }

        for (i, text) in self.finals_on_finish.into_iter().enumerate() {
            thread::sleep(jitter(i));
            listener(RecognitionEvent::Transcript {
                text,
                is_final: true,
            });
        }
        listener(RecognitionEvent::Closed);
    }
}

/// Deterministic delay between 0 and 3ms.
fn jitter(i: usize) -> Duration {
    Duration::from_micros(((i as u64 * 7919) % 7) * 500)
}

struct MockConnection {
    log: Arc<Mutex<Vec<SentItem>>>,
    keepalive_times: Arc<Mutex<Vec<Instant>>>,
    send_failures: Arc<Mutex<VecDeque<SendError>>>,
    finish_failures: Arc<Mutex<VecDeque<SendError>>>,
    send_delay: Duration,
    finish_tx: Option<Sender<()>>,
    done_rx: Receiver<()>,
    closed: bool,
}

impl MockConnection {
    fn record(&self, item: SentItem) {
        if let Ok(mut log) = self.log.lock() {
            log.push(item);
        }
    }

    fn ensure_open(&self) -> std::result::Result<(), SendError> {
        if self.closed {
            Err(SendError::Fatal("connection closed".to_string()))
        } else {
            Ok(())
        }
    }
}

impl RecognitionConnection for MockConnection {
    fn send_audio(&mut self, audio: &[u8]) -> std::result::Result<(), SendError> {
        self.ensure_open()?;
        if !self.send_delay.is_zero() {
            thread::sleep(self.send_delay);
        }

        let scripted = self
            .send_failures
            .lock()
            .ok()
            .and_then(|mut failures| failures.pop_front());
        if let Some(error) = scripted {
            if !error.is_transient() {
                self.closed = true;
            }
            return Err(error);
        }

        self.record(SentItem::Audio(audio.to_vec()));
        Ok(())
    }

    fn send_keepalive(&mut self) -> std::result::Result<(), SendError> {
        self.ensure_open()?;
        if let Ok(mut times) = self.keepalive_times.lock() {
            times.push(Instant::now());
        }
        self.record(SentItem::KeepAlive);
        Ok(())
    }

    fn finish(&mut self) -> std::result::Result<(), SendError> {
        self.ensure_open()?;
        let scripted = self
            .finish_failures
            .lock()
            .ok()
            .and_then(|mut failures| failures.pop_front());
        if let Some(error) = scripted {
            if !error.is_transient() {
                self.closed = true;
            }
            return Err(error);
        }

        self.record(SentItem::Finish);
        self.closed = true;
        if let Some(tx) = self.finish_tx.take() {
            tx.try_send(()).ok();
        }
        Ok(())
    }

    fn wait_closed(&mut self, timeout: Duration) -> bool {
        match self.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collecting_listener() -> (EventListener, Arc<Mutex<Vec<RecognitionEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let listener: EventListener = Arc::new(move |event| {
            sink.lock().unwrap().push(event);
        });
        (listener, events)
    }

    #[test]
    fn test_mock_records_sent_items_in_order() {
        let service = MockRecognitionService::new();
        let (listener, _) = collecting_listener();
        let mut conn = service.connect(&SessionParams::default(), listener).unwrap();

        conn.send_audio(&[1]).unwrap();
        conn.send_keepalive().unwrap();
        conn.send_audio(&[2, 3]).unwrap();
        conn.finish().unwrap();

        assert_eq!(
            service.sent(),
            vec![
                SentItem::Audio(vec![1]),
                SentItem::KeepAlive,
                SentItem::Audio(vec![2, 3]),
                SentItem::Finish,
            ]
        );
        assert_eq!(service.keepalive_count(), 1);
        assert_eq!(service.finish_count(), 1);
    }

    #[test]
    fn test_mock_emits_scripted_events() {
        let service = MockRecognitionService::new()
            .with_transcript("hel", false)
            .with_transcript("hello", true)
            .with_final_on_finish("world");
        let (listener, events) = collecting_listener();
        let mut conn = service.connect(&SessionParams::default(), listener).unwrap();

        conn.finish().unwrap();
        assert!(conn.wait_closed(Duration::from_secs(2)));

        let events = events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                RecognitionEvent::Opened,
                RecognitionEvent::Transcript {
                    text: "hel".to_string(),
                    is_final: false
                },
                RecognitionEvent::Transcript {
                    text: "hello".to_string(),
                    is_final: true
                },
                RecognitionEvent::Transcript {
                    text: "world".to_string(),
                    is_final: true
                },
                RecognitionEvent::Closed,
            ]
        );
    }

    #[test]
    fn test_mock_connect_failures_then_success() {
        let service = MockRecognitionService::new().with_connect_failures(2);

        for _ in 0..2 {
            let (listener, _) = collecting_listener();
            match service.connect(&SessionParams::default(), listener) {
                Err(RelayError::RecognizerConnect { service, .. }) => assert_eq!(service, "mock"),
                _ => panic!("Expected RecognizerConnect error"),
            }
        }
        let (listener, _) = collecting_listener();
        assert!(service.connect(&SessionParams::default(), listener).is_ok());
        assert_eq!(service.connect_count(), 3);
        assert_eq!(service.params_seen().len(), 1);
    }

    #[test]
    fn test_mock_fatal_send_closes_connection() {
        let service = MockRecognitionService::new()
            .with_send_failure(SendError::Transient("busy".to_string()))
            .with_send_failure(SendError::Fatal("gone".to_string()));
        let (listener, _) = collecting_listener();
        let mut conn = service.connect(&SessionParams::default(), listener).unwrap();

        assert!(conn.send_audio(&[1]).unwrap_err().is_transient());
        assert!(!conn.send_audio(&[1]).unwrap_err().is_transient());
        assert!(conn.send_keepalive().is_err());
        assert!(service.audio_sent().is_empty());
    }

    #[test]
    fn test_mock_hung_listener_times_out() {
        let service = MockRecognitionService::new().with_hung_listener();
        let (listener, _) = collecting_listener();
        let mut conn = service.connect(&SessionParams::default(), listener).unwrap();

        conn.finish().unwrap();
        assert!(!conn.wait_closed(Duration::from_millis(50)));
    }

    #[test]
    fn test_mock_drop_without_finish_releases_listener() {
        let service = MockRecognitionService::new();
        let (listener, events) = collecting_listener();
        let conn = service.connect(&SessionParams::default(), listener).unwrap();
        drop(conn);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while std::time::Instant::now() < deadline {
            if events.lock().unwrap().last() == Some(&RecognitionEvent::Closed) {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("listener did not terminate after connection drop");
    }
}
