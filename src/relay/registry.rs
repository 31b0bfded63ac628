//! Live-session bookkeeping for shutdown.

use crate::relay::clock::deadline_after;
use crate::relay::session::SessionShared;
use crate::relay::types::{SessionId, SessionState};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Sessions that have not yet reached a terminal state.
///
/// Sessions are inserted when started and removed by their worker thread
/// right before the terminal report is published.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<SessionId, Arc<SessionShared>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, session: Arc<SessionShared>) {
        self.lock().insert(session.id(), session);
    }

    pub(crate) fn remove(&self, id: SessionId) {
        self.lock().remove(&id);
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.lock().keys().copied().collect()
    }

    /// Current state of every live session.
    pub fn states(&self) -> Vec<(SessionId, SessionState)> {
        self.lock()
            .values()
            .map(|session| (session.id(), session.state()))
            .collect()
    }

    /// Requests a stop on every live session. Returns how many were newly stopped.
    pub fn stop_all(&self) -> usize {
        let sessions: Vec<_> = self.lock().values().cloned().collect();
        sessions
            .iter()
            .filter(|session| session.request_stop())
            .count()
    }

    /// Waits until every session has ended or `timeout` elapses.
    ///
    /// Returns false if sessions were still live at the deadline.
    pub async fn wait_empty(&self, timeout: Duration) -> bool {
        let deadline = deadline_after(timeout);
        loop {
            if self.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                log::warn!(
                    "{} session(s) still running after {:?}",
                    self.len(),
                    timeout
                );
                return false;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, Arc<SessionShared>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}
