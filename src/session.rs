//! Bookkeeping for live playback sessions.
//!
//! Every session runs its [`PacedReplay`] on a dedicated thread. The manager
//! owns the only shared mutable state: the map from [`SessionId`] to the
//! session's cancel handle and thread. Whoever removes an entry from that map
//! (an explicit [`SessionManager::close`] or the engine finishing on its own)
//! is the one that releases it, so teardown happens exactly once even when
//! both race.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use tracing::{error, info};

use crate::replay::{
    CancelHandle, PacedReplay, PacketSink, PlaybackReport, ReplayConfig, ReplayState, SessionEnd,
    StateWatch, cancellation,
};
use crate::store::PacketStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub opened: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub failed: u64,
}

struct SessionEntry {
    cancel: CancelHandle,
    state: StateWatch,
    worker: JoinHandle<PlaybackReport>,
}

struct Inner {
    store: PacketStore,
    config: ReplayConfig,
    next_id: AtomicU64,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    stats: Mutex<SessionStats>,
}

impl Inner {
    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, id: SessionId, report: &PlaybackReport) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        match report.end {
            SessionEnd::Cancelled => stats.cancelled += 1,
            SessionEnd::StoreFailed(_) => stats.failed += 1,
            _ => stats.completed += 1,
        }
        info!(
            session = %id,
            state = %report.state,
            end = ?report.end,
            emitted = report.emitted,
            "session torn down"
        );
    }

    /// Called from the session's own thread once the engine has stopped.
    fn retire(&self, id: SessionId, report: &PlaybackReport) {
        let entry = self.sessions().remove(&id);
        if entry.is_some() {
            // The join handle is dropped here: this thread is about to exit.
            self.record(id, report);
        }
    }
}

/// Cloneable handle to the set of live sessions over one recording.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(store: PacketStore, config: ReplayConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                next_id: AtomicU64::new(1),
                sessions: Mutex::new(HashMap::new()),
                stats: Mutex::new(SessionStats::default()),
            }),
        }
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.inner.config
    }

    /// Start a session playing the recording to `sink`.
    pub fn open<S>(&self, sink: S) -> io::Result<SessionId>
    where
        S: PacketSink + 'static,
    {
        let id = SessionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (cancel, signal) = cancellation();
        let engine = PacedReplay::new(self.inner.store.clone(), sink, self.inner.config, signal)
            .with_label(id.to_string());
        let state = engine.state_watch();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        // Hold the map while spawning so the worker cannot retire before it is registered.
        let mut sessions = self.inner.sessions();
        let worker = thread::Builder::new().name(format!("replay-{}", id.get())).spawn(move || {
            let report = engine.run();
            if let Some(inner) = weak.upgrade() {
                inner.retire(id, &report);
            }
            report
        })?;
        sessions.insert(id, SessionEntry { cancel, state, worker });
        drop(sessions);

        self.inner.stats.lock().unwrap_or_else(PoisonError::into_inner).opened += 1;
        info!(session = %id, "session registered");
        Ok(id)
    }

    /// Cancel a session and wait until its engine has released the sink and
    /// cursor. Returns `None` if the session already ended or never existed.
    pub fn close(&self, id: SessionId) -> Option<PlaybackReport> {
        let entry = self.inner.sessions().remove(&id)?;
        Some(self.release(id, entry))
    }

    fn release(&self, id: SessionId, entry: SessionEntry) -> PlaybackReport {
        entry.cancel.cancel();
        let report = match entry.worker.join() {
            Ok(report) => report,
            Err(_) => {
                error!(session = %id, "replay thread panicked");
                PlaybackReport {
                    state: ReplayState::Failed,
                    end: SessionEnd::StoreFailed("replay thread panicked".to_string()),
                    emitted: 0,
                    transitions: vec![ReplayState::Failed],
                }
            }
        };
        self.inner.record(id, &report);
        report
    }

    /// Close every live session.
    pub fn shutdown(&self) -> Vec<(SessionId, PlaybackReport)> {
        let drained: Vec<_> = self.inner.sessions().drain().collect();
        for (_, entry) in &drained {
            entry.cancel.cancel();
        }
        drained.into_iter().map(|(id, entry)| (id, self.release(id, entry))).collect()
    }

    pub fn live(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.inner.sessions().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self, id: SessionId) -> Option<ReplayState> {
        self.inner.sessions().get(&id).map(|e| e.state.get())
    }

    pub fn stats(&self) -> SessionStats {
        *self.inner.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
