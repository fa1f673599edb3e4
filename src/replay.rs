//! Paced replay of a recording to one outbound sink.
//!
//! Each [`PacedReplay`] owns its own cursor into the store and its own
//! wall-clock anchor, so any number of sessions can play the same recording
//! at once without sharing pacing state.
//!
//! A packet whose schedule `anchor + offset` falls within `lookahead` of now
//! is sent immediately. Otherwise the engine waits in `poll_interval` steps
//! and checks again, which keeps cancellation latency bounded by one poll
//! and tolerates clock adjustments during long gaps. Packets may go out late
//! but never earlier than `lookahead` ahead of schedule.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::record::{FIRST_PACKET_SEQUENCE_ID, SequenceId, StoredPacket, StreamDescriptor};
use crate::store::PacketStore;

pub const DEFAULT_LOOKAHEAD: Duration = Duration::from_millis(200);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Where a session begins playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartPosition {
    /// First sequence id eligible for playback.
    pub from: SequenceId,
    /// Skip packets until the first key frame at or after `from`.
    pub align_to_key_frame: bool,
}

impl Default for StartPosition {
    fn default() -> Self {
        Self { from: FIRST_PACKET_SEQUENCE_ID, align_to_key_frame: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayConfig {
    pub lookahead: Duration,
    pub poll_interval: Duration,
    pub start: StartPosition,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            lookahead: DEFAULT_LOOKAHEAD,
            poll_interval: DEFAULT_POLL_INTERVAL,
            start: StartPosition::default(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The consumer went away. A normal end of session.
    #[error("sink closed")]
    Closed,
    #[error("sink failed: {0}")]
    Failed(String),
}

/// Outbound side of one playback session.
pub trait PacketSink: Send {
    /// Called once with the recording's descriptor before any packet.
    fn open(&mut self, descriptor: &StreamDescriptor) -> Result<(), SinkError> {
        let _ = descriptor;
        Ok(())
    }

    fn send(&mut self, packet: &StoredPacket) -> Result<(), SinkError>;
}

impl<S: PacketSink + ?Sized> PacketSink for Box<S> {
    fn open(&mut self, descriptor: &StreamDescriptor) -> Result<(), SinkError> {
        (**self).open(descriptor)
    }

    fn send(&mut self, packet: &StoredPacket) -> Result<(), SinkError> {
        (**self).send(packet)
    }
}

impl PacketSink for Sender<StoredPacket> {
    fn send(&mut self, packet: &StoredPacket) -> Result<(), SinkError> {
        Sender::send(self, packet.clone()).map_err(|_| SinkError::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayState {
    Starting,
    Streaming,
    Draining,
    Closed,
    Failed,
}

impl ReplayState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ReplayState::Closed | ReplayState::Failed)
    }
}

impl fmt::Display for ReplayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReplayState::Starting => "starting",
            ReplayState::Streaming => "streaming",
            ReplayState::Draining => "draining",
            ReplayState::Closed => "closed",
            ReplayState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    Exhausted,
    SinkClosed,
    SinkFailed(String),
    Cancelled,
    StoreFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackReport {
    pub state: ReplayState,
    pub end: SessionEnd,
    pub emitted: u64,
    /// Every state the session passed through, starting with `Starting`.
    pub transitions: Vec<ReplayState>,
}

/// Shared view of a running session's state.
#[derive(Debug, Clone)]
pub struct StateWatch(Arc<Mutex<ReplayState>>);

impl StateWatch {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(ReplayState::Starting)))
    }

    pub fn get(&self) -> ReplayState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, state: ReplayState) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// Requests cancellation of one session. Dropping every handle also cancels.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Sender<()>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Engine side of a cancellation pair.
#[derive(Debug)]
pub struct CancelSignal {
    rx: Receiver<()>,
    fired: bool,
}

impl CancelSignal {
    pub fn is_cancelled(&mut self) -> bool {
        if !self.fired {
            self.fired = !matches!(self.rx.try_recv(), Err(TryRecvError::Empty));
        }
        self.fired
    }

    /// Sleep for up to `timeout`, returning early (with `true`) on cancellation.
    pub fn wait(&mut self, timeout: Duration) -> bool {
        if !self.fired {
            self.fired = !matches!(self.rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout));
        }
        self.fired
    }
}

pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = bounded(1);
    (CancelHandle { tx }, CancelSignal { rx, fired: false })
}

pub struct PacedReplay<S> {
    store: PacketStore,
    sink: S,
    config: ReplayConfig,
    cancel: CancelSignal,
    watch: StateWatch,
    transitions: Vec<ReplayState>,
    label: String,
}

impl<S: PacketSink> PacedReplay<S> {
    pub fn new(store: PacketStore, sink: S, config: ReplayConfig, cancel: CancelSignal) -> Self {
        Self {
            store,
            sink,
            config,
            cancel,
            watch: StateWatch::new(),
            transitions: vec![ReplayState::Starting],
            label: String::from("replay"),
        }
    }

    /// Name used in log lines for this session.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn state_watch(&self) -> StateWatch {
        self.watch.clone()
    }

    fn transition(&mut self, next: ReplayState) {
        if self.transitions.last() == Some(&next) {
            return;
        }
        debug!(session = %self.label, from = %self.watch.get(), to = %next, "replay state");
        self.transitions.push(next);
        self.watch.set(next);
    }

    fn finish(mut self, end: SessionEnd, emitted: u64) -> PlaybackReport {
        let state = match end {
            SessionEnd::StoreFailed(ref reason) => {
                error!(session = %self.label, %reason, emitted, "replay failed");
                ReplayState::Failed
            }
            SessionEnd::SinkFailed(ref reason) => {
                warn!(session = %self.label, %reason, emitted, "sink failed, ending session");
                ReplayState::Closed
            }
            _ => {
                debug!(session = %self.label, end = ?end, emitted, "replay ended");
                ReplayState::Closed
            }
        };
        self.transition(state);
        // self (cursor owner, sink) is dropped on return
        PlaybackReport { state, end, emitted, transitions: std::mem::take(&mut self.transitions) }
    }

    /// Block until `target` is within the lookahead window. Returns false if
    /// cancelled while waiting.
    fn wait_until(&mut self, target: Instant) -> bool {
        loop {
            let Some(window) = Instant::now().checked_add(self.config.lookahead) else {
                return true;
            };
            if target <= window {
                return true;
            }
            let step = self.config.poll_interval.min(target.saturating_duration_since(window));
            if self.cancel.wait(step) {
                return false;
            }
        }
    }

    /// Play the recording to the sink until it is exhausted, the sink goes
    /// away, the session is cancelled, or the store fails.
    pub fn run(mut self) -> PlaybackReport {
        let descriptor = match self.store.descriptor() {
            Ok(d) => d.clone(),
            Err(e) => return self.finish(SessionEnd::StoreFailed(e.to_string()), 0),
        };
        let mut cursor = match self.store.packets(self.config.start.from) {
            Ok(c) => c,
            Err(e) => return self.finish(SessionEnd::StoreFailed(e.to_string()), 0),
        };
        match self.sink.open(&descriptor) {
            Ok(()) => {}
            Err(SinkError::Closed) => return self.finish(SessionEnd::SinkClosed, 0),
            Err(SinkError::Failed(reason)) => return self.finish(SessionEnd::SinkFailed(reason), 0),
        }

        let local_anchor = Instant::now();
        let mut base_offset: Option<Duration> = None;
        let mut emitted = 0u64;

        loop {
            if self.cancel.is_cancelled() {
                return self.finish(SessionEnd::Cancelled, emitted);
            }
            let packet = match cursor.next() {
                Some(Ok(p)) => p,
                Some(Err(e)) => return self.finish(SessionEnd::StoreFailed(e.to_string()), emitted),
                None => {
                    self.transition(ReplayState::Draining);
                    return self.finish(SessionEnd::Exhausted, emitted);
                }
            };
            if base_offset.is_none() && self.config.start.align_to_key_frame && !packet.key_frame {
                trace!(session = %self.label, sequence_id = packet.sequence_id, "skipping until key frame");
                continue;
            }
            self.transition(ReplayState::Streaming);

            let offset = packet.relative_time_offset();
            let base = *base_offset.get_or_insert(offset);
            let target = local_anchor.checked_add(offset.saturating_sub(base)).unwrap_or(local_anchor);
            if !self.wait_until(target) {
                return self.finish(SessionEnd::Cancelled, emitted);
            }

            let now = Instant::now();
            if target.checked_add(self.config.lookahead).is_some_and(|late| now > late) {
                trace!(
                    session = %self.label,
                    sequence_id = packet.sequence_id,
                    late_us = now.duration_since(target).as_micros() as u64,
                    "packet behind schedule"
                );
            }
            match self.sink.send(&packet) {
                Ok(()) => emitted += 1,
                Err(SinkError::Closed) => return self.finish(SessionEnd::SinkClosed, emitted),
                Err(SinkError::Failed(reason)) => {
                    return self.finish(SessionEnd::SinkFailed(reason), emitted);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Codec, InboundPacket};
    use crate::store::InitOptions;
    use crossbeam_channel::unbounded;

    fn store_with(offsets_ms: &[u64], key: &[bool]) -> (tempfile::TempDir, PacketStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = PacketStore::new(dir.path().join("r.vcr"));
        store
            .initialize(
                StreamDescriptor { codec: Codec::H264, width: 640, height: 360 },
                InitOptions::default(),
            )
            .unwrap();
        for (i, ms) in offsets_ms.iter().enumerate() {
            let packet = InboundPacket {
                payload: vec![i as u8],
                pts: None,
                dts: None,
                key_frame: key.get(i).copied(),
            };
            store.append(Duration::from_millis(*ms), packet).unwrap();
        }
        store.finish().unwrap();
        (dir, store)
    }

    fn fast() -> ReplayConfig {
        ReplayConfig {
            lookahead: Duration::from_millis(2),
            poll_interval: Duration::from_millis(1),
            start: StartPosition::default(),
        }
    }

    #[test]
    fn cancel_signal_is_sticky() {
        let (handle, mut signal) = cancellation();
        assert!(!signal.is_cancelled());
        handle.cancel();
        handle.cancel();
        assert!(signal.is_cancelled());
        assert!(signal.is_cancelled());
        assert!(signal.wait(Duration::from_secs(5)));
    }

    #[test]
    fn dropping_handle_cancels() {
        let (handle, mut signal) = cancellation();
        drop(handle);
        assert!(signal.wait(Duration::from_secs(5)));
    }

    #[test]
    fn empty_recording_drains_without_emitting() {
        let (_dir, store) = store_with(&[], &[]);
        let (tx, rx) = unbounded::<StoredPacket>();
        let (_h, signal) = cancellation();
        let report = PacedReplay::new(store, tx, fast(), signal).run();
        assert_eq!(
            report.transitions,
            vec![ReplayState::Starting, ReplayState::Draining, ReplayState::Closed]
        );
        assert_eq!(report.end, SessionEnd::Exhausted);
        assert_eq!(report.emitted, 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_sink_is_a_normal_end() {
        let (_dir, store) = store_with(&[0, 1, 2], &[]);
        let (tx, rx) = unbounded::<StoredPacket>();
        drop(rx);
        let (_h, signal) = cancellation();
        let report = PacedReplay::new(store, tx, fast(), signal).run();
        assert_eq!(report.state, ReplayState::Closed);
        assert_eq!(report.end, SessionEnd::SinkClosed);
        assert_eq!(report.emitted, 0);
    }

    #[test]
    fn closed_store_fails_the_session() {
        let (_dir, store) = store_with(&[0, 1], &[]);
        store.close().unwrap();
        let (tx, _rx) = unbounded::<StoredPacket>();
        let (_h, signal) = cancellation();
        let report = PacedReplay::new(store, tx, fast(), signal).run();
        assert_eq!(report.state, ReplayState::Failed);
        assert!(matches!(report.end, SessionEnd::StoreFailed(_)));
    }

    #[test]
    fn key_frame_alignment_rebases_the_schedule() {
        let (_dir, store) = store_with(&[0, 500, 1000, 1010], &[false, false, true, false]);
        let (tx, rx) = unbounded::<StoredPacket>();
        let (_h, signal) = cancellation();
        let mut config = fast();
        config.start.align_to_key_frame = true;
        let started = Instant::now();
        let report = PacedReplay::new(store, tx, config, signal).run();
        let ids: Vec<_> = rx.try_iter().map(|p| p.sequence_id).collect();
        assert_eq!(ids, vec![3, 4]);
        assert_eq!(report.emitted, 2);
        // schedule starts at the key frame, not at the recording's start
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn start_position_skips_earlier_packets() {
        let (_dir, store) = store_with(&[0, 5, 10, 15], &[]);
        let (tx, rx) = unbounded::<StoredPacket>();
        let (_h, signal) = cancellation();
        let mut config = fast();
        config.start.from = 3;
        PacedReplay::new(store, tx, config, signal).run();
        let ids: Vec<_> = rx.try_iter().map(|p| p.sequence_id).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[test]
    fn cancellation_stops_a_long_wait() {
        let (_dir, store) = store_with(&[0, 60_000], &[]);
        let (tx, rx) = unbounded::<StoredPacket>();
        let (handle, signal) = cancellation();
        let config = ReplayConfig { poll_interval: Duration::from_millis(10), ..fast() };
        let engine = PacedReplay::new(store, tx, config, signal);
        let watch = engine.state_watch();
        let worker = std::thread::spawn(move || engine.run());

        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first.sequence_id, 1);
        let cancelled_at = Instant::now();
        handle.cancel();
        let report = worker.join().unwrap();
        assert!(cancelled_at.elapsed() < Duration::from_secs(1));
        assert_eq!(report.end, SessionEnd::Cancelled);
        assert_eq!(report.emitted, 1);
        assert_eq!(watch.get(), ReplayState::Closed);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn huge_lookahead_sends_everything_at_once() {
        let (_dir, store) = store_with(&[0, 60_000, 120_000], &[]);
        let (tx, rx) = unbounded::<StoredPacket>();
        let (_h, signal) = cancellation();
        let config = ReplayConfig { lookahead: Duration::MAX, ..fast() };
        let started = Instant::now();
        let report = PacedReplay::new(store, tx, config, signal).run();
        assert_eq!(report.end, SessionEnd::Exhausted);
        assert_eq!(rx.try_iter().count(), 3);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
