//! Live capture: stamps inbound packets with their arrival offset and appends
//! them to a [`PacketStore`].
//!
//! Offsets are taken from the local monotonic clock at the moment a packet is
//! received from the source, anchored on the first packet. The source stamps
//! each event before queueing it, so time spent waiting in the channel does
//! not compress the recorded cadence. Upstream timestamps
//! (pts/dts) are stored untouched and play no part in pacing.

use crossbeam_channel::Receiver;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::error::{CaptureError, StoreError};
use crate::record::{InboundPacket, SequenceId, StreamDescriptor};
use crate::store::{InitOptions, PacketStore};

/// Messages delivered by the inbound packet source, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    Packet { packet: InboundPacket, received: Instant },
    EndOfStream,
    Fatal(String),
}

impl SourceEvent {
    /// A packet received now.
    pub fn received(packet: InboundPacket) -> Self {
        SourceEvent::Packet { packet, received: Instant::now() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSummary {
    pub packets: u64,
    /// Offset of the last captured packet.
    pub duration: Duration,
}

pub struct CaptureWriter {
    store: PacketStore,
    anchor: Option<Instant>,
    last_offset: Duration,
    packets: u64,
    terminated: bool,
}

impl CaptureWriter {
    /// Wrap a store that has already been initialized.
    pub fn new(store: PacketStore) -> Self {
        Self { store, anchor: None, last_offset: Duration::ZERO, packets: 0, terminated: false }
    }

    /// Initialize `store` with `descriptor` and return a writer for it.
    pub fn start(
        store: PacketStore,
        descriptor: StreamDescriptor,
        opts: InitOptions,
    ) -> Result<Self, CaptureError> {
        store.initialize(descriptor, opts)?;
        Ok(Self::new(store))
    }

    pub fn store(&self) -> &PacketStore {
        &self.store
    }

    pub fn summary(&self) -> CaptureSummary {
        CaptureSummary { packets: self.packets, duration: self.last_offset }
    }

    /// Stamp `packet` with the current time and append it.
    pub fn ingest(&mut self, packet: InboundPacket) -> Result<SequenceId, CaptureError> {
        self.ingest_at(packet, Instant::now())
    }

    /// Append `packet` as received at `received`. A receipt time earlier than
    /// the previous packet's is rejected. Any failure terminates the capture:
    /// every later call fails with the store's read-only error.
    pub fn ingest_at(
        &mut self,
        packet: InboundPacket,
        received: Instant,
    ) -> Result<SequenceId, CaptureError> {
        if self.terminated {
            return Err(StoreError::ReadOnly.into());
        }
        let anchor = *self.anchor.get_or_insert(received);
        let result = match received.checked_duration_since(anchor) {
            Some(offset) => self
                .store
                .append(offset, packet)
                .map(|id| (id, offset))
                .map_err(CaptureError::from),
            None => Err(CaptureError::BeforeAnchor {
                early_us: u64::try_from(anchor.duration_since(received).as_micros()).unwrap_or(u64::MAX),
            }),
        };
        match result {
            Ok((sequence_id, offset)) => {
                if self.packets == 0 {
                    info!(path = %self.store.path().display(), "first packet captured");
                }
                self.packets += 1;
                self.last_offset = offset;
                debug!(sequence_id, offset_us = offset.as_micros() as u64, "packet captured");
                Ok(sequence_id)
            }
            Err(e) => {
                error!(error = %e, packets = self.packets, "append failed, terminating capture");
                self.terminated = true;
                Err(e)
            }
        }
    }

    /// Seal the store and report what was captured.
    pub fn finish(mut self) -> Result<CaptureSummary, CaptureError> {
        self.terminated = true;
        self.store.finish()?;
        let summary = self.summary();
        info!(
            packets = summary.packets,
            duration_ms = summary.duration.as_millis() as u64,
            "capture finished"
        );
        Ok(summary)
    }

    /// Drain `events` until end-of-stream. The store is sealed however the
    /// capture ends; a fault leaves the prefix captured so far readable.
    pub fn run(mut self, events: Receiver<SourceEvent>) -> Result<CaptureSummary, CaptureError> {
        info!(path = %self.store.path().display(), "capture started");
        let failure = loop {
            match events.recv() {
                Ok(SourceEvent::Packet { packet, received }) => {
                    if let Err(e) = self.ingest_at(packet, received) {
                        break e;
                    }
                }
                Ok(SourceEvent::EndOfStream) => return self.finish(),
                Ok(SourceEvent::Fatal(reason)) => {
                    error!(%reason, "inbound source failed");
                    break CaptureError::Source(reason);
                }
                Err(_) => break CaptureError::SourceDisconnected,
            }
        };
        if let Err(e) = self.store.finish() {
            error!(error = %e, "failed to seal store after capture fault");
        }
        Err(failure)
    }
}
