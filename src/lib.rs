//! Packet stream recorder and paced player library.
//!
//! This crate provides the core types and logic used by the `packet_vcr`
//! binary (`record` / `serve`) and the `player` tool:
//!
//! - `record`: durable on-disk schema (descriptor and packet records)
//! - `frame`: length + CRC32 + bincode framing shared by files and sockets
//! - `store`: append-only packet store with independent concurrent scans
//! - `capture`: stamps live packets with their arrival offset and appends them
//! - `replay`: per-session playback that reproduces the recorded cadence
//! - `session`: registry of concurrent playback sessions
//! - `wire` / `server`: TCP transport for recording from and serving to peers
pub mod capture;
pub mod cli;
pub mod error;
pub mod frame;
pub mod record;
pub mod replay;
pub mod server;
pub mod session;
pub mod store;
pub mod wire;

pub use capture::{CaptureSummary, CaptureWriter, SourceEvent};
pub use error::{CaptureError, StoreError};
pub use record::{Codec, InboundPacket, RecordFrame, SequenceId, StoredPacket, StreamDescriptor};
pub use replay::{
    PacedReplay, PacketSink, PlaybackReport, ReplayConfig, ReplayState, SessionEnd, SinkError,
    StartPosition,
};
pub use session::{SessionId, SessionManager};
pub use store::{InitOptions, PacketStore};
