use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Position of a record in a store. The descriptor always holds
/// [`DESCRIPTOR_SEQUENCE_ID`]; packets are numbered from 1.
pub type SequenceId = u64;

pub const DESCRIPTOR_SEQUENCE_ID: SequenceId = 0;
pub const FIRST_PACKET_SEQUENCE_ID: SequenceId = 1;

/// On-disk format version written into the descriptor frame.
pub const FORMAT_VERSION: u16 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Codec {
    H264,
    H265,
    Mpeg4,
    Mjpeg,
    /// Opaque capability description handed over by the session protocol (e.g. SDP).
    Description(Vec<u8>),
}

impl Codec {
    pub fn name(&self) -> &'static str {
        match self {
            Codec::H264 => "h264",
            Codec::H265 => "h265",
            Codec::Mpeg4 => "mpeg4",
            Codec::Mjpeg => "mjpeg",
            Codec::Description(_) => "description",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub codec: Codec,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPacket {
    pub sequence_id: SequenceId,
    pub offset_us: u64, // microseconds since the first captured packet
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub key_frame: bool,
    pub payload: Vec<u8>,
}

impl StoredPacket {
    pub fn relative_time_offset(&self) -> Duration {
        Duration::from_micros(self.offset_us)
    }
}

/// A packet as handed over by the inbound source, before it is stamped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundPacket {
    pub payload: Vec<u8>,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub key_frame: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordFrame {
    Descriptor {
        sequence_id: SequenceId,
        version: u16,
        created_unix_ns: u128,
        descriptor: StreamDescriptor,
    },
    Packet(StoredPacket),
}

impl RecordFrame {
    pub fn sequence_id(&self) -> SequenceId {
        match self {
            RecordFrame::Descriptor { sequence_id, .. } => *sequence_id,
            RecordFrame::Packet(p) => p.sequence_id,
        }
    }

    pub fn into_packet(self) -> Option<StoredPacket> {
        match self {
            RecordFrame::Packet(p) => Some(p),
            RecordFrame::Descriptor { .. } => None,
        }
    }
}
