//! Length + CRC framing shared by the store file and the wire transport.
//!
//! Each frame is `[u32 LE len][u32 LE crc32(payload)][payload]` where the
//! payload is a bincode-encoded value.

use crc32fast::Hasher as Crc32;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{self, Read, Write};
use thiserror::Error;

pub const FRAME_HEADER_LEN: usize = 8;

/// Upper bound on a single payload; anything larger is treated as corruption.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame I/O error")]
    Io(#[from] io::Error),

    #[error("bincode encode")]
    Encode(#[source] bincode::Error),

    #[error("bincode decode")]
    Decode(#[source] bincode::Error),

    #[error("CRC mismatch: stored={stored:#x}, computed={computed:#x}")]
    Crc { stored: u32, computed: u32 },

    #[error("frame length {0} exceeds limit")]
    TooLarge(u32),

    /// The input ended part-way through a frame.
    #[error("truncated frame")]
    Truncated,
}

fn crc32(payload: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Writes one frame and returns the number of bytes written.
pub fn write_frame<W: Write, T: Serialize>(w: &mut W, value: &T) -> Result<usize, FrameError> {
    let payload = bincode::serialize(value).map_err(FrameError::Encode)?;
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge(u32::MAX))?;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&crc32(&payload).to_le_bytes())?;
    w.write_all(&payload)?;
    Ok(FRAME_HEADER_LEN + payload.len())
}

/// Fills `buf` completely. Returns `Ok(false)` if the input was already at
/// EOF, `Truncated` if it ended after a partial read.
fn fill<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<bool, FrameError> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(FrameError::Truncated),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

/// Reads one frame. `Ok(None)` means a clean end of input on a frame boundary.
pub fn read_frame<R: Read, T: DeserializeOwned>(r: &mut R) -> Result<Option<T>, FrameError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    if !fill(r, &mut header)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let stored = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    if !fill(r, &mut payload)? && len > 0 {
        return Err(FrameError::Truncated);
    }
    let computed = crc32(&payload);
    if computed != stored {
        return Err(FrameError::Crc { stored, computed });
    }
    bincode::deserialize(&payload).map(Some).map_err(FrameError::Decode)
}
