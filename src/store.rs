//! Durable, append-only packet store.
//!
//! A store is one file of CRC-framed records (see [`crate::frame`]). The
//! first record is always the stream descriptor; packets follow in append
//! order, which is also playback order.
//!
//! A handle moves through `Uninitialized -> Writable -> ReadOnly -> Closed`.
//! Only the transitions are guarded by a mutex. Readers never take it for
//! long: every [`Scan`] opens its own file handle and owns its position, so
//! any number of replay sessions can read the same recording concurrently.

use once_cell::sync::OnceCell;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::frame::{FrameError, read_frame, write_frame};
use crate::record::{
    DESCRIPTOR_SEQUENCE_ID, FIRST_PACKET_SEQUENCE_ID, FORMAT_VERSION, InboundPacket, RecordFrame,
    SequenceId, StoredPacket, StreamDescriptor,
};

/// What `initialize` does when a recording already exists at the target path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitOptions {
    /// Replace an existing recording. When false, initialization fails with
    /// [`StoreError::AlreadyExists`].
    pub overwrite: bool,
}

impl InitOptions {
    pub fn overwrite() -> Self {
        Self { overwrite: true }
    }
}

/// Header information carried by the descriptor record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingInfo {
    pub version: u16,
    pub created_unix_ns: u128,
    pub descriptor: StreamDescriptor,
}

struct Writer {
    out: BufWriter<File>,
    next_sequence_id: SequenceId,
    last_offset_us: Option<u64>,
}

enum State {
    Uninitialized,
    Writable(Writer),
    ReadOnly,
    Closed,
}

struct Shared {
    path: PathBuf,
    state: Mutex<State>,
    closed: AtomicBool,
    info: OnceCell<RecordingInfo>,
}

/// Cloneable handle to one store location.
#[derive(Clone)]
pub struct PacketStore {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for PacketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketStore")
            .field("path", &self.shared.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn now_unix_ns() -> u128 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos()
}

fn map_frame_error(err: FrameError, path: &Path, after: SequenceId) -> StoreError {
    match err {
        FrameError::Io(source) => StoreError::io(path, source),
        FrameError::Encode(source) => StoreError::Encode(source),
        FrameError::Decode(source) => StoreError::Decode { after, source },
        FrameError::Crc { stored, computed } => StoreError::Corrupt { after, stored, computed },
        FrameError::TooLarge(len) => StoreError::Decode {
            after,
            source: Box::new(bincode::ErrorKind::Custom(format!("frame length {len} exceeds limit"))),
        },
        FrameError::Truncated => StoreError::io(
            path,
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "truncated frame"),
        ),
    }
}

impl PacketStore {
    /// Create an uninitialized handle for `path`. Nothing touches the disk
    /// until [`initialize`](Self::initialize).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_state(path.into(), State::Uninitialized)
    }

    fn with_state(path: PathBuf, state: State) -> Self {
        Self {
            shared: Arc::new(Shared {
                path,
                state: Mutex::new(state),
                closed: AtomicBool::new(false),
                info: OnceCell::new(),
            }),
        }
    }

    /// Open a finished recording for reading.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path).map_err(|e| StoreError::io(&path, e))?;
        let mut rdr = BufReader::new(file);
        let first = read_frame::<_, RecordFrame>(&mut rdr)
            .map_err(|e| map_frame_error(e, &path, DESCRIPTOR_SEQUENCE_ID))?;
        let info = match first {
            Some(RecordFrame::Descriptor { sequence_id, version, created_unix_ns, descriptor })
                if sequence_id == DESCRIPTOR_SEQUENCE_ID =>
            {
                RecordingInfo { version, created_unix_ns, descriptor }
            }
            _ => return Err(StoreError::MissingDescriptor),
        };
        info!(
            path = %path.display(),
            codec = info.descriptor.codec.name(),
            width = info.descriptor.width,
            height = info.descriptor.height,
            "opened recording"
        );
        let store = Self::with_state(path, State::ReadOnly);
        let _ = store.shared.info.set(info);
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Prepare the backing file and write the descriptor record. One-shot:
    /// a second call on the same handle fails with
    /// [`StoreError::AlreadyInitialized`].
    pub fn initialize(&self, descriptor: StreamDescriptor, opts: InitOptions) -> Result<()> {
        let mut state = self.lock();
        match *state {
            State::Uninitialized => {}
            State::Closed => return Err(StoreError::Closed),
            State::Writable(_) | State::ReadOnly => return Err(StoreError::AlreadyInitialized),
        }

        let path = self.shared.path.clone();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
            }
        }
        if path.exists() {
            if !opts.overwrite {
                return Err(StoreError::AlreadyExists { path });
            }
            warn!(path = %path.display(), "replacing existing recording");
            fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        let mut out = BufWriter::with_capacity(1 << 16, file);

        let info = RecordingInfo { version: FORMAT_VERSION, created_unix_ns: now_unix_ns(), descriptor };
        let header = RecordFrame::Descriptor {
            sequence_id: DESCRIPTOR_SEQUENCE_ID,
            version: info.version,
            created_unix_ns: info.created_unix_ns,
            descriptor: info.descriptor.clone(),
        };
        let written = write_frame(&mut out, &header)
            .map_err(|e| map_frame_error(e, &path, DESCRIPTOR_SEQUENCE_ID))
            .and_then(|_| out.flush().map_err(|e| StoreError::io(&path, e)));
        if let Err(e) = written {
            drop(out);
            if let Err(rm) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %rm, "failed to remove partial recording");
            }
            return Err(e);
        }

        info!(
            path = %path.display(),
            codec = info.descriptor.codec.name(),
            width = info.descriptor.width,
            height = info.descriptor.height,
            "packet store initialized"
        );
        let _ = self.shared.info.set(info);
        *state = State::Writable(Writer {
            out,
            next_sequence_id: FIRST_PACKET_SEQUENCE_ID,
            last_offset_us: None,
        });
        Ok(())
    }

    /// Append one packet. `offset` must not be earlier than the previous
    /// packet's; the store rejects regressions instead of reordering.
    pub fn append(&self, offset: Duration, packet: InboundPacket) -> Result<SequenceId> {
        let mut state = self.lock();
        let writer = match &mut *state {
            State::Writable(w) => w,
            State::Uninitialized => return Err(StoreError::NotInitialized),
            State::ReadOnly => return Err(StoreError::ReadOnly),
            State::Closed => return Err(StoreError::Closed),
        };

        let offset_us = u64::try_from(offset.as_micros()).unwrap_or(u64::MAX);
        if let Some(previous_us) = writer.last_offset_us {
            if offset_us < previous_us {
                return Err(StoreError::OutOfOrder { previous_us, offered_us: offset_us });
            }
        }

        let sequence_id = writer.next_sequence_id;
        let frame = RecordFrame::Packet(StoredPacket {
            sequence_id,
            offset_us,
            pts: packet.pts,
            dts: packet.dts,
            key_frame: packet.key_frame.unwrap_or(false),
            payload: packet.payload,
        });
        let path = &self.shared.path;
        let result = write_frame(&mut writer.out, &frame)
            .map_err(|e| map_frame_error(e, path, sequence_id.saturating_sub(1)))
            .and_then(|_| writer.out.flush().map_err(|e| StoreError::io(path, e)));
        if let Err(e) = result {
            // The tail may now hold a partial frame; nothing more may follow it.
            warn!(sequence_id, error = %e, "append failed, store sealed");
            *state = State::ReadOnly;
            return Err(e);
        }

        writer.next_sequence_id += 1;
        writer.last_offset_us = Some(offset_us);
        Ok(sequence_id)
    }

    /// Seal a writable store. Later appends fail with [`StoreError::ReadOnly`].
    pub fn finish(&self) -> Result<()> {
        let mut state = self.lock();
        match std::mem::replace(&mut *state, State::ReadOnly) {
            State::Writable(mut w) => {
                let path = &self.shared.path;
                w.out.flush().map_err(|e| StoreError::io(path, e))?;
                w.out.get_ref().sync_data().map_err(|e| StoreError::io(path, e))?;
                info!(path = %path.display(), packets = w.next_sequence_id - 1, "packet store sealed");
                Ok(())
            }
            State::ReadOnly => Ok(()),
            State::Uninitialized => {
                *state = State::Uninitialized;
                Err(StoreError::NotInitialized)
            }
            State::Closed => {
                *state = State::Closed;
                Err(StoreError::Closed)
            }
        }
    }

    /// Release the backing file. Outstanding scans fail with
    /// [`StoreError::Closed`] on their next read. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut state = self.lock();
        self.shared.closed.store(true, Ordering::Release);
        if let State::Writable(mut w) = std::mem::replace(&mut *state, State::Closed) {
            w.out.flush().map_err(|e| StoreError::io(&self.shared.path, e))?;
        }
        debug!(path = %self.shared.path.display(), "packet store closed");
        Ok(())
    }

    pub fn info(&self) -> Result<&RecordingInfo> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        self.shared.info.get().ok_or(StoreError::NotInitialized)
    }

    pub fn descriptor(&self) -> Result<&StreamDescriptor> {
        self.info().map(|i| &i.descriptor)
    }

    /// Lazily read records with `sequence_id >= from`, in ascending order.
    /// The scan sees the rows that exist now; later appends are not visible
    /// to it.
    pub fn scan(&self, from: SequenceId) -> Result<Scan> {
        {
            let state = self.lock();
            match *state {
                State::Writable(_) | State::ReadOnly => {}
                State::Uninitialized => return Err(StoreError::NotInitialized),
                State::Closed => return Err(StoreError::Closed),
            }
        }
        let path = &self.shared.path;
        let file = File::open(path).map_err(|e| StoreError::io(path, e))?;
        let visible = file.metadata().map_err(|e| StoreError::io(path, e))?.len();
        Ok(Scan {
            shared: Arc::clone(&self.shared),
            reader: BufReader::new(file.take(visible)),
            from,
            last: None,
            done: false,
        })
    }

    /// Like [`scan`](Self::scan) but skips the descriptor record.
    pub fn packets(&self, from: SequenceId) -> Result<Packets> {
        self.scan(from.max(FIRST_PACKET_SEQUENCE_ID)).map(|scan| Packets { scan })
    }
}

/// A read cursor owned by one reader.
pub struct Scan {
    shared: Arc<Shared>,
    reader: BufReader<std::io::Take<File>>,
    from: SequenceId,
    last: Option<SequenceId>,
    done: bool,
}

impl Scan {
    /// Sequence id of the last record read, if any.
    pub fn position(&self) -> Option<SequenceId> {
        self.last
    }
}

impl Iterator for Scan {
    type Item = Result<RecordFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.shared.closed.load(Ordering::Acquire) {
            self.done = true;
            return Some(Err(StoreError::Closed));
        }
        loop {
            match read_frame::<_, RecordFrame>(&mut self.reader) {
                Ok(Some(frame)) => {
                    let seq = frame.sequence_id();
                    self.last = Some(seq);
                    if seq < self.from {
                        continue;
                    }
                    return Some(Ok(frame));
                }
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(FrameError::Truncated) => {
                    warn!(
                        path = %self.shared.path.display(),
                        after = ?self.last,
                        "recording ends with a partial record, ignoring it"
                    );
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    let after = self.last.unwrap_or(DESCRIPTOR_SEQUENCE_ID);
                    return Some(Err(map_frame_error(e, &self.shared.path, after)));
                }
            }
        }
    }
}

/// Packet-only view over a [`Scan`].
pub struct Packets {
    scan: Scan,
}

impl Iterator for Packets {
    type Item = Result<StoredPacket>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.scan.next()? {
                Ok(RecordFrame::Packet(p)) => return Some(Ok(p)),
                Ok(RecordFrame::Descriptor { .. }) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
