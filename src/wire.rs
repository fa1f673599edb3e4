//! TCP transport used by the `record` and `serve` commands.
//!
//! A stream is one `WireFrame::Descriptor` followed by `WireFrame::Packet`
//! frames, using the same framing as the store file. A publisher closing the
//! connection on a frame boundary is end-of-stream.

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use tracing::{debug, info, warn};

use crate::capture::SourceEvent;
use crate::frame::{FrameError, read_frame, write_frame};
use crate::record::{InboundPacket, StoredPacket, StreamDescriptor};
use crate::replay::{PacketSink, SinkError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireFrame {
    Descriptor(StreamDescriptor),
    Packet(InboundPacket),
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

fn sink_error(err: FrameError) -> SinkError {
    match err {
        FrameError::Io(e) if is_disconnect(&e) => SinkError::Closed,
        other => SinkError::Failed(other.to_string()),
    }
}

/// Sends a playback session to one TCP consumer. Dropping the sink shuts the
/// socket down so the consumer and any monitor on the other half notice.
pub struct TcpSink {
    out: BufWriter<TcpStream>,
    peer: Option<SocketAddr>,
}

impl TcpSink {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "set_nodelay failed");
        }
        Self { out: BufWriter::new(stream), peer }
    }

    fn write(&mut self, frame: &WireFrame) -> Result<(), SinkError> {
        write_frame(&mut self.out, frame).map_err(sink_error)?;
        self.out.flush().map_err(|e| sink_error(e.into()))
    }
}

impl PacketSink for TcpSink {
    fn open(&mut self, descriptor: &StreamDescriptor) -> Result<(), SinkError> {
        self.write(&WireFrame::Descriptor(descriptor.clone()))
    }

    fn send(&mut self, packet: &StoredPacket) -> Result<(), SinkError> {
        self.write(&WireFrame::Packet(InboundPacket {
            payload: packet.payload.clone(),
            pts: packet.pts,
            dts: packet.dts,
            key_frame: Some(packet.key_frame),
        }))
    }
}

impl Drop for TcpSink {
    fn drop(&mut self) {
        let _ = self.out.flush();
        if let Err(e) = self.out.get_ref().shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                debug!(peer = ?self.peer, error = %e, "socket shutdown failed");
            }
        }
    }
}

/// Inbound side: a connection to a publisher speaking the wire format.
pub struct TcpSource {
    reader: BufReader<TcpStream>,
    peer: SocketAddr,
}

impl TcpSource {
    /// Connect and read the stream descriptor.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<(StreamDescriptor, Self)> {
        let stream = TcpStream::connect(addr)?;
        let peer = stream.peer_addr()?;
        Self::from_stream(BufReader::new(stream), peer)
    }

    fn from_stream(
        mut reader: BufReader<TcpStream>,
        peer: SocketAddr,
    ) -> io::Result<(StreamDescriptor, Self)> {
        match read_frame::<_, WireFrame>(&mut reader) {
            Ok(Some(WireFrame::Descriptor(descriptor))) => {
                info!(%peer, codec = descriptor.codec.name(), "connected to publisher");
                Ok((descriptor, Self { reader, peer }))
            }
            Ok(Some(WireFrame::Packet(_))) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "publisher sent a packet before the stream descriptor",
            )),
            Ok(None) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "publisher closed before sending a descriptor",
            )),
            Err(FrameError::Io(e)) => Err(e),
            Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        }
    }

    /// Forward every packet to `events` in arrival order, stamped as it comes
    /// off the socket, then exactly one of `EndOfStream` or `Fatal`. Returns
    /// early if the receiver goes away.
    pub fn pump(mut self, events: Sender<SourceEvent>) {
        let mut forwarded = 0u64;
        let last = loop {
            match read_frame::<_, WireFrame>(&mut self.reader) {
                Ok(Some(WireFrame::Packet(packet))) => {
                    if events.send(SourceEvent::received(packet)).is_err() {
                        debug!(peer = %self.peer, "capture stopped, leaving source");
                        return;
                    }
                    forwarded += 1;
                }
                Ok(Some(WireFrame::Descriptor(_))) => {
                    break SourceEvent::Fatal("descriptor changed mid-stream".to_string());
                }
                Ok(None) => break SourceEvent::EndOfStream,
                Err(e) => break SourceEvent::Fatal(e.to_string()),
            }
        };
        match &last {
            SourceEvent::Fatal(reason) => warn!(peer = %self.peer, %reason, forwarded, "source failed"),
            _ => info!(peer = %self.peer, forwarded, "publisher ended stream"),
        }
        let _ = events.send(last);
    }
}

/// Block until the consumer on `stream` hangs up. Consumers never send
/// anything, so any data is discarded.
pub fn wait_for_hangup(mut stream: TcpStream) {
    let mut buf = [0u8; 256];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return,
        }
    }
}

/// Writes a wire stream: used by publishers and tests.
pub struct WireWriter<W: Write> {
    out: W,
}

impl<W: Write> WireWriter<W> {
    pub fn start(mut out: W, descriptor: &StreamDescriptor) -> Result<Self, FrameError> {
        write_frame(&mut out, &WireFrame::Descriptor(descriptor.clone()))?;
        out.flush()?;
        Ok(Self { out })
    }

    pub fn packet(&mut self, packet: InboundPacket) -> Result<(), FrameError> {
        write_frame(&mut self.out, &WireFrame::Packet(packet))?;
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Codec;
    use crossbeam_channel::unbounded;
    use std::net::TcpListener;
    use std::thread;

    fn descriptor() -> StreamDescriptor {
        StreamDescriptor { codec: Codec::Description(b"v=0".to_vec()), width: 1280, height: 720 }
    }

    #[test]
    fn source_forwards_packets_then_end_of_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let publisher = thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            let mut w = WireWriter::start(conn, &descriptor()).unwrap();
            for i in 0..3u8 {
                w.packet(InboundPacket { payload: vec![i], pts: Some(i as i64), ..Default::default() })
                    .unwrap();
            }
        });

        let (desc, source) = TcpSource::connect(addr).unwrap();
        assert_eq!(desc, descriptor());
        let (tx, rx) = unbounded();
        source.pump(tx);
        publisher.join().unwrap();

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 4);
        assert!(matches!(events[2], SourceEvent::Packet { ref packet, .. } if packet.payload == vec![2]));
        assert_eq!(events[3], SourceEvent::EndOfStream);
    }

    #[test]
    fn source_requires_descriptor_first() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let publisher = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            write_frame(&mut conn, &WireFrame::Packet(InboundPacket::default())).unwrap();
        });
        let err = TcpSource::connect(addr).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        publisher.join().unwrap();
    }

    #[test]
    fn sink_writes_descriptor_then_packets() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let consumer = thread::spawn(move || {
            let mut r = BufReader::new(TcpStream::connect(addr).unwrap());
            let mut frames = Vec::new();
            while let Some(f) = read_frame::<_, WireFrame>(&mut r).unwrap() {
                frames.push(f);
            }
            frames
        });
        let (conn, _) = listener.accept().unwrap();
        let mut sink = TcpSink::new(conn);
        sink.open(&descriptor()).unwrap();
        let packet = StoredPacket {
            sequence_id: 1,
            offset_us: 0,
            pts: Some(3000),
            dts: Some(3000),
            key_frame: true,
            payload: vec![0, 0, 1],
        };
        sink.send(&packet).unwrap();
        drop(sink);

        let frames = consumer.join().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], WireFrame::Descriptor(descriptor()));
        assert!(matches!(&frames[1], WireFrame::Packet(p) if p.key_frame == Some(true) && p.pts == Some(3000)));
    }
}
