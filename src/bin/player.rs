use anyhow::{Context, Result, bail};
use clap::Parser;
use packet_vcr::cli::{PacingArgs, init_logging};
use packet_vcr::replay::{PacedReplay, PacketSink, ReplayConfig, ReplayState, SinkError, cancellation};
use packet_vcr::{Codec, PacketStore, RecordFrame, StoredPacket, StreamDescriptor};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

#[derive(Debug, Parser)]
#[command(about = "Play a recording locally with its original timing, or dump it")]
struct Args {
    /// Recording to read
    #[arg(long, short = 'i')]
    input: PathBuf,

    /// Print every record immediately instead of pacing playback
    #[arg(long, default_value_t = false)]
    dump: bool,

    /// Print the first N payload bytes of each packet in hex
    #[arg(long, default_value_t = 0)]
    hex: usize,

    #[command(flatten)]
    pacing: PacingArgs,
}

/// Prints each packet with how far into playback it was emitted.
struct StdoutSink {
    out: BufWriter<io::Stdout>,
    started: Option<Instant>,
    base_us: Option<u64>,
    hex: usize,
}

fn hex_prefix(payload: &[u8], n: usize) -> String {
    payload.iter().take(n).map(|b| format!("{b:02x}")).collect::<Vec<_>>().join("")
}

impl PacketSink for StdoutSink {
    fn open(&mut self, descriptor: &StreamDescriptor) -> Result<(), SinkError> {
        self.started = Some(Instant::now());
        writeln!(self.out, "playing {}x{} {}", descriptor.width, descriptor.height, descriptor.codec.name())
            .map_err(|e| SinkError::Failed(e.to_string()))
    }

    fn send(&mut self, p: &StoredPacket) -> Result<(), SinkError> {
        let at_ms = self.started.map(|s| s.elapsed().as_secs_f64() * 1e3).unwrap_or_default();
        let base = *self.base_us.get_or_insert(p.offset_us);
        let due_ms = p.offset_us.saturating_sub(base) as f64 / 1e3;
        let line = format!(
            "seq={} offset={:.3}ms at={:.3}ms lag={:+.3}ms key={} bytes={} {}",
            p.sequence_id,
            p.offset_us as f64 / 1e3,
            at_ms,
            at_ms - due_ms,
            p.key_frame,
            p.payload.len(),
            hex_prefix(&p.payload, self.hex)
        );
        let res = writeln!(self.out, "{}", line.trim_end()).and_then(|_| self.out.flush());
        match res {
            Ok(()) => Ok(()),
            // stdout piped into something that quit (e.g. `head`)
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Err(SinkError::Closed),
            Err(e) => Err(SinkError::Failed(e.to_string())),
        }
    }
}

fn describe(codec: &Codec) -> String {
    match codec {
        Codec::Description(blob) => format!("description ({} bytes)", blob.len()),
        other => other.name().to_string(),
    }
}

fn dump(store: &PacketStore, hex: usize) -> Result<()> {
    let mut frames = 0usize;
    let mut last_offset = 0u64;
    for record in store.scan(0)? {
        match record.with_context(|| format!("read record after frame {frames}"))? {
            RecordFrame::Descriptor { sequence_id, version, descriptor, .. } => {
                println!(
                    "seq={} descriptor v{} {}x{} {}",
                    sequence_id,
                    version,
                    descriptor.width,
                    descriptor.height,
                    describe(&descriptor.codec)
                );
            }
            RecordFrame::Packet(p) => {
                if p.offset_us < last_offset {
                    bail!("offset went backwards at seq={}", p.sequence_id);
                }
                last_offset = p.offset_us;
                println!(
                    "seq={} offset={:.3}ms pts={:?} dts={:?} key={} bytes={} {}",
                    p.sequence_id,
                    p.offset_us as f64 / 1e3,
                    p.pts,
                    p.dts,
                    p.key_frame,
                    p.payload.len(),
                    hex_prefix(&p.payload, hex)
                );
            }
        }
        frames += 1;
    }
    eprintln!("Read {} records, {:.3}s of media.", frames, last_offset as f64 / 1e6);
    Ok(())
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_logging();
    let args = Args::parse();
    let store = PacketStore::open(&args.input).with_context(|| format!("open {:?}", args.input))?;

    let info = store.info()?;
    let created = i128::try_from(info.created_unix_ns)
        .ok()
        .and_then(|ns| OffsetDateTime::from_unix_timestamp_nanos(ns).ok())
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| "unknown".to_string());
    eprintln!("Recording v{} created {} ({})", info.version, created, describe(&info.descriptor.codec));

    if args.dump {
        return dump(&store, args.hex);
    }

    let (_cancel, signal) = cancellation();
    let sink = StdoutSink { out: BufWriter::new(io::stdout()), started: None, base_us: None, hex: args.hex };
    let report = PacedReplay::new(store, sink, ReplayConfig::from(&args.pacing), signal).run();
    eprintln!("Played {} packets, session {} ({:?}).", report.emitted, report.state, report.end);
    if report.state == ReplayState::Failed {
        bail!("playback failed: {:?}", report.end);
    }
    Ok(())
}
