use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::bounded;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::thread;
use tracing::{error, info};

use packet_vcr::cli::{PacingArgs, init_logging};
use packet_vcr::replay::ReplayConfig;
use packet_vcr::server::Server;
use packet_vcr::wire::TcpSource;
use packet_vcr::{CaptureWriter, InitOptions, PacketStore, SessionManager, SourceEvent};

#[derive(Debug, Parser)]
#[command(version, about = "Record a live packet stream and serve it back with its original timing")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Capture a stream from a publisher into a recording
    Record {
        /// Publisher address (host:port)
        #[arg(long, env = "VCR_SOURCE")]
        source: String,

        /// Output file path; defaults to captures/NAME_YYYY_MM_DD.vcr
        #[arg(long, env = "VCR_OUT_FILE")]
        out: Option<PathBuf>,

        /// Name used for the default output file
        #[arg(long, env = "VCR_NAME", default_value = "stream")]
        name: String,

        /// Replace an existing recording at the output path
        #[arg(long, default_value_t = false)]
        overwrite: bool,
    },
    /// Play a recording to every consumer that connects
    Serve {
        /// Recording to serve
        #[arg(long, env = "VCR_STORE")]
        store: PathBuf,

        /// Listen address
        #[arg(long, env = "VCR_LISTEN", default_value = "0.0.0.0:8554")]
        listen: SocketAddr,

        #[command(flatten)]
        pacing: PacingArgs,
    },
}

fn default_out_path(name: &str) -> PathBuf {
    let date = time::OffsetDateTime::now_local()
        .unwrap_or_else(|_| time::OffsetDateTime::now_utc())
        .date();
    let fname = format!("{}_{}_{:02}_{:02}.vcr", name, date.year(), date.month() as u8, date.day());
    let mut p = PathBuf::from("captures");
    p.push(fname);
    p
}

fn record(source: &str, out: PathBuf, overwrite: bool) -> Result<()> {
    let (descriptor, source) =
        TcpSource::connect(source).with_context(|| format!("connect to publisher {source}"))?;

    let store = PacketStore::new(&out);
    let writer = CaptureWriter::start(store.clone(), descriptor, InitOptions { overwrite })
        .with_context(|| format!("initialize recording {}", out.display()))?;

    let (tx, rx) = bounded::<SourceEvent>(8192);
    let tx_stop = tx.clone();
    ctrlc::set_handler(move || {
        let _ = tx_stop.send(SourceEvent::EndOfStream);
    })
    .context("install Ctrl+C handler")?;

    thread::Builder::new()
        .name("source".into())
        .spawn(move || source.pump(tx))
        .context("spawn source thread")?;

    let summary = writer.run(rx).context("capture aborted")?;
    store.close().context("close recording")?;
    info!(
        path = %out.display(),
        packets = summary.packets,
        duration_ms = summary.duration.as_millis() as u64,
        "recording complete"
    );
    Ok(())
}

fn serve(path: PathBuf, listen: SocketAddr, config: ReplayConfig) -> Result<()> {
    let store = PacketStore::open(&path).with_context(|| format!("open recording {}", path.display()))?;
    let sessions = SessionManager::new(store.clone(), config);
    let server = Server::bind(listen, sessions.clone()).with_context(|| format!("bind {listen}"))?;

    ctrlc::set_handler(move || {
        let closed = sessions.shutdown();
        info!(sessions = closed.len(), "shutting down");
        let _ = store.close();
        std::process::exit(0);
    })
    .context("install Ctrl+C handler")?;

    server.run().context("accept loop")?;
    Ok(())
}

fn main() -> Result<()> {
    // Load environment variables from .env if present
    let _ = dotenv();
    init_logging();
    let args = Args::parse();

    let result = match args.command {
        Command::Record { source, out, name, overwrite } => {
            let out = out.unwrap_or_else(|| default_out_path(&name));
            record(&source, out, overwrite)
        }
        Command::Serve { store, listen, pacing } => serve(store, listen, ReplayConfig::from(&pacing)),
    };
    if let Err(e) = &result {
        error!("{e:#}");
    }
    result
}
