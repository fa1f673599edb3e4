//! Command-line pieces shared by the `packet_vcr` and `player` binaries.

use clap::Args;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::record::FIRST_PACKET_SEQUENCE_ID;
use crate::replay::{ReplayConfig, StartPosition};

/// One minute; a wider window would no longer pace anything.
pub const MAX_LOOKAHEAD_MS: u64 = 60_000;

#[derive(Debug, Clone, Args)]
pub struct PacingArgs {
    /// How far ahead of schedule a packet may be sent, in milliseconds
    #[arg(long, env = "VCR_LOOKAHEAD_MS", default_value_t = 200, value_parser = clap::value_parser!(u64).range(..=MAX_LOOKAHEAD_MS))]
    pub lookahead_ms: u64,

    /// Wait step while a packet is not yet due, in milliseconds
    #[arg(long, env = "VCR_POLL_MS", default_value_t = 20, value_parser = clap::value_parser!(u64).range(1..))]
    pub poll_ms: u64,

    /// First packet sequence id to play
    #[arg(long, default_value_t = FIRST_PACKET_SEQUENCE_ID)]
    pub from: u64,

    /// Start playback at the first key frame
    #[arg(long, default_value_t = false)]
    pub from_key_frame: bool,
}

impl From<&PacingArgs> for ReplayConfig {
    fn from(args: &PacingArgs) -> Self {
        ReplayConfig {
            lookahead: Duration::from_millis(args.lookahead_ms),
            poll_interval: Duration::from_millis(args.poll_ms),
            start: StartPosition { from: args.from, align_to_key_frame: args.from_key_frame },
        }
    }
}

/// Install the fmt subscriber, honoring `RUST_LOG` (default `info`).
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}
