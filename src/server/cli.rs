// ABOUTME: CLI argument parsing and startup helpers for the source node
// ABOUTME: Maps command-line flags onto SourceConfig and sets up tracing

use crate::server::config::{SourceConfig, StreamCodec};
use clap::Args;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Source node arguments
///
/// Use with `#[command(flatten)]` in the binary's Args struct.
#[derive(Args, Debug, Clone)]
pub struct SourceArgs {
    /// Named pipe to read raw PCM from
    #[arg(short = 's', long = "source")]
    pub source: PathBuf,

    /// Play-ahead buffer in milliseconds
    #[arg(short = 'b', long, default_value = "1000")]
    pub buffer_ms: u64,

    /// Address to bind the intercom socket to
    #[arg(long, default_value = "0.0.0.0:1704")]
    pub bind: SocketAddr,

    /// Sample rate of the incoming PCM in Hz
    #[arg(long, default_value = "48000")]
    pub sample_rate: u32,

    /// Channel count of the incoming PCM
    #[arg(long, default_value = "2")]
    pub channels: u16,

    /// Chunk duration in milliseconds
    #[arg(long, default_value = "20")]
    pub read_ms: u64,

    /// Codec for outgoing audio
    #[arg(long, value_enum, default_value = "opus")]
    pub codec: StreamCodec,

    /// Opus bitrate in bits per second
    #[arg(long, default_value = "96000")]
    pub bitrate: u32,

    /// Path MTU of the distribution network
    #[arg(long, default_value = "1500")]
    pub mtu: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Enable debug logging (implies --verbose)
    #[arg(short, long)]
    pub debug: bool,
}

impl SourceArgs {
    /// Log filter matching the verbosity flags
    pub fn log_filter(&self) -> &'static str {
        if self.debug {
            "snapsource=trace"
        } else if self.verbose {
            "snapsource=debug"
        } else {
            "snapsource=info"
        }
    }

    /// Initialize tracing based on verbosity flags
    pub fn init_tracing(&self) {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| self.log_filter().into()),
            )
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    /// Log startup information
    pub fn log_startup_info(&self) {
        tracing::info!("Snapsource v{}", env!("CARGO_PKG_VERSION"));
        tracing::info!("Source: {}", self.source.display());
        tracing::info!("Intercom: {}", self.bind);
        tracing::info!(
            "Audio: {}Hz, {} channels, {}ms chunks, {:?} at {} bps",
            self.sample_rate,
            self.channels,
            self.read_ms,
            self.codec,
            self.bitrate
        );
    }

    /// Build SourceConfig from these args
    pub fn build_config(&self) -> SourceConfig {
        SourceConfig::new(self.source.clone())
            .bind_addr(self.bind)
            .sample_rate(self.sample_rate)
            .channels(self.channels)
            .read_ms(self.read_ms)
            .buffer_ms(self.buffer_ms)
            .codec(self.codec)
            .bitrate(self.bitrate)
            .mtu(self.mtu)
    }
}
