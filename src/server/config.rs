// ABOUTME: Source node configuration
// ABOUTME: Stream format, chunk timing, codec and transport parameters

use crate::error::Error;
use crate::protocol::messages::AUDIO_PACKET_HEADER_LEN;
use crate::server::clock::{Clock, ServerClock};
use crate::Result;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// Payload codec used for outgoing audio
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StreamCodec {
    /// Forward raw PCM chunks
    Pcm,
    /// Compress every chunk into one Opus packet
    Opus,
}

/// Sample rates libopus accepts
const OPUS_SAMPLE_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

/// Whole-millisecond frame durations libopus accepts
const OPUS_FRAME_MS: [u64; 5] = [5, 10, 20, 40, 60];

/// Source node configuration
#[derive(Clone, Debug)]
pub struct SourceConfig {
    /// Named pipe (or file) to read raw PCM from
    pub pipe_path: PathBuf,
    /// Address the intercom socket binds to
    pub bind_addr: SocketAddr,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of interleaved channels
    pub channels: u16,
    /// Bytes per sample per channel
    pub frame_size: u16,
    /// Chunk duration in milliseconds (also the pipe retry delay)
    pub read_ms: u64,
    /// How far ahead of now clients are told to play each chunk
    pub buffer_ms: u64,
    /// Outgoing payload codec
    pub codec: StreamCodec,
    /// Opus target bitrate in bits per second
    pub bitrate: u32,
    /// Path MTU of the distribution network
    pub mtu: usize,
}

impl SourceConfig {
    /// Create a configuration reading from `pipe_path` with default settings
    pub fn new(pipe_path: impl Into<PathBuf>) -> Self {
        Self {
            pipe_path: pipe_path.into(),
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the sample rate in Hz
    pub fn sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = rate;
        self
    }

    /// Set the channel count
    pub fn channels(mut self, channels: u16) -> Self {
        self.channels = channels;
        self
    }

    /// Set the chunk duration in milliseconds
    pub fn read_ms(mut self, ms: u64) -> Self {
        self.read_ms = ms;
        self
    }

    /// Set the play-ahead buffer in milliseconds
    pub fn buffer_ms(mut self, ms: u64) -> Self {
        self.buffer_ms = ms;
        self
    }

    /// Set the outgoing codec
    pub fn codec(mut self, codec: StreamCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Set the Opus bitrate
    pub fn bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }

    /// Set the path MTU
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    /// Frames (per channel) in one chunk
    pub fn frames_per_chunk(&self) -> usize {
        (self.sample_rate as u64 * self.read_ms / 1000) as usize
    }

    /// Bytes in one raw PCM chunk
    pub fn chunk_bytes(&self) -> usize {
        self.frames_per_chunk() * self.channels as usize * self.frame_size as usize
    }

    /// Largest payload that fits in one audio packet
    pub fn max_segment_size(&self) -> usize {
        self.mtu.saturating_sub(AUDIO_PACKET_HEADER_LEN)
    }

    /// Check the configuration for values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 || self.channels == 0 || self.frame_size == 0 {
            return Err(Error::Config(
                "sample rate, channels and frame size must be positive".to_string(),
            ));
        }
        if self.frames_per_chunk() == 0 {
            return Err(Error::Config(format!(
                "{}ms at {}Hz holds no frames",
                self.read_ms, self.sample_rate
            )));
        }
        if self.mtu <= AUDIO_PACKET_HEADER_LEN {
            return Err(Error::Config(format!(
                "mtu {} leaves no room after the {} byte packet header",
                self.mtu, AUDIO_PACKET_HEADER_LEN
            )));
        }

        if self.codec == StreamCodec::Opus {
            if self.frame_size != 2 {
                return Err(Error::Config("opus requires 16-bit samples".to_string()));
            }
            if !matches!(self.channels, 1 | 2) {
                return Err(Error::Config("opus supports mono or stereo only".to_string()));
            }
            if !OPUS_SAMPLE_RATES.contains(&self.sample_rate) {
                return Err(Error::Config(format!(
                    "opus does not support {}Hz",
                    self.sample_rate
                )));
            }
            if !OPUS_FRAME_MS.contains(&self.read_ms) {
                return Err(Error::Config(format!(
                    "opus frames must be one of {:?} ms, got {}ms",
                    OPUS_FRAME_MS, self.read_ms
                )));
            }
        }

        Ok(())
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            pipe_path: PathBuf::from("/tmp/snapfifo"),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 1704)),
            sample_rate: 48000,
            channels: 2,
            frame_size: 2,
            read_ms: 20,
            buffer_ms: 1000,
            codec: StreamCodec::Opus,
            bitrate: 96000,
            mtu: 1500,
        }
    }
}

/// Process-wide state shared by every component
///
/// Built once by the entry point and passed by reference into constructors.
#[derive(Clone)]
pub struct AppContext {
    /// Immutable configuration
    pub config: Arc<SourceConfig>,
    /// Clock used for scheduling and packet timestamps
    pub clock: Arc<dyn Clock>,
    /// Identifier announced to clients
    pub server_id: String,
}

impl AppContext {
    /// Validate `config` and build a context on the real server clock
    pub fn new(config: SourceConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(ServerClock::new()))
    }

    /// Validate `config` and build a context on a custom clock
    pub fn with_clock(config: SourceConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            clock,
            server_id: uuid::Uuid::new_v4().to_string(),
        })
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("config", &self.config)
            .field("server_id", &self.server_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_derived_sizes() {
        let config = SourceConfig::default();
        // 48000 Hz * 20ms = 960 frames * 4 bytes
        assert_eq!(config.frames_per_chunk(), 960);
        assert_eq!(config.chunk_bytes(), 3840);
        assert_eq!(config.max_segment_size(), 1500 - AUDIO_PACKET_HEADER_LEN);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_opus_rejects_odd_frame_duration() {
        let config = SourceConfig::new("/tmp/fifo").read_ms(15);
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        // PCM has no frame duration constraint
        let config = config.codec(StreamCodec::Pcm);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_tiny_mtu() {
        let config = SourceConfig::new("/tmp/fifo").mtu(AUDIO_PACKET_HEADER_LEN);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_context_validates() {
        let bad = SourceConfig::new("/tmp/fifo").channels(0);
        assert!(AppContext::new(bad).is_err());

        let ctx = AppContext::new(SourceConfig::new("/tmp/fifo")).unwrap();
        assert_eq!(ctx.config.pipe_path, PathBuf::from("/tmp/fifo"));
        assert!(!ctx.server_id.is_empty());
    }
}
