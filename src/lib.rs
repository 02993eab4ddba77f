// ABOUTME: Main library entry point for snapsource
// ABOUTME: Exports the reactor, scheduler, pipe reader and codec adapter

//! # snapsource
//!
//! Source-side node for synchronized multi-room audio streaming.
//!
//! Raw PCM is read from a local named pipe in fixed-duration chunks, optionally
//! compressed with Opus, and handed to a distribution layer that fans the audio
//! out to remote playback clients. Everything runs on one thread, driven by a
//! readiness-based reactor.
//!
//! ## Components
//!
//! - **Audio chunk**: the unit of audio moving through the pipeline
//! - **Codec adapter**: lazy Opus decode/encode with a silence fallback
//! - **Pipe reader**: turns a byte stream into chunks, reporting backpressure
//! - **Task scheduler**: deferred callbacks exposed as one readiness source
//! - **Reactor**: the event loop dispatching to all of the above
//!
//! ## Example: Running a source node
//!
//! ```no_run
//! use snapsource::server::{AppContext, Reactor, SourceConfig, UdpIntercom};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> snapsource::Result<()> {
//!     let config = SourceConfig::new("/tmp/snapfifo").read_ms(20);
//!     let ctx = AppContext::new(config)?;
//!
//!     let pipe = snapsource::server::open_pipe(&ctx.config.pipe_path)?;
//!     let intercom = UdpIntercom::bind(&ctx).await?;
//!
//!     let mut reactor = Reactor::new(&ctx, pipe, intercom)?;
//!     reactor.run().await
//! }
//! ```

#![warn(missing_docs)]

/// Audio chunks and codec processing
pub mod audio;
/// Intercom control messages and audio packet layout
pub mod protocol;
/// Reactor, scheduler, pipe reader and distribution
pub mod server;

pub use audio::{AudioChunk, CodecContext, CodecTag};
pub use server::{Reactor, SourceConfig, TaskScheduler};

/// Result type for snapsource operations
pub type Result<T> = std::result::Result<T, error::Error>;

/// Error types for snapsource
pub mod error {
    use crate::audio::CodecTag;
    use crate::server::SourceId;
    use thiserror::Error;

    /// Error types for snapsource operations
    ///
    /// Every variant is fatal at the process boundary. Recoverable conditions
    /// (a single failed decode or encode, a pipe with no data) are reported
    /// through `Ok` outcomes instead.
    #[derive(Error, Debug)]
    pub enum Error {
        /// A chunk reached the codec with missing fields
        #[error("Malformed chunk: {0}")]
        MalformedChunk(String),

        /// The decoder could not be constructed
        #[error("Failed to create decoder: {0}")]
        DecoderInit(String),

        /// The encoder could not be constructed or configured
        #[error("Failed to create encoder: {0}")]
        EncoderInit(String),

        /// The codec is not ready (never initialized, or construction failed earlier)
        #[error("Codec unavailable: {0}")]
        CodecUnavailable(&'static str),

        /// A chunk carried an unexpected codec tag
        #[error("Wrong codec: expected {expected:?}, found {found:?}")]
        WrongCodec {
            /// Tag the operation requires
            expected: CodecTag,
            /// Tag the chunk carried
            found: CodecTag,
        },

        /// A registered source reported an error or hangup condition
        #[error("Source {id:?} failed: {condition}")]
        SourceFailed {
            /// Source that reported the condition
            id: SourceId,
            /// Human-readable condition ("error", "hangup")
            condition: &'static str,
        },

        /// Invalid configuration
        #[error("Configuration error: {0}")]
        Config(String),

        /// I/O error while setting up the reactor or its sources
        #[error("I/O error: {0}")]
        Io(#[from] std::io::Error),
    }
}
