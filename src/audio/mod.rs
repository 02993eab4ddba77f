// ABOUTME: Audio module for snapsource
// ABOUTME: Chunk data model and lossy codec adapter

/// Audio chunk type and codec tags
pub mod chunk;
/// Opus codec adapter with silence fallback
pub mod codec;

pub use chunk::{AudioChunk, CodecTag};
pub use codec::{
    CodecBackend, CodecContext, CodecState, DecodeOutcome, EncodeOutcome, FrameDecoder,
    FrameEncoder, OpusBackend,
};
