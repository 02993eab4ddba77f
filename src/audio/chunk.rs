// ABOUTME: Audio chunk data model
// ABOUTME: Owned payload buffer tagged as raw PCM or Opus

use crate::error::Error;
use crate::Result;

/// Payload encoding of an [`AudioChunk`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecTag {
    /// Interleaved little-endian PCM
    RawPcm,
    /// One Opus packet
    CompressedOpus,
}

impl CodecTag {
    /// Wire identifier used in audio packets
    pub fn wire_id(self) -> u8 {
        match self {
            CodecTag::RawPcm => 0,
            CodecTag::CompressedOpus => 1,
        }
    }

    /// Name used in intercom control messages
    pub fn as_str(self) -> &'static str {
        match self {
            CodecTag::RawPcm => "pcm",
            CodecTag::CompressedOpus => "opus",
        }
    }
}

/// A discrete unit of audio moving through the pipeline
///
/// The chunk exclusively owns `data`. The payload length (`size()`) is the
/// buffer's length; spare capacity left over from an earlier, larger payload
/// is kept for reuse rather than released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Nominal sample rate in Hz
    pub samples: u32,
    /// Number of interleaved channels
    pub channels: u16,
    /// Bytes per sample per channel
    pub frame_size: u16,
    /// Payload bytes
    pub data: Vec<u8>,
    /// Encoding of `data`
    pub codec: CodecTag,
}

impl AudioChunk {
    /// Create a raw PCM chunk from an interleaved byte buffer
    pub fn pcm(samples: u32, channels: u16, frame_size: u16, data: Vec<u8>) -> Self {
        Self {
            samples,
            channels,
            frame_size,
            data,
            codec: CodecTag::RawPcm,
        }
    }

    /// Create a silent raw PCM chunk lasting `duration_ms` milliseconds
    pub fn silence(samples: u32, channels: u16, frame_size: u16, duration_ms: u32) -> Self {
        let frames = samples as usize * duration_ms as usize / 1000;
        let len = frames * channels as usize * frame_size as usize;
        Self::pcm(samples, channels, frame_size, vec![0u8; len])
    }

    /// Payload length in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Bytes occupied by one frame (one sample across all channels)
    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * self.frame_size as usize
    }

    /// Number of whole frames in a raw PCM payload
    ///
    /// Returns `None` for compressed chunks, whose size says nothing about
    /// their duration.
    pub fn frames(&self) -> Option<usize> {
        match self.codec {
            CodecTag::RawPcm if self.bytes_per_frame() > 0 => {
                Some(self.size() / self.bytes_per_frame())
            }
            _ => None,
        }
    }

    /// Check that every required field is populated
    ///
    /// Raw PCM chunks must additionally hold a whole number of frames.
    pub fn validate(&self) -> Result<()> {
        let missing = if self.samples == 0 {
            Some("samples")
        } else if self.channels == 0 {
            Some("channels")
        } else if self.frame_size == 0 {
            Some("frame_size")
        } else if self.data.is_empty() {
            Some("data")
        } else {
            None
        };

        if let Some(field) = missing {
            return Err(Error::MalformedChunk(format!("{} is empty", field)));
        }

        if self.codec == CodecTag::RawPcm && self.size() % self.bytes_per_frame() != 0 {
            return Err(Error::MalformedChunk(format!(
                "pcm payload of {} bytes is not a multiple of {} bytes per frame",
                self.size(),
                self.bytes_per_frame()
            )));
        }

        Ok(())
    }

    /// Replace the payload, reusing the existing allocation where possible
    pub(crate) fn replace_payload(&mut self, payload: &[u8], codec: CodecTag) {
        self.data.clear();
        self.data.extend_from_slice(payload);
        self.codec = codec;
    }
}
