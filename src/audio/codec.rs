// ABOUTME: Opus codec adapter for audio chunks
// ABOUTME: Lazy decoder, explicit encoder init, silence fallback on decode failure

use crate::audio::chunk::{AudioChunk, CodecTag};
use crate::error::Error;
use crate::Result;

/// Longest unit Opus can carry in one packet, in milliseconds
pub const OPUS_MAX_CHUNK_LENGTH_MS: usize = 120;

/// Duration of the silence substituted for an undecodable packet
pub const SILENCE_FALLBACK_MS: u32 = 5;

/// Opus works on 16-bit samples only
const OPUS_SAMPLE_BYTES: u16 = 2;

/// Decode primitive: one compressed packet into interleaved 16-bit samples
pub trait FrameDecoder {
    /// Decode `packet` into `out`, returning the number of frames written
    fn decode(&mut self, packet: &[u8], out: &mut [i16]) -> std::result::Result<usize, String>;
}

/// Encode primitive: interleaved 16-bit samples into one compressed packet
pub trait FrameEncoder {
    /// Encode `pcm` into `out`, returning the number of bytes written
    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> std::result::Result<usize, String>;
}

/// Factory for decode/encode primitives
pub trait CodecBackend {
    /// Construct a decoder for the given stream parameters
    fn create_decoder(
        &mut self,
        sample_rate: u32,
        channels: u16,
    ) -> std::result::Result<Box<dyn FrameDecoder>, String>;

    /// Construct an encoder for the given stream parameters and target bitrate
    fn create_encoder(
        &mut self,
        sample_rate: u32,
        channels: u16,
        bitrate: u32,
    ) -> std::result::Result<Box<dyn FrameEncoder>, String>;
}

/// libopus backend
#[derive(Debug, Default, Clone, Copy)]
pub struct OpusBackend;

fn opus_channels(channels: u16) -> std::result::Result<opus::Channels, String> {
    match channels {
        1 => Ok(opus::Channels::Mono),
        2 => Ok(opus::Channels::Stereo),
        other => Err(format!("unsupported channel count: {}", other)),
    }
}

impl CodecBackend for OpusBackend {
    fn create_decoder(
        &mut self,
        sample_rate: u32,
        channels: u16,
    ) -> std::result::Result<Box<dyn FrameDecoder>, String> {
        let decoder = opus::Decoder::new(sample_rate, opus_channels(channels)?)
            .map_err(|e| e.to_string())?;
        Ok(Box::new(decoder))
    }

    fn create_encoder(
        &mut self,
        sample_rate: u32,
        channels: u16,
        bitrate: u32,
    ) -> std::result::Result<Box<dyn FrameEncoder>, String> {
        let mut encoder = opus::Encoder::new(
            sample_rate,
            opus_channels(channels)?,
            opus::Application::Audio,
        )
        .map_err(|e| e.to_string())?;

        let bits = i32::try_from(bitrate).map_err(|_| format!("bitrate {} out of range", bitrate))?;
        encoder
            .set_bitrate(opus::Bitrate::Bits(bits))
            .map_err(|e| format!("failed to set bitrate: {}", e))?;

        Ok(Box::new(encoder))
    }
}

impl FrameDecoder for opus::Decoder {
    fn decode(&mut self, packet: &[u8], out: &mut [i16]) -> std::result::Result<usize, String> {
        opus::Decoder::decode(self, packet, out, false).map_err(|e| e.to_string())
    }
}

impl FrameEncoder for opus::Encoder {
    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> std::result::Result<usize, String> {
        opus::Encoder::encode(self, pcm, out).map_err(|e| e.to_string())
    }
}

/// Construction status of a decoder or encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecState {
    /// Not constructed yet (or torn down)
    Uninitialized,
    /// Constructed and usable
    Ready,
    /// Construction was attempted and failed; it is not retried
    Failed,
}

enum Slot<T> {
    Uninitialized,
    Ready(T),
    Failed,
}

impl<T> Slot<T> {
    fn state(&self) -> CodecState {
        match self {
            Slot::Uninitialized => CodecState::Uninitialized,
            Slot::Ready(_) => CodecState::Ready,
            Slot::Failed => CodecState::Failed,
        }
    }
}

/// Result of a decode that did not hit a fatal condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// The packet decoded into this many frames
    Decoded {
        /// Frames per channel written to the chunk
        frames: usize,
    },
    /// The packet was rejected and replaced by a short silence
    Silenced,
}

/// Result of an encode that did not hit a fatal condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeOutcome {
    /// The chunk now holds an Opus packet of this many bytes
    Encoded {
        /// Compressed payload length
        bytes: usize,
    },
    /// Encoding failed; the chunk still holds its raw PCM payload
    Unchanged,
}

/// Per-process lossy codec state
///
/// The decoder is constructed lazily on the first [`decode`](Self::decode);
/// the encoder only through [`init_encoder`](Self::init_encoder). Each is
/// constructed at most once until [`teardown`](Self::teardown).
pub struct CodecContext {
    backend: Box<dyn CodecBackend>,
    decoder: Slot<Box<dyn FrameDecoder>>,
    encoder: Slot<Box<dyn FrameEncoder>>,
    /// Stream parameters the decoder was built for
    decoder_format: Option<(u32, u16)>,
    bitrate: u32,
    /// Maximum compressed bytes per packet
    mss: usize,
    /// Decode output / encode input
    pcm_scratch: Vec<i16>,
    /// Encode output, sized to the mss at init
    packet_scratch: Vec<u8>,
}

impl CodecContext {
    /// Create an empty context backed by libopus
    pub fn opus() -> Self {
        Self::new(Box::new(OpusBackend))
    }

    /// Create an empty context with a custom backend
    pub fn new(backend: Box<dyn CodecBackend>) -> Self {
        Self {
            backend,
            decoder: Slot::Uninitialized,
            encoder: Slot::Uninitialized,
            decoder_format: None,
            bitrate: 0,
            mss: 0,
            pcm_scratch: Vec::new(),
            packet_scratch: Vec::new(),
        }
    }

    /// Decoder construction status
    pub fn decoder_state(&self) -> CodecState {
        self.decoder.state()
    }

    /// Encoder construction status
    pub fn encoder_state(&self) -> CodecState {
        self.encoder.state()
    }

    /// Configured encoder bitrate in bits per second (0 before init)
    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }

    /// Configured maximum segment size in bytes (0 before init)
    pub fn max_segment_size(&self) -> usize {
        self.mss
    }

    /// Construct the encoder
    ///
    /// Calling this again once the encoder is ready keeps the existing encoder.
    pub fn init_encoder(
        &mut self,
        segment_size: usize,
        samples: u32,
        channels: u16,
        bitrate: u32,
    ) -> Result<()> {
        match self.encoder {
            Slot::Ready(_) => {
                log::warn!("Opus encoder already initialized, keeping existing encoder");
                return Ok(());
            }
            Slot::Failed => return Err(Error::CodecUnavailable("encoder construction failed earlier")),
            Slot::Uninitialized => {}
        }

        if segment_size == 0 {
            self.encoder = Slot::Failed;
            return Err(Error::EncoderInit("segment size must be positive".to_string()));
        }

        match self.backend.create_encoder(samples, channels, bitrate) {
            Ok(encoder) => {
                log::info!(
                    "Opus encoder ready: {}Hz, {} channels, {} bps, mss {}",
                    samples,
                    channels,
                    bitrate,
                    segment_size
                );
                self.encoder = Slot::Ready(encoder);
                self.bitrate = bitrate;
                self.mss = segment_size;
                self.packet_scratch = vec![0u8; segment_size];
                Ok(())
            }
            Err(e) => {
                self.encoder = Slot::Failed;
                Err(Error::EncoderInit(format!(
                    "{} (mss {} samples {} channels {} bitrate {})",
                    e, segment_size, samples, channels, bitrate
                )))
            }
        }
    }

    fn ensure_decoder(&mut self, chunk: &AudioChunk) -> Result<()> {
        match self.decoder {
            Slot::Ready(_) => Ok(()),
            Slot::Failed => Err(Error::CodecUnavailable("decoder construction failed earlier")),
            Slot::Uninitialized => {
                log::info!("Initializing opus decoder: {}Hz, {} channels", chunk.samples, chunk.channels);
                match self.backend.create_decoder(chunk.samples, chunk.channels) {
                    Ok(decoder) => {
                        self.decoder = Slot::Ready(decoder);
                        self.decoder_format = Some((chunk.samples, chunk.channels));
                        Ok(())
                    }
                    Err(e) => {
                        self.decoder = Slot::Failed;
                        Err(Error::DecoderInit(e))
                    }
                }
            }
        }
    }

    /// Decode an Opus chunk into raw PCM in place
    ///
    /// A packet the decoder rejects is replaced by [`SILENCE_FALLBACK_MS`] of
    /// silence, so the chunk always leaves as well-formed PCM.
    pub fn decode(&mut self, chunk: &mut AudioChunk) -> Result<DecodeOutcome> {
        chunk.validate()?;
        if chunk.codec != CodecTag::CompressedOpus {
            return Err(Error::WrongCodec {
                expected: CodecTag::CompressedOpus,
                found: chunk.codec,
            });
        }
        if chunk.frame_size != OPUS_SAMPLE_BYTES {
            return Err(Error::MalformedChunk(format!(
                "opus decodes to 16-bit samples, chunk frame size is {}",
                chunk.frame_size
            )));
        }
        self.ensure_decoder(chunk)?;

        // The decoder keeps the format it was built with; its output is labelled to match
        if let Some((rate, channels)) = self.decoder_format {
            if (rate, channels) != (chunk.samples, chunk.channels) {
                log::warn!(
                    "Chunk is {}Hz/{}ch but the decoder was built for {}Hz/{}ch, decoding as the latter",
                    chunk.samples,
                    chunk.channels,
                    rate,
                    channels
                );
                chunk.samples = rate;
                chunk.channels = channels;
            }
        }

        log::trace!("Decoding {} bytes of opus data", chunk.size());

        let channels = chunk.channels as usize;
        let max_frames = chunk.samples as usize * OPUS_MAX_CHUNK_LENGTH_MS / 1000;
        self.pcm_scratch.clear();
        self.pcm_scratch.resize(max_frames * channels, 0);

        let Slot::Ready(decoder) = &mut self.decoder else {
            return Err(Error::CodecUnavailable("decoder not ready"));
        };

        let result = match decoder.decode(&chunk.data, &mut self.pcm_scratch) {
            Ok(0) => Err("decoder produced no frames".to_string()),
            Ok(frames) if frames > max_frames => Err(format!(
                "decoder reported {} frames, capacity is {}",
                frames, max_frames
            )),
            other => other,
        };

        match result {
            Ok(frames) => {
                chunk.data.clear();
                chunk.data.reserve(frames * chunk.bytes_per_frame());
                for sample in &self.pcm_scratch[..frames * channels] {
                    chunk.data.extend_from_slice(&sample.to_le_bytes());
                }
                chunk.codec = CodecTag::RawPcm;
                Ok(DecodeOutcome::Decoded { frames })
            }
            Err(e) => {
                log::error!("decoder failed: {}", e);
                let silence = AudioChunk::silence(
                    chunk.samples,
                    chunk.channels,
                    chunk.frame_size,
                    SILENCE_FALLBACK_MS,
                );
                chunk.data = silence.data;
                chunk.codec = CodecTag::RawPcm;
                Ok(DecodeOutcome::Silenced)
            }
        }
    }

    /// Encode a raw PCM chunk into one Opus packet in place
    ///
    /// On encoder failure the chunk keeps its PCM payload and tag.
    pub fn encode(&mut self, chunk: &mut AudioChunk) -> Result<EncodeOutcome> {
        chunk.validate()?;
        if chunk.codec != CodecTag::RawPcm {
            return Err(Error::WrongCodec {
                expected: CodecTag::RawPcm,
                found: chunk.codec,
            });
        }
        if chunk.frame_size != OPUS_SAMPLE_BYTES {
            return Err(Error::MalformedChunk(format!(
                "opus encodes 16-bit samples, chunk frame size is {}",
                chunk.frame_size
            )));
        }

        let Slot::Ready(encoder) = &mut self.encoder else {
            return Err(Error::CodecUnavailable("encoder not initialized"));
        };

        let frames = chunk.size() / chunk.frame_size as usize / chunk.channels as usize;
        log::trace!(
            "encode opus: {} bytes, {}Hz, {} frames",
            chunk.size(),
            chunk.samples,
            frames
        );

        self.pcm_scratch.clear();
        self.pcm_scratch.extend(
            chunk
                .data
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]])),
        );

        match encoder.encode(&self.pcm_scratch, &mut self.packet_scratch) {
            Ok(bytes) if bytes <= self.packet_scratch.len() => {
                chunk.replace_payload(&self.packet_scratch[..bytes], CodecTag::CompressedOpus);
                log::trace!("encode happened, chunk size now {}", bytes);
                Ok(EncodeOutcome::Encoded { bytes })
            }
            Ok(bytes) => {
                log::error!(
                    "encode failed: encoder reported {} bytes, segment size is {}",
                    bytes,
                    self.packet_scratch.len()
                );
                Ok(EncodeOutcome::Unchanged)
            }
            Err(e) => {
                log::error!("encode failed: {}", e);
                Ok(EncodeOutcome::Unchanged)
            }
        }
    }

    /// Release the encoder and decoder
    ///
    /// Both return to [`CodecState::Uninitialized`]; calling this again is a no-op.
    pub fn teardown(&mut self) {
        if matches!(self.decoder, Slot::Uninitialized) && matches!(self.encoder, Slot::Uninitialized) {
            return;
        }
        log::debug!("Releasing opus codec state");
        self.decoder = Slot::Uninitialized;
        self.encoder = Slot::Uninitialized;
        self.decoder_format = None;
        self.bitrate = 0;
        self.mss = 0;
        self.packet_scratch = Vec::new();
    }
}

impl std::fmt::Debug for CodecContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecContext")
            .field("decoder", &self.decoder.state())
            .field("encoder", &self.encoder.state())
            .field("decoder_format", &self.decoder_format)
            .field("bitrate", &self.bitrate)
            .field("mss", &self.mss)
            .finish()
    }
}
