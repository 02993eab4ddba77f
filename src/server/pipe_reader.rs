// ABOUTME: Chunked reader for the local PCM pipe
// ABOUTME: Accumulates raw bytes into fixed-duration chunks and reports backpressure

use crate::audio::AudioChunk;
use crate::server::config::SourceConfig;
use crate::server::reactor::{EventSource, Readiness};
use std::io;
use std::path::Path;
use tokio::io::Interest;
use tokio::net::unix::pipe;

/// Non-blocking byte source feeding the pipe reader
pub trait PipeSource {
    /// Read without blocking; `ErrorKind::WouldBlock` when nothing is available
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl PipeSource for pipe::Receiver {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        pipe::Receiver::try_read(self, buf)
    }
}

impl EventSource for pipe::Receiver {
    async fn readiness(&self) -> io::Result<Readiness> {
        pipe::Receiver::ready(self, Interest::READABLE)
            .await
            .map(Readiness::from)
    }
}

/// Open a named pipe (or regular file) for non-blocking reads
///
/// Must be called from within a tokio runtime.
pub fn open_pipe(path: &Path) -> io::Result<pipe::Receiver> {
    log::info!("Opening input pipe {}", path.display());
    pipe::OpenOptions::new().unchecked(true).open_receiver(path)
}

/// Outcome of one [`PipeReader::handle`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeStatus {
    /// Some bytes arrived; the chunk is not complete yet
    NeedsMoreData,
    /// A full chunk is waiting in [`PipeReader::take_chunk`]
    ChunkReady,
    /// The source has nothing to read right now
    WouldBlock,
}

/// Turns a raw byte stream into fixed-duration PCM chunks
pub struct PipeReader<S> {
    source: S,
    samples: u32,
    channels: u16,
    frame_size: u16,
    buf: Vec<u8>,
    filled: usize,
    chunk: Option<AudioChunk>,
}

impl<S: PipeSource> PipeReader<S> {
    /// Create a reader producing chunks of `config.read_ms` milliseconds
    pub fn new(source: S, config: &SourceConfig) -> Self {
        let chunk_bytes = config.chunk_bytes();
        log::debug!(
            "Pipe reader: {} frames per chunk, {} bytes per chunk",
            config.frames_per_chunk(),
            chunk_bytes
        );

        Self {
            source,
            samples: config.sample_rate,
            channels: config.channels,
            frame_size: config.frame_size,
            buf: vec![0u8; chunk_bytes],
            filled: 0,
            chunk: None,
        }
    }

    /// Read once from the source
    pub fn handle(&mut self) -> PipeStatus {
        match self.source.try_read(&mut self.buf[self.filled..]) {
            Ok(0) => {
                log::debug!("Pipe returned end of stream");
                PipeStatus::WouldBlock
            }
            Ok(n) => {
                self.filled += n;
                if self.filled < self.buf.len() {
                    return PipeStatus::NeedsMoreData;
                }

                let data = std::mem::replace(&mut self.buf, vec![0u8; self.filled]);
                self.filled = 0;
                self.chunk = Some(AudioChunk::pcm(
                    self.samples,
                    self.channels,
                    self.frame_size,
                    data,
                ));
                PipeStatus::ChunkReady
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => PipeStatus::WouldBlock,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => PipeStatus::NeedsMoreData,
            Err(e) => {
                log::warn!("Reading from pipe failed: {}", e);
                PipeStatus::WouldBlock
            }
        }
    }

    /// Take the completed chunk, if any
    pub fn take_chunk(&mut self) -> Option<AudioChunk> {
        self.chunk.take()
    }

    /// Bytes accumulated towards the next chunk
    pub fn pending_bytes(&self) -> usize {
        self.filled
    }

    /// Size of a complete chunk in bytes
    pub fn chunk_bytes(&self) -> usize {
        self.buf.len()
    }

    /// The underlying source
    pub fn source(&self) -> &S {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::CodecTag;
    use std::collections::VecDeque;

    /// Scripted source: each entry is one read result
    struct Script(VecDeque<io::Result<Vec<u8>>>);

    impl PipeSource for Script {
        fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                Some(Ok(bytes)) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    fn config() -> SourceConfig {
        // 8000 Hz * 10ms = 80 frames * 2 channels * 2 bytes = 320 bytes
        SourceConfig::new("/dev/null")
            .sample_rate(8000)
            .read_ms(10)
    }

    #[test]
    fn test_partial_then_full_chunk() {
        let script = Script(VecDeque::from(vec![Ok(vec![1; 100]), Ok(vec![2; 220])]));
        let mut reader = PipeReader::new(script, &config());
        assert_eq!(reader.chunk_bytes(), 320);

        assert_eq!(reader.handle(), PipeStatus::NeedsMoreData);
        assert_eq!(reader.pending_bytes(), 100);
        assert!(reader.take_chunk().is_none());

        assert_eq!(reader.handle(), PipeStatus::ChunkReady);
        let chunk = reader.take_chunk().unwrap();
        assert_eq!(chunk.size(), 320);
        assert_eq!(chunk.codec, CodecTag::RawPcm);
        assert_eq!((chunk.samples, chunk.channels, chunk.frame_size), (8000, 2, 2));
        assert_eq!(&chunk.data[..100], &[1; 100][..]);
        assert_eq!(&chunk.data[100..], &[2; 220][..]);
        assert!(chunk.validate().is_ok());
        assert_eq!(reader.pending_bytes(), 0);
    }

    #[test]
    fn test_would_block_keeps_partial_bytes() {
        let script = Script(VecDeque::from(vec![
            Ok(vec![9; 50]),
            Err(io::ErrorKind::WouldBlock.into()),
            Ok(vec![9; 270]),
        ]));
        let mut reader = PipeReader::new(script, &config());

        assert_eq!(reader.handle(), PipeStatus::NeedsMoreData);
        assert_eq!(reader.handle(), PipeStatus::WouldBlock);
        assert_eq!(reader.pending_bytes(), 50);
        assert_eq!(reader.handle(), PipeStatus::ChunkReady);
        assert_eq!(reader.take_chunk().unwrap().size(), 320);
    }

    #[test]
    fn test_eof_and_errors_map_to_would_block() {
        let script = Script(VecDeque::from(vec![
            Ok(Vec::new()),
            Err(io::Error::new(io::ErrorKind::Other, "broken")),
            Err(io::ErrorKind::Interrupted.into()),
        ]));
        let mut reader = PipeReader::new(script, &config());

        assert_eq!(reader.handle(), PipeStatus::WouldBlock);
        assert_eq!(reader.handle(), PipeStatus::WouldBlock);
        assert_eq!(reader.handle(), PipeStatus::NeedsMoreData);
        assert_eq!(reader.pending_bytes(), 0);
    }
}
