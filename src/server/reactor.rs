// ABOUTME: Single-threaded readiness reactor
// ABOUTME: Waits on scheduler, pipe and network sources and dispatches to their handlers

use crate::audio::{CodecContext, CodecState, EncodeOutcome};
use crate::error::Error;
use crate::server::config::{AppContext, SourceConfig, StreamCodec};
use crate::server::intercom::Distribution;
use crate::server::pipe_reader::{PipeReader, PipeSource, PipeStatus};
use crate::server::scheduler::TaskScheduler;
use crate::Result;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Identity of a pollable source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceId {
    /// The task scheduler's timer
    Scheduler,
    /// The local PCM pipe
    Pipe,
    /// The intercom socket
    Network,
    /// Anything else
    Other(u32),
}

/// Readiness kinds a source is watched for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    readable: bool,
    writable: bool,
}

impl Interest {
    /// Readable interest
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };
    /// Writable interest
    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };

    /// Combine two interests
    pub const fn add(self, other: Interest) -> Interest {
        Interest {
            readable: self.readable || other.readable,
            writable: self.writable || other.writable,
        }
    }

    /// Whether readable readiness is wanted
    pub fn is_readable(&self) -> bool {
        self.readable
    }

    /// Whether writable readiness is wanted
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

/// Readiness reported for a source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Data can be read
    pub readable: bool,
    /// Data can be written
    pub writable: bool,
    /// The source reported an error condition
    pub error: bool,
    /// The peer hung up
    pub hangup: bool,
}

impl Readiness {
    /// Plain readable readiness
    pub const READABLE: Readiness = Readiness {
        readable: true,
        writable: false,
        error: false,
        hangup: false,
    };

    /// Name of the failure condition, if any
    pub fn failure(&self) -> Option<&'static str> {
        if self.error {
            Some("error")
        } else if self.hangup {
            Some("hangup")
        } else {
            None
        }
    }
}

impl From<tokio::io::Ready> for Readiness {
    fn from(ready: tokio::io::Ready) -> Self {
        Self {
            readable: ready.is_readable(),
            writable: ready.is_writable(),
            error: ready.is_error(),
            hangup: ready.is_read_closed(),
        }
    }
}

/// One readiness notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// Source the notification is for
    pub source: SourceId,
    /// What the source is ready for
    pub readiness: Readiness,
}

impl Event {
    /// Readable event for `source`
    pub fn readable(source: SourceId) -> Self {
        Self {
            source,
            readiness: Readiness::READABLE,
        }
    }
}

/// Something the reactor can wait on
#[allow(async_fn_in_trait)]
pub trait EventSource {
    /// Wait until the source has readiness to report
    async fn readiness(&self) -> io::Result<Readiness>;
}

/// Counters of effective registry changes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Registrations that added or changed interest
    pub registered: u64,
    /// Deregistrations that removed interest
    pub deregistered: u64,
}

/// Interest table: which sources the reactor currently waits on
#[derive(Debug, Default)]
pub struct Registry {
    interests: HashMap<SourceId, Interest>,
    stats: RegistryStats,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch `source` for `interest`
    ///
    /// Returns `false` if the source was already registered with that interest.
    pub fn register(&mut self, source: SourceId, interest: Interest) -> bool {
        if self.interests.insert(source, interest) == Some(interest) {
            return false;
        }
        self.stats.registered += 1;
        log::trace!("Registered {:?} for {:?}", source, interest);
        true
    }

    /// Stop watching `source`
    ///
    /// Returns `false` if the source was not registered.
    pub fn deregister(&mut self, source: SourceId) -> bool {
        if self.interests.remove(&source).is_none() {
            return false;
        }
        self.stats.deregistered += 1;
        log::trace!("Deregistered {:?}", source);
        true
    }

    /// Whether `source` is currently watched
    pub fn is_registered(&self, source: SourceId) -> bool {
        self.interests.contains_key(&source)
    }

    /// Interest registered for `source`
    pub fn interest(&self, source: SourceId) -> Option<Interest> {
        self.interests.get(&source).copied()
    }

    /// Effective registration changes so far
    pub fn stats(&self) -> RegistryStats {
        self.stats
    }
}

/// The event loop driving the whole pipeline
pub struct Reactor<P, D> {
    config: Arc<SourceConfig>,
    registry: Registry,
    scheduler: TaskScheduler<Registry>,
    pipe: PipeReader<P>,
    distribution: D,
    codec: CodecContext,
    retry_delay: Duration,
}

impl<P: PipeSource, D: Distribution> Reactor<P, D> {
    /// Create a reactor with a libopus codec context
    pub fn new(ctx: &AppContext, source: P, distribution: D) -> Result<Self> {
        Self::with_codec(ctx, source, distribution, CodecContext::opus())
    }

    /// Create a reactor around an existing codec context
    ///
    /// When the stream codec is Opus the encoder is initialized here if it is
    /// not ready yet. All three sources start out registered for readability.
    pub fn with_codec(
        ctx: &AppContext,
        source: P,
        distribution: D,
        mut codec: CodecContext,
    ) -> Result<Self> {
        let config = Arc::clone(&ctx.config);

        if config.codec == StreamCodec::Opus && codec.encoder_state() != CodecState::Ready {
            codec.init_encoder(
                config.max_segment_size(),
                config.sample_rate,
                config.channels,
                config.bitrate,
            )?;
        }

        let mut registry = Registry::new();
        registry.register(SourceId::Scheduler, Interest::READABLE);
        registry.register(SourceId::Pipe, Interest::READABLE);
        registry.register(SourceId::Network, Interest::READABLE);

        Ok(Self {
            registry,
            scheduler: TaskScheduler::new(Arc::clone(&ctx.clock)),
            pipe: PipeReader::new(source, &config),
            distribution,
            codec,
            retry_delay: Duration::from_millis(config.read_ms),
            config,
        })
    }

    /// Current interest table
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Pending deferred tasks
    pub fn scheduler(&self) -> &TaskScheduler<Registry> {
        &self.scheduler
    }

    /// The distribution collaborator
    pub fn distribution(&self) -> &D {
        &self.distribution
    }

    /// The codec context
    pub fn codec(&self) -> &CodecContext {
        &self.codec
    }

    /// Handle one readiness event
    ///
    /// Errors are fatal: an error or hangup on a registered source, or a codec
    /// failure that signals a broken invariant. Readiness of any kind on an
    /// unregistered source is logged and dropped.
    pub fn dispatch(&mut self, event: Event) -> Result<()> {
        log::trace!("Handling event on {:?}", event.source);

        if !self.registry.is_registered(event.source) {
            log::warn!(
                "Ignoring {:?} on unregistered source {:?}",
                event.readiness,
                event.source
            );
            return Ok(());
        }

        if let Some(condition) = event.readiness.failure() {
            log::error!(
                "{} condition on {:?}, no recovery available",
                condition,
                event.source
            );
            return Err(Error::SourceFailed {
                id: event.source,
                condition,
            });
        }

        if !event.readiness.readable {
            log::debug!("Ignoring {:?} on {:?}", event.readiness, event.source);
            return Ok(());
        }

        match event.source {
            SourceId::Scheduler => {
                let ran = self.scheduler.drain(&mut self.registry);
                log::trace!("Ran {} scheduled tasks", ran);
            }
            SourceId::Pipe => match self.pipe.handle() {
                PipeStatus::NeedsMoreData => {}
                PipeStatus::ChunkReady => self.forward_chunk()?,
                PipeStatus::WouldBlock => self.throttle(),
            },
            SourceId::Network => self.distribution.handle_inbound(),
            SourceId::Other(id) => {
                log::error!("Readiness on unknown source {}, ignoring", id);
            }
        }

        Ok(())
    }

    /// Stop reading the pipe until the retry delay has passed
    fn throttle(&mut self) {
        self.registry.deregister(SourceId::Pipe);
        log::debug!("Throttling input from pipe for {:?}", self.retry_delay);

        self.scheduler
            .post(self.retry_delay, |registry: &mut Registry, _: &mut TaskScheduler<Registry>| {
                log::debug!("Resuming reading from pipe");
                registry.register(SourceId::Pipe, Interest::READABLE);
            });
    }

    fn forward_chunk(&mut self) -> Result<()> {
        let Some(mut chunk) = self.pipe.take_chunk() else {
            return Ok(());
        };

        if self.config.codec == StreamCodec::Opus {
            if let EncodeOutcome::Unchanged = self.codec.encode(&mut chunk)? {
                log::warn!("Forwarding {} bytes of raw pcm after encoder failure", chunk.size());
            }
        }

        self.distribution.send_audio(chunk);
        Ok(())
    }

    /// Release codec state; safe to call more than once
    pub fn shutdown(&mut self) {
        self.codec.teardown();
    }
}

impl<P, D> Reactor<P, D>
where
    P: PipeSource + EventSource,
    D: Distribution + EventSource,
{
    /// Wait for the next readiness event
    ///
    /// Sources are polled in a fixed order: scheduler, pipe, network. Only
    /// registered sources are waited on.
    pub async fn next_event(&self) -> Result<Event> {
        let timer = self.scheduler.time_until_next();
        let scheduler_armed = timer.is_some() && self.registry.is_registered(SourceId::Scheduler);
        let pipe_armed = self.registry.is_registered(SourceId::Pipe);
        let network_armed = self.registry.is_registered(SourceId::Network);

        tokio::select! {
            biased;

            _ = tokio::time::sleep(timer.unwrap_or_default()), if scheduler_armed => {
                Ok(Event::readable(SourceId::Scheduler))
            }
            ready = self.pipe.source().readiness(), if pipe_armed => {
                Ok(Event { source: SourceId::Pipe, readiness: ready? })
            }
            ready = self.distribution.readiness(), if network_armed => {
                Ok(Event { source: SourceId::Network, readiness: ready? })
            }
            else => Err(Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "no event sources registered",
            ))),
        }
    }

    /// Run the event loop
    ///
    /// Only returns on a fatal error.
    pub async fn run(&mut self) -> Result<()> {
        log::info!(
            "Starting loop: {}Hz, {} channels, {}ms chunks, codec {:?}",
            self.config.sample_rate,
            self.config.channels,
            self.config.read_ms,
            self.config.codec
        );

        loop {
            let event = self.next_event().await?;
            self.dispatch(event)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioChunk, CodecTag};
    use crate::server::clock::ManualClock;
    use std::collections::VecDeque;

    struct Script(VecDeque<io::Result<Vec<u8>>>);

    impl PipeSource for Script {
        fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                Some(Ok(bytes)) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Some(Err(e)) => Err(e),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        sent: Vec<AudioChunk>,
        inbound: usize,
    }

    impl Distribution for Recorder {
        fn send_audio(&mut self, chunk: AudioChunk) {
            self.sent.push(chunk);
        }

        fn handle_inbound(&mut self) {
            self.inbound += 1;
        }
    }

    fn reactor(reads: Vec<io::Result<Vec<u8>>>) -> (Arc<ManualClock>, Reactor<Script, Recorder>) {
        let clock = Arc::new(ManualClock::new());
        // 8000 Hz * 10ms * 2 channels * 2 bytes = 320 bytes per chunk
        let config = SourceConfig::new("/tmp/fifo")
            .sample_rate(8000)
            .read_ms(10)
            .codec(StreamCodec::Pcm);
        let ctx = AppContext::with_clock(config, clock.clone()).unwrap();
        let reactor = Reactor::new(&ctx, Script(VecDeque::from(reads)), Recorder::default()).unwrap();
        (clock, reactor)
    }

    #[test]
    fn test_registry_is_idempotent() {
        let mut registry = Registry::new();
        assert!(registry.register(SourceId::Pipe, Interest::READABLE));
        assert!(!registry.register(SourceId::Pipe, Interest::READABLE));
        assert!(registry.register(SourceId::Pipe, Interest::READABLE.add(Interest::WRITABLE)));
        assert!(registry.interest(SourceId::Pipe).unwrap().is_writable());

        assert!(registry.deregister(SourceId::Pipe));
        assert!(!registry.deregister(SourceId::Pipe));
        assert_eq!(
            registry.stats(),
            RegistryStats {
                registered: 2,
                deregistered: 1
            }
        );
    }

    #[test]
    fn test_all_sources_start_registered() {
        let (_clock, reactor) = reactor(vec![]);
        for source in [SourceId::Scheduler, SourceId::Pipe, SourceId::Network] {
            assert!(reactor.registry().is_registered(source));
        }
        assert!(reactor.scheduler().is_empty());
    }

    #[test]
    fn test_full_chunk_is_forwarded_raw() {
        let (_clock, mut reactor) = reactor(vec![Ok(vec![3; 200]), Ok(vec![4; 120])]);

        reactor.dispatch(Event::readable(SourceId::Pipe)).unwrap();
        assert!(reactor.distribution().sent.is_empty());

        reactor.dispatch(Event::readable(SourceId::Pipe)).unwrap();
        let sent = &reactor.distribution().sent;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].codec, CodecTag::RawPcm);
        assert_eq!(sent[0].size(), 320);
    }

    #[test]
    fn test_would_block_throttles_then_resumes() {
        let (clock, mut reactor) = reactor(vec![Err(io::ErrorKind::WouldBlock.into())]);

        reactor.dispatch(Event::readable(SourceId::Pipe)).unwrap();
        assert!(!reactor.registry().is_registered(SourceId::Pipe));
        assert_eq!(reactor.scheduler().len(), 1);

        // Stale pipe readiness while throttled is ignored
        reactor.dispatch(Event::readable(SourceId::Pipe)).unwrap();
        assert_eq!(reactor.scheduler().len(), 1);

        // Not due yet
        clock.advance_ms(9);
        reactor.dispatch(Event::readable(SourceId::Scheduler)).unwrap();
        assert!(!reactor.registry().is_registered(SourceId::Pipe));

        clock.advance_ms(1);
        reactor.dispatch(Event::readable(SourceId::Scheduler)).unwrap();
        assert!(reactor.registry().is_registered(SourceId::Pipe));
        assert!(reactor.scheduler().is_empty());
    }

    #[test]
    fn test_network_readiness_goes_to_distribution() {
        let (_clock, mut reactor) = reactor(vec![]);
        reactor.dispatch(Event::readable(SourceId::Network)).unwrap();
        assert_eq!(reactor.distribution().inbound, 1);
    }

    #[test]
    fn test_hangup_is_fatal() {
        let (_clock, mut reactor) = reactor(vec![]);
        let event = Event {
            source: SourceId::Pipe,
            readiness: Readiness {
                readable: true,
                hangup: true,
                ..Default::default()
            },
        };

        let err = reactor.dispatch(event).unwrap_err();
        assert!(matches!(
            err,
            Error::SourceFailed {
                id: SourceId::Pipe,
                condition: "hangup"
            }
        ));
    }

    #[test]
    fn test_unknown_source_is_ignored() {
        let (_clock, mut reactor) = reactor(vec![]);
        assert!(reactor.dispatch(Event::readable(SourceId::Other(42))).is_ok());
    }

    #[test]
    fn test_hangup_on_unregistered_source_is_ignored() {
        let (_clock, mut reactor) = reactor(vec![Err(io::ErrorKind::WouldBlock.into())]);
        let hangup = Readiness {
            readable: true,
            hangup: true,
            ..Default::default()
        };

        let event = Event {
            source: SourceId::Other(9),
            readiness: hangup,
        };
        assert!(reactor.dispatch(event).is_ok());

        // Throttled pipe is not registered either
        reactor.dispatch(Event::readable(SourceId::Pipe)).unwrap();
        assert!(!reactor.registry().is_registered(SourceId::Pipe));
        let event = Event {
            source: SourceId::Pipe,
            readiness: hangup,
        };
        assert!(reactor.dispatch(event).is_ok());
        assert_eq!(reactor.scheduler().len(), 1);
    }

    /// Distribution whose socket never becomes ready
    #[derive(Default)]
    struct Quiet {
        sent: Vec<AudioChunk>,
    }

    impl Distribution for Quiet {
        fn send_audio(&mut self, chunk: AudioChunk) {
            self.sent.push(chunk);
        }

        fn handle_inbound(&mut self) {}
    }

    impl EventSource for Quiet {
        async fn readiness(&self) -> io::Result<Readiness> {
            std::future::pending().await
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_wait_loop_over_real_pipe() {
        use tokio::io::AsyncWriteExt;
        use tokio::net::unix::pipe;

        let (mut writer, receiver) = pipe::pipe().unwrap();
        // 8000 Hz * 10ms * 2 channels * 2 bytes = 320 bytes per chunk
        let config = SourceConfig::new("/tmp/fifo")
            .sample_rate(8000)
            .read_ms(10)
            .codec(StreamCodec::Pcm);
        let ctx = AppContext::new(config).unwrap();
        let mut reactor = Reactor::new(&ctx, receiver, Quiet::default()).unwrap();

        // Partial writes arrive as pipe events, the second completes a chunk
        writer.write_all(&[5; 200]).await.unwrap();
        let event = reactor.next_event().await.unwrap();
        assert_eq!(event.source, SourceId::Pipe);
        reactor.dispatch(event).unwrap();
        assert!(reactor.distribution().sent.is_empty());

        writer.write_all(&[6; 120]).await.unwrap();
        let event = reactor.next_event().await.unwrap();
        assert_eq!(event.source, SourceId::Pipe);
        reactor.dispatch(event).unwrap();
        assert_eq!(reactor.distribution().sent.len(), 1);
        assert_eq!(reactor.distribution().sent[0].size(), 320);

        // Drained pipe throttles; only the scheduler can wake the loop
        let event = reactor.next_event().await.unwrap();
        assert_eq!(event.source, SourceId::Pipe);
        reactor.dispatch(event).unwrap();
        assert!(!reactor.registry().is_registered(SourceId::Pipe));

        let event = reactor.next_event().await.unwrap();
        assert_eq!(event.source, SourceId::Scheduler);
        reactor.dispatch(event).unwrap();
        assert!(reactor.registry().is_registered(SourceId::Pipe));
        assert!(reactor.scheduler().is_empty());

        drop(writer);
        let err = reactor.run().await.unwrap_err();
        assert!(matches!(
            err,
            Error::SourceFailed {
                id: SourceId::Pipe,
                condition: "hangup"
            }
        ));
    }
}
