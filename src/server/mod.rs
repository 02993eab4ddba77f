// ABOUTME: Server module for snapsource
// ABOUTME: Reactor, task scheduler, pipe reader, intercom and configuration

pub mod cli;
mod client_manager;
mod clock;
mod config;
mod intercom;
mod pipe_reader;
mod reactor;
mod scheduler;

pub use cli::SourceArgs;
pub use client_manager::{ClientId, ClientManager, ConnectedClient};
pub use clock::{Clock, ManualClock, ServerClock};
pub use config::{AppContext, SourceConfig, StreamCodec};
pub use intercom::{Distribution, UdpIntercom};
pub use pipe_reader::{open_pipe, PipeReader, PipeSource, PipeStatus};
pub use reactor::{
    Event, EventSource, Interest, Reactor, Readiness, Registry, RegistryStats, SourceId,
};
pub use scheduler::{Task, TaskScheduler};
