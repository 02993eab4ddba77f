// ABOUTME: Snapsource server binary
// ABOUTME: Reads PCM from a pipe, encodes it and distributes it to playback clients

use clap::Parser;
use snapsource::server::{open_pipe, AppContext, Reactor, SourceArgs, UdpIntercom};
use std::io::Write;
use std::process::ExitCode;
use tokio::signal::unix::{signal, SignalKind};

const SIGTERM_MSG: &[u8] = b"Exiting.\n";

#[derive(Parser, Debug)]
#[command(name = "snapsource-server")]
#[command(author, version, about = "Synchronized multi-room audio source", long_about = None)]
struct Args {
    #[command(flatten)]
    source: SourceArgs,
}

/// Exit immediately on SIGTERM or Ctrl-C, without flushing buffered audio
fn spawn_termination_handler() -> std::io::Result<()> {
    let mut term = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = term.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
        let _ = std::io::stderr().write_all(SIGTERM_MSG);
        std::process::exit(0);
    });
    Ok(())
}

async fn serve(args: &SourceArgs) -> snapsource::Result<()> {
    let ctx = AppContext::new(args.build_config())?;

    spawn_termination_handler()?;

    let pipe = open_pipe(&ctx.config.pipe_path)?;
    let intercom = UdpIntercom::bind(&ctx).await?;

    let mut reactor = Reactor::new(&ctx, pipe, intercom)?;
    let result = reactor.run().await;
    reactor.shutdown();
    result
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize tracing
    args.source.init_tracing();

    // Log startup info
    args.source.log_startup_info();

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to create event loop: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(serve(&args.source)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Fatal: {}", e);
            ExitCode::FAILURE
        }
    }
}
