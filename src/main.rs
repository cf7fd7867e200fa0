//! Claude chat bridge binary
//!
//! Run with: cargo run -- serve
//!
//! For help: cargo run -- --help

use std::io::IsTerminal;

use clap::Parser;
use claude_chat_bridge::{cli::Cli, run_with_cli, shutdown_otel};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let terminate = async {
        #[cfg(unix)]
        {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    eprintln!("Failed to register SIGTERM handler: {e}");
                    std::future::pending::<()>().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = signal::ctrl_c() => eprintln!("Received SIGINT, shutting down..."),
        () = terminate => eprintln!("Received SIGTERM, shutting down..."),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let shutdown = CancellationToken::new();

    // On a signal the run path still destroys sessions and stops the bridge
    let mut run = std::pin::pin!(run_with_cli(&cli, shutdown.clone()));
    let result = tokio::select! {
        result = &mut run => result,
        () = shutdown_signal() => {
            shutdown.cancel();
            run.await
        }
    };

    // Shutdown OpenTelemetry to flush all pending spans
    shutdown_otel();

    if let Err(e) = result {
        eprintln!("Error: {e:#}");

        if std::io::stderr().is_terminal() {
            eprintln!("\nFor debugging, run with --diagnostic to log to a file.");
            eprintln!("Or use -v/-vv/-vvv for more verbose logging.");
        }

        std::process::exit(1);
    }

    Ok(())
}
