//! lanshare server binary.
//!
//! Loads the key=value config file, starts the share server and runs
//! until interrupted. The GUI control layer uses the library surface
//! directly instead of this binary.

use clap::Parser;
use tokio::signal;
use tracing::info;

use lanshare::config::{Args, load_config};
use lanshare::{Server, logging};

#[tokio::main]
async fn main() {
    logging::init_logging();

    let args = Args::parse();
    let mut config = load_config(&args.config);
    if let Some(dir) = args.dir {
        config.share_root = dir;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let server = Server::new();

    // mirror the operator log to stdout when running standalone
    let mut log_lines = server.subscribe_logs();
    tokio::spawn(async move {
        while let Ok(line) = log_lines.recv().await {
            println!("{line}");
        }
    });

    if !server.start(config).await {
        std::process::exit(1);
    }

    shutdown_signal().await;
    info!("received termination signal, shutting down");
    server.stop().await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
