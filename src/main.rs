//! Chat server binary
//!
//! Usage:
//!   palaver-server [bind_addr] [data_dir]
//!
//! Defaults to listening on 0.0.0.0:8888 with state under ./data. On
//! SIGINT/SIGTERM the mutable tables are flushed to disk before exit;
//! in-flight connections and transfers are not drained, clients resume.

use std::env;

use palaver::{ChatServer, ServerConfig};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().init();

    let mut config = ServerConfig::default();
    let args: Vec<String> = env::args().collect();
    if let Some(addr) = args.get(1) {
        config.bind_addr = match addr.parse() {
            Ok(addr) => addr,
            Err(e) => {
                eprintln!("Invalid bind address '{}': {}", addr, e);
                eprintln!("Usage: palaver-server [bind_addr] [data_dir]");
                std::process::exit(1);
            }
        };
    }
    if let Some(dir) = args.get(2) {
        config.data_dir = dir.into();
    }

    let server = ChatServer::new(config);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received, flushing state");
            if let Err(e) = server.flush().await {
                error!("Flush failed: {}", e);
            }
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
