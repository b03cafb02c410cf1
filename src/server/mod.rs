//! TCP chat server: listener, startup load and shutdown flush
//!
//! The listener accepts connections, assigns each a monotonically
//! increasing client id and hands it to a fresh task running the
//! per-connection dispatcher (see [`connection`]). Domain state is
//! loaded from the data directory before serving and the mutable
//! tables are flushed back on shutdown.

pub mod connection;
pub mod transfer;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::state::Domain;
use crate::storage::Store;

pub use connection::Connection;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Data directory holding the persistent tables, logs and uploads
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8888".parse().unwrap(),
            data_dir: PathBuf::from("data"),
        }
    }
}

/// The chat server
pub struct ChatServer {
    config: ServerConfig,
    domain: Arc<Domain>,
    store: Arc<Store>,
    next_client_id: AtomicU64,
}

impl ChatServer {
    /// Create a server over the given configuration
    pub fn new(config: ServerConfig) -> Self {
        let store = Arc::new(Store::new(config.data_dir.clone()));
        Self {
            config,
            domain: Arc::new(Domain::new()),
            store,
            next_client_id: AtomicU64::new(0),
        }
    }

    /// Shared domain state
    pub fn domain(&self) -> Arc<Domain> {
        Arc::clone(&self.domain)
    }

    /// Persistence store
    pub fn store(&self) -> Arc<Store> {
        Arc::clone(&self.store)
    }

    /// Create the on-disk layout and load every table into memory
    pub async fn load(&self) -> Result<()> {
        self.store.ensure_layout().await?;

        self.domain.users.load(self.store.load_users().await?).await;
        self.domain
            .sessions
            .load(self.store.load_sessions().await?)
            .await;
        self.domain
            .friends
            .load(self.store.load_friends().await?)
            .await;
        self.domain
            .friends
            .load_pending(self.store.load_pending().await?)
            .await;
        self.domain
            .groups
            .load(self.store.load_groups().await?)
            .await;
        self.domain
            .groups
            .load_invites(self.store.load_group_invites().await?)
            .await;
        self.domain
            .files
            .load_completed(self.store.load_file_metadata().await?)
            .await;

        info!(data_dir = %self.config.data_dir.display(), "domain state loaded");
        Ok(())
    }

    /// Flush the mutable tables to disk (shutdown path)
    pub async fn flush(&self) -> Result<()> {
        self.store
            .save_users(&self.domain.users.snapshot().await)
            .await?;
        self.store
            .save_sessions(&self.domain.sessions.snapshot().await)
            .await?;
        self.store
            .save_groups(&self.domain.groups.snapshot().await)
            .await?;
        self.store
            .save_group_invites(&self.domain.groups.snapshot_invites().await)
            .await?;
        info!("domain state flushed");
        Ok(())
    }

    /// Load state, bind the listener and serve until the task is aborted
    pub async fn run(&self) -> Result<()> {
        self.load().await?;

        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("Server listening on {}", listener.local_addr()?);

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
                    info!(client = client_id, %addr, "accepted connection");

                    let domain = Arc::clone(&self.domain);
                    let store = Arc::clone(&self.store);
                    tokio::spawn(async move {
                        if let Err(e) = Connection::run(stream, client_id, domain, store).await {
                            warn!(client = client_id, error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            }
        }
    }
}
