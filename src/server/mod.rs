//! Apply server - runs when invoked as `ssync serve`
//!
//! Listens on TCP and applies one sync session per connection, one session
//! at a time.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::net::{TcpListener, TcpStream};

use crate::config::ServerConfig;
use crate::error::{Result, SyncError};
use crate::streaming::{ApplyStats, Receiver, ReceiverConfig};
use crate::transport::Endpoint;

/// Expand tilde (~) in paths to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            home.join(rest)
        } else {
            path.to_path_buf()
        }
    } else {
        path.to_path_buf()
    }
}

/// Listening side of sparse sync.
pub struct ApplyServer {
    listener: TcpListener,
    config: ServerConfig,
}

impl ApplyServer {
    pub async fn bind(endpoint: &Endpoint, mut config: ServerConfig) -> Result<Self> {
        config.validate()?;

        if let Some(root) = config.root.take() {
            let root = expand_tilde(&root);
            tokio::fs::create_dir_all(&root)
                .await
                .map_err(|e| SyncError::io(format!("Failed to create root {}", root.display()), e))?;
            config.root = Some(root);
        }

        let listener = TcpListener::bind((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| SyncError::io(format!("Failed to bind {}", endpoint), e))?;

        let server = Self { listener, config };
        tracing::info!("listening on {}", server.local_endpoint()?);
        Ok(server)
    }

    /// Bound address; resolves port 0 to the port actually assigned.
    pub fn local_endpoint(&self) -> Result<Endpoint> {
        self.listener
            .local_addr()
            .map(Endpoint::from)
            .map_err(|e| SyncError::io("Failed to read local address", e))
    }

    /// Accept one connection and apply its session.
    pub async fn serve_one(&self) -> Result<ApplyStats> {
        let (stream, peer) = self.accept().await?;
        serve_connection(stream, peer, &self.config).await
    }

    /// Serve sessions until accepting a connection fails. A failed session
    /// is logged and does not stop the server.
    pub async fn run(&self) -> Result<()> {
        loop {
            let (stream, peer) = self.accept().await?;
            match serve_connection(stream, peer, &self.config).await {
                Ok(stats) => tracing::debug!("session from {} applied {:?}", peer, stats),
                Err(e) => tracing::warn!("session from {} failed: {}", peer, e),
            }
        }
    }

    async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        self.listener
            .accept()
            .await
            .map_err(|e| SyncError::io("Failed to accept connection", e))
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    config: &ServerConfig,
) -> Result<ApplyStats> {
    tracing::info!("session from {}", peer);
    stream
        .set_nodelay(true)
        .map_err(|e| SyncError::io("Failed to set TCP_NODELAY", e))?;
    let (mut reader, mut writer) = stream.into_split();

    let mut receiver = Receiver::new(ReceiverConfig {
        root: config.root.clone(),
        timeout: config.timeout(),
        queue_capacity: config.queue_capacity,
    });
    receiver.run(&mut reader, &mut writer).await
}

/// Bind `endpoint`, apply exactly one session and return.
pub async fn serve_once(endpoint: &Endpoint, timeout_secs: u64) -> Result<ApplyStats> {
    let config = ServerConfig {
        timeout_secs,
        ..ServerConfig::default()
    };
    ApplyServer::bind(endpoint, config).await?.serve_one().await
}
