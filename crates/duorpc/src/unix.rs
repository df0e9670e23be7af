//! Unix domain socket transport.
//!
//! The local-machine pipe: a stream socket carrying length-delimited frames.

use std::path::Path;
use std::path::PathBuf;

use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tracing::debug;

use crate::framed::LengthDelimited;
use crate::transport;
use crate::transport::Acceptor;
use crate::transport::Connector;
use crate::transport::Transport;

/// Dials a Unix socket path.
pub struct UnixConnector {
    path: PathBuf,
    max_frame_size: usize,
}

impl UnixConnector {
    pub fn new(path: impl Into<PathBuf>, max_frame_size: usize) -> Self {
        Self { path: path.into(), max_frame_size }
    }
}

#[async_trait::async_trait]
impl Connector for UnixConnector {
    async fn connect(self) -> transport::Result<Box<dyn Transport>> {
        let stream = UnixStream::connect(&self.path).await?;
        debug!(path = %self.path.display(), "connected to unix socket");
        Ok(Box::new(LengthDelimited::new(stream, self.max_frame_size)))
    }
}

/// A bound Unix socket waiting for exactly one peer.
pub struct UnixAcceptor {
    path: PathBuf,
    listener: UnixListener,
    max_frame_size: usize,
}

impl UnixAcceptor {
    /// Binds the socket, replacing a stale socket file left by a previous run.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(path: impl AsRef<Path>, max_frame_size: usize) -> transport::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            debug!(path = %path.display(), "removing stale socket file");
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        Ok(Self { path, listener, max_frame_size })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl Acceptor for UnixAcceptor {
    async fn accept(self) -> transport::Result<Box<dyn Transport>> {
        let (stream, _addr) = self.listener.accept().await?;
        debug!(path = %self.path.display(), "accepted unix socket peer");

        // One peer per endpoint; the name is no longer needed.
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "could not remove socket file");
        }
        Ok(Box::new(LengthDelimited::new(stream, self.max_frame_size)))
    }
}
