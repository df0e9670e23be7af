//! In-process transport.
//!
//! A pair of unbounded channels: natively message-oriented, so no framing is
//! needed. Used by tests and by endpoints living in the same process.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::transport;
use crate::transport::Acceptor;
use crate::transport::Connector;
use crate::transport::FrameRead;
use crate::transport::FrameWrite;
use crate::transport::Transport;
use crate::transport::TransportError;

/// One end of an in-memory duplex pipe.
///
/// Frames written on one end are read on the other. Dropping an end (or its
/// write half) closes the pipe for the peer.
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl MemoryTransport {
    /// Creates a pair of transports connected to each other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let a = Self { tx: tx_a, rx: rx_b };
        let b = Self { tx: tx_b, rx: rx_a };
        (a, b)
    }
}

impl Transport for MemoryTransport {
    fn split(self: Box<Self>) -> (Box<dyn FrameRead>, Box<dyn FrameWrite>) {
        let this = *self;
        (
            Box::new(MemoryReader { rx: this.rx }),
            Box::new(MemoryWriter { tx: Some(this.tx) }),
        )
    }
}

/// Already connected; establishment is immediate.
#[async_trait::async_trait]
impl Connector for MemoryTransport {
    async fn connect(self) -> transport::Result<Box<dyn Transport>> {
        Ok(Box::new(self))
    }
}

#[async_trait::async_trait]
impl Acceptor for MemoryTransport {
    async fn accept(self) -> transport::Result<Box<dyn Transport>> {
        Ok(Box::new(self))
    }
}

struct MemoryReader {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait::async_trait]
impl FrameRead for MemoryReader {
    async fn read_frame(&mut self) -> transport::Result<Option<Bytes>> {
        Ok(self.rx.recv().await)
    }
}

struct MemoryWriter {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
}

#[async_trait::async_trait]
impl FrameWrite for MemoryWriter {
    async fn write_frame(&mut self, frame: Bytes) -> transport::Result<()> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn shutdown(&mut self) -> transport::Result<()> {
        self.tx = None;
        Ok(())
    }
}
