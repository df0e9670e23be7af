//! # Transport Abstraction
//!
//! A minimal, async interface for moving frames between two local processes.
//!
//! ## Philosophy
//!
//! - **Frame-Oriented**: a transport moves whole messages. It knows nothing
//!   about requests, responses or values.
//! - **Split Halves**: reading and writing proceed independently. The read half
//!   belongs to the read loop; the write half belongs to the writer task.
//! - **Establishment is separate**: `Connector` and `Acceptor` produce a
//!   connected `Transport` once, then step out of the way.

use std::fmt;
use std::io;

use bytes::Bytes;

/// Errors that occur at the transport layer.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// The pipe is closed, locally or by the peer.
    Closed,
    /// A frame exceeded the negotiated maximum size.
    FrameTooLarge { size: usize, max: usize },
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "Pipe closed"),
            Self::FrameTooLarge { size, max } => {
                write!(f, "Frame of {} bytes exceeds maximum of {}", size, max)
            }
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => Self::Closed,
            _ => Self::Io(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// The receiving half of a transport.
#[async_trait::async_trait]
pub trait FrameRead: Send + 'static {
    /// Waits for the next complete frame.
    ///
    /// # invariants
    /// - Returns `Ok(None)` when the peer ended the stream on a frame boundary.
    /// - Returns `Err` if the stream ends inside a frame or the pipe fails.
    async fn read_frame(&mut self) -> Result<Option<Bytes>>;
}

/// The sending half of a transport.
#[async_trait::async_trait]
pub trait FrameWrite: Send + 'static {
    /// Writes one complete frame. Callers guarantee frames are not interleaved
    /// and that the future is driven to completion.
    async fn write_frame(&mut self, frame: Bytes) -> Result<()>;

    /// Flushes and closes the sending direction.
    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A connected, message-oriented duplex pipe.
pub trait Transport: Send + 'static {
    fn split(self: Box<Self>) -> (Box<dyn FrameRead>, Box<dyn FrameWrite>);
}

/// Establishes a transport by dialing out.
#[async_trait::async_trait]
pub trait Connector: Send + 'static {
    async fn connect(self) -> Result<Box<dyn Transport>>;
}

/// Establishes a transport by waiting for one peer to dial in.
#[async_trait::async_trait]
pub trait Acceptor: Send + 'static {
    async fn accept(self) -> Result<Box<dyn Transport>>;
}
