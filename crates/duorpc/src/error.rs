//! # Error Definitions
//!
//! What a caller of an [`Endpoint`](crate::Endpoint) can observe.
//!
//! Failures of the *remote* call (unknown method, bad arguments, the handler
//! returning an error) all arrive as [`Error::Remote`] with the peer's
//! diagnostic text. Failures of the *connection* arrive as [`Error::Fault`]
//! and are shared by every call that was outstanding when it happened.

use std::fmt;

use crate::state::ConnectionState;
use crate::transport::TransportError;

/// Classifies an unrecoverable connection failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Reading or writing the transport failed.
    Io,
    /// A frame arrived whose structure could not be decoded.
    Decode,
    /// The peer closed the pipe.
    PeerClosed,
    /// An inbound frame exceeded the configured maximum.
    FrameTooLarge,
}

/// The recorded cause of a `Faulted` connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FaultKind::Io => write!(f, "transport failure: {}", self.message),
            FaultKind::Decode => write!(f, "undecodable frame: {}", self.message),
            FaultKind::PeerClosed => write!(f, "connection closed by peer: {}", self.message),
            FaultKind::FrameTooLarge => write!(f, "frame too large: {}", self.message),
        }
    }
}

impl From<TransportError> for Fault {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Closed => Self::new(FaultKind::PeerClosed, "pipe closed"),
            TransportError::FrameTooLarge { size, max } => {
                Self::new(FaultKind::FrameTooLarge, format!("{} bytes exceeds limit of {}", size, max))
            }
            other => Self::new(FaultKind::Io, other.to_string()),
        }
    }
}

/// Endpoint errors.
#[derive(Debug, Clone)]
pub enum Error {
    /// The transport could not be connected or accepted.
    Connect(String),
    /// The operation is not allowed in the current connection state.
    State {
        operation: &'static str,
        state: ConnectionState,
    },
    /// The peer answered with a failure response.
    Remote(String),
    /// A local value could not be converted to or from its wire form.
    Conversion {
        parameter: String,
        actual: String,
        expected: String,
    },
    /// The connection faulted while the call was outstanding.
    Fault(Fault),
    /// The call, or the whole endpoint, was canceled locally.
    Canceled,
    /// No response arrived within the configured call timeout.
    Timeout,
    /// The outbound frame could not be built.
    Wire(duowire::Error),
    /// The outbound frame exceeds the configured maximum. Nothing was sent.
    FrameTooLarge { size: usize, max: usize },
}

impl Error {
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Fault(_))
    }

    pub fn is_state(&self) -> bool {
        matches!(self, Self::State { .. })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(msg) => write!(f, "connect failed: {}", msg),
            Self::State { operation, state } => {
                write!(f, "cannot {} while connection is {}", operation, state)
            }
            Self::Remote(msg) => write!(f, "remote call failed: {}", msg),
            Self::Conversion { parameter, actual, expected } => write!(
                f,
                "cannot convert {} from {} to {}",
                parameter, actual, expected
            ),
            Self::Fault(fault) => write!(f, "connection fault: {}", fault),
            Self::Canceled => write!(f, "call canceled"),
            Self::Timeout => write!(f, "call timed out"),
            Self::Wire(e) => write!(f, "wire error: {}", e),
            Self::FrameTooLarge { size, max } => {
                write!(f, "frame of {} bytes exceeds maximum of {}", size, max)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Wire(e) => Some(e),
            _ => None,
        }
    }
}

impl From<duowire::Error> for Error {
    fn from(e: duowire::Error) -> Self {
        Self::Wire(e)
    }
}

impl From<Fault> for Error {
    fn from(f: Fault) -> Self {
        Self::Fault(f)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
