//! # Error Definitions
//!
//! Failures of the wire layer: malformed frames, bad type descriptors and
//! values the codec refused.

/// Wire layer errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Buffer exhausted while reading a field.
    UnexpectedEnd { field: &'static str },
    /// A text field is not valid UTF-8.
    InvalidUtf8 { field: &'static str },
    /// The leading discriminator byte is not a known frame kind.
    UnknownFrameKind(u8),
    /// The channel byte is not a known channel.
    UnknownChannel(u8),
    /// A success flag other than 0 or 1.
    InvalidFlag(u8),
    /// Bytes remained after the last field of a frame.
    TrailingBytes(usize),
    /// A type descriptor string could not be parsed.
    InvalidTypeDesc { input: String, reason: String },
    /// A length or count does not fit the u32 header field.
    FieldTooLarge { field: &'static str, len: usize },
    /// The value codec failed to encode or decode a value.
    Codec(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnexpectedEnd { field } => write!(f, "frame ended while reading {}", field),
            Self::InvalidUtf8 { field } => write!(f, "{} is not valid UTF-8", field),
            Self::UnknownFrameKind(b) => write!(f, "unknown frame kind {:#04x}", b),
            Self::UnknownChannel(b) => write!(f, "unknown channel {:#04x}", b),
            Self::InvalidFlag(b) => write!(f, "invalid success flag {:#04x}", b),
            Self::TrailingBytes(n) => write!(f, "{} trailing bytes after frame", n),
            Self::InvalidTypeDesc { input, reason } => {
                write!(f, "invalid type descriptor '{}': {}", input, reason)
            }
            Self::FieldTooLarge { field, len } => {
                write!(f, "{} of length {} does not fit in a frame", field, len)
            }
            Self::Codec(msg) => write!(f, "codec error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

/// A specialized Result type for wire operations.
pub type Result<T> = std::result::Result<T, Error>;
