//! # Protocol Frames
//!
//! Defines the structure of the RPC envelope (Request vs Response) and its
//! byte layout. Values inside a frame are opaque blobs produced by a
//! [`Codec`](crate::codec::Codec); this module never decodes them.
//!
//! ## Wire Format
//!
//! All integers are little-endian. `blob` is `[len: u32][bytes: len]`.
//!
//! - **Request**: `[0x01][id: u64][channel: u8][method: blob][argc: u32][arg: blob]*[wc: u32][witness: blob]*`
//! - **Response**: `[0x02][id: u64][ok: u8][body: blob]`
//!
//! A witness blob is the UTF-8 text of a [`TypeDesc`](crate::types::TypeDesc).
//! It is carried as text and parsed by the receiver's dispatcher, so a witness
//! it cannot read fails that one call instead of the frame. A response body is
//! the encoded result when `ok == 1`, or UTF-8 failure text when `ok == 0`.
//!
//! ## Invariants
//! - **Panic Safety**: decoding checks every length before reading, never panics.
//! - **Exactness**: a frame must be consumed completely; trailing bytes are an error.

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::error::Error;
use crate::error::Result;

/// Correlation id linking a request to its response.
pub type CallId = u64;

/// Result carried by a response: the encoded value, or failure text.
pub type Outcome = std::result::Result<Bytes, String>;

const KIND_REQUEST: u8 = 0x01;
const KIND_RESPONSE: u8 = 0x02;

/// Which contract a request targets.
///
/// A client calls the server's contract on `Service`; the server calls back
/// into the client's contract on `Callback`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Channel {
    Service = 0,
    Callback = 1,
}

impl Channel {
    pub fn from_u8(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Self::Service),
            1 => Ok(Self::Callback),
            other => Err(Error::UnknownChannel(other)),
        }
    }

    /// The channel the peer uses to call us back.
    pub fn reverse(self) -> Self {
        match self {
            Self::Service => Self::Callback,
            Self::Callback => Self::Service,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Service => f.write_str("service"),
            Self::Callback => f.write_str("callback"),
        }
    }
}

/// An outbound or inbound call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    pub id: CallId,
    pub channel: Channel,
    pub method: String,
    /// Encoded argument values, in parameter order.
    pub args: Vec<Bytes>,
    /// Generic witnesses as type descriptor text, in generic-parameter order.
    pub witnesses: Vec<String>,
}

/// The answer to a [`CallRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct CallResponse {
    pub id: CallId,
    pub outcome: Outcome,
}

impl CallResponse {
    pub fn success(id: CallId, value: impl Into<Bytes>) -> Self {
        Self { id, outcome: Ok(value.into()) }
    }

    pub fn failure(id: CallId, message: impl Into<String>) -> Self {
        Self { id, outcome: Err(message.into()) }
    }
}

/// Top-level frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(CallRequest),
    Response(CallResponse),
}

impl Frame {
    pub fn id(&self) -> CallId {
        match self {
            Self::Request(r) => r.id,
            Self::Response(r) => r.id,
        }
    }

    /// Encodes this frame into a single contiguous buffer.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        match self {
            Self::Request(req) => {
                buf.put_u8(KIND_REQUEST);
                buf.put_u64_le(req.id);
                buf.put_u8(req.channel as u8);
                put_blob(&mut buf, "method", req.method.as_bytes())?;

                put_count(&mut buf, "argument count", req.args.len())?;
                for arg in &req.args {
                    put_blob(&mut buf, "argument", arg)?;
                }

                put_count(&mut buf, "witness count", req.witnesses.len())?;
                for witness in &req.witnesses {
                    put_blob(&mut buf, "witness", witness.as_bytes())?;
                }
            }
            Self::Response(resp) => {
                buf.put_u8(KIND_RESPONSE);
                buf.put_u64_le(resp.id);
                match &resp.outcome {
                    Ok(value) => {
                        buf.put_u8(1);
                        put_blob(&mut buf, "result", value)?;
                    }
                    Err(message) => {
                        buf.put_u8(0);
                        put_blob(&mut buf, "failure", message.as_bytes())?;
                    }
                }
            }
        }
        Ok(buf.freeze())
    }

    /// Decodes one complete frame. Argument and result blobs share the input buffer.
    pub fn decode(bytes: Bytes) -> Result<Self> {
        let mut rd = Reader { buf: bytes };
        let frame = match rd.u8("frame kind")? {
            KIND_REQUEST => {
                let id = rd.u64("call id")?;
                let channel = Channel::from_u8(rd.u8("channel")?)?;
                let method = rd.text("method")?;

                let argc = rd.count("argument count")?;
                let mut args = Vec::with_capacity(argc);
                for _ in 0..argc {
                    args.push(rd.blob("argument")?);
                }

                let wc = rd.count("witness count")?;
                let mut witnesses = Vec::with_capacity(wc);
                for _ in 0..wc {
                    witnesses.push(rd.text("witness")?);
                }

                Frame::Request(CallRequest { id, channel, method, args, witnesses })
            }
            KIND_RESPONSE => {
                let id = rd.u64("call id")?;
                let outcome = match rd.u8("success flag")? {
                    1 => Ok(rd.blob("result")?),
                    0 => Err(rd.text("failure")?),
                    other => return Err(Error::InvalidFlag(other)),
                };
                Frame::Response(CallResponse { id, outcome })
            }
            other => return Err(Error::UnknownFrameKind(other)),
        };

        if rd.buf.has_remaining() {
            return Err(Error::TrailingBytes(rd.buf.remaining()));
        }
        Ok(frame)
    }
}

/// Reads just the correlation id from a raw frame.
/// Useful for diagnostics when the full decoding fails.
pub fn peek_call_id(bytes: &[u8]) -> Result<CallId> {
    let mut buf = bytes;
    if buf.remaining() < 9 {
        return Err(Error::UnexpectedEnd { field: "call id" });
    }
    match buf.get_u8() {
        KIND_REQUEST | KIND_RESPONSE => Ok(buf.get_u64_le()),
        other => Err(Error::UnknownFrameKind(other)),
    }
}

// Helper functions

fn put_count(buf: &mut BytesMut, field: &'static str, n: usize) -> Result<()> {
    let n = u32::try_from(n).map_err(|_| Error::FieldTooLarge { field, len: n })?;
    buf.put_u32_le(n);
    Ok(())
}

fn put_blob(buf: &mut BytesMut, field: &'static str, data: &[u8]) -> Result<()> {
    put_count(buf, field, data.len())?;
    buf.put_slice(data);
    Ok(())
}

/// Bounds-checked cursor over a frame buffer.
struct Reader {
    buf: Bytes,
}

impl Reader {
    fn need(&self, n: usize, field: &'static str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(Error::UnexpectedEnd { field });
        }
        Ok(())
    }

    fn u8(&mut self, field: &'static str) -> Result<u8> {
        self.need(1, field)?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self, field: &'static str) -> Result<u32> {
        self.need(4, field)?;
        Ok(self.buf.get_u32_le())
    }

    fn u64(&mut self, field: &'static str) -> Result<u64> {
        self.need(8, field)?;
        Ok(self.buf.get_u64_le())
    }

    /// A count is bounded by the bytes left, since every item is at least a u32 length.
    fn count(&mut self, field: &'static str) -> Result<usize> {
        let n = self.u32(field)? as usize;
        if n > self.buf.remaining() / 4 {
            return Err(Error::UnexpectedEnd { field });
        }
        Ok(n)
    }

    fn blob(&mut self, field: &'static str) -> Result<Bytes> {
        let len = self.u32(field)? as usize;
        self.need(len, field)?;
        Ok(self.buf.split_to(len))
    }

    fn text(&mut self, field: &'static str) -> Result<String> {
        let blob = self.blob(field)?;
        String::from_utf8(blob.to_vec()).map_err(|_| Error::InvalidUtf8 { field })
    }
}
