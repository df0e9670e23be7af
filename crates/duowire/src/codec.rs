//! # Value Codec
//!
//! Turns one value into bytes and back. Frames carry each argument and each
//! result as an opaque, separately encoded blob, so a value that fails to decode
//! only affects the call it belongs to.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::Result;

/// A byte-level value serializer.
///
/// Both ends of a connection must use the same codec; nothing on the wire
/// identifies it.
pub trait Codec: Send + Sync + 'static {
    fn encode_value(&self, value: &Value) -> Result<Vec<u8>>;
    fn decode_value(&self, bytes: &[u8]) -> Result<Value>;
}

/// JSON text encoding of values.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode_value(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Converts any serializable Rust value into a dynamic `Value`.
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Converts a dynamic `Value` into a concrete Rust type.
pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}
