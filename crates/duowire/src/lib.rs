//! # Duowire
//!
//! The wire vocabulary of duorpc: what a frame looks like, how a type is named
//! on the wire, and how loosely typed values are coerced into the types a
//! handler declares.
//!
//! ## Architecture
//!
//! - [`frame`]: Request/Response envelopes and their byte layout.
//! - [`types`]: `TypeDesc`, the textual type descriptor used for generic witnesses
//!   and parameter declarations.
//! - [`codec`]: encodes a single value to bytes and back. Frames never look inside
//!   an encoded value.
//! - [`convert`]: coerces a decoded value into a declared `TypeDesc`.
//!
//! Nothing here performs I/O or owns a runtime.

pub mod codec;
pub mod convert;
pub mod error;
pub mod frame;
pub mod types;

#[cfg(test)]
mod tests;

pub use codec::Codec;
pub use codec::JsonCodec;
pub use codec::from_value;
pub use codec::to_value;
pub use convert::ConvertError;
pub use convert::Converter;
pub use convert::StandardConverter;
pub use error::Error;
pub use error::Result;
pub use frame::CallId;
pub use frame::CallRequest;
pub use frame::CallResponse;
pub use frame::Channel;
pub use frame::Frame;
pub use frame::Outcome;
pub use frame::peek_call_id;
pub use types::MAX_TYPE_DEPTH;
pub use types::TypeDesc;
pub use types::value_kind;

/// A decoded, dynamically typed value.
pub use serde_json::Value;
