//! # Duorpc
//!
//! Bidirectional call/response RPC over one local duplex pipe.
//!
//! One process serves a [`Contract`]; the other connects and invokes its
//! methods by name. Either side may serve a contract, so the callee can call
//! back into the caller over the same connection.
//!
//! ## Architecture
//!
//! - [`transport`]: frame-oriented pipe halves, plus `Connector`/`Acceptor` to
//!   establish them ([`framed`], [`memory`] and `unix` implement it).
//! - `pending`: outstanding calls by correlation id, resolved exactly once.
//! - [`invoker`]: `MethodCall` in, request frame out, result back.
//! - [`contract`] and [`dispatch`]: method registry and inbound call resolution.
//! - `stream`: the single write path and the sequential frame pump.
//! - `connection`: the read loop that owns the state once connected.
//! - [`endpoint`]: the composition root most users touch.
//!
//! ## Failure Model
//!
//! Anything wrong with a single call (unknown method, bad arguments, a failing
//! or panicking handler) is answered with a failure response and the
//! connection carries on. Only transport failures and undecodable frames fault
//! the connection, and a fault fails every outstanding call at once.

pub mod config;
mod connection;
pub mod contract;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod framed;
pub mod invoker;
pub mod memory;
mod pending;
pub mod state;
mod stream;
pub mod transport;
#[cfg(unix)]
pub mod unix;

#[cfg(test)]
mod tests;

pub use config::EndpointConfig;
pub use contract::Args;
pub use contract::Contract;
pub use contract::ContractBuilder;
pub use contract::Invocable;
pub use contract::MethodSig;
pub use contract::Param;
pub use dispatch::DispatchError;
pub use endpoint::Endpoint;
pub use endpoint::EndpointBuilder;
pub use endpoint::Role;
pub use error::Error;
pub use error::Fault;
pub use error::FaultKind;
pub use error::Result;
pub use framed::LengthDelimited;
pub use invoker::MethodCall;
pub use memory::MemoryTransport;
pub use state::ConnectionState;
pub use transport::Acceptor;
pub use transport::Connector;
pub use transport::Transport;
pub use transport::TransportError;
#[cfg(unix)]
pub use unix::UnixAcceptor;
#[cfg(unix)]
pub use unix::UnixConnector;

pub use duowire::Channel;
pub use duowire::TypeDesc;
pub use duowire::Value;
pub use tokio_util::sync::CancellationToken;
