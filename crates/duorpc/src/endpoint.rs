//! # Endpoint
//!
//! The composition root. An endpoint owns one connection, its pending-call
//! table, its dispatcher and its read loop.
//!
//! ```ignore
//! let server = Endpoint::server().name("math").serve(contract).build();
//! server.listen(acceptor).await?;
//!
//! let client = Endpoint::client().name("app").build();
//! client.connect(connector).await?;
//! let sum: i64 = client.call(MethodCall::new("Add").arg(&2).arg(&3)).await?;
//! ```
//!
//! ## Roles
//!
//! Both roles speak the same protocol. The client invokes the server's
//! contract on [`Channel::Service`] and may serve a callback contract on
//! [`Channel::Callback`]; the server does the reverse.
//!
//! ## Lifecycle
//!
//! `connect`/`listen` may be called once. Calls are accepted only while
//! Connected. `dispose` (or dropping the last handle) cancels the read loop;
//! outstanding calls then resolve `Canceled` and the state becomes Closed.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::Weak;
use std::time::Duration;

use duowire::Channel;
use duowire::Codec;
use duowire::Converter;
use duowire::JsonCodec;
use duowire::StandardConverter;
use duowire::Value;
use duowire::value_kind;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use crate::config::EndpointConfig;
use crate::connection::ReadLoop;
use crate::contract::Contract;
use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::error::Fault;
use crate::error::FaultKind;
use crate::error::Result;
use crate::invoker::Invoker;
use crate::invoker::MethodCall;
use crate::pending::PendingCalls;
use crate::state::ConnectionState;
use crate::state::StateCell;
use crate::stream::FrameWriter;
use crate::stream::Pump;
use crate::transport;
use crate::transport::Acceptor;
use crate::transport::Connector;
use crate::transport::Transport;

/// Which side of the connection an endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// The channel this role's outbound calls travel on.
    pub fn invokes(self) -> Channel {
        match self {
            Self::Client => Channel::Service,
            Self::Server => Channel::Callback,
        }
    }

    /// The channel this role answers.
    pub fn serves(self) -> Channel {
        self.invokes().reverse()
    }
}

/// Fluent configuration for an [`Endpoint`].
pub struct EndpointBuilder {
    role: Role,
    config: EndpointConfig,
    contract: Option<Contract>,
    codec: Arc<dyn Codec>,
    converter: Arc<dyn Converter>,
}

impl EndpointBuilder {
    fn new(role: Role) -> Self {
        Self {
            role,
            config: EndpointConfig::default(),
            contract: None,
            codec: Arc::new(JsonCodec),
            converter: Arc::new(StandardConverter),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Exposes `contract` to the peer.
    pub fn serve(mut self, contract: Contract) -> Self {
        self.contract = Some(contract);
        self
    }

    pub fn codec(mut self, codec: impl Codec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    pub fn converter(mut self, converter: impl Converter) -> Self {
        self.converter = Arc::new(converter);
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = Some(timeout);
        self
    }

    pub fn max_frame_size(mut self, max: usize) -> Self {
        self.config.max_frame_size = max;
        self
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: EndpointConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Endpoint {
        let Self { role, config, contract, codec, converter } = self;
        let contract = contract.map(Arc::new);

        let inner = Arc::new_cyclic(|weak| {
            let dispatcher = Dispatcher::new(
                contract,
                role.serves(),
                codec.clone(),
                converter,
                WeakEndpoint(weak.clone()),
            );
            Inner {
                role,
                config,
                codec,
                dispatcher: Arc::new(dispatcher),
                state: Arc::new(StateCell::new()),
                pending: Arc::new(PendingCalls::new()),
                writer: OnceLock::new(),
                cancel: CancellationToken::new(),
            }
        });

        Endpoint { inner }
    }
}

struct Inner {
    role: Role,
    config: EndpointConfig,
    codec: Arc<dyn Codec>,
    dispatcher: Arc<Dispatcher>,
    state: Arc<StateCell>,
    pending: Arc<PendingCalls>,
    writer: OnceLock<Arc<FrameWriter>>,
    cancel: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// One side of a bidirectional RPC connection.
///
/// Cheap to clone; every clone refers to the same connection. The read loop
/// does not keep the endpoint alive: when the last handle is dropped, the
/// connection is canceled.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.inner.config.name)
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .finish()
    }
}

impl Endpoint {
    pub fn client() -> EndpointBuilder {
        EndpointBuilder::new(Role::Client)
    }

    pub fn server() -> EndpointBuilder {
        EndpointBuilder::new(Role::Server)
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Current lifecycle state. Never blocks.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    /// Number of calls awaiting a response.
    pub fn outstanding_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Dials the peer and starts the read loop.
    pub async fn connect(&self, connector: impl Connector) -> Result<()> {
        self.open("connect", connector.connect()).await
    }

    /// Waits for the peer to dial in and starts the read loop.
    pub async fn listen(&self, acceptor: impl Acceptor) -> Result<()> {
        self.open("listen", acceptor.accept()).await
    }

    async fn open<F>(&self, operation: &'static str, establish: F) -> Result<()>
    where
        F: Future<Output = transport::Result<Box<dyn Transport>>>,
    {
        let inner = &self.inner;
        inner
            .state
            .begin_open()
            .map_err(|state| Error::State { operation, state })?;
        debug!(endpoint = %inner.config.name, role = ?inner.role, operation, "opening connection");

        let established = tokio::select! {
            _ = inner.cancel.cancelled() => return Err(Error::Canceled),
            established = establish => established,
        };

        let transport = match established {
            Ok(transport) => transport,
            Err(e) => {
                inner.state.fail(Fault::new(FaultKind::Io, e.to_string()));
                inner.pending.fail_all(Error::Connect(e.to_string()));
                return Err(Error::Connect(e.to_string()));
            }
        };

        let (source, sink) = transport.split();
        let writer = Arc::new(FrameWriter::new(sink, inner.config.max_frame_size));
        let _ = inner.writer.set(writer.clone());

        if !inner.state.transition(ConnectionState::Connected) {
            // Disposed while the transport was being established.
            writer.shutdown().await;
            return Err(Error::Canceled);
        }
        info!(endpoint = %inner.config.name, role = ?inner.role, "connected");

        let pump = Pump::new(source, writer.clone(), inner.pending.clone(), inner.dispatcher.clone());
        let read_loop = ReadLoop {
            endpoint: inner.config.name.clone(),
            pump,
            state: inner.state.clone(),
            pending: inner.pending.clone(),
            writer,
            cancel: inner.cancel.clone(),
        };
        tokio::spawn(read_loop.run());
        Ok(())
    }

    /// Calls a method on the peer and returns its result as a dynamic value.
    ///
    /// Fails immediately with [`Error::State`] unless Connected. Canceling
    /// `cancel` abandons only this call; the peer is not told and its eventual
    /// response is dropped.
    pub async fn invoke(&self, call: MethodCall, cancel: Option<&CancellationToken>) -> Result<Value> {
        let inner = &self.inner;
        let state = inner.state.get();
        let writer = match (state, inner.writer.get()) {
            (ConnectionState::Connected, Some(writer)) => writer,
            _ => return Err(Error::State { operation: "invoke", state }),
        };

        let invoker = Invoker {
            endpoint: &inner.config.name,
            channel: inner.role.invokes(),
            pending: &inner.pending,
            writer,
            codec: inner.codec.as_ref(),
            timeout: inner.config.call_timeout,
        };
        invoker.invoke(call, cancel).await
    }

    /// Calls a method and deserializes its result into `R`.
    pub async fn call<R: DeserializeOwned>(&self, call: MethodCall) -> Result<R> {
        let value = self.invoke(call, None).await?;
        decode_result(value)
    }

    /// Like [`call`](Self::call), abandoned when `cancel` fires.
    pub async fn call_with_cancel<R: DeserializeOwned>(
        &self,
        call: MethodCall,
        cancel: &CancellationToken,
    ) -> Result<R> {
        let value = self.invoke(call, Some(cancel)).await?;
        decode_result(value)
    }

    /// Resolves when the connection ends: `Ok` once Closed, the recorded
    /// fault once Faulted. Returns at once if already terminal.
    pub async fn wait_closed(&self) -> Result<()> {
        self.inner.state.wait_terminal().await.map_err(Error::Fault)
    }

    /// Cancels the connection and waits until it is terminal.
    ///
    /// Outstanding calls resolve `Canceled`. Idempotent.
    pub async fn dispose(&self) {
        let inner = &self.inner;
        inner.cancel.cancel();

        // No read loop exists yet to observe the cancellation.
        if matches!(inner.state.get(), ConnectionState::NotOpened | ConnectionState::Connecting)
            && inner.state.transition(ConnectionState::Closed)
        {
            inner.pending.fail_all(Error::Canceled);
            debug!(endpoint = %inner.config.name, "disposed before connecting");
        }

        let _ = inner.state.wait_terminal().await;
    }
}

/// A non-owning handle, used where holding the endpoint would keep it alive.
#[derive(Clone)]
pub(crate) struct WeakEndpoint(Weak<Inner>);

impl WeakEndpoint {
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self(Weak::new())
    }

    pub(crate) fn upgrade(&self) -> Option<Endpoint> {
        self.0.upgrade().map(|inner| Endpoint { inner })
    }
}

fn decode_result<R: DeserializeOwned>(value: Value) -> Result<R> {
    let actual = value_kind(&value);
    duowire::from_value(value).map_err(|e| Error::Conversion {
        parameter: "result".to_string(),
        actual: actual.to_string(),
        expected: format!("{} ({})", std::any::type_name::<R>(), e),
    })
}
