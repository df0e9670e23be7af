//! # Method Invoker
//!
//! Turns a [`MethodCall`] into a request frame, sends it and waits for the
//! matching response.
//!
//! ## Invariants
//! - The pending entry is registered **before** the frame is written, so a
//!   fast response can never arrive ahead of its entry.
//! - Whatever ends the wait (response, cancellation, timeout, send failure or
//!   the caller dropping the future), the entry leaves the table.
//! - Cancellation and the call timeout cover the send as well as the wait.

use std::time::Duration;

use bytes::Bytes;
use duowire::CallId;
use duowire::CallRequest;
use duowire::Channel;
use duowire::Codec;
use duowire::TypeDesc;
use duowire::Value;
use duowire::value_kind;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Error;
use crate::error::Result;
use crate::pending::PendingCalls;
use crate::pending::Resolution;
use crate::stream::FrameWriter;

/// Describes one outbound call: method name, arguments and generic witnesses.
///
/// ```ignore
/// let call = MethodCall::new("Add").arg(&2).arg(&3);
/// let call = MethodCall::new("Parse").witness(TypeDesc::I32).arg("5");
/// ```
#[derive(Debug, Clone)]
pub struct MethodCall {
    method: String,
    args: Vec<Value>,
    witnesses: Vec<TypeDesc>,
    /// First argument that failed to serialize; reported when the call is made.
    error: Option<Error>,
}

impl MethodCall {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            args: Vec::new(),
            witnesses: Vec::new(),
            error: None,
        }
    }

    /// Appends a serializable argument.
    pub fn arg<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        match duowire::to_value(value) {
            Ok(v) => self.args.push(v),
            Err(e) => {
                if self.error.is_none() {
                    self.error = Some(Error::Conversion {
                        parameter: format!("argument {}", self.args.len()),
                        actual: std::any::type_name::<T>().to_string(),
                        expected: format!("a serializable value ({})", e),
                    });
                }
                self.args.push(Value::Null);
            }
        }
        self
    }

    /// Appends an already dynamic argument.
    pub fn value(mut self, value: Value) -> Self {
        self.args.push(value);
        self
    }

    /// Appends a generic witness, in generic-parameter order.
    pub fn witness(mut self, ty: TypeDesc) -> Self {
        self.witnesses.push(ty);
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn witnesses(&self) -> &[TypeDesc] {
        &self.witnesses
    }
}

/// Borrowed view of an endpoint's outbound machinery for one call.
pub(crate) struct Invoker<'a> {
    pub(crate) endpoint: &'a str,
    pub(crate) channel: Channel,
    pub(crate) pending: &'a PendingCalls,
    pub(crate) writer: &'a FrameWriter,
    pub(crate) codec: &'a dyn Codec,
    pub(crate) timeout: Option<Duration>,
}

impl Invoker<'_> {
    pub(crate) async fn invoke(&self, call: MethodCall, cancel: Option<&CancellationToken>) -> Result<Value> {
        let MethodCall { method, args, witnesses, error } = call;
        if let Some(e) = error {
            return Err(e);
        }

        let args = args
            .iter()
            .enumerate()
            .map(|(i, v)| {
                self.codec
                    .encode_value(v)
                    .map(Bytes::from)
                    .map_err(|e| Error::Conversion {
                        parameter: format!("argument {}", i),
                        actual: value_kind(v).to_string(),
                        expected: format!("an encodable value ({})", e),
                    })
            })
            .collect::<Result<Vec<Bytes>>>()?;
        let witnesses = witnesses
            .iter()
            .map(TypeDesc::to_wire)
            .collect::<std::result::Result<Vec<String>, _>>()?;

        let (id, rx) = self.pending.register()?;
        let mut entry = EntryGuard { pending: self.pending, id, armed: true };

        let never = CancellationToken::new();
        let cancel = cancel.unwrap_or(&never);
        let deadline = self.timeout.and_then(|d| Instant::now().checked_add(d));

        debug!(endpoint = %self.endpoint, call_id = id, method = %method, "sending call");
        let request = CallRequest {
            id,
            channel: self.channel,
            method,
            args,
            witnesses,
        };
        // A stalled pipe must not outlive the caller's cancel or deadline.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Canceled),
            _ = expired(deadline) => return Err(Error::Timeout),
            sent = self.writer.send_request(request) => sent?,
        }

        let resolution = self.wait(id, rx, cancel, deadline).await;
        entry.armed = false;

        match resolution? {
            Ok(bytes) => self.codec.decode_value(&bytes).map_err(|e| Error::Conversion {
                parameter: "result".to_string(),
                actual: format!("{} undecodable bytes", bytes.len()),
                expected: format!("a value ({})", e),
            }),
            Err(message) => Err(Error::Remote(message)),
        }
    }

    async fn wait(
        &self,
        id: CallId,
        mut rx: oneshot::Receiver<Resolution>,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Resolution {
        let abandoned = tokio::select! {
            resolution = &mut rx => return resolution.unwrap_or(Err(Error::Canceled)),
            _ = cancel.cancelled() => Error::Canceled,
            _ = expired(deadline) => Error::Timeout,
        };

        if self.pending.cancel(id) {
            debug!(endpoint = %self.endpoint, call_id = id, reason = %abandoned, "call abandoned");
            return Err(abandoned);
        }
        // A resolver already took the entry; its value is on the way.
        rx.await.unwrap_or(Err(abandoned))
    }
}

async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

/// Removes the pending entry if the invoke future is dropped early.
struct EntryGuard<'a> {
    pending: &'a PendingCalls,
    id: CallId,
    armed: bool,
}

impl Drop for EntryGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pending.cancel(self.id);
        }
    }
}
