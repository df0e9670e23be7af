//! # Request Dispatcher
//!
//! Turns one inbound [`CallRequest`] into exactly one [`CallResponse`].
//!
//! ## Resolution Order
//!
//! 1. a contract is served on the request's channel
//! 2. the handler factory yields an instance
//! 3. a method with the requested name exists
//! 4. one of those methods takes this many arguments
//! 5. and this many generic witnesses
//! 6. every witness parses as a type descriptor
//! 7. every argument decodes and converts to its (substituted) parameter type
//! 8. the generic method instantiates for these witnesses
//! 9. the body runs to completion
//!
//! ## Invariants
//! - **Total**: every failure above, including a panicking handler, becomes a
//!   failure response. Nothing here can end the read loop.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use duowire::CallRequest;
use duowire::CallResponse;
use duowire::Channel;
use duowire::Codec;
use duowire::ConvertError;
use duowire::Converter;
use duowire::TypeDesc;
use duowire::value_kind;
use futures::FutureExt;
use tracing::debug;

use crate::contract::Args;
use crate::contract::Contract;
use crate::contract::Method;
use crate::endpoint::WeakEndpoint;

/// Why an inbound call could not be served. Rendered into the failure text.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchError {
    NoContract,
    NoInstance,
    NotFound {
        method: String,
    },
    Arity {
        method: String,
        expected: Vec<usize>,
        actual: usize,
    },
    GenericArity {
        method: String,
        expected: Vec<usize>,
        actual: usize,
    },
    /// A witness is not valid type descriptor text.
    Witness(duowire::Error),
    Decode {
        parameter: String,
        message: String,
    },
    Conversion {
        parameter: String,
        actual: &'static str,
        expected: TypeDesc,
        detail: ConvertError,
    },
    Instantiation {
        method: String,
        witnesses: Vec<TypeDesc>,
    },
    /// The handler body returned an error; carries its full chain.
    Invocation(String),
    Panic(String),
    Encode(String),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoContract => write!(f, "no handler registered for contract"),
            Self::NoInstance => write!(f, "handler factory returned no instance"),
            Self::NotFound { method } => write!(f, "method not found: {}", method),
            Self::Arity { method, expected, actual } => write!(
                f,
                "parameter mismatch: {} takes {} arguments, got {}",
                method,
                join_counts(expected),
                actual
            ),
            Self::GenericArity { method, expected, actual } => write!(
                f,
                "generic arguments mismatch: {} takes {} type arguments, got {}",
                method,
                join_counts(expected),
                actual
            ),
            Self::Witness(e) => write!(f, "invalid type argument: {}", e),
            Self::Decode { parameter, message } => {
                write!(f, "cannot decode parameter '{}': {}", parameter, message)
            }
            Self::Conversion { parameter, actual, expected, detail } => {
                write!(
                    f,
                    "cannot convert parameter '{}' from {} to {}",
                    parameter, actual, expected
                )?;
                if !detail.path.is_empty() {
                    write!(f, " ({})", detail)?;
                }
                Ok(())
            }
            Self::Instantiation { method, witnesses } => {
                let names: Vec<String> = witnesses.iter().map(ToString::to_string).collect();
                write!(f, "{} cannot be instantiated with <{}>", method, names.join(","))
            }
            Self::Invocation(msg) => write!(f, "{}", msg),
            Self::Panic(msg) => write!(f, "handler panicked: {}", msg),
            Self::Encode(msg) => write!(f, "cannot encode result: {}", msg),
        }
    }
}

impl std::error::Error for DispatchError {}

fn join_counts(counts: &[usize]) -> String {
    let parts: Vec<String> = counts.iter().map(ToString::to_string).collect();
    parts.join(" or ")
}

pub(crate) struct Dispatcher {
    contract: Option<Arc<Contract>>,
    served: Channel,
    codec: Arc<dyn Codec>,
    converter: Arc<dyn Converter>,
    /// The endpoint that owns this dispatcher, handed to handlers for callbacks.
    origin: WeakEndpoint,
}

impl Dispatcher {
    pub(crate) fn new(
        contract: Option<Arc<Contract>>,
        served: Channel,
        codec: Arc<dyn Codec>,
        converter: Arc<dyn Converter>,
        origin: WeakEndpoint,
    ) -> Self {
        Self { contract, served, codec, converter, origin }
    }

    pub(crate) async fn dispatch(&self, request: CallRequest) -> CallResponse {
        let id = request.id;
        let method = request.method.clone();
        match self.try_dispatch(request).await {
            Ok(bytes) => CallResponse::success(id, bytes),
            Err(e) => {
                debug!(call_id = id, method = %method, error = %e, "call failed");
                CallResponse::failure(id, e.to_string())
            }
        }
    }

    async fn try_dispatch(&self, request: CallRequest) -> Result<Bytes, DispatchError> {
        let contract = match &self.contract {
            Some(contract) if request.channel == self.served => contract,
            _ => return Err(DispatchError::NoContract),
        };

        let instance = guard(|| contract.instantiate_handler())?.ok_or(DispatchError::NoInstance)?;
        let method = resolve(contract, &request)?;

        let witnesses = request
            .witnesses
            .iter()
            .map(|text| text.parse::<TypeDesc>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(DispatchError::Witness)?;

        let targets = method.sig.concrete_params(&witnesses);
        let mut values = Vec::with_capacity(targets.len());
        for ((param, target), raw) in method.sig.params().iter().zip(&targets).zip(&request.args) {
            let value = self.codec.decode_value(raw).map_err(|e| DispatchError::Decode {
                parameter: param.name.clone(),
                message: e.to_string(),
            })?;
            let actual = value_kind(&value);
            let value = self.converter.convert(value, target).map_err(|detail| {
                DispatchError::Conversion {
                    parameter: param.name.clone(),
                    actual,
                    expected: target.clone(),
                    detail,
                }
            })?;
            values.push(value);
        }

        let thunk = guard(|| method.binding.resolve(&witnesses))?.ok_or_else(|| {
            DispatchError::Instantiation {
                method: request.method.clone(),
                witnesses: witnesses.clone(),
            }
        })?;

        let args = Args::new(values, witnesses).with_peer(self.origin.upgrade());
        let fut = guard(|| thunk(instance, args))?;
        let value = AssertUnwindSafe(fut)
            .catch_unwind()
            .await
            .map_err(|payload| DispatchError::Panic(panic_message(payload.as_ref())))?
            .map_err(|e| DispatchError::Invocation(format!("{:?}", e)))?;

        let bytes = self
            .codec
            .encode_value(&value)
            .map_err(|e| DispatchError::Encode(e.to_string()))?;
        Ok(Bytes::from(bytes))
    }
}

fn resolve<'c>(contract: &'c Contract, request: &CallRequest) -> Result<&'c Method, DispatchError> {
    let overloads = contract
        .overloads(&request.method)
        .filter(|o| !o.is_empty())
        .ok_or_else(|| DispatchError::NotFound { method: request.method.clone() })?;

    let argc = request.args.len();
    let by_arity: Vec<&Method> = overloads.iter().filter(|m| m.sig.params().len() == argc).collect();
    if by_arity.is_empty() {
        return Err(DispatchError::Arity {
            method: request.method.clone(),
            expected: sorted_counts(overloads.iter().map(|m| m.sig.params().len())),
            actual: argc,
        });
    }

    let wc = request.witnesses.len();
    by_arity
        .iter()
        .find(|m| m.sig.generics().len() == wc)
        .copied()
        .ok_or_else(|| DispatchError::GenericArity {
            method: request.method.clone(),
            expected: sorted_counts(by_arity.iter().map(|m| m.sig.generics().len())),
            actual: wc,
        })
}

fn sorted_counts(counts: impl Iterator<Item = usize>) -> Vec<usize> {
    let mut counts: Vec<usize> = counts.collect();
    counts.sort_unstable();
    counts.dedup();
    counts
}

/// Runs user code that may panic before its future exists.
fn guard<T>(f: impl FnOnce() -> T) -> Result<T, DispatchError> {
    std::panic::catch_unwind(AssertUnwindSafe(f))
        .map_err(|payload| DispatchError::Panic(panic_message(payload.as_ref())))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
