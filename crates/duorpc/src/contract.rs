//! # Handler Contracts
//!
//! A `Contract` is the set of methods one side exposes to its peer. It is
//! built once at setup from typed closures; after that, dispatch only looks
//! things up.
//!
//! ## Resolution
//!
//! A method is identified by its name, its parameter count and its generic
//! parameter count. There is no overloading beyond that.
//!
//! ## Handler Instances
//!
//! The contract owns a factory, not a handler. Every inbound request asks the
//! factory for a fresh instance; instances are never shared between requests.
//!
//! ## Generics
//!
//! A generic method declares its type parameters by name (`.generic("T")`) and
//! refers to them in parameter types as `TypeDesc::named("T")`. At call time
//! the caller supplies one witness per type parameter. The dispatcher
//! substitutes the witnesses into the declared types before converting
//! arguments, then asks the method's instantiator for a concrete invocable.
//! Instantiations are cached per witness combination.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::Context as _;
use dashmap::DashMap;
use duowire::TypeDesc;
use duowire::Value;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::endpoint::Endpoint;

pub(crate) type Instance = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn() -> Option<Instance> + Send + Sync>;
pub(crate) type Thunk = Arc<dyn Fn(Instance, Args) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;
type Instantiator = Arc<dyn Fn(&[TypeDesc]) -> Option<Thunk> + Send + Sync>;
type Body<H> = Arc<dyn Fn(Arc<H>, Args) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Converted arguments handed to a handler method.
#[derive(Debug, Clone, Default)]
pub struct Args {
    values: Vec<Value>,
    witnesses: Vec<TypeDesc>,
    peer: Option<Endpoint>,
}

impl Args {
    pub fn new(values: Vec<Value>, witnesses: Vec<TypeDesc>) -> Self {
        Self { values, witnesses, peer: None }
    }

    pub(crate) fn with_peer(mut self, peer: Option<Endpoint>) -> Self {
        self.peer = peer;
        self
    }

    /// The endpoint that received this call. Invoking on it calls back into
    /// the caller over the same connection.
    pub fn peer(&self) -> Option<&Endpoint> {
        self.peer.as_ref()
    }

    /// Deserializes argument `idx` into `T`.
    pub fn get<T: DeserializeOwned>(&self, idx: usize) -> anyhow::Result<T> {
        let value = self
            .values
            .get(idx)
            .cloned()
            .with_context(|| format!("argument {} is missing", idx))?;
        duowire::from_value(value).with_context(|| format!("argument {} has the wrong shape", idx))
    }

    pub fn value(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// The generic witnesses this call was made with.
    pub fn witnesses(&self) -> &[TypeDesc] {
        &self.witnesses
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: TypeDesc,
}

/// Declared shape of a method.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodSig {
    name: String,
    params: Vec<Param>,
    generics: Vec<String>,
}

impl MethodSig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            generics: Vec::new(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, ty: TypeDesc) -> Self {
        self.params.push(Param { name: name.into(), ty });
        self
    }

    /// Declares a generic type parameter. Parameter types refer to it as
    /// `TypeDesc::named(name)`.
    pub fn generic(mut self, name: impl Into<String>) -> Self {
        self.generics.push(name.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn generics(&self) -> &[String] {
        &self.generics
    }

    /// Parameter types with `witnesses` bound to the generic parameters.
    pub(crate) fn concrete_params(&self, witnesses: &[TypeDesc]) -> Vec<TypeDesc> {
        self.params
            .iter()
            .map(|p| p.ty.substitute(&self.generics, witnesses))
            .collect()
    }
}

/// A typed method body over handler type `H`.
///
/// Sync and async bodies are both stored as "returns a future of a value".
pub struct Invocable<H> {
    f: Body<H>,
}

impl<H> Clone for Invocable<H> {
    fn clone(&self) -> Self {
        Self { f: self.f.clone() }
    }
}

impl<H: Send + Sync + 'static> Invocable<H> {
    /// Wraps an async method body.
    pub fn new<F, Fut, R>(f: F) -> Self
    where
        F: Fn(Arc<H>, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Serialize,
    {
        let body: Body<H> = Arc::new(move |handler: Arc<H>, args: Args| -> BoxFuture<'static, anyhow::Result<Value>> {
            let fut = f(handler, args);
            Box::pin(async move {
                let result = fut.await?;
                let value = duowire::to_value(&result)?;
                anyhow::Ok(value)
            })
        });
        Self { f: body }
    }

    /// Wraps a synchronous method body.
    pub fn sync<F, R>(f: F) -> Self
    where
        F: Fn(&H, Args) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Serialize,
    {
        let body: Body<H> = Arc::new(move |handler: Arc<H>, args: Args| -> BoxFuture<'static, anyhow::Result<Value>> {
            let result = f(&*handler, args).and_then(|r| Ok(duowire::to_value(&r)?));
            Box::pin(futures::future::ready(result))
        });
        Self { f: body }
    }

    fn erase(self) -> Thunk {
        let f = self.f;
        Arc::new(move |instance: Instance, args: Args| -> BoxFuture<'static, anyhow::Result<Value>> {
            match instance.downcast::<H>() {
                Ok(handler) => f(handler, args),
                Err(_) => Box::pin(futures::future::ready(Err(anyhow::anyhow!(
                    "handler instance has an unexpected type"
                )))),
            }
        })
    }
}

pub(crate) enum Binding {
    Fixed(Thunk),
    Generic {
        instantiate: Instantiator,
        cache: DashMap<Vec<TypeDesc>, Thunk>,
    },
}

impl Binding {
    /// Returns the invocable for `witnesses`, instantiating it on first use.
    pub(crate) fn resolve(&self, witnesses: &[TypeDesc]) -> Option<Thunk> {
        match self {
            Self::Fixed(thunk) => Some(thunk.clone()),
            Self::Generic { instantiate, cache } => {
                if let Some(thunk) = cache.get(witnesses) {
                    return Some(thunk.clone());
                }
                let thunk = instantiate(witnesses)?;
                Some(cache.entry(witnesses.to_vec()).or_insert(thunk).clone())
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn cached_instantiations(&self) -> usize {
        match self {
            Self::Fixed(_) => 0,
            Self::Generic { cache, .. } => cache.len(),
        }
    }
}

pub(crate) struct Method {
    pub(crate) sig: MethodSig,
    pub(crate) binding: Binding,
}

/// A named, immutable method registry with its handler factory.
pub struct Contract {
    name: String,
    factory: Factory,
    methods: HashMap<String, Vec<Method>>,
}

impl std::fmt::Debug for Contract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.methods.keys().collect();
        names.sort();
        f.debug_struct("Contract")
            .field("name", &self.name)
            .field("methods", &names)
            .finish()
    }
}

impl Contract {
    /// Starts a contract whose handler instances are produced by `factory`.
    ///
    /// A factory returning `None` makes every call fail with
    /// "handler factory returned no instance".
    pub fn builder<H, F>(name: impl Into<String>, factory: F) -> ContractBuilder<H>
    where
        H: Send + Sync + 'static,
        F: Fn() -> Option<H> + Send + Sync + 'static,
    {
        ContractBuilder {
            name: name.into(),
            factory: Arc::new(move || factory().map(|h| Arc::new(h) as Instance)),
            methods: HashMap::new(),
            _handler: std::marker::PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn instantiate_handler(&self) -> Option<Instance> {
        (self.factory)()
    }

    pub(crate) fn overloads(&self, method: &str) -> Option<&[Method]> {
        self.methods.get(method).map(Vec::as_slice)
    }
}

/// Collects methods for a [`Contract`].
pub struct ContractBuilder<H> {
    name: String,
    factory: Factory,
    methods: HashMap<String, Vec<Method>>,
    _handler: std::marker::PhantomData<fn() -> H>,
}

impl<H: Send + Sync + 'static> ContractBuilder<H> {
    /// Registers a non-generic method.
    pub fn method(self, sig: MethodSig, body: Invocable<H>) -> Self {
        self.push(sig, Binding::Fixed(body.erase()))
    }

    /// Registers a generic method. `instantiate` is called once per distinct
    /// witness combination and may refuse combinations it does not support.
    pub fn generic_method<F>(self, sig: MethodSig, instantiate: F) -> Self
    where
        F: Fn(&[TypeDesc]) -> Option<Invocable<H>> + Send + Sync + 'static,
    {
        let erased: Instantiator =
            Arc::new(move |witnesses: &[TypeDesc]| instantiate(witnesses).map(Invocable::erase));
        self.push(sig, Binding::Generic { instantiate: erased, cache: DashMap::new() })
    }

    fn push(mut self, sig: MethodSig, binding: Binding) -> Self {
        let overloads = self.methods.entry(sig.name.clone()).or_default();
        // A later registration with the same shape replaces the earlier one.
        overloads.retain(|m| {
            m.sig.params.len() != sig.params.len() || m.sig.generics.len() != sig.generics.len()
        });
        overloads.push(Method { sig, binding });
        self
    }

    pub fn build(self) -> Contract {
        Contract {
            name: self.name,
            factory: self.factory,
            methods: self.methods,
        }
    }
}
