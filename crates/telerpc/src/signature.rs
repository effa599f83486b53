//! # Method Signatures and API Descriptors
//!
//! The descriptor is the source of truth for what a remote API looks like on
//! the wire. It maps a method name to the parameter kinds it accepts and the
//! kind of thing it returns.
//!
//! ## Philosophy
//!
//! - **Built once**: a descriptor is assembled up front and shared behind an
//!   `Arc`. Proxies dispatch through its table; nothing is reflected at call time.
//! - **Handles carry their API**: a method returning a remote object or resource
//!   names the descriptor of the thing it returns, so the proxy built for the
//!   result can dispatch calls of its own.

use std::collections::HashMap;
use std::sync::Arc;

/// The synthetic method that asks a service to dispose itself.
///
/// Calling it tears down every resource the service handed out.
pub const DISPOSE_METHOD: &str = "$dispose";

/// What one parameter position holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    /// A plain serializable value.
    Value,
    /// A stream of values the caller produces.
    Stream,
}

/// What a method gives back.
#[derive(Debug, Clone)]
pub enum ReturnKind {
    /// A plain value, possibly embedding streams the remote produces.
    Value,
    /// A stateless remote entity located by path.
    RemoteObject(Arc<ApiDescriptor>),
    /// A stateful remote entity with explicit disposal, owned by the service that returned it.
    RemoteResource(Arc<ApiDescriptor>),
}

impl ReturnKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Value => "value",
            Self::RemoteObject(_) => "remote-object",
            Self::RemoteResource(_) => "remote-resource",
        }
    }
}

/// The wire signature of a single method.
#[derive(Debug, Clone)]
pub struct MethodSignature {
    pub name: String,
    pub params: Vec<ParamKind>,
    pub returns: ReturnKind,
}

impl MethodSignature {
    pub fn new(name: impl Into<String>, params: Vec<ParamKind>, returns: ReturnKind) -> Self {
        Self { name: name.into(), params, returns }
    }

    /// A method taking only plain values and returning a plain value.
    pub fn values(name: impl Into<String>, arity: usize) -> Self {
        Self::new(name, vec![ParamKind::Value; arity], ReturnKind::Value)
    }

    /// The synthetic disposal method.
    pub fn dispose() -> Self {
        Self::new(DISPOSE_METHOD, Vec::new(), ReturnKind::Value)
    }

    pub fn is_dispose(&self) -> bool {
        self.name == DISPOSE_METHOD
    }
}

/// Resolves a method name to its wire signature.
pub trait DescriptorResolver: Send + Sync {
    fn resolve(&self, method: &str) -> Option<&MethodSignature>;
}

/// A remote API: its name and a dispatch table keyed by method name.
#[derive(Debug, Clone)]
pub struct ApiDescriptor {
    pub name: String,
    methods: HashMap<String, MethodSignature>,
}

impl ApiDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        let mut methods = HashMap::new();
        let dispose = MethodSignature::dispose();
        methods.insert(dispose.name.clone(), dispose);
        Self { name: name.into(), methods }
    }

    /// Adds a method. A later method with the same name replaces the earlier one.
    pub fn method(mut self, signature: MethodSignature) -> Self {
        self.methods.insert(signature.name.clone(), signature);
        self
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodSignature> {
        self.methods.values()
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

impl DescriptorResolver for ApiDescriptor {
    fn resolve(&self, method: &str) -> Option<&MethodSignature> {
        self.methods.get(method)
    }
}
