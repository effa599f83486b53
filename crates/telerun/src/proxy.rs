//! # Remote Handles
//!
//! What a call gives back, and the proxies for remote objects and resources.
//!
//! A proxy dispatches through its `ApiDescriptor`: a method name is looked up
//! in the descriptor's table, and the resulting signature drives encoding and
//! the kind of response built for the reply.

use std::sync::Arc;

use telerpc::ApiDescriptor;
use telerpc::DISPOSE_METHOD;
use telerpc::DescriptorResolver;
use telerpc::RouteId;
use telerpc::ServiceId;

use crate::context::CallContext;
use crate::engine::Argument;
use crate::engine::Call;
use crate::engine::Engine;
use crate::engine::command::Command;
use crate::error::Error;
use crate::error::Result;
use crate::resources::ResourceState;
use crate::stream::Decoded;

/// The successful outcome of a call, shaped by the method's return kind.
#[derive(Debug)]
pub enum Response {
    Value(Decoded),
    Object(RemoteObject),
    Resource(RemoteResource),
}

impl Response {
    pub fn into_value(self) -> Result<Decoded> {
        match self {
            Self::Value(decoded) => Ok(decoded),
            other => Err(Error::Protocol(format!("expected a value, got {}", other.kind()))),
        }
    }

    pub fn into_object(self) -> Result<RemoteObject> {
        match self {
            Self::Object(object) => Ok(object),
            other => Err(Error::Protocol(format!("expected a remote object, got {}", other.kind()))),
        }
    }

    pub fn into_resource(self) -> Result<RemoteResource> {
        match self {
            Self::Resource(resource) => Ok(resource),
            other => Err(Error::Protocol(format!("expected a remote resource, got {}", other.kind()))),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Value(_) => "a value",
            Self::Object(_) => "a remote object",
            Self::Resource(_) => "a remote resource",
        }
    }
}

/// A stateless remote entity located by path.
#[derive(Clone)]
pub struct RemoteObject {
    engine: Engine,
    route: RouteId,
    service: ServiceId,
    api: Arc<ApiDescriptor>,
}

impl RemoteObject {
    pub fn new(engine: Engine, route: RouteId, service: ServiceId, api: Arc<ApiDescriptor>) -> Self {
        Self { engine, route, service, api }
    }

    pub fn route(&self) -> &RouteId {
        &self.route
    }

    pub fn service(&self) -> &ServiceId {
        &self.service
    }

    pub fn api(&self) -> &ApiDescriptor {
        &self.api
    }

    /// Calls `method` with `args` through the descriptor's dispatch table.
    pub async fn call(&self, ctx: &CallContext, method: &str, args: Vec<Argument>) -> Result<Response> {
        let Some(signature) = self.api.resolve(method) else {
            return Err(Error::Protocol(format!("{} has no method '{}'", self.api.name, method)));
        };
        let call = Call {
            route: self.route.clone(),
            service: self.service.clone(),
            signature: signature.clone(),
            args,
        };
        self.engine.call(ctx, call).await
    }
}

impl std::fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteObject")
            .field("route", &self.route)
            .field("service", &self.service)
            .field("api", &self.api.name)
            .finish()
    }
}

/// A stateful remote entity owned by the service that returned it.
///
/// Releasing it (or disposing an owner above it) consumes it and everything
/// it vended. Calls on a consumed resource fail locally.
#[derive(Clone)]
pub struct RemoteResource {
    object: RemoteObject,
    state: Arc<ResourceState>,
}

impl RemoteResource {
    pub(crate) fn new(object: RemoteObject, state: Arc<ResourceState>) -> Self {
        Self { object, state }
    }

    pub fn service(&self) -> &ServiceId {
        self.object.service()
    }

    pub fn route(&self) -> &RouteId {
        self.object.route()
    }

    pub fn is_consumed(&self) -> bool {
        self.state.is_consumed()
    }

    pub async fn call(&self, ctx: &CallContext, method: &str, args: Vec<Argument>) -> Result<Response> {
        if self.is_consumed() {
            return Err(Error::ResourceConsumed(self.service().clone()));
        }
        self.object.call(ctx, method, args).await
    }

    /// Asks the remote to dispose this resource. Everything it vended is
    /// consumed locally before the request goes out.
    pub async fn dispose(&self, ctx: &CallContext) -> Result<Response> {
        self.call(ctx, DISPOSE_METHOD, Vec::new()).await
    }

    /// Releases this resource and its descendants, notifying the remote once per resource.
    ///
    /// Releasing twice is a no-op.
    pub fn release(&self) -> Result<()> {
        if self.is_consumed() {
            return Ok(());
        }
        self.object.engine.submit(Command::Release(self.service().clone()))
    }
}

impl std::fmt::Debug for RemoteResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteResource")
            .field("object", &self.object)
            .field("consumed", &self.is_consumed())
            .finish()
    }
}
