//! # Interceptor Chain
//!
//! Hooks around the wire: `before_send` may rewrite a request before it is
//! registered and sent, `on_result` observes what came back.
//!
//! ## Composition
//!
//! `combine(a, b)` runs `b`'s rewrite first and `a`'s last on the way out, and
//! notifies `a` before `b` on the way in. The order is part of the contract.

use std::sync::Arc;

use telerpc::CausalityToken;
use telerpc::FailureInfo;
use telerpc::Payload;
use telerpc::RequestId;
use telerpc::RouteId;
use telerpc::ServiceId;

/// A request after serialization, before it reaches the wire.
#[derive(Debug, Clone)]
pub struct UnsentRequest {
    pub request_id: RequestId,
    pub route: RouteId,
    pub service: ServiceId,
    pub method: String,
    pub payload: Payload,
    pub causality: Option<CausalityToken>,
}

/// Identifies the request an inbound outcome belongs to.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub request_id: RequestId,
    pub route: RouteId,
    pub service: ServiceId,
    pub method: String,
}

impl From<&UnsentRequest> for RequestInfo {
    fn from(req: &UnsentRequest) -> Self {
        Self {
            request_id: req.request_id,
            route: req.route.clone(),
            service: req.service.clone(),
            method: req.method.clone(),
        }
    }
}

/// What the remote answered.
#[derive(Debug, Clone, Copy)]
pub enum Outcome<'a> {
    Success(&'a Payload),
    Failure(&'a FailureInfo),
}

pub trait Interceptor: Send + Sync + 'static {
    fn before_send(&self, request: UnsentRequest) -> UnsentRequest {
        request
    }

    fn on_result(&self, _request: &RequestInfo, _outcome: Outcome<'_>) {}
}

/// Leaves everything alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl Interceptor for Passthrough {}

struct Combined {
    outer: Arc<dyn Interceptor>,
    inner: Arc<dyn Interceptor>,
}

impl Interceptor for Combined {
    fn before_send(&self, request: UnsentRequest) -> UnsentRequest {
        self.outer.before_send(self.inner.before_send(request))
    }

    fn on_result(&self, request: &RequestInfo, outcome: Outcome<'_>) {
        self.outer.on_result(request, outcome);
        self.inner.on_result(request, outcome);
    }
}

/// Chains `a` and `b`. Outbound: `b` then `a`. Inbound: `a` then `b`.
pub fn combine(a: Arc<dyn Interceptor>, b: Arc<dyn Interceptor>) -> Arc<dyn Interceptor> {
    Arc::new(Combined { outer: a, inner: b })
}
