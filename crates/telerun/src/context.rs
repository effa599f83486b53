//! # Call Context
//!
//! Per-call strategy overrides, passed down the call chain explicitly instead
//! of living in ambient state.
//!
//! A `CallContext` is cheap to clone. The helpers at the bottom scope an
//! override to a body: the body receives the adjusted context and whatever it
//! calls with it inherits the override.

use std::future::Future;

use telerpc::CausalityToken;

/// What a call does when no connection or route is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectStrategy {
    /// Suspend until a connection (or the route) is usable again.
    #[default]
    AwaitReconnect,
    /// Fail immediately with a disconnection or route-closed error.
    FailFast,
}

/// How many stream elements a consumer grants ahead of consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchStrategy {
    pub prefetch: u32,
}

impl PrefetchStrategy {
    pub const DEFAULT: Self = Self { prefetch: 16 };

    /// Grant one element at a time, as the consumer asks for it.
    pub const ON_DEMAND: Self = Self { prefetch: 1 };

    pub fn new(prefetch: u32) -> Self {
        Self { prefetch: prefetch.max(1) }
    }
}

impl Default for PrefetchStrategy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub reconnect: ReconnectStrategy,
    /// `None` defers to the engine's configured default.
    pub prefetch: Option<PrefetchStrategy>,
    pub causality: Option<CausalityToken>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_awaiting_for_reconnect(&self) -> Self {
        Self { reconnect: ReconnectStrategy::FailFast, ..self.clone() }
    }

    pub fn with_prefetch_strategy(&self, strategy: PrefetchStrategy) -> Self {
        Self { prefetch: Some(strategy), ..self.clone() }
    }

    pub fn with_causality(&self, token: CausalityToken) -> Self {
        Self { causality: Some(token), ..self.clone() }
    }

    pub fn awaits_reconnect(&self) -> bool {
        self.reconnect == ReconnectStrategy::AwaitReconnect
    }
}

/// Runs `body` with calls failing fast instead of waiting for reconnection.
pub async fn without_awaiting_for_reconnect<F, Fut, T>(ctx: &CallContext, body: F) -> T
where
    F: FnOnce(CallContext) -> Fut,
    Fut: Future<Output = T>,
{
    body(ctx.without_awaiting_for_reconnect()).await
}

/// Runs `body` with `strategy` governing stream credit.
pub async fn with_prefetch_strategy<F, Fut, T>(ctx: &CallContext, strategy: PrefetchStrategy, body: F) -> T
where
    F: FnOnce(CallContext) -> Fut,
    Fut: Future<Output = T>,
{
    body(ctx.with_prefetch_strategy(strategy)).await
}
