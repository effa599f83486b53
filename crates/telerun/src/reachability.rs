//! # Reachability Facade
//!
//! A stable `call()` over whatever connection the supervisor currently has.
//!
//! ## Behaviour
//!
//! - **Await reconnect** (default): wait until the supervisor publishes a live
//!   connection other than the last one that failed a call on this route.
//! - **Fail fast**: use the live connection if there is one, otherwise fail
//!   with a disconnection straight away.
//!
//! Waiting plus the call itself is bounded by `ClientConfig::reachability_timeout`.
//! Running out of time is a `Timeout`, not a disconnection.

use std::sync::Arc;

use dashmap::DashMap;
use telerpc::RouteId;
use tokio::sync::watch;
use tracing::debug;

use crate::config::ClientConfig;
use crate::context::CallContext;
use crate::engine::Call;
use crate::error::Error;
use crate::error::Result;
use crate::proxy::Response;
use crate::supervisor::ConnectionHandle;
use crate::supervisor::ConnectionId;
use crate::supervisor::ConnectionStatus;

#[derive(Clone)]
pub struct Client {
    status: watch::Receiver<ConnectionStatus>,
    poison: watch::Receiver<Option<Error>>,
    /// Per route: the connection that last failed a call with a disconnection.
    last_failed: Arc<DashMap<RouteId, ConnectionId>>,
    config: ClientConfig,
}

impl Client {
    pub fn new(
        status: watch::Receiver<ConnectionStatus>,
        poison: watch::Receiver<Option<Error>>,
        config: ClientConfig,
    ) -> Self {
        Self { status, poison, last_failed: Arc::new(DashMap::new()), config }
    }

    pub async fn call(&self, ctx: &CallContext, call: Call) -> Result<Response> {
        let limit = self.config.reachability_timeout;
        match tokio::time::timeout(limit, self.call_untimed(ctx, call)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(limit)),
        }
    }

    async fn call_untimed(&self, ctx: &CallContext, call: Call) -> Result<Response> {
        let route = call.route.clone();
        let handle = self.connection(ctx, &route).await?;

        match handle.engine.call(ctx, call).await {
            Ok(response) => {
                self.last_failed.remove(&route);
                Ok(response)
            }
            Err(e) => {
                if matches!(e, Error::Disconnected(_)) {
                    debug!(route = %route, connection = %handle.id, "remembering failed connection");
                    self.last_failed.insert(route, handle.id);
                }
                match self.poisoned() {
                    Some(poison) if e.is_disconnection() => Err(poison),
                    _ => Err(e),
                }
            }
        }
    }

    fn poisoned(&self) -> Option<Error> {
        self.poison.borrow().clone()
    }

    /// The connection to use for a call on `route`.
    async fn connection(&self, ctx: &CallContext, route: &RouteId) -> Result<ConnectionHandle> {
        let mut status = self.status.clone();
        let mut poison = self.poison.clone();

        loop {
            if let Some(e) = poison.borrow_and_update().clone() {
                return Err(e);
            }

            let avoid = self.last_failed.get(route).map(|entry| *entry.value());
            let live = match &*status.borrow_and_update() {
                ConnectionStatus::Connected(handle) if !handle.engine.is_closed() => Some(handle.clone()),
                _ => None,
            };

            match live {
                Some(handle) if !ctx.awaits_reconnect() => return Ok(handle),
                Some(handle) if Some(handle.id) != avoid => return Ok(handle),
                None if !ctx.awaits_reconnect() => return Err(Error::disconnected("no live connection")),
                _ => {}
            }

            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        return Err(Error::poisoned(Error::disconnected("connection supervisor stopped")));
                    }
                }
                Ok(()) = poison.changed() => {}
            }
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("connected", &self.status.borrow().is_connected())
            .field("config", &self.config)
            .finish()
    }
}
