//! # Gray List
//!
//! Routes known to be unreachable, each paired with a future that resolves
//! when the route is reported open again.
//!
//! ## Invariants
//! - A route is either absent (reachable) or present with one pending future.
//! - Every future handed out resolves exactly once: `Ok` on reopen, `Err` when
//!   the engine tears down.

use std::collections::HashMap;

use futures::FutureExt;
use futures::future::BoxFuture;
use futures::future::Shared;
use telerpc::RouteId;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::Error;
use crate::error::Result;

/// Resolves when the route reopens.
pub type RouteWaiter = Shared<BoxFuture<'static, Result<()>>>;

struct Entry {
    tx: oneshot::Sender<Result<()>>,
    waiter: RouteWaiter,
}

#[derive(Default)]
pub struct GrayList {
    routes: HashMap<RouteId, Entry>,
}

impl GrayList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `route` unreachable. A route that is already gray keeps its future.
    pub fn close(&mut self, route: &RouteId) {
        if self.routes.contains_key(route) {
            return;
        }
        let (tx, rx) = oneshot::channel::<Result<()>>();
        let closed = route.clone();
        let waiter = async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(Error::RouteClosed(closed)),
            }
        }
        .boxed()
        .shared();

        debug!(route = %route, "route gray-listed");
        self.routes.insert(route.clone(), Entry { tx, waiter });
    }

    /// Marks `route` reachable, releasing everyone waiting on it.
    pub fn open(&mut self, route: &RouteId) -> bool {
        match self.routes.remove(route) {
            Some(entry) => {
                debug!(route = %route, "route reopened");
                let _ = entry.tx.send(Ok(()));
                true
            }
            None => false,
        }
    }

    /// The reopen future for `route`, or `None` if it is reachable.
    pub fn waiter(&self, route: &RouteId) -> Option<RouteWaiter> {
        self.routes.get(route).map(|e| e.waiter.clone())
    }

    pub fn routes(&self) -> impl Iterator<Item = &RouteId> {
        self.routes.keys()
    }

    pub fn contains(&self, route: &RouteId) -> bool {
        self.routes.contains_key(route)
    }

    /// Fails every pending future with `cause` and forgets all routes.
    pub fn fail_all(&mut self, cause: &Error) {
        for (_, entry) in self.routes.drain() {
            let _ = entry.tx.send(Err(cause.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
