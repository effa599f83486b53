//! # Connection Supervisor
//!
//! Keeps one engine alive over a reconnecting transport.
//!
//! ## Philosophy
//!
//! - **Published, not polled**: the current connection is a `watch` value.
//!   Readers see every transition and never consume it.
//! - **Backoff is pluggable**: the reconnect loop asks a `Backoff` for the next
//!   delay after each failed attempt or lost connection, and resets it once a
//!   connection is established.
//! - **Poison is final**: once poisoned, every call through a `Client` fails
//!   with a terminal disconnection, even if a connection comes back. Dropping
//!   the supervisor poisons it the same way `shutdown` does.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use telerpc::JsonSerialization;
use telerpc::Serialization;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::ClientConfig;
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::Error;
use crate::interceptor::Interceptor;
use crate::interceptor::Passthrough;
use crate::reachability::Client;
use crate::transport::StatsSnapshot;
use crate::transport::TransportFactory;
use crate::transport::TransportStats;

/// Distinguishes successive connections of one supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// A live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub engine: Engine,
}

#[derive(Debug, Clone)]
pub enum ConnectionStatus {
    Disconnected,
    Connected(ConnectionHandle),
}

impl ConnectionStatus {
    pub fn handle(&self) -> Option<&ConnectionHandle> {
        match self {
            Self::Connected(handle) => Some(handle),
            Self::Disconnected => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }
}

/// Delay strategy between reconnection attempts.
pub trait Backoff: Send + 'static {
    fn next_delay(&mut self) -> Duration;
    fn reset(&mut self);
}

/// Doubling delay, capped.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    attempt: i32,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self { initial, max, multiplier, attempt: 0 }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(5), 2.0)
    }
}

impl Backoff for ExponentialBackoff {
    fn next_delay(&mut self) -> Duration {
        let scaled = self.initial.as_secs_f64() * self.multiplier.powi(self.attempt);
        let secs = scaled.min(self.max.as_secs_f64()).max(0.0);
        self.attempt = self.attempt.saturating_add(1).min(64);
        Duration::try_from_secs_f64(secs).unwrap_or(self.max)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Same delay every time.
#[derive(Debug, Clone, Copy)]
pub struct ConstantBackoff(pub Duration);

impl Backoff for ConstantBackoff {
    fn next_delay(&mut self) -> Duration {
        self.0
    }

    fn reset(&mut self) {}
}

/// Owns the reconnect loop and publishes its state.
pub struct Supervisor {
    status: watch::Receiver<ConnectionStatus>,
    poison: watch::Sender<Option<Error>>,
    stats: Arc<TransportStats>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Starts supervising with JSON payloads and no interceptors.
    pub fn spawn(factory: Arc<dyn TransportFactory>, backoff: impl Backoff, config: EngineConfig) -> Self {
        Self::spawn_with(factory, Box::new(backoff), config, Arc::new(JsonSerialization::new()), Arc::new(Passthrough))
    }

    pub fn spawn_with(
        factory: Arc<dyn TransportFactory>,
        backoff: Box<dyn Backoff>,
        config: EngineConfig,
        serialization: Arc<dyn Serialization>,
        interceptor: Arc<dyn Interceptor>,
    ) -> Self {
        let (status_tx, status) = watch::channel(ConnectionStatus::Disconnected);
        let (poison, _) = watch::channel(None);
        let stats = TransportStats::new();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(reconnect_loop(Reconnect {
            factory,
            backoff,
            config,
            serialization,
            interceptor,
            status: status_tx,
            stats: stats.clone(),
            cancel: cancel.clone(),
        }));

        Self { status, poison, stats, cancel, task: Some(task) }
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn current(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// A reachability facade over this supervisor's connections.
    pub fn client(&self, config: ClientConfig) -> Client {
        Client::new(self.status.clone(), self.poison.subscribe(), config)
    }

    /// Makes every later call fail with a terminal disconnection wrapping `cause`.
    /// Only the first poison sticks.
    pub fn poison(&self, cause: Error) {
        self.poison.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            warn!(cause = %cause, "connection scope poisoned");
            *slot = Some(Error::poisoned(cause.clone()));
            true
        });
    }

    pub fn poisoned(&self) -> Option<Error> {
        self.poison.borrow().clone()
    }

    /// Poisons, stops reconnecting and shuts the live engine down.
    pub async fn shutdown(mut self) {
        self.poison(shut_down());
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "reconnect loop ended abnormally");
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.poison(shut_down());
        self.cancel.cancel();
    }
}

/// The poison cause when the supervisor goes away, explicitly or not.
fn shut_down() -> Error {
    Error::disconnected("supervisor shut down")
}

struct Reconnect {
    factory: Arc<dyn TransportFactory>,
    backoff: Box<dyn Backoff>,
    config: EngineConfig,
    serialization: Arc<dyn Serialization>,
    interceptor: Arc<dyn Interceptor>,
    status: watch::Sender<ConnectionStatus>,
    stats: Arc<TransportStats>,
    cancel: CancellationToken,
}

async fn reconnect_loop(mut r: Reconnect) {
    let mut next_id = 1;

    loop {
        r.stats.record_attempt();
        let connected = tokio::select! {
            biased;
            _ = r.cancel.cancelled() => break,
            connected = r.factory.connect(r.stats.clone()) => connected,
        };

        match connected {
            Ok(transport) => {
                r.backoff.reset();
                r.stats.record_connected();
                let id = ConnectionId(next_id);
                next_id += 1;

                let (engine, mut handle) = Engine::start_with(
                    transport,
                    r.config.clone(),
                    r.serialization.clone(),
                    r.interceptor.clone(),
                );
                info!(connection = %id, "connected");
                r.status.send_replace(ConnectionStatus::Connected(ConnectionHandle { id, engine: engine.clone() }));

                let cause = tokio::select! {
                    biased;
                    _ = r.cancel.cancelled() => {
                        engine.shutdown();
                        let _ = (&mut handle).await;
                        r.status.send_replace(ConnectionStatus::Disconnected);
                        break;
                    }
                    joined = &mut handle => joined.unwrap_or_else(|e| Error::Protocol(format!("engine task failed: {}", e))),
                };

                r.stats.record_disconnected();
                r.status.send_replace(ConnectionStatus::Disconnected);
                info!(connection = %id, cause = %cause, "connection lost");
            }
            Err(e) => warn!(error = %e, "connection attempt failed"),
        }

        let delay = r.backoff.next_delay();
        debug!(delay = ?delay, "reconnecting after delay");
        tokio::select! {
            biased;
            _ = r.cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    r.status.send_replace(ConnectionStatus::Disconnected);
    debug!("reconnect loop stopped");
}
