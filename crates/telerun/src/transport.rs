//! # Transport Abstraction
//!
//! An async, message-oriented interface between the engine and whatever moves
//! envelopes across the network.
//!
//! ## Philosophy
//!
//! - **Framing is not our problem**: the transport hands over whole `Envelope`s.
//!   How they are framed on the wire belongs to the implementation.
//! - **Routes are observed, not managed**: besides messages, the inbound side
//!   reports when a route becomes unreachable and when it comes back.
//! - **Closable**: `close` shuts the outbound side; a subsequent `recv` returns
//!   `Ok(None)` once the inbound side drains.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde::Deserialize;
use serde::Serialize;
use telerpc::Envelope;
use telerpc::RouteId;

/// Errors that occur at the network/transport layer.
#[derive(Debug, Clone)]
pub enum Error {
    /// The peer is unreachable or the connection was dropped.
    ConnectionLost(String),
    /// The transport was closed locally.
    Closed,
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Closed => write!(f, "Transport closed"),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Something the transport delivers to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(Envelope),
    /// The route is reachable again.
    RouteOpened(RouteId),
    /// The route became unreachable at the routing layer.
    RouteClosed(RouteId),
}

/// A bidirectional channel of envelopes.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Writes one envelope. Must not reorder envelopes sent from one task.
    async fn send(&self, envelope: Envelope) -> Result<()>;

    /// Waits for the next inbound item. `Ok(None)` means the peer closed cleanly.
    async fn recv(&self) -> Result<Option<Inbound>>;

    /// Closes the outbound side. Idempotent.
    async fn close(&self);
}

/// Establishes transports for the connection supervisor.
#[async_trait::async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    /// Connects once. The supervisor retries failures with its backoff strategy.
    ///
    /// Implementations count their traffic into `stats`.
    async fn connect(&self, stats: Arc<TransportStats>) -> Result<Arc<dyn Transport>>;
}

/// Counters accumulated across every transport a supervisor establishes.
#[derive(Debug, Default)]
pub struct TransportStats {
    sent: AtomicU64,
    received: AtomicU64,
    connection_attempts: AtomicU64,
    connections: AtomicU64,
    disconnections: AtomicU64,
}

/// Point-in-time copy of `TransportStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub sent: u64,
    pub received: u64,
    pub connection_attempts: u64,
    pub connections: u64,
    pub disconnections: u64,
}

impl TransportStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connected(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disconnected(&self) {
        self.disconnections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            disconnections: self.disconnections.load(Ordering::Relaxed),
        }
    }
}
