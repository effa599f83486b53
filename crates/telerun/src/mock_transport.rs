//! In-memory transports for tests and demos.
//!
//! `pair()` returns the engine-facing `ChannelTransport` and a `RemoteEnd`
//! that a test drives by hand: it sees every envelope the engine writes and
//! injects replies, route transitions and connection failures.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use telerpc::Envelope;
use telerpc::Message;
use telerpc::RouteId;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

use crate::transport;
use crate::transport::Inbound;
use crate::transport::Transport;
use crate::transport::TransportFactory;
use crate::transport::TransportStats;

/// The engine-facing half of an in-memory link.
pub struct ChannelTransport {
    tx: StdMutex<Option<mpsc::UnboundedSender<Envelope>>>,
    rx: Mutex<mpsc::UnboundedReceiver<transport::Result<Inbound>>>,
    stats: Arc<TransportStats>,
}

/// The scripted remote half of an in-memory link.
pub struct RemoteEnd {
    tx: Option<mpsc::UnboundedSender<transport::Result<Inbound>>>,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

/// Creates a connected transport and remote end.
pub fn pair() -> (ChannelTransport, RemoteEnd) {
    pair_with_stats(TransportStats::new())
}

pub fn pair_with_stats(stats: Arc<TransportStats>) -> (ChannelTransport, RemoteEnd) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();

    let transport = ChannelTransport {
        tx: StdMutex::new(Some(out_tx)),
        rx: Mutex::new(in_rx),
        stats,
    };
    let remote = RemoteEnd { tx: Some(in_tx), rx: out_rx };
    (transport, remote)
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, envelope: Envelope) -> transport::Result<()> {
        let tx = match self.tx.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        let Some(tx) = tx else {
            return Err(transport::Error::Closed);
        };
        tx.send(envelope)
            .map_err(|_| transport::Error::ConnectionLost("Channel closed".into()))?;
        self.stats.record_sent();
        Ok(())
    }

    async fn recv(&self) -> transport::Result<Option<Inbound>> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(Ok(inbound)) => {
                if matches!(inbound, Inbound::Message(_)) {
                    self.stats.record_received();
                }
                Ok(Some(inbound))
            }
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn close(&self) {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
    }
}

impl RemoteEnd {
    /// The next envelope written by the engine, or `None` once the transport is closed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// An envelope that is already queued, without waiting.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    pub fn send(&self, inbound: Inbound) -> bool {
        match &self.tx {
            Some(tx) => tx.send(Ok(inbound)).is_ok(),
            None => false,
        }
    }

    /// Sends `message` back along the path `request` came from.
    pub fn reply(&self, request: &Envelope, message: Message) -> bool {
        let envelope = Envelope::new(request.origin.clone(), request.destination.clone(), message);
        self.send(Inbound::Message(envelope))
    }

    pub fn open_route(&self, route: impl Into<RouteId>) -> bool {
        self.send(Inbound::RouteOpened(route.into()))
    }

    pub fn close_route(&self, route: impl Into<RouteId>) -> bool {
        self.send(Inbound::RouteClosed(route.into()))
    }

    /// Reports a broken connection to the engine.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(transport::Error::ConnectionLost(reason.into())));
        }
    }

    /// Ends the inbound side cleanly; the engine sees `Ok(None)`.
    pub fn hang_up(&mut self) {
        self.tx.take();
    }
}

/// Factory handing out in-memory links, publishing each new `RemoteEnd`.
///
/// The first `failures` connection attempts are refused.
pub struct ChannelFactory {
    remotes: mpsc::UnboundedSender<RemoteEnd>,
    failures: AtomicU32,
}

impl ChannelFactory {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RemoteEnd>) {
        Self::failing_first(0)
    }

    pub fn failing_first(failures: u32) -> (Self, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let factory = Self { remotes: tx, failures: AtomicU32::new(failures) };
        (factory, rx)
    }
}

#[async_trait::async_trait]
impl TransportFactory for ChannelFactory {
    async fn connect(&self, stats: Arc<TransportStats>) -> transport::Result<Arc<dyn Transport>> {
        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(transport::Error::Io("connection refused".into()));
        }

        let (transport, remote) = pair_with_stats(stats);
        self.remotes
            .send(remote)
            .map_err(|_| transport::Error::Io("nobody is listening for remotes".into()))?;
        Ok(Arc::new(transport))
    }
}
