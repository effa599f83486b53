//! # Streams
//!
//! Both ends of a stream as user code sees them, plus the producer loop that
//! feeds an outbound stream onto the wire.
//!
//! ## Roles
//!
//! - **Outbound** (we produce): user code keeps a `StreamSender` and passes the
//!   matching `Source` as a call argument. Once the call is sent the engine
//!   spawns `produce`, which announces the stream, forwards one element per
//!   credit granted by the remote, and closes the stream when the sender is
//!   dropped.
//! - **Inbound** (we consume): the engine hands out a `StreamReceiver` for every
//!   stream embedded in a result. The receiver grants credit back as elements
//!   are consumed, and cancels the stream if dropped early.
//!
//! ## Invariants
//! - A producer never sends more `StreamData` than the credit it was granted.
//! - An inbound consumer never has more credit outstanding than its prefetch,
//!   which never exceeds its buffer.

use std::sync::Arc;
use std::sync::OnceLock;

use serde_json::Value;
use telerpc::Envelope;
use telerpc::FailureInfo;
use telerpc::Message;
use telerpc::RouteId;
use telerpc::Serialization;
use telerpc::StreamId;
use tokio::sync::Semaphore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::engine::command::Command;
use crate::engine::command::Outgoing;
use crate::error::Error;
use crate::error::Result;

/// Cancellation shared between a producer loop and the user's `StreamSender`.
#[derive(Debug, Default)]
pub(crate) struct StreamCancel {
    token: CancellationToken,
    cause: OnceLock<Error>,
}

impl StreamCancel {
    /// Cancels with `cause`. Only the first cause sticks.
    pub(crate) fn cancel(&self, cause: Error) {
        let _ = self.cause.set(cause);
        self.token.cancel();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn cause(&self) -> Error {
        self.cause.get().cloned().unwrap_or_else(|| Error::disconnected("stream is no longer served"))
    }
}

/// Creates an outbound stream. `capacity` bounds how far user code may run
/// ahead of the producer loop.
pub fn channel(name: impl Into<String>, capacity: usize) -> (StreamSender, Source) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let cancel = Arc::new(StreamCancel::default());
    let sender = StreamSender { tx, cancel: cancel.clone() };
    let source = Source { name: name.into(), rx, cancel };
    (sender, source)
}

/// The user's handle on an outbound stream. Dropping it ends the stream cleanly.
pub struct StreamSender {
    tx: mpsc::Sender<Value>,
    cancel: Arc<StreamCancel>,
}

impl StreamSender {
    /// Queues one element. Fails with the cancellation cause once the remote
    /// (or the engine) has stopped the stream.
    pub async fn send(&self, value: Value) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(self.cancel.cause());
        }
        tokio::select! {
            biased;
            _ = self.cancel.token.cancelled() => Err(self.cancel.cause()),
            sent = self.tx.send(value) => sent.map_err(|_| self.cancel.cause()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the stream is cancelled, yielding the cause.
    pub async fn cancelled(&self) -> Error {
        self.cancel.token.cancelled().await;
        self.cancel.cause()
    }
}

/// The engine-side end of an outbound stream, passed as a call argument.
pub struct Source {
    name: String,
    rx: mpsc::Receiver<Value>,
    cancel: Arc<StreamCancel>,
}

impl Source {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn canceller(&self) -> Arc<StreamCancel> {
        self.cancel.clone()
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source").field("name", &self.name).finish()
    }
}

/// Everything a producer loop needs to put elements on the wire.
pub(crate) struct Producer {
    pub stream_id: StreamId,
    pub destination: RouteId,
    pub origin: RouteId,
    pub credit: Arc<Semaphore>,
    pub outgoing: mpsc::UnboundedSender<Outgoing>,
    pub commands: mpsc::UnboundedSender<Command>,
    pub serialization: Arc<dyn Serialization>,
}

impl Producer {
    fn emit(&self, message: Message) -> bool {
        let envelope = Envelope::new(self.destination.clone(), self.origin.clone(), message);
        self.outgoing.send(Outgoing::message(envelope)).is_ok()
    }

    fn finish(&self, error: Option<FailureInfo>) {
        let _ = self.commands.send(Command::StreamFinished { stream_id: self.stream_id, error });
    }
}

/// Serves one outbound stream until the source ends or the stream is cancelled.
pub(crate) async fn produce(producer: Producer, mut source: Source) {
    let id = producer.stream_id;
    let cancel = source.canceller();

    if !producer.emit(Message::StreamInit { stream_id: id }) {
        return;
    }

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.token.cancelled() => return,
            next = source.rx.recv() => next,
        };
        let Some(value) = next else {
            trace!(stream_id = %id, "source exhausted");
            producer.finish(None);
            return;
        };

        let permit = tokio::select! {
            biased;
            _ = cancel.token.cancelled() => return,
            permit = producer.credit.acquire() => permit,
        };
        match permit {
            Ok(permit) => permit.forget(),
            Err(_) => return,
        }

        match producer.serialization.encode_value(&value, Vec::new()) {
            Ok(element) => {
                trace!(stream_id = %id, "sending element");
                if !producer.emit(Message::StreamData { stream_id: id, element }) {
                    return;
                }
            }
            Err(e) => {
                let error = Error::from(e);
                let info = FailureInfo::generic(error.to_string());
                cancel.cancel(error);
                producer.finish(Some(info));
                return;
            }
        }
    }
}

/// A value received from the remote, with the streams it embeds.
#[derive(Debug)]
pub struct Decoded {
    pub value: Value,
    pub streams: Vec<StreamReceiver>,
}

impl Decoded {
    /// Takes the receiver for the embedded stream `id`.
    pub fn take_stream(&mut self, id: StreamId) -> Option<StreamReceiver> {
        let index = self.streams.iter().position(|s| s.id == id)?;
        Some(self.streams.remove(index))
    }
}

/// Why an inbound stream's buffer was closed. Unset means a clean end.
pub(crate) type InboundCause = Arc<OnceLock<Error>>;

/// The user's handle on an inbound stream.
pub struct StreamReceiver {
    id: StreamId,
    name: String,
    rx: mpsc::Receiver<Decoded>,
    cause: InboundCause,
    commands: mpsc::UnboundedSender<Command>,
    prefetch: u32,
    consumed: u32,
    finished: bool,
}

impl StreamReceiver {
    pub(crate) fn new(
        id: StreamId,
        name: String,
        rx: mpsc::Receiver<Decoded>,
        cause: InboundCause,
        commands: mpsc::UnboundedSender<Command>,
        prefetch: u32,
    ) -> Self {
        Self { id, name, rx, cause, commands, prefetch, consumed: 0, finished: false }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The next element, `Ok(None)` at a clean end, or the error that closed the stream.
    pub async fn recv(&mut self) -> Result<Option<Decoded>> {
        if self.finished {
            return self.end();
        }
        match self.rx.recv().await {
            Some(item) => {
                self.consumed += 1;
                if self.consumed >= (self.prefetch / 2).max(1) {
                    let credit = std::mem::take(&mut self.consumed);
                    let _ = self.commands.send(Command::GrantCredit { stream_id: self.id, credit });
                }
                Ok(Some(item))
            }
            None => {
                self.finished = true;
                self.end()
            }
        }
    }

    /// Drains the stream into a vector of values, failing on the first error.
    pub async fn collect_values(mut self) -> Result<Vec<Value>> {
        let mut values = Vec::new();
        while let Some(item) = self.recv().await? {
            values.push(item.value);
        }
        Ok(values)
    }

    fn end(&self) -> Result<Option<Decoded>> {
        match self.cause.get() {
            Some(e) => Err(e.clone()),
            None => Ok(None),
        }
    }
}

impl Drop for StreamReceiver {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.commands.send(Command::CloseInbound(self.id));
        }
    }
}

impl std::fmt::Debug for StreamReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReceiver")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("prefetch", &self.prefetch)
            .finish()
    }
}
