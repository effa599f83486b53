//! # Engine
//!
//! The protocol state machine for one connection.
//!
//! ## Philosophy
//!
//! - **One owner**: every table (outstanding requests, streams, resources, gray
//!   list) lives inside a single task. Nothing else touches them; other tasks
//!   talk to it through the command queue. There are no locks on the tables.
//! - **Two queues**: commands (mutations, run in submission order) and outgoing
//!   messages (wire writes, done in order by a dedicated sender task). Both are
//!   unbounded, so submitting never waits.
//! - **One cause**: when the engine stops, the cause that stopped it is handed
//!   to every pending caller, stream and gray-list waiter, then returned to
//!   whoever owns the engine's `JoinHandle`.
//!
//! ## Call lifecycle
//!
//! `call` serializes the arguments, runs the interceptor, and registers the
//! request. Registration and enqueueing the `CallRequest` happen in one step on
//! the engine task, so a request registered after a `RouteClosed` always sees
//! the route as gray. The caller then waits for the reply, bounded by the call
//! timeout. Dropping the `call` future cancels the request: a guard submits a
//! best-effort `CancelCall`.

pub(crate) mod command;
mod dispatch;

use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde_json::Value;
use telerpc::ArgSlot;
use telerpc::JsonSerialization;
use telerpc::MethodSignature;
use telerpc::RequestId;
use telerpc::RouteId;
use telerpc::Serialization;
use telerpc::ServiceId;
use telerpc::StreamId;
use telerpc::StreamRef;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::info_span;
use tracing::trace;
use tracing::warn;

use crate::config::EngineConfig;
use crate::context::CallContext;
use crate::error::Error;
use crate::error::Result;
use crate::interceptor::Interceptor;
use crate::interceptor::Passthrough;
use crate::interceptor::UnsentRequest;
use crate::proxy::Response;
use crate::stream::Source;
use crate::transport::Transport;

use command::Command;
use command::NewCall;
use command::Outgoing;
use command::Registration;
use dispatch::State;

/// One remote method invocation.
pub struct Call {
    pub route: RouteId,
    pub service: ServiceId,
    pub signature: MethodSignature,
    pub args: Vec<Argument>,
}

/// One argument of a `Call`.
pub enum Argument {
    Value(Value),
    /// An outbound stream. The engine serves it once the request is sent.
    Stream(Source),
}

impl Call {
    pub fn new(route: impl Into<RouteId>, service: impl Into<ServiceId>, signature: MethodSignature) -> Self {
        Self { route: route.into(), service: service.into(), signature, args: Vec::new() }
    }

    pub fn arg(mut self, value: Value) -> Self {
        self.args.push(Argument::Value(value));
        self
    }

    pub fn stream(mut self, source: Source) -> Self {
        self.args.push(Argument::Stream(source));
        self
    }
}

/// A view of the engine's tables, for diagnostics and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineSnapshot {
    pub outstanding: Vec<RequestId>,
    pub streams: Vec<StreamId>,
    pub resources: usize,
    pub gray_routes: Vec<RouteId>,
}

struct Inner {
    commands: mpsc::UnboundedSender<Command>,
    next_request: AtomicU64,
    config: EngineConfig,
    serialization: Arc<dyn Serialization>,
    interceptor: Arc<dyn Interceptor>,
    shutdown: CancellationToken,
    cause: Arc<OnceLock<Error>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Handle to a running engine. Cheap to clone.
///
/// The engine stops when `shutdown` is called, when its transport fails, or
/// when the last handle (including proxies built from its results) is dropped.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Starts an engine with JSON payloads and no interceptors.
    pub fn start(transport: Arc<dyn Transport>, config: EngineConfig) -> (Self, JoinHandle<Error>) {
        Self::start_with(transport, config, Arc::new(JsonSerialization::new()), Arc::new(Passthrough))
    }

    /// Starts an engine over `transport`. The handle resolves to the cause the engine stopped with.
    pub fn start_with(
        transport: Arc<dyn Transport>,
        config: EngineConfig,
        serialization: Arc<dyn Serialization>,
        interceptor: Arc<dyn Interceptor>,
    ) -> (Self, JoinHandle<Error>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let cause = Arc::new(OnceLock::new());

        let inner = Arc::new(Inner {
            commands: commands_tx.clone(),
            next_request: AtomicU64::new(1),
            config: config.clone(),
            serialization: serialization.clone(),
            interceptor: interceptor.clone(),
            shutdown: shutdown.clone(),
            cause: cause.clone(),
        });

        let state = State::new(Arc::downgrade(&inner), config.clone(), serialization, interceptor, commands_tx, outgoing_tx);
        let span = info_span!("engine", route = %config.local_route);
        let task = run(state, transport, commands_rx, outgoing_rx, shutdown, cause).instrument(span);

        (Self { inner }, tokio::spawn(task))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Stops the engine. Pending calls fail with a disconnection.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// The cause the engine stopped with, once it has stopped.
    pub fn closed_cause(&self) -> Option<Error> {
        self.inner.cause.get().cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cause.get().is_some()
    }

    /// Asks the engine for a copy of its table sizes.
    pub async fn snapshot(&self) -> Result<EngineSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.submit(Command::Inspect(tx))?;
        rx.await.map_err(|_| self.stopped())
    }

    /// Performs `call`, bounded by the configured call timeout.
    pub async fn call(&self, ctx: &CallContext, call: Call) -> Result<Response> {
        let limit = self.inner.config.call_timeout;
        match tokio::time::timeout(limit, self.call_untimed(ctx, call)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(limit)),
        }
    }

    async fn call_untimed(&self, ctx: &CallContext, call: Call) -> Result<Response> {
        if let Some(cause) = self.closed_cause() {
            return Err(cause);
        }

        let request_id = RequestId(self.inner.next_request.fetch_add(1, Ordering::Relaxed));
        let Call { route, service, signature, args } = call;

        // Outbound streams get their ids before encoding so the payload can reference them.
        let mut refs = Vec::new();
        let mut slots = Vec::with_capacity(args.len());
        for arg in &args {
            match arg {
                Argument::Value(value) => slots.push(ArgSlot::Value(value)),
                Argument::Stream(source) => {
                    let stream = StreamRef::new(StreamId(rand::random()), source.name());
                    refs.push(stream.clone());
                    slots.push(ArgSlot::Stream(stream));
                }
            }
        }
        let payload = self.inner.serialization.encode_args(&signature, &slots)?;
        drop(slots);

        let mut sources: Vec<(StreamRef, Source)> = refs
            .into_iter()
            .zip(args.into_iter().filter_map(|arg| match arg {
                Argument::Stream(source) => Some(source),
                Argument::Value(_) => None,
            }))
            .collect();

        let request = self.inner.interceptor.before_send(UnsentRequest {
            request_id,
            route,
            service,
            method: signature.name.clone(),
            payload,
            causality: ctx.causality.clone(),
        });

        let config = &self.inner.config;
        let prefetch = config.effective_prefetch(ctx.prefetch.unwrap_or(config.default_prefetch));
        let mut guard = CancelGuard { request_id, commands: self.inner.commands.clone(), armed: true };

        loop {
            let (reply_tx, reply_rx) = oneshot::channel();
            let (ack_tx, ack_rx) = oneshot::channel();
            self.submit(Command::Register(Box::new(NewCall {
                request: request.clone(),
                returns: signature.returns.clone(),
                dispose: signature.is_dispose(),
                prefetch,
                sources,
                reply: reply_tx,
                ack: ack_tx,
            })))?;

            match ack_rx.await.map_err(|_| self.stopped())? {
                Registration::Registered => {
                    let reply = reply_rx.await.map_err(|_| self.stopped());
                    guard.armed = false;
                    let response = reply??;
                    let _ = self.inner.commands.send(Command::Resumed(request_id));
                    return Ok(response);
                }
                Registration::Gray { waiter, sources: returned } => {
                    if !ctx.awaits_reconnect() {
                        guard.armed = false;
                        return Err(Error::RouteClosed(request.route.clone()));
                    }
                    debug!(request_id = %request_id, route = %request.route, "waiting for route to reopen");
                    waiter.await?;
                    sources = returned;
                }
            }
        }
    }

    pub(crate) fn submit(&self, command: Command) -> Result<()> {
        self.inner.commands.send(command).map_err(|_| self.stopped())
    }

    fn stopped(&self) -> Error {
        self.closed_cause().unwrap_or_else(|| Error::disconnected("engine stopped"))
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("local_route", &self.inner.config.local_route)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Submits a cancel for its request if the caller stops waiting early.
struct CancelGuard {
    request_id: RequestId,
    commands: mpsc::UnboundedSender<Command>,
    armed: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.commands.send(Command::Cancel(self.request_id));
        }
    }
}

type SenderExit = (Option<Error>, mpsc::UnboundedReceiver<Outgoing>);

async fn run(
    mut state: State,
    transport: Arc<dyn Transport>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    outgoing: mpsc::UnboundedReceiver<Outgoing>,
    shutdown: CancellationToken,
    cause_slot: Arc<OnceLock<Error>>,
) -> Error {
    info!("engine started");
    let stop = CancellationToken::new();
    let mut sender = tokio::spawn(
        send_loop(transport.clone(), outgoing, state.commands(), stop.clone()).in_current_span(),
    );
    let mut sender_exit: Option<Option<SenderExit>> = None;

    // Unbiased so sustained inbound traffic cannot starve queued commands.
    let cause = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break Error::disconnected("engine shut down"),
            joined = &mut sender => {
                let exit = joined.ok();
                let cause = match &exit {
                    Some((Some(e), _)) => e.clone(),
                    _ => Error::disconnected("sender stopped"),
                };
                sender_exit = Some(exit);
                break cause;
            }
            inbound = transport.recv() => match inbound {
                Ok(Some(inbound)) => {
                    if let Err(e) = state.handle_inbound(inbound) {
                        if let Some(fatal) = state.failed(e) {
                            break fatal;
                        }
                    }
                }
                Ok(None) => break Error::disconnected("transport closed by peer"),
                Err(e) => break Error::disconnected_by("transport failed", e.into()),
            },
            command = commands.recv() => match command {
                Some(command) => {
                    if let Err(e) = state.handle_command(command) {
                        if let Some(fatal) = state.failed(e) {
                            break fatal;
                        }
                    }
                }
                None => break Error::disconnected("engine dropped"),
            },
        }
    };

    stop.cancel();
    let outgoing = match sender_exit {
        Some(exit) => exit.map(|(_, rx)| rx),
        None => sender.await.ok().map(|(_, rx)| rx),
    };

    transport.close().await;
    let _ = cause_slot.set(cause.clone());
    state.teardown(&cause);

    commands.close();
    while let Ok(command) = commands.try_recv() {
        state.reject(command, &cause);
    }
    if let Some(mut outgoing) = outgoing {
        outgoing.close();
        let mut dropped = 0;
        while outgoing.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "discarded unsent messages");
        }
    }

    info!(cause = %cause, "engine stopped");
    cause
}

async fn send_loop(
    transport: Arc<dyn Transport>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    commands: mpsc::UnboundedSender<Command>,
    stop: CancellationToken,
) -> SenderExit {
    let error = loop {
        let next = tokio::select! {
            biased;
            _ = stop.cancelled() => break None,
            next = outgoing.recv() => next,
        };
        let Some(Outgoing { envelope, request }) = next else {
            break None;
        };

        trace!(message = envelope.message.name(), destination = %envelope.destination, "sending");
        let result = transport.send(envelope).await.map_err(Error::from);

        if let Some(request_id) = request {
            let _ = commands.send(Command::Sent { request_id, result: result.clone() });
        }
        if let Err(e) = result {
            error!(error = %e, "send failed");
            break Some(e);
        }
    };
    if error.is_none() {
        trace!("sender stopped");
    } else {
        warn!("sender exiting after a failed write");
    }
    (error, outgoing)
}
