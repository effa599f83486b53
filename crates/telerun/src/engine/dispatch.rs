//! Engine state and everything that mutates it.
//!
//! Runs only on the engine task. Handlers never block: anything that has to
//! wait is either a spawned producer loop or a caller on the other end of a
//! oneshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::Weak;

use telerpc::Envelope;
use telerpc::FailureInfo;
use telerpc::Message;
use telerpc::Payload;
use telerpc::RequestId;
use telerpc::ReturnKind;
use telerpc::RouteId;
use telerpc::Serialization;
use telerpc::ServiceId;
use telerpc::StreamId;
use telerpc::StreamRef;
use tokio::sync::Semaphore;
use tokio::sync::mpsc;
use tracing::Instrument;
use tracing::debug;
use tracing::error;
use tracing::trace;
use tracing::warn;

use crate::config::EngineConfig;
use crate::error::Error;
use crate::error::Result;
use crate::graylist::GrayList;
use crate::interceptor::Interceptor;
use crate::interceptor::Outcome;
use crate::interceptor::RequestInfo;
use crate::proxy::RemoteObject;
use crate::proxy::RemoteResource;
use crate::proxy::Response;
use crate::resources::ResourceGraph;
use crate::stream;
use crate::stream::Decoded;
use crate::stream::InboundCause;
use crate::stream::Source;
use crate::stream::StreamCancel;
use crate::stream::StreamReceiver;
use crate::transport::Inbound;

use super::Engine;
use super::EngineSnapshot;
use super::Inner;
use super::command::Command;
use super::command::NewCall;
use super::command::Outgoing;
use super::command::Registration;

/// A request awaiting its `CallResult` or `CallFailure`.
struct Pending {
    info: RequestInfo,
    returns: ReturnKind,
    prefetch: u32,
    reply: tokio::sync::oneshot::Sender<Result<Response>>,
}

/// A result handed to its caller whose streams are not served yet.
#[derive(Default)]
struct Completed {
    streams: Vec<StreamId>,
    resource: Option<ServiceId>,
}

impl Completed {
    fn is_empty(&self) -> bool {
        self.streams.is_empty() && self.resource.is_none()
    }
}

enum Role {
    /// We consume; the remote produces.
    FromRemote {
        buffer: mpsc::Sender<Decoded>,
        cause: InboundCause,
        prefetch: u32,
    },
    /// We produce; the remote consumes.
    ToRemote {
        cancel: Arc<StreamCancel>,
        credit: Arc<Semaphore>,
    },
}

struct StreamEntry {
    route: RouteId,
    name: String,
    role: Role,
}

pub(super) struct State {
    engine: Weak<Inner>,
    config: EngineConfig,
    serialization: Arc<dyn Serialization>,
    interceptor: Arc<dyn Interceptor>,
    commands: mpsc::UnboundedSender<Command>,
    outgoing: mpsc::UnboundedSender<Outgoing>,

    outstanding: HashMap<RequestId, Pending>,
    completed: HashMap<RequestId, Completed>,
    unserved: HashMap<RequestId, Vec<(StreamId, Source)>>,
    streams: HashMap<StreamId, StreamEntry>,
    resources: ResourceGraph,
    gray: GrayList,
}

impl State {
    pub(super) fn new(
        engine: Weak<Inner>,
        config: EngineConfig,
        serialization: Arc<dyn Serialization>,
        interceptor: Arc<dyn Interceptor>,
        commands: mpsc::UnboundedSender<Command>,
        outgoing: mpsc::UnboundedSender<Outgoing>,
    ) -> Self {
        Self {
            engine,
            config,
            serialization,
            interceptor,
            commands,
            outgoing,
            outstanding: HashMap::new(),
            completed: HashMap::new(),
            unserved: HashMap::new(),
            streams: HashMap::new(),
            resources: ResourceGraph::new(),
            gray: GrayList::new(),
        }
    }

    pub(super) fn commands(&self) -> mpsc::UnboundedSender<Command> {
        self.commands.clone()
    }

    /// Logs a processing failure. Returns it back if it should stop the engine.
    pub(super) fn failed(&self, e: Error) -> Option<Error> {
        error!(error = %e, strict = self.config.strict, "engine processing failed");
        self.config.strict.then_some(e)
    }

    fn send(&self, destination: &RouteId, message: Message) -> Result<()> {
        trace!(message = message.name(), destination = %destination, "enqueue");
        let envelope = Envelope::new(destination.clone(), self.config.local_route.clone(), message);
        self.outgoing
            .send(Outgoing::message(envelope))
            .map_err(|_| Error::Protocol("outgoing queue is closed".into()))
    }

    // ------------------------------------------------------------------------
    //  Inbound
    // ------------------------------------------------------------------------

    pub(super) fn handle_inbound(&mut self, inbound: Inbound) -> Result<()> {
        match inbound {
            Inbound::Message(envelope) => self.dispatch(envelope),
            Inbound::RouteClosed(route) => {
                self.route_closed(&route);
                Ok(())
            }
            Inbound::RouteOpened(route) => {
                if !self.gray.open(&route) {
                    trace!(route = %route, "route opened while not gray-listed");
                }
                Ok(())
            }
        }
    }

    fn dispatch(&mut self, envelope: Envelope) -> Result<()> {
        let Envelope { origin, message, .. } = envelope;
        trace!(message = message.name(), origin = %origin, "received");

        match message {
            Message::CallResult { request_id, result } => self.call_result(request_id, result),
            Message::CallFailure { request_id, error } => {
                self.call_failure(request_id, error);
                Ok(())
            }
            Message::StreamInit { stream_id } => {
                if !self.streams.contains_key(&stream_id) {
                    debug!(stream_id = %stream_id, "init for unknown stream, closing it");
                    let error = FailureInfo::cancelled("no consumer for this stream");
                    self.send(&origin, Message::StreamClosed { stream_id, error: Some(error) })?;
                }
                Ok(())
            }
            Message::StreamData { stream_id, element } => self.stream_data(stream_id, element),
            Message::StreamNext { stream_id, credit } => {
                match self.streams.get(&stream_id).map(|s| &s.role) {
                    Some(Role::ToRemote { credit: budget, .. }) => budget.add_permits(credit as usize),
                    Some(Role::FromRemote { .. }) => {
                        warn!(stream_id = %stream_id, "credit granted to a consumer-side stream, ignoring");
                    }
                    None => trace!(stream_id = %stream_id, "credit for unknown stream"),
                }
                Ok(())
            }
            Message::StreamClosed { stream_id, error } => {
                self.remote_closed(stream_id, error);
                Ok(())
            }
            Message::ResourceConsumed { service } => {
                let mut removed = self.resources.remove_subtree(&service);
                if removed.is_empty() {
                    removed = self.resources.remove_children(&service);
                }
                debug!(service = %service, released = removed.len(), "remote released resource");
                Ok(())
            }
            Message::CallRequest { request_id, method, .. } => {
                warn!(request_id = %request_id, method, "client received a call request, rejecting");
                let error = FailureInfo::generic("this endpoint hosts no services");
                self.send(&origin, Message::CallFailure { request_id, error })
            }
            Message::CancelCall { request_id } => {
                warn!(request_id = %request_id, "client received a cancel request, ignoring");
                Ok(())
            }
        }
    }

    fn call_result(&mut self, request_id: RequestId, result: Payload) -> Result<()> {
        let Some(pending) = self.outstanding.remove(&request_id) else {
            warn!(request_id = %request_id, "result for unknown request, dropping");
            return Ok(());
        };
        self.interceptor.on_result(&pending.info, Outcome::Success(&result));

        let (response, completed) = match self.build_response(&pending, &result) {
            Ok(built) => built,
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "could not decode result");
                let _ = pending.reply.send(Err(e));
                return Ok(());
            }
        };

        match pending.reply.send(Ok(response)) {
            Ok(()) => {
                if !completed.is_empty() {
                    self.completed.insert(request_id, completed);
                }
            }
            Err(_) => {
                debug!(request_id = %request_id, "caller went away before its result arrived");
                self.abandon(completed)?;
            }
        }
        Ok(())
    }

    fn build_response(&mut self, pending: &Pending, result: &Payload) -> Result<(Response, Completed)> {
        let route = &pending.info.route;
        let mut completed = Completed::default();

        let response = match &pending.returns {
            ReturnKind::Value => {
                let (value, refs) = self.serialization.decode_value(result)?;
                let mut streams = Vec::with_capacity(refs.len());
                for stream in &refs {
                    streams.push(self.register_inbound(stream, route, pending.prefetch)?);
                    completed.streams.push(stream.id);
                }
                Response::Value(Decoded { value, streams })
            }
            ReturnKind::RemoteObject(api) => {
                let service = self.serialization.decode_handle(result)?;
                Response::Object(RemoteObject::new(self.engine()?, route.clone(), service, api.clone()))
            }
            ReturnKind::RemoteResource(api) => {
                let service = self.serialization.decode_handle(result)?;
                let state = self.resources.insert(&pending.info.service, &service, route)?;
                debug!(parent = %pending.info.service, resource = %service, "resource registered");
                completed.resource = Some(service.clone());
                let object = RemoteObject::new(self.engine()?, route.clone(), service, api.clone());
                Response::Resource(RemoteResource::new(object, state))
            }
        };
        Ok((response, completed))
    }

    fn engine(&self) -> Result<Engine> {
        self.engine
            .upgrade()
            .map(|inner| Engine { inner })
            .ok_or_else(|| Error::disconnected("engine handle dropped"))
    }

    fn call_failure(&mut self, request_id: RequestId, info: FailureInfo) {
        let Some(pending) = self.outstanding.remove(&request_id) else {
            warn!(request_id = %request_id, "failure for unknown request, dropping");
            return;
        };
        self.interceptor.on_result(&pending.info, Outcome::Failure(&info));
        debug!(request_id = %request_id, failure = %info, "call failed remotely");
        let _ = pending.reply.send(Err(Error::from_call_failure(info)));
    }

    fn register_inbound(&mut self, stream: &StreamRef, route: &RouteId, prefetch: u32) -> Result<StreamReceiver> {
        if self.streams.contains_key(&stream.id) {
            return Err(Error::Protocol(format!("{} is already registered", stream.id)));
        }
        let (buffer, rx) = mpsc::channel(self.config.stream_buffer);
        let cause: InboundCause = Arc::new(OnceLock::new());
        self.streams.insert(stream.id, StreamEntry {
            route: route.clone(),
            name: stream.name.clone(),
            role: Role::FromRemote { buffer, cause: cause.clone(), prefetch },
        });
        debug!(stream_id = %stream.id, name = %stream.name, "inbound stream registered");
        Ok(StreamReceiver::new(stream.id, stream.name.clone(), rx, cause, self.commands.clone(), prefetch))
    }

    /// Grants the initial credit of an inbound stream.
    fn serve_inbound(&self, stream_id: StreamId) -> Result<()> {
        if let Some(StreamEntry { route, role: Role::FromRemote { prefetch, .. }, .. }) = self.streams.get(&stream_id) {
            self.send(route, Message::StreamNext { stream_id, credit: *prefetch })?;
        }
        Ok(())
    }

    fn stream_data(&mut self, stream_id: StreamId, element: Payload) -> Result<()> {
        let (route, prefetch) = match self.streams.get(&stream_id) {
            Some(StreamEntry { route, role: Role::FromRemote { prefetch, .. }, .. }) => (route.clone(), *prefetch),
            Some(StreamEntry { role: Role::ToRemote { .. }, .. }) => {
                warn!(stream_id = %stream_id, "data sent to a producer-side stream, ignoring");
                return Ok(());
            }
            None => {
                warn!(stream_id = %stream_id, "data for unknown stream, dropping");
                return Ok(());
            }
        };

        let (value, refs) = self.serialization.decode_value(&element)?;
        let mut nested = Vec::with_capacity(refs.len());
        for stream in &refs {
            nested.push(self.register_inbound(stream, &route, prefetch)?);
            self.serve_inbound(stream.id)?;
        }

        let Some(StreamEntry { role: Role::FromRemote { buffer, .. }, .. }) = self.streams.get(&stream_id) else {
            return Ok(());
        };
        match buffer.try_send(Decoded { value, streams: nested }) {
            Ok(()) => Ok(()),
            // The consumer is gone; its CloseInbound is already queued.
            Err(mpsc::error::TrySendError::Closed(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                let error = Error::Protocol(format!("{} overran its delivery buffer", stream_id));
                self.close_stream(stream_id, error.clone(), true)?;
                Err(error)
            }
        }
    }

    fn remote_closed(&mut self, stream_id: StreamId, error: Option<FailureInfo>) {
        let Some(entry) = self.streams.remove(&stream_id) else {
            trace!(stream_id = %stream_id, "close for unknown stream");
            return;
        };
        debug!(stream_id = %stream_id, name = %entry.name, error = ?error, "stream closed by remote");
        match entry.role {
            Role::FromRemote { cause, .. } => {
                if let Some(info) = error {
                    let _ = cause.set(Error::from_stream_failure(info));
                }
            }
            Role::ToRemote { cancel, .. } => {
                let info = error.unwrap_or_else(|| FailureInfo::cancelled("consumer closed the stream"));
                cancel.cancel(Error::Stream(info));
            }
        }
    }

    /// Closes a stream locally with `cause`, optionally telling the remote.
    fn close_stream(&mut self, stream_id: StreamId, cause: Error, notify: bool) -> Result<()> {
        let Some(entry) = self.streams.remove(&stream_id) else {
            return Ok(());
        };
        let info = cause.to_failure_info();
        match entry.role {
            Role::FromRemote { cause: slot, .. } => {
                let _ = slot.set(cause);
            }
            Role::ToRemote { cancel, .. } => cancel.cancel(cause),
        }
        if notify {
            self.send(&entry.route, Message::StreamClosed { stream_id, error: Some(info) })?;
        }
        Ok(())
    }

    fn route_closed(&mut self, route: &RouteId) {
        self.gray.close(route);

        let failed: Vec<RequestId> = self
            .outstanding
            .iter()
            .filter(|(_, p)| &p.info.route == route)
            .map(|(id, _)| *id)
            .collect();
        for request_id in &failed {
            self.unserved.remove(request_id);
            if let Some(pending) = self.outstanding.remove(request_id) {
                let _ = pending.reply.send(Err(Error::RouteClosed(route.clone())));
            }
        }

        let streams: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|(_, s)| &s.route == route)
            .map(|(id, _)| *id)
            .collect();
        for stream_id in &streams {
            let _ = self.close_stream(*stream_id, Error::RouteClosed(route.clone()), false);
        }

        debug!(route = %route, requests = failed.len(), streams = streams.len(), "route closed");
    }

    // ------------------------------------------------------------------------
    //  Commands
    // ------------------------------------------------------------------------

    pub(super) fn handle_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Register(call) => self.register(*call),
            Command::Sent { request_id, result } => self.sent(request_id, result),
            Command::Cancel(request_id) => self.cancel(request_id),
            Command::Resumed(request_id) => {
                let Some(completed) = self.completed.remove(&request_id) else {
                    return Ok(());
                };
                for stream_id in completed.streams {
                    self.serve_inbound(stream_id)?;
                }
                Ok(())
            }
            Command::GrantCredit { stream_id, credit } => {
                if let Some(StreamEntry { route, role: Role::FromRemote { .. }, .. }) = self.streams.get(&stream_id) {
                    self.send(route, Message::StreamNext { stream_id, credit })?;
                }
                Ok(())
            }
            Command::CloseInbound(stream_id) => {
                debug!(stream_id = %stream_id, "consumer dropped its stream");
                let cause = Error::ProducerCancelled(Some(FailureInfo::cancelled("consumer dropped the stream")));
                self.close_stream(stream_id, cause, true)
            }
            Command::StreamFinished { stream_id, error } => {
                let Some(entry) = self.streams.remove(&stream_id) else {
                    return Ok(());
                };
                debug!(stream_id = %stream_id, name = %entry.name, "outbound stream finished");
                self.send(&entry.route, Message::StreamClosed { stream_id, error })
            }
            Command::Release(service) => self.release(&service),
            Command::Inspect(reply) => {
                let mut snapshot = EngineSnapshot {
                    outstanding: self.outstanding.keys().copied().collect(),
                    streams: self.streams.keys().copied().collect(),
                    resources: self.resources.len(),
                    gray_routes: self.gray.routes().cloned().collect(),
                };
                snapshot.outstanding.sort();
                snapshot.streams.sort();
                snapshot.gray_routes.sort();
                let _ = reply.send(snapshot);
                Ok(())
            }
        }
    }

    fn register(&mut self, call: NewCall) -> Result<()> {
        let NewCall { request, returns, dispose, prefetch, sources, reply, ack } = call;

        if let Some(waiter) = self.gray.waiter(&request.route) {
            let _ = ack.send(Registration::Gray { waiter, sources });
            return Ok(());
        }

        let request_id = request.request_id;
        if self.outstanding.contains_key(&request_id) {
            return Err(Error::Protocol(format!("{} is already outstanding", request_id)));
        }

        let mut unserved = Vec::with_capacity(sources.len());
        for (stream, source) in sources {
            if self.streams.contains_key(&stream.id) {
                let error = Error::Protocol(format!("{} is already registered", stream.id));
                let _ = reply.send(Err(error.clone()));
                return Err(error);
            }
            self.streams.insert(stream.id, StreamEntry {
                route: request.route.clone(),
                name: stream.name.clone(),
                role: Role::ToRemote { cancel: source.canceller(), credit: Arc::new(Semaphore::new(0)) },
            });
            unserved.push((stream.id, source));
        }
        if !unserved.is_empty() {
            self.unserved.insert(request_id, unserved);
        }

        if dispose {
            let removed = self.resources.remove_children(&request.service);
            debug!(service = %request.service, released = removed.len(), "disposing service resources");
        }

        let info = RequestInfo::from(&request);
        let envelope = Envelope::new(
            request.route.clone(),
            self.config.local_route.clone(),
            Message::CallRequest {
                request_id,
                service: request.service,
                method: request.method,
                args: request.payload,
                causality: request.causality,
            },
        );
        debug!(request_id = %request_id, route = %info.route, method = %info.method, "call registered");
        self.outstanding.insert(request_id, Pending { info, returns, prefetch, reply });
        self.outgoing
            .send(Outgoing::request(envelope, request_id))
            .map_err(|_| Error::Protocol("outgoing queue is closed".into()))?;

        let _ = ack.send(Registration::Registered);
        Ok(())
    }

    fn sent(&mut self, request_id: RequestId, result: std::result::Result<(), Error>) -> Result<()> {
        let sources = self.unserved.remove(&request_id).unwrap_or_default();
        match result {
            Ok(()) => {
                for (stream_id, source) in sources {
                    self.spawn_producer(stream_id, source);
                }
            }
            Err(e) => {
                for (stream_id, _) in sources {
                    let _ = self.close_stream(stream_id, e.clone(), false);
                }
                if let Some(pending) = self.outstanding.remove(&request_id) {
                    let _ = pending.reply.send(Err(Error::disconnected_by("request could not be sent", e)));
                }
            }
        }
        Ok(())
    }

    fn spawn_producer(&self, stream_id: StreamId, source: Source) {
        let Some(StreamEntry { route, role: Role::ToRemote { credit, .. }, .. }) = self.streams.get(&stream_id) else {
            return;
        };
        let producer = stream::Producer {
            stream_id,
            destination: route.clone(),
            origin: self.config.local_route.clone(),
            credit: credit.clone(),
            outgoing: self.outgoing.clone(),
            commands: self.commands.clone(),
            serialization: self.serialization.clone(),
        };
        debug!(stream_id = %stream_id, name = source.name(), "serving outbound stream");
        tokio::spawn(stream::produce(producer, source).in_current_span());
    }

    fn cancel(&mut self, request_id: RequestId) -> Result<()> {
        if let Some(pending) = self.outstanding.remove(&request_id) {
            debug!(request_id = %request_id, "call cancelled by caller");
            // Streams not yet served were never announced; drop them locally.
            for (stream_id, _) in self.unserved.remove(&request_id).unwrap_or_default() {
                let cause = Error::Stream(FailureInfo::cancelled("call was cancelled"));
                self.close_stream(stream_id, cause, false)?;
            }
            return self.send(&pending.info.route, Message::CancelCall { request_id });
        }
        if let Some(completed) = self.completed.remove(&request_id) {
            debug!(request_id = %request_id, "caller went away before resuming");
            return self.abandon(completed);
        }
        Ok(())
    }

    /// Cleans up after a result nobody will use.
    fn abandon(&mut self, completed: Completed) -> Result<()> {
        for stream_id in completed.streams {
            let cause = Error::ProducerCancelled(Some(FailureInfo::cancelled("caller went away")));
            self.close_stream(stream_id, cause, true)?;
        }
        if let Some(service) = completed.resource {
            self.release(&service)?;
        }
        Ok(())
    }

    fn release(&mut self, service: &ServiceId) -> Result<()> {
        let removed = self.resources.remove_subtree(service);
        for resource in &removed {
            debug!(resource = %resource.service, "resource released");
            self.send(&resource.route, Message::ResourceConsumed { service: resource.service.clone() })?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    //  Teardown
    // ------------------------------------------------------------------------

    /// Fails everything pending with `cause`.
    pub(super) fn teardown(&mut self, cause: &Error) {
        let requests = self.outstanding.len();
        for (_, pending) in self.outstanding.drain() {
            let _ = pending.reply.send(Err(cause.clone()));
        }
        self.completed.clear();
        self.unserved.clear();

        let streams: Vec<StreamId> = self.streams.keys().copied().collect();
        for stream_id in &streams {
            let _ = self.close_stream(*stream_id, cause.clone(), false);
        }

        self.gray.fail_all(cause);
        debug!(requests, streams = streams.len(), "engine state torn down");
    }

    /// Fails a command that arrived too late to run.
    pub(super) fn reject(&mut self, command: Command, cause: &Error) {
        match command {
            Command::Register(call) => {
                let NewCall { reply, sources, .. } = *call;
                for (_, source) in sources {
                    source.canceller().cancel(cause.clone());
                }
                let _ = reply.send(Err(cause.clone()));
            }
            Command::Inspect(reply) => {
                let _ = reply.send(EngineSnapshot::default());
            }
            _ => {}
        }
    }
}
