//! Engine protocol tests against a scripted remote end.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use serde_json::json;
use telerpc::ApiDescriptor;
use telerpc::CausalityToken;
use telerpc::Envelope;
use telerpc::FailureInfo;
use telerpc::FailureKind;
use telerpc::JsonSerialization;
use telerpc::Message;
use telerpc::MethodSignature;
use telerpc::ParamKind;
use telerpc::Payload;
use telerpc::RequestId;
use telerpc::ReturnKind;
use telerpc::RouteId;
use telerpc::Serialization;
use telerpc::ServiceId;
use telerpc::StreamId;
use telerpc::StreamRef;
use telerpc::codec::stream_marker;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::context::CallContext;
use crate::context::PrefetchStrategy;
use crate::engine::Call;
use crate::engine::Engine;
use crate::engine::EngineSnapshot;
use crate::error::Error;
use crate::interceptor::Interceptor;
use crate::interceptor::Outcome;
use crate::interceptor::RequestInfo;
use crate::interceptor::UnsentRequest;
use crate::mock_transport;
use crate::mock_transport::RemoteEnd;
use crate::proxy::RemoteResource;
use crate::proxy::Response;
use crate::stream;
use crate::telemetry;
use crate::transport;
use crate::transport::Inbound;
use crate::transport::Transport;

// ============================================================================
//  HELPERS
// ============================================================================

fn start() -> (Engine, RemoteEnd, JoinHandle<Error>) {
    start_with(EngineConfig::default())
}

fn start_with(config: EngineConfig) -> (Engine, RemoteEnd, JoinHandle<Error>) {
    telemetry::init_for_tests();
    let (transport, remote) = mock_transport::pair();
    let (engine, handle) = Engine::start(Arc::new(transport), config);
    (engine, remote, handle)
}

async fn next(remote: &mut RemoteEnd) -> Envelope {
    tokio::time::timeout(Duration::from_secs(5), remote.recv())
        .await
        .expect("timed out waiting for the engine")
        .expect("transport closed")
}

/// Lets in-flight work reach the remote, then checks nothing else was sent.
async fn assert_quiet(remote: &mut RemoteEnd) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    if let Some(extra) = remote.try_recv() {
        panic!("unexpected message: {:?}", extra.message);
    }
}

fn payload(value: Value) -> Payload {
    JsonSerialization::new().encode_value(&value, Vec::new()).unwrap()
}

fn spawn_call(engine: &Engine, ctx: CallContext, call: Call) -> JoinHandle<crate::Result<Response>> {
    let engine = engine.clone();
    tokio::spawn(async move { engine.call(&ctx, call).await })
}

fn request_id(envelope: &Envelope) -> RequestId {
    match &envelope.message {
        Message::CallRequest { request_id, .. } => *request_id,
        other => panic!("expected a call request, got {:?}", other),
    }
}

fn file_api() -> Arc<ApiDescriptor> {
    let lock = ApiDescriptor::new("lock").into_shared();
    ApiDescriptor::new("file")
        .method(MethodSignature::values("read", 0))
        .method(MethodSignature::new("lock", Vec::new(), ReturnKind::RemoteResource(lock)))
        .into_shared()
}

fn open_signature() -> MethodSignature {
    MethodSignature::new("open", vec![ParamKind::Value], ReturnKind::RemoteResource(file_api()))
}

/// Opens `path` on the "fs" service and answers with a resource handle.
async fn open_file(engine: &Engine, remote: &mut RemoteEnd, path: &str) -> RemoteResource {
    let call = Call::new("server", "fs", open_signature()).arg(json!(path));
    let task = spawn_call(engine, CallContext::new(), call);
    let request = next(remote).await;
    remote.reply(&request, Message::CallResult { request_id: request_id(&request), result: payload(json!(path)) });
    task.await.unwrap().unwrap().into_resource().unwrap()
}

/// Polls the engine until its state satisfies `ready`.
async fn settle(engine: &Engine, ready: impl Fn(&EngineSnapshot) -> bool) {
    for _ in 0..200 {
        if ready(&engine.snapshot().await.unwrap()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("engine never settled: {:?}", engine.snapshot().await);
}

/// Holds every outgoing envelope until the test opens the gate.
struct Gated {
    inner: mock_transport::ChannelTransport,
    gate: Arc<Semaphore>,
}

#[async_trait::async_trait]
impl Transport for Gated {
    async fn send(&self, envelope: Envelope) -> transport::Result<()> {
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
        self.inner.send(envelope).await
    }

    async fn recv(&self) -> transport::Result<Option<Inbound>> {
        self.inner.recv().await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

// ============================================================================
//  CALLS
// ============================================================================

#[tokio::test]
async fn test_call_result_resolves_caller() {
    let (engine, mut remote, _handle) = start();
    let call = Call::new("server", "math", MethodSignature::values("answer", 1)).arg(json!("everything"));
    let task = spawn_call(&engine, CallContext::new(), call);

    let request = next(&mut remote).await;
    assert_eq!(request.destination, RouteId::new("server"));
    assert_eq!(request.origin, RouteId::new("client"));
    let Message::CallRequest { service, method, .. } = &request.message else {
        panic!("expected a call request");
    };
    assert_eq!(service, &ServiceId::new("math"));
    assert_eq!(method, "answer");

    remote.reply(&request, Message::CallResult { request_id: request_id(&request), result: payload(json!(42)) });

    let value = task.await.unwrap().unwrap().into_value().unwrap();
    assert_eq!(value.value, json!(42));
    assert!(engine.snapshot().await.unwrap().outstanding.is_empty());
}

#[tokio::test]
async fn test_request_ids_are_unique() {
    let (engine, mut remote, _handle) = start();
    for _ in 0..3 {
        spawn_call(&engine, CallContext::new(), Call::new("server", "svc", MethodSignature::values("noop", 0)));
    }

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(request_id(&next(&mut remote).await));
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);
    assert_eq!(engine.snapshot().await.unwrap().outstanding, ids);
}

#[tokio::test]
async fn test_call_failure_is_classified() {
    let (engine, mut remote, _handle) = start();
    let kinds = [
        (FailureKind::ServiceNotReady, "ServiceNotReady"),
        (FailureKind::Conflict, "Conflict"),
        (FailureKind::UnresolvedService, "UnresolvedService"),
        (FailureKind::Generic, "Remote"),
    ];

    for (kind, expected) in kinds {
        let task = spawn_call(&engine, CallContext::new(), Call::new("server", "svc", MethodSignature::values("get", 0)));
        let request = next(&mut remote).await;
        let error = FailureInfo::new(kind, "nope");
        remote.reply(&request, Message::CallFailure { request_id: request_id(&request), error });

        let err = task.await.unwrap().unwrap_err();
        assert!(format!("{:?}", err).starts_with(expected), "{:?}", err);
    }
}

#[tokio::test]
async fn test_teardown_fails_pending_calls_with_the_cause() {
    let (engine, mut remote, handle) = start();
    let task = spawn_call(&engine, CallContext::new(), Call::new("server", "svc", MethodSignature::values("slow", 0)));
    next(&mut remote).await;

    remote.fail("cable cut");

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Disconnected(_)));
    assert!(err.to_string().contains("cable cut"), "{}", err);

    let cause = handle.await.unwrap();
    assert!(cause.to_string().contains("cable cut"));
    assert!(engine.is_closed());
}

#[tokio::test]
async fn test_shutdown_synthesizes_a_disconnection() {
    let (engine, mut remote, handle) = start();
    let task = spawn_call(&engine, CallContext::new(), Call::new("server", "svc", MethodSignature::values("slow", 0)));
    next(&mut remote).await;

    engine.shutdown();

    let err = task.await.unwrap().unwrap_err();
    assert!(err.is_disconnection());
    assert!(handle.await.unwrap().is_disconnection());
    // The transport's outbound side is closed.
    assert!(remote.recv().await.is_none());
}

#[tokio::test]
async fn test_dropping_the_call_sends_cancel() {
    let (engine, mut remote, _handle) = start();
    let call = Call::new("server", "svc", MethodSignature::values("slow", 0));

    let ctx = CallContext::new();
    let attempt = tokio::time::timeout(Duration::from_millis(50), engine.call(&ctx, call)).await;
    assert!(attempt.is_err());

    let request = next(&mut remote).await;
    let cancel = next(&mut remote).await;
    assert_eq!(cancel.message, Message::CancelCall { request_id: request_id(&request) });
    assert!(engine.snapshot().await.unwrap().outstanding.is_empty());

    // A late result is dropped without side effects.
    remote.reply(&request, Message::CallResult { request_id: request_id(&request), result: payload(json!(1)) });
    assert_quiet(&mut remote).await;
}

#[tokio::test]
async fn test_call_timeout_is_not_a_disconnection() {
    let config = EngineConfig::default().with_call_timeout(Duration::from_millis(50));
    let (engine, mut remote, _handle) = start_with(config);

    let err = engine
        .call(&CallContext::new(), Call::new("server", "svc", MethodSignature::values("slow", 0)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(d) if d == Duration::from_millis(50)));
    assert!(!err.is_disconnection());

    next(&mut remote).await;
    assert!(matches!(next(&mut remote).await.message, Message::CancelCall { .. }));
}

#[tokio::test]
async fn test_causality_token_travels_with_the_request() {
    let (engine, mut remote, _handle) = start();
    let ctx = CallContext::new().with_causality(telerpc::CausalityToken::new("tok-1"));
    spawn_call(&engine, ctx, Call::new("server", "svc", MethodSignature::values("get", 0)));

    let Message::CallRequest { causality, .. } = next(&mut remote).await.message else {
        panic!("expected a call request");
    };
    assert_eq!(causality, Some(telerpc::CausalityToken::new("tok-1")));
}

// ============================================================================
//  ROUTES
// ============================================================================

async fn gray(engine: &Engine, remote: &RemoteEnd, route: &str) {
    remote.close_route(route);
    for _ in 0..100 {
        if engine.snapshot().await.unwrap().gray_routes.contains(&RouteId::new(route)) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("route {} never became gray", route);
}

#[tokio::test]
async fn test_route_closed_fails_outstanding_requests() {
    let (engine, mut remote, _handle) = start();
    let task = spawn_call(&engine, CallContext::new(), Call::new("server", "svc", MethodSignature::values("get", 0)));
    next(&mut remote).await;

    remote.close_route("server");

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::RouteClosed(ref r) if r == &RouteId::new("server")));
    assert!(engine.snapshot().await.unwrap().outstanding.is_empty());
}

#[tokio::test]
async fn test_fail_fast_on_gray_route() {
    let (engine, mut remote, _handle) = start();
    gray(&engine, &remote, "server").await;

    let ctx = CallContext::new().without_awaiting_for_reconnect();
    let err = engine
        .call(&ctx, Call::new("server", "svc", MethodSignature::values("get", 0)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RouteClosed(_)));
    assert_quiet(&mut remote).await;
}

#[tokio::test]
async fn test_await_strategy_waits_for_route_to_reopen() {
    let (engine, mut remote, _handle) = start();
    gray(&engine, &remote, "server").await;

    let task = spawn_call(&engine, CallContext::new(), Call::new("server", "svc", MethodSignature::values("get", 0)));
    assert_quiet(&mut remote).await;
    assert!(!task.is_finished());

    remote.open_route("server");
    let request = next(&mut remote).await;
    remote.reply(&request, Message::CallResult { request_id: request_id(&request), result: payload(json!("ok")) });

    assert_eq!(task.await.unwrap().unwrap().into_value().unwrap().value, json!("ok"));
    assert!(engine.snapshot().await.unwrap().gray_routes.is_empty());
}

#[tokio::test]
async fn test_other_routes_are_unaffected_by_gray_listing() {
    let (engine, mut remote, _handle) = start();
    gray(&engine, &remote, "down").await;

    spawn_call(&engine, CallContext::new(), Call::new("up", "svc", MethodSignature::values("get", 0)));
    assert_eq!(next(&mut remote).await.destination, RouteId::new("up"));
}

// ============================================================================
//  STREAMS
// ============================================================================

#[tokio::test]
async fn test_stream_init_for_unknown_stream_is_refused() {
    let (_engine, mut remote, _handle) = start();
    let envelope = Envelope::new(RouteId::new("client"), RouteId::new("server"), Message::StreamInit { stream_id: StreamId(99) });
    remote.send(Inbound::Message(envelope));

    let reply = next(&mut remote).await;
    assert_eq!(reply.destination, RouteId::new("server"));
    let Message::StreamClosed { stream_id, error } = reply.message else {
        panic!("expected StreamClosed");
    };
    assert_eq!(stream_id, StreamId(99));
    assert_eq!(error.map(|e| e.kind), Some(FailureKind::Cancelled));
    assert_quiet(&mut remote).await;
}

#[tokio::test]
async fn test_outbound_stream_respects_credit() {
    let (engine, mut remote, _handle) = start();
    let (sender, source) = stream::channel("chunks", 8);
    let signature = MethodSignature::new("upload", vec![ParamKind::Stream], ReturnKind::Value);
    let _task = spawn_call(&engine, CallContext::new(), Call::new("server", "files", signature).stream(source));

    let request = next(&mut remote).await;
    let Message::CallRequest { args, .. } = &request.message else {
        panic!("expected a call request");
    };
    let stream_id = args.streams[0].id;
    assert_eq!(args.streams[0].name, "chunks");

    assert_eq!(next(&mut remote).await.message, Message::StreamInit { stream_id });

    for i in 0..3 {
        sender.send(json!(i)).await.unwrap();
    }
    assert_quiet(&mut remote).await;

    remote.reply(&request, Message::StreamNext { stream_id, credit: 2 });
    for i in 0..2 {
        let Message::StreamData { element, .. } = next(&mut remote).await.message else {
            panic!("expected StreamData");
        };
        assert_eq!(JsonSerialization::new().decode_value(&element).unwrap().0, json!(i));
    }
    assert_quiet(&mut remote).await;

    remote.reply(&request, Message::StreamNext { stream_id, credit: 1 });
    assert!(matches!(next(&mut remote).await.message, Message::StreamData { .. }));

    drop(sender);
    assert_eq!(next(&mut remote).await.message, Message::StreamClosed { stream_id, error: None });
}

#[tokio::test]
async fn test_consumer_close_cancels_outbound_source() {
    let (engine, mut remote, _handle) = start();
    let (sender, source) = stream::channel("chunks", 1);
    let signature = MethodSignature::new("upload", vec![ParamKind::Stream], ReturnKind::Value);
    let _task = spawn_call(&engine, CallContext::new(), Call::new("server", "files", signature).stream(source));

    let request = next(&mut remote).await;
    let Message::StreamInit { stream_id } = next(&mut remote).await.message else {
        panic!("expected StreamInit");
    };

    let error = FailureInfo::generic("disk full");
    remote.reply(&request, Message::StreamClosed { stream_id, error: Some(error) });

    let cause = tokio::time::timeout(Duration::from_secs(5), sender.cancelled()).await.unwrap();
    assert!(matches!(cause, Error::Stream(ref info) if info.message == "disk full"));
    assert!(sender.send(json!(1)).await.is_err());
}

/// Answers a `watch` call with a value embedding one stream.
async fn watch(engine: &Engine, remote: &mut RemoteEnd, ctx: CallContext) -> (Envelope, crate::stream::Decoded) {
    let task = spawn_call(engine, ctx, Call::new("server", "events", MethodSignature::values("watch", 0)));
    let request = next(remote).await;
    let result = JsonSerialization::new()
        .encode_value(&json!({ "events": stream_marker(StreamId(5)) }), vec![StreamRef::new(StreamId(5), "events")])
        .unwrap();
    remote.reply(&request, Message::CallResult { request_id: request_id(&request), result });
    let decoded = task.await.unwrap().unwrap().into_value().unwrap();
    (request, decoded)
}

#[tokio::test]
async fn test_inbound_stream_is_served_after_resume() {
    let (engine, mut remote, _handle) = start();
    let ctx = CallContext::new().with_prefetch_strategy(PrefetchStrategy::new(4));
    let (request, mut decoded) = watch(&engine, &mut remote, ctx).await;
    let mut events = decoded.take_stream(StreamId(5)).unwrap();
    assert_eq!(events.name(), "events");

    assert_eq!(next(&mut remote).await.message, Message::StreamNext { stream_id: StreamId(5), credit: 4 });

    for i in 0..2 {
        remote.reply(&request, Message::StreamData { stream_id: StreamId(5), element: payload(json!(i)) });
    }
    assert_eq!(events.recv().await.unwrap().unwrap().value, json!(0));
    assert_eq!(events.recv().await.unwrap().unwrap().value, json!(1));

    // Two consumed out of a prefetch of four tops the credit back up.
    assert_eq!(next(&mut remote).await.message, Message::StreamNext { stream_id: StreamId(5), credit: 2 });

    remote.reply(&request, Message::StreamClosed { stream_id: StreamId(5), error: None });
    assert!(events.recv().await.unwrap().is_none());
    assert_quiet(&mut remote).await;
}

#[tokio::test]
async fn test_producer_cancel_is_distinguished() {
    let (engine, mut remote, _handle) = start();
    let (request, mut decoded) = watch(&engine, &mut remote, CallContext::new()).await;
    let mut events = decoded.take_stream(StreamId(5)).unwrap();
    next(&mut remote).await;

    let error = FailureInfo::cancelled("producer stopped");
    remote.reply(&request, Message::StreamClosed { stream_id: StreamId(5), error: Some(error) });
    assert!(matches!(events.recv().await, Err(Error::ProducerCancelled(Some(_)))));
}

#[tokio::test]
async fn test_dropping_receiver_cancels_stream() {
    let (engine, mut remote, _handle) = start();
    let (_request, decoded) = watch(&engine, &mut remote, CallContext::new()).await;
    next(&mut remote).await;

    drop(decoded);

    let Message::StreamClosed { stream_id, error } = next(&mut remote).await.message else {
        panic!("expected StreamClosed");
    };
    assert_eq!(stream_id, StreamId(5));
    assert_eq!(error.map(|e| e.kind), Some(FailureKind::Cancelled));
    assert!(engine.snapshot().await.unwrap().streams.is_empty());
}

#[tokio::test]
async fn test_buffer_overrun_is_a_protocol_error() {
    let config = EngineConfig::default().with_stream_buffer(2);
    let (engine, mut remote, _handle) = start_with(config);
    let (request, mut decoded) = watch(&engine, &mut remote, CallContext::new()).await;
    let mut events = decoded.take_stream(StreamId(5)).unwrap();

    // Prefetch is clamped to the buffer.
    assert_eq!(next(&mut remote).await.message, Message::StreamNext { stream_id: StreamId(5), credit: 2 });

    for i in 0..3 {
        remote.reply(&request, Message::StreamData { stream_id: StreamId(5), element: payload(json!(i)) });
    }

    let Message::StreamClosed { error: Some(info), .. } = next(&mut remote).await.message else {
        panic!("expected StreamClosed with an error");
    };
    assert!(info.message.contains("overran"));

    assert!(events.recv().await.unwrap().is_some());
    assert!(events.recv().await.unwrap().is_some());
    assert!(matches!(events.recv().await, Err(Error::Protocol(_))));
}

#[tokio::test]
async fn test_strict_mode_stops_on_processing_failure() {
    let config = EngineConfig::default().with_stream_buffer(1).with_strict(true);
    let (engine, mut remote, handle) = start_with(config);
    let (request, _decoded) = watch(&engine, &mut remote, CallContext::new()).await;
    next(&mut remote).await;

    for i in 0..2 {
        remote.reply(&request, Message::StreamData { stream_id: StreamId(5), element: payload(json!(i)) });
    }

    let cause = handle.await.unwrap();
    assert!(matches!(cause, Error::Protocol(_)));
}

#[tokio::test]
async fn test_lenient_mode_survives_malformed_elements() {
    let (engine, mut remote, handle) = start();
    let (request, _decoded) = watch(&engine, &mut remote, CallContext::new()).await;
    next(&mut remote).await;

    let garbage = Payload { data: b"{".to_vec(), streams: Vec::new() };
    remote.reply(&request, Message::StreamData { stream_id: StreamId(5), element: garbage });

    assert!(engine.snapshot().await.is_ok());
    assert!(!handle.is_finished());
}

// ============================================================================
//  RESOURCES
// ============================================================================

#[tokio::test]
async fn test_release_sends_consumed_notice_once() {
    let (engine, mut remote, _handle) = start();
    let file = open_file(&engine, &mut remote, "files/1").await;
    assert_eq!(engine.snapshot().await.unwrap().resources, 1);

    file.release().unwrap();
    let notice = next(&mut remote).await;
    assert_eq!(notice.destination, RouteId::new("server"));
    assert_eq!(notice.message, Message::ResourceConsumed { service: ServiceId::new("files/1") });

    file.release().unwrap();
    assert_quiet(&mut remote).await;
    assert_eq!(engine.snapshot().await.unwrap().resources, 0);

    let err = file.call(&CallContext::new(), "read", Vec::new()).await.unwrap_err();
    assert!(matches!(err, Error::ResourceConsumed(ref s) if s == &ServiceId::new("files/1")));
}

#[tokio::test]
async fn test_release_takes_descendants_first() {
    let (engine, mut remote, _handle) = start();
    let file = open_file(&engine, &mut remote, "files/2").await;

    let lock = {
        let file = file.clone();
        let task = tokio::spawn(async move { file.call(&CallContext::new(), "lock", Vec::new()).await });
        let request = next(&mut remote).await;
        remote.reply(&request, Message::CallResult { request_id: request_id(&request), result: payload(json!("locks/9")) });
        task.await.unwrap().unwrap().into_resource().unwrap()
    };

    file.release().unwrap();
    assert_eq!(next(&mut remote).await.message, Message::ResourceConsumed { service: ServiceId::new("locks/9") });
    assert_eq!(next(&mut remote).await.message, Message::ResourceConsumed { service: ServiceId::new("files/2") });
    assert!(lock.is_consumed());
    assert_quiet(&mut remote).await;
}

#[tokio::test]
async fn test_dispose_consumes_vended_resources() {
    let (engine, mut remote, _handle) = start();
    let file = open_file(&engine, &mut remote, "files/3").await;

    let dispose = Call::new("server", "fs", MethodSignature::dispose());
    let task = spawn_call(&engine, CallContext::new(), dispose);
    let request = next(&mut remote).await;
    assert!(file.is_consumed());

    remote.reply(&request, Message::CallResult { request_id: request_id(&request), result: payload(Value::Null) });
    task.await.unwrap().unwrap();
    assert_eq!(engine.snapshot().await.unwrap().resources, 0);
}

#[tokio::test]
async fn test_remote_release_is_not_echoed() {
    let (engine, mut remote, _handle) = start();
    let file = open_file(&engine, &mut remote, "files/4").await;

    let envelope = Envelope::new(
        RouteId::new("client"),
        RouteId::new("server"),
        Message::ResourceConsumed { service: ServiceId::new("files/4") },
    );
    remote.send(Inbound::Message(envelope));

    for _ in 0..100 {
        if file.is_consumed() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(file.is_consumed());
    file.release().unwrap();
    assert_quiet(&mut remote).await;
}

#[tokio::test]
async fn test_cancel_before_send_drops_unserved_streams() {
    telemetry::init_for_tests();
    let gate = Arc::new(Semaphore::new(0));
    let (transport, mut remote) = mock_transport::pair();
    let gated = Gated { inner: transport, gate: gate.clone() };
    let (engine, _handle) = Engine::start(Arc::new(gated), EngineConfig::default());

    let (sender, source) = stream::channel("chunks", 4);
    let signature = MethodSignature::new("upload", vec![ParamKind::Stream], ReturnKind::Value);
    let task = spawn_call(&engine, CallContext::new(), Call::new("server", "files", signature).stream(source));

    settle(&engine, |s| s.outstanding.len() == 1 && s.streams.len() == 1).await;
    task.abort();
    settle(&engine, |s| s.outstanding.is_empty() && s.streams.is_empty()).await;
    assert!(sender.is_cancelled());

    gate.add_permits(16);
    let request = next(&mut remote).await;
    assert_eq!(next(&mut remote).await.message, Message::CancelCall { request_id: request_id(&request) });
    assert_quiet(&mut remote).await;
    assert!(engine.snapshot().await.unwrap().streams.is_empty());
}

// ============================================================================
//  SCHEDULING
// ============================================================================

#[tokio::test]
async fn test_commands_progress_under_inbound_flood() {
    let (engine, remote, _handle) = start();
    let flood = tokio::spawn(async move {
        loop {
            for _ in 0..64 {
                remote.open_route("noise");
            }
            tokio::task::yield_now().await;
        }
    });

    let snapshot = tokio::time::timeout(Duration::from_secs(5), engine.snapshot()).await;
    flood.abort();
    assert!(snapshot.is_ok(), "command starved behind inbound traffic");
}

// ============================================================================
//  INTERCEPTORS
// ============================================================================

/// Stamps a causality token on every request and records every outcome.
#[derive(Default)]
struct Stamp {
    log: Mutex<Vec<String>>,
}

impl Interceptor for Stamp {
    fn before_send(&self, mut request: UnsentRequest) -> UnsentRequest {
        request.causality = Some(CausalityToken::new("stamped"));
        request
    }

    fn on_result(&self, request: &RequestInfo, outcome: Outcome<'_>) {
        let entry = match outcome {
            Outcome::Success(_) => format!("ok:{}", request.method),
            Outcome::Failure(info) => format!("err:{}:{:?}", request.method, info.kind),
        };
        if let Ok(mut log) = self.log.lock() {
            log.push(entry);
        }
    }
}

#[tokio::test]
async fn test_interceptor_rewrites_and_observes() {
    telemetry::init_for_tests();
    let stamp = Arc::new(Stamp::default());
    let (transport, mut remote) = mock_transport::pair();
    let (engine, _handle) = Engine::start_with(
        Arc::new(transport),
        EngineConfig::default(),
        Arc::new(JsonSerialization::new()),
        stamp.clone(),
    );

    let task = spawn_call(&engine, CallContext::new(), Call::new("server", "svc", MethodSignature::values("get", 0)));
    let request = next(&mut remote).await;
    let Message::CallRequest { causality, .. } = &request.message else {
        panic!("expected a call request");
    };
    assert_eq!(causality, &Some(CausalityToken::new("stamped")));
    remote.reply(&request, Message::CallResult { request_id: request_id(&request), result: payload(json!(1)) });
    task.await.unwrap().unwrap();
    // Observed before the caller resumed.
    assert_eq!(*stamp.log.lock().unwrap(), vec!["ok:get"]);

    let task = spawn_call(&engine, CallContext::new(), Call::new("server", "svc", MethodSignature::values("put", 0)));
    let request = next(&mut remote).await;
    let error = FailureInfo::new(FailureKind::Conflict, "stale");
    remote.reply(&request, Message::CallFailure { request_id: request_id(&request), error });
    assert!(matches!(task.await.unwrap(), Err(Error::Conflict(_))));
    assert_eq!(*stamp.log.lock().unwrap(), vec!["ok:get", "err:put:Conflict"]);
}
