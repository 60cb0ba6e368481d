use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use futures_core::future::BoxFuture;
use ipcbridge_transport::{Endpoint, EndpointEvent, EndpointId, ExportTransport};
use ipcbridge_wire::{
    unmarshal_args, value_to_wire, wire_to_value, CallType, Manifest, Message, MessageType,
    RemoteError, StreamEvent, SyncReply, Value,
};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::context::{deliver, CallContext, Reply};
use crate::error::{ExportError, Result};
use crate::handler::{Handler, Methods, StreamFn, StreamReturn};
use crate::registry::StreamRegistry;
use crate::stream::{force_close, request_close, Control, EventSink, ExportStream};

/// Decides whether an endpoint may call a method with the given arguments.
pub type PermissionCheck = Arc<dyn Fn(&dyn Endpoint, &str, &[Value]) -> bool + Send + Sync>;

/// Receives protocol diagnostics. These never reach the caller.
pub type DiagnosticSink = Arc<dyn Fn(&Diagnostic) + Send + Sync>;

/// A protocol problem observed by the exporter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// The called name has no manifest entry or no handler.
    MethodNotFound {
        endpoint: EndpointId,
        method: String,
        request_id: u64,
    },
    /// A caller sent a message type only the exporter may send.
    UnexpectedMessage {
        endpoint: EndpointId,
        message: String,
        request_id: u64,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::MethodNotFound {
                endpoint,
                method,
                request_id,
            } => write!(
                f,
                "method not found: '{method}' (endpoint {endpoint}, request {request_id})"
            ),
            Diagnostic::UnexpectedMessage {
                endpoint,
                message,
                request_id,
            } => write!(
                f,
                "unexpected message '{message}' (endpoint {endpoint}, request {request_id})"
            ),
        }
    }
}

/// Exporter configuration.
#[derive(Clone, Default)]
pub struct ExportConfig {
    pub permission: Option<PermissionCheck>,
    pub diagnostics: Option<DiagnosticSink>,
}

impl ExportConfig {
    pub fn with_permission<F>(mut self, check: F) -> Self
    where
        F: Fn(&dyn Endpoint, &str, &[Value]) -> bool + Send + Sync + 'static,
    {
        self.permission = Some(Arc::new(check));
        self
    }

    pub fn with_diagnostics<F>(mut self, sink: F) -> Self
    where
        F: Fn(&Diagnostic) + Send + Sync + 'static,
    {
        self.diagnostics = Some(Arc::new(sink));
        self
    }
}

impl fmt::Debug for ExportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportConfig")
            .field("permission", &self.permission.is_some())
            .field("diagnostics", &self.diagnostics.is_some())
            .finish()
    }
}

/// Serve `methods` on `channel` with the default configuration.
pub fn export_api<T>(
    transport: &T,
    channel: &str,
    manifest: Manifest,
    methods: Methods,
) -> Result<Exporter>
where
    T: ExportTransport + ?Sized,
{
    export_api_with_config(transport, channel, manifest, methods, ExportConfig::default())
}

/// Serve `methods` on `channel`.
///
/// Every handler must be declared in `manifest` with a matching call type.
/// Must be called inside a tokio runtime; promise handlers and deferred
/// streams run on it.
pub fn export_api_with_config<T>(
    transport: &T,
    channel: &str,
    manifest: Manifest,
    methods: Methods,
    config: ExportConfig,
) -> Result<Exporter>
where
    T: ExportTransport + ?Sized,
{
    let exporter = Exporter::new(channel, manifest, methods, config)?;
    let serving = exporter.clone();
    transport.on_message(
        channel,
        Arc::new(move |endpoint: Arc<dyn Endpoint>, message: Message| {
            serving.handle_message(endpoint, message)
        }),
    );
    debug!(channel, methods = exporter.inner.methods.len(), "exporter bound");
    Ok(exporter)
}

/// The method-owning side of a channel.
#[derive(Clone)]
pub struct Exporter {
    inner: Arc<Inner>,
}

struct Inner {
    channel: Arc<str>,
    manifest: Manifest,
    methods: Methods,
    config: ExportConfig,
    runtime: Handle,
    streams: StreamRegistry,
    // Endpoints with a `Destroyed` listener registered.
    watched: Mutex<HashSet<EndpointId>>,
}

impl Exporter {
    /// Build an exporter without binding it to a transport.
    pub fn new(
        channel: &str,
        manifest: Manifest,
        methods: Methods,
        config: ExportConfig,
    ) -> Result<Self> {
        manifest.validate()?;
        for (name, handler) in methods.iter() {
            match manifest.get(name) {
                None => return Err(ExportError::MethodNotFound(name.to_string())),
                Some(expected) if expected != handler.call_type() => {
                    return Err(ExportError::HandlerMismatch {
                        method: name.to_string(),
                        expected,
                        found: handler.call_type(),
                    })
                }
                Some(_) => {}
            }
        }
        let runtime = Handle::try_current().map_err(|e| ExportError::NoRuntime(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                channel: Arc::from(channel),
                manifest,
                methods,
                config,
                runtime,
                streams: StreamRegistry::default(),
                watched: Mutex::new(HashSet::new()),
            }),
        })
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    pub fn manifest(&self) -> &Manifest {
        &self.inner.manifest
    }

    /// Number of live streams the endpoint holds.
    pub fn active_streams(&self, endpoint: EndpointId) -> usize {
        self.inner.streams.count(endpoint)
    }

    /// Handle one incoming message. The return value is the immediate reply.
    pub fn handle_message(
        &self,
        endpoint: Arc<dyn Endpoint>,
        message: Message,
    ) -> Option<SyncReply> {
        self.inner.handle(endpoint, message)
    }
}

impl fmt::Debug for Exporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exporter")
            .field("channel", &self.inner.channel)
            .field("manifest", &self.inner.manifest)
            .finish()
    }
}

impl Inner {
    fn handle(self: &Arc<Self>, endpoint: Arc<dyn Endpoint>, message: Message) -> Option<SyncReply> {
        if let Some(msg_type) = message.message_type() {
            if msg_type.is_control() {
                self.control(endpoint.as_ref(), msg_type, message);
                return Some(SyncReply::ack());
            }
            self.diagnose(Diagnostic::UnexpectedMessage {
                endpoint: endpoint.id(),
                message: message.name,
                request_id: message.request_id,
            });
            return None;
        }

        let handler = match (
            self.manifest.get(&message.name),
            self.methods.get(&message.name),
        ) {
            (Some(_), Some(handler)) => handler.clone(),
            _ => {
                self.diagnose(Diagnostic::MethodNotFound {
                    endpoint: endpoint.id(),
                    method: message.name,
                    request_id: message.request_id,
                });
                return None;
            }
        };

        let ctx = CallContext::new(
            endpoint,
            Arc::clone(&self.channel),
            &message.name,
            message.request_id,
        );
        let args = unmarshal_args(message.args);
        debug!(
            endpoint = ctx.endpoint_id(),
            method = ctx.method(),
            request_id = ctx.request_id(),
            call_type = %handler.call_type(),
            "dispatching call"
        );

        if let Some(check) = &self.config.permission {
            if !check(ctx.endpoint().as_ref(), ctx.method(), &args) {
                debug!(method = ctx.method(), "call denied");
                let err = RemoteError::new(format!("Denied access to method '{}'", ctx.method()));
                return self.reject(&ctx, handler.call_type(), err);
            }
        }

        match handler {
            Handler::Sync(f) => Some(call_sync(&ctx, || f(&ctx, args))),
            Handler::Async(f) => {
                let reply = Reply::new(ctx.clone());
                if catch_unwind(AssertUnwindSafe(|| f(&ctx, args, reply))).is_err() {
                    warn!(method = ctx.method(), "async handler panicked");
                }
                None
            }
            Handler::Promise(f) => {
                match catch_unwind(AssertUnwindSafe(|| f(&ctx, args))) {
                    Ok(future) => {
                        let settled = self.settle(future);
                        self.runtime.spawn(async move {
                            let result = settled.await;
                            ctx.reply_to(result);
                        });
                    }
                    Err(panic) => {
                        ctx.reply_to(Err(RemoteError::from_panic(panic)));
                    }
                }
                None
            }
            Handler::Readable(f) => self.open_stream(ctx, args, f),
            Handler::Writable(f) => self.open_stream(ctx, args, f),
            Handler::Duplex(f) => self.open_stream(ctx, args, f),
        }
    }

    /// Deliver a failure through the call type's normal path.
    fn reject(&self, ctx: &CallContext, call_type: CallType, err: RemoteError) -> Option<SyncReply> {
        match call_type {
            CallType::Async | CallType::Promise => {
                ctx.reply_to(Err(err));
                None
            }
            CallType::Sync | CallType::Readable | CallType::Writable | CallType::Duplex => {
                Some(SyncReply::Error(err.message))
            }
        }
    }

    /// Run `future` on the runtime; a panic while polling becomes an error.
    fn settle<T>(
        &self,
        future: BoxFuture<'static, std::result::Result<T, RemoteError>>,
    ) -> impl Future<Output = std::result::Result<T, RemoteError>> + Send + 'static
    where
        T: Send + 'static,
    {
        let task = self.runtime.spawn(future);
        async move {
            match task.await {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(RemoteError::from_panic(e.into_panic())),
                Err(e) => Err(RemoteError::new(e.to_string())),
            }
        }
    }

    fn open_stream<S>(
        self: &Arc<Self>,
        ctx: CallContext,
        args: Vec<Value>,
        f: StreamFn<S>,
    ) -> Option<SyncReply>
    where
        S: Into<ExportStream> + Send + 'static,
    {
        let returned = match catch_unwind(AssertUnwindSafe(|| f(&ctx, args))) {
            Ok(Ok(returned)) => returned,
            Ok(Err(err)) => return Some(SyncReply::Error(err.message)),
            Err(panic) => return Some(SyncReply::Error(RemoteError::from_panic(panic).message)),
        };

        match returned {
            StreamReturn::Ready(stream) => self.attach(&ctx, stream.map(Into::into)),
            StreamReturn::Deferred(future) => {
                let settled = self.settle(future);
                let weak = Arc::downgrade(self);
                self.runtime.spawn(async move {
                    let result = settled.await;
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    match result {
                        Ok(stream) => inner.attach(&ctx, stream.map(Into::into)),
                        Err(err) => inner.stream_failed(&ctx, err),
                    }
                });
            }
        }
        Some(SyncReply::ack())
    }

    /// Register a returned stream and start relaying its events.
    fn attach(self: &Arc<Self>, ctx: &CallContext, stream: Option<ExportStream>) {
        let Some(stream) = stream else {
            let err = RemoteError::new(format!("'{}' did not return a stream", ctx.method()));
            self.stream_failed(ctx, err);
            return;
        };

        if ctx.is_stale() {
            debug!(
                method = ctx.method(),
                request_id = ctx.request_id(),
                "caller gone before stream was ready; closing it"
            );
            force_close(stream.ops());
            return;
        }

        let endpoint = ctx.endpoint_id();
        if self.streams.insert(endpoint, ctx.request_id(), stream.clone()) {
            self.watch(ctx.endpoint());
        }
        stream.subscribe(self.relay_sink(ctx));

        // Lost a race with navigation or destruction while registering.
        if ctx.is_stale() {
            if let Some(stream) = self.streams.remove(endpoint, ctx.request_id()) {
                stream.unsubscribe();
                force_close(stream.ops());
            }
        }
    }

    fn stream_failed(&self, ctx: &CallContext, err: RemoteError) {
        debug!(method = ctx.method(), error = %err, "stream call failed");
        deliver(
            ctx.endpoint().as_ref(),
            &self.channel,
            ctx.epoch(),
            StreamEvent::Error(err).to_message(ctx.request_id()),
        );
    }

    fn relay_sink(self: &Arc<Self>, ctx: &CallContext) -> EventSink {
        let weak: Weak<Self> = Arc::downgrade(self);
        let ctx = ctx.clone();
        Box::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.relay(&ctx, event);
            }
        })
    }

    fn relay(&self, ctx: &CallContext, event: StreamEvent) {
        let Some((transition, finished)) =
            self.streams
                .advance(ctx.endpoint_id(), ctx.request_id(), &event)
        else {
            return;
        };

        if transition.forward {
            deliver(
                ctx.endpoint().as_ref(),
                &self.channel,
                ctx.epoch(),
                event.to_message(ctx.request_id()),
            );
        }
        if let Some(stream) = finished {
            stream.unsubscribe();
            debug!(
                endpoint = ctx.endpoint_id(),
                request_id = ctx.request_id(),
                state = ?transition.next,
                "stream finished"
            );
        }
    }

    /// Tear the endpoint's streams down when it navigates or goes away.
    ///
    /// Called whenever the endpoint's stream map is created. `Navigated` fires
    /// once per registration, so it is registered every time; `Destroyed` only
    /// the first time the endpoint is seen.
    fn watch(self: &Arc<Self>, endpoint: &Arc<dyn Endpoint>) {
        let id = endpoint.id();
        let first_sighting = self
            .watched
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id);
        let events: &[EndpointEvent] = if first_sighting {
            &[EndpointEvent::Navigated, EndpointEvent::Destroyed]
        } else {
            &[EndpointEvent::Navigated]
        };
        for &event in events {
            let weak = Arc::downgrade(self);
            endpoint.once(
                event,
                Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.teardown(id, event);
                    }
                }),
            );
        }
    }

    fn teardown(&self, endpoint: EndpointId, event: EndpointEvent) {
        if event == EndpointEvent::Destroyed {
            self.watched
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&endpoint);
        }
        let streams = self.streams.take_endpoint(endpoint);
        if !streams.is_empty() {
            debug!(endpoint, ?event, count = streams.len(), "closing endpoint streams");
        }
        for stream in streams {
            stream.unsubscribe();
            if force_close(stream.ops()) == Control::Unsupported {
                warn!(endpoint, "stream supports no close operation");
            }
        }
    }

    fn control(&self, endpoint: &dyn Endpoint, msg_type: MessageType, message: Message) {
        let request_id = message.request_id;
        let Some(stream) = self.streams.get(endpoint.id(), request_id) else {
            debug!(
                endpoint = endpoint.id(),
                request_id,
                request = %msg_type,
                "control request for unknown stream"
            );
            return;
        };

        let outcome = match msg_type {
            MessageType::StreamRequestWrite => {
                let chunk = message
                    .args
                    .into_iter()
                    .next()
                    .map(wire_to_value)
                    .unwrap_or_default();
                stream.ops().write(chunk)
            }
            MessageType::StreamRequestEnd => stream.ops().end(),
            MessageType::StreamRequestClose => {
                let outcome = request_close(stream.ops());
                if outcome == Control::Applied {
                    self.closed_on_request(endpoint.id(), request_id);
                }
                outcome
            }
            _ => Control::Unsupported,
        };
        if outcome == Control::Unsupported {
            debug!(request_id, request = %msg_type, "stream does not support request");
        }
    }

    /// The caller closed the stream; nothing more is relayed for it.
    fn closed_on_request(&self, endpoint: EndpointId, request_id: u64) {
        if let Some((state, stream)) = self.streams.close(endpoint, request_id) {
            stream.unsubscribe();
            debug!(endpoint, request_id, ?state, "stream closed on request");
        }
    }

    fn diagnose(&self, diagnostic: Diagnostic) {
        warn!(channel = %self.channel, %diagnostic, "exporter diagnostic");
        if let Some(sink) = &self.config.diagnostics {
            sink(&diagnostic);
        }
    }
}

fn call_sync(ctx: &CallContext, f: impl FnOnce() -> std::result::Result<Value, RemoteError>) -> SyncReply {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => SyncReply::Success(value_to_wire(&value)),
        Ok(Err(err)) => SyncReply::Error(err.message),
        Err(panic) => {
            let err = RemoteError::from_panic(panic);
            warn!(method = ctx.method(), error = %err, "sync handler panicked");
            SyncReply::Error(err.message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use ipcbridge_transport::{EndpointCallback, TransportError};

    use crate::stream::{Readable, Writable};

    const CHANNEL: &str = "test-api";

    /// Endpoint that records what the exporter sends.
    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Message>>,
        destroyed: AtomicBool,
        epoch: AtomicU64,
        callbacks: Mutex<Vec<(EndpointEvent, EndpointCallback)>>,
    }

    impl Recorder {
        fn sent(&self) -> Vec<Message> {
            self.sent.lock().unwrap().clone()
        }

        fn fire(&self, event: EndpointEvent) {
            let callbacks: Vec<_> = {
                let mut all = self.callbacks.lock().unwrap();
                let (fire, keep) = all.drain(..).partition(|(e, _)| *e == event);
                *all = keep;
                fire
            };
            for (_, cb) in callbacks {
                cb();
            }
        }

        fn listeners(&self, event: EndpointEvent) -> usize {
            self.callbacks
                .lock()
                .unwrap()
                .iter()
                .filter(|(e, _)| *e == event)
                .count()
        }

        fn navigate(&self) {
            self.epoch.fetch_add(1, Ordering::SeqCst);
            self.fire(EndpointEvent::Navigated);
        }

        fn destroy(&self) {
            self.destroyed.store(true, Ordering::SeqCst);
            self.fire(EndpointEvent::Destroyed);
        }
    }

    impl Endpoint for Recorder {
        fn id(&self) -> EndpointId {
            1
        }

        fn send(&self, _channel: &str, message: Message) -> std::result::Result<(), TransportError> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        fn is_destroyed(&self) -> bool {
            self.destroyed.load(Ordering::SeqCst)
        }

        fn navigation_epoch(&self) -> u64 {
            self.epoch.load(Ordering::SeqCst)
        }

        fn once(&self, event: EndpointEvent, callback: EndpointCallback) {
            self.callbacks.lock().unwrap().push((event, callback));
        }
    }

    fn call(name: &str, id: u64, args: Vec<serde_json::Value>) -> Message {
        Message::new(name, id, args)
    }

    fn exporter(manifest: Manifest, methods: Methods, config: ExportConfig) -> Exporter {
        Exporter::new(CHANNEL, manifest, methods, config).expect("exporter should build")
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    #[tokio::test]
    async fn sync_success_and_error() {
        let exp = exporter(
            Manifest::new()
                .with("addOneSync", CallType::Sync)
                .with("errorSync", CallType::Sync),
            Methods::new()
                .sync("addOneSync", |_, args| {
                    Ok(Value::from(args[0].as_i64().unwrap_or(0) + 1))
                })
                .sync("errorSync", |_, _| Err(RemoteError::new("oh no!"))),
            ExportConfig::default(),
        );
        let ep = Arc::new(Recorder::default());

        let reply = exp.handle_message(ep.clone(), call("addOneSync", 0, vec![serde_json::json!(5)]));
        assert_eq!(reply, Some(SyncReply::Success(serde_json::json!(6))));

        let reply = exp.handle_message(ep.clone(), call("errorSync", 0, vec![]));
        assert_eq!(reply, Some(SyncReply::Error("oh no!".into())));
    }

    #[tokio::test]
    async fn panicking_sync_handler_becomes_error() {
        let exp = exporter(
            Manifest::new().with("boom", CallType::Sync),
            Methods::new().sync("boom", |_, _| panic!("kaboom")),
            ExportConfig::default(),
        );
        let reply = exp.handle_message(Arc::new(Recorder::default()), call("boom", 0, vec![]));
        assert_eq!(reply, Some(SyncReply::Error("kaboom".into())));
    }

    #[tokio::test]
    async fn unknown_method_is_only_a_diagnostic() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let exp = exporter(
            Manifest::new().with("declaredOnly", CallType::Sync),
            Methods::new(),
            ExportConfig::default().with_diagnostics(move |d| sink.lock().unwrap().push(d.clone())),
        );
        let ep = Arc::new(Recorder::default());

        assert_eq!(exp.handle_message(ep.clone(), call("missing", 3, vec![])), None);
        assert_eq!(exp.handle_message(ep.clone(), call("declaredOnly", 4, vec![])), None);
        assert!(ep.sent().is_empty());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(
            seen[0],
            Diagnostic::MethodNotFound {
                endpoint: 1,
                method: "missing".into(),
                request_id: 3
            }
        );
    }

    #[tokio::test]
    async fn binding_is_validated() {
        let err = Exporter::new(
            CHANNEL,
            Manifest::new().with("a", CallType::Async),
            Methods::new().sync("a", |_, _| Ok(Value::Null)),
            ExportConfig::default(),
        )
        .expect_err("kind mismatch should be rejected");
        assert!(matches!(err, ExportError::HandlerMismatch { .. }));

        let err = Exporter::new(
            CHANNEL,
            Manifest::new(),
            Methods::new().sync("undeclared", |_, _| Ok(Value::Null)),
            ExportConfig::default(),
        )
        .expect_err("undeclared handler should be rejected");
        assert!(matches!(err, ExportError::MethodNotFound(_)));
    }

    #[test]
    fn requires_runtime() {
        let err = Exporter::new(CHANNEL, Manifest::new(), Methods::new(), ExportConfig::default())
            .expect_err("no runtime");
        assert!(matches!(err, ExportError::NoRuntime(_)));
    }

    #[tokio::test]
    async fn denied_call_never_runs_handler() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let exp = exporter(
            Manifest::new().with("disallowedMethod", CallType::Async),
            Methods::new().callback("disallowedMethod", move |_, _, reply| {
                flag.store(true, Ordering::SeqCst);
                reply.ok(true);
            }),
            ExportConfig::default().with_permission(|_, method, _| method != "disallowedMethod"),
        );
        let ep = Arc::new(Recorder::default());

        assert_eq!(exp.handle_message(ep.clone(), call("disallowedMethod", 1, vec![])), None);
        assert!(!ran.load(Ordering::SeqCst));

        let sent = ep.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message_type(), Some(MessageType::AsyncReply));
        let err = RemoteError::from_wire(sent[0].args[0].clone());
        assert!(err.message.contains("Denied access"));
    }

    #[tokio::test]
    async fn dropped_reply_still_answers_once() {
        let exp = exporter(
            Manifest::new().with("forgetful", CallType::Async),
            Methods::new().callback("forgetful", |_, _, _reply| {}),
            ExportConfig::default(),
        );
        let ep = Arc::new(Recorder::default());
        exp.handle_message(ep.clone(), call("forgetful", 2, vec![]));

        let sent = ep.sent();
        assert_eq!(sent.len(), 1);
        assert!(!sent[0].args[0].is_null());
    }

    #[tokio::test]
    async fn promise_panic_rejects() {
        let exp = exporter(
            Manifest::new().with("p", CallType::Promise),
            Methods::new().promise("p", |_, _| async move {
                if true {
                    panic!("inside future");
                }
                Ok(Value::Null)
            }),
            ExportConfig::default(),
        );
        let ep = Arc::new(Recorder::default());
        exp.handle_message(ep.clone(), call("p", 9, vec![]));
        settle().await;

        let sent = ep.sent();
        assert_eq!(sent.len(), 1);
        let err = RemoteError::from_wire(sent[0].args[0].clone());
        assert_eq!(err.message, "inside future");
    }

    #[tokio::test]
    async fn reply_suppressed_after_navigation() {
        let exp = exporter(
            Manifest::new().with("slow", CallType::Promise),
            Methods::new().promise("slow", |_, _| async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(Value::from(1))
            }),
            ExportConfig::default(),
        );
        let ep = Arc::new(Recorder::default());
        exp.handle_message(ep.clone(), call("slow", 1, vec![]));
        ep.navigate();
        settle().await;
        assert!(ep.sent().is_empty());
    }

    #[tokio::test]
    async fn readable_relays_until_end() {
        let exp = exporter(
            Manifest::new().with("goodReadable", CallType::Readable),
            Methods::new().readable("goodReadable", |_, args| {
                let start = args[0].as_i64().unwrap_or(0);
                let stream = Readable::new();
                for n in start..start + 4 {
                    stream.push(n);
                }
                stream.end();
                Ok(stream.into())
            }),
            ExportConfig::default(),
        );
        let ep = Arc::new(Recorder::default());

        let reply = exp.handle_message(ep.clone(), call("goodReadable", 1, vec![serde_json::json!(5)]));
        assert_eq!(reply, Some(SyncReply::ack()));

        let kinds: Vec<_> = ep.sent().iter().filter_map(Message::message_type).collect();
        assert_eq!(
            kinds,
            vec![
                MessageType::StreamData,
                MessageType::StreamData,
                MessageType::StreamData,
                MessageType::StreamData,
                MessageType::StreamEnd,
            ]
        );
        assert_eq!(exp.active_streams(1), 0);
    }

    #[tokio::test]
    async fn missing_and_failing_streams() {
        let exp = exporter(
            Manifest::new()
                .with("noReadable", CallType::Readable)
                .with("exceptionReadable", CallType::Readable)
                .with("lateFailure", CallType::Readable),
            Methods::new()
                .readable("noReadable", |_, _| Ok(StreamReturn::none()))
                .readable("exceptionReadable", |_, _| Err(RemoteError::new("oh no!")))
                .readable("lateFailure", |_, _| {
                    Ok(StreamReturn::deferred(async {
                        Err(RemoteError::new("later"))
                    }))
                }),
            ExportConfig::default(),
        );
        let ep = Arc::new(Recorder::default());

        let reply = exp.handle_message(ep.clone(), call("exceptionReadable", 1, vec![]));
        assert_eq!(reply, Some(SyncReply::Error("oh no!".into())));
        assert!(ep.sent().is_empty());

        let reply = exp.handle_message(ep.clone(), call("noReadable", 2, vec![]));
        assert_eq!(reply, Some(SyncReply::ack()));

        let reply = exp.handle_message(ep.clone(), call("lateFailure", 3, vec![]));
        assert_eq!(reply, Some(SyncReply::ack()));
        settle().await;

        let errors: Vec<_> = ep
            .sent()
            .into_iter()
            .filter(|m| m.message_type() == Some(MessageType::StreamError))
            .map(|m| m.request_id)
            .collect();
        assert_eq!(errors, vec![2, 3]);
    }

    #[tokio::test]
    async fn control_requests_reach_the_stream() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let store = Arc::clone(&received);
        let exp = exporter(
            Manifest::new().with("goodWritable", CallType::Writable),
            Methods::new().writable("goodWritable", move |_, _| {
                let store = Arc::clone(&store);
                Ok(Writable::new(move |chunk| {
                    store.lock().unwrap().push(chunk);
                    Ok(())
                })
                .into())
            }),
            ExportConfig::default(),
        );
        let ep = Arc::new(Recorder::default());
        exp.handle_message(ep.clone(), call("goodWritable", 4, vec![]));

        let write = Message::of_type(MessageType::StreamRequestWrite, 4, vec!["a".into()]);
        assert_eq!(exp.handle_message(ep.clone(), write), Some(SyncReply::ack()));
        let end = Message::of_type(MessageType::StreamRequestEnd, 4, vec![]);
        exp.handle_message(ep.clone(), end);

        // Unknown ids are a no-op but still acknowledged.
        let stray = Message::of_type(MessageType::StreamRequestClose, 99, vec![]);
        assert_eq!(exp.handle_message(ep.clone(), stray), Some(SyncReply::ack()));

        assert_eq!(*received.lock().unwrap(), vec![Value::from("a")]);
        let last = ep.sent().pop().expect("finish should be relayed");
        assert_eq!(last.message_type(), Some(MessageType::StreamFinish));
        assert_eq!(exp.active_streams(1), 0);
    }

    #[tokio::test]
    async fn endpoint_teardown_closes_every_stream() {
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closed);
        let exp = exporter(
            Manifest::new().with("continuousReadable", CallType::Readable),
            Methods::new().readable("continuousReadable", move |_, _| {
                let counter = Arc::clone(&counter);
                Ok(Readable::new()
                    .on_close(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
                    .into())
            }),
            ExportConfig::default(),
        );
        let ep = Arc::new(Recorder::default());
        for id in 1..=3 {
            exp.handle_message(ep.clone(), call("continuousReadable", id, vec![]));
        }
        assert_eq!(exp.active_streams(1), 3);

        ep.destroy();
        assert_eq!(closed.load(Ordering::SeqCst), 3);
        assert_eq!(exp.active_streams(1), 0);
        // Unsubscribed before closing: nothing is relayed.
        assert!(ep.sent().is_empty());
    }

    #[tokio::test]
    async fn deferred_stream_after_destroy_is_closed() {
        let closed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&closed);
        let exp = exporter(
            Manifest::new().with("slowReadable", CallType::Readable),
            Methods::new().readable("slowReadable", move |_, _| {
                let flag = Arc::clone(&flag);
                Ok(StreamReturn::deferred(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(Some(
                        Readable::new().on_close(move || flag.store(true, Ordering::SeqCst)),
                    ))
                }))
            }),
            ExportConfig::default(),
        );
        let ep = Arc::new(Recorder::default());
        exp.handle_message(ep.clone(), call("slowReadable", 1, vec![]));
        ep.destroy();
        settle().await;

        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(exp.active_streams(1), 0);
    }

    fn closable_readable(closed: Arc<AtomicUsize>) -> Methods {
        Methods::new().readable("continuousReadable", move |_, _| {
            let counter = Arc::clone(&closed);
            Ok(Readable::new()
                .on_close(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .into())
        })
    }

    #[tokio::test]
    async fn close_request_releases_the_registration() {
        let closed = Arc::new(AtomicUsize::new(0));
        let exp = exporter(
            Manifest::new().with("continuousReadable", CallType::Readable),
            closable_readable(closed.clone()),
            ExportConfig::default(),
        );
        let ep = Arc::new(Recorder::default());

        for id in 1..=100 {
            exp.handle_message(ep.clone(), call("continuousReadable", id, vec![]));
            let close = Message::of_type(MessageType::StreamRequestClose, id, vec![]);
            assert_eq!(exp.handle_message(ep.clone(), close), Some(SyncReply::ack()));
        }

        assert_eq!(closed.load(Ordering::SeqCst), 100);
        assert_eq!(exp.active_streams(1), 0);
        // The close is relayed once per stream, then the stream goes quiet.
        let closes = ep
            .sent()
            .iter()
            .filter(|m| m.message_type() == Some(MessageType::StreamClose))
            .count();
        assert_eq!(closes, 100);

        let again = Message::of_type(MessageType::StreamRequestClose, 1, vec![]);
        exp.handle_message(ep.clone(), again);
        assert_eq!(closed.load(Ordering::SeqCst), 100);
    }

    #[tokio::test]
    async fn destroyed_listener_is_registered_once_per_endpoint() {
        let closed = Arc::new(AtomicUsize::new(0));
        let exp = exporter(
            Manifest::new().with("continuousReadable", CallType::Readable),
            closable_readable(closed.clone()),
            ExportConfig::default(),
        );
        let ep = Arc::new(Recorder::default());

        for id in 1..=5 {
            exp.handle_message(ep.clone(), call("continuousReadable", id, vec![]));
            assert_eq!(ep.listeners(EndpointEvent::Navigated), 1);
            assert_eq!(ep.listeners(EndpointEvent::Destroyed), 1);
            ep.navigate();
        }
        assert_eq!(closed.load(Ordering::SeqCst), 5);

        exp.handle_message(ep.clone(), call("continuousReadable", 6, vec![]));
        ep.destroy();
        assert_eq!(closed.load(Ordering::SeqCst), 6);
        assert_eq!(exp.active_streams(1), 0);
    }
}
