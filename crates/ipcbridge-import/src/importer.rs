use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe, Location};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use ipcbridge_transport::ImportTransport;
use ipcbridge_wire::{
    marshal_args, wire_to_value, CallType, Manifest, Message, MessageType, RemoteError,
    StreamEvent, StreamState, SyncReply, Value,
};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::config::ImportConfig;
use crate::error::{CallError, ImportError, Result};
use crate::method::RemoteMethod;
use crate::stream::ImportedStream;

pub(crate) type CallSite = &'static Location<'static>;
pub(crate) type Completion = Box<dyn FnOnce(std::result::Result<Value, CallError>) + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct PendingCall {
    complete: Completion,
    timer: Option<AbortHandle>,
    call_site: CallSite,
}

struct StreamSlot {
    tx: mpsc::UnboundedSender<StreamEvent>,
    state: StreamState,
    call_site: CallSite,
}

/// Import the methods of `manifest` from `channel` with the default configuration.
pub fn import_api(
    transport: Arc<dyn ImportTransport>,
    channel: &str,
    manifest: Manifest,
) -> Result<Importer> {
    import_api_with_config(transport, channel, manifest, ImportConfig::default())
}

/// Import the methods of `manifest` from `channel`.
///
/// Must be called inside a tokio runtime; timeout timers run on it.
pub fn import_api_with_config(
    transport: Arc<dyn ImportTransport>,
    channel: &str,
    manifest: Manifest,
    config: ImportConfig,
) -> Result<Importer> {
    manifest.validate()?;
    let runtime = Handle::try_current().map_err(|e| ImportError::NoRuntime(e.to_string()))?;

    let inner = Arc::new(Inner {
        channel: Arc::from(channel),
        manifest,
        config,
        transport,
        runtime,
        next_request: AtomicU64::new(1),
        pending: Mutex::new(HashMap::new()),
        streams: Mutex::new(HashMap::new()),
    });

    let weak: Weak<Inner> = Arc::downgrade(&inner);
    inner.transport.on_message(
        channel,
        Arc::new(move |message: Message| {
            if let Some(inner) = weak.upgrade() {
                inner.dispatch(message);
            }
        }),
    );
    debug!(channel, methods = inner.manifest.len(), "importer bound");

    Ok(Importer { inner })
}

/// The calling side of a channel.
///
/// Holds one [`RemoteMethod`] per manifest entry. Cloning is cheap; clones
/// share the pending-call and stream tables.
#[derive(Clone)]
pub struct Importer {
    pub(crate) inner: Arc<Inner>,
}

impl Importer {
    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    pub fn manifest(&self) -> &Manifest {
        &self.inner.manifest
    }

    /// The callable for `name`, if the manifest declares it.
    pub fn method(&self, name: &str) -> Option<RemoteMethod> {
        let call_type = self.inner.manifest.get(name)?;
        Some(RemoteMethod::new(self.clone(), name, call_type))
    }

    pub fn methods(&self) -> impl Iterator<Item = RemoteMethod> + '_ {
        self.inner
            .manifest
            .iter()
            .map(|(name, call_type)| RemoteMethod::new(self.clone(), name, call_type))
    }

    /// Async and promise calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Streams that have not reached a terminal event.
    pub fn open_streams(&self) -> usize {
        lock(&self.inner.streams).len()
    }

    /// Call a `sync` method by name.
    #[track_caller]
    pub fn call_sync(
        &self,
        name: &str,
        args: Vec<Value>,
    ) -> std::result::Result<Value, CallError> {
        let call_site = Location::caller();
        match self.method(name) {
            Some(method) => method.sync_at(args, call_site),
            None => Err(CallError::MethodNotFound(name.to_string())),
        }
    }

    /// Call an `async` method by name. `callback` runs exactly once.
    #[track_caller]
    pub fn call_async<F>(&self, name: &str, args: Vec<Value>, callback: F)
    where
        F: FnOnce(std::result::Result<Value, CallError>) + Send + 'static,
    {
        let call_site = Location::caller();
        match self.method(name) {
            Some(method) => method.async_at(args, Box::new(callback), call_site),
            None => callback(Err(CallError::MethodNotFound(name.to_string()))),
        }
    }

    /// Call a `promise` method by name. The request is sent immediately.
    #[track_caller]
    pub fn call(
        &self,
        name: &str,
        args: Vec<Value>,
    ) -> impl std::future::Future<Output = std::result::Result<Value, CallError>> + Send + 'static
    {
        let call_site = Location::caller();
        let receiver = match self.method(name) {
            Some(method) => method.promise_at(args, call_site),
            None => Err(CallError::MethodNotFound(name.to_string())),
        };
        crate::method::await_reply(receiver)
    }

    /// Open a `readable`, `writable` or `duplex` method by name.
    #[track_caller]
    pub fn open_stream(
        &self,
        name: &str,
        args: Vec<Value>,
    ) -> std::result::Result<ImportedStream, CallError> {
        let call_site = Location::caller();
        match self.method(name) {
            Some(method) => method.open_at(args, call_site),
            None => Err(CallError::MethodNotFound(name.to_string())),
        }
    }
}

impl fmt::Debug for Importer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Importer")
            .field("channel", &self.inner.channel)
            .field("manifest", &self.inner.manifest)
            .field("pending", &self.pending_calls())
            .field("streams", &self.open_streams())
            .finish()
    }
}

pub(crate) struct Inner {
    channel: Arc<str>,
    manifest: Manifest,
    config: ImportConfig,
    transport: Arc<dyn ImportTransport>,
    runtime: Handle,
    next_request: AtomicU64,
    pending: Mutex<HashMap<u64, PendingCall>>,
    streams: Mutex<HashMap<u64, StreamSlot>>,
}

impl Inner {
    fn next_request_id(&self) -> u64 {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn send_sync(
        &self,
        method: &str,
        args: &[Value],
        call_site: CallSite,
    ) -> std::result::Result<Value, CallError> {
        let message = Message::new(method, 0, marshal_args(args));
        match self.transport.send_sync(&self.channel, message)? {
            SyncReply::Success(value) => Ok(wire_to_value(value)),
            SyncReply::Error(message) => Err(CallError::Remote(
                self.reconstruct(RemoteError::new(message), call_site),
            )),
        }
    }

    /// Start an async or promise call; `complete` runs exactly once.
    pub(crate) fn begin(
        self: &Arc<Self>,
        method: &str,
        args: &[Value],
        complete: Completion,
        call_site: CallSite,
    ) {
        let request_id = self.next_request_id();
        lock(&self.pending).insert(
            request_id,
            PendingCall {
                complete,
                timer: None,
                call_site,
            },
        );

        if let Some(timeout) = self.config.effective_timeout() {
            let weak = Arc::downgrade(self);
            let timer = self.runtime.spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(inner) = weak.upgrade() {
                    debug!(request_id, ?timeout, "call timed out");
                    inner.settle(request_id, Err(CallError::Timeout(timeout)));
                }
            });
            match lock(&self.pending).get_mut(&request_id) {
                Some(call) => call.timer = Some(timer.abort_handle()),
                None => timer.abort(),
            }
        }

        let message = Message::new(method, request_id, marshal_args(args));
        if let Err(e) = self.transport.send(&self.channel, message) {
            self.settle(request_id, Err(CallError::Transport(e)));
        }
    }

    /// Complete a pending call. Unknown or already-settled ids are ignored.
    fn settle(&self, request_id: u64, result: std::result::Result<Value, CallError>) {
        let Some(call) = lock(&self.pending).remove(&request_id) else {
            debug!(request_id, "reply for a request that is not waiting; ignoring");
            return;
        };
        if let Some(timer) = call.timer {
            timer.abort();
        }

        let result = result.map_err(|e| match e {
            CallError::Remote(remote) => CallError::Remote(self.reconstruct(remote, call.call_site)),
            other => other,
        });
        let complete = call.complete;
        if catch_unwind(AssertUnwindSafe(move || complete(result))).is_err() {
            warn!(request_id, "call completion panicked");
        }
    }

    /// Register the local end of a stream, then ask the exporter to open it.
    pub(crate) fn open(
        self: &Arc<Self>,
        method: &str,
        call_type: CallType,
        args: &[Value],
        call_site: CallSite,
    ) -> std::result::Result<ImportedStream, CallError> {
        let request_id = self.next_request_id();
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.streams).insert(
            request_id,
            StreamSlot {
                tx,
                state: StreamState::opened(call_type),
                call_site,
            },
        );

        let message = Message::new(method, request_id, marshal_args(args));
        let failure = match self.transport.send_sync(&self.channel, message) {
            Ok(SyncReply::Success(_)) => None,
            Ok(SyncReply::Error(message)) => Some(CallError::Remote(
                self.reconstruct(RemoteError::new(message), call_site),
            )),
            Err(e) => Some(CallError::Transport(e)),
        };
        if let Some(err) = failure {
            lock(&self.streams).remove(&request_id);
            return Err(err);
        }

        debug!(method, request_id, %call_type, "stream opened");
        Ok(ImportedStream::new(
            Arc::clone(self),
            request_id,
            call_type,
            rx,
        ))
    }

    /// Send a control request for an open stream.
    pub(crate) fn control(
        &self,
        request_id: u64,
        request: MessageType,
        args: Vec<serde_json::Value>,
    ) -> std::result::Result<(), CallError> {
        let open = lock(&self.streams)
            .get(&request_id)
            .map(|slot| match request {
                MessageType::StreamRequestWrite | MessageType::StreamRequestEnd => {
                    slot.state.writable_open()
                }
                _ => !slot.state.is_terminal(),
            })
            .unwrap_or(false);
        if !open {
            return Err(CallError::StreamClosed);
        }
        self.transport
            .send(&self.channel, Message::of_type(request, request_id, args))?;
        Ok(())
    }

    /// Forget a stream. Returns whether it was still open.
    pub(crate) fn release(&self, request_id: u64) -> bool {
        lock(&self.streams).remove(&request_id).is_some()
    }

    /// Close a stream from this side. The slot is dropped at once and the
    /// local reader sees `Close` after whatever was already queued. Returns
    /// whether it was still open.
    pub(crate) fn close_local(&self, request_id: u64) -> bool {
        let Some(slot) = lock(&self.streams).remove(&request_id) else {
            return false;
        };
        let _ = slot.tx.send(StreamEvent::Close);
        debug!(request_id, state = ?slot.state.close(), "stream closed locally");
        true
    }

    pub(crate) fn request_close(&self, request_id: u64) -> std::result::Result<(), CallError> {
        let message = Message::of_type(MessageType::StreamRequestClose, request_id, Vec::new());
        self.transport.send(&self.channel, message)?;
        Ok(())
    }

    fn dispatch(&self, message: Message) {
        match message.message_type() {
            Some(MessageType::AsyncReply) => {
                let request_id = message.request_id;
                let mut args = message.args.into_iter();
                let err = args.next().unwrap_or_default();
                let result = if err.is_null() {
                    Ok(wire_to_value(args.next().unwrap_or_default()))
                } else {
                    Err(CallError::Remote(RemoteError::from_wire(err)))
                };
                self.settle(request_id, result);
            }
            Some(msg_type) if msg_type.is_stream_event() => {
                let request_id = message.request_id;
                if let Some(event) = StreamEvent::from_message(message) {
                    self.route(request_id, event);
                }
            }
            _ => {
                debug!(
                    message = %message.name,
                    request_id = message.request_id,
                    "unexpected message on import channel"
                );
            }
        }
    }

    fn route(&self, request_id: u64, event: StreamEvent) {
        let (forward, tx, call_site) = {
            let mut streams = lock(&self.streams);
            let Some(slot) = streams.get_mut(&request_id) else {
                debug!(request_id, event = %event.message_type(), "event for unknown stream; ignoring");
                return;
            };
            let transition = slot.state.on_event(&event);
            slot.state = transition.next;
            let routed = (transition.forward, slot.tx.clone(), slot.call_site);
            if transition.terminal {
                streams.remove(&request_id);
            }
            routed
        };

        if !forward {
            return;
        }
        let event = match event {
            StreamEvent::Error(remote) => StreamEvent::Error(self.reconstruct(remote, call_site)),
            other => other,
        };
        // The receiver is gone once the local stream is dropped.
        let _ = tx.send(event);
    }

    /// Splice the remote stack onto the local call site and attach a typed
    /// error when the name is registered.
    fn reconstruct(&self, mut remote: RemoteError, call_site: CallSite) -> RemoteError {
        let first = remote.first_stack_line();
        remote.stack = Some(format!(
            "{first}\n    at {}:{}:{}",
            call_site.file(),
            call_site.line(),
            call_site.column()
        ));
        if let Some(constructor) = self.config.errors.get(&remote.name) {
            let typed = constructor(&remote);
            remote.set_typed(typed);
        }
        remote
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let pending: Vec<(u64, PendingCall)> = lock(&self.pending).drain().collect();
        if !pending.is_empty() {
            debug!(count = pending.len(), "importer dropped; canceling pending calls");
        }
        for (request_id, call) in pending {
            if let Some(timer) = call.timer {
                timer.abort();
            }
            let complete = call.complete;
            if catch_unwind(AssertUnwindSafe(move || complete(Err(CallError::Canceled)))).is_err() {
                warn!(request_id, "call completion panicked");
            }
        }
    }
}
