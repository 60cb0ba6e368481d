use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use ipcbridge_wire::{Message, SyncReply};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Result, TransportError};
use crate::traits::{
    Endpoint, EndpointCallback, EndpointEvent, EndpointId, ExportHandler, ExportTransport,
    ImportHandler, ImportTransport,
};

/// A queued message: channel name plus the encoded message.
type Envelope = (String, Bytes);

fn encode<T: serde::Serialize>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-process loopback transport.
///
/// The bus is the exporter's side of the transport; every [`LocalBus::connect`]
/// produces a [`LocalView`], the importer's side of one endpoint. Messages are
/// encoded to JSON bytes and decoded again on delivery, so values cross the bus
/// exactly as they would cross a process boundary. Asynchronous sends are
/// delivered in order by one task per direction per view.
#[derive(Clone)]
pub struct LocalBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    runtime: Handle,
    next_endpoint: AtomicU64,
    handlers: Mutex<HashMap<String, ExportHandler>>,
}

impl BusInner {
    fn handler(&self, channel: &str) -> Option<ExportHandler> {
        lock(&self.handlers).get(channel).cloned()
    }
}

impl LocalBus {
    /// Create a bus on the current tokio runtime.
    pub fn new() -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| TransportError::NoRuntime(e.to_string()))?;
        Ok(Self::with_runtime(runtime))
    }

    pub fn with_runtime(runtime: Handle) -> Self {
        Self {
            inner: Arc::new(BusInner {
                runtime,
                next_endpoint: AtomicU64::new(1),
                handlers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Connect a new endpoint and return its caller-side view.
    pub fn connect(&self) -> LocalView {
        let id = self.inner.next_endpoint.fetch_add(1, Ordering::Relaxed);

        let (import_tx, import_rx) = mpsc::unbounded_channel();
        let listeners: Listeners = Arc::new(Mutex::new(HashMap::new()));
        let endpoint = Arc::new(LocalEndpoint {
            id,
            destroyed: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            callbacks: Mutex::new(Vec::new()),
            outbox: Mutex::new(Some(import_tx)),
            listeners: Arc::clone(&listeners),
        });
        self.inner
            .runtime
            .spawn(pump_imports(id, import_rx, listeners));

        let (export_tx, export_rx) = mpsc::unbounded_channel();
        self.inner.runtime.spawn(pump_exports(
            Arc::clone(&self.inner),
            Arc::clone(&endpoint),
            export_rx,
        ));

        debug!(endpoint = id, "local endpoint connected");
        LocalView {
            bus: Arc::clone(&self.inner),
            endpoint,
            outbox: export_tx,
        }
    }
}

impl ExportTransport for LocalBus {
    fn on_message(&self, channel: &str, handler: ExportHandler) {
        if lock(&self.inner.handlers)
            .insert(channel.to_string(), handler)
            .is_some()
        {
            warn!(channel, "replacing existing exporter on channel");
        }
    }
}

type Listeners = Arc<Mutex<HashMap<String, Vec<ImportHandler>>>>;

/// The exporter's handle on one connected view.
pub struct LocalEndpoint {
    id: EndpointId,
    destroyed: AtomicBool,
    epoch: AtomicU64,
    callbacks: Mutex<Vec<(EndpointEvent, EndpointCallback)>>,
    outbox: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    listeners: Listeners,
}

impl LocalEndpoint {
    fn take_callbacks(&self, event: EndpointEvent) -> Vec<EndpointCallback> {
        let mut callbacks = lock(&self.callbacks);
        let (fire, keep): (Vec<_>, Vec<_>) = callbacks.drain(..).partition(|(e, _)| *e == event);
        *callbacks = keep;
        fire.into_iter().map(|(_, cb)| cb).collect()
    }

    fn navigate(&self) {
        if self.is_destroyed() {
            return;
        }
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(endpoint = self.id, epoch, "local endpoint navigated");
        for callback in self.take_callbacks(EndpointEvent::Navigated) {
            callback();
        }
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        lock(&self.outbox).take();
        lock(&self.listeners).clear();
        debug!(endpoint = self.id, "local endpoint destroyed");

        let callbacks = std::mem::take(&mut *lock(&self.callbacks));
        for (event, callback) in callbacks {
            if event == EndpointEvent::Destroyed {
                callback();
            }
        }
    }
}

impl Endpoint for LocalEndpoint {
    fn id(&self) -> EndpointId {
        self.id
    }

    fn send(&self, channel: &str, message: Message) -> Result<()> {
        if self.is_destroyed() {
            return Err(TransportError::EndpointDestroyed(self.id));
        }
        let payload = encode(&message)?;
        match lock(&self.outbox).as_ref() {
            Some(tx) => tx
                .send((channel.to_string(), payload))
                .map_err(|_| TransportError::Disconnected),
            None => Err(TransportError::EndpointDestroyed(self.id)),
        }
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn navigation_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn once(&self, event: EndpointEvent, callback: EndpointCallback) {
        let mut callbacks = lock(&self.callbacks);
        if !self.is_destroyed() {
            callbacks.push((event, callback));
            return;
        }
        drop(callbacks);
        // Already gone: a destroy listener fires right away, a navigate
        // listener never will.
        if event == EndpointEvent::Destroyed {
            callback();
        }
    }
}

impl std::fmt::Debug for LocalEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalEndpoint")
            .field("id", &self.id)
            .field("destroyed", &self.is_destroyed())
            .field("epoch", &self.navigation_epoch())
            .finish()
    }
}

/// The caller's side of one endpoint on a [`LocalBus`].
///
/// Dropping the view destroys the endpoint.
pub struct LocalView {
    bus: Arc<BusInner>,
    endpoint: Arc<LocalEndpoint>,
    outbox: mpsc::UnboundedSender<Envelope>,
}

impl LocalView {
    pub fn id(&self) -> EndpointId {
        self.endpoint.id
    }

    /// The exporter-side handle of this view.
    pub fn endpoint(&self) -> Arc<LocalEndpoint> {
        Arc::clone(&self.endpoint)
    }

    /// Simulate a reload: bump the epoch and fire `Navigated` listeners.
    pub fn navigate(&self) {
        self.endpoint.navigate();
    }

    /// Simulate the view going away: fire `Destroyed` listeners and stop delivery.
    pub fn destroy(&self) {
        self.endpoint.destroy();
    }

    pub fn is_destroyed(&self) -> bool {
        self.endpoint.is_destroyed()
    }
}

impl ImportTransport for LocalView {
    fn send(&self, channel: &str, message: Message) -> Result<()> {
        if self.is_destroyed() {
            return Err(TransportError::EndpointDestroyed(self.id()));
        }
        let payload = encode(&message)?;
        self.outbox
            .send((channel.to_string(), payload))
            .map_err(|_| TransportError::Disconnected)
    }

    fn send_sync(&self, channel: &str, message: Message) -> Result<SyncReply> {
        if self.is_destroyed() {
            return Err(TransportError::EndpointDestroyed(self.id()));
        }
        let handler = self
            .bus
            .handler(channel)
            .ok_or_else(|| TransportError::NoHandler(channel.to_string()))?;

        let method = message.name.clone();
        let message: Message = serde_json::from_slice(&encode(&message)?)?;
        let endpoint: Arc<dyn Endpoint> = self.endpoint.clone();
        let reply = handler(endpoint, message).ok_or_else(|| {
            TransportError::NoReply {
                channel: channel.to_string(),
                method,
            }
        })?;
        Ok(serde_json::from_slice(&encode(&reply)?)?)
    }

    fn on_message(&self, channel: &str, handler: ImportHandler) {
        lock(&self.endpoint.listeners)
            .entry(channel.to_string())
            .or_default()
            .push(handler);
    }
}

impl Drop for LocalView {
    fn drop(&mut self) {
        self.endpoint.destroy();
    }
}

async fn pump_exports(
    bus: Arc<BusInner>,
    endpoint: Arc<LocalEndpoint>,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
) {
    while let Some((channel, payload)) = rx.recv().await {
        if endpoint.is_destroyed() {
            break;
        }
        let message: Message = match serde_json::from_slice(&payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, channel, "dropping undecodable message");
                continue;
            }
        };
        let Some(handler) = bus.handler(&channel) else {
            warn!(channel, method = %message.name, "no exporter on channel; dropping message");
            continue;
        };
        let target: Arc<dyn Endpoint> = endpoint.clone();
        let _ = handler(target, message);
    }
    debug!(endpoint = endpoint.id, "export pump stopped");
}

async fn pump_imports(
    endpoint: EndpointId,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    listeners: Listeners,
) {
    while let Some((channel, payload)) = rx.recv().await {
        let message: Message = match serde_json::from_slice(&payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, channel, "dropping undecodable message");
                continue;
            }
        };
        let handlers = lock(&listeners).get(&channel).cloned().unwrap_or_default();
        if handlers.is_empty() {
            debug!(endpoint, channel, "no listener on channel; dropping message");
        }
        for handler in handlers {
            handler(message.clone());
        }
    }
    debug!(endpoint, "import pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use ipcbridge_wire::MessageType;

    const CHANNEL: &str = "test";

    /// Exporter that answers sync sends with the request id and echoes async
    /// sends back to the caller as an `async-reply`.
    fn echo_bus() -> LocalBus {
        let bus = LocalBus::new().expect("bus should be created inside a runtime");
        bus.on_message(
            CHANNEL,
            Arc::new(|endpoint: Arc<dyn Endpoint>, msg: Message| {
                let reply = Message::of_type(MessageType::AsyncReply, msg.request_id, msg.args);
                endpoint.send(CHANNEL, reply).expect("echo should send");
                Some(SyncReply::Success(msg.request_id.into()))
            }),
        );
        bus
    }

    #[tokio::test]
    async fn async_send_round_trips_in_order() {
        let bus = echo_bus();
        let view = bus.connect();
        let (tx, mut rx) = mpsc::unbounded_channel();
        view.on_message(
            CHANNEL,
            Arc::new(move |msg: Message| {
                let _ = tx.send(msg.request_id);
            }),
        );

        for id in 1..=3 {
            view.send(CHANNEL, Message::new("m", id, Vec::new()))
                .expect("send should succeed");
        }
        for id in 1..=3 {
            let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("reply should arrive");
            assert_eq!(got, Some(id));
        }
    }

    #[tokio::test]
    async fn send_sync_returns_immediate_reply() {
        let bus = echo_bus();
        let view = bus.connect();
        let reply = view
            .send_sync(CHANNEL, Message::new("m", 0, Vec::new()))
            .expect("sync send should succeed");
        assert_eq!(reply, SyncReply::Success(serde_json::json!(0)));

        let err = view
            .send_sync("elsewhere", Message::new("m", 0, Vec::new()))
            .expect_err("unknown channel should fail");
        assert!(matches!(err, TransportError::NoHandler(_)));
    }

    #[tokio::test]
    async fn navigation_bumps_epoch_and_fires_once() {
        let bus = echo_bus();
        let view = bus.connect();
        let endpoint = view.endpoint();
        let fired = Arc::new(AtomicU64::new(0));

        let counter = Arc::clone(&fired);
        endpoint.once(
            EndpointEvent::Navigated,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        view.navigate();
        view.navigate();
        assert_eq!(endpoint.navigation_epoch(), 2);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn destroy_stops_delivery_and_fires_listeners() {
        let bus = echo_bus();
        let view = bus.connect();
        let endpoint = view.endpoint();
        let fired = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&fired);
        endpoint.once(
            EndpointEvent::Destroyed,
            Box::new(move || flag.store(true, Ordering::SeqCst)),
        );

        drop(view);
        assert!(fired.load(Ordering::SeqCst));
        assert!(endpoint.is_destroyed());
        assert!(matches!(
            endpoint.send(CHANNEL, Message::new("x", 1, Vec::new())),
            Err(TransportError::EndpointDestroyed(_))
        ));

        // Late listeners on a dead endpoint still hear about it.
        let late = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&late);
        endpoint.once(
            EndpointEvent::Destroyed,
            Box::new(move || flag.store(true, Ordering::SeqCst)),
        );
        assert!(late.load(Ordering::SeqCst));
    }

    #[test]
    fn requires_runtime() {
        assert!(matches!(LocalBus::new(), Err(TransportError::NoRuntime(_))));
    }
}
