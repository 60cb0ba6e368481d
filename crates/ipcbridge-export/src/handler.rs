use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_core::future::BoxFuture;
use ipcbridge_wire::{CallType, RemoteError, Value};

use crate::context::{CallContext, Reply};
use crate::stream::{Duplex, Readable, Writable};

/// Outcome of a value-returning handler.
pub type HandlerResult = Result<Value, RemoteError>;

pub type SyncFn = Arc<dyn Fn(&CallContext, Vec<Value>) -> HandlerResult + Send + Sync>;
pub type AsyncFn = Arc<dyn Fn(&CallContext, Vec<Value>, Reply) + Send + Sync>;
pub type PromiseFn =
    Arc<dyn Fn(&CallContext, Vec<Value>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;
pub type StreamFn<S> =
    Arc<dyn Fn(&CallContext, Vec<Value>) -> Result<StreamReturn<S>, RemoteError> + Send + Sync>;

/// What a stream handler hands back.
pub enum StreamReturn<S> {
    /// The stream, or `None` when the handler has nothing to offer.
    Ready(Option<S>),
    /// A stream that becomes available later.
    Deferred(BoxFuture<'static, Result<Option<S>, RemoteError>>),
}

impl<S> StreamReturn<S> {
    pub fn none() -> Self {
        StreamReturn::Ready(None)
    }

    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = Result<Option<S>, RemoteError>> + Send + 'static,
    {
        StreamReturn::Deferred(Box::pin(future))
    }
}

impl<S> From<S> for StreamReturn<S> {
    fn from(stream: S) -> Self {
        StreamReturn::Ready(Some(stream))
    }
}

impl<S> fmt::Debug for StreamReturn<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamReturn::Ready(stream) => f
                .debug_tuple("Ready")
                .field(&stream.as_ref().map(|_| ".."))
                .finish(),
            StreamReturn::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// A bound method implementation, one variant per call type.
#[derive(Clone)]
pub enum Handler {
    Sync(SyncFn),
    Async(AsyncFn),
    Promise(PromiseFn),
    Readable(StreamFn<Readable>),
    Writable(StreamFn<Writable>),
    Duplex(StreamFn<Duplex>),
}

impl Handler {
    pub fn call_type(&self) -> CallType {
        match self {
            Handler::Sync(_) => CallType::Sync,
            Handler::Async(_) => CallType::Async,
            Handler::Promise(_) => CallType::Promise,
            Handler::Readable(_) => CallType::Readable,
            Handler::Writable(_) => CallType::Writable,
            Handler::Duplex(_) => CallType::Duplex,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler::{}", self.call_type())
    }
}

/// The method table an exporter serves.
///
/// ```ignore
/// let methods = Methods::new()
///     .sync("addOneSync", |_, args| Ok(Value::from(args[0].as_i64().unwrap_or(0) + 1)))
///     .promise("addOnePromise", |_, args| async move {
///         Ok(Value::from(args[0].as_i64().unwrap_or(0) + 1))
///     });
/// ```
#[derive(Clone, Default)]
pub struct Methods {
    handlers: HashMap<String, Handler>,
}

impl Methods {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sync<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&CallContext, Vec<Value>) -> HandlerResult + Send + Sync + 'static,
    {
        self.with(name, Handler::Sync(Arc::new(f)))
    }

    /// Callback-style handler. It must consume the [`Reply`] exactly once.
    pub fn callback<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&CallContext, Vec<Value>, Reply) + Send + Sync + 'static,
    {
        self.with(name, Handler::Async(Arc::new(f)))
    }

    pub fn promise<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let f = Arc::new(f);
        self.with(
            name,
            Handler::Promise(Arc::new(move |ctx: &CallContext, args: Vec<Value>| {
                Box::pin(f(ctx, args)) as BoxFuture<'static, HandlerResult>
            })),
        )
    }

    pub fn readable<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&CallContext, Vec<Value>) -> Result<StreamReturn<Readable>, RemoteError>
            + Send
            + Sync
            + 'static,
    {
        self.with(name, Handler::Readable(Arc::new(f)))
    }

    pub fn writable<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&CallContext, Vec<Value>) -> Result<StreamReturn<Writable>, RemoteError>
            + Send
            + Sync
            + 'static,
    {
        self.with(name, Handler::Writable(Arc::new(f)))
    }

    pub fn duplex<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&CallContext, Vec<Value>) -> Result<StreamReturn<Duplex>, RemoteError>
            + Send
            + Sync
            + 'static,
    {
        self.with(name, Handler::Duplex(Arc::new(f)))
    }

    /// Bind a prebuilt handler.
    pub fn with(mut self, name: impl Into<String>, handler: Handler) -> Self {
        self.insert(name, handler);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, handler: Handler) -> Option<Handler> {
        self.handlers.insert(name.into(), handler)
    }

    pub fn get(&self, name: &str) -> Option<&Handler> {
        self.handlers.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Handler)> {
        self.handlers.iter().map(|(name, h)| (name.as_str(), h))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for Methods {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.handlers.iter()).finish()
    }
}
