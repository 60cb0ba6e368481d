//! Streams returned by `readable`, `writable` and `duplex` handlers.
//!
//! A handler creates one of [`Readable`], [`Writable`] or [`Duplex`], hands
//! it back, and keeps a clone to produce or consume data. Every event the
//! stream emits goes through its emitter: until the exporter subscribes, events
//! are buffered, and they are flushed in order on subscription.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use ipcbridge_wire::{CallType, RemoteError, StreamEvent, Value};
use tracing::debug;

pub(crate) type EventSink = Box<dyn FnMut(StreamEvent) + Send>;
type Hook = Box<dyn FnOnce() + Send>;
type WriteFn = Box<dyn FnMut(Value) -> Result<(), RemoteError> + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Result of a control operation on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Applied,
    Unsupported,
}

/// Control surface the exporter drives on behalf of the caller.
///
/// Every operation defaults to [`Control::Unsupported`]; [`force_close`] walks
/// `close`, then `destroy`, then `end`, stopping at the first one applied.
pub trait StreamOps: Send + Sync {
    fn close(&self) -> Control {
        Control::Unsupported
    }

    fn destroy(&self) -> Control {
        Control::Unsupported
    }

    fn end(&self) -> Control {
        Control::Unsupported
    }

    fn write(&self, _chunk: Value) -> Control {
        Control::Unsupported
    }
}

/// Close a stream with the first operation it supports.
pub fn force_close(stream: &dyn StreamOps) -> Control {
    if stream.close() == Control::Applied
        || stream.destroy() == Control::Applied
        || stream.end() == Control::Applied
    {
        Control::Applied
    } else {
        Control::Unsupported
    }
}

/// Close a stream on request: `close`, falling back to `destroy`.
pub(crate) fn request_close(stream: &dyn StreamOps) -> Control {
    match stream.close() {
        Control::Applied => Control::Applied,
        Control::Unsupported => stream.destroy(),
    }
}

#[derive(Default)]
struct EmitterState {
    sink: Option<EventSink>,
    buffered: VecDeque<StreamEvent>,
    flushing: bool,
    detached: bool,
}

/// Event fan-in shared by the halves of one stream.
struct Emitter {
    state: Mutex<EmitterState>,
}

impl Emitter {
    fn new() -> Self {
        Self {
            state: Mutex::new(EmitterState::default()),
        }
    }

    fn emit(&self, event: StreamEvent) {
        let mut state = lock(&self.state);
        if state.detached {
            return;
        }
        state.buffered.push_back(event);
        self.flush(state);
    }

    fn subscribe(&self, sink: EventSink) {
        let mut state = lock(&self.state);
        if state.detached {
            return;
        }
        state.sink = Some(sink);
        self.flush(state);
    }

    fn unsubscribe(&self) {
        let mut state = lock(&self.state);
        state.detached = true;
        state.sink = None;
        state.buffered.clear();
    }

    #[cfg(test)]
    fn is_subscribed(&self) -> bool {
        lock(&self.state).sink.is_some()
    }

    // The sink runs without the lock held. Re-entrant emits only queue; the
    // outermost flush delivers them, so order is preserved.
    fn flush<'a>(&'a self, mut state: MutexGuard<'a, EmitterState>) {
        if state.flushing {
            return;
        }
        state.flushing = true;
        loop {
            if state.detached {
                break;
            }
            let Some(mut sink) = state.sink.take() else {
                break;
            };
            let Some(event) = state.buffered.pop_front() else {
                state.sink = Some(sink);
                break;
            };
            drop(state);
            sink(event);
            state = lock(&self.state);
            if !state.detached && state.sink.is_none() {
                state.sink = Some(sink);
            }
        }
        state.flushing = false;
    }
}

/// State shared by every half of one stream.
struct Shared {
    emitter: Emitter,
    destroyed: AtomicBool,
    on_close: Mutex<Option<Hook>>,
}

impl Shared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            emitter: Emitter::new(),
            destroyed: AtomicBool::new(false),
            on_close: Mutex::new(None),
        })
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let hook = lock(&self.on_close).take();
        if let Some(hook) = hook {
            hook();
        }
        self.emitter.emit(StreamEvent::Close);
    }

    fn set_on_close(&self, hook: Hook) {
        *lock(&self.on_close) = Some(hook);
    }
}

/// A stream of values flowing to the caller.
#[derive(Clone)]
pub struct Readable {
    shared: Arc<Shared>,
    ended: Arc<AtomicBool>,
}

impl Readable {
    pub fn new() -> Self {
        Self::with_shared(Shared::new())
    }

    fn with_shared(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            ended: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Queue a chunk for the caller. Returns `false` once the stream has ended.
    pub fn push(&self, chunk: impl Into<Value>) -> bool {
        if self.ended.load(Ordering::SeqCst) || self.shared.destroyed.load(Ordering::SeqCst) {
            return false;
        }
        self.shared.emitter.emit(StreamEvent::Data(chunk.into()));
        true
    }

    /// Signal that no more data follows.
    pub fn end(&self) {
        if !self.ended.swap(true, Ordering::SeqCst) {
            self.shared.emitter.emit(StreamEvent::End);
        }
    }

    /// Fail the stream; the caller sees an error event.
    pub fn fail(&self, err: impl Into<RemoteError>) {
        self.ended.store(true, Ordering::SeqCst);
        self.shared.emitter.emit(StreamEvent::Error(err.into()));
    }

    pub fn notify_readable(&self) {
        if !self.is_ended() {
            self.shared.emitter.emit(StreamEvent::Readable);
        }
    }

    /// Tear down the underlying resource: runs the close hook, emits `Close`.
    pub fn destroy(&self) {
        self.ended.store(true, Ordering::SeqCst);
        self.shared.destroy();
    }

    /// Run `hook` when the stream is destroyed.
    pub fn on_close(self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.shared.set_on_close(Box::new(hook));
        self
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }
}

impl Default for Readable {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamOps for Readable {
    fn destroy(&self) -> Control {
        Readable::destroy(self);
        Control::Applied
    }
}

impl fmt::Debug for Readable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Readable")
            .field("ended", &self.is_ended())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

struct WriteState {
    // Taken out while a write runs so the callback can reach its own stream.
    write: Option<WriteFn>,
    on_finish: Option<Hook>,
}

/// A sink for values written by the caller.
#[derive(Clone)]
pub struct Writable {
    shared: Arc<Shared>,
    finished: Arc<AtomicBool>,
    inner: Arc<Mutex<WriteState>>,
}

impl Writable {
    /// `write` receives every chunk the caller writes. Returning an error fails
    /// the stream.
    pub fn new<F>(write: F) -> Self
    where
        F: FnMut(Value) -> Result<(), RemoteError> + Send + 'static,
    {
        Self::with_shared(Shared::new(), Box::new(write))
    }

    fn with_shared(shared: Arc<Shared>, write: WriteFn) -> Self {
        Self {
            shared,
            finished: Arc::new(AtomicBool::new(false)),
            inner: Arc::new(Mutex::new(WriteState {
                write: Some(write),
                on_finish: None,
            })),
        }
    }

    pub fn write(&self, chunk: impl Into<Value>) -> Result<(), RemoteError> {
        if self.is_finished() || self.is_destroyed() {
            return Err(RemoteError::new("write after end"));
        }
        let Some(mut write) = lock(&self.inner).write.take() else {
            return Err(RemoteError::new("write already in progress"));
        };
        let result = write(chunk.into());
        lock(&self.inner).write = Some(write);
        if let Err(err) = &result {
            self.fail(err.clone());
        }
        result
    }

    /// Finish the stream: runs the finish hook, then emits `Finish`.
    pub fn end(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let hook = lock(&self.inner).on_finish.take();
        if let Some(hook) = hook {
            hook();
        }
        self.shared.emitter.emit(StreamEvent::Finish);
    }

    pub fn fail(&self, err: impl Into<RemoteError>) {
        self.finished.store(true, Ordering::SeqCst);
        self.shared.emitter.emit(StreamEvent::Error(err.into()));
    }

    /// Tell the caller the write buffer drained.
    pub fn notify_drain(&self) {
        if !self.is_finished() {
            self.shared.emitter.emit(StreamEvent::Drain);
        }
    }

    pub fn destroy(&self) {
        self.finished.store(true, Ordering::SeqCst);
        self.shared.destroy();
    }

    /// Run `hook` once all writes are done, before `Finish` is emitted.
    pub fn on_finish(self, hook: impl FnOnce() + Send + 'static) -> Self {
        lock(&self.inner).on_finish = Some(Box::new(hook));
        self
    }

    pub fn on_close(self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.shared.set_on_close(Box::new(hook));
        self
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }
}

impl StreamOps for Writable {
    fn destroy(&self) -> Control {
        Writable::destroy(self);
        Control::Applied
    }

    fn end(&self) -> Control {
        Writable::end(self);
        Control::Applied
    }

    fn write(&self, chunk: Value) -> Control {
        if let Err(err) = Writable::write(self, chunk) {
            debug!(error = %err, "stream write rejected");
        }
        Control::Applied
    }
}

impl fmt::Debug for Writable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writable")
            .field("finished", &self.is_finished())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// A writable and a readable joined into one stream.
///
/// Both halves share one emitter and one close hook; the caller sees a single
/// stream that ends once both halves are done.
#[derive(Clone)]
pub struct Duplex {
    readable: Readable,
    writable: Writable,
}

impl Duplex {
    pub fn new<F>(write: F) -> Self
    where
        F: FnMut(Value) -> Result<(), RemoteError> + Send + 'static,
    {
        let shared = Shared::new();
        Self {
            readable: Readable::with_shared(Arc::clone(&shared)),
            writable: Writable::with_shared(shared, Box::new(write)),
        }
    }

    pub fn readable(&self) -> &Readable {
        &self.readable
    }

    pub fn writable(&self) -> &Writable {
        &self.writable
    }

    pub fn push(&self, chunk: impl Into<Value>) -> bool {
        self.readable.push(chunk)
    }

    pub fn fail(&self, err: impl Into<RemoteError>) {
        self.readable.ended.store(true, Ordering::SeqCst);
        self.writable.fail(err);
    }

    pub fn destroy(&self) {
        self.readable.ended.store(true, Ordering::SeqCst);
        self.writable.destroy();
    }

    pub fn on_finish(self, hook: impl FnOnce() + Send + 'static) -> Self {
        Self {
            writable: self.writable.on_finish(hook),
            ..self
        }
    }

    pub fn on_close(self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.readable.shared.set_on_close(Box::new(hook));
        self
    }
}

impl StreamOps for Duplex {
    fn destroy(&self) -> Control {
        Duplex::destroy(self);
        Control::Applied
    }

    fn end(&self) -> Control {
        self.writable.end();
        Control::Applied
    }

    fn write(&self, chunk: Value) -> Control {
        StreamOps::write(&self.writable, chunk)
    }
}

impl fmt::Debug for Duplex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Duplex")
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .finish()
    }
}

/// A stream returned by a handler, as the exporter tracks it.
#[derive(Clone, Debug)]
pub(crate) enum ExportStream {
    Readable(Readable),
    Writable(Writable),
    Duplex(Duplex),
}

impl ExportStream {
    fn shared(&self) -> &Shared {
        match self {
            ExportStream::Readable(r) => &r.shared,
            ExportStream::Writable(w) => &w.shared,
            ExportStream::Duplex(d) => &d.writable.shared,
        }
    }

    pub(crate) fn call_type(&self) -> CallType {
        match self {
            ExportStream::Readable(_) => CallType::Readable,
            ExportStream::Writable(_) => CallType::Writable,
            ExportStream::Duplex(_) => CallType::Duplex,
        }
    }

    pub(crate) fn ops(&self) -> &dyn StreamOps {
        match self {
            ExportStream::Readable(r) => r,
            ExportStream::Writable(w) => w,
            ExportStream::Duplex(d) => d,
        }
    }

    pub(crate) fn subscribe(&self, sink: EventSink) {
        self.shared().emitter.subscribe(sink);
    }

    pub(crate) fn unsubscribe(&self) {
        self.shared().emitter.unsubscribe();
    }

    #[cfg(test)]
    pub(crate) fn is_subscribed(&self) -> bool {
        self.shared().emitter.is_subscribed()
    }
}

impl From<Readable> for ExportStream {
    fn from(stream: Readable) -> Self {
        ExportStream::Readable(stream)
    }
}

impl From<Writable> for ExportStream {
    fn from(stream: Writable) -> Self {
        ExportStream::Writable(stream)
    }
}

impl From<Duplex> for ExportStream {
    fn from(stream: Duplex) -> Self {
        ExportStream::Duplex(stream)
    }
}
