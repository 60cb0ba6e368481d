use std::fmt;
use std::future::Future;
use std::panic::Location;
use std::sync::Arc;

use ipcbridge_wire::{CallType, Value};
use tokio::sync::oneshot;

use crate::error::CallError;
use crate::importer::{CallSite, Importer};
use crate::stream::ImportedStream;

type Reply = Result<Value, CallError>;

pub(crate) async fn await_reply(receiver: Result<oneshot::Receiver<Reply>, CallError>) -> Reply {
    match receiver {
        Ok(receiver) => receiver.await.unwrap_or(Err(CallError::Canceled)),
        Err(err) => Err(err),
    }
}

/// A callable for one manifest entry.
///
/// Each calling convention is only valid for the matching call type; anything
/// else fails with [`CallError::WrongCallType`].
#[derive(Clone)]
pub struct RemoteMethod {
    importer: Importer,
    name: Arc<str>,
    call_type: CallType,
}

impl RemoteMethod {
    pub(crate) fn new(importer: Importer, name: &str, call_type: CallType) -> Self {
        Self {
            importer,
            name: Arc::from(name),
            call_type,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call_type(&self) -> CallType {
        self.call_type
    }

    fn check_convention(&self, attempted: CallType) -> Result<(), CallError> {
        let compatible = match attempted {
            CallType::Readable | CallType::Writable | CallType::Duplex => self.call_type.is_stream(),
            other => self.call_type == other,
        };
        if compatible {
            Ok(())
        } else {
            Err(CallError::WrongCallType {
                method: self.name.to_string(),
                declared: self.call_type,
                attempted,
            })
        }
    }

    /// Blocking round trip for a `sync` method.
    #[track_caller]
    pub fn call_sync(&self, args: Vec<Value>) -> Result<Value, CallError> {
        self.sync_at(args, Location::caller())
    }

    /// Call an `async` method; `callback` receives the result exactly once.
    #[track_caller]
    pub fn call_async<F>(&self, args: Vec<Value>, callback: F)
    where
        F: FnOnce(Result<Value, CallError>) + Send + 'static,
    {
        self.async_at(args, Box::new(callback), Location::caller())
    }

    /// Call a `promise` method. The request is sent before this returns.
    #[track_caller]
    pub fn call(&self, args: Vec<Value>) -> impl Future<Output = Result<Value, CallError>> + Send + 'static {
        await_reply(self.promise_at(args, Location::caller()))
    }

    /// Open a `readable`, `writable` or `duplex` method.
    #[track_caller]
    pub fn open(&self, args: Vec<Value>) -> Result<ImportedStream, CallError> {
        self.open_at(args, Location::caller())
    }

    pub(crate) fn sync_at(&self, args: Vec<Value>, call_site: CallSite) -> Result<Value, CallError> {
        self.check_convention(CallType::Sync)?;
        self.importer.inner.send_sync(&self.name, &args, call_site)
    }

    pub(crate) fn async_at(
        &self,
        args: Vec<Value>,
        callback: Box<dyn FnOnce(Result<Value, CallError>) + Send>,
        call_site: CallSite,
    ) {
        if let Err(err) = self.check_convention(CallType::Async) {
            callback(Err(err));
            return;
        }
        self.importer
            .inner
            .begin(&self.name, &args, callback, call_site);
    }

    pub(crate) fn promise_at(
        &self,
        args: Vec<Value>,
        call_site: CallSite,
    ) -> Result<oneshot::Receiver<Reply>, CallError> {
        self.check_convention(CallType::Promise)?;
        let (tx, rx) = oneshot::channel();
        self.importer.inner.begin(
            &self.name,
            &args,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
            call_site,
        );
        Ok(rx)
    }

    pub(crate) fn open_at(
        &self,
        args: Vec<Value>,
        call_site: CallSite,
    ) -> Result<ImportedStream, CallError> {
        self.check_convention(CallType::Readable)?;
        self.importer
            .inner
            .open(&self.name, self.call_type, &args, call_site)
    }
}

impl fmt::Debug for RemoteMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteMethod")
            .field("name", &self.name)
            .field("call_type", &self.call_type)
            .finish()
    }
}
