use std::fmt;
use std::sync::Arc;

use ipcbridge_transport::{Endpoint, EndpointId};
use ipcbridge_wire::{value_to_wire, Message, MessageType, RemoteError, Value};
use serde_json::Value as Json;
use tracing::{debug, warn};

/// Send `message` to `endpoint` unless the endpoint has gone away.
///
/// A destroyed endpoint gets nothing. An endpoint that navigated after
/// `epoch` only gets keep-listening stream events. Returns whether the
/// message was handed to the transport.
pub(crate) fn deliver(endpoint: &dyn Endpoint, channel: &str, epoch: u64, message: Message) -> bool {
    if endpoint.is_destroyed() {
        debug!(
            endpoint = endpoint.id(),
            message = %message.name,
            request_id = message.request_id,
            "endpoint destroyed; suppressing message"
        );
        return false;
    }

    let keeps_listening = message
        .message_type()
        .is_some_and(MessageType::keeps_listening);
    if endpoint.navigation_epoch() != epoch && !keeps_listening {
        debug!(
            endpoint = endpoint.id(),
            message = %message.name,
            request_id = message.request_id,
            "endpoint navigated; suppressing message"
        );
        return false;
    }

    let name = message.name.clone();
    match endpoint.send(channel, message) {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, endpoint = endpoint.id(), message = %name, "failed to send reply");
            false
        }
    }
}

/// Build an `async-reply` message: `[error-or-null, value]`.
pub(crate) fn async_reply(request_id: u64, result: Result<Value, RemoteError>) -> Message {
    let args = match result {
        Ok(value) => vec![Json::Null, value_to_wire(&value)],
        Err(err) => vec![err.to_wire(), Json::Null],
    };
    Message::of_type(MessageType::AsyncReply, request_id, args)
}

/// Who called, and which call this is.
///
/// Handlers get one of these on every invocation. The endpoint is the calling
/// side itself, so a handler can message it directly on any channel.
#[derive(Clone)]
pub struct CallContext {
    endpoint: Arc<dyn Endpoint>,
    channel: Arc<str>,
    method: Arc<str>,
    request_id: u64,
    epoch: u64,
}

impl CallContext {
    pub(crate) fn new(
        endpoint: Arc<dyn Endpoint>,
        channel: Arc<str>,
        method: &str,
        request_id: u64,
    ) -> Self {
        let epoch = endpoint.navigation_epoch();
        Self {
            endpoint,
            channel,
            method: Arc::from(method),
            request_id,
            epoch,
        }
    }

    pub fn endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.endpoint
    }

    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint.id()
    }

    /// The exporter's channel.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Navigation epoch of the endpoint when the call arrived.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether the caller navigated away or was destroyed since the call arrived.
    pub fn is_stale(&self) -> bool {
        self.endpoint.is_destroyed() || self.endpoint.navigation_epoch() != self.epoch
    }

    pub(crate) fn reply_to(&self, result: Result<Value, RemoteError>) -> bool {
        deliver(
            self.endpoint.as_ref(),
            &self.channel,
            self.epoch,
            async_reply(self.request_id, result),
        )
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("endpoint", &self.endpoint.id())
            .field("method", &self.method)
            .field("request_id", &self.request_id)
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// One-shot reply handle for `async` handlers.
///
/// Exactly one `async-reply` is sent per call: either through [`Reply::send`]
/// (or its shorthands), or, if the handle is dropped unused, an error reply.
pub struct Reply {
    ctx: Option<CallContext>,
}

impl Reply {
    pub(crate) fn new(ctx: CallContext) -> Self {
        Self { ctx: Some(ctx) }
    }

    pub fn send(mut self, result: Result<Value, RemoteError>) {
        if let Some(ctx) = self.ctx.take() {
            ctx.reply_to(result);
        }
    }

    pub fn ok(self, value: impl Into<Value>) {
        self.send(Ok(value.into()));
    }

    pub fn err(self, err: impl Into<RemoteError>) {
        self.send(Err(err.into()));
    }

    pub fn request_id(&self) -> u64 {
        self.ctx.as_ref().map(CallContext::request_id).unwrap_or_default()
    }
}

impl Drop for Reply {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            let message = if std::thread::panicking() {
                format!("'{}' panicked before replying", ctx.method())
            } else {
                format!("'{}' finished without replying", ctx.method())
            };
            warn!(
                method = ctx.method(),
                request_id = ctx.request_id(),
                "async handler dropped its reply; answering with an error"
            );
            let err = RemoteError::new(message);
            ctx.reply_to(Err(err));
        }
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply")
            .field("request_id", &self.request_id())
            .field("sent", &self.ctx.is_none())
            .finish()
    }
}
