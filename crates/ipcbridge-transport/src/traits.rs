use std::sync::Arc;

use ipcbridge_wire::{Message, SyncReply};

use crate::error::Result;

/// Identifies one connected caller on the exporter side.
pub type EndpointId = u64;

/// Lifecycle events an [`Endpoint`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointEvent {
    /// The caller reloaded or moved on; its in-flight state is stale.
    Navigated,
    /// The caller is gone for good.
    Destroyed,
}

pub type EndpointCallback = Box<dyn FnOnce() + Send>;

/// One remote caller as seen by the exporter.
pub trait Endpoint: Send + Sync {
    fn id(&self) -> EndpointId;

    /// Send a message to this caller on `channel`.
    fn send(&self, channel: &str, message: Message) -> Result<()>;

    fn is_destroyed(&self) -> bool;

    /// Number of navigations so far. Bumped before `Navigated` callbacks run.
    fn navigation_epoch(&self) -> u64;

    /// Run `callback` once, the next time `event` happens.
    fn once(&self, event: EndpointEvent, callback: EndpointCallback);
}

/// Message handler on the exporter side.
///
/// The return value is the immediate reply for synchronous sends; it is
/// ignored for asynchronous ones.
pub type ExportHandler = Arc<dyn Fn(Arc<dyn Endpoint>, Message) -> Option<SyncReply> + Send + Sync>;

/// Message handler on the importer side.
pub type ImportHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Transport as seen by the method-owning side.
pub trait ExportTransport: Send + Sync {
    fn on_message(&self, channel: &str, handler: ExportHandler);
}

/// Transport as seen by the calling side.
pub trait ImportTransport: Send + Sync {
    /// Fire-and-forget send.
    fn send(&self, channel: &str, message: Message) -> Result<()>;

    /// Blocking round trip; returns the exporter's immediate reply.
    fn send_sync(&self, channel: &str, message: Message) -> Result<SyncReply>;

    fn on_message(&self, channel: &str, handler: ImportHandler);
}

impl<T: ExportTransport + ?Sized> ExportTransport for Arc<T> {
    fn on_message(&self, channel: &str, handler: ExportHandler) {
        (**self).on_message(channel, handler)
    }
}

impl<T: ImportTransport + ?Sized> ImportTransport for Arc<T> {
    fn send(&self, channel: &str, message: Message) -> Result<()> {
        (**self).send(channel, message)
    }

    fn send_sync(&self, channel: &str, message: Message) -> Result<SyncReply> {
        (**self).send_sync(channel, message)
    }

    fn on_message(&self, channel: &str, handler: ImportHandler) {
        (**self).on_message(channel, handler)
    }
}
