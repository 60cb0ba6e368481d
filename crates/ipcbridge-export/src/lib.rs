//! The method-owning side of ipcbridge.
//!
//! An [`Exporter`] binds a [`Manifest`](ipcbridge_wire::Manifest) and a
//! [`Methods`] table to a channel, runs each incoming call with the matching
//! handler kind and sends the result back to the calling endpoint only.
//! Streams returned by handlers are tracked per endpoint and force-closed when
//! the endpoint navigates away or is destroyed.

pub mod context;
pub mod error;
pub mod exporter;
pub mod handler;
mod registry;
pub mod stream;

pub use context::{CallContext, Reply};
pub use error::{ExportError, Result};
pub use exporter::{
    export_api, export_api_with_config, Diagnostic, DiagnosticSink, ExportConfig, Exporter,
    PermissionCheck,
};
pub use handler::{Handler, HandlerResult, Methods, StreamReturn};
pub use stream::{force_close, Control, Duplex, Readable, StreamOps, Writable};
