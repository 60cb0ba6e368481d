//! The calling side of ipcbridge.
//!
//! [`import_api`] turns a [`Manifest`](ipcbridge_wire::Manifest) into an
//! [`Importer`] holding one [`RemoteMethod`] per entry. Each method is called
//! with the convention its call type declares:
//! - `sync`: [`RemoteMethod::call_sync`] blocks for the reply
//! - `async`: [`RemoteMethod::call_async`] runs a callback exactly once
//! - `promise`: [`RemoteMethod::call`] returns a future
//! - `readable`, `writable`, `duplex`: [`RemoteMethod::open`] returns an
//!   [`ImportedStream`]
//!
//! Remote failures come back as [`RemoteError`](ipcbridge_wire::RemoteError)
//! with the remote stack's first line spliced onto the local call site.

pub mod config;
pub mod error;
pub mod importer;
pub mod method;
pub mod stream;

pub use config::{ErrorConstructor, ErrorRegistry, ImportConfig};
pub use error::{CallError, ImportError, Result};
pub use importer::{import_api, import_api_with_config, Importer};
pub use method::RemoteMethod;
pub use stream::ImportedStream;
