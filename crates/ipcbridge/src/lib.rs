//! Remote method calls and streams over message-based IPC channels.
//!
//! One process exports a manifest of named methods; another imports the same
//! manifest and calls them as if they were local. Every method has a call
//! type (sync, async, promise, readable, writable, duplex) and many calls and
//! streams share one untyped message channel.
//!
//! # Crate Structure
//!
//! - [`wire`]: message vocabulary, values, manifests, remote errors, stream states
//! - [`transport`]: collaborator traits and the in-process [`LocalBus`](transport::LocalBus)
//! - [`export`]: the method-owning side (behind the `export` feature)
//! - [`import`]: the calling side (behind the `import` feature)
//!
//! # Example
//!
//! ```no_run
//! # #[cfg(all(feature = "export", feature = "import"))]
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//!
//! use ipcbridge::export::{export_api, Methods};
//! use ipcbridge::import::import_api;
//! use ipcbridge::transport::LocalBus;
//! use ipcbridge::wire::{CallType, Manifest, Value};
//!
//! let manifest = Manifest::new().with("add", CallType::Sync);
//! let bus = LocalBus::new()?;
//! export_api(
//!     &bus,
//!     "math",
//!     manifest.clone(),
//!     Methods::new().sync("add", |_ctx, args| {
//!         let sum = args.iter().filter_map(Value::as_i64).sum::<i64>();
//!         Ok(Value::Int(sum))
//!     }),
//! )?;
//!
//! let view = Arc::new(bus.connect());
//! let math = import_api(view, "math", manifest)?;
//! let sum = math.call_sync("add", vec![Value::Int(2), Value::Int(3)])?;
//! assert_eq!(sum, Value::Int(5));
//! # Ok(())
//! # }
//! ```

/// Re-export wire types.
pub mod wire {
    pub use ipcbridge_wire::*;
}

/// Re-export transport types.
pub mod transport {
    pub use ipcbridge_transport::*;
}

/// Re-export exporter types (requires `export` feature).
#[cfg(feature = "export")]
pub mod export {
    pub use ipcbridge_export::*;
}

/// Re-export importer types (requires `import` feature).
#[cfg(feature = "import")]
pub mod import {
    pub use ipcbridge_import::*;
}
