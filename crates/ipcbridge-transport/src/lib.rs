//! Transport contracts for ipcbridge.
//!
//! The exporter and importer never talk to a process boundary directly. They
//! talk to the traits defined here:
//! - [`ExportTransport`] delivers calls to the method-owning side, one
//!   [`Endpoint`] per connected caller
//! - [`ImportTransport`] carries calls out of the calling side and replies back
//!
//! With the `local` feature (default), [`LocalBus`] implements both contracts
//! in-process, which is what tests and single-process embedders use.

pub mod error;
pub mod traits;

#[cfg(feature = "local")]
pub mod local;

pub use error::{Result, TransportError};
pub use traits::{
    Endpoint, EndpointCallback, EndpointEvent, EndpointId, ExportHandler, ExportTransport,
    ImportHandler, ImportTransport,
};

#[cfg(feature = "local")]
pub use local::{LocalBus, LocalEndpoint, LocalView};
