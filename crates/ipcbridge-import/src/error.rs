use std::time::Duration;

use ipcbridge_wire::{CallType, RemoteError};

/// Errors raised while setting up an importer.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    /// Created outside a tokio runtime.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] ipcbridge_transport::TransportError),

    /// Wire-level error.
    #[error("wire error: {0}")]
    Wire(#[from] ipcbridge_wire::WireError),
}

pub type Result<T> = std::result::Result<T, ImportError>;

/// Why a single remote call failed.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The remote handler failed, or the call was denied.
    #[error(transparent)]
    Remote(RemoteError),

    /// No reply arrived in time.
    #[error("Timed out")]
    Timeout(Duration),

    /// The message could not be sent.
    #[error("transport error: {0}")]
    Transport(#[from] ipcbridge_transport::TransportError),

    /// The method was called with the wrong convention.
    #[error("'{method}' is a {declared} method and cannot be called as {attempted}")]
    WrongCallType {
        method: String,
        declared: CallType,
        attempted: CallType,
    },

    /// The manifest has no such method.
    #[error("method '{0}' is not in the manifest")]
    MethodNotFound(String),

    /// The stream already finished or was dropped.
    #[error("stream closed")]
    StreamClosed,

    /// The importer went away before the call settled.
    #[error("call canceled")]
    Canceled,

    /// Wire-level error.
    #[error("wire error: {0}")]
    Wire(#[from] ipcbridge_wire::WireError),
}

impl CallError {
    /// The remote error, when the failure came from the other side.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            CallError::Remote(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CallError::Timeout(_))
    }
}

impl From<RemoteError> for CallError {
    fn from(err: RemoteError) -> Self {
        CallError::Remote(err)
    }
}
