use ipcbridge_wire::CallType;

/// Errors raised while setting up or driving an exporter.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// A handler is bound to a name the manifest does not declare.
    #[error("handler '{0}' is not declared in the manifest")]
    MethodNotFound(String),

    /// A handler's kind does not match the manifest's call type.
    #[error("handler '{method}' is {found} but the manifest declares {expected}")]
    HandlerMismatch {
        method: String,
        expected: CallType,
        found: CallType,
    },

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

pub type Result<T> = std::result::Result<T, ExportError>;
