/// Errors that can occur while moving messages between the two sides.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The other side is gone; nothing will be delivered.
    #[error("transport disconnected")]
    Disconnected,

    /// The endpoint was destroyed before the message could be sent.
    #[error("endpoint {0} destroyed")]
    EndpointDestroyed(u64),

    /// Nobody listens on the channel.
    #[error("no handler registered on channel '{0}'")]
    NoHandler(String),

    /// A synchronous send completed without a return value.
    #[error("no reply for '{method}' on channel '{channel}'")]
    NoReply { channel: String, method: String },

    /// Created outside a tokio runtime.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),

    /// The message could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
