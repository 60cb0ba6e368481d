/// Errors that can occur while parsing wire-level data.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// A call-type tag that is not one of the six known types.
    #[error("unknown call type '{0}'")]
    InvalidCallType(String),

    /// A manifest entry declares an unknown call type.
    #[error("unknown call type '{tag}' for method '{method}'")]
    UnknownCallType { method: String, tag: String },

    /// A message name outside the protocol vocabulary.
    #[error("unknown message type '{0}'")]
    UnknownMessageType(String),

    /// A manifest entry uses a name reserved for control messages.
    #[error("method name '{0}' is reserved for control messages")]
    ReservedName(String),

    /// The manifest document is structurally invalid.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WireError>;
