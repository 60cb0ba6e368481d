use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

const RESERVED_FIELDS: [&str; 3] = ["name", "message", "stack"];

fn default_name() -> String {
    "Error".to_string()
}

/// A structured error carried across the channel.
///
/// On the wire this is `{name, message, stack?, ...extra}`. Locally the three
/// well-known fields are typed; everything else lives in an explicit field bag.
/// The importer may attach a typed error built from the remote name.
#[derive(Clone, Serialize, Deserialize)]
pub struct RemoteError {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Json>,
    #[serde(skip)]
    typed: Option<Arc<dyn StdError + Send + Sync>>,
}

impl RemoteError {
    /// A plain `Error` with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self::named("Error", message)
    }

    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            extra: Map::new(),
            typed: None,
        }
    }

    /// Attach an extra field. Reserved keys are ignored.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Json>) -> Self {
        let key = key.into();
        if !RESERVED_FIELDS.contains(&key.as_str()) {
            self.extra.insert(key, value.into());
        }
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&Json> {
        self.extra.get(key)
    }

    pub fn to_wire(&self) -> Json {
        serde_json::to_value(self).unwrap_or_else(|_| {
            let mut obj = Map::new();
            obj.insert("name".to_string(), Json::String(self.name.clone()));
            obj.insert("message".to_string(), Json::String(self.message.clone()));
            Json::Object(obj)
        })
    }

    /// Rebuild an error from whatever the remote side sent.
    ///
    /// Objects are read field by field; a bare string becomes the message;
    /// anything else is rendered as the message of a generic error.
    pub fn from_wire(json: Json) -> Self {
        match json {
            Json::Object(mut obj) => {
                let take_str = |obj: &mut Map<String, Json>, key: &str| match obj.remove(key) {
                    Some(Json::String(s)) => Some(s),
                    Some(Json::Null) | None => None,
                    Some(other) => Some(other.to_string()),
                };
                let name = take_str(&mut obj, "name").unwrap_or_else(default_name);
                let message = take_str(&mut obj, "message").unwrap_or_default();
                let stack = take_str(&mut obj, "stack");
                Self {
                    name,
                    message,
                    stack,
                    extra: obj,
                    typed: None,
                }
            }
            Json::String(message) => Self::new(message),
            Json::Null => Self::new(""),
            other => Self::new(other.to_string()),
        }
    }

    /// Capture a local error as a remote error, keeping it as the typed source.
    pub fn from_error<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        let mut remote = Self::new(err.to_string());
        remote.typed = Some(Arc::new(err));
        remote
    }

    /// Convert a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "handler panicked".to_string()
        };
        Self::named("Panic", message)
    }

    pub fn set_typed(&mut self, typed: Box<dyn StdError + Send + Sync>) {
        self.typed = Some(Arc::from(typed));
    }

    pub fn typed(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.typed.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.typed.as_deref().and_then(|e| e.downcast_ref::<E>())
    }

    /// First line of the stack, or `name: message` when there is none.
    pub fn first_stack_line(&self) -> String {
        self.stack
            .as_deref()
            .and_then(|s| s.lines().next())
            .map(str::to_string)
            .unwrap_or_else(|| self.to_string())
    }
}

impl PartialEq for RemoteError {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.message == other.message
            && self.stack == other.stack
            && self.extra == other.extra
    }
}

impl fmt::Debug for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteError")
            .field("name", &self.name)
            .field("message", &self.message)
            .field("stack", &self.stack)
            .field("extra", &self.extra)
            .field("typed", &self.typed.is_some())
            .finish()
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl StdError for RemoteError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.typed
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

impl From<&str> for RemoteError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for RemoteError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("custom failure")]
    struct Custom;

    #[test]
    fn extra_fields_round_trip() {
        let err = RemoteError::named("Error", "oh no!")
            .with_field("foo", "bar")
            .with_field("message", "ignored");
        let wire = err.to_wire();
        assert_eq!(wire["foo"], "bar");
        assert_eq!(wire["message"], "oh no!");

        let back = RemoteError::from_wire(wire);
        assert_eq!(back, err);
        assert_eq!(back.field("foo").and_then(Json::as_str), Some("bar"));
    }

    #[test]
    fn from_wire_accepts_loose_shapes() {
        let err = RemoteError::from_wire(Json::String("plain".into()));
        assert_eq!(err.name, "Error");
        assert_eq!(err.message, "plain");

        let err = RemoteError::from_wire(serde_json::json!(42));
        assert_eq!(err.message, "42");

        let err = RemoteError::from_wire(serde_json::json!({ "message": "m" }));
        assert_eq!(err.name, "Error");
        assert!(err.stack.is_none());
    }

    #[test]
    fn typed_source_is_reachable() {
        let err = RemoteError::from_error(Custom);
        assert_eq!(err.message, "custom failure");
        assert!(err.downcast_ref::<Custom>().is_some());
        assert!(err.source().is_some());
    }

    #[test]
    fn panic_payloads_become_messages() {
        let err = RemoteError::from_panic(Box::new("boom"));
        assert_eq!(err.name, "Panic");
        assert_eq!(err.message, "boom");

        let err = RemoteError::from_panic(Box::new(String::from("owned")));
        assert_eq!(err.message, "owned");
    }

    #[test]
    fn first_stack_line_falls_back_to_display() {
        let err = RemoteError::named("TypeError", "bad");
        assert_eq!(err.first_stack_line(), "TypeError: bad");

        let err = err.with_stack("TypeError: bad\n    at remote.rs:1:1");
        assert_eq!(err.first_stack_line(), "TypeError: bad");
    }
}
