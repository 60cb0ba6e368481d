use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::WireError;

/// Reply to an async or promise call: `(error-or-null, value)`.
pub const ASYNC_REPLY: &str = "async-reply";
/// Readable side produced a chunk.
pub const STREAM_DATA: &str = "stream-data";
/// Readable side has data available.
pub const STREAM_READABLE: &str = "stream-readable";
/// Writable side drained its buffer.
pub const STREAM_DRAIN: &str = "stream-drain";
/// Stream closed its underlying resource.
pub const STREAM_CLOSE: &str = "stream-close";
/// Readable side ended.
pub const STREAM_END: &str = "stream-end";
/// Writable side finished.
pub const STREAM_FINISH: &str = "stream-finish";
/// Stream failed.
pub const STREAM_ERROR: &str = "stream-error";
/// Importer asks the exporter to write a chunk.
pub const STREAM_REQUEST_WRITE: &str = "stream-request-write";
/// Importer asks the exporter to end the writable side.
pub const STREAM_REQUEST_END: &str = "stream-request-end";
/// Importer asks the exporter to close the stream.
pub const STREAM_REQUEST_CLOSE: &str = "stream-request-close";

/// The protocol's message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    AsyncReply,
    StreamData,
    StreamReadable,
    StreamDrain,
    StreamClose,
    StreamEnd,
    StreamFinish,
    StreamError,
    StreamRequestWrite,
    StreamRequestEnd,
    StreamRequestClose,
}

impl MessageType {
    pub const ALL: [MessageType; 11] = [
        MessageType::AsyncReply,
        MessageType::StreamData,
        MessageType::StreamReadable,
        MessageType::StreamDrain,
        MessageType::StreamClose,
        MessageType::StreamEnd,
        MessageType::StreamFinish,
        MessageType::StreamError,
        MessageType::StreamRequestWrite,
        MessageType::StreamRequestEnd,
        MessageType::StreamRequestClose,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::AsyncReply => ASYNC_REPLY,
            MessageType::StreamData => STREAM_DATA,
            MessageType::StreamReadable => STREAM_READABLE,
            MessageType::StreamDrain => STREAM_DRAIN,
            MessageType::StreamClose => STREAM_CLOSE,
            MessageType::StreamEnd => STREAM_END,
            MessageType::StreamFinish => STREAM_FINISH,
            MessageType::StreamError => STREAM_ERROR,
            MessageType::StreamRequestWrite => STREAM_REQUEST_WRITE,
            MessageType::StreamRequestEnd => STREAM_REQUEST_END,
            MessageType::StreamRequestClose => STREAM_REQUEST_CLOSE,
        }
    }

    /// Look up a message type by its wire name.
    pub fn parse(name: &str) -> Option<Self> {
        let ty = match name {
            ASYNC_REPLY => MessageType::AsyncReply,
            STREAM_DATA => MessageType::StreamData,
            STREAM_READABLE => MessageType::StreamReadable,
            STREAM_DRAIN => MessageType::StreamDrain,
            STREAM_CLOSE => MessageType::StreamClose,
            STREAM_END => MessageType::StreamEnd,
            STREAM_FINISH => MessageType::StreamFinish,
            STREAM_ERROR => MessageType::StreamError,
            STREAM_REQUEST_WRITE => MessageType::StreamRequestWrite,
            STREAM_REQUEST_END => MessageType::StreamRequestEnd,
            STREAM_REQUEST_CLOSE => MessageType::StreamRequestClose,
            _ => return None,
        };
        Some(ty)
    }

    /// Control requests travel importer → exporter and bypass the manifest.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            MessageType::StreamRequestWrite
                | MessageType::StreamRequestEnd
                | MessageType::StreamRequestClose
        )
    }

    /// Stream events travel exporter → importer.
    pub fn is_stream_event(self) -> bool {
        !self.is_control() && self != MessageType::AsyncReply
    }

    /// Types that may still be delivered after the endpoint navigated.
    pub fn keeps_listening(self) -> bool {
        matches!(
            self,
            MessageType::StreamData | MessageType::StreamReadable | MessageType::StreamDrain
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::parse(s).ok_or_else(|| WireError::UnknownMessageType(s.to_string()))
    }
}

/// One message on a channel.
///
/// Importer → exporter messages carry a method name (or a control request);
/// exporter → importer messages carry a [`MessageType`] name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub name: String,
    pub request_id: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Json>,
}

impl Message {
    pub fn new(name: impl Into<String>, request_id: u64, args: Vec<Json>) -> Self {
        Self {
            name: name.into(),
            request_id,
            args,
        }
    }

    /// Build a protocol message of a known type.
    pub fn of_type(msg_type: MessageType, request_id: u64, args: Vec<Json>) -> Self {
        Self::new(msg_type.as_str(), request_id, args)
    }

    /// The protocol type of this message, if it is not a method call.
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::parse(&self.name)
    }

    /// Borrow an argument, `None` past the end.
    pub fn arg(&self, index: usize) -> Option<&Json> {
        self.args.get(index)
    }
}

/// Immediate return value of a synchronous round trip.
///
/// Serializes as `{"success": value}` or `{"error": "message"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncReply {
    Success(Json),
    Error(String),
}

impl SyncReply {
    /// Plain acknowledgement for control requests and stream calls.
    pub fn ack() -> Self {
        SyncReply::Success(Json::Bool(true))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SyncReply::Success(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_type_round_trips_its_name() {
        for ty in MessageType::ALL {
            assert_eq!(ty.as_str().parse::<MessageType>().unwrap(), ty);
        }
        assert!(matches!(
            "stream-bogus".parse::<MessageType>(),
            Err(WireError::UnknownMessageType(_))
        ));
    }

    #[test]
    fn classification() {
        assert!(MessageType::StreamRequestClose.is_control());
        assert!(!MessageType::AsyncReply.is_stream_event());
        assert!(MessageType::StreamEnd.is_stream_event());
        assert!(MessageType::StreamData.keeps_listening());
        assert!(!MessageType::StreamEnd.keeps_listening());
    }

    #[test]
    fn sync_reply_wire_shape() {
        let ok = serde_json::to_value(SyncReply::Success(serde_json::json!(6))).unwrap();
        assert_eq!(ok, serde_json::json!({ "success": 6 }));

        let err = serde_json::to_value(SyncReply::Error("oh no!".into())).unwrap();
        assert_eq!(err, serde_json::json!({ "error": "oh no!" }));

        let parsed: SyncReply = serde_json::from_str(r#"{"error":"x"}"#).unwrap();
        assert!(!parsed.is_success());
    }

    #[test]
    fn message_omits_empty_args() {
        let msg = Message::of_type(MessageType::StreamEnd, 4, Vec::new());
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"name":"stream-end","request_id":4}"#);
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.message_type(), Some(MessageType::StreamEnd));
    }
}
