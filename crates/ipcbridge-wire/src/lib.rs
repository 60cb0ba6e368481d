//! Message vocabulary and value marshalling for ipcbridge.
//!
//! This is the layer both sides of a channel agree on. It knows nothing about
//! how messages move between processes; it only defines what they look like:
//! - The wire message (`name`, `request_id`, JSON `args`) and its type names
//! - The closed [`Value`] type and its binary normalization
//! - The structured [`RemoteError`] carried across the boundary
//! - The shared [`Manifest`] of method names and call types
//! - The stream state machine used to relay stream events

pub mod error;
pub mod manifest;
pub mod message;
pub mod remote_error;
pub mod stream;
pub mod value;

pub use error::{Result, WireError};
pub use manifest::{CallType, Manifest};
pub use message::{
    Message, MessageType, SyncReply, ASYNC_REPLY, STREAM_CLOSE, STREAM_DATA, STREAM_DRAIN,
    STREAM_END, STREAM_ERROR, STREAM_FINISH, STREAM_READABLE, STREAM_REQUEST_CLOSE,
    STREAM_REQUEST_END, STREAM_REQUEST_WRITE,
};
pub use remote_error::RemoteError;
pub use stream::{StreamEvent, StreamState, Transition};
pub use value::{marshal_args, unmarshal_args, value_to_wire, wire_to_value, Value, BUFFER_TAG};
