//! Stream events and the transition table shared by both sides.
//!
//! The exporter runs every event of a registered stream through
//! [`StreamState::on_event`] before relaying it; the importer runs every
//! incoming `stream-*` message through the same table before queueing it.
//! That keeps the two views of a stream's lifetime in step.

use serde_json::Value as Json;

use crate::manifest::CallType;
use crate::message::{Message, MessageType};
use crate::remote_error::RemoteError;
use crate::value::{value_to_wire, wire_to_value, Value};

/// One lifecycle event of a stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Data(Value),
    Readable,
    Drain,
    Close,
    Error(RemoteError),
    End,
    Finish,
}

impl StreamEvent {
    pub fn message_type(&self) -> MessageType {
        match self {
            StreamEvent::Data(_) => MessageType::StreamData,
            StreamEvent::Readable => MessageType::StreamReadable,
            StreamEvent::Drain => MessageType::StreamDrain,
            StreamEvent::Close => MessageType::StreamClose,
            StreamEvent::Error(_) => MessageType::StreamError,
            StreamEvent::End => MessageType::StreamEnd,
            StreamEvent::Finish => MessageType::StreamFinish,
        }
    }

    /// Encode as the message relayed to the importer.
    pub fn to_message(&self, request_id: u64) -> Message {
        let args = match self {
            StreamEvent::Data(value) => vec![value_to_wire(value)],
            StreamEvent::Error(err) => vec![err.to_wire()],
            _ => Vec::new(),
        };
        Message::of_type(self.message_type(), request_id, args)
    }

    /// Decode a relayed message. `None` for anything that is not a stream event.
    pub fn from_message(msg: Message) -> Option<Self> {
        let msg_type = msg.message_type()?;
        let first = msg.args.into_iter().next().unwrap_or(Json::Null);
        let event = match msg_type {
            MessageType::StreamData => StreamEvent::Data(wire_to_value(first)),
            MessageType::StreamReadable => StreamEvent::Readable,
            MessageType::StreamDrain => StreamEvent::Drain,
            MessageType::StreamClose => StreamEvent::Close,
            MessageType::StreamError => StreamEvent::Error(RemoteError::from_wire(first)),
            MessageType::StreamEnd => StreamEvent::End,
            MessageType::StreamFinish => StreamEvent::Finish,
            _ => return None,
        };
        Some(event)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StreamEvent::Error(_))
    }
}

/// Lifetime of one stream registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Idle,
    /// At least one half is still open. A duplex with one half done is half-closed.
    Open { readable: bool, writable: bool },
    Ended,
    Errored,
    Closed,
}

/// Outcome of feeding one event to a [`StreamState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: StreamState,
    /// Relay (or queue) the event.
    pub forward: bool,
    /// The registration is finished and must be dropped.
    pub terminal: bool,
}

impl Transition {
    fn drop_event(state: StreamState) -> Self {
        Self {
            next: state,
            forward: false,
            terminal: false,
        }
    }

    fn pass(state: StreamState) -> Self {
        Self {
            next: state,
            forward: true,
            terminal: false,
        }
    }

    fn finish(next: StreamState) -> Self {
        Self {
            next,
            forward: true,
            terminal: true,
        }
    }
}

impl StreamState {
    /// Initial state for a freshly returned stream of the given call type.
    pub fn opened(call_type: CallType) -> Self {
        StreamState::Open {
            readable: call_type.is_readable(),
            writable: call_type.is_writable(),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamState::Ended | StreamState::Errored | StreamState::Closed
        )
    }

    pub fn readable_open(self) -> bool {
        matches!(self, StreamState::Open { readable: true, .. })
    }

    pub fn writable_open(self) -> bool {
        matches!(self, StreamState::Open { writable: true, .. })
    }

    /// Local close: the registration is gone regardless of the remote side.
    pub fn close(self) -> Self {
        StreamState::Closed
    }

    pub fn on_event(self, event: &StreamEvent) -> Transition {
        let StreamState::Open { readable, writable } = self else {
            return Transition::drop_event(self);
        };

        match event {
            StreamEvent::Data(_) | StreamEvent::Readable if readable => Transition::pass(self),
            StreamEvent::Drain if writable => Transition::pass(self),
            StreamEvent::Close => Transition::pass(self),
            StreamEvent::Error(_) => Transition::finish(StreamState::Errored),
            StreamEvent::End if readable => half_close(false, writable),
            StreamEvent::Finish if writable => half_close(readable, false),
            _ => Transition::drop_event(self),
        }
    }
}

fn half_close(readable: bool, writable: bool) -> Transition {
    if readable || writable {
        Transition::pass(StreamState::Open { readable, writable })
    } else {
        Transition::finish(StreamState::Ended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(mut state: StreamState, events: &[StreamEvent]) -> (StreamState, Vec<bool>) {
        let mut forwarded = Vec::new();
        for event in events {
            let t = state.on_event(event);
            forwarded.push(t.forward);
            state = t.next;
        }
        (state, forwarded)
    }

    #[test]
    fn readable_ends_once() {
        let state = StreamState::opened(CallType::Readable);
        let (state, fwd) = feed(
            state,
            &[
                StreamEvent::Data(Value::Int(5)),
                StreamEvent::Readable,
                StreamEvent::End,
                StreamEvent::End,
                StreamEvent::Data(Value::Int(9)),
            ],
        );
        assert_eq!(state, StreamState::Ended);
        assert_eq!(fwd, vec![true, true, true, false, false]);
    }

    #[test]
    fn end_is_terminal_for_readable() {
        let t = StreamState::opened(CallType::Readable).on_event(&StreamEvent::End);
        assert!(t.terminal);
        assert!(t.next.is_terminal());
    }

    #[test]
    fn writable_ignores_readable_events() {
        let state = StreamState::opened(CallType::Writable);
        assert!(!state.on_event(&StreamEvent::Data(Value::Null)).forward);
        assert!(!state.on_event(&StreamEvent::End).forward);
        assert!(state.on_event(&StreamEvent::Drain).forward);

        let t = state.on_event(&StreamEvent::Finish);
        assert!(t.terminal);
    }

    #[test]
    fn duplex_half_closes() {
        let state = StreamState::opened(CallType::Duplex);
        let t = state.on_event(&StreamEvent::End);
        assert!(t.forward);
        assert!(!t.terminal);
        assert_eq!(
            t.next,
            StreamState::Open {
                readable: false,
                writable: true
            }
        );
        assert!(t.next.writable_open());
        assert!(!t.next.readable_open());

        let t = t.next.on_event(&StreamEvent::Finish);
        assert!(t.terminal);
        assert_eq!(t.next, StreamState::Ended);
    }

    #[test]
    fn error_terminates_and_silences() {
        let state = StreamState::opened(CallType::Duplex);
        let (state, fwd) = feed(
            state,
            &[
                StreamEvent::Close,
                StreamEvent::Error(RemoteError::new("boom")),
                StreamEvent::Close,
                StreamEvent::Finish,
            ],
        );
        assert_eq!(state, StreamState::Errored);
        assert_eq!(fwd, vec![true, true, false, false]);
    }

    #[test]
    fn events_survive_message_encoding() {
        let events = [
            StreamEvent::Data(Value::from(vec![1u8, 2, 3])),
            StreamEvent::Error(RemoteError::new("bad").with_field("code", 7)),
            StreamEvent::Finish,
        ];
        for event in events {
            let msg = event.to_message(3);
            assert_eq!(msg.request_id, 3);
            assert_eq!(StreamEvent::from_message(msg), Some(event));
        }

        let reply = Message::of_type(MessageType::AsyncReply, 1, Vec::new());
        assert_eq!(StreamEvent::from_message(reply), None);
    }
}
