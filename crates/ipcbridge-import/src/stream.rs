use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::Stream;
use ipcbridge_wire::{value_to_wire, CallType, MessageType, StreamEvent, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::CallError;
use crate::importer::Inner;

/// The calling side of a remote stream.
///
/// Events arrive in order: `Data`, `Readable` and `Drain` may repeat; `End`,
/// `Finish` and `Error` are terminal and nothing follows them. A `Close` sent
/// by the remote side passes through without ending the stream.
///
/// [`close`](Self::close) and dropping both end the stream here and ask the
/// remote side to close it.
pub struct ImportedStream {
    importer: Arc<Inner>,
    request_id: u64,
    call_type: CallType,
    events: mpsc::UnboundedReceiver<StreamEvent>,
}

impl ImportedStream {
    pub(crate) fn new(
        importer: Arc<Inner>,
        request_id: u64,
        call_type: CallType,
        events: mpsc::UnboundedReceiver<StreamEvent>,
    ) -> Self {
        Self {
            importer,
            request_id,
            call_type,
            events,
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn call_type(&self) -> CallType {
        self.call_type
    }

    /// Send a chunk to a writable or duplex stream.
    pub fn write(&self, chunk: impl Into<Value>) -> Result<(), CallError> {
        self.require_writable()?;
        let chunk = value_to_wire(&chunk.into());
        self.importer
            .control(self.request_id, MessageType::StreamRequestWrite, vec![chunk])
    }

    /// Ask the remote side to finish its writable half.
    pub fn end(&self) -> Result<(), CallError> {
        self.require_writable()?;
        self.importer
            .control(self.request_id, MessageType::StreamRequestEnd, Vec::new())
    }

    /// Close the stream. Events already received are still readable, followed
    /// by `Close`; nothing from the remote side is delivered after that.
    pub fn close(&self) -> Result<(), CallError> {
        if !self.importer.close_local(self.request_id) {
            return Err(CallError::StreamClosed);
        }
        self.importer.request_close(self.request_id)
    }

    fn require_writable(&self) -> Result<(), CallError> {
        if self.call_type.is_writable() {
            Ok(())
        } else {
            Err(CallError::WrongCallType {
                method: format!("stream {}", self.request_id),
                declared: self.call_type,
                attempted: CallType::Writable,
            })
        }
    }

    /// Wait for the next event. `None` once the stream is over.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Take the next event if one is already queued.
    pub fn try_next_event(&mut self) -> Option<StreamEvent> {
        self.events.try_recv().ok()
    }

    /// Collect every chunk until the stream ends or closes.
    pub async fn read_to_end(mut self) -> Result<Vec<Value>, CallError> {
        let mut chunks = Vec::new();
        while let Some(event) = self.next_event().await {
            match event {
                StreamEvent::Data(chunk) => chunks.push(chunk),
                StreamEvent::End | StreamEvent::Finish | StreamEvent::Close => return Ok(chunks),
                StreamEvent::Error(err) => return Err(CallError::Remote(err)),
                StreamEvent::Readable | StreamEvent::Drain => {}
            }
        }
        Err(CallError::StreamClosed)
    }
}

impl Stream for ImportedStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for ImportedStream {
    fn drop(&mut self) {
        if self.importer.release(self.request_id) {
            debug!(request_id = self.request_id, "dropping open stream; requesting close");
            if let Err(e) = self.importer.request_close(self.request_id) {
                debug!(error = %e, request_id = self.request_id, "could not request stream close");
            }
        }
    }
}

impl fmt::Debug for ImportedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportedStream")
            .field("request_id", &self.request_id)
            .field("call_type", &self.call_type)
            .finish()
    }
}
