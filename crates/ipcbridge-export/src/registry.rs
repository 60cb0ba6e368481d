use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use ipcbridge_transport::EndpointId;
use ipcbridge_wire::{StreamEvent, StreamState, Transition};

use crate::stream::ExportStream;

struct StreamEntry {
    stream: ExportStream,
    state: StreamState,
}

/// Live streams, grouped by the endpoint that opened them.
///
/// An endpoint's map exists from its first stream until the endpoint is torn
/// down, so its lifecycle listeners are registered once per map.
#[derive(Default)]
pub(crate) struct StreamRegistry {
    endpoints: Mutex<HashMap<EndpointId, HashMap<u64, StreamEntry>>>,
}

impl StreamRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<EndpointId, HashMap<u64, StreamEntry>>> {
        self.endpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a stream. Returns `true` if it is the endpoint's first.
    pub(crate) fn insert(&self, endpoint: EndpointId, request_id: u64, stream: ExportStream) -> bool {
        let mut endpoints = self.lock();
        let first = !endpoints.contains_key(&endpoint);
        let state = StreamState::opened(stream.call_type());
        endpoints
            .entry(endpoint)
            .or_default()
            .insert(request_id, StreamEntry { stream, state });
        first
    }

    pub(crate) fn get(&self, endpoint: EndpointId, request_id: u64) -> Option<ExportStream> {
        self.lock()
            .get(&endpoint)
            .and_then(|streams| streams.get(&request_id))
            .map(|entry| entry.stream.clone())
    }

    /// Feed an event through the stream's state. A terminal transition removes
    /// the entry and hands the stream back so the caller can release it.
    pub(crate) fn advance(
        &self,
        endpoint: EndpointId,
        request_id: u64,
        event: &StreamEvent,
    ) -> Option<(Transition, Option<ExportStream>)> {
        let mut endpoints = self.lock();
        let streams = endpoints.get_mut(&endpoint)?;
        let entry = streams.get_mut(&request_id)?;
        let transition = entry.state.on_event(event);
        entry.state = transition.next;
        let finished = if transition.terminal {
            streams.remove(&request_id).map(|entry| entry.stream)
        } else {
            None
        };
        Some((transition, finished))
    }

    /// Drop a stream the caller asked to close. Returns it with its final state.
    pub(crate) fn close(
        &self,
        endpoint: EndpointId,
        request_id: u64,
    ) -> Option<(StreamState, ExportStream)> {
        let mut endpoints = self.lock();
        let entry = endpoints.get_mut(&endpoint)?.remove(&request_id)?;
        Some((entry.state.close(), entry.stream))
    }

    pub(crate) fn remove(&self, endpoint: EndpointId, request_id: u64) -> Option<ExportStream> {
        self.lock()
            .get_mut(&endpoint)
            .and_then(|streams| streams.remove(&request_id))
            .map(|entry| entry.stream)
    }

    /// Drop the endpoint's map and return every stream it still held.
    pub(crate) fn take_endpoint(&self, endpoint: EndpointId) -> Vec<ExportStream> {
        self.lock()
            .remove(&endpoint)
            .map(|streams| streams.into_values().map(|entry| entry.stream).collect())
            .unwrap_or_default()
    }

    pub(crate) fn count(&self, endpoint: EndpointId) -> usize {
        self.lock().get(&endpoint).map(HashMap::len).unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn is_tracked(&self, endpoint: EndpointId) -> bool {
        self.lock().contains_key(&endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{Readable, Writable};
    use ipcbridge_wire::Value;

    #[test]
    fn first_insert_per_endpoint_is_reported() {
        let registry = StreamRegistry::default();
        assert!(registry.insert(1, 1, Readable::new().into()));
        assert!(!registry.insert(1, 2, Readable::new().into()));
        assert!(registry.insert(2, 3, Readable::new().into()));
        assert_eq!(registry.count(1), 2);
    }

    #[test]
    fn terminal_event_removes_entry() {
        let registry = StreamRegistry::default();
        registry.insert(1, 7, Readable::new().into());

        let (t, finished) = registry
            .advance(1, 7, &StreamEvent::Data(Value::Int(1)))
            .expect("entry should exist");
        assert!(t.forward);
        assert!(finished.is_none());

        let (t, finished) = registry
            .advance(1, 7, &StreamEvent::End)
            .expect("entry should exist");
        assert!(t.terminal);
        assert!(finished.is_some());
        assert!(registry.advance(1, 7, &StreamEvent::End).is_none());

        // The endpoint stays tracked until it is torn down.
        assert!(registry.is_tracked(1));
        assert_eq!(registry.count(1), 0);
    }

    #[test]
    fn closing_drops_the_entry() {
        let registry = StreamRegistry::default();
        registry.insert(3, 9, Readable::new().into());
        registry.insert(3, 10, Readable::new().into());

        let (state, _) = registry.close(3, 9).expect("entry should exist");
        assert_eq!(state, StreamState::Closed);
        assert!(registry.close(3, 9).is_none());
        assert!(registry.advance(3, 9, &StreamEvent::Close).is_none());
        assert_eq!(registry.count(3), 1);
    }

    #[test]
    fn take_endpoint_drains_everything() {
        let registry = StreamRegistry::default();
        registry.insert(4, 1, Readable::new().into());
        registry.insert(4, 2, Writable::new(|_| Ok(())).into());
        assert_eq!(registry.take_endpoint(4).len(), 2);
        assert!(!registry.is_tracked(4));
        assert!(registry.get(4, 1).is_none());
        assert!(registry.take_endpoint(4).is_empty());
    }
}
