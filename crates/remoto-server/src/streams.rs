//! Item streams
//!
//! A method that produces a [`ValueStream`] does not send its items at once.
//! The daemon parks the iterator here under a fresh stream id and the client
//! pulls items one at a time through the reserved daemon object.
//!
//! A stream belongs to the connection that created it. When that client
//! disconnects the stream starts lingering: it is kept for `linger` so a
//! reconnecting client can continue it, then it expires. Independently a
//! non-zero `lifetime` bounds how long any stream may exist.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use remoto_common::context::random_hex;
use remoto_common::RemoteError;
use serde_json::Value;

use crate::expose::ValueStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Owned by a connected client
    Active { client: u64 },
    /// Owner went away at `since`
    Lingering { since: Instant },
    Expired,
}

struct StreamEntry {
    state: StreamState,
    created: Instant,
    /// Taken out while an item is being produced
    iter: Option<ValueStream>,
}

impl StreamEntry {
    fn advance(&mut self, now: Instant, lifetime: Duration, linger: Duration) -> StreamState {
        if !lifetime.is_zero() && now.duration_since(self.created) > lifetime {
            self.state = StreamState::Expired;
        }
        if let StreamState::Lingering { since } = self.state {
            if now.duration_since(since) > linger {
                self.state = StreamState::Expired;
            }
        }
        self.state
    }
}

pub(crate) struct StreamTable {
    entries: Mutex<HashMap<String, StreamEntry>>,
    lifetime: Duration,
    linger: Duration,
}

fn terminated() -> RemoteError {
    RemoteError::new("StreamError", "item stream terminated")
}

impl StreamTable {
    pub(crate) fn new(lifetime: Duration, linger: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            lifetime,
            linger,
        }
    }

    /// Parks a stream for `client` and returns its id.
    pub(crate) fn insert(&self, client: u64, iter: ValueStream) -> String {
        let id = random_hex(16);
        let entry = StreamEntry {
            state: StreamState::Active { client },
            created: Instant::now(),
            iter: Some(iter),
        };
        self.entries.lock().insert(id.clone(), entry);
        tracing::debug!(stream = %id, client = client, "item stream opened");
        id
    }

    /// Produces the next item. `Ok(None)` means the stream is exhausted and
    /// has been removed.
    pub(crate) fn next_item(&self, id: &str, client: Option<u64>) -> Result<Option<Value>, RemoteError> {
        let mut iter = {
            let mut entries = self.entries.lock();
            let entry = entries.get_mut(id).ok_or_else(terminated)?;
            if entry.advance(Instant::now(), self.lifetime, self.linger) == StreamState::Expired {
                entries.remove(id);
                return Err(terminated());
            }
            if let (StreamState::Lingering { .. }, Some(client)) = (entry.state, client) {
                tracing::debug!(stream = %id, client = client, "item stream reattached");
                entry.state = StreamState::Active { client };
            }
            entry
                .iter
                .take()
                .ok_or_else(|| RemoteError::new("StreamError", "item stream is busy"))?
        };

        let item = iter.next();

        let mut entries = self.entries.lock();
        match item {
            Some(value) => {
                // the stream may have been closed while the item was produced
                if let Some(entry) = entries.get_mut(id) {
                    entry.iter = Some(iter);
                }
                Ok(Some(value))
            }
            None => {
                entries.remove(id);
                tracing::debug!(stream = %id, "item stream exhausted");
                Ok(None)
            }
        }
    }

    pub(crate) fn close(&self, id: &str) -> bool {
        self.entries.lock().remove(id).is_some()
    }

    /// Moves the streams of a disconnected client to lingering, or drops them
    /// when lingering is disabled.
    pub(crate) fn client_disconnected(&self, client: u64) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let linger = !self.linger.is_zero();
        entries.retain(|id, entry| match entry.state {
            StreamState::Active { client: owner } if owner == client => {
                if linger {
                    entry.state = StreamState::Lingering { since: now };
                    true
                } else {
                    tracing::debug!(stream = %id, "item stream dropped with its client");
                    false
                }
            }
            _ => true,
        });
    }

    /// Removes expired streams; returns how many went.
    pub(crate) fn housekeeping(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.advance(now, self.lifetime, self.linger) != StreamState::Expired);
        before - entries.len()
    }

    pub(crate) fn state(&self, id: &str) -> Option<StreamState> {
        self.entries.lock().get(id).map(|e| e.state)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread;

    fn numbers(n: i64) -> ValueStream {
        Box::new((1..=n).map(Value::from))
    }

    #[test]
    fn test_pull_until_exhausted() {
        let table = StreamTable::new(Duration::ZERO, Duration::from_secs(30));
        let id = table.insert(1, numbers(2));
        assert_eq!(table.next_item(&id, Some(1)).unwrap(), Some(json!(1)));
        assert_eq!(table.next_item(&id, Some(1)).unwrap(), Some(json!(2)));
        assert_eq!(table.next_item(&id, Some(1)).unwrap(), None);
        assert_eq!(table.len(), 0);
        assert_eq!(table.next_item(&id, Some(1)).unwrap_err().kind, "StreamError");
    }

    #[test]
    fn test_close() {
        let table = StreamTable::new(Duration::ZERO, Duration::from_secs(30));
        let id = table.insert(1, numbers(5));
        assert!(table.close(&id));
        assert!(!table.close(&id));
        assert!(table.next_item(&id, Some(1)).is_err());
    }

    #[test]
    fn test_linger_and_reattach() {
        let table = StreamTable::new(Duration::ZERO, Duration::from_secs(30));
        let id = table.insert(1, numbers(3));
        table.client_disconnected(1);
        assert!(matches!(table.state(&id), Some(StreamState::Lingering { .. })));

        assert_eq!(table.next_item(&id, Some(2)).unwrap(), Some(json!(1)));
        assert_eq!(table.state(&id), Some(StreamState::Active { client: 2 }));
    }

    #[test]
    fn test_disconnect_without_linger_drops() {
        let table = StreamTable::new(Duration::ZERO, Duration::ZERO);
        let mine = table.insert(1, numbers(3));
        let other = table.insert(2, numbers(3));
        table.client_disconnected(1);
        assert_eq!(table.state(&mine), None);
        assert!(table.state(&other).is_some());
    }

    #[test]
    fn test_linger_expires() {
        let table = StreamTable::new(Duration::ZERO, Duration::from_millis(50));
        let id = table.insert(1, numbers(3));
        table.client_disconnected(1);
        thread::sleep(Duration::from_millis(120));
        assert_eq!(table.housekeeping(), 1);
        assert!(table.next_item(&id, Some(1)).is_err());
    }

    #[test]
    fn test_lifetime_expires_active_stream() {
        let table = StreamTable::new(Duration::from_millis(50), Duration::from_secs(30));
        let id = table.insert(1, numbers(3));
        thread::sleep(Duration::from_millis(120));
        assert_eq!(table.next_item(&id, Some(1)).unwrap_err().message, "item stream terminated");
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_housekeeping_keeps_live_streams() {
        let table = StreamTable::new(Duration::ZERO, Duration::from_secs(30));
        table.insert(1, numbers(1));
        assert_eq!(table.housekeeping(), 0);
        assert_eq!(table.len(), 1);
        table.clear();
        assert_eq!(table.len(), 0);
    }
}
