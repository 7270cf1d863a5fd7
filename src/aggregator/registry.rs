//! Connection registry
//!
//! The single point of truth for "who is currently connected". All
//! mutations and iterations go through one mutex; sends always happen
//! after the lock has been released.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::aggregator::connection::{Connection, ConnectionId, FrameSink};
use crate::error::Result;
use crate::framing;

/// Table of live connections keyed by id
pub struct ConnectionRegistry<C = Connection> {
    connections: Mutex<HashMap<ConnectionId, Arc<C>>>,
}

impl<C: FrameSink> ConnectionRegistry<C> {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, conn: Arc<C>) {
        let id = conn.id().to_string();
        let previous = self.connections.lock().insert(id.clone(), conn);
        if previous.is_some() {
            tracing::warn!("Replaced existing registry entry for {}", id);
        }
    }

    pub fn remove(&self, id: &str) -> Option<Arc<C>> {
        self.connections.lock().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<C>> {
        self.connections.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    /// Ids of all registered connections
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.lock().keys().cloned().collect()
    }

    /// Copy of the current connection set
    pub fn snapshot(&self) -> Vec<Arc<C>> {
        self.connections.lock().values().cloned().collect()
    }

    /// Remove and return every connection
    pub fn drain(&self) -> Vec<Arc<C>> {
        self.connections.lock().drain().map(|(_, conn)| conn).collect()
    }

    /// Queue `message` for one connection.
    ///
    /// Returns `Ok(false)` if no such connection is registered; the target
    /// may simply have disconnected a moment ago.
    pub fn unicast<T: Serialize + ?Sized>(&self, id: &str, message: &T) -> Result<bool> {
        let Some(conn) = self.get(id) else {
            tracing::debug!("Unicast to unknown connection {} ignored", id);
            return Ok(false);
        };
        conn.send_frame(framing::encode(message)?);
        Ok(true)
    }

    /// Queue `message` for every registered connection.
    ///
    /// The frame is encoded once; returns how many connections it was
    /// handed to.
    pub fn broadcast<T: Serialize + ?Sized>(&self, message: &T) -> Result<usize> {
        let frame = framing::encode(message)?;
        let targets = self.snapshot();
        for conn in &targets {
            conn.send_frame(frame.clone());
        }
        Ok(targets.len())
    }

    /// Get stats about the registry
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            connection_count: self.len(),
        }
    }
}

impl<C: FrameSink> Default for ConnectionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about the registry
#[derive(Debug, Clone)]
pub struct RegistryStats {
    pub connection_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{try_decode_one, Decoded};
    use crate::protocol::{Command, Message};
    use bytes::Bytes;

    struct RecordingSink {
        id: String,
        frames: Mutex<Vec<Bytes>>,
    }

    impl RecordingSink {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                frames: Mutex::new(Vec::new()),
            })
        }

        fn received(&self) -> Vec<serde_json::Value> {
            self.frames
                .lock()
                .iter()
                .map(|frame| match try_decode_one(frame) {
                    (Decoded::Message(value), _) => value,
                    other => panic!("bad frame {:?}", other),
                })
                .collect()
        }
    }

    impl FrameSink for RecordingSink {
        fn id(&self) -> &str {
            &self.id
        }

        fn send_frame(&self, frame: Bytes) {
            self.frames.lock().push(frame);
        }
    }

    #[test]
    fn test_unicast_after_remove_is_noop() {
        let registry = ConnectionRegistry::new();
        let sink = RecordingSink::new("a");
        registry.insert(sink.clone());
        assert!(registry.remove("a").is_some());

        let delivered = registry
            .unicast("a", &Message::command(Command::Start))
            .unwrap();
        assert!(!delivered);
        assert!(sink.received().is_empty());
    }

    #[test]
    fn test_unicast_reaches_only_target() {
        let registry = ConnectionRegistry::new();
        let a = RecordingSink::new("a");
        let b = RecordingSink::new("b");
        registry.insert(a.clone());
        registry.insert(b.clone());

        assert!(registry.unicast("b", &Message::command(Command::Stop)).unwrap());
        assert!(a.received().is_empty());
        assert_eq!(
            b.received(),
            vec![serde_json::json!({"type": "Command", "command": "STOP"})]
        );
    }

    #[test]
    fn test_broadcast_sends_exactly_once_per_connection() {
        let registry = ConnectionRegistry::new();
        let sinks: Vec<_> = (0..5).map(|i| RecordingSink::new(&format!("c{}", i))).collect();
        for sink in &sinks {
            registry.insert(sink.clone());
        }

        let count = registry.broadcast(&Message::config(120, 0.1)).unwrap();
        assert_eq!(count, sinks.len());
        for sink in &sinks {
            assert_eq!(
                sink.received(),
                vec![serde_json::json!({"type": "Config", "crit_latency_ms": 120, "crit_packet_loss": 0.1})]
            );
        }
    }

    #[test]
    fn test_broadcast_to_empty_registry() {
        let registry: ConnectionRegistry<RecordingSink> = ConnectionRegistry::new();
        assert_eq!(registry.broadcast(&Message::command(Command::Start)).unwrap(), 0);
    }

    #[test]
    fn test_drain_empties_registry() {
        let registry = ConnectionRegistry::new();
        registry.insert(RecordingSink::new("a"));
        registry.insert(RecordingSink::new("b"));

        let mut drained: Vec<String> = registry.drain().iter().map(|c| c.id.clone()).collect();
        drained.sort();
        assert_eq!(drained, vec!["a", "b"]);
        assert!(registry.is_empty());
        assert_eq!(registry.stats().connection_count, 0);
    }
}
