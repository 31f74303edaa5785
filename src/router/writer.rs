//! Transport-neutral typed-message writers
//!
//! A `Writer` is the only way components talk back to a client. The sender
//! half serializes typed frames into a bounded channel; the connection task
//! drains the channel into whatever transport it owns (WebSocket here, but
//! nothing in the interface assumes one). A full channel blocks the
//! producer, which is the intended backpressure signal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::messages::Outgoing;

/// Frames buffered per connection before producers block
const WRITER_CAPACITY: usize = 64;

/// A typed-message sender bound to one client
#[derive(Clone)]
pub struct Writer {
    tx: mpsc::Sender<String>,
}

impl Writer {
    /// Create a writer and the receiving half the connection task drains
    pub fn channel() -> (Writer, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(WRITER_CAPACITY);
        (Writer { tx }, rx)
    }

    /// Send a typed frame; false once the client is gone
    pub async fn send(&self, message: &Outgoing) -> bool {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize outgoing frame: {}", e);
                return false;
            }
        };
        self.tx.send(text).await.is_ok()
    }

    /// Forward an opaque JSON object (SDK events pass through untouched)
    pub async fn send_raw(&self, value: &Value) -> bool {
        let text = match serde_json::to_string(value) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize raw frame: {}", e);
                return false;
            }
        };
        self.tx.send(text).await.is_ok()
    }

    /// Non-blocking send used for broadcasts; a slow client drops the frame
    fn try_send(&self, text: String) -> bool {
        self.tx.try_send(text).is_ok()
    }

    /// Whether the peer can still receive
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Registry of connected writers for broadcast delivery
#[derive(Default)]
pub struct WriterRegistry {
    writers: RwLock<HashMap<u64, Writer>>,
    next_id: AtomicU64,
}

impl WriterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a writer at connection open; returns its handle
    pub fn register(&self, writer: Writer) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.writers.write().insert(id, writer);
        id
    }

    /// Remove a writer at connection close
    pub fn remove(&self, id: u64) {
        self.writers.write().remove(&id);
    }

    /// Deliver a frame to every open client. Per-client failures are logged
    /// and skipped; they never affect other clients.
    pub fn broadcast(&self, message: &Outgoing) {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize broadcast frame: {}", e);
                return;
            }
        };

        let writers = self.writers.read();
        for (id, writer) in writers.iter() {
            if !writer.is_open() {
                continue;
            }
            if !writer.try_send(text.clone()) {
                debug!("Broadcast to client {} failed, skipping", id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.writers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.writers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_reaches_receiver() {
        let (writer, mut rx) = Writer::channel();

        assert!(writer.send(&Outgoing::output("hello")).await);

        let text = rx.recv().await.unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "output");
        assert_eq!(value["data"], "hello");
    }

    #[tokio::test]
    async fn test_send_fails_after_receiver_drops() {
        let (writer, rx) = Writer::channel();
        drop(rx);

        assert!(!writer.send(&Outgoing::output("hello")).await);
        assert!(!writer.is_open());
    }

    #[tokio::test]
    async fn test_broadcast_skips_dead_clients() {
        let registry = WriterRegistry::new();

        let (alive, mut alive_rx) = Writer::channel();
        let (dead, dead_rx) = Writer::channel();
        drop(dead_rx);

        registry.register(alive);
        registry.register(dead);

        registry.broadcast(&Outgoing::TaskmasterEvent {
            event: "tasks-updated".into(),
            payload: serde_json::json!({"count": 3}),
        });

        let text = alive_rx.recv().await.unwrap();
        assert!(text.contains("taskmaster-event"));
    }

    #[tokio::test]
    async fn test_register_remove() {
        let registry = WriterRegistry::new();
        let (writer, _rx) = Writer::channel();

        let id = registry.register(writer);
        assert_eq!(registry.len(), 1);

        registry.remove(id);
        assert!(registry.is_empty());
    }
}
