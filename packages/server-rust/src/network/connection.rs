//! Message-transport connections and their registry.
//!
//! Each connection owns a bounded outbound queue drained by its socket writer
//! task, plus the persistent data its upgrade derivation produced.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use switchyard_core::{ConnectionMeta, ContextValues, ExecutionContext, TransportError};
use tokio::sync::{mpsc, OnceCell};

use super::config::ConnectionConfig;

/// Registry-assigned connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Frame queued for the socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Text(String),
    /// Close frame with an optional reason.
    Close(Option<String>),
}

/// Handle to one open connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub tx: mpsc::Sender<OutboundMessage>,
    /// Transport handle seen by handlers as `ctx.connection()`.
    pub meta: Arc<ConnectionMeta>,
    /// Context derived on first dispatch and reused afterwards.
    pub context: OnceCell<ExecutionContext>,
    pub connected_at: Instant,
}

impl ConnectionHandle {
    /// Enqueues without waiting. Returns `false` if the queue is full or the
    /// writer is gone.
    #[must_use]
    pub fn try_send(&self, msg: OutboundMessage) -> bool {
        self.tx.try_send(msg).is_ok()
    }

    /// Enqueues, waiting up to `timeout` for queue space.
    ///
    /// # Errors
    ///
    /// `TransportError::SendTimeout` if the queue stays full,
    /// `TransportError::NotOpen` if the writer has exited.
    pub async fn send_timeout(
        &self,
        msg: OutboundMessage,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        match tokio::time::timeout(timeout, self.tx.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::NotOpen),
            Err(_) => Err(TransportError::SendTimeout),
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Concurrent registry of open connections.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Ids start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a connection carrying `data`, returning its handle and the
    /// receiver the socket writer drains.
    pub fn register(
        &self,
        config: &ConnectionConfig,
        data: ContextValues,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(config.outbound_channel_capacity);

        let handle = Arc::new(ConnectionHandle {
            id,
            tx,
            meta: Arc::new(ConnectionMeta { id: id.0, data }),
            context: OnceCell::new(),
            connected_at: Instant::now(),
        });

        self.connections.insert(id, Arc::clone(&handle));
        (handle, rx)
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.remove(&id).map(|(_, handle)| handle)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&id).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Removes and returns every connection. Used during shutdown.
    pub fn drain_all(&self) -> Vec<Arc<ConnectionHandle>> {
        let keys: Vec<ConnectionId> = self.connections.iter().map(|entry| *entry.key()).collect();
        keys.into_iter()
            .filter_map(|key| self.connections.remove(&key).map(|(_, handle)| handle))
            .collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn small_channel_config() -> ConnectionConfig {
        ConnectionConfig {
            outbound_channel_capacity: 2,
            ..ConnectionConfig::default()
        }
    }

    fn data() -> ContextValues {
        switchyard_core::to_values(json!({"user": "ada"}))
    }

    #[test]
    fn register_assigns_sequential_ids_and_keeps_data() {
        let registry = ConnectionRegistry::new();
        let config = ConnectionConfig::default();

        let (first, _rx1) = registry.register(&config, data());
        let (second, _rx2) = registry.register(&config, ContextValues::new());

        assert_eq!(first.id, ConnectionId(1));
        assert_eq!(second.id, ConnectionId(2));
        assert_eq!(first.meta.id, 1);
        assert_eq!(first.meta.data.get("user"), Some(&json!("ada")));
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn remove_and_get() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = registry.register(&ConnectionConfig::default(), data());
        let id = handle.id;

        assert!(registry.get(id).is_some());
        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
        assert!(registry.get(ConnectionId(999)).is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn drain_all_empties_registry() {
        let registry = ConnectionRegistry::new();
        let config = ConnectionConfig::default();
        let (_h1, _rx1) = registry.register(&config, data());
        let (_h2, _rx2) = registry.register(&config, data());

        assert_eq!(registry.drain_all().len(), 2);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn try_send_respects_capacity() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = registry.register(&small_channel_config(), data());

        assert!(handle.try_send(OutboundMessage::Text("1".into())));
        assert!(handle.try_send(OutboundMessage::Text("2".into())));
        assert!(!handle.try_send(OutboundMessage::Text("3".into())));
    }

    #[test]
    fn dropped_receiver_means_disconnected() {
        let registry = ConnectionRegistry::new();
        let (handle, rx) = registry.register(&ConnectionConfig::default(), data());
        assert!(handle.is_connected());
        drop(rx);
        assert!(!handle.is_connected());
        assert!(!handle.try_send(OutboundMessage::Close(None)));
    }

    #[tokio::test]
    async fn send_timeout_reports_closed_connection() {
        let registry = ConnectionRegistry::new();
        let (handle, rx) = registry.register(&ConnectionConfig::default(), data());
        drop(rx);

        let result = handle
            .send_timeout(OutboundMessage::Text("x".into()), Duration::from_secs(1))
            .await;
        assert_eq!(result, Err(TransportError::NotOpen));
    }

    #[tokio::test(start_paused = true)]
    async fn send_timeout_expires_when_queue_stays_full() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = registry.register(&small_channel_config(), data());
        assert!(handle.try_send(OutboundMessage::Text("1".into())));
        assert!(handle.try_send(OutboundMessage::Text("2".into())));

        let result = handle
            .send_timeout(OutboundMessage::Text("3".into()), Duration::from_millis(50))
            .await;
        assert_eq!(result, Err(TransportError::SendTimeout));
    }
}
