//! Registry of live remote connections.
//!
//! All mutation goes through registry methods. The key map is the arbiter
//! for registration so that two concurrent registrations with the same key
//! cannot create two connections. Pushes are `try_send` on a bounded
//! channel and never wait on the peer.

use chrono::Utc;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use smartspace_core::{
    Connection, ConnectionId, EntityIdType, IdentityId, PushMessage, Timestamp,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Result of a registration.
#[derive(Debug)]
pub struct Registration {
    pub connection_id: ConnectionId,
    /// Messages pushed to this connection. Replaced on every reconnect.
    pub receiver: mpsc::Receiver<PushMessage>,
    /// The key was already registered and its connection was reused.
    pub reconnected: bool,
}

/// Why a push did not reach the peer's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    UnknownConnection,
    BufferFull,
    Closed,
}

struct Slot {
    connection: Connection,
    tx: mpsc::Sender<PushMessage>,
}

/// Live connections keyed by their stable client key.
pub struct ConnectionRegistry {
    by_key: DashMap<String, Slot>,
    keys: DashMap<ConnectionId, String>,
    push_buffer: usize,
}

impl ConnectionRegistry {
    pub fn new(push_buffer: usize) -> Self {
        Self {
            by_key: DashMap::new(),
            keys: DashMap::new(),
            push_buffer: push_buffer.max(1),
        }
    }

    /// Register a connection. Registering an existing key refreshes its
    /// liveness and capabilities and keeps its id.
    pub fn register(
        &self,
        owner: IdentityId,
        connection_key: &str,
        capabilities: Vec<String>,
    ) -> Registration {
        let (tx, receiver) = mpsc::channel(self.push_buffer);
        let now = Utc::now();

        let (connection_id, reconnected) = match self.by_key.entry(connection_key.to_string()) {
            MapEntry::Occupied(mut slot) => {
                let slot = slot.get_mut();
                slot.connection.owner = owner;
                slot.connection.capabilities = capabilities;
                slot.connection.last_seen = now;
                slot.tx = tx;
                (slot.connection.connection_id, true)
            }
            MapEntry::Vacant(vacant) => {
                let connection_id = ConnectionId::now_v7();
                vacant.insert(Slot {
                    connection: Connection {
                        connection_id,
                        connection_key: connection_key.to_string(),
                        owner,
                        capabilities,
                        connected_at: now,
                        last_seen: now,
                    },
                    tx,
                });
                (connection_id, false)
            }
        };
        self.keys.insert(connection_id, connection_key.to_string());

        if reconnected {
            info!(connection_id = %connection_id, connection_key, "Connection re-registered");
        } else {
            info!(connection_id = %connection_id, connection_key, owner = %owner, "Connection registered");
        }

        Registration {
            connection_id,
            receiver,
            reconnected,
        }
    }

    /// Record a ping. Returns false for unknown connections.
    pub fn touch(&self, connection_id: ConnectionId) -> bool {
        let Some(key) = self.keys.get(&connection_id).map(|k| k.clone()) else {
            return false;
        };
        match self.by_key.get_mut(&key) {
            Some(mut entry) if entry.connection.connection_id == connection_id => {
                entry.connection.last_seen = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// Remove a connection, returning it if it was registered.
    pub fn deregister(&self, connection_id: ConnectionId) -> Option<Connection> {
        let (_, key) = self.keys.remove(&connection_id)?;
        let (_, entry) = self
            .by_key
            .remove_if(&key, |_, entry| entry.connection.connection_id == connection_id)?;
        info!(connection_id = %connection_id, connection_key = %key, "Connection deregistered");
        Some(entry.connection)
    }

    /// Best-effort, non-blocking push.
    pub fn push(&self, connection_id: ConnectionId, message: PushMessage) -> Result<(), PushError> {
        let tx = {
            let key = self
                .keys
                .get(&connection_id)
                .map(|k| k.clone())
                .ok_or(PushError::UnknownConnection)?;
            let entry = self.by_key.get(&key).ok_or(PushError::UnknownConnection)?;
            entry.tx.clone()
        };
        match tx.try_send(message) {
            Ok(()) => {
                debug!(connection_id = %connection_id, "Message pushed");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(connection_id = %connection_id, "Push buffer full, message dropped");
                Err(PushError::BufferFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(connection_id = %connection_id, "Push receiver closed");
                Err(PushError::Closed)
            }
        }
    }

    pub fn get(&self, connection_id: ConnectionId) -> Option<Connection> {
        let key = self.keys.get(&connection_id).map(|k| k.clone())?;
        self.get_by_key(&key)
            .filter(|c| c.connection_id == connection_id)
    }

    pub fn get_by_key(&self, connection_key: &str) -> Option<Connection> {
        self.by_key
            .get(connection_key)
            .map(|entry| entry.connection.clone())
    }

    pub fn is_live(&self, connection_id: ConnectionId) -> bool {
        self.get(connection_id).is_some()
    }

    pub fn list_by_identity(&self, owner: IdentityId) -> Vec<Connection> {
        let mut out: Vec<Connection> = self
            .by_key
            .iter()
            .filter(|entry| entry.connection.owner == owner)
            .map(|entry| entry.connection.clone())
            .collect();
        out.sort_by_key(|c| c.connected_at);
        out
    }

    /// Pick a connection able to run `tool_name`.
    ///
    /// Connections owned by `preferred_owner` win, then the most recently
    /// seen. `exclude` is skipped.
    pub fn find_capable(
        &self,
        tool_name: &str,
        preferred_owner: Option<IdentityId>,
        exclude: Option<ConnectionId>,
    ) -> Option<Connection> {
        self.by_key
            .iter()
            .filter(|entry| Some(entry.connection.connection_id) != exclude)
            .filter(|entry| entry.connection.has_capability(tool_name))
            .map(|entry| entry.connection.clone())
            .max_by_key(|c| (Some(c.owner) == preferred_owner, c.last_seen))
    }

    /// Connections not seen for longer than `timeout` at `now`.
    pub fn stale(&self, now: Timestamp, timeout: Duration) -> Vec<ConnectionId> {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        self.by_key
            .iter()
            .filter(|entry| now - entry.connection.last_seen > timeout)
            .map(|entry| entry.connection.connection_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smartspace_core::RunId;

    fn request() -> PushMessage {
        PushMessage::ToolCallRequest {
            run_id: RunId::now_v7(),
            call_id: "c1".to_string(),
            tool_name: "camera.snap".to_string(),
            args: serde_json::json!({}),
        }
    }

    #[test]
    fn test_register_is_idempotent_on_key() {
        let registry = ConnectionRegistry::new(4);
        let owner = IdentityId::now_v7();
        let first = registry.register(owner, "phone", vec!["camera.snap".to_string()]);
        let second = registry.register(owner, "phone", vec!["camera.snap".to_string()]);

        assert_eq!(first.connection_id, second.connection_id);
        assert!(!first.reconnected);
        assert!(second.reconnected);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.list_by_identity(owner).len(), 1);
    }

    #[tokio::test]
    async fn test_push_reaches_latest_receiver() {
        let registry = ConnectionRegistry::new(4);
        let owner = IdentityId::now_v7();
        let mut old = registry.register(owner, "phone", vec![]).receiver;
        let mut reg = registry.register(owner, "phone", vec![]);

        registry.push(reg.connection_id, request()).unwrap();
        assert!(reg.receiver.recv().await.is_some());
        assert!(old.recv().await.is_none());
    }

    #[test]
    fn test_push_never_blocks_when_full() {
        let registry = ConnectionRegistry::new(1);
        let reg = registry.register(IdentityId::now_v7(), "slow", vec![]);
        registry.push(reg.connection_id, request()).unwrap();
        assert_eq!(
            registry.push(reg.connection_id, request()),
            Err(PushError::BufferFull)
        );
        drop(reg.receiver);
        assert_eq!(
            registry.push(reg.connection_id, request()),
            Err(PushError::Closed)
        );
    }

    #[test]
    fn test_deregister_and_unknown_push() {
        let registry = ConnectionRegistry::new(4);
        let reg = registry.register(IdentityId::now_v7(), "phone", vec![]);
        assert!(registry.deregister(reg.connection_id).is_some());
        assert!(registry.deregister(reg.connection_id).is_none());
        assert!(!registry.is_live(reg.connection_id));
        assert_eq!(
            registry.push(reg.connection_id, request()),
            Err(PushError::UnknownConnection)
        );
        assert!(!registry.touch(reg.connection_id));
    }

    #[test]
    fn test_find_capable_prefers_owner() {
        let registry = ConnectionRegistry::new(4);
        let alice = IdentityId::now_v7();
        let bob = IdentityId::now_v7();
        registry.register(alice, "alice-phone", vec!["camera.snap".to_string()]);
        registry.register(bob, "bob-phone", vec!["*".to_string()]);
        registry.register(bob, "bob-watch", vec!["heart.rate".to_string()]);

        let picked = registry.find_capable("camera.snap", Some(alice), None).unwrap();
        assert_eq!(picked.connection_key, "alice-phone");
        let picked = registry.find_capable("camera.snap", Some(bob), None).unwrap();
        assert_eq!(picked.connection_key, "bob-phone");
        let excluded = registry
            .find_capable("camera.snap", Some(bob), Some(picked.connection_id))
            .unwrap();
        assert_eq!(excluded.connection_key, "alice-phone");
        assert!(registry.find_capable("door.open", None, None).is_none());
    }

    #[test]
    fn test_stale_connections_detected() {
        let registry = ConnectionRegistry::new(4);
        let reg = registry.register(IdentityId::now_v7(), "phone", vec![]);
        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(registry.stale(later, Duration::from_secs(90)), vec![reg.connection_id]);
        assert!(registry.stale(Utc::now(), Duration::from_secs(90)).is_empty());
    }
}
