use std::collections::{HashMap, HashSet};

use log::warn;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::messages::ServerEvent;

pub type ConnectionId = Uuid;
pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

/// Outbound side of one realtime connection.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    conn_id: ConnectionId,
    tx: EventSender,
}

impl ConnectionHandle {
    pub fn new(conn_id: ConnectionId, tx: EventSender) -> Self {
        ConnectionHandle { conn_id, tx }
    }

    pub fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }

    /// Queues an event for the connection's writer. Returns false once the
    /// connection has gone away.
    pub fn send(&self, event: ServerEvent) -> bool {
        if self.tx.send(event).is_err() {
            warn!("Dropping event for closed connection {}", self.conn_id);
            return false;
        }
        true
    }
}

/// Maps each online user to the connection that most recently logged in as
/// that user. A later login replaces the earlier handle without closing it.
#[derive(Default)]
pub struct PresenceRegistry {
    online: RwLock<HashMap<String, ConnectionHandle>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handle` for `user_id` and returns the handle it replaced.
    pub async fn set_online(&self, user_id: &str, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let mut online = self.online.write().await;
        online.insert(user_id.to_string(), handle)
    }

    pub async fn remove(&self, user_id: &str) {
        let mut online = self.online.write().await;
        online.remove(user_id);
    }

    /// Removes `user_id` only while `conn_id` is still the registered
    /// connection, so a stale socket cannot log out a newer one.
    pub async fn remove_if_current(&self, user_id: &str, conn_id: ConnectionId) -> bool {
        let mut online = self.online.write().await;
        match online.get(user_id) {
            Some(handle) if handle.conn_id == conn_id => {
                online.remove(user_id);
                true
            }
            _ => false,
        }
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        self.online.read().await.contains_key(user_id)
    }

    pub async fn get(&self, user_id: &str) -> Option<ConnectionHandle> {
        self.online.read().await.get(user_id).cloned()
    }

    pub async fn list_online(&self) -> HashSet<String> {
        self.online.read().await.keys().cloned().collect()
    }

    /// Delivers `event` to the user's registered connection. Returns whether
    /// the user had one.
    pub async fn send(&self, user_id: &str, event: ServerEvent) -> bool {
        let online = self.online.read().await;
        match online.get(user_id) {
            Some(handle) => {
                handle.send(event);
                true
            }
            None => false,
        }
    }
}
