use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use warden_core::{ConnectionId, LifecycleEvent, UserId, WardenError};

/// Bookkeeping for one live outbound connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionRecord {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub established_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Receiving side of a registered connection, handed to the transport.
pub struct ConnectionHandle {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub events: mpsc::Receiver<LifecycleEvent>,
}

struct ConnectionEntry {
    record: ConnectionRecord,
    sender: mpsc::Sender<LifecycleEvent>,
}

struct ConnectionsInner {
    by_id: HashMap<ConnectionId, ConnectionEntry>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
}

/// Maps user identities to their live outbound connections.
///
/// Mutated only by the connection lifecycle (add/remove); engines never
/// touch it directly. Each connection carries its own bounded event queue.
pub struct ConnectionRegistry {
    queue_capacity: usize,
    inner: RwLock<ConnectionsInner>,
}

impl ConnectionRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue_capacity: queue_capacity.max(1),
            inner: RwLock::new(ConnectionsInner {
                by_id: HashMap::new(),
                by_user: HashMap::new(),
            }),
        }
    }

    /// Register a new connection for `user_id` and return its handle.
    pub async fn add(&self, user_id: &str) -> ConnectionHandle {
        let connection_id = uuid::Uuid::new_v4();
        let (sender, events) = mpsc::channel(self.queue_capacity);
        let now = Utc::now();
        let record = ConnectionRecord {
            connection_id,
            user_id: user_id.to_string(),
            established_at: now,
            last_activity: now,
        };

        let mut inner = self.inner.write().await;
        inner
            .by_id
            .insert(connection_id, ConnectionEntry { record, sender });
        inner
            .by_user
            .entry(user_id.to_string())
            .or_default()
            .insert(connection_id);
        info!(user_id = %user_id, connection_id = %connection_id, "connection registered");

        ConnectionHandle {
            connection_id,
            user_id: user_id.to_string(),
            events,
        }
    }

    /// Remove a connection on disconnect or expiry.
    pub async fn remove(&self, connection_id: ConnectionId) -> Result<(), WardenError> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .by_id
            .remove(&connection_id)
            .ok_or_else(|| WardenError::ConnectionNotFound(connection_id.to_string()))?;
        if let Some(set) = inner.by_user.get_mut(&entry.record.user_id) {
            set.remove(&connection_id);
            if set.is_empty() {
                inner.by_user.remove(&entry.record.user_id);
            }
        }
        debug!(
            user_id = %entry.record.user_id,
            connection_id = %connection_id,
            "connection removed"
        );
        Ok(())
    }

    /// The current set of connection ids for `user_id`; never another
    /// user's.
    pub async fn connections_for(&self, user_id: &str) -> Vec<ConnectionId> {
        let inner = self.inner.read().await;
        inner
            .by_user
            .get(user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Senders for every live connection of `user_id`, for delivery.
    pub(crate) async fn senders_for(
        &self,
        user_id: &str,
    ) -> Vec<(ConnectionId, mpsc::Sender<LifecycleEvent>)> {
        let inner = self.inner.read().await;
        let Some(ids) = inner.by_user.get(user_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| {
                inner
                    .by_id
                    .get(id)
                    .map(|entry| (*id, entry.sender.clone()))
            })
            .collect()
    }

    /// Bump `last_activity` after a successful delivery.
    pub(crate) async fn touch(&self, connection_id: ConnectionId) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.by_id.get_mut(&connection_id) {
            entry.record.last_activity = Utc::now();
        }
    }

    pub async fn record(&self, connection_id: ConnectionId) -> Option<ConnectionRecord> {
        self.inner
            .read()
            .await
            .by_id
            .get(&connection_id)
            .map(|entry| entry.record.clone())
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.by_id.len()
    }
}
