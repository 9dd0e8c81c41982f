use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use parley_types::events::ServerEnvelope;
use parley_types::models::UserId;

/// One live connection as seen by the registry: a bounded outbound queue
/// drained by the connection's writer task, plus a token the registry cancels
/// when it evicts the connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    tx: mpsc::Sender<ServerEnvelope>,
    evicted: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ServerEnvelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: Uuid::new_v4(),
            tx,
            evicted: CancellationToken::new(),
        };
        (handle, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue a frame for this connection only. Never waits on the peer.
    pub fn push(&self, envelope: ServerEnvelope) -> bool {
        self.tx.try_send(envelope).is_ok()
    }

    /// Resolves once the registry has dropped this connection.
    pub fn evicted(&self) -> &CancellationToken {
        &self.evicted
    }
}

/// Live map from user to every open connection of that user.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<UserId, HashMap<Uuid, ConnectionHandle>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection for `user_id`. Returns false if this exact
    /// connection was already registered.
    pub async fn register(&self, user_id: UserId, connection: &ConnectionHandle) -> bool {
        let mut users = self.inner.write().await;
        let connections = users.entry(user_id).or_default();
        let added = connections.insert(connection.id, connection.clone()).is_none();
        debug!(
            "User {} registered connection {} ({} open)",
            user_id,
            connection.id,
            connections.len()
        );
        added
    }

    /// Remove a connection. No-op if it is not registered.
    pub async fn unregister(&self, user_id: UserId, connection_id: Uuid) -> bool {
        let mut users = self.inner.write().await;
        let Some(connections) = users.get_mut(&user_id) else {
            return false;
        };
        let removed = connections.remove(&connection_id).is_some();
        if connections.is_empty() {
            users.remove(&user_id);
        }
        removed
    }

    /// Best-effort delivery to every connection of `user_id`. Connections
    /// whose queue is full or closed are evicted without affecting the rest.
    /// Returns how many connections accepted the frame; 0 means the user
    /// has to pull it later.
    pub async fn send_to_user(&self, user_id: UserId, envelope: &ServerEnvelope) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();

        {
            let users = self.inner.read().await;
            let Some(connections) = users.get(&user_id) else {
                return 0;
            };
            for (id, connection) in connections {
                if connection.push(envelope.clone()) {
                    delivered += 1;
                } else {
                    failed.push(*id);
                }
            }
        }

        if !failed.is_empty() {
            let mut users = self.inner.write().await;
            if let Some(connections) = users.get_mut(&user_id) {
                for id in &failed {
                    if let Some(connection) = connections.remove(id) {
                        warn!("Evicting connection {} of user {}: outbound queue full or closed", id, user_id);
                        connection.evicted.cancel();
                    }
                }
                if connections.is_empty() {
                    users.remove(&user_id);
                }
            }
        }

        delivered
    }

    pub async fn connection_count(&self, user_id: UserId) -> usize {
        self.inner
            .read()
            .await
            .get(&user_id)
            .map_or(0, HashMap::len)
    }

    pub async fn online_users(&self) -> usize {
        self.inner.read().await.len()
    }
}
