use std::collections::HashMap;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use huddle_types::events::GatewayEvent;

/// Outbound handle of one live connection. Dropping the sender ends the
/// connection's forward loop.
#[derive(Debug, Clone)]
struct Registered {
    conn_id: Uuid,
    tx: mpsc::UnboundedSender<GatewayEvent>,
}

/// Process-wide map of user id to their single live connection.
///
/// "Last login wins": admitting a user who already has a connection replaces
/// the old entry, and the superseded connection's later teardown becomes a
/// no-op because its conn id no longer matches.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    inner: RwLock<HashMap<Uuid, Registered>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a connection for `user_id`, superseding any prior one.
    /// Returns the connection id the caller must present to `remove`.
    pub async fn admit(&self, user_id: Uuid, tx: mpsc::UnboundedSender<GatewayEvent>) -> Uuid {
        let conn_id = Uuid::new_v4();
        let mut map = self.inner.write().await;
        if map.insert(user_id, Registered { conn_id, tx }).is_some() {
            tracing::debug!("superseded previous connection for {}", user_id);
        }
        conn_id
    }

    /// Remove a connection, but only if `conn_id` still owns the entry.
    /// Returns whether anything was removed; a stale conn id is a no-op.
    pub async fn remove(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        let mut map = self.inner.write().await;
        match map.get(&user_id) {
            Some(entry) if entry.conn_id == conn_id => {
                map.remove(&user_id);
                true
            }
            _ => false,
        }
    }

    /// Outbound sender for a user, if they are connected.
    pub async fn sender_for(&self, user_id: Uuid) -> Option<mpsc::UnboundedSender<GatewayEvent>> {
        self.inner.read().await.get(&user_id).map(|e| e.tx.clone())
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.inner.read().await.contains_key(&user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (
        mpsc::UnboundedSender<GatewayEvent>,
        mpsc::UnboundedReceiver<GatewayEvent>,
    ) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn second_admit_supersedes_the_first() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();

        let (tx1, mut rx1) = channel();
        let (tx2, mut rx2) = channel();

        let conn1 = registry.admit(user, tx1).await;
        let conn2 = registry.admit(user, tx2).await;
        assert_ne!(conn1, conn2);

        let sender = registry.sender_for(user).await.unwrap();
        sender
            .send(GatewayEvent::DeleteGroup { id: Uuid::nil() })
            .unwrap();

        // Only the second connection sees the event.
        assert!(rx2.recv().await.is_some());
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_remove_does_not_evict_the_newer_connection() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();

        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();

        let conn1 = registry.admit(user, tx1).await;
        let _conn2 = registry.admit(user, tx2).await;

        // The superseded connection tears down late; the newer one survives.
        assert!(!registry.remove(user, conn1).await);
        assert!(registry.is_online(user).await);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();

        let (tx, _rx) = channel();
        let conn = registry.admit(user, tx).await;

        assert!(registry.remove(user, conn).await);
        assert!(!registry.remove(user, conn).await);
        assert!(!registry.is_online(user).await);
    }
}
