use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use huddle_types::events::GatewayEvent;

use crate::registry::ConnectionRegistry;
use crate::rooms::RoomIndex;

/// Fans persisted events out to live connections, over the registry and
/// room index it receives at construction.
///
/// Delivery is best-effort: an offline target is a silent no-op, never an
/// error, and a failed delivery never affects the durable write that
/// preceded it.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomIndex>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>, rooms: Arc<RoomIndex>) -> Self {
        Self { registry, rooms }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn rooms(&self) -> &RoomIndex {
        &self.rooms
    }

    /// Admit a connection and resubscribe-from-scratch semantics: any
    /// subscriptions belonging to a superseded connection are dropped before
    /// the caller builds the new ones.
    pub async fn admit(&self, user_id: Uuid, tx: mpsc::UnboundedSender<GatewayEvent>) -> Uuid {
        self.rooms.unsubscribe_all(user_id).await;
        self.registry.admit(user_id, tx).await
    }

    /// Tear down a connection. A superseded connection releasing late leaves
    /// the newer connection's registration and subscriptions untouched.
    pub async fn release(&self, user_id: Uuid, conn_id: Uuid) {
        if self.registry.remove(user_id, conn_id).await {
            self.rooms.unsubscribe_all(user_id).await;
        }
    }

    /// Subscribe a user's live connection to a room; no-op when offline.
    pub async fn subscribe_user(&self, user_id: Uuid, group_id: Uuid) {
        if self.registry.is_online(user_id).await {
            self.rooms.subscribe(group_id, user_id).await;
        }
    }

    /// Deliver to every subscribed connection in the room.
    pub async fn to_room(&self, group_id: Uuid, event: GatewayEvent) {
        self.fan_out(group_id, event, None).await;
    }

    /// Deliver to the room, skipping one user — typically the actor, who
    /// already got the same data as their call's return value. When the
    /// excluded user has no connection there is nothing to skip and this
    /// behaves exactly like [`to_room`].
    pub async fn to_room_except(&self, group_id: Uuid, event: GatewayEvent, excluded: Uuid) {
        self.fan_out(group_id, event, Some(excluded)).await;
    }

    /// Point-to-point delivery; silently dropped when the user is offline.
    pub async fn to_user(&self, user_id: Uuid, event: GatewayEvent) {
        if let Some(tx) = self.registry.sender_for(user_id).await {
            let _ = tx.send(event);
        }
    }

    async fn fan_out(&self, group_id: Uuid, event: GatewayEvent, excluded: Option<Uuid>) {
        let members = self.rooms.members_of(group_id).await;
        for user_id in members {
            if excluded == Some(user_id) {
                continue;
            }
            if let Some(tx) = self.registry.sender_for(user_id).await {
                // A closed channel means the connection died between the
                // snapshot and the send; the registry catches up on release.
                let _ = tx.send(event.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            Arc::new(ConnectionRegistry::new()),
            Arc::new(RoomIndex::new()),
        )
    }

    async fn join(d: &Dispatcher, group: Uuid) -> (Uuid, Uuid, UnboundedReceiver<GatewayEvent>) {
        let user = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = d.admit(user, tx).await;
        d.subscribe_user(user, group).await;
        (user, conn, rx)
    }

    fn event() -> GatewayEvent {
        GatewayEvent::DeleteGroup { id: Uuid::nil() }
    }

    #[tokio::test]
    async fn room_except_skips_only_the_excluded_user() {
        let d = dispatcher();
        let group = Uuid::new_v4();
        let (sender, _c1, mut sender_rx) = join(&d, group).await;
        let (_u2, _c2, mut rx2) = join(&d, group).await;
        let (_u3, _c3, mut rx3) = join(&d, group).await;

        d.to_room_except(group, event(), sender).await;

        assert!(rx2.try_recv().is_ok());
        assert!(rx3.try_recv().is_ok());
        assert!(sender_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn room_except_degrades_to_full_room_when_user_is_offline() {
        let d = dispatcher();
        let group = Uuid::new_v4();
        let (_u1, _c1, mut rx1) = join(&d, group).await;
        let offline = Uuid::new_v4();

        d.to_room_except(group, event(), offline).await;

        assert!(rx1.try_recv().is_ok());
    }

    #[tokio::test]
    async fn to_user_drops_silently_when_offline() {
        let d = dispatcher();
        // No connection registered; must not panic or error.
        d.to_user(Uuid::new_v4(), event()).await;
    }

    #[tokio::test]
    async fn delivery_after_supersession_reaches_only_the_new_connection() {
        let d = dispatcher();
        let group = Uuid::new_v4();
        let user = Uuid::new_v4();

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let conn1 = d.admit(user, tx1).await;
        d.subscribe_user(user, group).await;

        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let _conn2 = d.admit(user, tx2).await;
        d.subscribe_user(user, group).await;

        // The superseded connection's teardown races in afterwards.
        d.release(user, conn1).await;

        d.to_room(group, event()).await;
        assert!(rx2.try_recv().is_ok());
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn release_clears_subscriptions() {
        let d = dispatcher();
        let group = Uuid::new_v4();
        let (user, conn, _rx) = join(&d, group).await;

        d.release(user, conn).await;

        assert!(d.rooms().members_of(group).await.is_empty());
        assert!(!d.registry().is_online(user).await);
    }
}
