use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;
use uuid::Uuid;

/// Runtime delivery index: which connected users are subscribed to which
/// room. This is a cache over the durable membership table — every
/// membership write is followed by the matching update here, and a
/// disconnected user has no entries at all.
#[derive(Debug, Default)]
pub struct RoomIndex {
    inner: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
}

impl RoomIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, group_id: Uuid, user_id: Uuid) {
        let mut rooms = self.inner.write().await;
        rooms.entry(group_id).or_default().insert(user_id);
    }

    pub async fn unsubscribe(&self, group_id: Uuid, user_id: Uuid) {
        let mut rooms = self.inner.write().await;
        if let Some(members) = rooms.get_mut(&group_id) {
            members.remove(&user_id);
            if members.is_empty() {
                rooms.remove(&group_id);
            }
        }
    }

    /// Drop every subscription a user holds; called on disconnect and on
    /// supersession.
    pub async fn unsubscribe_all(&self, user_id: Uuid) {
        let mut rooms = self.inner.write().await;
        rooms.retain(|_, members| {
            members.remove(&user_id);
            !members.is_empty()
        });
    }

    /// Forget a room entirely (group deletion).
    pub async fn drop_room(&self, group_id: Uuid) {
        self.inner.write().await.remove(&group_id);
    }

    /// Snapshot of the room's subscribed users.
    pub async fn members_of(&self, group_id: Uuid) -> Vec<Uuid> {
        self.inner
            .read()
            .await
            .get(&group_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_unsubscribe_track_membership() {
        let rooms = RoomIndex::new();
        let group = Uuid::new_v4();
        let user = Uuid::new_v4();

        rooms.subscribe(group, user).await;
        assert_eq!(rooms.members_of(group).await, vec![user]);

        rooms.unsubscribe(group, user).await;
        assert!(rooms.members_of(group).await.is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_all_clears_every_room() {
        let rooms = RoomIndex::new();
        let user = Uuid::new_v4();
        let other = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        rooms.subscribe(a, user).await;
        rooms.subscribe(b, user).await;
        rooms.subscribe(b, other).await;

        rooms.unsubscribe_all(user).await;

        assert!(rooms.members_of(a).await.is_empty());
        assert_eq!(rooms.members_of(b).await, vec![other]);
    }

    #[tokio::test]
    async fn dropping_a_room_forgets_all_subscribers() {
        let rooms = RoomIndex::new();
        let group = Uuid::new_v4();

        rooms.subscribe(group, Uuid::new_v4()).await;
        rooms.subscribe(group, Uuid::new_v4()).await;
        rooms.drop_room(group).await;

        assert!(rooms.members_of(group).await.is_empty());
    }
}
