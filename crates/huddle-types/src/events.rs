use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::MessagePayload;

/// Events sent over the WebSocket gateway. The set is closed: every event a
/// client can receive is a variant here, so dispatch sites are checked at
/// compile time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// A message was posted to a group the client is subscribed to.
    NewMessage(MessagePayload),

    /// A message was removed by its sender.
    DeleteMessage { message_id: Uuid, group_id: Uuid },

    /// A group the client belongs to was created, or the client was added
    /// to an existing one. The history fields are only present on the
    /// added-to-existing path.
    NewGroup {
        id: Uuid,
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        messages: Option<Vec<MessagePayload>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        messages_count: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        users_count: Option<usize>,
    },

    /// A group was deleted, or the client was removed from it.
    DeleteGroup { id: Uuid },

    /// A command from this client failed.
    Error { message: String },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum GatewayCommand {
    /// Post a message to a group. The sender does not receive an echo; the
    /// message reaches everyone else in the room.
    SendMessage {
        group_id: Uuid,
        text: String,
        reply_id: Option<Uuid>,
    },

    /// Delete one of the sender's own messages.
    DeleteMessage { message_id: Uuid, group_id: Uuid },
}
