use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: Uuid,
    pub name: String,
    pub admin_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// One chat message as delivered over the wire — both as an HTTP response
/// and inside `new_message` gateway events. `me` is viewer-relative and is
/// set per recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: Uuid,
    pub text: String,
    pub username: String,
    pub user_id: Uuid,
    pub group_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub me: bool,
    pub reply: Option<ReplyPreview>,
}

/// Compact view of the message a reply points at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyPreview {
    pub id: Uuid,
    pub text: String,
    pub username: Option<String>,
}
