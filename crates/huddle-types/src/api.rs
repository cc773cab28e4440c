use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::MessagePayload;

// -- JWT Claims --

/// JWT claims shared between huddle-api (REST middleware) and the WebSocket
/// upgrade handler. Canonical definition lives here to avoid duplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user_id: Uuid,
    pub username: String,
    pub token: String,
}

// -- Users --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub username: String,
}

// -- Groups --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateGroupRequest {
    pub name: String,
    /// Invitees; the creator is added implicitly and becomes admin.
    pub user_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct GroupInfoResponse {
    pub group_id: Uuid,
    pub name: String,
    pub is_admin: bool,
    /// Members other than the requesting user.
    pub users: Vec<UserSummary>,
}

/// One entry of "list my groups": the group plus its visible history and
/// counts, ready for a conversation-list screen.
#[derive(Debug, Serialize)]
pub struct GroupOverview {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Timestamp of the latest message, falling back to the creation time.
    pub sort_date: DateTime<Utc>,
    pub messages: Vec<MessagePayload>,
    pub messages_count: usize,
    pub users_count: usize,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddMembersRequest {
    pub user_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct AddMembersResponse {
    pub added: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct LeaveGroupResponse {
    pub deleted_group: bool,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub text: String,
    pub reply_id: Option<Uuid>,
}

// -- AI --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AiMessageRequest {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct AiReply {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnippetsResponse {
    pub snippets: Vec<String>,
}

/// One turn of a user's AI exchange, as returned by the AI history endpoint.
/// `username` is the literal "AI" for assistant turns.
#[derive(Debug, Serialize)]
pub struct AiHistoryEntry {
    pub id: Uuid,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub username: String,
}
