use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, State},
};
use tracing::warn;
use uuid::Uuid;

use huddle_db::{Database, models::MessageRow, parse_timestamp};
use huddle_gateway::Dispatcher;
use huddle_gateway::store::{self, NewMessage};
use huddle_types::api::{Claims, SendMessageRequest};
use huddle_types::events::GatewayEvent;
use huddle_types::models::{MessagePayload, ReplyPreview};

use crate::error::ApiError;
use crate::state::{AppState, blocking};

/// Map a stored row onto the wire payload, with the viewer-relative `me`
/// flag. Corrupt ids are logged and nulled rather than failing the whole
/// listing (matches how the rest of the read path degrades).
pub(crate) fn row_to_payload(row: MessageRow, viewer: Option<Uuid>) -> MessagePayload {
    let sender_id: Uuid = row.sender_id.parse().unwrap_or_else(|e| {
        warn!("Corrupt sender id '{}' on message '{}': {}", row.sender_id, row.id, e);
        Uuid::default()
    });

    let reply = match (row.reply_to_id, row.reply_text) {
        (Some(raw_id), Some(text)) => raw_id
            .parse()
            .map(|id| ReplyPreview {
                id,
                text,
                username: row.reply_username,
            })
            .map_err(|e| warn!("Corrupt reply id '{}' on message '{}': {}", raw_id, row.id, e))
            .ok(),
        _ => None,
    };

    MessagePayload {
        id: row.id.parse().unwrap_or_else(|e| {
            warn!("Corrupt message id '{}': {}", row.id, e);
            Uuid::default()
        }),
        text: row.text,
        username: row.sender_username.unwrap_or_else(|| "unknown".to_string()),
        user_id: sender_id,
        group_id: row.group_id.and_then(|g| g.parse().ok()),
        created_at: parse_timestamp(&row.created_at),
        me: viewer == Some(sender_id),
        reply,
    }
}

/// Persist a message, fan it out to the room minus the sender, and hand the
/// stored payload (with `me = true`) back for the synchronous response. The
/// write always lands before anything is dispatched, and a room with nobody
/// online simply delivers to nobody.
pub async fn send(
    db: &Arc<Database>,
    dispatcher: &Dispatcher,
    sender: Uuid,
    group_id: Uuid,
    req: SendMessageRequest,
) -> Result<MessagePayload, ApiError> {
    if req.text.trim().is_empty() {
        return Err(ApiError::Validation("message text cannot be empty"));
    }

    let stored = blocking(db.clone(), move |db| {
        store::persist_message(db, NewMessage::chat(&req.text, sender, group_id, req.reply_id))
            .map_err(ApiError::from)
    })
    .await?;

    dispatcher
        .to_room_except(group_id, GatewayEvent::NewMessage(stored.payload_for(None)), sender)
        .await;

    Ok(stored.payload_for(Some(sender)))
}

/// Plain (non-AI) history of a group, oldest first, `me` flags set for the
/// viewer.
pub async fn history(
    db: &Arc<Database>,
    viewer: Uuid,
    group_id: Uuid,
) -> Result<Vec<MessagePayload>, ApiError> {
    let rows = blocking(db.clone(), move |db| {
        db.get_group(&group_id.to_string())?
            .ok_or(ApiError::NotFound("group"))?;
        Ok(db.messages_for_group(&group_id.to_string(), false)?)
    })
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| row_to_payload(row, Some(viewer)))
        .collect())
}

/// Sender-only deletion; announces the removal to the room the message
/// lived in.
pub async fn delete(
    db: &Arc<Database>,
    dispatcher: &Dispatcher,
    requester: Uuid,
    message_id: Uuid,
) -> Result<(), ApiError> {
    let group = blocking(db.clone(), move |db| {
        store::delete_message(db, message_id, requester).map_err(ApiError::from)
    })
    .await?;

    if let Some(group_id) = group {
        dispatcher
            .to_room(group_id, GatewayEvent::DeleteMessage { message_id, group_id })
            .await;
    }

    Ok(())
}

// -- Handlers --

pub async fn send_message(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<MessagePayload>, ApiError> {
    let payload = send(&state.db, &state.dispatcher, claims.sub, group_id, req).await?;
    Ok(Json(payload))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<MessagePayload>>, ApiError> {
    let messages = history(&state.db, claims.sub, group_id).await?;
    Ok(Json(messages))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<serde_json::Value>, ApiError> {
    delete(&state.db, &state.dispatcher, claims.sub, message_id).await?;
    Ok(Json(serde_json::json!({ "deleted": true, "message_id": message_id })))
}
