use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, State},
};
use tracing::warn;
use uuid::Uuid;

use huddle_db::{Database, models::MessageRow, parse_timestamp};
use huddle_gateway::store::{self, NewMessage};
use huddle_llm::prompts::{
    ASSISTANT_SYSTEM, SNIPPETS_SYSTEM, SUMMARY_SYSTEM, TranscriptEntry, assistant_prompt,
    format_transcript, profile_prompt,
};
use huddle_llm::{ChatTurn, LanguageModel, Role};
use huddle_types::api::{AiHistoryEntry, AiMessageRequest, AiReply, Claims, SnippetsResponse};

use crate::error::ApiError;
use crate::state::{AppState, blocking};

/// Fixed reply handed back when the model collaborator fails. The user's
/// own turn stays persisted either way; only the assistant's answer is
/// missing.
pub const FAILURE_REPLY: &str = "Error";

/// Questions every snippet list starts with, before whatever the model adds.
const SNIPPET_SEEDS: [&str; 3] = [
    "What's happening in this chat?",
    "Describe the participants",
    "Were any decisions made?",
];

fn transcript_entries(rows: Vec<MessageRow>) -> Vec<TranscriptEntry> {
    rows.into_iter()
        .map(|row| TranscriptEntry {
            username: row.sender_username.unwrap_or_else(|| "unknown".to_string()),
            timestamp: parse_timestamp(&row.created_at),
            text: row.text,
        })
        .collect()
}

fn exchange_turns(rows: Vec<MessageRow>) -> Vec<ChatTurn> {
    rows.into_iter()
        .map(|row| ChatTurn {
            role: if row.is_ai_answer { Role::Assistant } else { Role::User },
            content: row.text,
        })
        .collect()
}

/// One assistant turn: persist the user's prompt, build context, call the
/// model, persist the answer, return it. The user turn is written before
/// the model call: if the collaborator times out or errors, the prompt
/// survives in history, the answer is never written, and the caller gets
/// the fixed failure reply instead of an error.
pub async fn converse(
    db: &Arc<Database>,
    model: &Arc<dyn LanguageModel>,
    sender: Uuid,
    group_id: Option<Uuid>,
    req: AiMessageRequest,
) -> Result<AiReply, ApiError> {
    if req.text.trim().is_empty() {
        return Err(ApiError::Validation("message text cannot be empty"));
    }

    let text = req.text;
    let text_for_store = text.clone();
    let (transcript, history) = blocking(db.clone(), move |db| {
        let transcript = match group_id {
            Some(group_id) => {
                let rows = db.messages_for_group(&group_id.to_string(), false)?;
                format_transcript(&transcript_entries(rows))
            }
            None => String::new(),
        };

        let exchange = match group_id {
            Some(group_id) => {
                db.ai_exchange_in_group(&group_id.to_string(), &sender.to_string())?
            }
            None => db.ai_exchange_direct(&sender.to_string())?,
        };

        store::persist_message(db, NewMessage::ai_prompt(&text_for_store, sender, group_id))
            .map_err(ApiError::from)?;

        Ok((transcript, exchange_turns(exchange)))
    })
    .await?;

    let prompt = assistant_prompt(&text, &transcript);
    match model.complete(ASSISTANT_SYSTEM, &history, &prompt).await {
        Ok(answer) => {
            let answer_for_store = answer.clone();
            blocking(db.clone(), move |db| {
                store::persist_message(db, NewMessage::ai_answer(&answer_for_store, sender, group_id))
                    .map_err(ApiError::from)
            })
            .await?;
            Ok(AiReply { message: answer })
        }
        Err(e) => {
            warn!("assistant call failed: {}", e);
            Ok(AiReply {
                message: FAILURE_REPLY.to_string(),
            })
        }
    }
}

/// The caller's AI exchange within a group: their prompts plus the
/// assistant's answers, labelled the way a chat UI wants them.
pub async fn exchange_history(
    db: &Arc<Database>,
    viewer: Uuid,
    group_id: Uuid,
) -> Result<Vec<AiHistoryEntry>, ApiError> {
    let rows = blocking(db.clone(), move |db| {
        db.get_group(&group_id.to_string())?
            .ok_or(ApiError::NotFound("group"))?;
        Ok(db.ai_exchange_in_group(&group_id.to_string(), &viewer.to_string())?)
    })
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| AiHistoryEntry {
            id: row.id.parse().unwrap_or_else(|e| {
                warn!("Corrupt message id '{}': {}", row.id, e);
                Uuid::default()
            }),
            username: if row.is_ai_answer {
                "AI".to_string()
            } else {
                row.sender_username.unwrap_or_else(|| "unknown".to_string())
            },
            created_at: parse_timestamp(&row.created_at),
            text: row.text,
        })
        .collect())
}

/// Summarise a group's visible history. Failure of the model yields the
/// fixed failure reply, never an error.
pub async fn summary(
    db: &Arc<Database>,
    model: &Arc<dyn LanguageModel>,
    group_id: Uuid,
) -> Result<AiReply, ApiError> {
    let transcript = group_transcript(db, group_id).await?;

    match model.complete(SUMMARY_SYSTEM, &[], &transcript).await {
        Ok(answer) => Ok(AiReply { message: answer }),
        Err(e) => {
            warn!("summary call failed: {}", e);
            Ok(AiReply {
                message: FAILURE_REPLY.to_string(),
            })
        }
    }
}

/// Suggested one-line questions about the chat, for quick-ask buttons. The
/// fixed seeds always lead; a failing model or unparseable reply degrades
/// to an empty list.
pub async fn snippets(
    db: &Arc<Database>,
    model: &Arc<dyn LanguageModel>,
    group_id: Uuid,
) -> Result<SnippetsResponse, ApiError> {
    let transcript = group_transcript(db, group_id).await?;

    let generated = match model.complete(SNIPPETS_SYSTEM, &[], &transcript).await {
        Ok(raw) => match serde_json::from_str::<SnippetsResponse>(&raw) {
            Ok(parsed) => parsed.snippets,
            Err(e) => {
                warn!("snippets reply was not valid JSON: {}", e);
                return Ok(SnippetsResponse { snippets: vec![] });
            }
        },
        Err(e) => {
            warn!("snippets call failed: {}", e);
            return Ok(SnippetsResponse { snippets: vec![] });
        }
    };

    let mut snippets: Vec<String> = SNIPPET_SEEDS.iter().map(|s| s.to_string()).collect();
    snippets.extend(generated);
    Ok(SnippetsResponse { snippets })
}

/// Generate a JSON profile of a user from their messages. Context rule:
/// viewing yourself uses everything you have written; viewing someone else
/// uses only what they wrote in groups you share with them.
pub async fn profile(
    db: &Arc<Database>,
    model: &Arc<dyn LanguageModel>,
    viewer: Uuid,
    subject: Uuid,
) -> Result<serde_json::Value, ApiError> {
    let rows = blocking(db.clone(), move |db| {
        db.get_user_by_id(&subject.to_string())?
            .ok_or(ApiError::NotFound("user"))?;
        if viewer == subject {
            Ok(db.messages_by_sender(&subject.to_string())?)
        } else {
            Ok(db.messages_in_shared_groups(&subject.to_string(), &viewer.to_string())?)
        }
    })
    .await?;

    let transcript = format_transcript(&transcript_entries(rows));
    let prompt = profile_prompt(&transcript);

    match model.complete("", &[], &prompt).await {
        Ok(raw) => match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(parsed) => Ok(parsed),
            Err(e) => {
                warn!("profile reply was not valid JSON: {}", e);
                Ok(serde_json::json!({ "error": "Error generating AI profile" }))
            }
        },
        Err(e) => {
            warn!("profile call failed: {}", e);
            Ok(serde_json::json!({ "error": "Error generating AI profile" }))
        }
    }
}

async fn group_transcript(db: &Arc<Database>, group_id: Uuid) -> Result<String, ApiError> {
    let rows = blocking(db.clone(), move |db| {
        db.get_group(&group_id.to_string())?
            .ok_or(ApiError::NotFound("group"))?;
        Ok(db.messages_for_group(&group_id.to_string(), false)?)
    })
    .await?;
    Ok(format_transcript(&transcript_entries(rows)))
}

// -- Handlers --

pub async fn send_ai_message(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<AiMessageRequest>,
) -> Result<Json<AiReply>, ApiError> {
    Ok(Json(converse(&state.db, &state.model, claims.sub, Some(group_id), req).await?))
}

pub async fn send_direct_ai_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<AiMessageRequest>,
) -> Result<Json<AiReply>, ApiError> {
    Ok(Json(converse(&state.db, &state.model, claims.sub, None, req).await?))
}

pub async fn get_ai_messages(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<AiHistoryEntry>>, ApiError> {
    Ok(Json(exchange_history(&state.db, claims.sub, group_id).await?))
}

pub async fn get_summary(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
) -> Result<Json<AiReply>, ApiError> {
    Ok(Json(summary(&state.db, &state.model, group_id).await?))
}

pub async fn get_snippets(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
) -> Result<Json<SnippetsResponse>, ApiError> {
    Ok(Json(snippets(&state.db, &state.model, group_id).await?))
}

pub async fn get_profile(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<serde_json::Value>, ApiError> {
    Ok(Json(profile(&state.db, &state.model, claims.sub, user_id).await?))
}
