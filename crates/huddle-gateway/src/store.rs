use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use huddle_db::models::MessageRow;
use huddle_db::{Database, parse_timestamp};
use huddle_types::models::{MessagePayload, ReplyPreview};

/// Failures of the message store. `NotFound` names the entity a reference
/// failed to resolve; nothing is written when any reference is dangling.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("not the sender of this message")]
    NotOwner,

    #[error(transparent)]
    Database(#[from] anyhow::Error),
}

/// A message to persist. The constructors keep the flag invariant (an
/// assistant answer is always part of an AI turn) impossible to violate.
pub struct NewMessage<'a> {
    pub text: &'a str,
    pub sender_id: Uuid,
    pub group_id: Option<Uuid>,
    pub reply_to_id: Option<Uuid>,
    ai_turn: bool,
    ai_answer: bool,
}

impl<'a> NewMessage<'a> {
    /// Plain chat message.
    pub fn chat(text: &'a str, sender_id: Uuid, group_id: Uuid, reply_to_id: Option<Uuid>) -> Self {
        Self {
            text,
            sender_id,
            group_id: Some(group_id),
            reply_to_id,
            ai_turn: false,
            ai_answer: false,
        }
    }

    /// The user's side of an AI exchange.
    pub fn ai_prompt(text: &'a str, sender_id: Uuid, group_id: Option<Uuid>) -> Self {
        Self {
            text,
            sender_id,
            group_id,
            reply_to_id: None,
            ai_turn: true,
            ai_answer: false,
        }
    }

    /// The assistant's side of an AI exchange.
    pub fn ai_answer(text: &'a str, sender_id: Uuid, group_id: Option<Uuid>) -> Self {
        Self {
            text,
            sender_id,
            group_id,
            reply_to_id: None,
            ai_turn: true,
            ai_answer: true,
        }
    }
}

/// A persisted message, as returned by [`persist_message`]. Carries the
/// server-assigned id and timestamp that order the group's history.
pub struct StoredMessage {
    pub id: Uuid,
    pub text: String,
    pub sender_id: Uuid,
    pub sender_username: String,
    pub group_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub reply: Option<ReplyPreview>,
}

impl StoredMessage {
    /// Wire payload for a given viewer; `me` is viewer-relative.
    pub fn payload_for(&self, viewer: Option<Uuid>) -> MessagePayload {
        MessagePayload {
            id: self.id,
            text: self.text.clone(),
            username: self.sender_username.clone(),
            user_id: self.sender_id,
            group_id: self.group_id,
            created_at: self.created_at,
            me: viewer == Some(self.sender_id),
            reply: self.reply.clone(),
        }
    }
}

/// Persist a message after resolving every reference it carries: the sender
/// must exist, the group must exist when given, and a reply target must
/// resolve to a stored message. Broadcasting is someone else's job — a
/// failed delivery can never roll back this write, and a failed write here
/// means no event is ever dispatched.
pub fn persist_message(db: &Database, msg: NewMessage<'_>) -> Result<StoredMessage, StoreError> {
    let sender = db
        .get_user_by_id(&msg.sender_id.to_string())?
        .ok_or(StoreError::NotFound("sender"))?;

    if let Some(group_id) = msg.group_id {
        db.get_group(&group_id.to_string())?
            .ok_or(StoreError::NotFound("group"))?;
    }

    let reply = match msg.reply_to_id {
        Some(reply_id) => {
            let target = db
                .get_message(&reply_id.to_string())?
                .ok_or(StoreError::NotFound("replied message"))?;
            Some(ReplyPreview {
                id: reply_id,
                text: target.text,
                username: target.sender_username,
            })
        }
        None => None,
    };

    let id = Uuid::new_v4();
    db.insert_message(
        &id.to_string(),
        msg.text,
        &msg.sender_id.to_string(),
        msg.group_id.map(|g| g.to_string()).as_deref(),
        msg.reply_to_id.map(|r| r.to_string()).as_deref(),
        msg.ai_turn,
        msg.ai_answer,
    )?;

    let row = db
        .get_message(&id.to_string())?
        .ok_or(StoreError::NotFound("stored message"))?;

    Ok(StoredMessage {
        id,
        text: row.text,
        sender_id: msg.sender_id,
        sender_username: sender.username,
        group_id: msg.group_id,
        created_at: parse_timestamp(&row.created_at),
        reply,
    })
}

/// Delete a message on behalf of its sender. Returns the group the message
/// belonged to so the caller can announce the removal.
pub fn delete_message(
    db: &Database,
    message_id: Uuid,
    requester: Uuid,
) -> Result<Option<Uuid>, StoreError> {
    let row: MessageRow = db
        .get_message(&message_id.to_string())?
        .ok_or(StoreError::NotFound("message"))?;

    if row.sender_id != requester.to_string() {
        return Err(StoreError::NotOwner);
    }

    db.delete_message(&message_id.to_string())?;

    Ok(row.group_id.and_then(|g| g.parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> (Database, Uuid, Uuid) {
        let db = Database::open_in_memory().unwrap();
        let user = Uuid::new_v4();
        db.create_user(&user.to_string(), "alice", "hash").unwrap();
        let group = Uuid::new_v4();
        db.create_group(&group.to_string(), "trip", &user.to_string())
            .unwrap();
        db.add_memberships(&group.to_string(), &[user.to_string()])
            .unwrap();
        (db, user, group)
    }

    #[test]
    fn persisted_message_carries_sender_and_timestamp() {
        let (db, user, group) = seeded();

        let stored = persist_message(&db, NewMessage::chat("hi", user, group, None)).unwrap();
        assert_eq!(stored.sender_username, "alice");
        assert_eq!(stored.group_id, Some(group));

        let mine = stored.payload_for(Some(user));
        assert!(mine.me);
        let theirs = stored.payload_for(Some(Uuid::new_v4()));
        assert!(!theirs.me);
    }

    #[test]
    fn dangling_reply_fails_and_writes_nothing() {
        let (db, user, group) = seeded();

        let result = persist_message(
            &db,
            NewMessage::chat("who said that?", user, group, Some(Uuid::new_v4())),
        );
        assert!(matches!(result, Err(StoreError::NotFound(_))));
        assert!(db.messages_for_group(&group.to_string(), false).unwrap().is_empty());
    }

    #[test]
    fn unknown_group_fails_and_writes_nothing() {
        let (db, user, _group) = seeded();

        let result = persist_message(&db, NewMessage::chat("hi", user, Uuid::new_v4(), None));
        assert!(matches!(result, Err(StoreError::NotFound("group"))));
    }

    #[test]
    fn reply_resolves_to_a_preview() {
        let (db, user, group) = seeded();

        let first = persist_message(&db, NewMessage::chat("original", user, group, None)).unwrap();
        let second =
            persist_message(&db, NewMessage::chat("reply", user, group, Some(first.id))).unwrap();

        let preview = second.reply.unwrap();
        assert_eq!(preview.id, first.id);
        assert_eq!(preview.text, "original");
        assert_eq!(preview.username.as_deref(), Some("alice"));
    }

    #[test]
    fn only_the_sender_may_delete() {
        let (db, user, group) = seeded();
        let stranger = Uuid::new_v4();
        db.create_user(&stranger.to_string(), "mallory", "hash").unwrap();

        let stored = persist_message(&db, NewMessage::chat("hi", user, group, None)).unwrap();

        assert!(matches!(
            delete_message(&db, stored.id, stranger),
            Err(StoreError::NotOwner)
        ));

        let group_of = delete_message(&db, stored.id, user).unwrap();
        assert_eq!(group_of, Some(group));
        assert!(db.get_message(&stored.id.to_string()).unwrap().is_none());
    }
}
