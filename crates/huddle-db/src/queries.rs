use crate::models::{GroupRow, MessageRow, UserRow};
use crate::{Database, now_timestamp};
use anyhow::Result;
use rusqlite::{Connection, Row};
use uuid::Uuid;

const MESSAGE_SELECT: &str = "
    SELECT m.id, m.text, m.sender_id, u.username, m.group_id, m.reply_to_id,
           r.text, ru.username, m.is_ai_turn, m.is_ai_answer, m.created_at
    FROM messages m
    LEFT JOIN users u ON m.sender_id = u.id
    LEFT JOIN messages r ON m.reply_to_id = r.id
    LEFT JOIN users ru ON r.sender_id = ru.id";

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, username: &str, password_hash: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password) VALUES (?1, ?2, ?3)",
                (id, username, password_hash),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username = ?1", username))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id = ?1", id))
    }

    pub fn list_users_except(&self, id: &str) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, username, password, last_login_at, created_at
                 FROM users WHERE id != ?1 ORDER BY username",
            )?;
            let rows = stmt
                .query_map([id], map_user_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn touch_last_login(&self, id: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE users SET last_login_at = ?1 WHERE id = ?2",
                (now_timestamp(), id),
            )?;
            Ok(())
        })
    }

    // -- Groups --

    pub fn create_group(&self, id: &str, name: &str, admin_id: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO groups (id, name, admin_id, created_at) VALUES (?1, ?2, ?3, ?4)",
                (id, name, admin_id, now_timestamp()),
            )?;
            Ok(())
        })
    }

    /// Create a group and its initial memberships in one transaction, so a
    /// failed membership insert leaves no half-created group behind.
    pub fn create_group_with_members(
        &self,
        id: &str,
        name: &str,
        admin_id: &str,
        member_ids: &[String],
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO groups (id, name, admin_id, created_at) VALUES (?1, ?2, ?3, ?4)",
                (id, name, admin_id, now_timestamp()),
            )?;
            for user_id in member_ids {
                tx.execute(
                    "INSERT INTO memberships (id, group_id, user_id) VALUES (?1, ?2, ?3)",
                    (Uuid::new_v4().to_string(), id, user_id),
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_group(&self, id: &str) -> Result<Option<GroupRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT id, name, admin_id, created_at FROM groups WHERE id = ?1")?;
            let row = stmt
                .query_row([id], |row| {
                    Ok(GroupRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        admin_id: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                })
                .optional()?;
            Ok(row)
        })
    }

    pub fn groups_for_user(&self, user_id: &str) -> Result<Vec<GroupRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT g.id, g.name, g.admin_id, g.created_at
                 FROM groups g
                 JOIN memberships ms ON ms.group_id = g.id
                 WHERE ms.user_id = ?1",
            )?;
            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(GroupRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        admin_id: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn group_ids_for_user(&self, user_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT group_id FROM memberships WHERE user_id = ?1")?;
            let rows = stmt
                .query_map([user_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Memberships --

    pub fn add_memberships(&self, group_id: &str, user_ids: &[String]) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            for user_id in user_ids {
                tx.execute(
                    "INSERT INTO memberships (id, group_id, user_id) VALUES (?1, ?2, ?3)",
                    (Uuid::new_v4().to_string(), group_id, user_id),
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn membership_exists(&self, group_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM memberships WHERE group_id = ?1 AND user_id = ?2",
                    (group_id, user_id),
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    pub fn member_ids(&self, group_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT user_id FROM memberships WHERE group_id = ?1")?;
            let rows = stmt
                .query_map([group_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn users_in_group(&self, group_id: &str) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT u.id, u.username, u.password, u.last_login_at, u.created_at
                 FROM users u
                 JOIN memberships ms ON ms.user_id = u.id
                 WHERE ms.group_id = ?1",
            )?;
            let rows = stmt
                .query_map([group_id], map_user_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn count_members(&self, group_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM memberships WHERE group_id = ?1",
                [group_id],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }

    /// Returns false when no such membership existed.
    pub fn remove_membership(&self, group_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let affected = conn.execute(
                "DELETE FROM memberships WHERE group_id = ?1 AND user_id = ?2",
                (group_id, user_id),
            )?;
            Ok(affected > 0)
        })
    }

    /// Remove a group together with its messages and memberships, in one
    /// transaction. Either the whole cascade lands or nothing does.
    pub fn delete_group_cascade(&self, group_id: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            // Break reply references into this group before deleting the rows
            // they point at.
            tx.execute(
                "UPDATE messages SET reply_to_id = NULL
                 WHERE reply_to_id IN (SELECT id FROM messages WHERE group_id = ?1)",
                [group_id],
            )?;
            tx.execute("DELETE FROM messages WHERE group_id = ?1", [group_id])?;
            tx.execute("DELETE FROM memberships WHERE group_id = ?1", [group_id])?;
            tx.execute("DELETE FROM groups WHERE id = ?1", [group_id])?;
            tx.commit()?;
            Ok(())
        })
    }

    // -- Messages --

    pub fn insert_message(
        &self,
        id: &str,
        text: &str,
        sender_id: &str,
        group_id: Option<&str>,
        reply_to_id: Option<&str>,
        is_ai_turn: bool,
        is_ai_answer: bool,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO messages
                     (id, text, sender_id, group_id, reply_to_id, is_ai_turn, is_ai_answer, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    id,
                    text,
                    sender_id,
                    group_id,
                    reply_to_id,
                    is_ai_turn,
                    is_ai_answer,
                    now_timestamp(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let sql = format!("{MESSAGE_SELECT} WHERE m.id = ?1");
            let mut stmt = conn.prepare(&sql)?;
            let row = stmt.query_row([id], map_message_row).optional()?;
            Ok(row)
        })
    }

    /// Group history, oldest first. `ai_turns` selects between the plain chat
    /// transcript and the AI exchange side of the table.
    pub fn messages_for_group(&self, group_id: &str, ai_turns: bool) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "{MESSAGE_SELECT}
                 WHERE m.group_id = ?1 AND m.is_ai_turn = ?2
                 ORDER BY m.created_at, m.rowid"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params![group_id, ai_turns], map_message_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// One user's AI exchange within a group, oldest first.
    pub fn ai_exchange_in_group(&self, group_id: &str, sender_id: &str) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "{MESSAGE_SELECT}
                 WHERE m.group_id = ?1 AND m.sender_id = ?2 AND m.is_ai_turn = 1
                 ORDER BY m.created_at, m.rowid"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map((group_id, sender_id), map_message_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// A user's groupless AI exchange, oldest first.
    pub fn ai_exchange_direct(&self, sender_id: &str) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "{MESSAGE_SELECT}
                 WHERE m.group_id IS NULL AND m.sender_id = ?1 AND m.is_ai_turn = 1
                 ORDER BY m.created_at, m.rowid"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([sender_id], map_message_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// All plain messages a user has sent, across every group.
    pub fn messages_by_sender(&self, sender_id: &str) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "{MESSAGE_SELECT}
                 WHERE m.sender_id = ?1 AND m.is_ai_turn = 0
                 ORDER BY m.created_at, m.rowid"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([sender_id], map_message_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Plain messages a subject has sent in groups the viewer is also a
    /// member of.
    pub fn messages_in_shared_groups(
        &self,
        subject_id: &str,
        viewer_id: &str,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "{MESSAGE_SELECT}
                 WHERE m.sender_id = ?1 AND m.is_ai_turn = 0 AND m.group_id IN (
                     SELECT group_id FROM memberships WHERE user_id = ?1
                     INTERSECT
                     SELECT group_id FROM memberships WHERE user_id = ?2
                 )
                 ORDER BY m.created_at, m.rowid"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map((subject_id, viewer_id), map_message_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Returns false when the message did not exist. Replies pointing at the
    /// removed message are kept but detached.
    pub fn delete_message(&self, id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute("UPDATE messages SET reply_to_id = NULL WHERE reply_to_id = ?1", [id])?;
            let affected = tx.execute("DELETE FROM messages WHERE id = ?1", [id])?;
            tx.commit()?;
            Ok(affected > 0)
        })
    }
}

fn query_user(conn: &Connection, filter: &str, value: &str) -> Result<Option<UserRow>> {
    let sql = format!(
        "SELECT id, username, password, last_login_at, created_at FROM users WHERE {filter}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let row = stmt.query_row([value], map_user_row).optional()?;
    Ok(row)
}

fn map_user_row(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        password: row.get(2)?,
        last_login_at: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn map_message_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        text: row.get(1)?,
        sender_id: row.get(2)?,
        sender_username: row.get(3)?,
        group_id: row.get(4)?,
        reply_to_id: row.get(5)?,
        reply_text: row.get(6)?,
        reply_username: row.get(7)?,
        is_ai_turn: row.get(8)?,
        is_ai_answer: row.get(9)?,
        created_at: row.get(10)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_user(db: &Database, name: &str) -> String {
        let id = Uuid::new_v4().to_string();
        db.create_user(&id, name, "hash").unwrap();
        id
    }

    fn seed_group(db: &Database, name: &str, admin: &str, members: &[&str]) -> String {
        let id = Uuid::new_v4().to_string();
        db.create_group(&id, name, admin).unwrap();
        let ids: Vec<String> = members.iter().map(|m| m.to_string()).collect();
        db.add_memberships(&id, &ids).unwrap();
        id
    }

    #[test]
    fn membership_rows_are_unique_per_user_and_group() {
        let db = Database::open_in_memory().unwrap();
        let alice = seed_user(&db, "alice");
        let group = seed_group(&db, "trip", &alice, &[&alice]);

        let dup = db.add_memberships(&group, &[alice.clone()]);
        assert!(dup.is_err());
        assert_eq!(db.count_members(&group).unwrap(), 1);
    }

    #[test]
    fn dangling_reply_reference_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        let alice = seed_user(&db, "alice");
        let group = seed_group(&db, "trip", &alice, &[&alice]);

        let result = db.insert_message(
            &Uuid::new_v4().to_string(),
            "hello?",
            &alice,
            Some(&group),
            Some(&Uuid::new_v4().to_string()),
            false,
            false,
        );
        assert!(result.is_err());
        assert!(db.messages_for_group(&group, false).unwrap().is_empty());
    }

    #[test]
    fn group_cascade_removes_messages_and_memberships() {
        let db = Database::open_in_memory().unwrap();
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");
        let group = seed_group(&db, "trip", &alice, &[&alice, &bob]);

        let first = Uuid::new_v4().to_string();
        db.insert_message(&first, "hi", &alice, Some(&group), None, false, false)
            .unwrap();
        db.insert_message(
            &Uuid::new_v4().to_string(),
            "hi back",
            &bob,
            Some(&group),
            Some(&first),
            false,
            false,
        )
        .unwrap();

        db.delete_group_cascade(&group).unwrap();

        assert!(db.get_group(&group).unwrap().is_none());
        assert_eq!(db.count_members(&group).unwrap(), 0);
        assert!(db.messages_for_group(&group, false).unwrap().is_empty());
    }

    #[test]
    fn group_history_comes_back_in_persistence_order() {
        let db = Database::open_in_memory().unwrap();
        let alice = seed_user(&db, "alice");
        let group = seed_group(&db, "trip", &alice, &[&alice]);

        for text in ["one", "two", "three"] {
            db.insert_message(&Uuid::new_v4().to_string(), text, &alice, Some(&group), None, false, false)
                .unwrap();
        }

        let texts: Vec<String> = db
            .messages_for_group(&group, false)
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, ["one", "two", "three"]);
    }

    #[test]
    fn ai_turns_are_invisible_to_plain_history() {
        let db = Database::open_in_memory().unwrap();
        let alice = seed_user(&db, "alice");
        let group = seed_group(&db, "trip", &alice, &[&alice]);

        db.insert_message(&Uuid::new_v4().to_string(), "chat", &alice, Some(&group), None, false, false)
            .unwrap();
        db.insert_message(&Uuid::new_v4().to_string(), "ask ai", &alice, Some(&group), None, true, false)
            .unwrap();
        db.insert_message(&Uuid::new_v4().to_string(), "ai says", &alice, Some(&group), None, true, true)
            .unwrap();

        assert_eq!(db.messages_for_group(&group, false).unwrap().len(), 1);
        assert_eq!(db.ai_exchange_in_group(&group, &alice).unwrap().len(), 2);
    }

    #[test]
    fn shared_group_filter_only_sees_mutual_rooms() {
        let db = Database::open_in_memory().unwrap();
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");
        let carol = seed_user(&db, "carol");

        let shared = seed_group(&db, "shared", &alice, &[&alice, &bob]);
        let private = seed_group(&db, "private", &alice, &[&alice, &carol]);

        db.insert_message(&Uuid::new_v4().to_string(), "visible", &alice, Some(&shared), None, false, false)
            .unwrap();
        db.insert_message(&Uuid::new_v4().to_string(), "hidden", &alice, Some(&private), None, false, false)
            .unwrap();

        let visible = db.messages_in_shared_groups(&alice, &bob).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].text, "visible");
    }
}
