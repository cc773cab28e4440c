/// Database row types — these map directly to SQLite rows.
/// Distinct from huddle-types API models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub last_login_at: Option<String>,
    pub created_at: String,
}

pub struct GroupRow {
    pub id: String,
    pub name: String,
    pub admin_id: String,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub text: String,
    pub sender_id: String,
    pub sender_username: Option<String>,
    pub group_id: Option<String>,
    pub reply_to_id: Option<String>,
    pub reply_text: Option<String>,
    pub reply_username: Option<String>,
    pub is_ai_turn: bool,
    pub is_ai_answer: bool,
    pub created_at: String,
}
