use axum::{Extension, Json, extract::{Path, State}};
use uuid::Uuid;

use huddle_db::models::UserRow;
use huddle_types::api::{Claims, UserSummary};

use crate::error::ApiError;
use crate::state::{AppState, blocking};

fn summary(row: UserRow) -> UserSummary {
    UserSummary {
        id: row.id.parse().unwrap_or_else(|e| {
            tracing::warn!("Corrupt user id '{}': {}", row.id, e);
            Uuid::default()
        }),
        username: row.username,
    }
}

/// Everyone except the requesting user, for invite pickers.
pub async fn list_users(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<UserSummary>>, ApiError> {
    let rows = blocking(state.db.clone(), move |db| {
        Ok(db.list_users_except(&claims.sub.to_string())?)
    })
    .await?;

    Ok(Json(rows.into_iter().map(summary).collect()))
}

pub async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<UserSummary>, ApiError> {
    let row = blocking(state.db.clone(), move |db| {
        db.get_user_by_id(&user_id.to_string())?
            .ok_or(ApiError::NotFound("user"))
    })
    .await?;

    Ok(Json(summary(row)))
}
