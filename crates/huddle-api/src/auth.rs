use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Json, extract::State};
use jsonwebtoken::{EncodingKey, Header, encode};
use uuid::Uuid;

use huddle_types::api::{Claims, LoginRequest, LoginResponse, RegisterRequest, RegisterResponse};

use crate::error::ApiError;
use crate::state::{AppState, blocking};

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<(axum::http::StatusCode, Json<RegisterResponse>), ApiError> {
    let username = req.username.trim().to_string();
    if username.len() < 3 || username.len() > 32 {
        return Err(ApiError::Validation("username must be 3 to 32 characters"));
    }
    if req.password.len() < 8 {
        return Err(ApiError::Validation("password must be at least 8 characters"));
    }

    // Hash with Argon2id before touching the database.
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let password_hash = argon2
        .hash_password(req.password.as_bytes(), &salt)
        .map_err(|e| ApiError::Database(anyhow::anyhow!("password hashing failed: {e}")))?
        .to_string();

    let user_id = Uuid::new_v4();

    let name_for_insert = username.clone();
    blocking(state.db.clone(), move |db| {
        if db.get_user_by_username(&name_for_insert)?.is_some() {
            return Err(ApiError::Conflict("username is already taken"));
        }
        db.create_user(&user_id.to_string(), &name_for_insert, &password_hash)?;
        Ok(())
    })
    .await?;

    let token = create_token(&state.jwt_secret, user_id, &username)?;

    Ok((
        axum::http::StatusCode::CREATED,
        Json(RegisterResponse { user_id, token }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let user = blocking(state.db.clone(), move |db| {
        db.get_user_by_username(&req.username)?
            .ok_or(ApiError::Unauthorized("unknown user or wrong password"))
    })
    .await?;

    // Verify password
    let parsed_hash = PasswordHash::new(&user.password)
        .map_err(|e| ApiError::Database(anyhow::anyhow!("corrupt password hash: {e}")))?;

    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| ApiError::Unauthorized("unknown user or wrong password"))?;

    let user_id: Uuid = user
        .id
        .parse()
        .map_err(|e| ApiError::Database(anyhow::anyhow!("corrupt user id: {e}")))?;

    // "Last login" bookkeeping; a failed stamp should not fail the login.
    let db = state.db.clone();
    let id_for_stamp = user.id.clone();
    let _ = tokio::task::spawn_blocking(move || {
        if let Err(e) = db.touch_last_login(&id_for_stamp) {
            tracing::warn!("failed to stamp last login for {}: {}", id_for_stamp, e);
        }
    });

    let token = create_token(&state.jwt_secret, user_id, &user.username)?;

    Ok(Json(LoginResponse {
        user_id,
        username: user.username,
        token,
    }))
}

fn create_token(secret: &str, user_id: Uuid, username: &str) -> Result<String, ApiError> {
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::days(30)).timestamp() as usize,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ApiError::Database(anyhow::anyhow!("token signing failed: {e}")))
}
