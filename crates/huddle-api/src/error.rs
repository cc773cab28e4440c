use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use huddle_gateway::store::StoreError;

/// Request-level failure taxonomy. Every variant maps to one status code,
/// and domain failures (not found, forbidden) are kept apart from genuine
/// collaborator breakage.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(&'static str),

    #[error("{0}")]
    Forbidden(&'static str),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Validation(&'static str),

    #[error("{0}")]
    Conflict(&'static str),

    #[error(transparent)]
    Database(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::NotOwner => Self::Forbidden("not the sender of this message"),
            StoreError::Database(e) => Self::Database(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("request failed: {}", self);
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_the_taxonomy() {
        assert_eq!(ApiError::Unauthorized("x").status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::Forbidden("x").status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::NotFound("group").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::Validation("x").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::Database(anyhow::anyhow!("boom")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn store_errors_convert_to_their_api_tier() {
        let not_found: ApiError = StoreError::NotFound("group").into();
        assert_eq!(not_found.status_code(), StatusCode::NOT_FOUND);

        let forbidden: ApiError = StoreError::NotOwner.into();
        assert_eq!(forbidden.status_code(), StatusCode::FORBIDDEN);
    }
}
