use std::sync::Arc;

use huddle_db::Database;
use huddle_gateway::Dispatcher;
use huddle_llm::LanguageModel;

use crate::error::ApiError;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub dispatcher: Dispatcher,
    pub jwt_secret: String,
    pub model: Arc<dyn LanguageModel>,
}

/// Run a blocking database closure off the async runtime.
pub async fn blocking<T, F>(db: Arc<Database>, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> Result<T, ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&db)).await.map_err(|e| {
        tracing::error!("spawn_blocking join error: {}", e);
        ApiError::Database(anyhow::anyhow!("background task failed: {e}"))
    })?
}
