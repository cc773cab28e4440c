use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use huddle_api::error::ApiError;
use huddle_api::middleware::{decode_token, require_auth};
use huddle_api::state::{AppState, AppStateInner};
use huddle_api::{ai, auth, groups, messages, users};
use huddle_gateway::{ConnectionRegistry, Dispatcher, RoomIndex, connection};
use huddle_llm::{LanguageModel, OpenAiChat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("HUDDLE_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("HUDDLE_DB_PATH").unwrap_or_else(|_| "huddle.db".into());
    let host = std::env::var("HUDDLE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("HUDDLE_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;
    let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
    let ai_model =
        std::env::var("HUDDLE_AI_MODEL").unwrap_or_else(|_| "gpt-4.1-nano".into());
    let ai_base_url = std::env::var("OPENAI_BASE_URL")
        .unwrap_or_else(|_| "https://api.openai.com/v1".into());

    // Init database
    let db = Arc::new(huddle_db::Database::open(&PathBuf::from(&db_path))?);

    // Core runtime state: registry + room index, dispatcher on top.
    let dispatcher = Dispatcher::new(
        Arc::new(ConnectionRegistry::new()),
        Arc::new(RoomIndex::new()),
    );

    let model: Arc<dyn LanguageModel> = Arc::new(OpenAiChat::new(api_key, ai_model, ai_base_url));

    let state: AppState = Arc::new(AppStateInner {
        db,
        dispatcher,
        jwt_secret,
        model,
    });

    // Routes
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/users", get(users::list_users))
        .route("/users/{user_id}", get(users::get_user))
        .route("/users/{user_id}/ai/profile", get(ai::get_profile))
        .route("/groups", post(groups::create_group).get(groups::my_groups))
        .route("/groups/{group_id}", get(groups::group_info))
        .route("/groups/{group_id}/leave", post(groups::leave_group))
        .route("/groups/{group_id}/members", post(groups::add_group_members))
        .route(
            "/groups/{group_id}/members/{user_id}",
            delete(groups::remove_group_member),
        )
        .route(
            "/groups/{group_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route("/messages/{message_id}", delete(messages::delete_message))
        .route(
            "/groups/{group_id}/ai",
            get(ai::get_ai_messages).post(ai::send_ai_message),
        )
        .route("/groups/{group_id}/ai/summary", get(ai::get_summary))
        .route("/groups/{group_id}/ai/snippets", get(ai::get_snippets))
        .route("/ai", post(ai::send_direct_ai_message))
        .layer(middleware::from_fn(require_auth))
        .with_state(state.clone());

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state);

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Huddle server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Deserialize)]
struct WsQuery {
    token: String,
}

/// The credential arrives out-of-band as a query parameter; a bad token
/// rejects the upgrade outright rather than admitting an anonymous socket.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let claims = decode_token(&query.token, &state.jwt_secret)?;

    Ok(ws.on_upgrade(move |socket| {
        connection::handle_connection(
            socket,
            state.dispatcher.clone(),
            state.db.clone(),
            claims.sub,
            claims.username,
        )
    }))
}
