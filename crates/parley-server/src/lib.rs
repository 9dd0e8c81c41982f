pub mod config;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State, WebSocketUpgrade},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use parley_api::auth::{self, AppState, AppStateInner};
use parley_api::conversations;
use parley_api::error::ApiError;
use parley_api::middleware::require_auth;
use parley_api::users;
use parley_db::ChatStore;
use parley_gateway::connection::{self, Gateway};
use parley_gateway::identity::JwtVerifier;
use parley_gateway::registry::ConnectionRegistry;
use parley_gateway::router::MessageRouter;

use crate::config::ServerConfig;

#[derive(Clone)]
pub struct ServerState {
    pub app: AppState,
    pub gateway: Gateway,
}

impl ServerState {
    pub fn new(store: Arc<dyn ChatStore>, config: &ServerConfig) -> Self {
        let verifier = Arc::new(JwtVerifier::new(&config.jwt_secret));
        let router = MessageRouter::new(store.clone(), ConnectionRegistry::new());
        let gateway = Gateway::new(router, config.outbound_buffer);

        let app = Arc::new(AppStateInner {
            store,
            verifier,
            token_ttl: config.token_ttl,
        });

        Self { app, gateway }
    }
}

/// Full HTTP surface: auth, pull-resync REST routes and the WebSocket gateway.
pub fn app(state: ServerState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/health", get(health))
        .with_state(state.app.clone());

    let protected_routes = Router::new()
        .route("/conversations/{user_id}", get(conversations::list_conversations))
        .route("/messages/{conversation_id}", get(conversations::get_messages))
        .route("/conversation/{conversation_id}", delete(conversations::delete_conversation))
        .route("/search-users", get(users::search_users))
        .route_layer(middleware::from_fn_with_state(state.app.clone(), require_auth))
        .with_state(state.app.clone());

    let ws_routes = Router::new()
        .route("/ws", get(ws_upgrade_query))
        .route("/ws/{token}", get(ws_upgrade_path))
        .with_state(state);

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    #[serde(default)]
    token: String,
}

async fn ws_upgrade_path(
    State(state): State<ServerState>,
    Path(token): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, &token, ws)
}

async fn ws_upgrade_query(
    State(state): State<ServerState>,
    Query(query): Query<TokenQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, &query.token, ws)
}

/// The token is checked before the upgrade completes; a bad token never
/// reaches the registry.
fn upgrade(state: ServerState, token: &str, ws: WebSocketUpgrade) -> Response {
    match connection::authenticate(state.app.verifier.as_ref(), token) {
        Ok(pending) => ws.on_upgrade(move |socket| async move { state.gateway.serve(socket, pending).await }),
        Err(e) => ApiError::Unauthorized(format!("Could not validate credentials: {}", e)).into_response(),
    }
}
