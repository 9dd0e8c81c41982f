use axum::{
    Extension, Json,
    extract::{Query, State, rejection::QueryRejection},
    response::IntoResponse,
};

use parley_gateway::identity::Identity;
use parley_types::api::{SearchQuery, UserSummary};

use crate::auth::AppState;
use crate::error::{ApiError, blocking};

const SEARCH_LIMIT: u32 = 50;

/// GET /search-users?q=... Substring match on username, never including the caller.
pub async fn search_users(
    State(state): State<AppState>,
    query: Result<Query<SearchQuery>, QueryRejection>,
    Extension(caller): Extension<Identity>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query?;
    let needle = query.q.trim().to_string();

    let store = state.store.clone();
    let rows = blocking(move || Ok(store.search_users(&needle, caller.user_id, SEARCH_LIMIT)?)).await?;

    let users: Vec<UserSummary> = rows.iter().map(|row| row.summary()).collect();
    Ok(Json(users))
}
