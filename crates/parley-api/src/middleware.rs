use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::TypedHeader;
use axum_extra::headers::Authorization;
use axum_extra::headers::authorization::Bearer;
use axum_extra::typed_header::TypedHeaderRejection;

use parley_gateway::identity::IdentityVerifier;

use crate::auth::AppState;
use crate::error::ApiError;

/// Validate the bearer JWT and stash the caller's `Identity` in the request
/// extensions.
pub async fn require_auth(
    State(state): State<AppState>,
    header: Result<TypedHeader<Authorization<Bearer>>, TypedHeaderRejection>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let TypedHeader(Authorization(bearer)) =
        header.map_err(|_| ApiError::Unauthorized("Missing bearer token".into()))?;

    let identity = state
        .verifier
        .verify(bearer.token())
        .map_err(|e| ApiError::Unauthorized(format!("Could not validate credentials: {}", e)))?;

    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}
