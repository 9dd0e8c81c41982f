use std::sync::Arc;

use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::{SaltString, rand_core::OsRng}};
use axum::{Json, extract::State, extract::rejection::JsonRejection, http::StatusCode, response::IntoResponse};
use tracing::{error, info};

use parley_db::ChatStore;
use parley_gateway::identity::{Identity, JwtVerifier};
use parley_types::api::{LoginRequest, LoginResponse, RegisterRequest};

use crate::error::{ApiError, blocking};

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub store: Arc<dyn ChatStore>,
    pub verifier: Arc<JwtVerifier>,
    pub token_ttl: chrono::Duration,
}

const USERNAME_LEN: std::ops::RangeInclusive<usize> = 3..=32;
const MIN_PASSWORD_LEN: usize = 8;

pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload?;
    let username = req.username.trim().to_string();

    // Validate input
    if !USERNAME_LEN.contains(&username.chars().count()) {
        return Err(ApiError::BadRequest("Username must be 3 to 32 characters".into()));
    }
    if req.password.len() < MIN_PASSWORD_LEN {
        return Err(ApiError::BadRequest("Password must be at least 8 characters".into()));
    }

    let store = state.store.clone();
    let user = blocking(move || {
        if store.get_user_by_username(&username)?.is_some() {
            return Err(ApiError::Conflict("Username already exists".into()));
        }

        // Hash password with Argon2id
        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(req.password.as_bytes(), &salt)
            .map_err(|e| {
                error!("Password hashing failed: {}", e);
                ApiError::Internal
            })?
            .to_string();

        // The UNIQUE constraint still catches a concurrent registration.
        Ok(store.create_user(&username, &password_hash)?)
    })
    .await?;

    info!("Registered user {} ({})", user.username, user.id);
    Ok((StatusCode::CREATED, Json(user.summary())))
}

pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload?;
    let invalid = || ApiError::Unauthorized("Incorrect username or password".into());

    let store = state.store.clone();
    let username = req.username.trim().to_string();
    let user = blocking(move || {
        let user = store.get_user_by_username(&username)?.ok_or_else(invalid)?;

        // Verify password
        let parsed_hash = PasswordHash::new(&user.password).map_err(|e| {
            error!("Stored password hash for {} is unreadable: {}", user.id, e);
            ApiError::Internal
        })?;
        Argon2::default()
            .verify_password(req.password.as_bytes(), &parsed_hash)
            .map_err(|_| invalid())?;

        Ok(user)
    })
    .await?;

    let identity = Identity {
        user_id: user.id,
        username: user.username.clone(),
    };
    let access_token = state.verifier.issue(&identity, state.token_ttl).map_err(|e| {
        error!("Token encoding failed: {}", e);
        ApiError::Internal
    })?;

    Ok(Json(LoginResponse {
        access_token,
        user: user.summary(),
    }))
}
