use axum::{
    extract::{FromRequestParts, State},
    http::{header, request::Parts, StatusCode},
    Json,
};
use rand::Rng;
use serde::{Deserialize, Serialize};

use gather_core::auth::{hash_password, verify_password};
use gather_core::models::{User, UserId};

use super::{AppError, AppResult, AppState};

/// Authenticated caller, extracted from the `Authorization: Bearer` header.
pub struct AuthUser(pub UserId);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| AppError::unauthorized("Missing bearer token"))?;

        let user_id = state
            .jwt
            .verify_token(token)
            .map_err(|_| AppError::token_invalid())?;

        Ok(Self(user_id))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUpBody {
    pub username: String,
    pub password: String,
    pub display_name: String,
}

pub async fn sign_up(
    State(state): State<AppState>,
    Json(body): Json<SignUpBody>,
) -> AppResult<(StatusCode, Json<User>)> {
    if body.username.is_empty() || body.password.is_empty() || body.display_name.is_empty() {
        return Err(AppError::bad_request(
            "username, password and displayName are required",
        ));
    }

    if state.users.get_by_username(&body.username).await?.is_some() {
        return Err(AppError::conflict("username already exists"));
    }

    let password_hash = hash_password(&body.password).await?;
    let profile_color_index = rand::thread_rng().gen::<u8>();

    let user = state
        .users
        .create(
            &body.username,
            &password_hash,
            &body.display_name,
            profile_color_index,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(user)))
}

#[derive(Debug, Deserialize)]
pub struct SignInBody {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub access_token: String,
}

pub async fn sign_in(
    State(state): State<AppState>,
    Json(body): Json<SignInBody>,
) -> AppResult<Json<Token>> {
    let user = state
        .users
        .get_by_username(&body.username)
        .await?
        .ok_or_else(|| AppError::not_found("user not found"))?;

    if !verify_password(&body.password, &user.password_hash).await? {
        return Err(AppError::unauthorized("invalid username or password"));
    }

    let access_token = state.jwt.issue_token(user.id)?;

    Ok(Json(Token { access_token }))
}

pub async fn sign_out(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> AppResult<StatusCode> {
    state.hub.disconnect(user_id).await;
    Ok(StatusCode::NO_CONTENT)
}
