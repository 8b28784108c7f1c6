use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use gather_core::auth::{hash_password, verify_password};
use gather_core::models::{User, UserId};

use super::auth::AuthUser;
use super::{AppError, AppResult, AppState};

pub async fn list_users(
    State(state): State<AppState>,
    AuthUser(_): AuthUser,
) -> AppResult<Json<Vec<User>>> {
    Ok(Json(state.users.list().await?))
}

pub async fn get_user(
    State(state): State<AppState>,
    AuthUser(_): AuthUser,
    Path(id): Path<i64>,
) -> AppResult<Json<User>> {
    let user = state
        .users
        .get(UserId(id))
        .await
        .map_err(|_| AppError::not_found("cannot find user"))?;

    Ok(Json(user))
}

pub async fn my_profile(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> AppResult<Json<User>> {
    let user = state
        .users
        .get(user_id)
        .await
        .map_err(|_| AppError::not_found("cannot find user"))?;

    Ok(Json(user))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateUserBody {
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

pub async fn update_user(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<i64>,
    Json(body): Json<UpdateUserBody>,
) -> AppResult<Json<User>> {
    if user_id != UserId(id) {
        return Err(AppError::forbidden("user can only update itself"));
    }

    // existence check before the partial updates
    state
        .users
        .get(user_id)
        .await
        .map_err(|_| AppError::not_found("cannot find user"))?;

    if let Some(password) = body.password.filter(|p| !p.is_empty()) {
        let password_hash = hash_password(&password).await?;
        state.users.update_password(user_id, &password_hash).await?;
    }

    if let Some(display_name) = body.display_name.filter(|n| !n.is_empty()) {
        state
            .users
            .update_display_name(user_id, &display_name)
            .await?;
    }

    Ok(Json(state.users.get(user_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct DeleteUserBody {
    pub password: String,
}

pub async fn delete_user(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<i64>,
    Json(body): Json<DeleteUserBody>,
) -> AppResult<StatusCode> {
    if user_id != UserId(id) {
        return Err(AppError::forbidden("user can only cancel account itself"));
    }

    let user = state
        .users
        .get(user_id)
        .await
        .map_err(|_| AppError::not_found("cannot find user"))?;

    if !verify_password(&body.password, &user.password_hash).await? {
        return Err(AppError::unauthorized("invalid password"));
    }

    state.users.delete(user_id).await?;

    Ok(StatusCode::NO_CONTENT)
}
