use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use gather_core::auth::{hash_password, verify_password};
use gather_core::hub::{Action, Message};
use gather_core::models::{Chatroom, RoomId, UserId};

use super::auth::AuthUser;
use super::{AppError, AppResult, AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    #[serde(default)]
    pub owner_id: Option<i64>,
    #[serde(default)]
    pub member_id: Option<i64>,
}

pub async fn list_chatrooms(
    State(state): State<AppState>,
    AuthUser(_): AuthUser,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<Chatroom>>> {
    let chatrooms = state
        .chatrooms
        .list(query.owner_id.map(UserId), query.member_id.map(UserId))
        .await?;

    Ok(Json(chatrooms))
}

pub async fn get_chatroom(
    State(state): State<AppState>,
    AuthUser(_): AuthUser,
    Path(id): Path<i64>,
) -> AppResult<Json<Chatroom>> {
    let chatroom = state
        .chatrooms
        .get(RoomId(id))
        .await
        .map_err(|_| AppError::not_found("cannot find chatroom"))?;

    Ok(Json(chatroom))
}

#[derive(Debug, Deserialize)]
pub struct CreateBody {
    pub name: String,
    #[serde(default)]
    pub password: Option<String>,
}

pub async fn create_chatroom(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(body): Json<CreateBody>,
) -> AppResult<(StatusCode, Json<Chatroom>)> {
    if body.name.is_empty() {
        return Err(AppError::bad_request("name is required"));
    }

    let owner = state
        .users
        .get(user_id)
        .await
        .map_err(|_| AppError::not_found("cannot find user"))?;

    let password_hash = match body.password.as_deref().filter(|p| !p.is_empty()) {
        Some(password) => Some(hash_password(password).await?),
        None => None,
    };

    let chatroom = state
        .chatrooms
        .create(
            &body.name,
            owner.id,
            owner.profile_color_index,
            password_hash.as_deref(),
        )
        .await?;

    state
        .hub
        .broadcast_all(Message::new(Action::RoomListUpdated))
        .await;

    Ok((StatusCode::CREATED, Json(chatroom)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateBody {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Update a chatroom. Without a password it becomes public: the password and
/// member list are cleared and current occupants are kicked.
pub async fn update_chatroom(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<i64>,
    Json(body): Json<UpdateBody>,
) -> AppResult<Json<Chatroom>> {
    let room_id = RoomId(id);
    let chatroom = state
        .chatrooms
        .get(room_id)
        .await
        .map_err(|_| AppError::not_found("cannot find chatroom"))?;

    if chatroom.owner_id != user_id {
        return Err(AppError::forbidden("chatroom owner only"));
    }

    if let Some(name) = body.name.as_deref().filter(|n| !n.is_empty()) {
        state.chatrooms.rename(room_id, name).await?;
    }

    match body.password.as_deref().filter(|p| !p.is_empty()) {
        Some(password) => {
            let password_hash = hash_password(password).await?;
            state
                .chatrooms
                .set_password(room_id, &password_hash, user_id)
                .await?;
        }
        None => {
            state.chatrooms.make_public(room_id).await?;
            if chatroom.is_private {
                state.hub.kick_all_from_room(room_id).await;
            }
        }
    }

    state
        .hub
        .broadcast_all(Message::new(Action::RoomListUpdated))
        .await;

    Ok(Json(state.chatrooms.get(room_id).await?))
}

pub async fn delete_chatroom(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<i64>,
) -> AppResult<StatusCode> {
    let room_id = RoomId(id);
    let chatroom = state
        .chatrooms
        .get(room_id)
        .await
        .map_err(|_| AppError::not_found("cannot find chatroom"))?;

    if chatroom.owner_id != user_id {
        return Err(AppError::forbidden("chatroom owner only"));
    }

    state.chatrooms.delete(room_id).await?;

    state.hub.kick_all_from_room(room_id).await;
    state
        .hub
        .broadcast_all(Message::new(Action::RoomListUpdated))
        .await;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinBody {
    pub muted: bool,
    pub cam_on: bool,
    #[serde(default)]
    pub password: Option<String>,
}

/// Join a chatroom. Public rooms and existing members of private rooms skip
/// the password; everyone else must present it, which grants membership.
pub async fn join_chatroom(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<i64>,
    Json(body): Json<JoinBody>,
) -> AppResult<StatusCode> {
    let room_id = RoomId(id);
    let chatroom = state
        .chatrooms
        .get(room_id)
        .await
        .map_err(|_| AppError::not_found("cannot find chatroom"))?;

    if chatroom.is_private && !state.chatrooms.is_member(room_id, user_id).await? {
        let password = body.password.as_deref().unwrap_or_default();
        if password.is_empty() {
            return Err(AppError::forbidden(
                "not a member of the chatroom, password required",
            ));
        }

        let password_hash = chatroom.password_hash.as_deref().unwrap_or_default();
        if !verify_password(password, password_hash).await? {
            return Err(AppError::forbidden("incorrect password"));
        }

        state.chatrooms.add_member(room_id, user_id).await?;
    }

    state
        .hub
        .join_room(room_id, user_id, body.muted, body.cam_on)
        .await;

    Ok(StatusCode::OK)
}
