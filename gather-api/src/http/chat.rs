use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use gather_core::models::{Chat, ChatId, ChatWithSender, RoomId, UserId};

use super::auth::AuthUser;
use super::{AppError, AppResult, AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    #[serde(default)]
    pub chatroom_id: Option<i64>,
    #[serde(default)]
    pub sender_id: Option<i64>,
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub limit: i64,
}

/// Chat history: latest-first paging by offset/limit, returned oldest-first.
pub async fn list_chats(
    State(state): State<AppState>,
    AuthUser(_): AuthUser,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<ChatWithSender>>> {
    let chats = state
        .chats
        .list(
            query.chatroom_id.map(RoomId),
            query.sender_id.map(UserId),
            query.offset,
            query.limit,
        )
        .await?;

    Ok(Json(chats))
}

pub async fn get_chat(
    State(state): State<AppState>,
    AuthUser(_): AuthUser,
    Path(id): Path<i64>,
) -> AppResult<Json<Chat>> {
    let chat = state
        .chats
        .get(ChatId(id))
        .await
        .map_err(|_| AppError::not_found("cannot find chat"))?;

    Ok(Json(chat))
}
