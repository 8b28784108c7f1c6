use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::debug;

use crate::{
    hub::ChatSink,
    models::{Chat, ChatId, ChatWithSender, RoomId, UserId},
    Result,
};

/// Chat record repository for database operations
#[derive(Clone)]
pub struct ChatRepository {
    pool: PgPool,
}

impl ChatRepository {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a new chat record
    pub async fn create(
        &self,
        chatroom_id: RoomId,
        sender_id: UserId,
        content: &str,
    ) -> Result<Chat> {
        let row = sqlx::query(
            r"
            INSERT INTO chats (chatroom_id, sender_id, content)
            VALUES ($1, $2, $3)
            RETURNING id, chatroom_id, sender_id, content, created_at
            ",
        )
        .bind(chatroom_id)
        .bind(sender_id)
        .bind(content)
        .fetch_one(&self.pool)
        .await?;

        row_to_chat(&row)
    }

    /// List chat history with latest-first paging, returned oldest-first so
    /// clients can render it top to bottom.
    pub async fn list(
        &self,
        chatroom_id: Option<RoomId>,
        sender_id: Option<UserId>,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<ChatWithSender>> {
        let limit = if limit <= 0 { 50 } else { limit.min(100) };

        let rows = sqlx::query(
            r"
            SELECT c.id, c.chatroom_id, c.sender_id, c.content, c.created_at,
                   u.display_name, u.profile_color_index
            FROM chats c
            JOIN users u ON u.id = c.sender_id
            WHERE ($1::BIGINT IS NULL OR c.chatroom_id = $1)
              AND ($2::BIGINT IS NULL OR c.sender_id = $2)
            ORDER BY c.created_at DESC, c.id DESC
            OFFSET $3
            LIMIT $4
            ",
        )
        .bind(chatroom_id)
        .bind(sender_id)
        .bind(offset.max(0))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut chats: Vec<ChatWithSender> = rows
            .iter()
            .map(row_to_chat_with_sender)
            .collect::<Result<_>>()?;
        chats.reverse();

        Ok(chats)
    }

    pub async fn get(&self, id: ChatId) -> Result<Chat> {
        let row = sqlx::query(
            r"
            SELECT id, chatroom_id, sender_id, content, created_at
            FROM chats
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        row_to_chat(&row)
    }
}

#[async_trait]
impl ChatSink for ChatRepository {
    async fn save_chat(&self, chatroom_id: RoomId, sender_id: UserId, content: &str) -> Result<()> {
        let chat = self.create(chatroom_id, sender_id, content).await?;
        debug!(chat_id = %chat.id, chatroom_id = %chatroom_id, "Saved chat record");
        Ok(())
    }
}

fn row_to_chat(row: &PgRow) -> Result<Chat> {
    Ok(Chat {
        id: row.try_get("id")?,
        chatroom_id: row.try_get("chatroom_id")?,
        sender_id: row.try_get("sender_id")?,
        content: row.try_get("content")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_chat_with_sender(row: &PgRow) -> Result<ChatWithSender> {
    Ok(ChatWithSender {
        chat: row_to_chat(row)?,
        display_name: row.try_get("display_name")?,
        profile_color_index: row.try_get::<i16, _>("profile_color_index")? as u8,
    })
}

#[cfg(test)]
mod tests {

    #[tokio::test]
    #[ignore = "Requires database"]
    async fn test_create_chat() {
        // Integration test placeholder
    }
}
