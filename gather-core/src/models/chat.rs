use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::{ChatId, RoomId, UserId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: ChatId,
    pub chatroom_id: RoomId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A chat record decorated with its sender's public profile, the shape the
/// history endpoint returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatWithSender {
    #[serde(flatten)]
    pub chat: Chat,
    pub display_name: String,
    pub profile_color_index: u8,
}
