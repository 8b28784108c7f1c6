use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::{RoomId, UserId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chatroom {
    pub id: RoomId,
    pub name: String,
    pub is_private: bool,
    #[serde(skip)]
    pub password_hash: Option<String>,
    pub owner_id: UserId,
    pub profile_color_index: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
