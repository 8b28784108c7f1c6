use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::UserId;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub username: String,
    #[serde(skip)]
    pub password_hash: String,
    pub display_name: String,
    pub profile_color_index: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
