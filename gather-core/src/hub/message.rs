use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::UserId;

/// Capacity of each client's outbound message queue. A broadcast that finds
/// the queue full drops the member from its room instead of blocking.
pub const SEND_QUEUE_CAPACITY: usize = 256;

/// Time allowed to write a message to the peer.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed to read the next message from the peer, refreshed by pongs.
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Send pings to the peer with this period. Must be less than `READ_TIMEOUT`.
pub const PING_PERIOD: Duration = Duration::from_secs(54);

/// Maximum frame size allowed from the peer.
pub const MAX_FRAME_BYTES: usize = 65536;

/// The closed set of control-channel actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    ListUsers,
    JoinRoom,
    LeaveRoom,
    SendText,
    Mute,
    Unmute,
    TurnOnCam,
    TurnOffCam,
    Kicked,
    RoomListUpdated,
    Offer,
    Answer,
    Candidate,
    Invalid,
}

/// One control-channel frame. Inbound and outbound share the shape; the
/// server stamps sender metadata onto every inbound message before dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_color_index: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Message {
    #[must_use]
    pub fn new(action: Action) -> Self {
        Self {
            action,
            content: None,
            display_name: None,
            profile_color_index: None,
            created_at: None,
        }
    }

    #[must_use]
    pub fn with_content(action: Action, content: String) -> Self {
        Self {
            content: Some(content),
            ..Self::new(action)
        }
    }

    #[must_use]
    pub fn offer(sdp: String) -> Self {
        Self::with_content(Action::Offer, sdp)
    }

    #[must_use]
    pub fn candidate(candidate: String) -> Self {
        Self::with_content(Action::Candidate, candidate)
    }

    /// `INVALID` response echoing the offending frame back to its sender.
    #[must_use]
    pub fn invalid(echo: String) -> Self {
        Self::with_content(Action::Invalid, echo)
    }
}

/// One entry of the `LIST_USERS` roster, sorted by ascending user id.
/// `stream_id` is absent until the member publishes a track.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub user_id: UserId,
    pub display_name: String,
    pub profile_color_index: u8,
    pub muted: bool,
    pub cam_on: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_wire_names() {
        assert_eq!(
            serde_json::to_string(&Action::ListUsers).unwrap(),
            "\"LIST_USERS\""
        );
        assert_eq!(
            serde_json::to_string(&Action::TurnOnCam).unwrap(),
            "\"TURN_ON_CAM\""
        );
        assert_eq!(
            serde_json::from_str::<Action>("\"SEND_TEXT\"").unwrap(),
            Action::SendText
        );
        assert!(serde_json::from_str::<Action>("\"DEAFEN\"").is_err());
    }

    #[test]
    fn test_message_round_trip() {
        let json = r#"{"action":"SEND_TEXT","content":"hi"}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.action, Action::SendText);
        assert_eq!(msg.content.as_deref(), Some("hi"));
        assert!(msg.display_name.is_none());

        // unset optionals are omitted on the wire
        let out = serde_json::to_string(&msg).unwrap();
        assert_eq!(out, json);
    }

    #[test]
    fn test_roster_entry_serialization() {
        let entry = RosterEntry {
            user_id: UserId(7),
            display_name: "alice".to_string(),
            profile_color_index: 3,
            muted: true,
            cam_on: false,
            stream_id: None,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"userId\":7"));
        assert!(json.contains("\"displayName\":\"alice\""));
        assert!(json.contains("\"camOn\":false"));
        assert!(!json.contains("streamId"));
    }
}
