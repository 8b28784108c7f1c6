use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::message::{Action, Message, SEND_QUEUE_CAPACITY};
use super::room::RoomHandle;
use super::Hub;
use crate::models::{User, UserId};

/// One authenticated connection.
///
/// The client owns its bounded outbound queue and its peer connection; its
/// room back-reference is maintained exclusively by the room actor. The
/// WebSocket pumps live in the transport layer and talk to the rest of the
/// system only through this type.
pub struct Client {
    pub id: UserId,
    pub display_name: String,
    pub profile_color_index: u8,
    muted: AtomicBool,
    cam_on: AtomicBool,
    outbound: mpsc::Sender<Arc<Message>>,
    shutdown: CancellationToken,
    room: parking_lot::Mutex<Option<RoomHandle>>,
    peer_connection: parking_lot::Mutex<Option<Arc<RTCPeerConnection>>>,
}

impl Client {
    /// Allocate a client and the receiving half of its outbound queue, which
    /// the connection's writer task consumes.
    #[must_use]
    pub fn new(user: &User) -> (Arc<Self>, mpsc::Receiver<Arc<Message>>) {
        let (outbound, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);

        let client = Arc::new(Self {
            id: user.id,
            display_name: user.display_name.clone(),
            profile_color_index: user.profile_color_index,
            muted: AtomicBool::new(false),
            cam_on: AtomicBool::new(false),
            outbound,
            shutdown: CancellationToken::new(),
            room: parking_lot::Mutex::new(None),
            peer_connection: parking_lot::Mutex::new(None),
        });

        (client, rx)
    }

    /// Non-blocking enqueue, used by every broadcast path. Returns false when
    /// the queue is full, which marks this client as a stalled consumer.
    pub fn try_queue(&self, message: Arc<Message>) -> bool {
        self.outbound.try_send(message).is_ok()
    }

    /// Blocking enqueue, used only from the client's own reader. A reader
    /// waiting on its own writer is ordinary flow control.
    pub async fn queue(&self, message: Arc<Message>) {
        let _ = self.outbound.send(message).await;
    }

    /// Close the outbound queue, terminating the connection's writer task.
    pub fn close_queue(&self) {
        self.shutdown.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token the writer task selects on; cancelled when the queue is closed.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    #[must_use]
    pub fn muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    #[must_use]
    pub fn cam_on(&self) -> bool {
        self.cam_on.load(Ordering::Relaxed)
    }

    pub fn set_cam_on(&self, cam_on: bool) {
        self.cam_on.store(cam_on, Ordering::Relaxed);
    }

    #[must_use]
    pub fn room(&self) -> Option<RoomHandle> {
        self.room.lock().clone()
    }

    pub(crate) fn set_room(&self, room: Option<RoomHandle>) {
        *self.room.lock() = room;
    }

    #[must_use]
    pub fn peer_connection(&self) -> Option<Arc<RTCPeerConnection>> {
        self.peer_connection.lock().clone()
    }

    pub(crate) fn set_peer_connection(&self, pc: Arc<RTCPeerConnection>) {
        *self.peer_connection.lock() = Some(pc);
    }

    pub(crate) fn take_peer_connection(&self) -> Option<Arc<RTCPeerConnection>> {
        self.peer_connection.lock().take()
    }

    /// Stamp a frame with the sender's identity and the current time, so
    /// receivers never have to trust peer-supplied metadata.
    fn stamp(&self, message: &mut Message) {
        message.display_name = Some(self.display_name.clone());
        message.profile_color_index = Some(self.profile_color_index);
        message.created_at = Some(Utc::now());
    }

    /// Dispatch one inbound frame.
    ///
    /// SDP answers and ICE candidates are forwarded to the peer connection
    /// whether or not the client is still in a room (they may trail a leave);
    /// every other action requires a current room.
    pub async fn handle_inbound(self: Arc<Self>, hub: &Hub, mut message: Message) {
        self.stamp(&mut message);
        debug!(client_id = %self.id, action = ?message.action, "Inbound message");

        match message.action {
            Action::Answer => {
                self.apply_answer(message.content.as_deref().unwrap_or_default())
                    .await;
                return;
            }
            Action::Candidate => {
                self.apply_candidate(message.content.as_deref().unwrap_or_default())
                    .await;
                return;
            }
            _ => {}
        }

        let Some(room) = self.room() else {
            debug!(client_id = %self.id, "Client is not in a room, message ignored");
            return;
        };

        match message.action {
            Action::ListUsers => {
                self.queue(Arc::new(room.roster_message().await)).await;
            }

            Action::LeaveRoom => {
                room.unregister(Arc::clone(&self)).await;
            }

            Action::SendText => {
                let sink = hub.chat_sink();
                let chatroom_id = room.id();
                let sender_id = self.id;
                let content = message.content.clone().unwrap_or_default();
                // Best effort: broadcast proceeds whether or not the record lands.
                tokio::spawn(async move {
                    if let Err(e) = sink.save_chat(chatroom_id, sender_id, &content).await {
                        warn!(chatroom_id = %chatroom_id, error = %e, "Failed to save chat record");
                    }
                });

                room.broadcast(Arc::new(message)).await;
            }

            Action::Mute => {
                self.set_muted(true);
                room.broadcast(Arc::new(room.roster_message().await)).await;
            }

            Action::Unmute => {
                self.set_muted(false);
                room.broadcast(Arc::new(room.roster_message().await)).await;
            }

            Action::TurnOnCam => {
                self.set_cam_on(true);
                room.broadcast(Arc::new(room.roster_message().await)).await;
            }

            Action::TurnOffCam => {
                self.set_cam_on(false);
                room.broadcast(Arc::new(room.roster_message().await)).await;
            }

            // Server-originated actions are not valid inbound.
            Action::JoinRoom
            | Action::Kicked
            | Action::RoomListUpdated
            | Action::Offer
            | Action::Invalid => {
                let echo = serde_json::to_string(&message).unwrap_or_default();
                self.queue(Arc::new(Message::invalid(echo))).await;
            }

            // dispatched before the room check
            Action::Answer | Action::Candidate => {}
        }
    }

    /// Applied on the reader so an answer is always in place before the
    /// candidates that trail it.
    async fn apply_answer(&self, content: &str) {
        let Some(pc) = self.peer_connection() else {
            debug!(client_id = %self.id, "ANSWER without a peer connection, ignored");
            return;
        };

        let answer = match serde_json::from_str::<RTCSessionDescription>(content) {
            Ok(answer) => answer,
            Err(e) => {
                warn!(client_id = %self.id, error = %e, "Malformed SDP answer");
                return;
            }
        };

        if let Err(e) = pc.set_remote_description(answer).await {
            warn!(client_id = %self.id, error = %e, "Failed to set remote description");
        }
    }

    async fn apply_candidate(&self, content: &str) {
        let Some(pc) = self.peer_connection() else {
            debug!(client_id = %self.id, "CANDIDATE without a peer connection, ignored");
            return;
        };

        let candidate = match serde_json::from_str::<RTCIceCandidateInit>(content) {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!(client_id = %self.id, error = %e, "Malformed ICE candidate");
                return;
            }
        };

        if let Err(e) = pc.add_ice_candidate(candidate).await {
            warn!(client_id = %self.id, error = %e, "Failed to add ICE candidate");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn test_user(id: i64) -> User {
        User {
            id: UserId(id),
            username: format!("user{id}"),
            password_hash: String::new(),
            display_name: format!("User {id}"),
            profile_color_index: (id % 8) as u8,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_queue_bounded() {
        let (client, _rx) = Client::new(&test_user(1));

        for _ in 0..SEND_QUEUE_CAPACITY {
            assert!(client.try_queue(Arc::new(Message::new(Action::ListUsers))));
        }
        // queue full: the non-blocking path reports the stall instead of waiting
        assert!(!client.try_queue(Arc::new(Message::new(Action::ListUsers))));
    }

    #[tokio::test]
    async fn test_stamp_overwrites_peer_metadata() {
        let (client, _rx) = Client::new(&test_user(3));

        let mut message = Message {
            action: Action::SendText,
            content: Some("hi".to_string()),
            display_name: Some("spoofed".to_string()),
            profile_color_index: Some(200),
            created_at: None,
        };
        client.stamp(&mut message);

        assert_eq!(message.display_name.as_deref(), Some("User 3"));
        assert_eq!(message.profile_color_index, Some(3));
        assert!(message.created_at.is_some());
    }

    #[tokio::test]
    async fn test_presence_flags() {
        let (client, _rx) = Client::new(&test_user(2));
        assert!(!client.muted());
        assert!(!client.cam_on());

        client.set_muted(true);
        client.set_muted(true);
        assert!(client.muted());

        client.set_cam_on(true);
        client.set_cam_on(false);
        assert!(!client.cam_on());
    }
}
