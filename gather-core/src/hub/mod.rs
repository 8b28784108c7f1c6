//! The realtime fabric: one hub actor owning the set of live connections,
//! one actor per room owning membership and fan-out, and the SFU plumbing
//! that keeps every peer connection aligned with its room's media tracks.

mod client;
mod message;
mod room;
mod sfu;

pub use client::Client;
pub use message::{
    Action, Message, RosterEntry, MAX_FRAME_BYTES, PING_PERIOD, READ_TIMEOUT, SEND_QUEUE_CAPACITY,
    WRITE_TIMEOUT,
};
pub use room::RoomHandle;
pub use sfu::RtcEngine;

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::models::{RoomId, UserId};
use crate::Result;

const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Best-effort persistence for chat records. `SEND_TEXT` broadcasts proceed
/// whether or not the save lands.
#[async_trait]
pub trait ChatSink: Send + Sync {
    async fn save_chat(&self, chatroom_id: RoomId, sender_id: UserId, content: &str) -> Result<()>;
}

enum HubCommand {
    Register(Arc<Client>),
    Unregister(Arc<Client>),
    JoinRoom {
        room_id: RoomId,
        user_id: UserId,
        muted: bool,
        cam_on: bool,
    },
    Disconnect(UserId),
    KickAllFromRoom(RoomId),
    BroadcastAll(Arc<Message>),
}

/// Process-wide registry of live clients and rooms.
///
/// All state mutation happens inside the hub actor; this handle enqueues
/// commands and offers read-only views. The hub is the only entity allowed to
/// disconnect a client across room boundaries.
pub struct Hub {
    commands: mpsc::Sender<HubCommand>,
    clients: Arc<DashMap<UserId, Arc<Client>>>,
    rooms: Arc<DashMap<RoomId, RoomHandle>>,
    chat: Arc<dyn ChatSink>,
}

impl Hub {
    pub fn new(rtc: Arc<RtcEngine>, chat: Arc<dyn ChatSink>) -> Arc<Self> {
        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let clients = Arc::new(DashMap::new());
        let rooms = Arc::new(DashMap::new());

        let actor = HubActor {
            clients: Arc::clone(&clients),
            rooms: Arc::clone(&rooms),
            rtc,
            commands: command_rx,
        };
        tokio::spawn(actor.run());

        Arc::new(Self {
            commands,
            clients,
            rooms,
            chat,
        })
    }

    /// Register a freshly connected client. An existing entry for the same
    /// identity is displaced and its write queue closed.
    pub async fn register(&self, client: Arc<Client>) {
        let _ = self.commands.send(HubCommand::Register(client)).await;
    }

    /// Tear a client down: its room is informed first, then the hub entry is
    /// dropped and the write queue closed. Either pump enqueues this when it
    /// exits; the second enqueue is a no-op.
    pub async fn unregister(&self, client: Arc<Client>) {
        let _ = self.commands.send(HubCommand::Unregister(client)).await;
    }

    /// Move a client into a room (creating it on first join), applying the
    /// initial presence flags. Joins are initiated by the HTTP layer, not
    /// over the control channel.
    pub async fn join_room(&self, room_id: RoomId, user_id: UserId, muted: bool, cam_on: bool) {
        let _ = self
            .commands
            .send(HubCommand::JoinRoom {
                room_id,
                user_id,
                muted,
                cam_on,
            })
            .await;
    }

    /// Force an unregister by identity; used on sign-out.
    pub async fn disconnect(&self, user_id: UserId) {
        let _ = self.commands.send(HubCommand::Disconnect(user_id)).await;
    }

    /// Emit `KICKED` to every member of a room, then unregister each; used
    /// when a room is deleted or made public.
    pub async fn kick_all_from_room(&self, room_id: RoomId) {
        let _ = self
            .commands
            .send(HubCommand::KickAllFromRoom(room_id))
            .await;
    }

    /// Fan a message out to every connected client, in or out of a room.
    pub async fn broadcast_all(&self, message: Message) {
        let _ = self
            .commands
            .send(HubCommand::BroadcastAll(Arc::new(message)))
            .await;
    }

    #[must_use]
    pub fn client(&self, id: UserId) -> Option<Arc<Client>> {
        self.clients.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn room(&self, id: RoomId) -> Option<RoomHandle> {
        self.rooms.get(&id).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub(crate) fn chat_sink(&self) -> Arc<dyn ChatSink> {
        Arc::clone(&self.chat)
    }
}

/// The hub actor. Owns every mutation of the clients and rooms maps; the
/// room actors themselves remove their own map entry when they empty.
struct HubActor {
    clients: Arc<DashMap<UserId, Arc<Client>>>,
    rooms: Arc<DashMap<RoomId, RoomHandle>>,
    rtc: Arc<RtcEngine>,
    commands: mpsc::Receiver<HubCommand>,
}

impl HubActor {
    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                HubCommand::Register(client) => self.handle_register(client),
                HubCommand::Unregister(client) => self.handle_unregister(client).await,
                HubCommand::JoinRoom {
                    room_id,
                    user_id,
                    muted,
                    cam_on,
                } => self.handle_join(room_id, user_id, muted, cam_on).await,
                HubCommand::Disconnect(user_id) => {
                    let client = self
                        .clients
                        .get(&user_id)
                        .map(|entry| Arc::clone(entry.value()));
                    match client {
                        Some(client) => self.handle_unregister(client).await,
                        None => debug!(user_id = %user_id, "Disconnect for unknown client"),
                    }
                }
                HubCommand::KickAllFromRoom(room_id) => self.handle_kick(room_id).await,
                HubCommand::BroadcastAll(message) => self.handle_broadcast_all(&message),
            }
        }
    }

    fn handle_register(&self, client: Arc<Client>) {
        info!(client_id = %client.id, "Client registered");
        if let Some(displaced) = self.clients.insert(client.id, client) {
            // Same identity connected twice: the incumbent loses.
            displaced.close_queue();
            info!(client_id = %displaced.id, "Displaced previous connection");
        }
    }

    async fn handle_unregister(&self, client: Arc<Client>) {
        if let Some(room) = client.room() {
            if room.unregister_wait(Arc::clone(&client)).await.is_err() {
                // The room actor is already gone; the back-reference is all
                // that is left to clear.
                client.set_room(None);
            }
        }

        let removed = self
            .clients
            .remove_if(&client.id, |_, current| Arc::ptr_eq(current, &client));
        if removed.is_some() {
            client.close_queue();
            info!(client_id = %client.id, "Client unregistered");
        }
    }

    async fn handle_join(&self, room_id: RoomId, user_id: UserId, muted: bool, cam_on: bool) {
        let Some(client) = self
            .clients
            .get(&user_id)
            .map(|entry| Arc::clone(entry.value()))
        else {
            debug!(user_id = %user_id, "Join for unknown client");
            return;
        };

        client.set_muted(muted);
        client.set_cam_on(cam_on);

        // A client may only be in one room at a time; re-register implicitly
        // leaves the previous one.
        if let Some(current) = client.room() {
            if current.id() != room_id {
                let _ = current.unregister_wait(Arc::clone(&client)).await;
            }
        }

        for _ in 0..3 {
            let room = self
                .rooms
                .entry(room_id)
                .or_insert_with(|| {
                    RoomHandle::spawn(room_id, Arc::clone(&self.rtc), Arc::clone(&self.rooms))
                })
                .clone();

            // A failed register means the actor died and removed its own map
            // entry between lookup and send; the next round creates a fresh
            // room.
            if room.register(Arc::clone(&client)).await.is_ok() {
                return;
            }
        }

        warn!(room_id = %room_id, user_id = %user_id, "Giving up on join, room kept dying");
    }

    async fn handle_kick(&self, room_id: RoomId) {
        let Some(room) = self.rooms.get(&room_id).map(|entry| entry.value().clone()) else {
            return;
        };

        let kicked = Arc::new(Message::new(Action::Kicked));
        for member in room.members_snapshot() {
            member.try_queue(Arc::clone(&kicked));
            let _ = room.unregister_wait(member).await;
        }

        info!(room_id = %room_id, "Kicked all clients from room");
    }

    fn handle_broadcast_all(&self, message: &Arc<Message>) {
        for entry in self.clients.iter() {
            entry.value().try_queue(Arc::clone(message));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc::Receiver;
    use tokio::time::{sleep, timeout};

    use crate::config::RtcConfig;
    use crate::models::User;

    struct RecordingSink {
        records: Mutex<Vec<(RoomId, UserId, String)>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                records: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatSink for RecordingSink {
        async fn save_chat(
            &self,
            chatroom_id: RoomId,
            sender_id: UserId,
            content: &str,
        ) -> Result<()> {
            self.records
                .lock()
                .push((chatroom_id, sender_id, content.to_string()));
            Ok(())
        }
    }

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

    fn test_hub(sink: Arc<dyn ChatSink>) -> Arc<Hub> {
        let rtc = Arc::new(RtcEngine::new(RtcConfig::default()).unwrap());
        Hub::new(rtc, sink)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// Drain a client's queue until a frame with the given action arrives.
    async fn recv_action(rx: &mut Receiver<Arc<Message>>, action: Action) -> Arc<Message> {
        timeout(Duration::from_secs(5), async {
            loop {
                let message = rx.recv().await.expect("queue closed");
                if message.action == action {
                    return message;
                }
            }
        })
        .await
        .expect("frame not received in time")
    }

    async fn join(hub: &Arc<Hub>, room: i64, user: i64) {
        hub.join_room(RoomId(room), UserId(user), false, false).await;
        let hub = Arc::clone(hub);
        wait_until(move || {
            hub.room(RoomId(room))
                .is_some_and(|r| r.contains(UserId(user)))
        })
        .await;
    }

    #[tokio::test]
    async fn test_join_then_leave_destroys_room() {
        let hub = test_hub(RecordingSink::new());
        let (client, _rx) = Client::new(&test_user(1));
        hub.register(Arc::clone(&client)).await;
        join(&hub, 7, 1).await;

        assert!(client.room().is_some_and(|r| r.id() == RoomId(7)));
        let client2 = Arc::clone(&client);
        wait_until(move || client2.peer_connection().is_some()).await;

        Arc::clone(&client)
            .handle_inbound(&hub, Message::new(Action::LeaveRoom))
            .await;

        let hub2 = Arc::clone(&hub);
        wait_until(move || hub2.room(RoomId(7)).is_none()).await;
        assert!(client.room().is_none());
        assert!(client.peer_connection().is_none());
        assert_eq!(hub.room_count(), 0);

        // a second LEAVE_ROOM after the back-reference is cleared is a no-op
        Arc::clone(&client)
            .handle_inbound(&hub, Message::new(Action::LeaveRoom))
            .await;
        assert!(client.room().is_none());
    }

    #[tokio::test]
    async fn test_two_user_text() {
        let sink = RecordingSink::new();
        let hub = test_hub(Arc::clone(&sink) as Arc<dyn ChatSink>);

        let (u1, mut rx1) = Client::new(&test_user(1));
        let (u2, mut rx2) = Client::new(&test_user(2));
        hub.register(Arc::clone(&u1)).await;
        hub.register(Arc::clone(&u2)).await;
        join(&hub, 7, 1).await;
        join(&hub, 7, 2).await;

        Arc::clone(&u1)
            .handle_inbound(
                &hub,
                Message::with_content(Action::SendText, "hi".to_string()),
            )
            .await;

        for rx in [&mut rx1, &mut rx2] {
            let message = recv_action(rx, Action::SendText).await;
            assert_eq!(message.content.as_deref(), Some("hi"));
            assert_eq!(message.display_name.as_deref(), Some("User 1"));
            assert_eq!(message.profile_color_index, Some(1));
            assert!(message.created_at.is_some());
        }

        let sink2 = Arc::clone(&sink);
        wait_until(move || !sink2.records.lock().is_empty()).await;
        assert_eq!(
            sink.records.lock().as_slice(),
            &[(RoomId(7), UserId(1), "hi".to_string())]
        );
    }

    #[tokio::test]
    async fn test_mute_broadcasts_roster() {
        let hub = test_hub(RecordingSink::new());

        let (u1, _rx1) = Client::new(&test_user(1));
        let (u2, mut rx2) = Client::new(&test_user(2));
        hub.register(Arc::clone(&u1)).await;
        hub.register(Arc::clone(&u2)).await;
        join(&hub, 7, 1).await;
        join(&hub, 7, 2).await;

        // consume the roster from u2's own join before testing the MUTEs
        recv_action(&mut rx2, Action::ListUsers).await;

        Arc::clone(&u1)
            .handle_inbound(&hub, Message::new(Action::Mute))
            .await;
        Arc::clone(&u1)
            .handle_inbound(&hub, Message::new(Action::Mute))
            .await;

        let first = recv_action(&mut rx2, Action::ListUsers).await;
        let second = recv_action(&mut rx2, Action::ListUsers).await;
        // idempotent: two MUTEs, two identical rosters
        assert_eq!(first.content, second.content);

        let roster: Vec<RosterEntry> =
            serde_json::from_str(first.content.as_deref().unwrap()).unwrap();
        assert_eq!(roster.len(), 2);
        assert_eq!(roster[0].user_id, UserId(1));
        assert!(roster[0].muted);
        assert_eq!(roster[1].user_id, UserId(2));
        assert!(!roster[1].muted);
    }

    #[tokio::test]
    async fn test_roster_sorted_by_user_id() {
        let hub = test_hub(RecordingSink::new());

        let mut receivers = Vec::new();
        for id in [3, 1, 2] {
            let (client, rx) = Client::new(&test_user(id));
            receivers.push(rx);
            hub.register(client).await;
            join(&hub, 9, id).await;
        }

        let room = hub.room(RoomId(9)).unwrap();
        let roster = room.roster_message().await;
        let entries: Vec<RosterEntry> =
            serde_json::from_str(roster.content.as_deref().unwrap()).unwrap();
        let ids: Vec<i64> = entries.iter().map(|e| e.user_id.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_slow_consumer_evicted() {
        let hub = test_hub(RecordingSink::new());

        let (u1, mut rx1) = Client::new(&test_user(1));
        let (u2, _rx2) = Client::new(&test_user(2));
        let (u3, mut rx3) = Client::new(&test_user(3));
        hub.register(Arc::clone(&u1)).await;
        hub.register(Arc::clone(&u2)).await;
        hub.register(Arc::clone(&u3)).await;
        join(&hub, 7, 1).await;
        join(&hub, 7, 2).await;
        join(&hub, 7, 3).await;

        // saturate u2's queue; its writer never drains
        while u2.try_queue(Arc::new(Message::new(Action::ListUsers))) {}

        Arc::clone(&u1)
            .handle_inbound(
                &hub,
                Message::with_content(Action::SendText, "hello".to_string()),
            )
            .await;

        let room = hub.room(RoomId(7)).unwrap();
        let room2 = room.clone();
        wait_until(move || !room2.contains(UserId(2))).await;

        // healthy members keep receiving
        let m1 = recv_action(&mut rx1, Action::SendText).await;
        assert_eq!(m1.content.as_deref(), Some("hello"));
        let m3 = recv_action(&mut rx3, Action::SendText).await;
        assert_eq!(m3.content.as_deref(), Some("hello"));

        // the evicted client is still registered with the hub until its
        // pumps notice
        assert!(hub.client(UserId(2)).is_some());
    }

    #[tokio::test]
    async fn test_kick_all_from_room() {
        let hub = test_hub(RecordingSink::new());

        let (u1, mut rx1) = Client::new(&test_user(1));
        let (u2, mut rx2) = Client::new(&test_user(2));
        hub.register(Arc::clone(&u1)).await;
        hub.register(Arc::clone(&u2)).await;
        join(&hub, 5, 1).await;
        join(&hub, 5, 2).await;

        hub.kick_all_from_room(RoomId(5)).await;

        let hub2 = Arc::clone(&hub);
        wait_until(move || hub2.room(RoomId(5)).is_none()).await;

        recv_action(&mut rx1, Action::Kicked).await;
        recv_action(&mut rx2, Action::Kicked).await;
        assert!(u1.room().is_none());
        assert!(u2.room().is_none());
    }

    #[tokio::test]
    async fn test_relogin_displaces_incumbent() {
        let hub = test_hub(RecordingSink::new());

        let (first, _rx1) = Client::new(&test_user(1));
        let (second, _rx2) = Client::new(&test_user(1));
        hub.register(Arc::clone(&first)).await;
        hub.register(Arc::clone(&second)).await;

        let first2 = Arc::clone(&first);
        wait_until(move || first2.is_closed()).await;
        assert!(!second.is_closed());
        assert!(Arc::ptr_eq(&hub.client(UserId(1)).unwrap(), &second));

        // the displaced connection's teardown must not evict the new one
        hub.unregister(Arc::clone(&first)).await;
        sleep(Duration::from_millis(50)).await;
        assert!(Arc::ptr_eq(&hub.client(UserId(1)).unwrap(), &second));
    }

    #[tokio::test]
    async fn test_disconnect_by_identity() {
        let hub = test_hub(RecordingSink::new());

        let (client, _rx) = Client::new(&test_user(4));
        hub.register(Arc::clone(&client)).await;
        join(&hub, 2, 4).await;

        hub.disconnect(UserId(4)).await;

        let hub2 = Arc::clone(&hub);
        wait_until(move || hub2.client(UserId(4)).is_none()).await;
        let hub3 = Arc::clone(&hub);
        wait_until(move || hub3.room(RoomId(2)).is_none()).await;
        assert!(client.is_closed());
        assert!(client.room().is_none());
    }

    #[tokio::test]
    async fn test_broadcast_all_reaches_roomless_clients() {
        let hub = test_hub(RecordingSink::new());

        let (in_room, mut rx1) = Client::new(&test_user(1));
        let (out_of_room, mut rx2) = Client::new(&test_user(2));
        hub.register(Arc::clone(&in_room)).await;
        hub.register(Arc::clone(&out_of_room)).await;
        join(&hub, 7, 1).await;

        hub.broadcast_all(Message::new(Action::RoomListUpdated)).await;

        recv_action(&mut rx1, Action::RoomListUpdated).await;
        recv_action(&mut rx2, Action::RoomListUpdated).await;
    }

    #[tokio::test]
    async fn test_switching_rooms_leaves_previous() {
        let hub = test_hub(RecordingSink::new());

        let (client, _rx) = Client::new(&test_user(1));
        hub.register(Arc::clone(&client)).await;
        join(&hub, 1, 1).await;
        join(&hub, 2, 1).await;

        let hub2 = Arc::clone(&hub);
        wait_until(move || hub2.room(RoomId(1)).is_none()).await;
        assert!(client.room().is_some_and(|r| r.id() == RoomId(2)));
        assert!(hub.room(RoomId(2)).unwrap().contains(UserId(1)));
    }

    #[tokio::test]
    async fn test_invalid_action_echoed() {
        let hub = test_hub(RecordingSink::new());

        let (client, mut rx) = Client::new(&test_user(1));
        hub.register(Arc::clone(&client)).await;
        join(&hub, 3, 1).await;

        Arc::clone(&client)
            .handle_inbound(&hub, Message::new(Action::Offer))
            .await;

        let message = recv_action(&mut rx, Action::Invalid).await;
        let echoed = message.content.as_deref().unwrap();
        assert!(echoed.contains("OFFER"));
        assert!(echoed.contains("User 1"));
    }

    #[tokio::test]
    async fn test_out_of_room_actions_ignored() {
        let hub = test_hub(RecordingSink::new());

        let (client, mut rx) = Client::new(&test_user(1));
        hub.register(Arc::clone(&client)).await;

        Arc::clone(&client)
            .handle_inbound(&hub, Message::new(Action::Mute))
            .await;
        Arc::clone(&client)
            .handle_inbound(&hub, Message::new(Action::ListUsers))
            .await;

        sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert!(!client.muted());
    }
}
