use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::Client;
use super::message::{Action, Message, RosterEntry};
use super::sfu::{self, RtcEngine, TrackRegistry};
use crate::models::{RoomId, UserId};

const CONTROL_CHANNEL_CAPACITY: usize = 64;
const BROADCAST_CHANNEL_CAPACITY: usize = 256;

pub(crate) struct RegisterCmd {
    pub client: Arc<Client>,
    pub ack: oneshot::Sender<()>,
}

pub(crate) struct UnregisterCmd {
    pub client: Arc<Client>,
    pub ack: Option<oneshot::Sender<()>>,
}

/// State shared between the room actor, the signaling loop, and per-track
/// forwarding tasks.
///
/// Membership is written only by the actor loop; the `RwLock` exists so
/// roster builders and the signaling loop can take consistent snapshots from
/// outside it. The track registry has its own async mutex because it is
/// touched by forwarding tasks and held across the whole reconciliation pass.
pub(crate) struct RoomShared {
    pub id: RoomId,
    pub members: parking_lot::RwLock<HashMap<UserId, Arc<Client>>>,
    pub tracks: tokio::sync::Mutex<TrackRegistry>,
    pub rtc: Arc<RtcEngine>,
    pub closed: CancellationToken,
    register_tx: mpsc::Sender<RegisterCmd>,
    pub(crate) unregister_tx: mpsc::Sender<UnregisterCmd>,
    broadcast_tx: mpsc::Sender<Arc<Message>>,
    rooms: Arc<DashMap<RoomId, RoomHandle>>,
}

/// Cloneable handle to a room actor.
#[derive(Clone)]
pub struct RoomHandle(pub(crate) Arc<RoomShared>);

impl RoomHandle {
    /// Spawn a new room actor and its keyframe ticker.
    pub(crate) fn spawn(
        id: RoomId,
        rtc: Arc<RtcEngine>,
        rooms: Arc<DashMap<RoomId, RoomHandle>>,
    ) -> Self {
        let (register_tx, register_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let (unregister_tx, unregister_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_CHANNEL_CAPACITY);

        let shared = Arc::new(RoomShared {
            id,
            members: parking_lot::RwLock::new(HashMap::new()),
            tracks: tokio::sync::Mutex::new(TrackRegistry::default()),
            rtc,
            closed: CancellationToken::new(),
            register_tx,
            unregister_tx,
            broadcast_tx,
            rooms,
        });

        let actor = RoomActor {
            shared: Arc::clone(&shared),
            register_rx,
            unregister_rx,
            broadcast_rx,
        };
        tokio::spawn(actor.run());
        tokio::spawn(sfu::keyframe_ticker(Arc::clone(&shared)));

        info!(room_id = %id, "Room created");

        Self(shared)
    }

    #[must_use]
    pub fn id(&self) -> RoomId {
        self.0.id
    }

    /// Register a client with the room actor and wait until membership is
    /// applied. Fails if the actor has already shut down.
    pub(crate) async fn register(&self, client: Arc<Client>) -> Result<(), RoomGone> {
        let (ack, done) = oneshot::channel();
        self.0
            .register_tx
            .send(RegisterCmd { client, ack })
            .await
            .map_err(|_| RoomGone)?;
        done.await.map_err(|_| RoomGone)
    }

    /// Enqueue an unregister without waiting for it to be processed.
    pub async fn unregister(&self, client: Arc<Client>) {
        let _ = self
            .0
            .unregister_tx
            .send(UnregisterCmd { client, ack: None })
            .await;
    }

    /// Enqueue an unregister and wait until the actor has applied it (the
    /// room back-reference is cleared before this returns).
    pub(crate) async fn unregister_wait(&self, client: Arc<Client>) -> Result<(), RoomGone> {
        let (ack, done) = oneshot::channel();
        self.0
            .unregister_tx
            .send(UnregisterCmd {
                client,
                ack: Some(ack),
            })
            .await
            .map_err(|_| RoomGone)?;
        done.await.map_err(|_| RoomGone)
    }

    /// Enqueue a broadcast to every current member.
    pub async fn broadcast(&self, message: Arc<Message>) {
        let _ = self.0.broadcast_tx.send(message).await;
    }

    /// Build the `LIST_USERS` roster: members sorted by ascending user id,
    /// each carrying presence flags and, once publishing, a stream id.
    pub async fn roster_message(&self) -> Message {
        let stream_ids = self.0.tracks.lock().await.stream_ids_by_publisher();

        let mut entries: Vec<RosterEntry> = self
            .0
            .members
            .read()
            .values()
            .map(|member| RosterEntry {
                user_id: member.id,
                display_name: member.display_name.clone(),
                profile_color_index: member.profile_color_index,
                muted: member.muted(),
                cam_on: member.cam_on(),
                stream_id: stream_ids.get(&member.id).cloned(),
            })
            .collect();
        entries.sort_by_key(|entry| entry.user_id);

        let content = serde_json::to_string(&entries).unwrap_or_else(|_| "[]".to_string());
        Message::with_content(Action::ListUsers, content)
    }

    #[must_use]
    pub fn members_snapshot(&self) -> Vec<Arc<Client>> {
        self.0.members.read().values().cloned().collect()
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.0.members.read().len()
    }

    #[must_use]
    pub fn contains(&self, id: UserId) -> bool {
        self.0.members.read().contains_key(&id)
    }
}

/// The target room actor has shut down.
#[derive(Debug)]
pub struct RoomGone;

struct RoomActor {
    shared: Arc<RoomShared>,
    register_rx: mpsc::Receiver<RegisterCmd>,
    unregister_rx: mpsc::Receiver<UnregisterCmd>,
    broadcast_rx: mpsc::Receiver<Arc<Message>>,
}

impl RoomActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                Some(cmd) = self.register_rx.recv() => {
                    self.handle_register(cmd).await;
                }
                Some(cmd) = self.unregister_rx.recv() => {
                    if self.handle_unregister(cmd).await {
                        break;
                    }
                }
                Some(message) = self.broadcast_rx.recv() => {
                    self.deliver(&message);
                }
                else => break,
            }
        }

        debug!(room_id = %self.shared.id, "Room actor stopped");
    }

    async fn handle_register(&mut self, cmd: RegisterCmd) {
        let client = cmd.client;

        // Last in wins: a previous entry for this identity is displaced and
        // its peer connection closed.
        let previous = self
            .shared
            .members
            .write()
            .insert(client.id, Arc::clone(&client));
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, &client) {
                previous.set_room(None);
                if let Some(pc) = previous.take_peer_connection() {
                    let _ = pc.close().await;
                }
            }
        }

        client.set_room(Some(RoomHandle(Arc::clone(&self.shared))));

        if let Err(e) = sfu::connect_to_peers(&self.shared, &client).await {
            warn!(
                room_id = %self.shared.id,
                client_id = %client.id,
                error = %e,
                "Failed to set up peer connection"
            );
        }

        info!(room_id = %self.shared.id, client_id = %client.id, "Client joined room");

        let roster = RoomHandle(Arc::clone(&self.shared)).roster_message().await;
        self.deliver(&Arc::new(roster));

        let _ = cmd.ack.send(());
    }

    /// Returns true when the room destroyed itself.
    async fn handle_unregister(&mut self, cmd: UnregisterCmd) -> bool {
        let client = cmd.client;

        let removed = {
            let mut members = self.shared.members.write();
            match members.get(&client.id) {
                // Only drop the entry if it is still this connection; a newer
                // connection for the same identity stays registered.
                Some(current) if Arc::ptr_eq(current, &client) => {
                    members.remove(&client.id);
                    true
                }
                _ => false,
            }
        };

        client.set_room(None);
        if let Some(pc) = client.take_peer_connection() {
            let _ = pc.close().await;
        }

        let purged = sfu::purge_publisher(&self.shared, client.id).await;

        if removed {
            info!(room_id = %self.shared.id, client_id = %client.id, "Client left room");
        }

        if self.shared.members.read().is_empty() {
            // A register may already be queued behind this unregister; drain
            // it before deciding the room is dead.
            let mut revived = false;
            while let Ok(pending) = self.register_rx.try_recv() {
                self.handle_register(pending).await;
                revived = true;
            }

            if !revived {
                self.shared.rooms.remove(&self.shared.id);
                self.shared.closed.cancel();
                info!(room_id = %self.shared.id, "Room destroyed");
                if let Some(ack) = cmd.ack {
                    let _ = ack.send(());
                }
                return true;
            }
        }

        if purged {
            sfu::signal_peer_connections(Arc::clone(&self.shared)).await;
        }

        let roster = RoomHandle(Arc::clone(&self.shared)).roster_message().await;
        self.deliver(&Arc::new(roster));

        if let Some(ack) = cmd.ack {
            let _ = ack.send(());
        }
        false
    }

    /// Fan a message out to every member without blocking: a member whose
    /// queue is full is dropped from membership on the spot, and its
    /// connection is torn down later by its own pumps.
    fn deliver(&self, message: &Arc<Message>) {
        let stalled: Vec<UserId> = {
            let members = self.shared.members.read();
            members
                .iter()
                .filter(|(_, member)| !member.try_queue(Arc::clone(message)))
                .map(|(id, _)| *id)
                .collect()
        };

        if !stalled.is_empty() {
            let mut members = self.shared.members.write();
            for id in stalled {
                members.remove(&id);
                warn!(room_id = %self.shared.id, client_id = %id, "Dropped stalled member");
            }
        }
    }
}
