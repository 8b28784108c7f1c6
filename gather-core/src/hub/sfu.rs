use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;

use super::client::Client;
use super::message::Message;
use super::room::{RoomHandle, RoomShared, UnregisterCmd};
use crate::config::RtcConfig;
use crate::models::UserId;
use crate::Result;

/// Reconciliation restarts tolerated within one pass before backing off.
const MAX_SYNC_ATTEMPTS: usize = 25;

/// Pause before retrying a reconciliation pass that kept restarting.
const SIGNAL_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Period of the per-room keyframe ticker, so late joiners get a decodable
/// stream within one tick.
const KEYFRAME_INTERVAL: Duration = Duration::from_secs(3);

/// Shared WebRTC API instance from which every peer connection is built.
pub struct RtcEngine {
    api: API,
    config: RtcConfig,
}

impl RtcEngine {
    pub fn new(config: RtcConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api, config })
    }

    async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let ice_servers = self
            .config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let pc = self
            .api
            .new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await?;

        Ok(Arc::new(pc))
    }
}

/// A member's currently published track.
struct PublishedTrack {
    track_id: String,
    stream_id: String,
}

/// The room's fan-out tracks plus the reverse index used for cleanup when a
/// publisher leaves. Guarded by `RoomShared::tracks`; the lock is held across
/// compound updates and across the whole reconciliation pass.
#[derive(Default)]
pub(crate) struct TrackRegistry {
    locals: HashMap<String, Arc<TrackLocalStaticRTP>>,
    publishers: HashMap<UserId, PublishedTrack>,
}

impl TrackRegistry {
    /// Insert a fan-out track for a publisher. A member publishes at most one
    /// track at a time; republishing drops the previous fan-out.
    pub(crate) fn publish(
        &mut self,
        publisher: UserId,
        track_id: String,
        stream_id: String,
        local: Arc<TrackLocalStaticRTP>,
    ) {
        if let Some(previous) = self.publishers.insert(
            publisher,
            PublishedTrack {
                track_id: track_id.clone(),
                stream_id,
            },
        ) {
            self.locals.remove(&previous.track_id);
        }
        self.locals.insert(track_id, local);
    }

    /// Remove a specific fan-out track, typically because its RTP source
    /// ended. Returns false if the track was already gone (for instance a
    /// republish replaced it).
    pub(crate) fn unpublish(&mut self, publisher: UserId, track_id: &str) -> bool {
        if self.locals.remove(track_id).is_none() {
            return false;
        }
        if self
            .publishers
            .get(&publisher)
            .is_some_and(|p| p.track_id == track_id)
        {
            self.publishers.remove(&publisher);
        }
        true
    }

    /// Remove whatever track a departing member was publishing.
    pub(crate) fn remove_publisher(&mut self, publisher: UserId) -> bool {
        match self.publishers.remove(&publisher) {
            Some(published) => {
                self.locals.remove(&published.track_id);
                true
            }
            None => false,
        }
    }

    pub(crate) fn contains(&self, track_id: &str) -> bool {
        self.locals.contains_key(track_id)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&String, &Arc<TrackLocalStaticRTP>)> {
        self.locals.iter()
    }

    pub(crate) fn stream_ids_by_publisher(&self) -> HashMap<UserId, String> {
        self.publishers
            .iter()
            .map(|(id, published)| (*id, published.stream_id.clone()))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locals.len()
    }
}

/// Create a peer connection for a freshly registered member, attach the ICE,
/// state, and track handlers, and run an initial reconciliation so the new
/// peer receives every live track.
pub(crate) async fn connect_to_peers(shared: &Arc<RoomShared>, client: &Arc<Client>) -> Result<()> {
    // A re-register replaces any previous peer connection.
    if let Some(old) = client.take_peer_connection() {
        let _ = old.close().await;
    }

    let pc = shared.rtc.new_peer_connection().await?;

    // Accept one incoming video and one incoming audio track.
    for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
        pc.add_transceiver_from_kind(
            kind,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: Vec::new(),
            }),
        )
        .await?;
    }

    client.set_peer_connection(Arc::clone(&pc));

    // Trickle ICE: emit server candidates to the client.
    {
        let client = Arc::clone(client);
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let client = Arc::clone(&client);
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        warn!(client_id = %client.id, error = %e, "Failed to serialize ICE candidate");
                        return;
                    }
                };
                match serde_json::to_string(&init) {
                    Ok(json) => {
                        client.try_queue(Arc::new(Message::candidate(json)));
                    }
                    Err(e) => {
                        warn!(client_id = %client.id, error = %e, "Failed to serialize ICE candidate");
                    }
                }
            })
        }));
    }

    // A failed peer connection is closed; a closed one triggers
    // reconciliation so its senders are cleaned out of the other peers.
    {
        let shared = Arc::clone(shared);
        let weak_pc = Arc::downgrade(&pc);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let shared = Arc::clone(&shared);
            let weak_pc = weak_pc.clone();
            Box::pin(async move {
                match state {
                    RTCPeerConnectionState::Failed => {
                        if let Some(pc) = weak_pc.upgrade() {
                            if let Err(e) = pc.close().await {
                                warn!(error = %e, "Failed to close failed peer connection");
                            }
                        }
                    }
                    RTCPeerConnectionState::Closed => {
                        tokio::spawn(signal_peer_connections(shared));
                    }
                    _ => {}
                }
            })
        }));
    }

    // Incoming media: fan it out to the rest of the room.
    {
        let shared = Arc::clone(shared);
        let publisher = client.id;
        pc.on_track(Box::new(move |remote, _receiver, _transceiver| {
            let shared = Arc::clone(&shared);
            Box::pin(async move {
                handle_remote_track(shared, publisher, remote).await;
            })
        }));
    }

    signal_peer_connections(Arc::clone(shared)).await;

    Ok(())
}

async fn handle_remote_track(
    shared: Arc<RoomShared>,
    publisher: UserId,
    remote: Arc<TrackRemote>,
) {
    let track_id = remote.id();
    let stream_id = remote.stream_id();

    info!(
        room_id = %shared.id,
        client_id = %publisher,
        track_id = %track_id,
        codec = %remote.codec().capability.mime_type,
        "Remote track received"
    );

    let local = Arc::new(TrackLocalStaticRTP::new(
        remote.codec().capability.clone(),
        track_id.clone(),
        stream_id.clone(),
    ));

    {
        let mut registry = shared.tracks.lock().await;
        registry.publish(publisher, track_id.clone(), stream_id, Arc::clone(&local));
    }

    signal_peer_connections(Arc::clone(&shared)).await;

    // The roster changed: members learn the publisher's stream id.
    let room = RoomHandle(Arc::clone(&shared));
    let roster = room.roster_message().await;
    room.broadcast(Arc::new(roster)).await;

    tokio::spawn(forward_rtp(shared, remote, local, publisher, track_id));
}

/// Pump RTP from a remote track into its fan-out track until either side
/// ends, then retire the track and re-offer.
async fn forward_rtp(
    shared: Arc<RoomShared>,
    remote: Arc<TrackRemote>,
    local: Arc<TrackLocalStaticRTP>,
    publisher: UserId,
    track_id: String,
) {
    loop {
        let packet = match remote.read_rtp().await {
            Ok((packet, _)) => packet,
            Err(e) => {
                debug!(track_id = %track_id, error = %e, "RTP read ended");
                break;
            }
        };

        if let Err(e) = local.write_rtp(&packet).await {
            debug!(track_id = %track_id, error = %e, "RTP write ended");
            break;
        }
    }

    let removed = shared.tracks.lock().await.unpublish(publisher, &track_id);
    if removed {
        signal_peer_connections(shared).await;
    }
}

/// Drop whatever track a departing member was publishing. Returns true if a
/// track was actually removed.
pub(crate) async fn purge_publisher(shared: &Arc<RoomShared>, publisher: UserId) -> bool {
    shared.tracks.lock().await.remove_publisher(publisher)
}

/// Reconcile every member's peer connection with the room's track registry,
/// issuing a fresh offer to each peer whose sender set changed.
///
/// The registry lock is held for the entire pass so one reconciliation sees a
/// consistent snapshot; concurrent requests serialize on the lock. The
/// restart budget bounds CPU when `add_track`/`remove_track` race the peer's
/// internal state; the delayed retry preserves eventual convergence.
pub(crate) fn signal_peer_connections(shared: Arc<RoomShared>) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        {
            let registry = shared.tracks.lock().await;

            let mut attempts = 0;
            loop {
                if attempts == MAX_SYNC_ATTEMPTS {
                    drop(registry);
                    tokio::spawn(async move {
                        tokio::time::sleep(SIGNAL_RETRY_DELAY).await;
                        signal_peer_connections(shared).await;
                    });
                    return;
                }

                if !attempt_sync(&shared, &registry).await {
                    break;
                }
                attempts += 1;
            }
        }

        dispatch_key_frame(&shared).await;
    })
}

/// One reconciliation scan. Returns true when the scan must restart from the
/// top (membership changed under it or a peer operation failed).
async fn attempt_sync(shared: &Arc<RoomShared>, registry: &TrackRegistry) -> bool {
    let members: Vec<Arc<Client>> = shared.members.read().values().cloned().collect();

    for member in members {
        let Some(pc) = member.peer_connection() else {
            continue;
        };

        if pc.connection_state() == RTCPeerConnectionState::Closed {
            let _ = shared.unregister_tx.try_send(UnregisterCmd {
                client: member,
                ack: None,
            });
            return true;
        }

        let mut attached: HashSet<String> = HashSet::new();
        let mut changed = false;

        // Drop senders whose track has left the registry.
        for sender in pc.get_senders().await {
            let Some(track) = sender.track().await else {
                continue;
            };
            let id = track.id().to_string();
            let in_registry = registry.contains(&id);
            attached.insert(id);

            if !in_registry {
                if pc.remove_track(&sender).await.is_err() {
                    return true;
                }
                changed = true;
            }
        }

        // A peer's own published track shows up in its receivers; marking it
        // attached keeps its media from being looped back to it.
        for receiver in pc.get_receivers().await {
            let Some(track) = receiver.tracks().await.into_iter().next() else {
                continue;
            };
            attached.insert(track.id());
        }

        // Attach every registry track the peer is not yet sending.
        for (id, local) in registry.iter() {
            if !attached.contains(id) {
                let track = Arc::clone(local) as Arc<dyn TrackLocal + Send + Sync>;
                if pc.add_track(track).await.is_err() {
                    return true;
                }
                changed = true;
            }
        }

        if changed {
            let offer = match pc.create_offer(None).await {
                Ok(offer) => offer,
                Err(_) => return true,
            };
            if pc.set_local_description(offer.clone()).await.is_err() {
                return true;
            }

            match serde_json::to_string(&offer) {
                Ok(json) => {
                    member.try_queue(Arc::new(Message::offer(json)));
                }
                Err(_) => return true,
            }
        }
    }

    false
}

/// Ask every live publisher for a keyframe by sending a PLI per receiver.
pub(crate) async fn dispatch_key_frame(shared: &Arc<RoomShared>) {
    let members: Vec<Arc<Client>> = shared.members.read().values().cloned().collect();

    for member in members {
        let Some(pc) = member.peer_connection() else {
            continue;
        };

        for receiver in pc.get_receivers().await {
            let Some(track) = receiver.tracks().await.into_iter().next() else {
                continue;
            };

            let pli = PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc: track.ssrc(),
            };
            if let Err(e) = pc.write_rtcp(&[Box::new(pli)]).await {
                debug!(room_id = %shared.id, error = %e, "Failed to send PLI");
            }
        }
    }
}

/// Periodic keyframe dispatch independent of signaling, so late viewers get
/// a decodable stream within one tick.
pub(crate) async fn keyframe_ticker(shared: Arc<RoomShared>) {
    let mut ticker = tokio::time::interval(KEYFRAME_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = shared.closed.cancelled() => break,
            _ = ticker.tick() => dispatch_key_frame(&shared).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

    fn fanout_track(id: &str, stream: &str) -> Arc<TrackLocalStaticRTP> {
        Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                ..Default::default()
            },
            id.to_string(),
            stream.to_string(),
        ))
    }

    #[test]
    fn test_publish_and_remove_publisher() {
        let mut registry = TrackRegistry::default();
        registry.publish(
            UserId(1),
            "t1".to_string(),
            "s1".to_string(),
            fanout_track("t1", "s1"),
        );

        assert!(registry.contains("t1"));
        assert_eq!(
            registry.stream_ids_by_publisher().get(&UserId(1)),
            Some(&"s1".to_string())
        );

        assert!(registry.remove_publisher(UserId(1)));
        assert!(!registry.contains("t1"));
        assert!(registry.stream_ids_by_publisher().is_empty());
        // a second removal is a no-op
        assert!(!registry.remove_publisher(UserId(1)));
    }

    #[test]
    fn test_republish_replaces_previous_track() {
        let mut registry = TrackRegistry::default();
        registry.publish(
            UserId(1),
            "t1".to_string(),
            "s1".to_string(),
            fanout_track("t1", "s1"),
        );
        registry.publish(
            UserId(1),
            "t2".to_string(),
            "s2".to_string(),
            fanout_track("t2", "s2"),
        );

        assert!(!registry.contains("t1"));
        assert!(registry.contains("t2"));
        assert_eq!(registry.len(), 1);

        // the stale forwarder's unpublish must not disturb the new track
        assert!(!registry.unpublish(UserId(1), "t1"));
        assert!(registry.contains("t2"));
        assert_eq!(
            registry.stream_ids_by_publisher().get(&UserId(1)),
            Some(&"s2".to_string())
        );
    }

    #[test]
    fn test_unpublish_exact_track() {
        let mut registry = TrackRegistry::default();
        registry.publish(
            UserId(1),
            "t1".to_string(),
            "s1".to_string(),
            fanout_track("t1", "s1"),
        );
        registry.publish(
            UserId(2),
            "t2".to_string(),
            "s2".to_string(),
            fanout_track("t2", "s2"),
        );

        assert!(registry.unpublish(UserId(1), "t1"));
        assert!(!registry.contains("t1"));
        assert!(registry.contains("t2"));
        assert_eq!(registry.len(), 1);
    }
}
