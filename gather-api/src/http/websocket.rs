//! WebSocket control-channel transport.
//!
//! The upgrade handler verifies the access token passed as a query parameter
//! (browser WebSocket clients cannot set an Authorization header) and then
//! runs one reader and one writer pump per connection. All protocol logic
//! lives on `gather_core::hub::Client`; the pumps only move frames.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gather_core::hub::{
    Client, Hub, Message, MAX_FRAME_BYTES, PING_PERIOD, READ_TIMEOUT, WRITE_TIMEOUT,
};
use gather_core::models::User;

use super::{AppError, AppResult, AppState};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub access_token: String,
}

pub async fn connect(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> AppResult<impl IntoResponse> {
    let user_id = state
        .jwt
        .verify_token(&query.access_token)
        .map_err(|_| AppError::unauthorized("Invalid access token"))?;

    let user = state
        .users
        .get(user_id)
        .await
        .map_err(|_| AppError::not_found("cannot find user"))?;

    Ok(ws
        .max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state, user)))
}

async fn handle_socket(socket: WebSocket, state: AppState, user: User) {
    info!(user_id = %user.id, "WebSocket connection established");

    let (client, outbound_rx) = Client::new(&user);
    state.hub.register(Arc::clone(&client)).await;

    let (sink, stream) = socket.split();

    let writer = tokio::spawn(write_pump(
        sink,
        outbound_rx,
        client.shutdown_token(),
        Arc::clone(&state.hub),
        Arc::clone(&client),
    ));
    read_pump(stream, Arc::clone(&state.hub), Arc::clone(&client)).await;

    let _ = writer.await;
    info!(user_id = %client.id, "WebSocket connection closed");
}

/// Pump frames from the transport into the protocol dispatcher. Exits on any
/// read error, oversize frame, close frame, or a 60 s silence (pings every
/// 54 s keep a live peer inside the deadline), then enqueues a hub
/// unregister.
async fn read_pump(mut stream: SplitStream<WebSocket>, hub: Arc<Hub>, client: Arc<Client>) {
    loop {
        let frame = match timeout(READ_TIMEOUT, stream.next()).await {
            Err(_) => {
                debug!(client_id = %client.id, "Read deadline expired");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(client_id = %client.id, error = %e, "Read error");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            WsMessage::Text(text) => match serde_json::from_str::<Message>(text.as_str()) {
                Ok(message) => Arc::clone(&client).handle_inbound(&hub, message).await,
                Err(e) => {
                    debug!(client_id = %client.id, error = %e, "Unparseable frame");
                    client
                        .queue(Arc::new(Message::invalid(text.as_str().to_string())))
                        .await;
                }
            },
            WsMessage::Close(_) => break,
            // The transport answers pings itself; any arriving frame,
            // including the peer's pongs, refreshes the read deadline.
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Binary(_) => {}
        }
    }

    hub.unregister(client).await;
}

/// Drain the outbound queue onto the transport, one text frame per message,
/// emitting pings on the ping ticker. A closed queue writes a close frame
/// and exits; any write error or timeout exits immediately.
async fn write_pump(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut outbound: mpsc::Receiver<Arc<Message>>,
    shutdown: CancellationToken,
    hub: Arc<Hub>,
    client: Arc<Client>,
) {
    let mut ping = tokio::time::interval(PING_PERIOD);
    ping.tick().await;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                // The hub closed the queue.
                let _ = timeout(WRITE_TIMEOUT, sink.send(WsMessage::Close(None))).await;
                break;
            }
            message = outbound.recv() => {
                let Some(message) = message else { break };
                let frame = match serde_json::to_string(&*message) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(client_id = %client.id, error = %e, "Failed to serialize frame");
                        continue;
                    }
                };
                match timeout(WRITE_TIMEOUT, sink.send(WsMessage::Text(frame.into()))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
            _ = ping.tick() => {
                match timeout(WRITE_TIMEOUT, sink.send(WsMessage::Ping(Vec::new().into()))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
        }
    }

    hub.unregister(client).await;
}
