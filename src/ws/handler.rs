//! WebSocket upgrade handler

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::{PlayerInput, RoomHandle};
use crate::util::rate_limit::ConnectionRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::protocol::{ClientMsg, ServerMsg};

/// Longest accepted room id / display name
const MAX_ROOM_ID_LEN: usize = 48;
const MAX_NAME_LEN: usize = 24;

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Room to join; created on first join
    pub room: String,
    /// Display name
    pub name: String,
    /// Optional cosmetic color
    pub color: Option<String>,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let room_id = query.room.trim().to_string();
    let name = query.name.trim().to_string();

    if room_id.is_empty() || room_id.len() > MAX_ROOM_ID_LEN {
        return bad_request("invalid room id");
    }
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return bad_request("invalid name");
    }

    let color = query.color.filter(|c| c.len() <= 16);
    ws.on_upgrade(move |socket| handle_socket(socket, room_id, name, color, state))
}

fn bad_request(msg: &'static str) -> Response {
    Response::builder().status(400).body(msg.into()).unwrap()
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(
    socket: WebSocket,
    room_id: String,
    name: String,
    color: Option<String>,
    state: AppState,
) {
    let player_id = Uuid::new_v4();
    info!(player_id = %player_id, room_id = %room_id, "New WebSocket connection");

    let room = state.rooms.get_or_create(&room_id);
    let (mut ws_sink, ws_stream) = socket.split();

    // Capacity is enforced at the boundary: the room never sees the player
    if room.player_count() >= state.rooms.tuning().max_players {
        let refusal = ServerMsg::Error {
            code: "room_full".to_string(),
            message: "Room is full".to_string(),
        };
        let _ = send_msg(&mut ws_sink, &refusal).await;
        let _ = ws_sink.close().await;
        info!(player_id = %player_id, room_id = %room_id, "Join refused, room full");
        return;
    }

    // Subscribe before joining so the lobby broadcast is not missed
    let broadcast_rx = room.broadcast_tx.subscribe();

    let welcome = ServerMsg::Welcome {
        player_id,
        room_id: room.id.clone(),
        tuning: state.rooms.tuning().clone(),
        seed: room.seed,
        grid_width: state.rooms.tuning().grid_width,
        grid_height: state.rooms.tuning().grid_height,
        server_time: unix_millis(),
    };
    if let Err(e) = send_msg(&mut ws_sink, &welcome).await {
        error!(player_id = %player_id, error = %e, "Failed to send welcome");
        return;
    }

    let join = PlayerInput {
        player_id,
        msg: ClientMsg::Join { name, color },
    };
    if room.input_tx.send(join).await.is_err() {
        debug!(player_id = %player_id, "Room closed before join");
        return;
    }

    run_session(player_id, &room, ws_sink, ws_stream, broadcast_rx).await;

    info!(player_id = %player_id, room_id = %room.id, "WebSocket connection closed");
}

/// Run the WebSocket session with read/write split
async fn run_session(
    player_id: Uuid,
    room: &RoomHandle,
    mut ws_sink: futures::stream::SplitSink<WebSocket, Message>,
    mut ws_stream: futures::stream::SplitStream<WebSocket>,
    mut broadcast_rx: broadcast::Receiver<ServerMsg>,
) {
    let rate_limiter = ConnectionRateLimiter::new();
    let input_tx = room.input_tx.clone();

    // Spawn writer task: room broadcasts -> WebSocket
    let writer_handle = tokio::spawn(async move {
        loop {
            match broadcast_rx.recv().await {
                Ok(msg) => {
                    if let Err(e) = send_msg(&mut ws_sink, &msg).await {
                        debug!(player_id = %player_id, error = %e, "WebSocket send failed");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        player_id = %player_id,
                        lagged_count = n,
                        "Client lagged, skipping {} messages", n
                    );
                    // Continue - don't disconnect for lag
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!(player_id = %player_id, "Broadcast channel closed");
                    break;
                }
            }
        }
    });

    // Reader loop: WebSocket -> room task
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if !rate_limiter.check_input() {
                    warn!(player_id = %player_id, "Rate limited input message");
                    continue;
                }

                match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(client_msg) => {
                        let Some(msg) = sanitize(client_msg, player_id) else {
                            continue;
                        };
                        let leaving = matches!(msg, ClientMsg::Leave);

                        let input = PlayerInput { player_id, msg };
                        if input_tx.send(input).await.is_err() {
                            debug!(player_id = %player_id, "Input channel closed");
                            break;
                        }
                        if leaving {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(player_id = %player_id, error = %e, "Failed to parse client message");
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                warn!(player_id = %player_id, "Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(player_id = %player_id, "Client initiated close");
                break;
            }
            Err(e) => {
                error!(player_id = %player_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    // Signal disconnect to the room task
    let _ = input_tx
        .send(PlayerInput {
            player_id,
            msg: ClientMsg::Leave,
        })
        .await;

    // Abort writer task
    writer_handle.abort();
}

/// Boundary validation: the simulation only ever sees well-formed input.
/// Joins can't be re-sent over an established session, and move vectors are
/// clamped with non-finite floats zeroed.
fn sanitize(msg: ClientMsg, player_id: Uuid) -> Option<ClientMsg> {
    match msg {
        ClientMsg::Join { .. } => {
            warn!(player_id = %player_id, "Duplicate join over open session, ignoring");
            None
        }
        ClientMsg::Input {
            seq,
            move_x,
            move_y,
            dash,
        } => {
            let clean = |v: f32| if v.is_finite() { v.clamp(-1.0, 1.0) } else { 0.0 };
            Some(ClientMsg::Input {
                seq,
                move_x: clean(move_x),
                move_y: clean(move_y),
                dash,
            })
        }
        other => Some(other),
    }
}

/// Send a message over WebSocket
async fn send_msg(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    msg: &ServerMsg,
) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_clamps_and_zeroes_move() {
        let id = Uuid::nil();
        let msg = ClientMsg::Input {
            seq: 1,
            move_x: 5.0,
            move_y: f32::NAN,
            dash: true,
        };
        let Some(ClientMsg::Input { move_x, move_y, dash, .. }) = sanitize(msg, id) else {
            panic!("input should pass sanitize");
        };
        assert_eq!(move_x, 1.0);
        assert_eq!(move_y, 0.0);
        assert!(dash);
    }

    #[test]
    fn test_sanitize_drops_resent_join() {
        let msg = ClientMsg::Join {
            name: "again".to_string(),
            color: None,
        };
        assert!(sanitize(msg, Uuid::nil()).is_none());
    }
}
