// src/ws.rs
//
// WebSocket fan-out.  One socket per viewer; each socket gets a writer task
// draining an unbounded queue, so a slow client never blocks the room.  All
// inbound JSON goes through the sync engine's dispatcher.
//
// ────────────────────────────────────────────────────────────────────────────

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::ApiError;
use crate::room::{now_ms, ClientHandle, Outbound, Room};
use crate::sync::{self, ServerMessage};
use crate::AppState;

/// Close code for a refused admission.
const CLOSE_ADMISSION_DENIED: u16 = 4003;
/// Viewer-count broadcasts are coalesced into one frame per window.
const VIEWERS_DEBOUNCE_MS: u64 = 500;

#[derive(Deserialize)]
pub struct WsQuery {
    pub room: String,
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(default)]
    pub token: Option<String>,
}

// ─── Upgrade handler ────────────────────────────────────────────────────────

/// GET /ws?room=&clientId=&token=
///
/// Unknown rooms are refused with 404 before the upgrade; bot-bound rooms
/// additionally require a valid member token (403).  Admission caps are
/// checked after the upgrade so the client receives the 4003 close code.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let room = state
        .registry
        .get(&query.room)
        .ok_or_else(|| ApiError::room_not_found(&query.room))?;

    let member = if room.discord.is_some() {
        let token = query.token.as_deref().ok_or_else(ApiError::token_invalid)?;
        Some(crate::token::validate_token(&room, token).ok_or_else(ApiError::token_invalid)?)
    } else {
        None
    };

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, room, query, member)))
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    room: Arc<Room>,
    query: WsQuery,
    member: Option<crate::room::Member>,
) {
    // ── Admission ───────────────────────────────────────────────────────
    let video_size = {
        let video_path = room.state.lock().unwrap().video_path.clone();
        state.uploads.video_size(video_path.as_deref())
    };
    let admitted = crate::limits::admit(
        &room,
        state.config.max_clients,
        state.config.max_room_bandwidth_mbps,
        video_size,
    );
    if admitted.is_err() {
        info!(
            "Room '{}': admission denied for client '{}'",
            room.id, query.client_id
        );
        let mut socket = socket;
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_ADMISSION_DENIED,
                reason: "Room full or bandwidth limit exceeded".into(),
            })))
            .await;
        return;
    }

    // ── Register the client ─────────────────────────────────────────────
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let key = room.add_client(ClientHandle {
        client_id: query.client_id.clone(),
        token: query.token.clone(),
        external_id: member.as_ref().map(|m| m.external_id.clone()),
        username: member.as_ref().map(|m| m.display_name.clone()),
        sender: tx,
        connected_at: now_ms(),
        last_ping_ms: AtomicU64::new(0),
        awaiting_pong: AtomicBool::new(false),
    });
    info!("Room '{}': client '{}' connected", room.id, query.client_id);

    // ── Initial frames ──────────────────────────────────────────────────
    let is_host = sync::is_host_client(&room, key);
    {
        let now = now_ms();
        let room_state = room.state.lock().unwrap();
        let frame = ServerMessage::Sync {
            current_time: room_state.playhead(now),
            is_playing: room_state.is_playing,
            server_time: now,
            is_host: Some(is_host),
        };
        drop(room_state);
        room.send_to(key, &frame);
    }
    if is_host {
        let (uploading, progress, processing, message) = {
            let s = room.state.lock().unwrap();
            (
                s.is_uploading,
                s.upload_progress,
                s.is_processing,
                s.processing_message.clone(),
            )
        };
        if uploading {
            room.send_to(key, &ServerMessage::UploadProgress { progress });
        }
        if processing {
            room.send_to(key, &ServerMessage::ProcessingProgress { message });
        }
    }
    room.send_to(
        key,
        &ServerMessage::SessionStatus {
            session: room.session_status(),
        },
    );
    schedule_viewers_broadcast(Arc::clone(&room));

    // ── Pump ────────────────────────────────────────────────────────────
    let (mut sink, mut stream) = socket.split();

    let mut write_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let result = match outbound {
                Outbound::Text(text) => sink.send(Message::Text(text)).await,
                Outbound::Ping => sink.send(Message::Ping(Vec::new())).await,
                Outbound::Close(code, reason) => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
    });

    let read_room = Arc::clone(&room);
    let mut read_task = tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(_) => break,
            };
            match msg {
                Message::Text(text) => match serde_json::from_str(&text) {
                    Ok(client_msg) => sync::handle_message(&read_room, key, client_msg),
                    Err(_) => {
                        // Unknown variants and malformed payloads are dropped.
                        debug!("Room '{}': ignoring malformed message", read_room.id);
                    }
                },
                Message::Pong(_) => {
                    let clients = read_room.clients.read().unwrap();
                    if let Some(handle) = clients.get(&key) {
                        handle.awaiting_pong.store(false, Ordering::Relaxed);
                    }
                }
                Message::Close(_) => break,
                // Protocol pings are answered by the transport; binary is
                // not part of this protocol.
                Message::Ping(_) | Message::Binary(_) => {}
            }
        }
    });

    tokio::select! {
        _ = (&mut write_task) => read_task.abort(),
        _ = (&mut read_task) => write_task.abort(),
    }

    // ── Cleanup ─────────────────────────────────────────────────────────
    room.remove_client(key);
    info!("Room '{}': client '{}' disconnected", room.id, query.client_id);
    schedule_viewers_broadcast(Arc::clone(&room));
    if room.client_count() == 0 {
        crate::registry::schedule_empty_check(Arc::clone(&state), room.id.clone());
    }
}

// ─── Viewer-count broadcast (debounced) ─────────────────────────────────────

/// Coalesce viewer-list changes into at most one `viewers` frame per 500 ms.
pub fn schedule_viewers_broadcast(room: Arc<Room>) {
    if room.viewers_pending.swap(true, Ordering::SeqCst) {
        return;
    }
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(VIEWERS_DEBOUNCE_MS)).await;
        room.viewers_pending.store(false, Ordering::SeqCst);
        let viewers = room.viewer_list();
        room.broadcast(&ServerMessage::Viewers {
            count: viewers.len(),
            viewers,
        });
    });
}

// ─── Heartbeat sweep ────────────────────────────────────────────────────────

/// Every 30 s: terminate sockets that missed the previous ping, then ping
/// the survivors.
pub fn spawn_heartbeat_loop(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
        interval.tick().await;
        loop {
            interval.tick().await;

            for room in state.registry.rooms() {
                let mut stale = Vec::new();
                {
                    let clients = room.clients.read().unwrap();
                    for (key, handle) in clients.iter() {
                        if handle.awaiting_pong.load(Ordering::Relaxed) {
                            stale.push(*key);
                        } else {
                            handle.awaiting_pong.store(true, Ordering::Relaxed);
                            let _ = handle.sender.send(Outbound::Ping);
                        }
                    }
                }

                let terminated = !stale.is_empty();
                for key in stale {
                    debug!("Room '{}': terminating unresponsive socket", room.id);
                    {
                        let clients = room.clients.read().unwrap();
                        if let Some(handle) = clients.get(&key) {
                            let _ = handle.sender.send(Outbound::Close(1001, "heartbeat timeout"));
                        }
                    }
                    room.remove_client(key);
                }

                if terminated && room.client_count() == 0 {
                    crate::registry::schedule_empty_check(
                        Arc::clone(&state),
                        room.id.clone(),
                    );
                }
            }
        }
    })
}
