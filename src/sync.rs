// src/sync.rs
//
// Synchronization protocol engine.
//
// The room holds a reference pair `(current_time, last_update, is_playing)`;
// the effective playhead is a pure function of those and the clock.  Host
// commands move the reference point under replay protection (strictly
// increasing `seq`).  A global 1 Hz tick re-broadcasts the computed playhead
// so viewers can correct drift, with the frame's `serverTime` letting them
// compensate for network latency.
//
// ────────────────────────────────────────────────────────────────────────────

use std::sync::atomic::Ordering;
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::room::{now_ms, Rating, Room, RoomStatus, SessionStatus, Subtitle, ViewerInfo};

// ─── Inbound messages ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ClientMetrics {
    #[serde(rename = "lastPing")]
    pub last_ping: Option<u64>,
}

/// Everything a client may send over the WebSocket.
///
/// Unknown `type` values and malformed payloads fail to decode; the caller
/// drops them without disturbing the room.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Ping {
        timestamp: u64,
    },
    Play {
        current_time: f64,
        seq: u64,
        #[serde(default)]
        timestamp: Option<u64>,
    },
    Pause {
        current_time: f64,
        seq: u64,
        #[serde(default)]
        timestamp: Option<u64>,
    },
    Seek {
        current_time: f64,
        seq: u64,
        #[serde(default)]
        timestamp: Option<u64>,
    },
    /// Drift request: answered with a personal `sync` frame.
    State,
    HostHeartbeat {
        #[serde(default)]
        timestamp: Option<u64>,
    },
    UpdateMetrics {
        metrics: ClientMetrics,
    },
    SessionStatus,
}

// ─── Outbound messages ──────────────────────────────────────────────────────

/// Everything the server sends to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Pong {
        timestamp: u64,
        server_time: u64,
    },
    Sync {
        current_time: f64,
        is_playing: bool,
        server_time: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_host: Option<bool>,
    },
    Viewers {
        count: usize,
        viewers: Vec<ViewerInfo>,
    },
    UploadStart {
        filename: String,
    },
    UploadProgress {
        progress: u8,
    },
    ProcessingProgress {
        message: String,
    },
    VideoReady {
        video_url: String,
        subtitles: Vec<Subtitle>,
    },
    SessionEnding,
    SessionEnded,
    SessionStatus {
        #[serde(flatten)]
        session: SessionStatus,
    },
    RatingReceived {
        ratings: Vec<Rating>,
    },
    AllRatingsReceived {
        ratings: Vec<Rating>,
        average: f64,
    },
    HostChanged {
        new_host_id: String,
        new_host_username: String,
    },
    SubtitleAdded {
        filename: String,
        display_name: String,
    },
}

// ─── Host commands ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Play,
    Pause,
    Seek,
}

/// Outcome of an accepted host command.
pub struct Applied {
    pub frame: ServerMessage,
    /// Set when the command moved the room from `waiting` to `playing`.
    pub status_changed: bool,
}

/// Apply a host playback command under replay protection.
///
/// Returns `None` when the command is dropped: stale/duplicate `seq`, or the
/// session has already ended.  `seek` preserves the play/pause state.
pub fn apply_command(
    room: &Room,
    kind: CommandKind,
    current_time: f64,
    seq: u64,
) -> Option<Applied> {
    let now = now_ms();
    let mut state = room.state.lock().unwrap();

    if state.status == RoomStatus::Ended {
        return None;
    }
    if seq <= state.last_command_seq {
        debug!(
            room = %room.id,
            seq,
            last = state.last_command_seq,
            "dropping stale host command"
        );
        return None;
    }

    state.current_time = current_time;
    state.last_update = now;
    state.last_command_seq = seq;
    state.host_last_heartbeat = now;

    match kind {
        CommandKind::Play => state.is_playing = true,
        CommandKind::Pause => state.is_playing = false,
        CommandKind::Seek => {}
    }

    let mut status_changed = false;
    if kind == CommandKind::Play && !state.playback_started {
        state.playback_started = true;
        if room.discord.is_some() && state.status == RoomStatus::Waiting {
            state.status = RoomStatus::Playing;
            status_changed = true;
            info!("Room '{}' entered playback", room.id);
        }
    }

    let frame = ServerMessage::Sync {
        current_time: state.current_time,
        is_playing: state.is_playing,
        server_time: now,
        is_host: None,
    };

    Some(Applied {
        frame,
        status_changed,
    })
}

/// Build a `sync` frame with the current computed playhead.
pub fn sync_frame(room: &Room) -> ServerMessage {
    let now = now_ms();
    let state = room.state.lock().unwrap();
    ServerMessage::Sync {
        current_time: state.playhead(now),
        is_playing: state.is_playing,
        server_time: now,
        is_host: None,
    }
}

// ─── Message dispatch ───────────────────────────────────────────────────────

/// Handle one decoded inbound message from `client_key`.
pub fn handle_message(room: &Arc<Room>, client_key: u64, msg: ClientMessage) {
    match msg {
        ClientMessage::Ping { timestamp } => {
            room.send_to(
                client_key,
                &ServerMessage::Pong {
                    timestamp,
                    server_time: now_ms(),
                },
            );
        }

        ClientMessage::Play { current_time, seq, .. } => {
            host_command(room, client_key, CommandKind::Play, current_time, seq);
        }
        ClientMessage::Pause { current_time, seq, .. } => {
            host_command(room, client_key, CommandKind::Pause, current_time, seq);
        }
        ClientMessage::Seek { current_time, seq, .. } => {
            host_command(room, client_key, CommandKind::Seek, current_time, seq);
        }

        ClientMessage::State => {
            room.send_to(client_key, &sync_frame(room));
        }

        ClientMessage::HostHeartbeat { .. } => {
            if is_host_client(room, client_key) {
                room.state.lock().unwrap().host_last_heartbeat = now_ms();
            }
        }

        ClientMessage::UpdateMetrics { metrics } => {
            if let Some(ping) = metrics.last_ping {
                let token = {
                    let clients = room.clients.read().unwrap();
                    clients.get(&client_key).map(|c| {
                        c.last_ping_ms.store(ping, Ordering::Relaxed);
                        c.token.clone()
                    })
                };
                if let Some(Some(token)) = token {
                    if let Some(member) = room.members.write().unwrap().get_mut(&token) {
                        member.last_ping_ms = Some(ping);
                    }
                }
                crate::ws::schedule_viewers_broadcast(Arc::clone(room));
            }
        }

        ClientMessage::SessionStatus => {
            room.send_to(
                client_key,
                &ServerMessage::SessionStatus {
                    session: room.session_status(),
                },
            );
        }
    }
}

fn host_command(
    room: &Arc<Room>,
    client_key: u64,
    kind: CommandKind,
    current_time: f64,
    seq: u64,
) {
    if !is_host_client(room, client_key) {
        debug!(room = %room.id, "dropping playback command from non-host socket");
        return;
    }
    if let Some(applied) = apply_command(room, kind, current_time, seq) {
        room.broadcast(&applied.frame);
        if applied.status_changed {
            room.broadcast(&ServerMessage::SessionStatus {
                session: room.session_status(),
            });
        }
    }
}

/// Whether the socket behind `client_key` belongs to the current host.
pub fn is_host_client(room: &Room, client_key: u64) -> bool {
    let (token, client_id) = {
        let clients = room.clients.read().unwrap();
        match clients.get(&client_key) {
            Some(c) => (c.token.clone(), c.client_id.clone()),
            None => return false,
        }
    };

    if let Some(token) = token {
        let members = room.members.read().unwrap();
        return members.get(&token).map(|m| m.is_host).unwrap_or(false);
    }

    // Rooms without a bot binding identify the host by client id.
    let state = room.state.lock().unwrap();
    state.host_id.as_deref() == Some(client_id.as_str())
}

// ─── Periodic sync tick ─────────────────────────────────────────────────────

/// Per-room broadcast interval: 2 s while playing, 5 s while paused (the
/// paused frame doubles as an application-level keep-alive).
pub fn sync_interval_ms(is_playing: bool) -> u64 {
    if is_playing {
        2_000
    } else {
        5_000
    }
}

/// Global 1 Hz loop driving periodic sync frames for every room.
pub fn spawn_sync_loop(state: Arc<crate::AppState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            interval.tick().await;

            for room in state.registry.rooms() {
                if room.client_count() == 0 {
                    continue;
                }

                let frame = {
                    let now = now_ms();
                    let mut room_state = room.state.lock().unwrap();
                    if room_state.status == RoomStatus::Ended {
                        continue;
                    }
                    let due = now.saturating_sub(room_state.last_sync_sent)
                        >= sync_interval_ms(room_state.is_playing);
                    if !due {
                        continue;
                    }
                    room_state.last_sync_sent = now;
                    ServerMessage::Sync {
                        current_time: room_state.playhead(now),
                        is_playing: room_state.is_playing,
                        server_time: now,
                        is_host: None,
                    }
                };

                room.broadcast(&frame);
            }
        }
    })
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_room() -> Room {
        Room::new(
            "room-1".into(),
            "t".into(),
            "m".into(),
            None,
            None,
            None,
        )
    }

    #[test]
    fn commands_require_increasing_seq() {
        let room = test_room();

        assert!(apply_command(&room, CommandKind::Play, 0.0, 1).is_some());
        // Duplicate seq is a no-op.
        assert!(apply_command(&room, CommandKind::Play, 5.0, 1).is_none());
        // Older seq is a no-op.
        assert!(apply_command(&room, CommandKind::Pause, 5.0, 0).is_none());
        // Next seq applies.
        let applied = apply_command(&room, CommandKind::Pause, 3.0, 2).unwrap();
        match applied.frame {
            ServerMessage::Sync {
                current_time,
                is_playing,
                ..
            } => {
                assert_eq!(current_time, 3.0);
                assert!(!is_playing);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn seek_preserves_play_state() {
        let room = test_room();
        apply_command(&room, CommandKind::Play, 0.0, 1).unwrap();
        apply_command(&room, CommandKind::Seek, 42.0, 2).unwrap();

        let state = room.state.lock().unwrap();
        assert!(state.is_playing);
        assert_eq!(state.current_time, 42.0);
    }

    #[test]
    fn playback_started_is_sticky() {
        let room = test_room();
        apply_command(&room, CommandKind::Play, 0.0, 1).unwrap();
        apply_command(&room, CommandKind::Pause, 1.0, 2).unwrap();

        let state = room.state.lock().unwrap();
        assert!(state.playback_started);
        assert!(!state.is_playing);
    }

    #[test]
    fn first_play_transitions_bot_room_to_playing() {
        let room = Room::new(
            "room-1".into(),
            "t".into(),
            "m".into(),
            None,
            None,
            Some(crate::room::DiscordSession {
                channel_id: "c".into(),
                message_id: "m".into(),
                guild_id: "g".into(),
                host_discord_id: "h".into(),
                host_username: None,
            }),
        );

        let applied = apply_command(&room, CommandKind::Play, 0.0, 1).unwrap();
        assert!(applied.status_changed);
        assert_eq!(room.state.lock().unwrap().status, RoomStatus::Playing);

        // Later plays do not re-announce the transition.
        let applied = apply_command(&room, CommandKind::Play, 9.0, 2).unwrap();
        assert!(!applied.status_changed);
    }

    #[test]
    fn ended_rooms_drop_commands() {
        let room = test_room();
        room.state.lock().unwrap().status = RoomStatus::Ended;
        assert!(apply_command(&room, CommandKind::Play, 0.0, 1).is_none());
    }

    #[test]
    fn inbound_wire_format() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"play","currentTime":12.5,"seq":3}"#).unwrap();
        match msg {
            ClientMessage::Play { current_time, seq, .. } => {
                assert_eq!(current_time, 12.5);
                assert_eq!(seq, 3);
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"host-heartbeat","timestamp":17}"#).unwrap();
        assert!(matches!(msg, ClientMessage::HostHeartbeat { .. }));

        // Unknown type values fail to decode (and get dropped by the caller).
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"selfdestruct"}"#).is_err());
    }

    #[test]
    fn outbound_wire_format() {
        let json = serde_json::to_string(&ServerMessage::Sync {
            current_time: 1.5,
            is_playing: true,
            server_time: 1000,
            is_host: None,
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "sync");
        assert_eq!(value["currentTime"], 1.5);
        assert_eq!(value["serverTime"], 1000);
        assert!(value.get("isHost").is_none());

        let json = serde_json::to_string(&ServerMessage::HostChanged {
            new_host_id: "u2".into(),
            new_host_username: "Ana".into(),
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "host-changed");
        assert_eq!(value["newHostId"], "u2");
    }

    #[test]
    fn intervals_follow_play_state() {
        assert_eq!(sync_interval_ms(true), 2_000);
        assert_eq!(sync_interval_ms(false), 5_000);
    }
}
