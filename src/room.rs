use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::sync::ServerMessage;

// ---------------------------------------------------------------------------
// Clock helper
// ---------------------------------------------------------------------------

/// Milliseconds since the unix epoch.  All sync reference points and
/// `serverTime` fields in outbound frames use this clock.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// RoomStatus
// ---------------------------------------------------------------------------

/// Lifecycle of a session: `waiting → playing → ended`.  Terminal; never
/// regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Waiting,
    Playing,
    Ended,
}

// ---------------------------------------------------------------------------
// Member — one entry per issued token
// ---------------------------------------------------------------------------

/// A member known to the room, keyed by its opaque token.
///
/// Members are never removed once created (re-join is allowed); `connected`
/// flips with the presence of a live socket carrying the token.
#[derive(Debug, Clone, Serialize)]
pub struct Member {
    pub external_id: String,
    pub display_name: String,
    pub is_host: bool,
    pub connected: bool,
    /// Unix ms of the first successful socket attach.
    pub connected_at: u64,
    /// Last round-trip latency reported by the client, in ms.
    pub last_ping_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Rating
// ---------------------------------------------------------------------------

/// One end-of-session rating.  At most one per `discord_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rating {
    pub discord_id: String,
    pub username: String,
    pub rating: u8,
}

// ---------------------------------------------------------------------------
// Subtitle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subtitle {
    pub filename: String,
    pub display_name: String,
}

// ---------------------------------------------------------------------------
// DiscordSession — binding to the chat-bot that created the room
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscordSession {
    pub channel_id: String,
    pub message_id: String,
    pub guild_id: String,
    pub host_discord_id: String,
    #[serde(default)]
    pub host_username: Option<String>,
}

// ---------------------------------------------------------------------------
// RoomState — the playback and pipeline state behind the room mutex
// ---------------------------------------------------------------------------

/// Mutable per-room state.  One mutex guards the whole struct; every command,
/// sync tick and progress update takes it for the duration of the mutation.
#[derive(Debug)]
pub struct RoomState {
    pub status: RoomStatus,

    /// Path of the playable file; `None` until post-processing publishes it.
    pub video_path: Option<std::path::PathBuf>,

    /// Reference playhead in seconds at `last_update`.
    pub current_time: f64,
    /// Unix ms at which `current_time` was captured.
    pub last_update: u64,
    pub is_playing: bool,
    /// Sticky: set on the first accepted `play`, never cleared.
    pub playback_started: bool,

    pub is_uploading: bool,
    /// 0–100; capped at 99 until `complete` flips it to 100.
    pub upload_progress: u8,

    pub is_processing: bool,
    pub processing_message: String,

    /// Host identifier for rooms created without a bot binding.
    pub host_id: Option<String>,
    /// Unix ms of the last host command or heartbeat.
    pub host_last_heartbeat: u64,
    /// Monotonic sequence of the last applied host command.
    pub last_command_seq: u64,

    pub subtitles: Vec<Subtitle>,

    /// Unix ms of the last periodic sync frame sent to this room.
    pub last_sync_sent: u64,
}

impl RoomState {
    fn new() -> Self {
        let now = now_ms();
        Self {
            status: RoomStatus::Waiting,
            video_path: None,
            current_time: 0.0,
            last_update: now,
            is_playing: false,
            playback_started: false,
            is_uploading: false,
            upload_progress: 0,
            is_processing: false,
            processing_message: String::new(),
            host_id: None,
            host_last_heartbeat: now,
            last_command_seq: 0,
            subtitles: Vec::new(),
            last_sync_sent: 0,
        }
    }

    /// Effective server playhead at `now`, in seconds.
    pub fn playhead(&self, now: u64) -> f64 {
        if self.is_playing {
            self.current_time + (now.saturating_sub(self.last_update)) as f64 / 1000.0
        } else {
            self.current_time
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound — what a socket's writer task consumes
// ---------------------------------------------------------------------------

/// Frames queued to a client's writer task.  Kept transport-agnostic so the
/// room does not depend on the WebSocket types.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A serialized JSON message.
    Text(String),
    /// Protocol-level ping for the heartbeat sweep.
    Ping,
    /// Close the socket with the given code and reason.
    Close(u16, &'static str),
}

// ---------------------------------------------------------------------------
// ClientHandle — one live WebSocket
// ---------------------------------------------------------------------------

/// A connected socket.  Identity is the numeric key in the room's client map;
/// closing a socket unlinks it without touching the member record.
pub struct ClientHandle {
    pub client_id: String,
    pub token: Option<String>,
    pub external_id: Option<String>,
    pub username: Option<String>,
    pub sender: mpsc::UnboundedSender<Outbound>,
    pub connected_at: u64,
    pub last_ping_ms: AtomicU64,
    /// Set when a heartbeat ping goes out; cleared by the pong.  A socket
    /// still flagged on the next sweep is terminated.
    pub awaiting_pong: AtomicBool,
}

// ---------------------------------------------------------------------------
// Room
// ---------------------------------------------------------------------------

/// A single watch-party session: its video, members, ratings and sync state.
pub struct Room {
    pub id: String,
    pub title: String,
    pub movie_name: String,
    pub movie_info: Option<serde_json::Value>,
    pub selected_episode: Option<String>,
    pub discord: Option<DiscordSession>,

    pub state: Mutex<RoomState>,
    /// Opaque token → member.
    pub members: RwLock<HashMap<String, Member>>,
    pub ratings: Mutex<Vec<Rating>>,
    pub clients: RwLock<HashMap<u64, ClientHandle>>,

    next_client_key: AtomicU64,
    /// Unix ms since the room last had zero clients (delete debounce).
    pub empty_since: Mutex<Option<u64>>,
    /// (last broadcast ms, last value) for the upload-progress throttle.
    progress_gate: Mutex<(u64, u8)>,
    /// Set while a viewer-count broadcast is pending (500 ms debounce).
    pub viewers_pending: AtomicBool,
}

impl Room {
    pub fn new(
        id: String,
        title: String,
        movie_name: String,
        movie_info: Option<serde_json::Value>,
        selected_episode: Option<String>,
        discord: Option<DiscordSession>,
    ) -> Self {
        Self {
            id,
            title,
            movie_name,
            movie_info,
            selected_episode,
            discord,
            state: Mutex::new(RoomState::new()),
            members: RwLock::new(HashMap::new()),
            ratings: Mutex::new(Vec::new()),
            clients: RwLock::new(HashMap::new()),
            next_client_key: AtomicU64::new(1),
            empty_since: Mutex::new(Some(now_ms())),
            progress_gate: Mutex::new((0, 0)),
            viewers_pending: AtomicBool::new(false),
        }
    }

    // ── Client set ──────────────────────────────────────────────────────

    /// Register a live socket; returns its map key.
    pub fn add_client(&self, handle: ClientHandle) -> u64 {
        let key = self.next_client_key.fetch_add(1, Ordering::Relaxed);
        let token = handle.token.clone();
        self.clients.write().unwrap().insert(key, handle);
        *self.empty_since.lock().unwrap() = None;

        if let Some(token) = token {
            let mut members = self.members.write().unwrap();
            if let Some(member) = members.get_mut(&token) {
                if !member.connected {
                    member.connected = true;
                    member.connected_at = now_ms();
                }
            }
        }
        key
    }

    /// Unlink a socket.  The member stays; `connected` drops only when no
    /// other live socket carries the same token.
    pub fn remove_client(&self, key: u64) {
        let removed = self.clients.write().unwrap().remove(&key);

        if let Some(handle) = removed {
            if let Some(token) = handle.token {
                let clients = self.clients.read().unwrap();
                let still_connected = clients
                    .values()
                    .any(|c| c.token.as_deref() == Some(token.as_str()));
                drop(clients);
                if !still_connected {
                    let mut members = self.members.write().unwrap();
                    if let Some(member) = members.get_mut(&token) {
                        member.connected = false;
                    }
                }
            }
        }

        if self.clients.read().unwrap().is_empty() {
            *self.empty_since.lock().unwrap() = Some(now_ms());
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().unwrap().len()
    }

    // ── Fan-out ─────────────────────────────────────────────────────────

    /// Serialize once and enqueue to every connected socket.
    pub fn broadcast(&self, msg: &ServerMessage) {
        let text = match serde_json::to_string(msg) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("Failed to serialize broadcast for room '{}': {e}", self.id);
                return;
            }
        };
        let clients = self.clients.read().unwrap();
        for handle in clients.values() {
            let _ = handle.sender.send(Outbound::Text(text.clone()));
        }
    }

    /// Enqueue a message to a single socket.
    pub fn send_to(&self, key: u64, msg: &ServerMessage) {
        let clients = self.clients.read().unwrap();
        if let Some(handle) = clients.get(&key) {
            if let Ok(text) = serde_json::to_string(msg) {
                let _ = handle.sender.send(Outbound::Text(text));
            }
        }
    }

    /// Close every socket with the given code, then clear the client set.
    pub fn close_all(&self, code: u16, reason: &'static str) {
        let mut clients = self.clients.write().unwrap();
        for handle in clients.values() {
            let _ = handle.sender.send(Outbound::Close(code, reason));
        }
        clients.clear();
    }

    // ── Progress throttle ───────────────────────────────────────────────

    /// Returns `true` when an upload-progress broadcast of `value` should go
    /// out now: the value changed and the 250 ms window elapsed (or the
    /// value is terminal).
    pub fn progress_should_broadcast(&self, value: u8, now: u64) -> bool {
        let mut gate = self.progress_gate.lock().unwrap();
        let (last_ms, last_value) = *gate;
        if value == last_value {
            return false;
        }
        if value < 100 && now.saturating_sub(last_ms) < 250 {
            return false;
        }
        *gate = (now, value);
        true
    }

    // ── Ratings ─────────────────────────────────────────────────────────

    /// Snapshot of ratings, their average (1 decimal), and whether every
    /// currently-connected member has rated.
    pub fn ratings_summary(&self) -> (Vec<Rating>, Option<f64>, bool) {
        let ratings = self.ratings.lock().unwrap().clone();
        let average = if ratings.is_empty() {
            None
        } else {
            let mean: f64 =
                ratings.iter().map(|r| r.rating as f64).sum::<f64>() / ratings.len() as f64;
            Some((mean * 10.0).round() / 10.0)
        };

        let members = self.members.read().unwrap();
        let connected: Vec<&Member> = members.values().filter(|m| m.connected).collect();
        let all_rated = !connected.is_empty()
            && connected.iter().all(|m| {
                ratings.iter().any(|r| r.discord_id == m.external_id)
            });

        (ratings, average, all_rated)
    }

    // ── Viewers ─────────────────────────────────────────────────────────

    /// Current viewer list for the `viewers` broadcast and the projection.
    pub fn viewer_list(&self) -> Vec<ViewerInfo> {
        let clients = self.clients.read().unwrap();
        clients
            .values()
            .map(|c| ViewerInfo {
                external_id: c
                    .external_id
                    .clone()
                    .unwrap_or_else(|| c.client_id.clone()),
                username: c.username.clone().unwrap_or_else(|| "viewer".into()),
                ping: {
                    let ms = c.last_ping_ms.load(Ordering::Relaxed);
                    (ms > 0).then_some(ms)
                },
            })
            .collect()
    }

    // ── Projection ──────────────────────────────────────────────────────

    /// Single read-model of the room for polling clients and the bot.
    pub fn session_status(&self) -> SessionStatus {
        let status = self.state.lock().unwrap().status;
        let viewers = self.viewer_list();
        let (ratings, average, all_rated) = self.ratings_summary();
        SessionStatus {
            status,
            viewer_count: viewers.len(),
            viewers,
            ratings,
            average,
            all_rated,
            movie_info: self.movie_info.clone(),
            movie_name: self.movie_name.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Serialisable snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerInfo {
    pub external_id: String,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping: Option<u64>,
}

/// Read-model returned by the status endpoint and `session-status` frames.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub status: RoomStatus,
    pub viewer_count: usize,
    pub viewers: Vec<ViewerInfo>,
    pub ratings: Vec<Rating>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average: Option<f64>,
    pub all_rated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub movie_info: Option<serde_json::Value>,
    pub movie_name: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_room() -> Room {
        Room::new(
            "room-1".into(),
            "Movie night".into(),
            "Big Buck Bunny".into(),
            None,
            None,
            None,
        )
    }

    fn attach_client(room: &Room, client_id: &str, token: Option<&str>) -> u64 {
        let (tx, _rx) = mpsc::unbounded_channel();
        room.add_client(ClientHandle {
            client_id: client_id.into(),
            token: token.map(String::from),
            external_id: token.map(|t| format!("ext-{t}")),
            username: Some(client_id.into()),
            sender: tx,
            connected_at: now_ms(),
            last_ping_ms: AtomicU64::new(0),
            awaiting_pong: AtomicBool::new(false),
        })
    }

    #[test]
    fn playhead_advances_only_while_playing() {
        let mut state = RoomState::new();
        state.current_time = 10.0;
        state.last_update = 1_000;
        state.is_playing = true;
        assert!((state.playhead(4_000) - 13.0).abs() < 1e-9);

        state.is_playing = false;
        assert!((state.playhead(4_000) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn playhead_is_monotonic_in_now() {
        let mut state = RoomState::new();
        state.current_time = 5.0;
        state.last_update = 0;
        state.is_playing = true;
        let mut prev = f64::MIN;
        for now in (0..10_000).step_by(500) {
            let p = state.playhead(now);
            assert!(p >= prev);
            prev = p;
        }
    }

    #[test]
    fn member_connected_flag_follows_sockets() {
        let room = test_room();
        room.members.write().unwrap().insert(
            "tok".into(),
            Member {
                external_id: "u1".into(),
                display_name: "User".into(),
                is_host: true,
                connected: false,
                connected_at: 0,
                last_ping_ms: None,
            },
        );

        let a = attach_client(&room, "c1", Some("tok"));
        let b = attach_client(&room, "c2", Some("tok"));
        assert!(room.members.read().unwrap()["tok"].connected);

        room.remove_client(a);
        // Second socket still carries the token.
        assert!(room.members.read().unwrap()["tok"].connected);

        room.remove_client(b);
        assert!(!room.members.read().unwrap()["tok"].connected);
        assert!(room.empty_since.lock().unwrap().is_some());
    }

    #[test]
    fn progress_throttle_requires_change_and_window() {
        let room = test_room();
        assert!(room.progress_should_broadcast(10, 1_000));
        // Same value: never rebroadcast.
        assert!(!room.progress_should_broadcast(10, 2_000));
        // Changed but inside the 250 ms window.
        assert!(!room.progress_should_broadcast(11, 1_100));
        // Changed and window elapsed.
        assert!(room.progress_should_broadcast(11, 1_300));
        // The terminal 100 bypasses the window.
        assert!(room.progress_should_broadcast(100, 1_301));
    }

    #[test]
    fn ratings_average_rounds_to_one_decimal() {
        let room = test_room();
        for (id, value) in [("a", 7), ("b", 8), ("c", 9), ("d", 10)] {
            room.ratings.lock().unwrap().push(Rating {
                discord_id: id.into(),
                username: id.into(),
                rating: value,
            });
        }
        let (ratings, average, _) = room.ratings_summary();
        assert_eq!(ratings.len(), 4);
        assert_eq!(average, Some(8.5));
    }

    #[test]
    fn all_rated_requires_every_connected_member() {
        let room = test_room();
        for (token, ext) in [("t1", "u1"), ("t2", "u2")] {
            room.members.write().unwrap().insert(
                token.into(),
                Member {
                    external_id: ext.into(),
                    display_name: ext.into(),
                    is_host: token == "t1",
                    connected: true,
                    connected_at: 0,
                    last_ping_ms: None,
                },
            );
        }

        room.ratings.lock().unwrap().push(Rating {
            discord_id: "u1".into(),
            username: "u1".into(),
            rating: 8,
        });
        let (_, _, all_rated) = room.ratings_summary();
        assert!(!all_rated);

        room.ratings.lock().unwrap().push(Rating {
            discord_id: "u2".into(),
            username: "u2".into(),
            rating: 6,
        });
        let (_, average, all_rated) = room.ratings_summary();
        assert!(all_rated);
        assert_eq!(average, Some(7.0));
    }

    #[test]
    fn projection_reflects_room() {
        let room = test_room();
        attach_client(&room, "c1", None);
        let status = room.session_status();
        assert_eq!(status.status, RoomStatus::Waiting);
        assert_eq!(status.viewer_count, 1);
        assert_eq!(status.movie_name, "Big Buck Bunny");
        assert!(!status.all_rated);
    }
}
