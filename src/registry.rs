// src/registry.rs
//
// Process-wide room registry.  Owns the only map of rooms, enforces the
// single-active-session rule, and runs the periodic maintenance loops:
// idle-room cleanup and host-inactivity transfer.
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::error::ApiError;
use crate::room::{now_ms, Room, RoomStatus};
use crate::sync::ServerMessage;
use crate::AppState;

// ─── Tunables ───────────────────────────────────────────────────────────────

/// A room with no clients and no state changes for this long is collected.
const IDLE_ROOM_MS: u64 = 10 * 60 * 1000;
/// Grace period after the last client leaves, to tolerate page reloads.
const EMPTY_DEBOUNCE_MS: u64 = 30 * 1000;
/// Host considered inactive after this long without a heartbeat or command.
const HOST_INACTIVE_MS: u64 = 60 * 1000;

// ─── RoomRegistry ───────────────────────────────────────────────────────────

pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a freshly-built room.
    ///
    /// Fails with *conflict* while any non-ended session exists: the server
    /// hosts at most one watch-party at a time.
    pub fn create(&self, room: Room) -> Result<Arc<Room>, ApiError> {
        let mut rooms = self.rooms.write().unwrap();

        let active = rooms
            .values()
            .any(|r| r.state.lock().unwrap().status != RoomStatus::Ended);
        if active {
            return Err(ApiError::session_active());
        }

        let room = Arc::new(room);
        rooms.insert(room.id.clone(), Arc::clone(&room));
        info!("Room '{}' created ('{}')", room.id, room.movie_name);
        Ok(room)
    }

    pub fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().unwrap().get(room_id).cloned()
    }

    pub fn remove(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.write().unwrap().remove(room_id)
    }

    /// Snapshot of every room, for the maintenance loops.
    pub fn rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.read().unwrap().values().cloned().collect()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Deletion cascade ───────────────────────────────────────────────────────

/// Remove a room and everything it owns: sockets are closed, upload state and
/// temp directories purged, and the published video deleted (only if it lies
/// under the uploads root).
pub async fn delete_room(state: &Arc<AppState>, room_id: &str, close_code: u16) {
    let Some(room) = state.registry.remove(room_id) else {
        return;
    };

    room.close_all(close_code, "session closed");

    let video_path = room.state.lock().unwrap().video_path.clone();
    state.uploads.purge_room(room_id, video_path.as_deref()).await;

    info!("Room '{room_id}' deleted");
}

/// Delayed empty-room check: fired 30 s after the last client leaves.
/// Ended sessions with nobody left are deleted; live sessions wait for the
/// idle GC instead.
pub fn schedule_empty_check(state: Arc<AppState>, room_id: String) {
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(EMPTY_DEBOUNCE_MS)).await;

        let Some(room) = state.registry.get(&room_id) else {
            return;
        };
        if room.client_count() > 0 {
            return;
        }
        if room.state.lock().unwrap().status == RoomStatus::Ended {
            delete_room(&state, &room_id, 1000).await;
        }
    });
}

// ─── Idle cleanup loop ──────────────────────────────────────────────────────

/// Every 5 minutes: collect rooms that have been empty past the debounce and
/// idle past the 10-minute threshold.  Also prunes stale rate-limit buckets.
pub fn spawn_cleanup_loop(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        interval.tick().await; // immediate first tick is a no-op
        loop {
            interval.tick().await;
            let now = now_ms();

            for room in state.registry.rooms() {
                if room.client_count() > 0 {
                    continue;
                }
                let empty_long_enough = room
                    .empty_since
                    .lock()
                    .unwrap()
                    .map(|t| now.saturating_sub(t) >= EMPTY_DEBOUNCE_MS)
                    .unwrap_or(false);
                let idle = {
                    let s = room.state.lock().unwrap();
                    now.saturating_sub(s.last_update) > IDLE_ROOM_MS
                };
                if empty_long_enough && idle {
                    warn!("Room '{}' idle with no clients — collecting", room.id);
                    delete_room(&state, &room.id, 1000).await;
                }
            }

            state.limiter.sweep();
        }
    })
}

// ─── Host-inactivity transfer ───────────────────────────────────────────────

/// Pick the connected non-host member that joined earliest and promote it.
///
/// Returns `(external_id, display_name)` of the new host, or `None` when no
/// eligible member exists.
pub fn transfer_host(room: &Room) -> Option<(String, String)> {
    let mut members = room.members.write().unwrap();

    let new_host_token = members
        .iter()
        .filter(|(_, m)| m.connected && !m.is_host)
        .min_by_key(|(_, m)| m.connected_at)
        .map(|(t, _)| t.clone())?;

    for member in members.values_mut() {
        member.is_host = false;
    }
    let new_host = members.get_mut(&new_host_token).unwrap();
    new_host.is_host = true;
    let result = (new_host.external_id.clone(), new_host.display_name.clone());
    drop(members);

    room.state.lock().unwrap().host_last_heartbeat = now_ms();
    Some(result)
}

/// Every 15 s: transfer the host role away from a host that stopped
/// heartbeating, unless an upload is in flight or nobody else is connected.
pub fn spawn_host_check_loop(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(15));
        loop {
            interval.tick().await;
            let now = now_ms();

            for room in state.registry.rooms() {
                if room.client_count() == 0 {
                    continue;
                }

                let inactive = {
                    let s = room.state.lock().unwrap();
                    s.status != RoomStatus::Ended
                        && !s.is_uploading
                        && now.saturating_sub(s.host_last_heartbeat) > HOST_INACTIVE_MS
                };
                if !inactive {
                    continue;
                }

                if let Some((new_host_id, new_host_username)) = transfer_host(&room) {
                    info!(
                        "Room '{}': host inactive, transferred to '{}'",
                        room.id, new_host_username
                    );
                    room.broadcast(&ServerMessage::HostChanged {
                        new_host_id,
                        new_host_username,
                    });
                }
            }
        }
    })
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::Member;

    fn test_room(id: &str) -> Room {
        Room::new(id.into(), "t".into(), "m".into(), None, None, None)
    }

    fn member(ext: &str, is_host: bool, connected: bool, connected_at: u64) -> Member {
        Member {
            external_id: ext.into(),
            display_name: ext.to_uppercase(),
            is_host,
            connected,
            connected_at,
            last_ping_ms: None,
        }
    }

    #[test]
    fn second_room_conflicts() {
        let registry = RoomRegistry::new();
        registry.create(test_room("a")).unwrap();
        assert!(registry.create(test_room("b")).is_err());
    }

    #[test]
    fn ended_room_frees_the_slot() {
        let registry = RoomRegistry::new();
        let room = registry.create(test_room("a")).unwrap();
        room.state.lock().unwrap().status = RoomStatus::Ended;
        assert!(registry.create(test_room("b")).is_ok());
        assert_eq!(registry.rooms().len(), 2);
    }

    #[test]
    fn transfer_picks_oldest_connected_non_host() {
        let room = test_room("a");
        {
            let mut members = room.members.write().unwrap();
            members.insert("th".into(), member("host", true, true, 100));
            members.insert("ta".into(), member("ana", false, true, 200));
            members.insert("tb".into(), member("bob", false, true, 300));
            members.insert("tc".into(), member("cid", false, false, 50));
        }

        let (new_host_id, _) = transfer_host(&room).unwrap();
        assert_eq!(new_host_id, "ana");

        let members = room.members.read().unwrap();
        let hosts: Vec<_> = members.values().filter(|m| m.is_host).collect();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].external_id, "ana");
    }

    #[test]
    fn transfer_needs_an_eligible_member() {
        let room = test_room("a");
        room.members
            .write()
            .unwrap()
            .insert("th".into(), member("host", true, true, 100));
        assert!(transfer_host(&room).is_none());
    }
}
