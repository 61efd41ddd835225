use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;

use crate::room::{now_ms, Member, Room};

// ---------------------------------------------------------------------------
// Opaque session tokens
// ---------------------------------------------------------------------------

/// Generate an opaque member token: 32 bytes of cryptographic randomness,
/// URL-safe base64 without padding (43 characters).
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

/// Issue a token for `external_id`, creating the member if needed.
///
/// Idempotent per external id: a second call returns the existing token
/// unchanged.  Fails when the room is already at its member capacity.
pub fn issue_member_token(
    room: &Room,
    external_id: &str,
    display_name: &str,
    is_host: bool,
    max_members: usize,
) -> Result<String, MembershipFull> {
    let mut members = room.members.write().unwrap();

    if let Some((token, _)) = members
        .iter()
        .find(|(_, m)| m.external_id == external_id)
    {
        return Ok(token.clone());
    }

    if members.len() >= max_members {
        return Err(MembershipFull);
    }

    let token = generate_token();
    members.insert(
        token.clone(),
        Member {
            external_id: external_id.to_string(),
            display_name: display_name.to_string(),
            is_host,
            connected: false,
            connected_at: now_ms(),
            last_ping_ms: None,
        },
    );
    Ok(token)
}

/// The room has reached its member capacity.
#[derive(Debug)]
pub struct MembershipFull;

/// Look up the member behind a token.
pub fn validate_token(room: &Room, token: &str) -> Option<Member> {
    room.members.read().unwrap().get(token).cloned()
}

/// Returns `true` when the token belongs to the room's current host.
pub fn is_host_token(room: &Room, token: &str) -> bool {
    room.members
        .read()
        .unwrap()
        .get(token)
        .map(|m| m.is_host)
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_room() -> Room {
        Room::new("room-1".into(), "t".into(), "m".into(), None, None, None)
    }

    #[test]
    fn token_is_url_safe_and_long_enough() {
        let token = generate_token();
        // 32 bytes → 43 base64 characters, no padding.
        assert_eq!(token.len(), 43);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn tokens_are_unique() {
        assert_ne!(generate_token(), generate_token());
    }

    #[test]
    fn issue_is_idempotent_per_external_id() {
        let room = test_room();
        let a = issue_member_token(&room, "u1", "User One", true, 10).unwrap();
        let b = issue_member_token(&room, "u1", "User One", true, 10).unwrap();
        assert_eq!(a, b);
        assert_eq!(room.members.read().unwrap().len(), 1);
    }

    #[test]
    fn capacity_is_enforced() {
        let room = test_room();
        for i in 0..10 {
            issue_member_token(&room, &format!("u{i}"), "User", i == 0, 10).unwrap();
        }
        assert!(issue_member_token(&room, "u10", "User", false, 10).is_err());
        // Existing members still resolve after the room fills up.
        assert!(issue_member_token(&room, "u3", "User", false, 10).is_ok());
    }

    #[test]
    fn validate_and_host_check() {
        let room = test_room();
        let host = issue_member_token(&room, "h", "Host", true, 10).unwrap();
        let viewer = issue_member_token(&room, "v", "Viewer", false, 10).unwrap();

        assert_eq!(validate_token(&room, &host).unwrap().external_id, "h");
        assert!(validate_token(&room, "bogus").is_none());

        assert!(is_host_token(&room, &host));
        assert!(!is_host_token(&room, &viewer));
        assert!(!is_host_token(&room, "bogus"));
    }
}
