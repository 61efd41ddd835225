// src/rating.rs
//
// End-of-session rating collector.  One rating per member, idempotent upsert
// keyed by the member's external id; the aggregate is broadcast after every
// accepted rating.
//
// ────────────────────────────────────────────────────────────────────────────

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::error::ApiError;
use crate::room::{Rating, Room};
use crate::sync::ServerMessage;
use crate::AppState;

// ─── Upsert ─────────────────────────────────────────────────────────────────

/// Record (or replace) a member's rating.  Returns the updated list.
pub fn upsert_rating(room: &Room, discord_id: &str, username: &str, value: u8) -> Vec<Rating> {
    let mut ratings = room.ratings.lock().unwrap();
    match ratings.iter_mut().find(|r| r.discord_id == discord_id) {
        Some(existing) => {
            existing.rating = value;
            existing.username = username.to_string();
        }
        None => ratings.push(Rating {
            discord_id: discord_id.to_string(),
            username: username.to_string(),
            rating: value,
        }),
    }
    ratings.clone()
}

// ─── Endpoint ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RatingRequest {
    pub token: String,
    pub rating: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingResponse {
    pub success: bool,
    pub all_rated: bool,
    pub ratings: Vec<Rating>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average: Option<f64>,
}

/// POST /api/session-rating/:room_id
pub async fn submit_rating(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    Json(body): Json<RatingRequest>,
) -> Result<Json<RatingResponse>, ApiError> {
    let room = state
        .registry
        .get(&room_id)
        .filter(|r| r.discord.is_some())
        .ok_or_else(|| ApiError::room_not_found(&room_id))?;

    let member = crate::token::validate_token(&room, &body.token)
        .ok_or_else(ApiError::token_invalid)?;

    if !(1..=10).contains(&body.rating) {
        return Err(ApiError::out_of_range("rating"));
    }

    let ratings = upsert_rating(
        &room,
        &member.external_id,
        &member.display_name,
        body.rating as u8,
    );
    info!(
        "Room '{room_id}': rating {} from '{}'",
        body.rating, member.display_name
    );

    room.broadcast(&ServerMessage::RatingReceived {
        ratings: ratings.clone(),
    });

    let (ratings, average, all_rated) = room.ratings_summary();
    if all_rated {
        if let Some(average) = average {
            room.broadcast(&ServerMessage::AllRatingsReceived {
                ratings: ratings.clone(),
                average,
            });
        }
    }

    Ok(Json(RatingResponse {
        success: true,
        all_rated,
        ratings,
        average,
    }))
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_room() -> Room {
        Room::new("room-1".into(), "t".into(), "m".into(), None, None, None)
    }

    #[test]
    fn upsert_replaces_existing_rating() {
        let room = test_room();
        upsert_rating(&room, "u1", "Ana", 6);
        let ratings = upsert_rating(&room, "u1", "Ana", 9);

        assert_eq!(ratings.len(), 1);
        assert_eq!(ratings[0].rating, 9);

        let (_, average, _) = room.ratings_summary();
        assert_eq!(average, Some(9.0));
    }

    #[test]
    fn ratings_accumulate_per_member() {
        let room = test_room();
        upsert_rating(&room, "u1", "Ana", 7);
        upsert_rating(&room, "u2", "Bob", 8);
        upsert_rating(&room, "u3", "Cid", 9);
        let ratings = upsert_rating(&room, "u4", "Dee", 10);

        assert_eq!(ratings.len(), 4);
        let (_, average, _) = room.ratings_summary();
        assert_eq!(average, Some(8.5));
    }
}
