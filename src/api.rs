use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::error::ApiError;
use crate::room::{DiscordSession, Rating, Room, RoomStatus, SessionStatus};
use crate::sync::ServerMessage;
use crate::AppState;

// ---------------------------------------------------------------------------
// Request / Response DTOs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDiscordSessionRequest {
    pub title: String,
    pub movie_name: String,
    #[serde(default)]
    pub movie_info: Option<serde_json::Value>,
    #[serde(default)]
    pub selected_episode: Option<String>,
    pub discord_session: DiscordSession,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDiscordSessionResponse {
    pub room_id: String,
    pub host_token: String,
    pub url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
    pub title: String,
    pub movie_name: String,
    #[serde(default)]
    pub movie_info: Option<serde_json::Value>,
    pub host_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomResponse {
    pub room_id: String,
    pub url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTokenRequest {
    pub discord_id: String,
    pub username: String,
}

#[derive(Serialize)]
pub struct SessionTokenResponse {
    pub token: String,
    pub url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateTokenResponse {
    pub discord_id: String,
    pub username: String,
    pub is_host: bool,
}

#[derive(Deserialize)]
pub struct TokenBody {
    pub token: String,
}

#[derive(Serialize)]
pub struct EndSessionResponse {
    pub success: bool,
    pub status: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeSessionResponse {
    pub success: bool,
    pub ratings: Vec<Rating>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average: Option<f64>,
    pub discord_session: DiscordSession,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn invite_url(state: &AppState, room_id: &str, token: Option<&str>) -> String {
    match token {
        Some(token) => format!("{}/?room={room_id}&token={token}", state.config.public_url),
        None => format!("{}/?room={room_id}", state.config.public_url),
    }
}

fn discord_room(state: &AppState, room_id: &str) -> Result<Arc<Room>, ApiError> {
    state
        .registry
        .get(room_id)
        .filter(|r| r.discord.is_some())
        .ok_or_else(|| ApiError::room_not_found(room_id))
}

fn require_host_token(room: &Room, token: &str) -> Result<(), ApiError> {
    if crate::token::validate_token(room, token).is_none() {
        return Err(ApiError::token_invalid());
    }
    if !crate::token::is_host_token(room, token) {
        return Err(ApiError::not_host());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// POST /api/discord-session — bot creates a session
// ---------------------------------------------------------------------------

pub async fn create_discord_session(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateDiscordSessionRequest>,
) -> Result<Json<CreateDiscordSessionResponse>, ApiError> {
    if body.title.trim().is_empty() || body.movie_name.trim().is_empty() {
        return Err(ApiError::validation("title and movieName are required"));
    }

    let room_id = uuid::Uuid::new_v4().to_string();
    let host_discord_id = body.discord_session.host_discord_id.clone();
    let host_username = body
        .discord_session
        .host_username
        .clone()
        .unwrap_or_else(|| "Host".to_string());

    let room = state.registry.create(Room::new(
        room_id.clone(),
        body.title,
        body.movie_name,
        body.movie_info,
        body.selected_episode,
        Some(body.discord_session),
    ))?;

    let host_token = crate::token::issue_member_token(
        &room,
        &host_discord_id,
        &host_username,
        true,
        state.config.max_clients,
    )
    .map_err(|_| ApiError::internal("Failed to issue host token"))?;

    match &room.selected_episode {
        Some(episode) => info!(
            "Discord session created: room '{room_id}' — '{}' ({episode}) hosted by '{host_username}'",
            room.title
        ),
        None => info!(
            "Discord session created: room '{room_id}' — '{}' hosted by '{host_username}'",
            room.title
        ),
    }

    let url = invite_url(&state, &room_id, Some(&host_token));
    Ok(Json(CreateDiscordSessionResponse {
        room_id,
        host_token,
        url,
    }))
}

// ---------------------------------------------------------------------------
// POST /api/rooms — plain (bot-less) room creation
// ---------------------------------------------------------------------------

pub async fn create_room(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateRoomRequest>,
) -> Result<Json<CreateRoomResponse>, ApiError> {
    if body.title.trim().is_empty() || body.movie_name.trim().is_empty() {
        return Err(ApiError::validation("title and movieName are required"));
    }
    if body.host_id.trim().is_empty() {
        return Err(ApiError::validation("hostId is required"));
    }

    let room_id = uuid::Uuid::new_v4().to_string();
    let room = state.registry.create(Room::new(
        room_id.clone(),
        body.title,
        body.movie_name,
        body.movie_info,
        None,
        None,
    ))?;
    room.state.lock().unwrap().host_id = Some(body.host_id);

    let url = invite_url(&state, &room_id, None);
    Ok(Json(CreateRoomResponse { room_id, url }))
}

// ---------------------------------------------------------------------------
// POST /api/session-token/:room_id — mint a viewer token
// ---------------------------------------------------------------------------

pub async fn create_session_token(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    Json(body): Json<SessionTokenRequest>,
) -> Result<Json<SessionTokenResponse>, ApiError> {
    let room = discord_room(&state, &room_id)?;

    let token = crate::token::issue_member_token(
        &room,
        &body.discord_id,
        &body.username,
        false,
        state.config.max_clients,
    )
    .map_err(|_| ApiError::internal("Session is at member capacity"))?;

    let url = invite_url(&state, &room_id, Some(&token));
    Ok(Json(SessionTokenResponse { token, url }))
}

// ---------------------------------------------------------------------------
// GET /api/validate-token/:room_id?token=
// ---------------------------------------------------------------------------

pub async fn validate_token(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<ValidateTokenResponse>, ApiError> {
    let room = discord_room(&state, &room_id)?;

    let token = query
        .get("token")
        .ok_or_else(|| ApiError::validation("missing token parameter"))?;
    let member =
        crate::token::validate_token(&room, token).ok_or_else(ApiError::token_invalid)?;

    Ok(Json(ValidateTokenResponse {
        discord_id: member.external_id,
        username: member.display_name,
        is_host: member.is_host,
    }))
}

// ---------------------------------------------------------------------------
// GET /api/session-status/:room_id — projection for polling clients
// ---------------------------------------------------------------------------

pub async fn session_status(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
) -> Result<Json<SessionStatus>, ApiError> {
    let room = state
        .registry
        .get(&room_id)
        .ok_or_else(|| ApiError::room_not_found(&room_id))?;
    Ok(Json(room.session_status()))
}

// ---------------------------------------------------------------------------
// POST /api/discord-end-session/:room_id — host closes playback
// ---------------------------------------------------------------------------

pub async fn end_session(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    Json(body): Json<TokenBody>,
) -> Result<Json<EndSessionResponse>, ApiError> {
    let room = discord_room(&state, &room_id)?;
    require_host_token(&room, &body.token)?;

    {
        let mut room_state = room.state.lock().unwrap();
        if room_state.status == RoomStatus::Ended {
            return Err(ApiError::session_ended(&room_id));
        }
        room_state.status = RoomStatus::Ended;
        room_state.is_playing = false;
    }

    info!("Room '{room_id}': session ending, collecting ratings");
    room.broadcast(&ServerMessage::SessionEnding);
    room.broadcast(&ServerMessage::SessionStatus {
        session: room.session_status(),
    });

    Ok(Json(EndSessionResponse {
        success: true,
        status: "ending",
    }))
}

// ---------------------------------------------------------------------------
// POST /api/discord-finalize-session/:room_id — host collects the verdict
// ---------------------------------------------------------------------------

pub async fn finalize_session(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    Json(body): Json<TokenBody>,
) -> Result<Json<FinalizeSessionResponse>, ApiError> {
    let room = discord_room(&state, &room_id)?;
    require_host_token(&room, &body.token)?;

    let (ratings, average, _) = room.ratings_summary();
    let Some(discord_session) = room.discord.clone() else {
        return Err(ApiError::room_not_found(&room_id));
    };

    room.broadcast(&ServerMessage::SessionEnded);
    crate::registry::delete_room(&state, &room_id, 1000).await;

    info!("Room '{room_id}': session finalized ({} ratings)", ratings.len());
    Ok(Json(FinalizeSessionResponse {
        success: true,
        ratings,
        average,
        discord_session,
    }))
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let rooms = state.registry.rooms();
    let viewers: usize = rooms.iter().map(|r| r.client_count()).sum();

    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "time": chrono::Utc::now(),
        "rooms_active": rooms.len(),
        "viewers_connected": viewers,
    }))
}
