// src/streaming.rs
//
// Byte-range video delivery and subtitle download.
//
// Range responses are capped at 4 MiB per request; the player keeps asking
// for the next window as it buffers.  Dropping the response drops the file
// reader, so a client abort costs nothing.
//
// ────────────────────────────────────────────────────────────────────────────

use axum::body::Body;
use axum::extract::{Path as AxumPath, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::warn;

use crate::error::ApiError;
use crate::upload::sanitize_filename;
use crate::AppState;

/// Largest slice served per range request.
const RANGE_CHUNK_BYTES: u64 = 4 * 1024 * 1024;

// ─── Range parsing ──────────────────────────────────────────────────────────

/// Parse a `bytes=<start>-<end?>` header value.  Suffix ranges and multipart
/// ranges are not used by the player and are treated as absent.
pub fn parse_range(value: &str) -> Option<(u64, Option<u64>)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start = start.trim().parse::<u64>().ok()?;
    let end = match end.trim() {
        "" => None,
        e => Some(e.parse::<u64>().ok()?),
    };
    Some((start, end))
}

/// Clamp a requested range into the served window `(start, end)` inclusive.
/// Returns `None` when the start lies past the end of the file.
pub fn range_window(start: u64, requested_end: Option<u64>, file_size: u64) -> Option<(u64, u64)> {
    if file_size == 0 || start >= file_size {
        return None;
    }
    let hard_end = file_size - 1;
    let capped = start + RANGE_CHUNK_BYTES - 1;
    let end = requested_end.unwrap_or(hard_end).min(capped).min(hard_end);
    Some((start, end))
}

/// Content type inferred from the file extension.
pub fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("mkv") => "video/x-matroska",
        Some("webm") => "video/webm",
        Some("avi") => "video/x-msvideo",
        Some("mov") => "video/quicktime",
        _ => "application/octet-stream",
    }
}

// ─── Video endpoint ─────────────────────────────────────────────────────────

/// GET /video/:room_id
pub async fn stream_video(
    State(state): State<Arc<AppState>>,
    AxumPath(room_id): AxumPath<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let room = state
        .registry
        .get(&room_id)
        .ok_or_else(|| ApiError::room_not_found(&room_id))?;

    let video_path = room
        .state
        .lock()
        .unwrap()
        .video_path
        .clone()
        .ok_or_else(|| ApiError::not_found("No video published for this room."))?;

    let mut file = tokio::fs::File::open(&video_path).await.map_err(|e| {
        warn!("Video file missing for room '{room_id}': {e}");
        ApiError::not_found("Video file not found.")
    })?;
    let file_size = file
        .metadata()
        .await
        .map_err(|_| ApiError::internal("Failed to stat video file"))?
        .len();

    let content_type = content_type_for(&video_path);
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range);

    match range {
        Some((start, requested_end)) => {
            let Some((start, end)) = range_window(start, requested_end, file_size) else {
                return Ok((
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    [(header::CONTENT_RANGE, format!("bytes */{file_size}"))],
                )
                    .into_response());
            };
            let length = end - start + 1;

            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|_| ApiError::internal("Failed to seek video file"))?;
            let stream = ReaderStream::new(file.take(length));

            Ok(Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::ACCEPT_RANGES, "bytes")
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {start}-{end}/{file_size}"),
                )
                .header(header::CONTENT_LENGTH, length)
                .header(header::CACHE_CONTROL, "no-cache")
                .body(Body::from_stream(stream))
                .map_err(|_| ApiError::internal("Failed to build range response"))?)
        }
        None => {
            let stream = ReaderStream::new(file);
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::ACCEPT_RANGES, "bytes")
                .header(header::CONTENT_LENGTH, file_size)
                .header(header::CACHE_CONTROL, "no-cache")
                .body(Body::from_stream(stream))
                .map_err(|_| ApiError::internal("Failed to build response"))?)
        }
    }
}

// ─── Subtitle download ──────────────────────────────────────────────────────

/// Decode subtitle bytes to UTF-8 text.
///
/// Strips a UTF-8 BOM when present.  Files that are not valid UTF-8 are
/// re-decoded as Windows-1252 — the most common legacy encoding for SRT
/// files in the wild.
pub fn decode_subtitle(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xef\xbb\xbf").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => {
            let (text, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            text.into_owned()
        }
    }
}

/// GET /api/upload/subtitle/:room_id/:filename
pub async fn download_subtitle(
    State(state): State<Arc<AppState>>,
    AxumPath((room_id, filename)): AxumPath<(String, String)>,
) -> Result<Response, ApiError> {
    state
        .registry
        .get(&room_id)
        .ok_or_else(|| ApiError::room_not_found(&room_id))?;

    // A name that sanitization would alter is trying to escape the
    // subtitles directory.
    if sanitize_filename(&filename) != filename {
        return Err(ApiError::validation("invalid subtitle filename"));
    }

    let path = state.uploads.subtitles_dir(&room_id).join(&filename);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError::not_found("Subtitle file not found."))?;

    let text = decode_subtitle(&bytes);
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        text,
    )
        .into_response())
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_parses() {
        assert_eq!(parse_range("bytes=0-"), Some((0, None)));
        assert_eq!(parse_range("bytes=100-200"), Some((100, Some(200))));
        assert_eq!(parse_range("bytes=9000000-"), Some((9_000_000, None)));
        assert_eq!(parse_range("chars=0-"), None);
        assert_eq!(parse_range("bytes=a-b"), None);
    }

    #[test]
    fn open_range_is_capped_at_four_mebibytes() {
        let size = 10 * 1024 * 1024;
        let (start, end) = range_window(0, None, size).unwrap();
        assert_eq!(start, 0);
        assert_eq!(end, 4 * 1024 * 1024 - 1);
        assert_eq!(end - start + 1, 4 * 1024 * 1024);
    }

    #[test]
    fn tail_range_reaches_end_of_file() {
        let size = 10 * 1024 * 1024; // 10485760
        let (start, end) = range_window(9_000_000, None, size).unwrap();
        assert_eq!(start, 9_000_000);
        assert_eq!(end, 10_485_759);
    }

    #[test]
    fn explicit_end_is_honored_within_the_cap() {
        let (start, end) = range_window(0, Some(1023), 10_000_000).unwrap();
        assert_eq!((start, end), (0, 1023));
    }

    #[test]
    fn start_past_eof_is_unsatisfiable() {
        assert_eq!(range_window(100, None, 100), None);
        assert_eq!(range_window(0, None, 0), None);
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type_for(Path::new("a.mp4")), "video/mp4");
        assert_eq!(content_type_for(Path::new("a.MKV")), "video/x-matroska");
        assert_eq!(content_type_for(Path::new("a.webm")), "video/webm");
        assert_eq!(content_type_for(Path::new("a")), "application/octet-stream");
    }

    #[test]
    fn utf8_subtitles_pass_through() {
        let text = "1\n00:00:01,000 --> 00:00:02,000\nOlá, mundo\n";
        assert_eq!(decode_subtitle(text.as_bytes()), text);
    }

    #[test]
    fn utf8_bom_is_stripped() {
        let mut bytes = b"\xef\xbb\xbf".to_vec();
        bytes.extend_from_slice("hello".as_bytes());
        assert_eq!(decode_subtitle(&bytes), "hello");
    }

    #[test]
    fn latin1_falls_back_to_windows_1252() {
        // "café" in Windows-1252: é = 0xE9, invalid as UTF-8.
        let bytes = b"caf\xe9";
        assert_eq!(decode_subtitle(bytes), "café");
    }
}
