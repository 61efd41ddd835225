// src/upload.rs
//
// Chunked resumable upload engine.
//
// The host uploads a video in parallel chunks; every chunk lands at its own
// offset inside a single preallocated part file, so resuming after a reload
// costs nothing and no chunk is ever written twice.  Metadata lives in memory
// and is checkpointed to `meta.json` at init, abort and complete only.
//
// Layout under the uploads root:
//   <uploadId>/upload.part + <uploadId>/meta.json   while uploading
//   <uploadId>_<safeFilename>                       once completed
//   <roomId>_subtitles/…                            extracted/uploaded subs
//
// ────────────────────────────────────────────────────────────────────────────

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path as FsPath, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::error::ApiError;
use crate::room::{now_ms, Room, RoomStatus};
use crate::sync::ServerMessage;
use crate::AppState;

// ─── Tunables ───────────────────────────────────────────────────────────────

/// Uploads with no activity for this long are garbage collected.
const UPLOAD_TTL_MS: u64 = 30 * 60 * 1000;
/// Pooled file handles idle past this are closed by the sweeper.
const HANDLE_IDLE_MS: u64 = 60 * 1000;
/// Suffix of per-room subtitle directories, exempt from the TTL GC.
const SUBTITLE_DIR_SUFFIX: &str = "_subtitles";

const PART_FILE: &str = "upload.part";
const META_FILE: &str = "meta.json";

// ─── Filename sanitization ──────────────────────────────────────────────────

/// Collapse every character outside `[A-Za-z0-9._-]` to `_`.
///
/// The result can never contain a path separator or a `..` component, so a
/// sanitized name joined onto the uploads root stays inside it.
pub fn sanitize_filename(name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    // "..." style names still reduce to dots; refuse to produce a dot-only name.
    if safe.chars().all(|c| c == '.') {
        "_".into()
    } else {
        safe
    }
}

/// Returns `true` when `path` canonicalizes to a location under `root`.
/// Both must exist; anything that fails to resolve is treated as outside.
pub fn is_under_root(root: &FsPath, path: &FsPath) -> bool {
    match (root.canonicalize(), path.canonicalize()) {
        (Ok(root), Ok(path)) => path.starts_with(&root),
        _ => false,
    }
}

// ─── UploadMeta ─────────────────────────────────────────────────────────────

/// State of one active upload.  Mirrored to disk at init/abort/complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadMeta {
    pub room_id: String,
    pub upload_id: String,
    pub filename: String,
    pub total_chunks: u32,
    pub chunk_size: u64,
    pub total_size: u64,
    pub received_chunks: BTreeSet<u32>,
    pub created_at: u64,
    pub last_activity: u64,
}

impl UploadMeta {
    /// Upload progress as an integer percentage, capped at 99 until
    /// `complete` flips it to 100.
    pub fn progress(&self) -> u8 {
        if self.total_chunks == 0 {
            return 0;
        }
        let pct = (self.received_chunks.len() as u64 * 100) / self.total_chunks as u64;
        pct.min(99) as u8
    }
}

// ─── Pooled file handle ─────────────────────────────────────────────────────

/// One cached writable handle per upload.  Chunks write non-overlapping byte
/// ranges, so positional writes need no per-handle lock.
struct PooledHandle {
    file: std::fs::File,
    last_used: AtomicU64,
    inflight: AtomicUsize,
}

#[cfg(unix)]
fn write_all_at(file: &std::fs::File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &std::fs::File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let written = file.seek_write(buf, offset)?;
        buf = &buf[written..];
        offset += written as u64;
    }
    Ok(())
}

// ─── UploadManager ──────────────────────────────────────────────────────────

pub struct UploadManager {
    root: PathBuf,
    metas: Mutex<HashMap<String, UploadMeta>>,
    active_by_room: Mutex<HashMap<String, String>>,
    handles: Mutex<HashMap<String, Arc<PooledHandle>>>,
}

impl UploadManager {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            metas: Mutex::new(HashMap::new()),
            active_by_room: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn upload_dir(&self, upload_id: &str) -> PathBuf {
        self.root.join(upload_id)
    }

    fn part_path(&self, upload_id: &str) -> PathBuf {
        self.upload_dir(upload_id).join(PART_FILE)
    }

    fn meta_path(&self, upload_id: &str) -> PathBuf {
        self.upload_dir(upload_id).join(META_FILE)
    }

    fn final_path(&self, upload_id: &str, safe_filename: &str) -> PathBuf {
        self.root.join(format!("{upload_id}_{safe_filename}"))
    }

    pub fn subtitles_dir(&self, room_id: &str) -> PathBuf {
        self.root
            .join(format!("{room_id}{SUBTITLE_DIR_SUFFIX}"))
    }

    /// Size of the room's published video, if any (admission estimator).
    pub fn video_size(&self, video_path: Option<&FsPath>) -> Option<u64> {
        let path = video_path?;
        std::fs::metadata(path).ok().map(|m| m.len())
    }

    async fn checkpoint_meta(&self, meta: &UploadMeta) {
        let path = self.meta_path(&meta.upload_id);
        match serde_json::to_vec_pretty(meta) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&path, bytes).await {
                    warn!("Failed to checkpoint meta for '{}': {e}", meta.upload_id);
                }
            }
            Err(e) => warn!("Failed to serialize meta for '{}': {e}", meta.upload_id),
        }
    }

    // ── init ────────────────────────────────────────────────────────────

    /// Start a new upload for the room, purging any previous one.
    ///
    /// Creates `<root>/<uploadId>/`, preallocates the part file to its final
    /// size (sparse truncate) and checkpoints the metadata.
    pub async fn init(
        &self,
        room: &Room,
        filename: &str,
        total_chunks: u32,
        chunk_size: u64,
        total_size: u64,
    ) -> Result<(String, String), ApiError> {
        if total_chunks == 0 {
            return Err(ApiError::validation("totalChunks must be positive"));
        }
        if chunk_size == 0 {
            return Err(ApiError::validation("chunkSize must be positive"));
        }
        if room.state.lock().unwrap().is_processing {
            return Err(ApiError::processing_in_progress(&room.id));
        }

        // One active upload per room: a new init replaces the previous one.
        let previous = self.active_by_room.lock().unwrap().get(&room.id).cloned();
        if let Some(previous_id) = previous {
            self.purge_upload(&previous_id).await;
        }

        let safe_filename = sanitize_filename(filename);
        let upload_id = format!("{}_{}", room.id, now_ms());
        let dir = self.upload_dir(&upload_id);

        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            warn!("Failed to create upload dir '{}': {e}", dir.display());
            ApiError::internal("Failed to create upload directory")
        })?;

        let part = tokio::fs::File::create(self.part_path(&upload_id))
            .await
            .map_err(|e| {
                warn!("Failed to create part file for '{upload_id}': {e}");
                ApiError::internal("Failed to create part file")
            })?;
        part.set_len(total_size).await.map_err(|e| {
            warn!("Failed to preallocate part file for '{upload_id}': {e}");
            ApiError::internal("Failed to preallocate part file")
        })?;

        let now = now_ms();
        let meta = UploadMeta {
            room_id: room.id.clone(),
            upload_id: upload_id.clone(),
            filename: safe_filename.clone(),
            total_chunks,
            chunk_size,
            total_size,
            received_chunks: BTreeSet::new(),
            created_at: now,
            last_activity: now,
        };
        self.checkpoint_meta(&meta).await;

        self.metas
            .lock()
            .unwrap()
            .insert(upload_id.clone(), meta);
        self.active_by_room
            .lock()
            .unwrap()
            .insert(room.id.clone(), upload_id.clone());

        {
            let mut state = room.state.lock().unwrap();
            state.is_uploading = true;
            state.upload_progress = 0;
            state.last_update = now;
        }

        info!(
            "Upload '{upload_id}' started ({total_chunks} chunks of {chunk_size} bytes)"
        );
        Ok((upload_id, safe_filename))
    }

    // ── chunk ───────────────────────────────────────────────────────────

    /// Write one chunk at its offset through the pooled handle.
    /// Returns the recomputed progress percentage.
    pub async fn write_chunk(
        &self,
        room_id: &str,
        upload_id: &str,
        chunk_index: u32,
        body: Bytes,
    ) -> Result<u8, ApiError> {
        let (chunk_size, total_chunks) = {
            let metas = self.metas.lock().unwrap();
            let meta = metas
                .get(upload_id)
                .filter(|m| m.room_id == room_id)
                .ok_or_else(|| ApiError::upload_not_found(upload_id))?;
            (meta.chunk_size, meta.total_chunks)
        };

        if chunk_index >= total_chunks {
            return Err(ApiError::validation(format!(
                "chunkIndex {chunk_index} out of range (totalChunks {total_chunks})"
            )));
        }

        let handle = self.handle_for(upload_id)?;
        handle.inflight.fetch_add(1, Ordering::SeqCst);
        handle.last_used.store(now_ms(), Ordering::Relaxed);

        let offset = chunk_index as u64 * chunk_size;
        let write_handle = Arc::clone(&handle);
        let result = tokio::task::spawn_blocking(move || {
            write_all_at(&write_handle.file, &body, offset)
        })
        .await;

        handle.inflight.fetch_sub(1, Ordering::SeqCst);
        handle.last_used.store(now_ms(), Ordering::Relaxed);

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Chunk write failed for '{upload_id}' #{chunk_index}: {e}");
                return Err(ApiError::internal("Failed to write chunk"));
            }
            Err(e) => {
                warn!("Chunk write task failed for '{upload_id}': {e}");
                return Err(ApiError::internal("Failed to write chunk"));
            }
        }

        let mut metas = self.metas.lock().unwrap();
        let meta = metas
            .get_mut(upload_id)
            .ok_or_else(|| ApiError::upload_not_found(upload_id))?;
        meta.received_chunks.insert(chunk_index);
        meta.last_activity = now_ms();
        Ok(meta.progress())
    }

    fn handle_for(&self, upload_id: &str) -> Result<Arc<PooledHandle>, ApiError> {
        let mut handles = self.handles.lock().unwrap();
        if let Some(handle) = handles.get(upload_id) {
            return Ok(Arc::clone(handle));
        }

        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(self.part_path(upload_id))
            .map_err(|e| {
                warn!("Failed to open part file for '{upload_id}': {e}");
                ApiError::internal("Failed to open part file")
            })?;
        let handle = Arc::new(PooledHandle {
            file,
            last_used: AtomicU64::new(now_ms()),
            inflight: AtomicUsize::new(0),
        });
        handles.insert(upload_id.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    // ── status ──────────────────────────────────────────────────────────

    /// Resume snapshot: which chunks the server already holds.
    pub fn status(&self, room_id: &str, upload_id: &str) -> Option<UploadStatus> {
        let metas = self.metas.lock().unwrap();
        metas
            .get(upload_id)
            .filter(|m| m.room_id == room_id)
            .map(|meta| UploadStatus {
                upload_id: meta.upload_id.clone(),
                filename: meta.filename.clone(),
                total_chunks: meta.total_chunks,
                existing_chunks: meta.received_chunks.iter().copied().collect(),
                last_activity: meta.last_activity,
            })
    }

    // ── complete ────────────────────────────────────────────────────────

    /// Verify all chunks arrived, publish the part file under its final name
    /// and clear the upload.  Returns the final path.
    pub async fn complete(&self, room: &Room, upload_id: &str) -> Result<PathBuf, ApiError> {
        let meta = {
            let metas = self.metas.lock().unwrap();
            metas
                .get(upload_id)
                .filter(|m| m.room_id == room.id)
                .cloned()
                .ok_or_else(|| ApiError::upload_not_found(upload_id))?
        };

        let received = meta.received_chunks.len() as u32;
        if received != meta.total_chunks {
            return Err(ApiError::validation(format!(
                "upload incomplete: received {received} of {} chunks",
                meta.total_chunks
            )));
        }

        // Close the pooled handle before the rename.
        self.handles.lock().unwrap().remove(upload_id);
        self.checkpoint_meta(&meta).await;

        let final_path = self.final_path(upload_id, &meta.filename);
        tokio::fs::rename(self.part_path(upload_id), &final_path)
            .await
            .map_err(|e| {
                warn!("Failed to publish upload '{upload_id}': {e}");
                ApiError::internal("Failed to finalize upload")
            })?;
        if let Err(e) = tokio::fs::remove_dir_all(self.upload_dir(upload_id)).await {
            warn!("Failed to remove upload dir '{upload_id}': {e}");
        }

        self.metas.lock().unwrap().remove(upload_id);
        self.active_by_room.lock().unwrap().remove(&meta.room_id);

        {
            let mut state = room.state.lock().unwrap();
            state.is_uploading = false;
            state.upload_progress = 100;
            state.is_processing = true;
            state.processing_message = "Processing uploaded file".into();
            state.last_update = now_ms();
        }

        info!("Upload '{upload_id}' complete → {}", final_path.display());
        Ok(final_path)
    }

    // ── abort / purge ───────────────────────────────────────────────────

    /// Drop an upload: close its handle, forget its metadata, delete its dir.
    pub async fn purge_upload(&self, upload_id: &str) {
        self.handles.lock().unwrap().remove(upload_id);
        let meta = self.metas.lock().unwrap().remove(upload_id);
        if let Some(meta) = meta {
            self.active_by_room.lock().unwrap().remove(&meta.room_id);
        }
        let dir = self.upload_dir(upload_id);
        if dir.is_dir() {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                warn!("Failed to remove upload dir '{upload_id}': {e}");
            }
        }
    }

    /// Cascade for room deletion: active upload, subtitle dir, and the
    /// published video (only when it actually lives under the uploads root).
    pub async fn purge_room(&self, room_id: &str, video_path: Option<&FsPath>) {
        let active = self.active_by_room.lock().unwrap().get(room_id).cloned();
        if let Some(upload_id) = active {
            self.purge_upload(&upload_id).await;
        }

        let subs = self.subtitles_dir(room_id);
        if subs.is_dir() {
            if let Err(e) = tokio::fs::remove_dir_all(&subs).await {
                warn!("Failed to remove subtitle dir for '{room_id}': {e}");
            }
        }

        if let Some(video) = video_path {
            if is_under_root(&self.root, video) {
                if let Err(e) = tokio::fs::remove_file(video).await {
                    warn!("Failed to remove video for '{room_id}': {e}");
                }
            } else if video.exists() {
                warn!(
                    "Refusing to delete video outside uploads root: {}",
                    video.display()
                );
            }
        }
    }

    // ── Maintenance ─────────────────────────────────────────────────────

    /// Close pooled handles idle past the threshold with no writes in flight.
    pub fn sweep_handles(&self) {
        let now = now_ms();
        self.handles.lock().unwrap().retain(|upload_id, handle| {
            let keep = handle.inflight.load(Ordering::SeqCst) > 0
                || now.saturating_sub(handle.last_used.load(Ordering::Relaxed))
                    < HANDLE_IDLE_MS;
            if !keep {
                info!("Closing idle upload handle '{upload_id}'");
            }
            keep
        });
    }

    /// Delete upload directories whose last activity is past the TTL.
    /// Subtitle directories are exempt.
    pub async fn collect_expired(&self) {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Upload GC cannot read uploads root: {e}");
                return;
            }
        };
        let now = now_ms();

        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(SUBTITLE_DIR_SUFFIX) {
                continue;
            }

            let last_activity = {
                let metas = self.metas.lock().unwrap();
                metas.get(&name).map(|m| m.last_activity)
            };
            // Fall back to the on-disk checkpoint, then the dir mtime.
            let last_activity = match last_activity {
                Some(ms) => Some(ms),
                None => match read_meta_activity(&self.meta_path(&name)).await {
                    Some(ms) => Some(ms),
                    None => entry
                        .metadata()
                        .await
                        .ok()
                        .and_then(|m| m.modified().ok())
                        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                        .map(|d| d.as_millis() as u64),
                },
            };

            let expired = last_activity
                .map(|ms| now.saturating_sub(ms) > UPLOAD_TTL_MS)
                .unwrap_or(true);
            if expired {
                info!("Upload GC collecting stale upload '{name}'");
                self.purge_upload(&name).await;
            }
        }
    }
}

async fn read_meta_activity(path: &FsPath) -> Option<u64> {
    let bytes = tokio::fs::read(path).await.ok()?;
    let meta: UploadMeta = serde_json::from_slice(&bytes).ok()?;
    Some(meta.last_activity)
}

/// Spawn the 15 s handle sweeper and the 5 min TTL GC.
pub fn spawn_maintenance(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sweep = tokio::time::interval(std::time::Duration::from_secs(15));
        let mut gc = tokio::time::interval(std::time::Duration::from_secs(300));
        // Skip the immediate first ticks.
        sweep.tick().await;
        gc.tick().await;
        loop {
            tokio::select! {
                _ = sweep.tick() => state.uploads.sweep_handles(),
                _ = gc.tick() => state.uploads.collect_expired().await,
            }
        }
    })
}

// ─── Authorization ──────────────────────────────────────────────────────────

/// Upload endpoints are host-only and refuse ended sessions.
///
/// Bot-bound rooms authenticate with the host's session token (query `token`
/// or `x-session-token` header); plain rooms match the creating host id
/// (query `hostId` or `x-host-id` header).
pub fn authorize_host(
    room: &Room,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Result<(), ApiError> {
    if room.state.lock().unwrap().status == RoomStatus::Ended {
        return Err(ApiError::session_ended(&room.id));
    }

    if room.discord.is_some() {
        let token = query
            .get("token")
            .map(String::as_str)
            .or_else(|| headers.get("x-session-token").and_then(|v| v.to_str().ok()))
            .ok_or_else(ApiError::token_invalid)?;
        if !crate::token::is_host_token(room, token) {
            return Err(ApiError::not_host());
        }
        return Ok(());
    }

    let host_id = query
        .get("hostId")
        .map(String::as_str)
        .or_else(|| headers.get("x-host-id").and_then(|v| v.to_str().ok()))
        .ok_or_else(ApiError::not_host)?;
    let matches = room.state.lock().unwrap().host_id.as_deref() == Some(host_id);
    if !matches {
        return Err(ApiError::not_host());
    }
    Ok(())
}

// ─── DTOs ───────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadRequest {
    pub filename: String,
    pub total_chunks: u32,
    pub chunk_size: u64,
    pub total_size: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadResponse {
    pub upload_id: String,
    pub safe_filename: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatus {
    pub upload_id: String,
    pub filename: String,
    pub total_chunks: u32,
    pub existing_chunks: Vec<u32>,
    pub last_activity: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadRequest {
    pub filename: String,
    #[allow(dead_code)]
    pub total_chunks: u32,
}

// ─── API handlers ───────────────────────────────────────────────────────────

fn lookup_room(state: &AppState, room_id: &str) -> Result<Arc<Room>, ApiError> {
    state
        .registry
        .get(room_id)
        .ok_or_else(|| ApiError::room_not_found(room_id))
}

/// POST /api/upload/init/:room_id
pub async fn init_upload(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<InitUploadRequest>,
) -> Result<Json<InitUploadResponse>, ApiError> {
    let room = lookup_room(&state, &room_id)?;
    authorize_host(&room, &query, &headers)?;

    let (upload_id, safe_filename) = state
        .uploads
        .init(
            &room,
            &body.filename,
            body.total_chunks,
            body.chunk_size,
            body.total_size,
        )
        .await?;

    room.broadcast(&ServerMessage::UploadStart {
        filename: safe_filename.clone(),
    });

    Ok(Json(InitUploadResponse {
        upload_id,
        safe_filename,
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResponse {
    pub success: bool,
    pub chunk_index: u32,
    pub progress: u8,
}

/// POST /api/upload/chunk/:room_id/:upload_id/:chunk_index
pub async fn upload_chunk(
    State(state): State<Arc<AppState>>,
    Path((room_id, upload_id, chunk_index)): Path<(String, String, u32)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ChunkResponse>, ApiError> {
    let room = lookup_room(&state, &room_id)?;
    authorize_host(&room, &query, &headers)?;

    let progress = state
        .uploads
        .write_chunk(&room_id, &upload_id, chunk_index, body)
        .await?;

    let now = now_ms();
    {
        let mut room_state = room.state.lock().unwrap();
        room_state.upload_progress = progress;
        room_state.last_update = now;
    }
    if room.progress_should_broadcast(progress, now) {
        room.broadcast(&ServerMessage::UploadProgress { progress });
    }

    Ok(Json(ChunkResponse {
        success: true,
        chunk_index,
        progress,
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResponse {
    pub success: bool,
    pub filename: String,
    pub processing: bool,
}

/// POST /api/upload/complete/:room_id/:upload_id
///
/// Returns as soon as the part file is published; probing and transcoding run
/// in a background task.
pub async fn complete_upload(
    State(state): State<Arc<AppState>>,
    Path((room_id, upload_id)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<CompleteUploadRequest>,
) -> Result<Json<CompleteResponse>, ApiError> {
    let room = lookup_room(&state, &room_id)?;
    authorize_host(&room, &query, &headers)?;

    let final_path = state.uploads.complete(&room, &upload_id).await?;

    room.broadcast(&ServerMessage::UploadProgress { progress: 100 });
    room.broadcast(&ServerMessage::ProcessingProgress {
        message: "Processing uploaded file".into(),
    });

    let bg_state = Arc::clone(&state);
    let bg_room = Arc::clone(&room);
    tokio::spawn(async move {
        crate::media::process_video(bg_state, bg_room, final_path).await;
    });

    Ok(Json(CompleteResponse {
        success: true,
        filename: sanitize_filename(&body.filename),
        processing: true,
    }))
}

#[derive(Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// POST /api/upload/abort/:room_id/:upload_id
pub async fn abort_upload(
    State(state): State<Arc<AppState>>,
    Path((room_id, upload_id)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Json<SuccessResponse>, ApiError> {
    let room = lookup_room(&state, &room_id)?;
    authorize_host(&room, &query, &headers)?;

    if state.uploads.status(&room_id, &upload_id).is_none() {
        return Err(ApiError::upload_not_found(&upload_id));
    }
    state.uploads.purge_upload(&upload_id).await;

    {
        let mut room_state = room.state.lock().unwrap();
        room_state.is_uploading = false;
        room_state.upload_progress = 0;
    }

    info!("Upload '{upload_id}' aborted");
    Ok(Json(SuccessResponse { success: true }))
}

/// GET /api/upload/status/:room_id/:upload_id
pub async fn upload_status(
    State(state): State<Arc<AppState>>,
    Path((room_id, upload_id)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Json<UploadStatus>, ApiError> {
    let room = lookup_room(&state, &room_id)?;
    authorize_host(&room, &query, &headers)?;

    state
        .uploads
        .status(&room_id, &upload_id)
        .map(Json)
        .ok_or_else(|| ApiError::upload_not_found(&upload_id))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtitleUploadResponse {
    pub success: bool,
    pub filename: String,
    pub display_name: String,
}

/// POST /api/upload/subtitle/:room_id
///
/// Raw body, original name in the `x-filename` header.
pub async fn upload_subtitle(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SubtitleUploadResponse>, ApiError> {
    let room = lookup_room(&state, &room_id)?;
    authorize_host(&room, &query, &headers)?;

    let original = headers
        .get("x-filename")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::validation("missing x-filename header"))?;
    let safe = sanitize_filename(original);

    let dir = state.uploads.subtitles_dir(&room_id);
    tokio::fs::create_dir_all(&dir).await.map_err(|e| {
        warn!("Failed to create subtitle dir for '{room_id}': {e}");
        ApiError::internal("Failed to create subtitle directory")
    })?;

    let index = room.state.lock().unwrap().subtitles.len();
    let filename = format!("{room_id}_up_{index}_{safe}");
    tokio::fs::write(dir.join(&filename), &body)
        .await
        .map_err(|e| {
            warn!("Failed to store subtitle for '{room_id}': {e}");
            ApiError::internal("Failed to store subtitle")
        })?;

    let display_name = safe
        .rsplit_once('.')
        .map(|(stem, _)| stem.to_string())
        .unwrap_or_else(|| safe.clone());

    room.state.lock().unwrap().subtitles.push(crate::room::Subtitle {
        filename: filename.clone(),
        display_name: display_name.clone(),
    });
    room.broadcast(&ServerMessage::SubtitleAdded {
        filename: filename.clone(),
        display_name: display_name.clone(),
    });

    Ok(Json(SubtitleUploadResponse {
        success: true,
        filename,
        display_name,
    }))
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_room(id: &str) -> Room {
        Room::new(id.into(), "t".into(), "m".into(), None, None, None)
    }

    fn manager() -> (tempfile::TempDir, UploadManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = UploadManager::new(dir.path().to_path_buf());
        (dir, manager)
    }

    #[test]
    fn sanitize_collapses_everything_else() {
        assert_eq!(sanitize_filename("My Movie (2024).mkv"), "My_Movie__2024_.mkv");
        assert_eq!(sanitize_filename("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_filename("safe-name_1.mp4"), "safe-name_1.mp4");
        assert_eq!(sanitize_filename("..."), "_");
    }

    #[tokio::test]
    async fn init_validates_inputs() {
        let (_dir, manager) = manager();
        let room = test_room("r1");

        assert!(manager.init(&room, "a.mp4", 0, 1024, 0).await.is_err());
        assert!(manager.init(&room, "a.mp4", 4, 0, 0).await.is_err());

        room.state.lock().unwrap().is_processing = true;
        assert!(manager.init(&room, "a.mp4", 4, 1024, 4096).await.is_err());
    }

    #[tokio::test]
    async fn full_upload_roundtrip() {
        let (_dir, manager) = manager();
        let room = test_room("r1");

        let payload: Vec<u8> = (0..10_240u32).map(|i| (i % 251) as u8).collect();
        let chunk_size = 4_096u64;
        let total_chunks = 3u32; // 4096 + 4096 + 2048

        let (upload_id, safe) = manager
            .init(&room, "movie.mp4", total_chunks, chunk_size, payload.len() as u64)
            .await
            .unwrap();
        assert!(room.state.lock().unwrap().is_uploading);

        for index in 0..total_chunks {
            let start = index as usize * chunk_size as usize;
            let end = (start + chunk_size as usize).min(payload.len());
            let progress = manager
                .write_chunk("r1", &upload_id, index, Bytes::copy_from_slice(&payload[start..end]))
                .await
                .unwrap();
            assert!(progress <= 99);
        }

        let final_path = manager.complete(&room, &upload_id).await.unwrap();
        assert_eq!(
            final_path.file_name().unwrap().to_str().unwrap(),
            format!("{upload_id}_{safe}")
        );
        assert_eq!(tokio::fs::read(&final_path).await.unwrap(), payload);
        assert!(!manager.upload_dir(&upload_id).exists());

        let state = room.state.lock().unwrap();
        assert!(!state.is_uploading);
        assert_eq!(state.upload_progress, 100);
        assert!(state.is_processing);
    }

    #[tokio::test]
    async fn resume_after_partial_upload() {
        let (_dir, manager) = manager();
        let room = test_room("r1");

        let payload: Vec<u8> = (0..8_192u32).map(|i| (i / 7) as u8).collect();
        let chunk_size = 2_048u64;

        let (upload_id, _) = manager
            .init(&room, "movie.mp4", 4, chunk_size, payload.len() as u64)
            .await
            .unwrap();

        for index in [0u32, 2] {
            let start = index as usize * chunk_size as usize;
            manager
                .write_chunk(
                    "r1",
                    &upload_id,
                    index,
                    Bytes::copy_from_slice(&payload[start..start + chunk_size as usize]),
                )
                .await
                .unwrap();
        }

        // Simulated reload: the client asks what the server already has.
        let status = manager.status("r1", &upload_id).unwrap();
        assert_eq!(status.existing_chunks, vec![0, 2]);
        assert_eq!(status.total_chunks, 4);

        // Completing now must fail and name the counts.
        let err = manager.complete(&room, &upload_id).await.unwrap_err();
        assert!(err.message.contains("2 of 4"));

        for index in [1u32, 3] {
            let start = index as usize * chunk_size as usize;
            manager
                .write_chunk(
                    "r1",
                    &upload_id,
                    index,
                    Bytes::copy_from_slice(&payload[start..start + chunk_size as usize]),
                )
                .await
                .unwrap();
        }

        let final_path = manager.complete(&room, &upload_id).await.unwrap();
        assert_eq!(tokio::fs::read(&final_path).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn chunk_index_must_be_in_range() {
        let (_dir, manager) = manager();
        let room = test_room("r1");
        let (upload_id, _) = manager.init(&room, "a.mp4", 4, 1024, 4096).await.unwrap();

        let err = manager
            .write_chunk("r1", &upload_id, 4, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn new_init_purges_previous_upload() {
        let (_dir, manager) = manager();
        let room = test_room("r1");

        let (first, _) = manager.init(&room, "a.mp4", 4, 1024, 4096).await.unwrap();
        let (second, _) = manager.init(&room, "b.mp4", 2, 1024, 2048).await.unwrap();

        assert!(manager.status("r1", &first).is_none());
        assert!(manager.status("r1", &second).is_some());
        assert!(!manager.upload_dir(&first).exists());
    }

    #[tokio::test]
    async fn abort_removes_everything() {
        let (_dir, manager) = manager();
        let room = test_room("r1");
        let (upload_id, _) = manager.init(&room, "a.mp4", 4, 1024, 4096).await.unwrap();

        manager
            .write_chunk("r1", &upload_id, 0, Bytes::from_static(b"data"))
            .await
            .unwrap();
        manager.purge_upload(&upload_id).await;

        assert!(manager.status("r1", &upload_id).is_none());
        assert!(!manager.upload_dir(&upload_id).exists());
    }

    #[tokio::test]
    async fn progress_caps_at_ninety_nine() {
        let (_dir, manager) = manager();
        let room = test_room("r1");
        let (upload_id, _) = manager.init(&room, "a.mp4", 1, 8, 8).await.unwrap();

        let progress = manager
            .write_chunk("r1", &upload_id, 0, Bytes::from_static(b"12345678"))
            .await
            .unwrap();
        assert_eq!(progress, 99);
    }

    #[tokio::test]
    async fn purge_room_respects_uploads_root() {
        let (dir, manager) = manager();
        let room_id = "r1";

        // A published video inside the root is deleted…
        let inside = dir.path().join("r1_123_movie.mp4");
        tokio::fs::write(&inside, b"video").await.unwrap();
        manager.purge_room(room_id, Some(&inside)).await;
        assert!(!inside.exists());

        // …but a path outside the root is refused.
        let outside_dir = tempfile::tempdir().unwrap();
        let outside = outside_dir.path().join("elsewhere.mp4");
        tokio::fs::write(&outside, b"video").await.unwrap();
        manager.purge_room(room_id, Some(&outside)).await;
        assert!(outside.exists());
    }

    #[test]
    fn handle_sweep_keeps_active_handles() {
        let (dir, manager) = manager();
        std::fs::create_dir_all(manager.upload_dir("u1")).unwrap();
        std::fs::write(manager.part_path("u1"), b"x").unwrap();

        let handle = manager.handle_for("u1").unwrap();
        handle.last_used.store(0, Ordering::Relaxed); // ancient
        handle.inflight.store(1, Ordering::SeqCst);

        manager.sweep_handles();
        assert!(manager.handles.lock().unwrap().contains_key("u1"));

        handle.inflight.store(0, Ordering::SeqCst);
        manager.sweep_handles();
        assert!(!manager.handles.lock().unwrap().contains_key("u1"));
        drop(dir);
    }
}
