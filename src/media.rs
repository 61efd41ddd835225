// src/media.rs
//
// Media post-processing pipeline: probe → subtitle extraction → conditional
// audio transcode.  Runs off the request path; `complete` has already
// answered the host by the time this starts.  Failures never propagate to an
// HTTP response — they are contained in the room state
// (`processing_message = "Error"`) and the room stays recoverable by
// re-upload.
//
// The muxer/demuxer is an external collaborator: an ffmpeg/ffprobe subprocess
// whose exit code and stderr form the result contract.
//
// ────────────────────────────────────────────────────────────────────────────

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use crate::room::{Room, Subtitle};
use crate::sync::ServerMessage;
use crate::AppState;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

// ─── Probe output ───────────────────────────────────────────────────────────

/// Subtitle codecs that carry bitmaps instead of text.  These cannot be
/// converted to SRT and are skipped.
const BITMAP_SUBTITLE_CODECS: &[&str] = &[
    "hdmv_pgs_subtitle",
    "dvd_subtitle",
    "dvb_subtitle",
    "xsub",
];

/// Audio codecs browsers play natively; no transcode needed.
const COMPATIBLE_AUDIO_CODECS: &[&str] = &["aac", "mp3"];

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeStream {
    pub index: u32,
    #[serde(default)]
    pub codec_type: Option<String>,
    #[serde(default)]
    pub codec_name: Option<String>,
    #[serde(default)]
    pub tags: Option<StreamTags>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamTags {
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeFormat {
    #[serde(default)]
    pub duration: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeOutput {
    #[serde(default)]
    pub streams: Vec<ProbeStream>,
    #[serde(default)]
    pub format: Option<ProbeFormat>,
}

impl ProbeOutput {
    pub fn subtitle_streams(&self) -> impl Iterator<Item = &ProbeStream> {
        self.streams
            .iter()
            .filter(|s| s.codec_type.as_deref() == Some("subtitle"))
    }

    pub fn audio_streams(&self) -> Vec<&ProbeStream> {
        self.streams
            .iter()
            .filter(|s| s.codec_type.as_deref() == Some("audio"))
            .collect()
    }

    /// Container duration in seconds, when the probe reported one.
    pub fn duration_secs(&self) -> Option<f64> {
        self.format
            .as_ref()?
            .duration
            .as_deref()?
            .parse::<f64>()
            .ok()
    }
}

pub fn is_text_subtitle(codec_name: &str) -> bool {
    !BITMAP_SUBTITLE_CODECS.contains(&codec_name)
}

/// Whether the selected audio track forces a transcode pass.
///
/// A compatible codec is kept as-is, unless the caller explicitly picked a
/// track out of several — then the file is remuxed down to that single track
/// (with audio copy when the codec allows it).
pub fn needs_transcode(codec_name: &str, explicit_selection: bool, track_count: usize) -> bool {
    if !COMPATIBLE_AUDIO_CODECS.contains(&codec_name) {
        return true;
    }
    explicit_selection && track_count > 1
}

// ─── Subprocess plumbing ────────────────────────────────────────────────────

/// Run the probe tool and parse its JSON stream report.
pub async fn probe(ffprobe_bin: &str, input: &Path) -> Result<ProbeOutput, BoxError> {
    let output = Command::new(ffprobe_bin)
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
        ])
        .arg(input)
        .stdin(Stdio::null())
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "probe exited with {}: {}",
            output.status,
            stderr.trim()
        )
        .into());
    }

    Ok(serde_json::from_slice(&output.stdout)?)
}

/// Run ffmpeg to completion, discarding output; stderr becomes the error.
async fn run_ffmpeg(ffmpeg_bin: &str, args: &[&str]) -> Result<(), BoxError> {
    let output = Command::new(ffmpeg_bin)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr
            .lines()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join(" | ");
        return Err(format!("ffmpeg exited with {}: {tail}", output.status).into());
    }
    Ok(())
}

// ─── Pipeline ───────────────────────────────────────────────────────────────

/// Orchestrate the whole post-processing pass for a freshly-uploaded file.
pub async fn process_video(state: Arc<AppState>, room: Arc<Room>, input: PathBuf) {
    match run_pipeline(&state, &room, &input, None).await {
        Ok(final_path) => {
            let subtitles = {
                let mut room_state = room.state.lock().unwrap();
                room_state.video_path = Some(final_path);
                room_state.is_processing = false;
                room_state.processing_message = "Ready".into();
                room_state.subtitles.clone()
            };
            info!("Room '{}': post-processing finished", room.id);
            room.broadcast(&ServerMessage::VideoReady {
                video_url: format!("/video/{}", room.id),
                subtitles,
            });
        }
        Err(e) => {
            warn!("Room '{}': post-processing failed: {e}", room.id);
            {
                let mut room_state = room.state.lock().unwrap();
                room_state.is_processing = false;
                room_state.processing_message = "Error".into();
            }
            room.broadcast(&ServerMessage::ProcessingProgress {
                message: "Error".into(),
            });
        }
    }
}

async fn run_pipeline(
    state: &Arc<AppState>,
    room: &Arc<Room>,
    input: &Path,
    selected_audio: Option<u32>,
) -> Result<PathBuf, BoxError> {
    let ffprobe = state.config.ffprobe_bin.clone();
    let ffmpeg = state.config.ffmpeg_bin.clone();

    set_progress(room, "Analyzing streams");
    let report = probe(&ffprobe, input).await?;

    extract_subtitles(state, room, &ffmpeg, input, &report).await;

    let final_path =
        maybe_transcode_audio(room, &ffmpeg, input, &report, selected_audio).await?;

    Ok(final_path)
}

fn set_progress(room: &Room, message: &str) {
    room.state.lock().unwrap().processing_message = message.to_string();
    room.broadcast(&ServerMessage::ProcessingProgress {
        message: message.to_string(),
    });
}

// ── Phase 1: subtitle extraction ────────────────────────────────────────────

/// Extract every text subtitle stream to SRT files under the room's subtitle
/// directory.  Per-stream failures are logged and skipped; they never fail
/// the pipeline.
async fn extract_subtitles(
    state: &Arc<AppState>,
    room: &Arc<Room>,
    ffmpeg: &str,
    input: &Path,
    report: &ProbeOutput,
) {
    let subtitle_streams: Vec<&ProbeStream> = report.subtitle_streams().collect();
    if subtitle_streams.is_empty() {
        return;
    }

    let text_streams: Vec<&ProbeStream> = subtitle_streams
        .iter()
        .copied()
        .filter(|s| {
            s.codec_name
                .as_deref()
                .map(is_text_subtitle)
                .unwrap_or(false)
        })
        .collect();

    if text_streams.is_empty() {
        set_progress(room, "bitmap subtitles ignored");
        return;
    }

    set_progress(room, "Extracting subtitles");
    let subs_dir = state.uploads.subtitles_dir(&room.id);
    if let Err(e) = tokio::fs::create_dir_all(&subs_dir).await {
        warn!("Room '{}': cannot create subtitle dir: {e}", room.id);
        return;
    }

    for stream in text_streams {
        let lang = stream
            .tags
            .as_ref()
            .and_then(|t| t.language.clone())
            .unwrap_or_else(|| "und".into());
        let filename = subtitle_filename(&room.id, stream.index, &lang);
        let out_path = subs_dir.join(&filename);
        let map = format!("0:{}", stream.index);

        let result = run_ffmpeg(
            ffmpeg,
            &[
                "-y",
                "-i",
                &input.to_string_lossy(),
                "-map",
                &map,
                "-c:s",
                "srt",
                &out_path.to_string_lossy(),
            ],
        )
        .await;

        match result {
            Ok(()) => {
                let display_name = stream
                    .tags
                    .as_ref()
                    .and_then(|t| t.title.clone())
                    .unwrap_or_else(|| lang.clone());
                room.state.lock().unwrap().subtitles.push(Subtitle {
                    filename: filename.clone(),
                    display_name: display_name.clone(),
                });
                room.broadcast(&ServerMessage::SubtitleAdded {
                    filename,
                    display_name,
                });
            }
            Err(e) => {
                warn!(
                    "Room '{}': subtitle stream {} extraction failed: {e}",
                    room.id, stream.index
                );
            }
        }
    }
}

pub fn subtitle_filename(room_id: &str, stream_index: u32, lang: &str) -> String {
    format!("{room_id}_sub_{stream_index}_{lang}.srt")
}

// ── Phase 2: conditional audio transcode ────────────────────────────────────

/// Transcode incompatible audio to stereo AAC, or keep the original when the
/// selected track already plays in browsers.  Returns the path to serve.
async fn maybe_transcode_audio(
    room: &Arc<Room>,
    ffmpeg: &str,
    input: &Path,
    report: &ProbeOutput,
    selected_audio: Option<u32>,
) -> Result<PathBuf, BoxError> {
    let audio_streams = report.audio_streams();
    let Some(&first) = audio_streams.first() else {
        // Silent film: nothing to do.
        return Ok(input.to_path_buf());
    };

    let target = selected_audio
        .and_then(|index| audio_streams.iter().find(|s| s.index == index).copied())
        .unwrap_or(first);
    let codec = target.codec_name.as_deref().unwrap_or("unknown");

    if !needs_transcode(codec, selected_audio.is_some(), audio_streams.len()) {
        return Ok(input.to_path_buf());
    }

    let output = converted_path(input);
    let map_audio = format!("0:{}", target.index);
    let audio_codec_args: &[&str] = if COMPATIBLE_AUDIO_CODECS.contains(&codec) {
        &["-c:a", "copy"]
    } else {
        &["-c:a", "aac", "-ac", "2", "-b:a", "192k"]
    };

    set_progress(room, "Converting audio: 0%");
    info!(
        "Room '{}': transcoding audio stream {} ({codec}) → aac",
        room.id, target.index
    );

    let input_str = input.to_string_lossy().to_string();
    let output_str = output.to_string_lossy().to_string();
    let mut args: Vec<&str> = vec![
        "-y",
        "-i",
        &input_str,
        "-map",
        "0:v:0",
        "-map",
        &map_audio,
        "-c:v",
        "copy",
    ];
    args.extend_from_slice(audio_codec_args);
    args.extend_from_slice(&[
        "-movflags",
        "+faststart",
        "-progress",
        "pipe:1",
        &output_str,
    ]);

    run_transcode_with_progress(room, ffmpeg, &args, report.duration_secs()).await?;

    // Replace the original with the produced file.
    if let Err(e) = tokio::fs::remove_file(input).await {
        warn!("Room '{}': cannot remove pre-transcode file: {e}", room.id);
    }
    Ok(output)
}

pub fn converted_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "video".into());
    input.with_file_name(format!("{stem}_converted.mp4"))
}

/// Spawn ffmpeg with `-progress pipe:1` and surface the percentage through
/// `processing_message` as it advances.
async fn run_transcode_with_progress(
    room: &Arc<Room>,
    ffmpeg: &str,
    args: &[&str],
    duration_secs: Option<f64>,
) -> Result<(), BoxError> {
    let mut child = Command::new(ffmpeg)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    if let (Some(stdout), Some(total)) = (child.stdout.take(), duration_secs) {
        let progress_room = Arc::clone(room);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut last_pct = 0u8;
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(pct) = transcode_percent(&line, total) {
                    if pct > last_pct {
                        last_pct = pct;
                        set_progress(&progress_room, &format!("Converting audio: {pct}%"));
                    }
                }
            }
        });
    }

    let mut stderr_tail = String::new();
    if let Some(stderr) = child.stderr.take() {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            stderr_tail = line;
        }
    }

    let status = child.wait().await?;
    if !status.success() {
        return Err(format!("ffmpeg exited with {status}: {stderr_tail}").into());
    }
    Ok(())
}

/// Parse one `-progress pipe:1` line into a percentage of `total` seconds.
pub fn transcode_percent(line: &str, total_secs: f64) -> Option<u8> {
    let value = line.strip_prefix("out_time_ms=")?.trim();
    let out_us = value.parse::<f64>().ok()?;
    if total_secs <= 0.0 {
        return None;
    }
    let pct = (out_us / 1_000_000.0 / total_secs * 100.0).clamp(0.0, 100.0);
    Some(pct as u8)
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const PROBE_JSON: &str = r#"{
        "streams": [
            {"index": 0, "codec_type": "video", "codec_name": "h264"},
            {"index": 1, "codec_type": "audio", "codec_name": "dts"},
            {"index": 2, "codec_type": "audio", "codec_name": "aac", "tags": {"language": "eng"}},
            {"index": 3, "codec_type": "subtitle", "codec_name": "subrip", "tags": {"language": "eng", "title": "English"}},
            {"index": 4, "codec_type": "subtitle", "codec_name": "hdmv_pgs_subtitle", "tags": {"language": "jpn"}}
        ],
        "format": {"duration": "5400.25"}
    }"#;

    #[test]
    fn probe_report_parses() {
        let report: ProbeOutput = serde_json::from_str(PROBE_JSON).unwrap();
        assert_eq!(report.streams.len(), 5);
        assert_eq!(report.audio_streams().len(), 2);
        assert_eq!(report.subtitle_streams().count(), 2);
        assert_eq!(report.duration_secs(), Some(5400.25));
    }

    #[test]
    fn bitmap_codecs_are_not_text() {
        assert!(is_text_subtitle("subrip"));
        assert!(is_text_subtitle("ass"));
        assert!(is_text_subtitle("mov_text"));
        for codec in BITMAP_SUBTITLE_CODECS {
            assert!(!is_text_subtitle(codec));
        }
    }

    #[test]
    fn transcode_decision() {
        // Incompatible codec always transcodes.
        assert!(needs_transcode("dts", false, 1));
        assert!(needs_transcode("eac3", true, 3));
        // Compatible codec without explicit selection is kept.
        assert!(!needs_transcode("aac", false, 3));
        assert!(!needs_transcode("mp3", false, 1));
        // Explicit selection out of several tracks forces a remux.
        assert!(needs_transcode("aac", true, 3));
        assert!(!needs_transcode("aac", true, 1));
    }

    #[test]
    fn subtitle_filenames_follow_layout() {
        assert_eq!(
            subtitle_filename("room-9", 3, "eng"),
            "room-9_sub_3_eng.srt"
        );
    }

    #[test]
    fn converted_path_is_a_sibling() {
        let path = converted_path(Path::new("/data/uploads/r1_7_movie.mkv"));
        assert_eq!(
            path,
            PathBuf::from("/data/uploads/r1_7_movie_converted.mp4")
        );
    }

    #[test]
    fn progress_lines_turn_into_percent() {
        // 2700 s of 5400 s → 50 %.
        assert_eq!(
            transcode_percent("out_time_ms=2700000000", 5400.0),
            Some(50)
        );
        assert_eq!(transcode_percent("frame=241", 5400.0), None);
        assert_eq!(transcode_percent("out_time_ms=1", 0.0), None);
        // Values past the end clamp to 100.
        assert_eq!(
            transcode_percent("out_time_ms=9000000000", 5400.0),
            Some(100)
        );
    }
}
