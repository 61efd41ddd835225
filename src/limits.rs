// src/limits.rs
//
// Admission control and rate limits: a per-IP token bucket in front of the
// HTTP API, per-room client and bandwidth caps on WebSocket admission, and
// the CORS layer.
//
// ────────────────────────────────────────────────────────────────────────────

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::room::{now_ms, Room};
use crate::AppState;

// ─── Tunables ───────────────────────────────────────────────────────────────

/// Requests allowed per IP per window.
const BUCKET_CAPACITY: f64 = 120.0;
/// Refill window in milliseconds.
const BUCKET_WINDOW_MS: f64 = 60_000.0;
/// Chunk uploads fire hundreds of requests per file; they are exempt.
const EXEMPT_PREFIX: &str = "/api/upload/";

/// Nominal duration used by the bandwidth estimator when sizing a stream.
const NOMINAL_DURATION_SECS: f64 = 7_200.0;

// ─── Per-IP token bucket ────────────────────────────────────────────────────

struct Bucket {
    tokens: f64,
    last_refill: u64,
}

/// Token buckets keyed by client IP.  Single mutex; the hot path is one
/// HashMap lookup plus a little arithmetic.
pub struct RateLimiter {
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token for `ip`; returns `false` when the bucket is empty.
    pub fn allow(&self, ip: IpAddr) -> bool {
        self.allow_at(ip, now_ms())
    }

    fn allow_at(&self, ip: IpAddr, now: u64) -> bool {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.entry(ip).or_insert(Bucket {
            tokens: BUCKET_CAPACITY,
            last_refill: now,
        });

        let elapsed = now.saturating_sub(bucket.last_refill) as f64;
        bucket.tokens =
            (bucket.tokens + elapsed * BUCKET_CAPACITY / BUCKET_WINDOW_MS).min(BUCKET_CAPACITY);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop buckets that have fully refilled — they carry no state worth
    /// keeping.  Called from the registry cleanup loop.
    pub fn sweep(&self) {
        let now = now_ms();
        self.buckets.lock().unwrap().retain(|_, bucket| {
            let elapsed = now.saturating_sub(bucket.last_refill) as f64;
            bucket.tokens + elapsed * BUCKET_CAPACITY / BUCKET_WINDOW_MS < BUCKET_CAPACITY
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Axum middleware applying the per-IP bucket to every route except the
/// chunk-upload paths.
pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path();
    if !path.starts_with(EXEMPT_PREFIX) && !state.limiter.allow(addr.ip()) {
        warn!("Rate limit exceeded for {}", addr.ip());
        return ApiError {
            code: "rate_limited",
            message: "Too many requests.".into(),
            status: StatusCode::TOO_MANY_REQUESTS,
        }
        .into_response();
    }
    next.run(request).await
}

// ─── Per-room admission ─────────────────────────────────────────────────────

/// Estimated per-viewer bitrate in Mbps.
///
/// Derived from the published file size over a nominal two-hour duration and
/// clamped to [2, 50]; a conservative 15 Mbps stands in before the file
/// exists.
pub fn estimated_bitrate_mbps(video_size: Option<u64>) -> f64 {
    match video_size {
        Some(size) => (size as f64 * 8.0 / NOMINAL_DURATION_SECS / 1e6).clamp(2.0, 50.0),
        None => 15.0,
    }
}

/// A new viewer was refused: the room is at its client cap or admitting it
/// would exceed the room's bandwidth budget.
#[derive(Debug, PartialEq, Eq)]
pub struct AdmissionDenied;

/// Gate one WebSocket admission against the room caps.
pub fn admit(
    room: &Room,
    max_clients: usize,
    max_bandwidth_mbps: f64,
    video_size: Option<u64>,
) -> Result<(), AdmissionDenied> {
    let current = room.client_count();
    if current >= max_clients {
        return Err(AdmissionDenied);
    }

    let bitrate = estimated_bitrate_mbps(video_size);
    if (current + 1) as f64 * bitrate > max_bandwidth_mbps {
        return Err(AdmissionDenied);
    }
    Ok(())
}

// ─── CORS ───────────────────────────────────────────────────────────────────

/// CORS from the configured origin allow-list; an unset list means any
/// origin may join a watch-party.
pub fn build_cors_layer(allowed_origins: &str) -> CorsLayer {
    if allowed_origins == "*" {
        warn!("No origin allow-list configured; any site may embed this server");
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = allowed_origins
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<HeaderValue>().expect("invalid origin header value"))
            .collect();

        info!("Cross-origin access limited to {} configured origin(s)", origins.len());

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([
                HeaderName::from_static("content-type"),
                HeaderName::from_static("x-filename"),
                HeaderName::from_static("x-session-token"),
                HeaderName::from_static("x-host-id"),
            ])
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_room(id: &str) -> Room {
        Room::new(id.into(), "t".into(), "m".into(), None, None, None)
    }

    fn attach_clients(room: &Room, n: usize) {
        for i in 0..n {
            let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
            room.add_client(crate::room::ClientHandle {
                client_id: format!("c{i}"),
                token: None,
                external_id: None,
                username: None,
                sender: tx,
                connected_at: 0,
                last_ping_ms: std::sync::atomic::AtomicU64::new(0),
                awaiting_pong: std::sync::atomic::AtomicBool::new(false),
            });
        }
    }

    #[test]
    fn bucket_exhausts_and_refills() {
        let limiter = RateLimiter::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        for _ in 0..120 {
            assert!(limiter.allow_at(ip, 0));
        }
        assert!(!limiter.allow_at(ip, 0));

        // Half a window refills half the bucket.
        assert!(limiter.allow_at(ip, 30_000));
    }

    #[test]
    fn buckets_are_per_ip() {
        let limiter = RateLimiter::new();
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();

        for _ in 0..120 {
            assert!(limiter.allow_at(a, 0));
        }
        assert!(!limiter.allow_at(a, 0));
        assert!(limiter.allow_at(b, 0));
    }

    #[test]
    fn sweep_drops_full_buckets() {
        let limiter = RateLimiter::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        limiter.allow(ip);
        assert_eq!(limiter.buckets.lock().unwrap().len(), 1);

        // After a full window the bucket is refilled and dropped.
        limiter
            .buckets
            .lock()
            .unwrap()
            .get_mut(&ip)
            .unwrap()
            .last_refill = 0;
        limiter.sweep();
        assert!(limiter.buckets.lock().unwrap().is_empty());
    }

    #[test]
    fn bitrate_estimator_clamps() {
        // No file yet: conservative default.
        assert_eq!(estimated_bitrate_mbps(None), 15.0);
        // Tiny file clamps up to 2 Mbps.
        assert_eq!(estimated_bitrate_mbps(Some(1024)), 2.0);
        // Huge file clamps down to 50 Mbps.
        assert_eq!(estimated_bitrate_mbps(Some(1 << 40)), 50.0);
        // 10 GiB over 2 h ≈ 11.9 Mbps.
        let mid = estimated_bitrate_mbps(Some(10 * 1024 * 1024 * 1024));
        assert!(mid > 11.0 && mid < 13.0);
    }

    #[test]
    fn admission_enforces_client_cap() {
        let room = test_room("r1");
        attach_clients(&room, 10);
        assert_eq!(
            admit(&room, 10, 150.0, None),
            Err(AdmissionDenied)
        );
    }

    #[test]
    fn admission_enforces_bandwidth_cap() {
        let room = test_room("r1");
        attach_clients(&room, 3);
        // At the 50 Mbps clamp, the fourth viewer would need 200 Mbps total.
        let huge = Some(1u64 << 40);
        assert_eq!(admit(&room, 10, 150.0, huge), Err(AdmissionDenied));
        // A modest file admits comfortably.
        assert!(admit(&room, 10, 150.0, Some(1024 * 1024 * 1024)).is_ok());
    }
}
