mod api;
mod config;
mod error;
mod limits;
mod media;
mod rating;
mod registry;
mod room;
mod streaming;
mod sync;
mod token;
mod upload;
mod ws;

use axum::{
    extract::{DefaultBodyLimit, Request},
    http::{HeaderName, HeaderValue},
    middleware::{self, Next},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::services::ServeDir;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// ─── AppState ───────────────────────────────────────────────────────────────

pub struct AppState {
    pub registry: registry::RoomRegistry,
    pub uploads: upload::UploadManager,
    pub limiter: limits::RateLimiter,
    pub config: config::Config,
}

// ─── Version header middleware ──────────────────────────────────────────────

async fn version_header_middleware(request: Request, next: Next) -> impl IntoResponse {
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        HeaderName::from_static("x-watchparty-version"),
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    response
}

// ─── TLS configuration ──────────────────────────────────────────────────────

/// Build the rustls config for native TLS termination from PEM files.
async fn load_tls_config(
    cert_path: &str,
    key_path: &str,
) -> Result<axum_server::tls_rustls::RustlsConfig, Box<dyn std::error::Error>> {
    let config =
        axum_server::tls_rustls::RustlsConfig::from_pem_file(cert_path, key_path).await?;
    info!("TLS enabled (cert: {cert_path}, key: {key_path})");
    Ok(config)
}

// ─── Graceful shutdown ──────────────────────────────────────────────────────

/// Wait for ctrl-c, close every session socket with 1001, then let the
/// server drain — with a 10 s force-exit backstop.
async fn shutdown_signal(state: Arc<AppState>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received — closing sessions");

    for room in state.registry.rooms() {
        room.close_all(1001, "server shutting down");
    }

    tokio::spawn(async {
        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
        error!("Drain timed out after 10s — forcing exit");
        std::process::exit(0);
    });
}

// ─── Entry point ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // ── Install rustls CryptoProvider (required by rustls 0.23+) ────────
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // ── Load configuration ──────────────────────────────────────────────
    // Load .env before anything else so WATCHPARTY_LOG_LEVEL is available.
    let _ = dotenvy::dotenv();

    let log_level =
        std::env::var("WATCHPARTY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level)),
        )
        .init();

    let cfg = config::Config::from_env();

    // ── Prepare storage ─────────────────────────────────────────────────
    if let Err(e) = std::fs::create_dir_all(&cfg.uploads_dir) {
        error!("Cannot create uploads directory '{}': {e}", cfg.uploads_dir.display());
        std::process::exit(1);
    }

    let bind_addr = cfg.bind_addr.clone();
    let tls_enabled = cfg.tls_enabled;
    let tls_cert_path = cfg.tls_cert_path.clone();
    let tls_key_path = cfg.tls_key_path.clone();
    let allowed_origins = cfg.allowed_origins.clone();
    let public_dir = cfg.public_dir.clone();
    let uploads_dir = cfg.uploads_dir.clone();

    let state = Arc::new(AppState {
        registry: registry::RoomRegistry::new(),
        uploads: upload::UploadManager::new(uploads_dir),
        limiter: limits::RateLimiter::new(),
        config: cfg,
    });

    // ── Start background loops ──────────────────────────────────────────

    // Idle-room GC (5 min) + rate-limit bucket sweep.
    let _cleanup_handle = registry::spawn_cleanup_loop(Arc::clone(&state));
    // Host-inactivity transfer check (15 s).
    let _host_check_handle = registry::spawn_host_check_loop(Arc::clone(&state));
    // Periodic sync frames (1 Hz tick, 2 s / 5 s per room).
    let _sync_handle = sync::spawn_sync_loop(Arc::clone(&state));
    // WebSocket heartbeat sweep (30 s).
    let _heartbeat_handle = ws::spawn_heartbeat_loop(Arc::clone(&state));
    // Upload handle sweeper (15 s) + stale-upload TTL GC (5 min).
    let _upload_handle = upload::spawn_maintenance(Arc::clone(&state));

    // ── Build CORS layer ────────────────────────────────────────────────

    let cors = limits::build_cors_layer(&allowed_origins);

    // ── Build router ────────────────────────────────────────────────────

    let app = Router::new()
        // Health (no auth required)
        .route("/health", get(api::health))
        // Session API
        .route("/api/discord-session", post(api::create_discord_session))
        .route("/api/rooms", post(api::create_room))
        .route("/api/session-token/:room_id", post(api::create_session_token))
        .route("/api/validate-token/:room_id", get(api::validate_token))
        .route("/api/session-status/:room_id", get(api::session_status))
        .route("/api/session-rating/:room_id", post(rating::submit_rating))
        .route("/api/discord-end-session/:room_id", post(api::end_session))
        .route(
            "/api/discord-finalize-session/:room_id",
            post(api::finalize_session),
        )
        // Upload API
        .route("/api/upload/init/:room_id", post(upload::init_upload))
        .route(
            "/api/upload/chunk/:room_id/:upload_id/:chunk_index",
            post(upload::upload_chunk),
        )
        .route(
            "/api/upload/complete/:room_id/:upload_id",
            post(upload::complete_upload),
        )
        .route(
            "/api/upload/abort/:room_id/:upload_id",
            post(upload::abort_upload),
        )
        .route(
            "/api/upload/status/:room_id/:upload_id",
            get(upload::upload_status),
        )
        .route("/api/upload/subtitle/:room_id", post(upload::upload_subtitle))
        .route(
            "/api/upload/subtitle/:room_id/:filename",
            get(streaming::download_subtitle),
        )
        // Streaming + realtime
        .route("/video/:room_id", get(streaming::stream_video))
        .route("/ws", get(ws::ws_handler))
        // Frontend
        .fallback_service(ServeDir::new(&public_dir).append_index_html_on_directories(true))
        // Middleware
        .layer(middleware::from_fn(version_header_middleware))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            limits::rate_limit_middleware,
        ))
        .layer(cors)
        .layer(DefaultBodyLimit::max(64 * 1024 * 1024))
        .with_state(Arc::clone(&state));

    // ── Start server (plain HTTP or HTTPS) ──────────────────────────────

    if tls_enabled {
        let cert_path = tls_cert_path
            .as_deref()
            .expect("WATCHPARTY_TLS_CERT_PATH must be set when TLS is enabled");
        let key_path = tls_key_path
            .as_deref()
            .expect("WATCHPARTY_TLS_KEY_PATH must be set when TLS is enabled");

        let tls_config = load_tls_config(cert_path, key_path)
            .await
            .expect("Failed to load TLS configuration");

        info!("WatchParty listening on https://{bind_addr}");
        let addr: SocketAddr = bind_addr.parse().expect("invalid bind address");

        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        let shutdown_state = Arc::clone(&state);
        tokio::spawn(async move {
            shutdown_signal(shutdown_state).await;
            shutdown_handle.graceful_shutdown(Some(std::time::Duration::from_secs(10)));
        });

        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    } else {
        info!("WatchParty listening on http://{bind_addr}");

        let listener = tokio::net::TcpListener::bind(&bind_addr).await.unwrap();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&state)))
        .await
        .unwrap();
    }

    info!("Server stopped");
}
