use std::path::PathBuf;

use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Production configuration — loaded from environment variables
// ---------------------------------------------------------------------------

/// Complete server configuration loaded at startup.
///
/// Every field can be set via an environment variable prefixed with
/// `WATCHPARTY_`.  The bare `PORT`, `UPLOADS_DIR`, `PUBLIC_DIR` and
/// `ALLOWED_ORIGINS` variables are also honored for platform launchers.
/// Defaults are suitable for local development; production deployments MUST
/// override at least the uploads directory and the allowed origins.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Network ─────────────────────────────────────────────────────────
    /// Address to bind the HTTP(S) listener to.
    pub bind_addr: String,
    /// Public base URL handed to clients in invite links.
    pub public_url: String,

    // ── TLS ─────────────────────────────────────────────────────────────
    /// Enable native TLS termination inside the binary.
    pub tls_enabled: bool,
    /// Path to PEM-encoded certificate chain.
    pub tls_cert_path: Option<String>,
    /// Path to PEM-encoded private key.
    pub tls_key_path: Option<String>,

    // ── Storage ─────────────────────────────────────────────────────────
    /// Root directory for uploads, part files and extracted subtitles.
    /// Every file the server writes lives under this directory.
    pub uploads_dir: PathBuf,
    /// Directory of static frontend assets served at `/`.
    pub public_dir: PathBuf,

    // ── Media tooling ───────────────────────────────────────────────────
    /// Name or path of the ffmpeg binary.
    pub ffmpeg_bin: String,
    /// Name or path of the ffprobe binary.
    pub ffprobe_bin: String,

    // ── Limits ───────────────────────────────────────────────────────────
    /// Maximum number of simultaneously connected viewers per room.
    pub max_clients: usize,
    /// Aggregate estimated bandwidth cap per room, in Mbps.
    pub max_room_bandwidth_mbps: f64,

    // ── CORS ─────────────────────────────────────────────────────────────
    pub allowed_origins: String,

    // ── Logging ──────────────────────────────────────────────────────────
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Automatically loads a `.env` file if present (via `dotenvy`).
    pub fn from_env() -> Self {
        // Best-effort .env loading — ignore errors.
        let _ = dotenvy::dotenv();

        let port = env_or("PORT", "3000");
        let bind_addr = env_or("WATCHPARTY_BIND_ADDR", &format!("0.0.0.0:{port}"));
        let public_url = env_or("WATCHPARTY_PUBLIC_URL", &format!("http://localhost:{port}"));

        // TLS
        let tls_enabled = env_bool("WATCHPARTY_TLS_ENABLED", false);
        let tls_cert_path = std::env::var("WATCHPARTY_TLS_CERT_PATH").ok();
        let tls_key_path = std::env::var("WATCHPARTY_TLS_KEY_PATH").ok();

        // Storage
        let uploads_dir = PathBuf::from(env_or("UPLOADS_DIR", "./uploads"));
        let public_dir = PathBuf::from(env_or("PUBLIC_DIR", "./public"));

        // Media tooling
        let ffmpeg_bin = env_or("WATCHPARTY_FFMPEG_BIN", "ffmpeg");
        let ffprobe_bin = env_or("WATCHPARTY_FFPROBE_BIN", "ffprobe");

        // Limits
        let max_clients = env_or("WATCHPARTY_MAX_CLIENTS", "10")
            .parse::<usize>()
            .unwrap_or(10);
        let max_room_bandwidth_mbps = env_or("WATCHPARTY_MAX_ROOM_BANDWIDTH_MBPS", "150")
            .parse::<f64>()
            .unwrap_or(150.0);

        let allowed_origins = env_or("ALLOWED_ORIGINS", "*");
        let log_level = env_or("WATCHPARTY_LOG_LEVEL", "info");

        if allowed_origins == "*" {
            warn!("ALLOWED_ORIGINS not set — CORS is permissive");
        }

        let config = Config {
            bind_addr,
            public_url,
            tls_enabled,
            tls_cert_path,
            tls_key_path,
            uploads_dir,
            public_dir,
            ffmpeg_bin,
            ffprobe_bin,
            max_clients,
            max_room_bandwidth_mbps,
            allowed_origins,
            log_level,
        };

        config.log_summary();
        config
    }

    fn log_summary(&self) {
        info!("──── WatchParty Configuration ────");
        info!("  bind_addr          : {}", self.bind_addr);
        info!("  public_url         : {}", self.public_url);
        info!("  tls_enabled        : {}", self.tls_enabled);
        if self.tls_enabled {
            info!(
                "  tls_cert_path      : {}",
                self.tls_cert_path.as_deref().unwrap_or("(not set)")
            );
            info!(
                "  tls_key_path       : {}",
                self.tls_key_path.as_deref().unwrap_or("(not set)")
            );
        }
        info!("  uploads_dir        : {}", self.uploads_dir.display());
        info!("  public_dir         : {}", self.public_dir.display());
        info!("  ffmpeg_bin         : {}", self.ffmpeg_bin);
        info!("  ffprobe_bin        : {}", self.ffprobe_bin);
        info!("  max_clients        : {}", self.max_clients);
        info!("  max_room_bw_mbps   : {}", self.max_room_bandwidth_mbps);
        info!(
            "  cors_origins       : {}",
            if self.allowed_origins == "*" {
                "* (permissive)"
            } else {
                &self.allowed_origins
            }
        );
        info!("  log_level          : {}", self.log_level);
        info!("─────────────────────────────────");
    }
}

// ---------------------------------------------------------------------------
// Environment helpers
// ---------------------------------------------------------------------------

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            bind_addr: "0.0.0.0:3000".into(),
            public_url: "http://localhost:3000".into(),
            tls_enabled: false,
            tls_cert_path: None,
            tls_key_path: None,
            uploads_dir: PathBuf::from("./uploads"),
            public_dir: PathBuf::from("./public"),
            ffmpeg_bin: "ffmpeg".into(),
            ffprobe_bin: "ffprobe".into(),
            max_clients: 10,
            max_room_bandwidth_mbps: 150.0,
            allowed_origins: "*".into(),
            log_level: "info".into(),
        }
    }

    #[test]
    fn defaults_are_sane() {
        let config = test_config();
        assert_eq!(config.max_clients, 10);
        assert!(config.max_room_bandwidth_mbps > 0.0);
        assert!(!config.tls_enabled);
    }

    #[test]
    fn env_bool_parses_truthy() {
        std::env::set_var("WP_TEST_BOOL", "TRUE");
        assert!(env_bool("WP_TEST_BOOL", false));
        std::env::set_var("WP_TEST_BOOL", "0");
        assert!(!env_bool("WP_TEST_BOOL", true));
        std::env::remove_var("WP_TEST_BOOL");
        assert!(env_bool("WP_TEST_BOOL", true));
    }

    #[test]
    fn env_or_falls_back() {
        std::env::remove_var("WP_TEST_MISSING");
        assert_eq!(env_or("WP_TEST_MISSING", "fallback"), "fallback");
    }
}
