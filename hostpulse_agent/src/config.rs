//! Runtime configuration from environment variables.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port the WebSocket listener binds to.
    pub port: u16,
    /// Optional shared token; when set, `hello` must present exactly this value.
    pub token: Option<String>,
    /// Directory holding metrics.db; `None` disables the durable store (ring only).
    pub db_dir: Option<PathBuf>,
    /// Log a counter line every N pushed notifications (0 = off).
    pub log_every: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3030,
            token: None,
            db_dir: Some(PathBuf::from("data")),
            log_every: 0,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(p) = std::env::var("HOSTPULSE_PORT") {
            if let Ok(p) = p.parse() {
                cfg.port = p;
            }
        }
        if let Ok(t) = std::env::var("HOSTPULSE_TOKEN") {
            if !t.is_empty() {
                cfg.token = Some(t);
            }
        }
        if let Ok(d) = std::env::var("HOSTPULSE_DB_DIR") {
            // Empty value opts out of SQLite persistence entirely.
            cfg.db_dir = if d.is_empty() {
                None
            } else {
                Some(PathBuf::from(d))
            };
        }
        if let Ok(n) = std::env::var("HOSTPULSE_LOG_EVERY") {
            if let Ok(n) = n.parse() {
                cfg.log_every = n;
            }
        }
        cfg
    }
}
