//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use rencontre_chat::HubOptions;
use rencontre_shared::constants::{
    DEFAULT_DRAIN_GRACE_SECS, DEFAULT_HISTORY_PAGE_SIZE, DEFAULT_HTTP_PORT,
    DEFAULT_QUEUE_CAPACITY, HISTORY_CACHE_CAP,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Filesystem path of the SQLite message store.
    /// Env: `DATABASE_PATH`
    /// Default: `./rencontre.db`
    pub database_path: PathBuf,

    /// Human-readable name for this server instance.
    /// Env: `INSTANCE_NAME`
    /// Default: `"Rencontre Node"`
    pub instance_name: String,

    /// Maximum number of messages waiting for the store writer before the
    /// oldest are discarded.
    /// Env: `QUEUE_CAPACITY`
    /// Default: `2000`
    pub queue_capacity: usize,

    /// Seconds the ingestion queue gets to flush during shutdown.
    /// Env: `DRAIN_GRACE_SECS`
    /// Default: `5`
    pub drain_grace_secs: u64,

    /// Messages retained per conversation in the history cache.
    /// Env: `HISTORY_CACHE_CAP`
    /// Default: `200`
    pub history_cache_cap: usize,

    /// Messages replayed to a connection when it joins a conversation.
    /// Env: `HISTORY_PAGE_SIZE`
    /// Default: `50`
    pub history_page_size: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./rencontre.db"),
            instance_name: "Rencontre Node".to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            drain_grace_secs: DEFAULT_DRAIN_GRACE_SECS,
            history_cache_cap: HISTORY_CACHE_CAP,
            history_page_size: DEFAULT_HISTORY_PAGE_SIZE,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Ok(path) = std::env::var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Ok(name) = std::env::var("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if let Ok(val) = std::env::var("QUEUE_CAPACITY") {
            if let Ok(n) = val.parse::<usize>() {
                config.queue_capacity = n.max(1);
            } else {
                tracing::warn!(value = %val, "Invalid QUEUE_CAPACITY, using default");
            }
        }

        if let Ok(val) = std::env::var("DRAIN_GRACE_SECS") {
            if let Ok(n) = val.parse::<u64>() {
                config.drain_grace_secs = n;
            } else {
                tracing::warn!(value = %val, "Invalid DRAIN_GRACE_SECS, using default");
            }
        }

        if let Ok(val) = std::env::var("HISTORY_CACHE_CAP") {
            if let Ok(n) = val.parse::<usize>() {
                config.history_cache_cap = n.max(1);
            } else {
                tracing::warn!(value = %val, "Invalid HISTORY_CACHE_CAP, using default");
            }
        }

        if let Ok(val) = std::env::var("HISTORY_PAGE_SIZE") {
            if let Ok(n) = val.parse::<u32>() {
                config.history_page_size = n.max(1);
            } else {
                tracing::warn!(value = %val, "Invalid HISTORY_PAGE_SIZE, using default");
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }

    /// Tunables for the chat hub.  Cache TTL and probe interval stay at
    /// their protocol defaults.
    pub fn hub_options(&self) -> HubOptions {
        HubOptions {
            queue_capacity: self.queue_capacity,
            drain_grace: Duration::from_secs(self.drain_grace_secs),
            history_cap: self.history_cache_cap,
            history_page_size: self.history_page_size,
            ..HubOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.queue_capacity, 2000);
        assert_eq!(config.history_page_size, 50);
    }

    #[test]
    fn test_hub_options_follow_config() {
        let config = ServerConfig {
            queue_capacity: 10,
            drain_grace_secs: 1,
            history_cache_cap: 7,
            history_page_size: 3,
            ..ServerConfig::default()
        };
        let options = config.hub_options();
        assert_eq!(options.queue_capacity, 10);
        assert_eq!(options.drain_grace, Duration::from_secs(1));
        assert_eq!(options.history_cap, 7);
        assert_eq!(options.history_page_size, 3);
    }
}
