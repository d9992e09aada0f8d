//! Fully-resolved runtime configuration.
//!
//! `DaemonConfig` is built once at startup (by the daemon's CLI parser) and
//! shared by reference with every component; it owns no business logic of
//! its own.

use serde::{Deserialize, Serialize};

use crate::types::{DEFAULT_MAX_HANDSHAKE_AGE, DEFAULT_TICK_INTERVAL};

/// Immutable, fully-resolved configuration for one daemon run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Port the HTTP API binds to.
    pub port: u16,
    /// Tick interval, in seconds.
    pub interval_secs: u64,
    /// Handshake freshness window, in seconds.
    pub max_handshake_age: i64,
    /// Raise the tracing filter to `debug` when set.
    pub debug: bool,
    /// SQLite database file path.
    pub db_path: String,
    /// WireGuard interface name the adapter targets.
    pub interface: String,
    /// Server public key placed into rendered client configs.
    pub server_public_key: String,
    /// `host:port` placed into rendered client configs as the `Endpoint`.
    pub server_endpoint: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            interval_secs: DEFAULT_TICK_INTERVAL,
            max_handshake_age: DEFAULT_MAX_HANDSHAKE_AGE,
            debug: false,
            db_path: "wireguard.db".to_string(),
            interface: "wg0".to_string(),
            server_public_key: "<SERVER_PUBLIC_KEY>".to_string(),
            server_endpoint: "server.example.com:51820".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_external_interface() {
        let cfg = DaemonConfig::default();
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.interval_secs, 10);
        assert_eq!(cfg.max_handshake_age, 180);
        assert_eq!(cfg.interface, "wg0");
        assert_eq!(cfg.db_path, "wireguard.db");
    }
}
