use serde::{Deserialize, Serialize};
use std::fmt;

/// Local-time timestamp format used for every stored timestamp column.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// Date-only format used for `traffic_stats`/`system_stats` rows.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Default handshake freshness window, in seconds.
pub const DEFAULT_MAX_HANDSHAKE_AGE: i64 = 180;
/// Default tick interval, in seconds.
pub const DEFAULT_TICK_INTERVAL: u64 = 10;
/// How long between system-stats heartbeats, in seconds.
pub const STATS_HEARTBEAT_SECS: i64 = 300;

/// A user's online/offline status, as stored in `users.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i64)]
pub enum UserStatus {
    /// No currently open Event.
    Offline = 0,
    /// Has an Event with `end_time IS NULL`.
    Online = 1,
}

impl UserStatus {
    /// Raw integer as stored in the `status` column.
    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

/// An `events.status` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    /// Session is currently open (`end_time IS NULL`).
    Online,
    /// Session has been closed.
    Offline,
}

impl EventStatus {
    /// The literal string stored in the `status` column.
    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Online => "ONLINE",
            EventStatus::Offline => "OFFLINE",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered WireGuard peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub peer_pubkey: String,
    pub client_ip: Option<String>,
    pub nickname: Option<String>,
    pub mail: Option<String>,
    pub phone: Option<String>,
    pub login_ip: Option<String>,
    pub bandwidth_limit: i64,
    pub data_limit: i64,
    pub expiry_date: Option<String>,
    pub status: i64,
    pub enabled: i64,
    pub total_rx: i64,
    pub total_tx: i64,
    pub last_login: Option<String>,
    pub note: Option<String>,
    pub wg_config: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl User {
    /// `true` iff `enabled == 1`.
    pub fn is_enabled(&self) -> bool {
        self.enabled != 0
    }

    /// `true` iff `status == 1` (an Event is currently open for this user).
    pub fn is_online(&self) -> bool {
        self.status != 0
    }

    /// Display nickname, falling back to `User_<id>` the way the original always did.
    pub fn display_name(&self) -> String {
        self.nickname
            .clone()
            .unwrap_or_else(|| format!("User_{}", self.id))
    }
}

/// One connection session row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub user_id: i64,
    pub start_time: String,
    pub end_time: Option<String>,
    pub last_update: String,
    pub session_rx: i64,
    pub session_tx: i64,
    pub login_ip: Option<String>,
    pub endpoint_info: Option<String>,
    pub status: String,
    pub duration_seconds: i64,
}

impl Event {
    /// `true` iff this event has no `end_time` yet.
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

/// One (user, date) daily traffic rollup row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficStat {
    pub id: i64,
    pub user_id: i64,
    pub date: String,
    pub daily_rx: i64,
    pub daily_tx: i64,
    pub session_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// One per-date system-wide rollup row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStat {
    pub id: i64,
    pub date: String,
    pub total_users: i64,
    pub active_users: i64,
    pub total_rx: i64,
    pub total_tx: i64,
    pub peak_concurrent: i64,
    pub avg_session_duration: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// A snapshot row read from the peer-table adapter for one public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSample {
    pub rx: i64,
    pub tx: i64,
    pub handshake_unix_seconds: i64,
    pub endpoint: Option<String>,
}

/// The Session Engine's in-memory baseline for one open session.
///
/// Not persisted; rebuilt from scratch (empty) on every process start.
#[derive(Debug, Clone)]
pub struct LiveSession {
    pub event_id: i64,
    pub user_id: i64,
    pub nickname: String,
    pub start_rx: i64,
    pub start_tx: i64,
    pub last_handshake: i64,
}

/// Why a session was closed. Logged, never persisted (per the spec's design notes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    HandshakeTimeout,
    Disappeared,
    Kicked,
    UserDeleted,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::HandshakeTimeout => "handshake_timeout",
            CloseReason::Disappeared => "disappeared",
            CloseReason::Kicked => "kicked",
            CloseReason::UserDeleted => "user_deleted",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_status_round_trips_through_str() {
        assert_eq!(EventStatus::Online.as_str(), "ONLINE");
        assert_eq!(EventStatus::Offline.to_string(), "OFFLINE");
    }

    #[test]
    fn display_name_falls_back_to_generated_label() {
        let user = User {
            id: 7,
            peer_pubkey: "x".repeat(44),
            client_ip: None,
            nickname: None,
            mail: None,
            phone: None,
            login_ip: None,
            bandwidth_limit: 0,
            data_limit: 0,
            expiry_date: None,
            status: 0,
            enabled: 1,
            total_rx: 0,
            total_tx: 0,
            last_login: None,
            note: None,
            wg_config: None,
            created_at: String::new(),
            updated_at: String::new(),
        };
        assert_eq!(user.display_name(), "User_7");
    }
}
