//! Durable relational store.
//!
//! Owns the SQLite schema (users/events/traffic_stats/system_stats) and
//! every transactional operation the rest of the daemon needs. The
//! connection is wrapped in a `tokio::sync::Mutex`, matching the
//! single-writer discipline the concurrency model asks for; cross-table
//! updates (session close) run inside one SQLite transaction so they are
//! atomic.

use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;
use tracing::instrument;
use wgsession_core::error::{DaemonError, Result};
use wgsession_core::types::{Event, SystemStat, TrafficStat, User};
use wgsession_core::util::now_string;

/// Filter applied to `/api/users/management` and the dashboard's online count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserStatusFilter {
    All,
    Online,
    Offline,
    Enabled,
    Disabled,
}

impl UserStatusFilter {
    /// Parse the `status` query parameter, defaulting unrecognized values to `All`.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.unwrap_or("all") {
            "online" => Self::Online,
            "offline" => Self::Offline,
            "enabled" => Self::Enabled,
            "disabled" => Self::Disabled,
            _ => Self::All,
        }
    }

    fn sql_clause(self) -> &'static str {
        match self {
            Self::All => "1=1",
            Self::Online => "status = 1",
            Self::Offline => "status = 0",
            Self::Enabled => "enabled = 1",
            Self::Disabled => "enabled = 0",
        }
    }

    /// The string echoed back in the `/api/users/management` filters block.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
        }
    }
}

/// Filter applied to `/api/events/history`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatusFilter {
    All,
    Online,
    Offline,
}

impl EventStatusFilter {
    /// Parse the `status` query parameter, defaulting unrecognized values to `All`.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.unwrap_or("all") {
            "online" => Self::Online,
            "offline" => Self::Offline,
            _ => Self::All,
        }
    }

    fn sql_clause(self) -> &'static str {
        match self {
            Self::All => "1=1",
            Self::Online => "status = 'ONLINE'",
            Self::Offline => "status = 'OFFLINE'",
        }
    }

    /// The string echoed back in the `/api/events/history` filters block.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

/// A page of rows plus the total row count the filter matched.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub rows: Vec<T>,
    pub total: i64,
}

/// Whitelisted, partial update to a `User` row. `Some(None)` clears a
/// nullable column; `None` leaves it untouched.
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub nickname: Option<Option<String>>,
    pub mail: Option<Option<String>>,
    pub phone: Option<Option<String>>,
    pub bandwidth_limit: Option<i64>,
    pub data_limit: Option<i64>,
    pub expiry_date: Option<Option<String>>,
    pub enabled: Option<i64>,
    pub note: Option<Option<String>>,
}

/// One date's summed daily traffic across all users, as fed to the chart endpoint.
#[derive(Debug, Clone)]
pub struct DailyTrafficRow {
    pub date: String,
    pub rx: i64,
    pub tx: i64,
    pub session_count: i64,
}

/// Totals computed over enabled users only.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnabledTotals {
    pub total: i64,
    pub online: i64,
    pub total_rx: i64,
    pub total_tx: i64,
}

/// Lifetime totals over every User row, regardless of `enabled`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LifetimeTotals {
    pub total_users: i64,
    pub enabled_users: i64,
    pub online_users: i64,
    pub total_rx: i64,
    pub total_tx: i64,
}

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get("id")?,
        peer_pubkey: row.get("peer_pubkey")?,
        client_ip: row.get("client_ip")?,
        nickname: row.get("nickname")?,
        mail: row.get("mail")?,
        phone: row.get("phone")?,
        login_ip: row.get("login_ip")?,
        bandwidth_limit: row.get("bandwidth_limit")?,
        data_limit: row.get("data_limit")?,
        expiry_date: row.get("expiry_date")?,
        status: row.get("status")?,
        enabled: row.get("enabled")?,
        total_rx: row.get("total_rx")?,
        total_tx: row.get("total_tx")?,
        last_login: row.get("last_login")?,
        note: row.get("note")?,
        wg_config: row.get("wg_config")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        start_time: row.get("start_time")?,
        end_time: row.get("end_time")?,
        last_update: row.get("last_update")?,
        session_rx: row.get("session_rx")?,
        session_tx: row.get("session_tx")?,
        login_ip: row.get("login_ip")?,
        endpoint_info: row.get("endpoint_info")?,
        status: row.get("status")?,
        duration_seconds: row.get("duration_seconds")?,
    })
}

fn row_to_traffic_stat(row: &Row<'_>) -> rusqlite::Result<TrafficStat> {
    Ok(TrafficStat {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        date: row.get("date")?,
        daily_rx: row.get("daily_rx")?,
        daily_tx: row.get("daily_tx")?,
        session_count: row.get("session_count")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_system_stat(row: &Row<'_>) -> rusqlite::Result<SystemStat> {
    Ok(SystemStat {
        id: row.get("id")?,
        date: row.get("date")?,
        total_users: row.get("total_users")?,
        active_users: row.get("active_users")?,
        total_rx: row.get("total_rx")?,
        total_tx: row.get("total_tx")?,
        peak_concurrent: row.get("peak_concurrent")?,
        avg_session_duration: row.get("avg_session_duration")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

/// The persistent store. Cheap to clone (wrap in `Arc`); the connection
/// itself is serialized behind a mutex.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if absent) the SQLite database at `path` and ensure
    /// the schema and indexes described in the external interface exist.
    #[instrument(skip(path))]
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a private in-memory database; used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                peer_pubkey TEXT NOT NULL UNIQUE,
                client_ip TEXT UNIQUE,
                nickname TEXT,
                mail TEXT,
                phone TEXT,
                login_ip TEXT,
                bandwidth_limit INTEGER NOT NULL DEFAULT 0 CHECK (bandwidth_limit >= 0),
                data_limit INTEGER NOT NULL DEFAULT 0 CHECK (data_limit >= 0),
                expiry_date TEXT,
                status INTEGER NOT NULL DEFAULT 0 CHECK (status IN (0, 1)),
                enabled INTEGER NOT NULL DEFAULT 1 CHECK (enabled IN (0, 1)),
                total_rx INTEGER NOT NULL DEFAULT 0,
                total_tx INTEGER NOT NULL DEFAULT 0,
                last_login TEXT,
                note TEXT,
                wg_config TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_users_pubkey ON users(peer_pubkey);
            CREATE INDEX IF NOT EXISTS idx_users_status_enabled ON users(status, enabled);

            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                start_time TEXT NOT NULL,
                end_time TEXT,
                last_update TEXT NOT NULL,
                session_rx INTEGER NOT NULL DEFAULT 0 CHECK (session_rx >= 0),
                session_tx INTEGER NOT NULL DEFAULT 0 CHECK (session_tx >= 0),
                login_ip TEXT,
                endpoint_info TEXT,
                status TEXT NOT NULL CHECK (status IN ('ONLINE', 'OFFLINE')),
                duration_seconds INTEGER NOT NULL DEFAULT 0 CHECK (duration_seconds >= 0)
            );
            CREATE INDEX IF NOT EXISTS idx_events_user_id ON events(user_id);
            CREATE INDEX IF NOT EXISTS idx_events_start_time ON events(start_time DESC);
            CREATE INDEX IF NOT EXISTS idx_events_status ON events(status);

            CREATE TABLE IF NOT EXISTS traffic_stats (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                date TEXT NOT NULL,
                daily_rx INTEGER NOT NULL DEFAULT 0,
                daily_tx INTEGER NOT NULL DEFAULT 0,
                session_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, date)
            );
            CREATE INDEX IF NOT EXISTS idx_traffic_date ON traffic_stats(date DESC);
            CREATE INDEX IF NOT EXISTS idx_traffic_user_date ON traffic_stats(user_id, date);

            CREATE TABLE IF NOT EXISTS system_stats (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                date TEXT NOT NULL UNIQUE,
                total_users INTEGER NOT NULL DEFAULT 0,
                active_users INTEGER NOT NULL DEFAULT 0,
                total_rx INTEGER NOT NULL DEFAULT 0,
                total_tx INTEGER NOT NULL DEFAULT 0,
                peak_concurrent INTEGER NOT NULL DEFAULT 0,
                avg_session_duration INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_system_stats_date ON system_stats(date DESC);
            "#,
        )?;
        Ok(())
    }

    // ---- Users ---------------------------------------------------------

    /// Insert a new user row; returns the generated id.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_user(
        &self,
        pubkey: &str,
        client_ip: Option<&str>,
        nickname: Option<&str>,
        mail: Option<&str>,
        phone: Option<&str>,
        bandwidth_limit: i64,
        data_limit: i64,
        expiry_date: Option<&str>,
        note: Option<&str>,
        wg_config: Option<&str>,
    ) -> Result<i64> {
        let now = now_string();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO users (peer_pubkey, client_ip, nickname, mail, phone, \
             bandwidth_limit, data_limit, expiry_date, status, enabled, total_rx, total_tx, \
             note, wg_config, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, 1, 0, 0, ?9, ?10, ?11, ?11)",
            params![
                pubkey,
                client_ip,
                nickname,
                mail,
                phone,
                bandwidth_limit,
                data_limit,
                expiry_date,
                note,
                wg_config,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Look up a user by surrogate id.
    pub async fn get_user(&self, id: i64) -> Result<Option<User>> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT * FROM users WHERE id = ?1", params![id], row_to_user)
            .optional()
            .map_err(DaemonError::from)
    }

    /// Look up a user by public key.
    pub async fn get_user_by_pubkey(&self, pubkey: &str) -> Result<Option<User>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT * FROM users WHERE peer_pubkey = ?1",
            params![pubkey],
            row_to_user,
        )
        .optional()
        .map_err(DaemonError::from)
    }

    /// All users, most recently created first. Backs the raw `/api/users` endpoint.
    pub async fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM users ORDER BY id DESC")?;
        let rows = stmt.query_map([], row_to_user)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(DaemonError::from)
    }

    /// Every assigned `client_ip`, for the IP allocator.
    pub async fn list_client_ips(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT client_ip FROM users WHERE client_ip IS NOT NULL")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(DaemonError::from)
    }

    /// Paginated, searchable user listing for `/api/users/management`.
    pub async fn list_users_management(
        &self,
        page: i64,
        per_page: i64,
        search: Option<&str>,
        status: UserStatusFilter,
    ) -> Result<Page<User>> {
        let conn = self.conn.lock().await;
        let search_clause = if search.is_some() {
            "AND (nickname LIKE ?1 OR peer_pubkey LIKE ?1 OR mail LIKE ?1 OR client_ip LIKE ?1)"
        } else {
            ""
        };
        let where_sql = format!("WHERE {} {}", status.sql_clause(), search_clause);
        let count_sql = format!("SELECT COUNT(*) FROM users {where_sql}");
        let select_sql = format!(
            "SELECT * FROM users {where_sql} ORDER BY id DESC LIMIT {per_page} OFFSET {}",
            (page - 1) * per_page
        );

        let like = search.map(|s| format!("%{s}%"));
        let total: i64 = if let Some(like) = &like {
            conn.query_row(&count_sql, params![like], |row| row.get(0))?
        } else {
            conn.query_row(&count_sql, [], |row| row.get(0))?
        };
        let mut stmt = conn.prepare(&select_sql)?;
        let rows = if let Some(like) = &like {
            stmt.query_map(params![like], row_to_user)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            stmt.query_map([], row_to_user)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        Ok(Page { rows, total })
    }

    /// Apply a whitelisted partial update to a user's mutable fields.
    pub async fn update_user(&self, id: i64, update: &UserUpdate) -> Result<()> {
        let now = now_string();
        let conn = self.conn.lock().await;
        let mut sets = vec!["updated_at = ?1".to_string()];
        // rusqlite params! can't build a dynamic list cleanly; collect boxed values instead.
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(now)];
        let mut push = |sql: &str, value: Box<dyn rusqlite::ToSql>| {
            values.push(value);
            sets.push(format!("{sql} = ?{}", values.len()));
        };
        if let Some(v) = &update.nickname {
            push("nickname", Box::new(v.clone()));
        }
        if let Some(v) = &update.mail {
            push("mail", Box::new(v.clone()));
        }
        if let Some(v) = &update.phone {
            push("phone", Box::new(v.clone()));
        }
        if let Some(v) = update.bandwidth_limit {
            push("bandwidth_limit", Box::new(v));
        }
        if let Some(v) = update.data_limit {
            push("data_limit", Box::new(v));
        }
        if let Some(v) = &update.expiry_date {
            push("expiry_date", Box::new(v.clone()));
        }
        if let Some(v) = update.enabled {
            push("enabled", Box::new(v));
        }
        if let Some(v) = &update.note {
            push("note", Box::new(v.clone()));
        }
        values.push(Box::new(id));
        let id_placeholder = values.len();
        let sql = format!(
            "UPDATE users SET {} WHERE id = ?{id_placeholder}",
            sets.join(", ")
        );
        let params_ref: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        conn.execute(&sql, params_ref.as_slice())?;
        Ok(())
    }

    /// Set the auto-generated `User_<id>` nickname for a peer the Session
    /// Engine discovered and registered without going through User Admin.
    pub async fn set_nickname(&self, id: i64, nickname: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE users SET nickname = ?1, updated_at = ?2 WHERE id = ?3",
            params![nickname, now_string(), id],
        )?;
        Ok(())
    }

    /// Set `users.status` (flipped only by the Session Engine).
    pub async fn set_user_status(&self, id: i64, status: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE users SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status, now_string(), id],
        )?;
        Ok(())
    }

    /// Disable a user whose `expiry_date` has passed.
    pub async fn disable_expired_user(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE users SET enabled = 0, updated_at = ?1 WHERE id = ?2",
            params![now_string(), id],
        )?;
        Ok(())
    }

    /// Reset a user's lifetime rx/tx counters to zero.
    pub async fn reset_user_counters(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE users SET total_rx = 0, total_tx = 0, updated_at = ?1 WHERE id = ?2",
            params![now_string(), id],
        )?;
        Ok(())
    }

    /// Delete a user row; cascades to events and traffic_stats.
    pub async fn delete_user(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM users WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Lifetime totals computed over every user row, regardless of `enabled`.
    pub async fn lifetime_totals(&self) -> Result<LifetimeTotals> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT COUNT(*), \
                    COALESCE(SUM(enabled), 0), \
                    COALESCE(SUM(status), 0), \
                    COALESCE(SUM(total_rx), 0), \
                    COALESCE(SUM(total_tx), 0) \
             FROM users",
            [],
            |row| {
                Ok(LifetimeTotals {
                    total_users: row.get(0)?,
                    enabled_users: row.get(1)?,
                    online_users: row.get(2)?,
                    total_rx: row.get(3)?,
                    total_tx: row.get(4)?,
                })
            },
        )
        .map_err(DaemonError::from)
    }

    /// Totals computed over enabled users only; feeds the system-stats heartbeat.
    pub async fn enabled_totals(&self) -> Result<EnabledTotals> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(status), 0), COALESCE(SUM(total_rx), 0), \
                    COALESCE(SUM(total_tx), 0) \
             FROM users WHERE enabled = 1",
            [],
            |row| {
                Ok(EnabledTotals {
                    total: row.get(0)?,
                    online: row.get(1)?,
                    total_rx: row.get(2)?,
                    total_tx: row.get(3)?,
                })
            },
        )
        .map_err(DaemonError::from)
    }

    // ---- Events ---------------------------------------------------------

    /// Open a new Event for `user_id`. Returns the new event's id.
    pub async fn open_event(&self, user_id: i64, now: &str, endpoint_info: Option<&str>) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO events (user_id, start_time, end_time, last_update, session_rx, \
             session_tx, login_ip, endpoint_info, status, duration_seconds) \
             VALUES (?1, ?2, NULL, ?2, 0, 0, NULL, ?3, 'ONLINE', 0)",
            params![user_id, now, endpoint_info],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Update an open event's running session counters.
    pub async fn update_event(&self, event_id: i64, session_rx: i64, session_tx: i64, now: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE events SET session_rx = ?1, session_tx = ?2, last_update = ?3 WHERE id = ?4",
            params![session_rx, session_tx, now, event_id],
        )?;
        Ok(())
    }

    /// Fetch a single event row by id.
    pub async fn get_event(&self, id: i64) -> Result<Option<Event>> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT * FROM events WHERE id = ?1", params![id], row_to_event)
            .optional()
            .map_err(DaemonError::from)
    }

    /// The currently open event for a user, if any.
    pub async fn get_open_event_for_user(&self, user_id: i64) -> Result<Option<Event>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT * FROM events WHERE user_id = ?1 AND end_time IS NULL",
            params![user_id],
            row_to_event,
        )
        .optional()
        .map_err(DaemonError::from)
    }

    /// Close a session: record lifetime totals, the daily rollup, and the
    /// event row itself in one transaction. `rx`/`tx` must be the event's
    /// already-tracked counters (never an override).
    pub async fn close_session(
        &self,
        event_id: i64,
        user_id: i64,
        rx: i64,
        tx: i64,
        end_time: &str,
        duration_seconds: i64,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx_guard = conn.transaction()?;
        tx_guard.execute(
            "UPDATE events SET end_time = ?1, status = 'OFFLINE', duration_seconds = ?2 WHERE id = ?3",
            params![end_time, duration_seconds, event_id],
        )?;
        tx_guard.execute(
            "UPDATE users SET total_rx = total_rx + ?1, total_tx = total_tx + ?2, \
             last_login = ?3, status = 0, updated_at = ?3 WHERE id = ?4",
            params![rx, tx, end_time, user_id],
        )?;
        let date = &end_time[..10.min(end_time.len())];
        let now = now_string();
        tx_guard.execute(
            "INSERT INTO traffic_stats (user_id, date, daily_rx, daily_tx, session_count, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5) \
             ON CONFLICT(user_id, date) DO UPDATE SET \
               daily_rx = daily_rx + excluded.daily_rx, \
               daily_tx = daily_tx + excluded.daily_tx, \
               session_count = session_count + 1, \
               updated_at = excluded.updated_at",
            params![user_id, date, rx, tx, now],
        )?;
        tx_guard.commit()?;
        Ok(())
    }

    /// Most recent event per user (one row per `user_id`), newest-first, capped at 100.
    pub async fn latest_event_per_user(&self) -> Result<Vec<Event>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT e.* FROM events e \
             INNER JOIN (SELECT user_id, MAX(id) AS max_id FROM events GROUP BY user_id) latest \
               ON e.user_id = latest.user_id AND e.id = latest.max_id \
             ORDER BY e.status DESC, e.last_update DESC \
             LIMIT 100",
        )?;
        let rows = stmt.query_map([], row_to_event)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(DaemonError::from)
    }

    /// Paginated event history, optionally filtered by user and status.
    pub async fn events_history(
        &self,
        page: i64,
        per_page: i64,
        user_id: Option<i64>,
        status: EventStatusFilter,
    ) -> Result<Page<Event>> {
        let conn = self.conn.lock().await;
        let user_clause = if user_id.is_some() { "AND user_id = ?1" } else { "" };
        let where_sql = format!("WHERE {} {}", status.sql_clause(), user_clause);
        let count_sql = format!("SELECT COUNT(*) FROM events {where_sql}");
        let select_sql = format!(
            "SELECT * FROM events {where_sql} ORDER BY start_time DESC LIMIT {per_page} OFFSET {}",
            (page - 1) * per_page
        );
        let total: i64 = if let Some(uid) = user_id {
            conn.query_row(&count_sql, params![uid], |row| row.get(0))?
        } else {
            conn.query_row(&count_sql, [], |row| row.get(0))?
        };
        let mut stmt = conn.prepare(&select_sql)?;
        let rows = if let Some(uid) = user_id {
            stmt.query_map(params![uid], row_to_event)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            stmt.query_map([], row_to_event)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        Ok(Page { rows, total })
    }

    /// Average `duration_seconds` over today's events with `duration_seconds > 0`.
    pub async fn avg_session_duration_today(&self, today: &str) -> Result<i64> {
        let conn = self.conn.lock().await;
        let like = format!("{today}%");
        let avg: Option<f64> = conn.query_row(
            "SELECT AVG(duration_seconds) FROM events \
             WHERE duration_seconds > 0 AND start_time LIKE ?1",
            params![like],
            |row| row.get(0),
        )?;
        Ok(avg.unwrap_or(0.0).round() as i64)
    }

    /// The start_time of the very first event ever recorded, for uptime display.
    pub async fn first_event_start(&self) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT MIN(start_time) FROM events",
            [],
            |row| row.get(0),
        )
        .map_err(DaemonError::from)
    }

    // ---- TrafficStat / SystemStat ----------------------------------------

    /// Sum of today's `daily_rx`/`daily_tx` across all users.
    pub async fn today_traffic_totals(&self, today: &str) -> Result<(i64, i64)> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT COALESCE(SUM(daily_rx), 0), COALESCE(SUM(daily_tx), 0) \
             FROM traffic_stats WHERE date = ?1",
            params![today],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(DaemonError::from)
    }

    /// Daily traffic summed across all users, most recent `days` dates, chronological order.
    pub async fn traffic_chart(&self, days: i64) -> Result<Vec<DailyTrafficRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT date, SUM(daily_rx), SUM(daily_tx), SUM(session_count) \
             FROM traffic_stats GROUP BY date ORDER BY date DESC LIMIT ?1",
        )?;
        let mut rows = stmt
            .query_map(params![days], |row| {
                Ok(DailyTrafficRow {
                    date: row.get(0)?,
                    rx: row.get(1)?,
                    tx: row.get(2)?,
                    session_count: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.reverse();
        Ok(rows)
    }

    /// Upsert today's system-wide rollup, per the accumulate/replace/max rules in §4.2.
    pub async fn upsert_system_stats(
        &self,
        date: &str,
        total_users: i64,
        active_users: i64,
        total_rx: i64,
        total_tx: i64,
        peak_concurrent: i64,
        avg_session_duration: i64,
    ) -> Result<()> {
        let now = now_string();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO system_stats (date, total_users, active_users, total_rx, total_tx, \
             peak_concurrent, avg_session_duration, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8) \
             ON CONFLICT(date) DO UPDATE SET \
               total_users = excluded.total_users, \
               active_users = excluded.active_users, \
               total_rx = excluded.total_rx, \
               total_tx = excluded.total_tx, \
               peak_concurrent = MAX(system_stats.peak_concurrent, excluded.peak_concurrent), \
               avg_session_duration = excluded.avg_session_duration, \
               updated_at = excluded.updated_at",
            params![
                date,
                total_users,
                active_users,
                total_rx,
                total_tx,
                peak_concurrent,
                avg_session_duration,
                now,
            ],
        )?;
        Ok(())
    }

    /// The system-stats row for one date, if it has been rolled up yet.
    pub async fn get_system_stat(&self, date: &str) -> Result<Option<SystemStat>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT * FROM system_stats WHERE date = ?1",
            params![date],
            row_to_system_stat,
        )
        .optional()
        .map_err(DaemonError::from)
    }

    /// System-stats rows over the most recent `days` dates, chronological order.
    pub async fn system_stats_window(&self, days: i64) -> Result<Vec<SystemStat>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT * FROM system_stats ORDER BY date DESC LIMIT ?1")?;
        let mut rows = stmt
            .query_map(params![days], row_to_system_stat)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.reverse();
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_user() -> (Store, i64) {
        let store = Store::open_in_memory().expect("open in-memory store");
        let id = store
            .insert_user(
                &"A".repeat(44),
                Some("10.0.0.2"),
                Some("User_1"),
                None,
                None,
                0,
                0,
                None,
                None,
                Some("[Interface]\n"),
            )
            .await
            .expect("insert user");
        (store, id)
    }

    #[tokio::test]
    async fn insert_and_fetch_user_round_trips() {
        let (store, id) = store_with_user().await;
        let user = store.get_user(id).await.unwrap().unwrap();
        assert_eq!(user.peer_pubkey, "A".repeat(44));
        assert_eq!(user.client_ip.as_deref(), Some("10.0.0.2"));
        assert_eq!(user.enabled, 1);
        assert_eq!(user.status, 0);
    }

    #[tokio::test]
    async fn session_close_updates_user_totals_and_daily_traffic() {
        let (store, user_id) = store_with_user().await;
        let event_id = store.open_event(user_id, "2026-07-31 10:00:00", None).await.unwrap();
        store
            .update_event(event_id, 2000, 1000, "2026-07-31 10:00:10")
            .await
            .unwrap();
        store
            .close_session(event_id, user_id, 2000, 1000, "2026-07-31 10:03:20", 200)
            .await
            .unwrap();

        let user = store.get_user(user_id).await.unwrap().unwrap();
        assert_eq!(user.total_rx, 2000);
        assert_eq!(user.total_tx, 1000);
        assert_eq!(user.status, 0);

        let event = store.get_open_event_for_user(user_id).await.unwrap();
        assert!(event.is_none());

        let (rx, tx) = store.today_traffic_totals("2026-07-31").await.unwrap();
        assert_eq!(rx, 2000);
        assert_eq!(tx, 1000);
    }

    #[tokio::test]
    async fn delete_user_cascades_to_events() {
        let (store, user_id) = store_with_user().await;
        let event_id = store.open_event(user_id, "2026-07-31 10:00:00", None).await.unwrap();
        store.delete_user(user_id).await.unwrap();
        assert!(store.get_user(user_id).await.unwrap().is_none());
        let conn = store.conn.lock().await;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM events WHERE id = ?1", params![event_id], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn traffic_stats_upsert_accumulates_across_multiple_closes_same_day() {
        let (store, user_id) = store_with_user().await;
        for _ in 0..2 {
            let event_id = store.open_event(user_id, "2026-07-31 10:00:00", None).await.unwrap();
            store
                .close_session(event_id, user_id, 500, 250, "2026-07-31 10:05:00", 300)
                .await
                .unwrap();
        }
        let (rx, tx) = store.today_traffic_totals("2026-07-31").await.unwrap();
        assert_eq!(rx, 1000);
        assert_eq!(tx, 500);
    }

    #[tokio::test]
    async fn system_stats_upsert_takes_max_of_peak_concurrent() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_system_stats("2026-07-31", 1, 1, 100, 100, 5, 10)
            .await
            .unwrap();
        store
            .upsert_system_stats("2026-07-31", 1, 1, 200, 200, 3, 20)
            .await
            .unwrap();
        let stat = store.get_system_stat("2026-07-31").await.unwrap().unwrap();
        assert_eq!(stat.peak_concurrent, 5);
        assert_eq!(stat.total_rx, 200);
        assert_eq!(stat.avg_session_duration, 20);
    }

    #[tokio::test]
    async fn management_pagination_clamps_and_filters() {
        let (store, _id) = store_with_user().await;
        let page = store
            .list_users_management(1, 10, None, UserStatusFilter::Enabled)
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.rows.len(), 1);

        let page = store
            .list_users_management(1, 10, None, UserStatusFilter::Disabled)
            .await
            .unwrap();
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn open_on_disk_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("wireguard.db");
        let path_str = path.to_str().expect("utf8 path").to_string();

        {
            let store = Store::open(&path_str).expect("open database file");
            store
                .insert_user(&"E".repeat(44), Some("10.0.0.2"), None, None, None, 0, 0, None, None, None)
                .await
                .expect("insert user");
        }

        let store = Store::open(&path_str).expect("reopen database file");
        let user = store.get_user_by_pubkey(&"E".repeat(44)).await.unwrap();
        assert!(user.is_some());
    }
}
