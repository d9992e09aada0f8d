//! Statistics aggregator.
//!
//! Read-only views over the Store consumed by the HTTP API: the
//! dashboard's lifetime/today summary and the traffic-chart window. The
//! session-close and system-stats *writes* this component is responsible
//! for per the spec live on [`crate::store::Store`] and
//! [`crate::session_engine::WgSessionEngine`] respectively — both are
//! thin wrappers over the same pre-composed upserts this module reads
//! back from.

use std::sync::Arc;

use wgsession_core::error::Result;
use wgsession_core::util::today_string;

use crate::store::{DailyTrafficRow, Store};

/// Everything `/api/dashboard` needs before the HTTP layer nests it into
/// the `summary`/`traffic` JSON envelope.
#[derive(Debug, Clone)]
pub struct DashboardData {
    pub registered_users: i64,
    pub enabled_users: i64,
    pub online_users: i64,
    pub lifetime_rx: i64,
    pub lifetime_tx: i64,
    pub today_rx: i64,
    pub today_tx: i64,
    pub uptime_start: Option<String>,
}

/// `/api/traffic/chart`'s payload before the HTTP layer wraps it in `{data, period}`.
#[derive(Debug, Clone)]
pub struct TrafficChart {
    pub rows: Vec<DailyTrafficRow>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

/// Read-only statistics views, backed by one [`Store`].
pub struct StatisticsAggregator {
    store: Arc<Store>,
}

impl StatisticsAggregator {
    /// Build a new aggregator over the given store.
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Assemble the dashboard's lifetime-plus-today summary.
    ///
    /// Lifetime totals are computed over *every* user row regardless of
    /// `enabled` (a disabled user's historical bytes still count), while
    /// today's totals come from the daily traffic rollup, summed across
    /// all users.
    pub async fn dashboard(&self) -> Result<DashboardData> {
        let lifetime = self.store.lifetime_totals().await?;
        let today = today_string();
        let (today_rx, today_tx) = self.store.today_traffic_totals(&today).await?;
        let uptime_start = self.store.first_event_start().await?;
        Ok(DashboardData {
            registered_users: lifetime.total_users,
            enabled_users: lifetime.enabled_users,
            online_users: lifetime.online_users,
            lifetime_rx: lifetime.total_rx,
            lifetime_tx: lifetime.total_tx,
            today_rx,
            today_tx,
            uptime_start,
        })
    }

    /// The last `days` dates of system-wide daily traffic, chronological order.
    pub async fn traffic_chart(&self, days: i64) -> Result<TrafficChart> {
        let rows = self.store.traffic_chart(days).await?;
        let start_date = rows.first().map(|r| r.date.clone());
        let end_date = rows.last().map(|r| r.date.clone());
        Ok(TrafficChart {
            rows,
            start_date,
            end_date,
        })
    }
}

/// Render a whole-second duration as the dashboard's `"{d}d {h}h {m}m"` uptime phrasing.
pub fn uptime_readable(total_seconds: i64) -> String {
    let total_seconds = total_seconds.max(0);
    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    format!("{days}d {hours}h {minutes}m")
}

/// Seconds between `start` and `now` (both `TIMESTAMP_FORMAT`), or `0` if
/// `start` is absent or unparseable.
pub fn uptime_seconds(start: Option<&str>, now: &str) -> i64 {
    use chrono::NaiveDateTime;
    use wgsession_core::types::TIMESTAMP_FORMAT;

    let Some(start) = start else { return 0 };
    let parse = |s: &str| NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).ok();
    match (parse(start), parse(now)) {
        (Some(start), Some(now)) => (now - start).num_seconds().max(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_readable_drops_no_components() {
        assert_eq!(uptime_readable(0), "0d 0h 0m");
        assert_eq!(uptime_readable(90_061), "1d 1h 1m");
    }

    #[test]
    fn uptime_seconds_is_zero_with_no_start() {
        assert_eq!(uptime_seconds(None, "2026-07-31 00:00:00"), 0);
    }

    #[test]
    fn uptime_seconds_computes_difference() {
        let secs = uptime_seconds(Some("2026-07-31 00:00:00"), "2026-07-31 01:00:00");
        assert_eq!(secs, 3600);
    }

    #[tokio::test]
    async fn dashboard_reflects_lifetime_and_today_totals() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let user_id = store
            .insert_user(&"D".repeat(44), Some("10.0.0.2"), None, None, None, 0, 0, None, None, None)
            .await
            .unwrap();
        let today = today_string();
        let start = format!("{today} 10:00:00");
        let end = format!("{today} 10:05:00");
        let event_id = store.open_event(user_id, &start, None).await.unwrap();
        store.close_session(event_id, user_id, 500, 250, &end, 300).await.unwrap();

        let aggregator = StatisticsAggregator::new(store);
        let dashboard = aggregator.dashboard().await.unwrap();
        assert_eq!(dashboard.registered_users, 1);
        assert_eq!(dashboard.lifetime_rx, 500);
        assert_eq!(dashboard.today_rx, 500);
        assert_eq!(dashboard.today_tx, 250);
    }
}
