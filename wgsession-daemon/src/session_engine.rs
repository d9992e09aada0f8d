//! Session lifecycle engine.
//!
//! The heart of the daemon: owns the in-memory live-session map keyed by
//! peer public key and drives the `ABSENT -> OPEN -> OPEN -> CLOSED` state
//! machine described in the spec's component design from a stream of
//! Adapter snapshots, one tick at a time.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};

use wgsession_core::error::{DaemonError, Result};
use wgsession_core::types::{CloseReason, LiveSession, User, TIMESTAMP_FORMAT};
use wgsession_core::util::now_string;

use crate::adapter::{PeerSnapshot, PeerTableAdapter};
use crate::store::Store;

/// How often (seconds) the tick loop checks whether the system-stats
/// heartbeat is due. Matches the spec's 300-second threshold.
const STATS_HEARTBEAT_SECS: i64 = 300;

/// Narrow interface `UserAdmin` depends on, so it never imports the
/// concrete engine type (breaks the source's session_handler/user_manager
/// circular import the spec's design notes call out).
#[async_trait]
pub trait SessionEngine: Send + Sync {
    /// Close the live session for `user_id`, if one is open, for an
    /// administrative reason (kick or user deletion). A no-op, returning
    /// `Ok(())`, when no session is open — closing is idempotent.
    async fn close_for_admin(&self, user_id: i64, reason: CloseReason) -> Result<()>;

    /// The live-map key (public key) currently open for `user_id`, if any.
    fn live_pubkey_for_user(&self, user_id: i64) -> Option<String>;

    /// Number of sessions currently open (`len(live_map)`).
    fn live_count(&self) -> usize;
}

/// The concrete, tick-driven session engine.
pub struct WgSessionEngine {
    store: Arc<Store>,
    adapter: Arc<dyn PeerTableAdapter>,
    live: DashMap<String, LiveSession>,
    max_handshake_age: i64,
    last_stats_update: AtomicI64,
}

fn short(pubkey: &str) -> &str {
    &pubkey[..16.min(pubkey.len())]
}

fn duration_seconds(start_time: &str, now: &str) -> i64 {
    let parse = |s: &str| NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).ok();
    match (parse(start_time), parse(now)) {
        (Some(start), Some(now)) => (now - start).num_seconds().max(0),
        _ => 0,
    }
}

impl WgSessionEngine {
    /// Build a new engine with an empty live map.
    pub fn new(store: Arc<Store>, adapter: Arc<dyn PeerTableAdapter>, max_handshake_age: i64) -> Self {
        Self {
            store,
            adapter,
            live: DashMap::new(),
            max_handshake_age,
            last_stats_update: AtomicI64::new(0),
        }
    }

    /// Run one tick: sample the adapter, drive state transitions, close
    /// disappeared peers, and run the statistics heartbeat if due. Never
    /// propagates an error — a failing tick is logged and the loop moves on.
    #[instrument(skip(self))]
    pub async fn tick(&self) {
        if let Err(err) = self.tick_inner().await {
            warn!(error = %err, "tick failed, continuing to next interval");
        }
    }

    async fn tick_inner(&self) -> Result<()> {
        let snapshot = self.adapter.snapshot().await;
        let now_dt = Local::now();
        let now = now_dt.format(TIMESTAMP_FORMAT).to_string();
        let now_unix = now_dt.timestamp();

        for (pubkey, sample) in &snapshot {
            let fresh = sample.handshake_unix_seconds != 0
                && now_unix - sample.handshake_unix_seconds <= self.max_handshake_age;
            if fresh {
                self.handle_fresh(pubkey, sample, &now).await?;
            } else if self.live.contains_key(pubkey) {
                self.close_session_internal(pubkey, CloseReason::HandshakeTimeout, &now)
                    .await?;
            }
        }

        let disappeared: Vec<String> = self
            .live
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|pubkey| !snapshot.contains_key(pubkey))
            .collect();
        for pubkey in disappeared {
            self.close_session_internal(&pubkey, CloseReason::Disappeared, &now)
                .await?;
        }

        let last = self.last_stats_update.load(Ordering::Relaxed);
        if now_unix - last >= STATS_HEARTBEAT_SECS {
            if let Err(err) = self.update_system_stats(&now).await {
                warn!(error = %err, "system stats heartbeat failed");
            }
            self.last_stats_update.store(now_unix, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn handle_fresh(&self, pubkey: &str, sample: &PeerSnapshot, now: &str) -> Result<()> {
        if let Some(mut live) = self.live.get(pubkey).map(|entry| entry.clone()) {
            let mut delta_rx = sample.rx - live.start_rx;
            let mut delta_tx = sample.tx - live.start_tx;
            if delta_rx < 0 || delta_tx < 0 {
                debug!(pubkey = %short(pubkey), "counter reset detected, rebaselining");
                live.start_rx = sample.rx;
                live.start_tx = sample.tx;
                delta_rx = 0;
                delta_tx = 0;
            }
            live.last_handshake = sample.handshake_unix_seconds;
            self.store.update_event(live.event_id, delta_rx, delta_tx, now).await?;
            self.live.insert(pubkey.to_string(), live);
            return Ok(());
        }

        let user = self.resolve_or_create_user(pubkey, now).await?;
        if user.enabled == 0 {
            self.store.set_user_status(user.id, 0).await?;
            return Ok(());
        }

        let event_id = self
            .store
            .open_event(user.id, now, sample.endpoint.as_deref())
            .await?;
        self.store.set_user_status(user.id, 1).await?;
        self.live.insert(
            pubkey.to_string(),
            LiveSession {
                event_id,
                user_id: user.id,
                nickname: user.display_name(),
                start_rx: sample.rx,
                start_tx: sample.tx,
                last_handshake: sample.handshake_unix_seconds,
            },
        );
        info!(pubkey = %short(pubkey), user_id = user.id, event_id, "session opened");
        Ok(())
    }

    /// Resolve an existing user by pubkey, applying the expiry check, or
    /// create a new one with an auto-generated `User_<id>` nickname.
    async fn resolve_or_create_user(&self, pubkey: &str, now: &str) -> Result<User> {
        if let Some(mut user) = self.store.get_user_by_pubkey(pubkey).await? {
            if user.enabled != 0 {
                if let Some(expiry) = user.expiry_date.clone() {
                    if expiry.as_str() <= now {
                        self.store.disable_expired_user(user.id).await?;
                        user.enabled = 0;
                    }
                }
            }
            return Ok(user);
        }

        let user_id = self
            .store
            .insert_user(pubkey, None, None, None, None, 0, 0, None, None, None)
            .await?;
        let nickname = format!("User_{user_id}");
        self.store.set_nickname(user_id, &nickname).await?;
        self.store
            .get_user(user_id)
            .await?
            .ok_or_else(|| DaemonError::internal("just-inserted user row vanished"))
    }

    async fn close_session_internal(&self, pubkey: &str, reason: CloseReason, now: &str) -> Result<()> {
        let Some((_, live)) = self.live.remove(pubkey) else {
            return Ok(());
        };
        let event = self
            .store
            .get_event(live.event_id)
            .await?
            .ok_or_else(|| DaemonError::internal("live session's event row is missing"))?;
        let duration = duration_seconds(&event.start_time, now);
        self.store
            .close_session(
                live.event_id,
                live.user_id,
                event.session_rx,
                event.session_tx,
                now,
                duration,
            )
            .await?;
        info!(
            pubkey = %short(pubkey),
            user_id = live.user_id,
            reason = %reason,
            duration_seconds = duration,
            "session closed"
        );
        Ok(())
    }

    async fn update_system_stats(&self, now: &str) -> Result<()> {
        let today = &now[..10.min(now.len())];
        let totals = self.store.enabled_totals().await?;
        let avg = self.store.avg_session_duration_today(today).await?;
        let peak_concurrent = self.live.len() as i64;
        self.store
            .upsert_system_stats(
                today,
                totals.total,
                totals.online,
                totals.total_rx,
                totals.total_tx,
                peak_concurrent,
                avg,
            )
            .await?;
        debug!(today, peak_concurrent, "system stats heartbeat recorded");
        Ok(())
    }
}

#[async_trait]
impl SessionEngine for WgSessionEngine {
    #[instrument(skip(self))]
    async fn close_for_admin(&self, user_id: i64, reason: CloseReason) -> Result<()> {
        let now = now_string();
        if let Some(pubkey) = self.live_pubkey_for_user(user_id) {
            self.close_session_internal(&pubkey, reason, &now).await?;
        }
        Ok(())
    }

    fn live_pubkey_for_user(&self, user_id: i64) -> Option<String> {
        self.live
            .iter()
            .find(|entry| entry.value().user_id == user_id)
            .map(|entry| entry.key().clone())
    }

    fn live_count(&self) -> usize {
        self.live.len()
    }
}
