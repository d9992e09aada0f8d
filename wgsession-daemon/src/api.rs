//! JSON HTTP API.
//!
//! Read endpoints (dashboard, status, users, events, traffic chart) and
//! mutation endpoints (CRUD, enable/disable/reset/kick) over `axum`.
//! Handlers stay short: parse inputs, delegate to the Store/Session
//! Engine/User Admin, return the JSON envelope. Every response is
//! pretty-printed JSON, decorated with open CORS headers for the
//! companion dashboard.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use wgsession_core::error::DaemonError;
use wgsession_core::types::{Event, User};
use wgsession_core::util::{readable_bytes, readable_duration};
use wgsession_core::DaemonConfig;

use crate::adapter::PeerTableAdapter;
use crate::session_engine::SessionEngine;
use crate::stats::{self, StatisticsAggregator};
use crate::store::{EventStatusFilter, Store, UserStatusFilter, UserUpdate};
use crate::user_admin::{CreateUserInput, UserAdmin};

/// `axum::State` shared by every handler: cheap-to-clone handles onto the
/// Store, Session Engine, Adapter, User Admin, and Statistics Aggregator.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<Store>,
    pub engine: Arc<dyn SessionEngine>,
    pub adapter: Arc<dyn PeerTableAdapter>,
    pub admin: Arc<UserAdmin>,
    pub stats: Arc<StatisticsAggregator>,
    pub config: Arc<DaemonConfig>,
}

/// A `Json`-alike that serializes pretty-printed, per the spec's "every
/// response JSON, UTF-8, pretty-printed".
struct PrettyJson(Value);

impl IntoResponse for PrettyJson {
    fn into_response(self) -> Response {
        match serde_json::to_vec_pretty(&self.0) {
            Ok(bytes) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                bytes,
            )
                .into_response(),
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response(),
        }
    }
}

/// Wraps [`DaemonError`] so it can be returned directly from a handler.
/// Validation/Conflict map to 400, NotFound to 404, everything else to 500.
struct ApiError(DaemonError);

impl From<DaemonError> for ApiError {
    fn from(err: DaemonError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DaemonError::Validation(_) | DaemonError::Conflict(_) => StatusCode::BAD_REQUEST,
            DaemonError::NotFound(_) => StatusCode::NOT_FOUND,
            DaemonError::Adapter(_) | DaemonError::Store(_) | DaemonError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = match serde_json::to_vec_pretty(&json!({ "error": self.0.to_string() })) {
            Ok(bytes) => bytes,
            Err(_) => br#"{"error":"internal error"}"#.to_vec(),
        };
        (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
    }
}

type ApiResult = Result<PrettyJson, ApiError>;

fn user_json(user: &User) -> Value {
    json!({
        "id": user.id,
        "peer_pubkey": user.peer_pubkey,
        "client_ip": user.client_ip,
        "nickname": user.nickname,
        "mail": user.mail,
        "phone": user.phone,
        "login_ip": user.login_ip,
        "bandwidth_limit": user.bandwidth_limit,
        "data_limit": user.data_limit,
        "expiry_date": user.expiry_date,
        "status": user.status,
        "enabled": user.enabled,
        "total_rx": user.total_rx,
        "total_rx_readable": readable_bytes(user.total_rx),
        "total_tx": user.total_tx,
        "total_tx_readable": readable_bytes(user.total_tx),
        "last_login": user.last_login,
        "note": user.note,
        "created_at": user.created_at,
        "updated_at": user.updated_at,
    })
}

fn pubkey_short(pubkey: &str) -> String {
    format!("{}...", &pubkey[..16.min(pubkey.len())])
}

async fn management_row(store: &Store, user: &User) -> Value {
    let (session_rx, session_tx) = if user.status == 1 {
        match store.get_open_event_for_user(user.id).await {
            Ok(Some(event)) => (event.session_rx, event.session_tx),
            _ => (0, 0),
        }
    } else {
        (0, 0)
    };
    json!({
        "id": user.id,
        "peer_pubkey": user.peer_pubkey,
        "peer_pubkey_short": pubkey_short(&user.peer_pubkey),
        "nickname": user.nickname,
        "mail": user.mail,
        "phone": user.phone,
        "client_ip": user.client_ip,
        "bandwidth_limit": user.bandwidth_limit,
        "data_limit": user.data_limit,
        "expiry_date": user.expiry_date,
        "status": user.status,
        "enabled": user.enabled,
        "is_online": user.status == 1,
        "total_rx": user.total_rx,
        "total_rx_readable": readable_bytes(user.total_rx),
        "total_tx": user.total_tx,
        "total_tx_readable": readable_bytes(user.total_tx),
        "session_rx": session_rx,
        "session_rx_readable": readable_bytes(session_rx),
        "session_tx": session_tx,
        "session_tx_readable": readable_bytes(session_tx),
        "last_login": user.last_login,
        "note": user.note,
        "created_at": user.created_at,
        "updated_at": user.updated_at,
    })
}

async fn event_row(store: &Store, event: &Event, with_duration_readable: bool) -> Value {
    let user = store.get_user(event.user_id).await.ok().flatten();
    let (nickname, short) = match &user {
        Some(u) => (u.display_name(), pubkey_short(&u.peer_pubkey)),
        None => ("unknown".to_string(), String::new()),
    };
    let mut value = json!({
        "id": event.id,
        "user_id": event.user_id,
        "nickname": nickname,
        "peer_pubkey_short": short,
        "start_time": event.start_time,
        "end_time": event.end_time,
        "last_update": event.last_update,
        "session_rx": event.session_rx,
        "session_rx_readable": readable_bytes(event.session_rx),
        "session_tx": event.session_tx,
        "session_tx_readable": readable_bytes(event.session_tx),
        "login_ip": event.login_ip,
        "endpoint_info": event.endpoint_info,
        "status": event.status,
        "duration_seconds": event.duration_seconds,
    });
    if with_duration_readable {
        value["duration_readable"] = Value::String(readable_duration(event.duration_seconds));
    }
    value
}

fn pagination_block(page: i64, per_page: i64, total: i64) -> Value {
    let total_pages = if total == 0 { 0 } else { (total + per_page - 1) / per_page };
    json!({
        "current_page": page,
        "per_page": per_page,
        "total": total,
        "total_pages": total_pages,
        "has_next": page < total_pages,
        "has_prev": page > 1,
    })
}

// ---- Handlers -------------------------------------------------------------

async fn get_status(State(state): State<ApiState>) -> ApiResult {
    let status = state.adapter.interface_status().await;
    let enabled = state.store.enabled_totals().await?;
    let live_count = state.engine.live_count();
    Ok(PrettyJson(json!({
        "system": {
            "interface": state.config.interface,
            "status": status.as_str(),
            "max_handshake_age": state.config.max_handshake_age,
            "monitoring": true,
        },
        "users": {
            "total": enabled.total,
            "online": live_count,
            "active_sessions": live_count,
        },
        "timestamp": wgsession_core::util::now_string(),
    })))
}

async fn get_dashboard(State(state): State<ApiState>) -> ApiResult {
    let data = state.stats.dashboard().await?;
    let now = wgsession_core::util::now_string();
    let uptime_secs = stats::uptime_seconds(data.uptime_start.as_deref(), &now);
    let uptime_hours = (uptime_secs as f64 / 3600.0 * 10.0).round() / 10.0;
    let live_count = state.engine.live_count();
    Ok(PrettyJson(json!({
        "summary": {
            "registered_users": data.registered_users,
            "enabled_users": data.enabled_users,
            "online_users": data.online_users,
            "active_sessions": live_count,
            "uptime_hours": uptime_hours,
            "uptime_readable": stats::uptime_readable(uptime_secs),
        },
        "traffic": {
            "lifetime_rx": data.lifetime_rx,
            "lifetime_rx_readable": readable_bytes(data.lifetime_rx),
            "lifetime_tx": data.lifetime_tx,
            "lifetime_tx_readable": readable_bytes(data.lifetime_tx),
            "today_rx": data.today_rx,
            "today_rx_readable": readable_bytes(data.today_rx),
            "today_tx": data.today_tx,
            "today_tx_readable": readable_bytes(data.today_tx),
        },
    })))
}

async fn get_users(State(state): State<ApiState>) -> ApiResult {
    let users = state.store.list_users().await?;
    let rows: Vec<Value> = users.iter().map(user_json).collect();
    Ok(PrettyJson(json!({ "users": rows })))
}

#[derive(Debug, Deserialize, Default)]
struct ManagementQuery {
    page: Option<i64>,
    per_page: Option<i64>,
    search: Option<String>,
    status: Option<String>,
}

async fn get_users_management(State(state): State<ApiState>, Query(q): Query<ManagementQuery>) -> ApiResult {
    let page = q.page.unwrap_or(1).max(1);
    let per_page = q.per_page.unwrap_or(20).clamp(1, 100);
    let status = UserStatusFilter::parse(q.status.as_deref());
    let result = state
        .store
        .list_users_management(page, per_page, q.search.as_deref(), status)
        .await?;
    let mut rows = Vec::with_capacity(result.rows.len());
    for user in &result.rows {
        rows.push(management_row(&state.store, user).await);
    }
    Ok(PrettyJson(json!({
        "users": rows,
        "pagination": pagination_block(page, per_page, result.total),
        "filters": { "search": q.search, "status": status.as_str() },
    })))
}

async fn get_events(State(state): State<ApiState>) -> ApiResult {
    let events = state.store.latest_event_per_user().await?;
    let mut rows = Vec::with_capacity(events.len());
    for event in &events {
        rows.push(event_row(&state.store, event, false).await);
    }
    Ok(PrettyJson(json!({ "events": rows })))
}

#[derive(Debug, Deserialize, Default)]
struct EventsHistoryQuery {
    page: Option<i64>,
    per_page: Option<i64>,
    user_id: Option<i64>,
    status: Option<String>,
}

async fn get_events_history(State(state): State<ApiState>, Query(q): Query<EventsHistoryQuery>) -> ApiResult {
    let page = q.page.unwrap_or(1).max(1);
    let per_page = q.per_page.unwrap_or(20).clamp(1, 100);
    let status = EventStatusFilter::parse(q.status.as_deref());
    let result = state
        .store
        .events_history(page, per_page, q.user_id, status)
        .await?;
    let mut rows = Vec::with_capacity(result.rows.len());
    for event in &result.rows {
        rows.push(event_row(&state.store, event, true).await);
    }
    Ok(PrettyJson(json!({
        "events": rows,
        "pagination": pagination_block(page, per_page, result.total),
        "filters": { "user_id": q.user_id, "status": status.as_str() },
    })))
}

#[derive(Debug, Deserialize, Default)]
struct ChartQuery {
    days: Option<i64>,
}

async fn get_traffic_chart(State(state): State<ApiState>, Query(q): Query<ChartQuery>) -> ApiResult {
    let days = q.days.unwrap_or(7).clamp(1, 365);
    let chart = state.stats.traffic_chart(days).await?;
    let data: Vec<Value> = chart
        .rows
        .iter()
        .map(|row| {
            json!({
                "date": row.date,
                "rx": row.rx,
                "rx_readable": readable_bytes(row.rx),
                "tx": row.tx,
                "tx_readable": readable_bytes(row.tx),
                "session_count": row.session_count,
            })
        })
        .collect();
    Ok(PrettyJson(json!({
        "data": data,
        "period": { "days": days, "start_date": chart.start_date, "end_date": chart.end_date },
    })))
}

#[derive(Debug, Deserialize, Default)]
struct CreateUserBody {
    peer_pubkey: Option<String>,
    nickname: Option<String>,
    mail: Option<String>,
    phone: Option<String>,
    bandwidth_limit: Option<i64>,
    data_limit: Option<i64>,
    expiry_date: Option<String>,
    note: Option<String>,
}

async fn create_user(State(state): State<ApiState>, Json(body): Json<CreateUserBody>) -> ApiResult {
    let peer_pubkey = body
        .peer_pubkey
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DaemonError::validation("peer_pubkey is required"))?;
    let created = state
        .admin
        .create(CreateUserInput {
            peer_pubkey,
            nickname: body.nickname,
            mail: body.mail,
            phone: body.phone,
            bandwidth_limit: body.bandwidth_limit,
            data_limit: body.data_limit,
            expiry_date: body.expiry_date,
            note: body.note,
        })
        .await?;
    Ok(PrettyJson(json!({
        "user_id": created.user_id,
        "client_ip": created.client_ip,
        "config": created.config_text,
        "config_download_url": format!("/api/users/{}/config", created.user_id),
    })))
}

#[derive(Debug, Deserialize, Default)]
struct UpdateUserBody {
    nickname: Option<String>,
    mail: Option<String>,
    phone: Option<String>,
    bandwidth_limit: Option<i64>,
    data_limit: Option<i64>,
    expiry_date: Option<String>,
    enabled: Option<i64>,
    note: Option<String>,
}

async fn update_user(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateUserBody>,
) -> ApiResult {
    let update = UserUpdate {
        nickname: body.nickname.map(Some),
        mail: body.mail.map(Some),
        phone: body.phone.map(Some),
        bandwidth_limit: body.bandwidth_limit,
        data_limit: body.data_limit,
        expiry_date: body.expiry_date.map(Some),
        enabled: body.enabled,
        note: body.note.map(Some),
    };
    state.admin.update(id, update).await?;
    let user = state
        .store
        .get_user(id)
        .await?
        .ok_or_else(|| DaemonError::not_found("user not found"))?;
    Ok(PrettyJson(json!({ "success": true, "user": user_json(&user) })))
}

async fn delete_user(State(state): State<ApiState>, Path(id): Path<i64>) -> ApiResult {
    state.admin.delete(id).await?;
    Ok(PrettyJson(json!({ "success": true })))
}

async fn user_action(State(state): State<ApiState>, Path((id, action)): Path<(i64, String)>) -> ApiResult {
    match action.as_str() {
        "enable" => {
            state
                .admin
                .update(id, UserUpdate { enabled: Some(1), ..Default::default() })
                .await?;
            Ok(PrettyJson(json!({ "success": true, "action": "enable" })))
        }
        "disable" => {
            state
                .admin
                .update(id, UserUpdate { enabled: Some(0), ..Default::default() })
                .await?;
            Ok(PrettyJson(json!({ "success": true, "action": "disable" })))
        }
        "reset" => {
            state.admin.reset_counters(id).await?;
            Ok(PrettyJson(json!({ "success": true, "action": "reset" })))
        }
        "kick" => {
            let was_online = state.admin.kick(id).await?;
            Ok(PrettyJson(json!({ "success": true, "action": "kick", "was_online": was_online })))
        }
        other => Err(DaemonError::validation(format!("Unknown action: {other}")).into()),
    }
}

async fn download_config(State(state): State<ApiState>, Path(id): Path<i64>) -> Result<Response, ApiError> {
    let user = state
        .store
        .get_user(id)
        .await?
        .ok_or_else(|| DaemonError::not_found("user not found"))?;
    let config = user
        .wg_config
        .ok_or_else(|| DaemonError::not_found("config not yet generated"))?;
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"user_{id}.conf\""),
        )
        .body(Body::from(config))
        .map_err(|err| DaemonError::internal(err.to_string()))?;
    Ok(response)
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        [(header::CONTENT_TYPE, "application/json")],
        serde_json::to_vec_pretty(&json!({ "error": "not found" })).unwrap_or_default(),
    )
}

/// Short-circuits every `OPTIONS` request to a bare 200; `CorsLayer`
/// (applied around this middleware) decorates the response with the
/// required `Access-Control-*` headers regardless of whether the path
/// matches a real route.
async fn options_ok(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        return StatusCode::OK.into_response();
    }
    next.run(req).await
}

/// Build the fully-wired router: routes, 404 fallback, CORS, and the
/// blanket OPTIONS handler.
pub fn build_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/dashboard", get(get_dashboard))
        .route("/api/users", get(get_users).post(create_user))
        .route("/api/users/management", get(get_users_management))
        .route("/api/events", get(get_events))
        .route("/api/events/history", get(get_events_history))
        .route("/api/traffic/chart", get(get_traffic_chart))
        .route("/api/users/:id", put(update_user).delete(delete_user))
        .route("/api/users/:id/update", put(update_user).post(update_user))
        .route("/api/users/:id/config", get(download_config))
        .route("/api/users/:id/:action", get(user_action))
        .fallback(not_found)
        .with_state(state)
        .layer(middleware::from_fn(options_ok))
        .layer(cors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::InterfaceStatus;
    use crate::stats::StatisticsAggregator;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::collections::HashMap;
    use tower::ServiceExt;
    use wgsession_core::types::CloseReason;

    struct StubAdapter;

    #[async_trait]
    impl PeerTableAdapter for StubAdapter {
        async fn snapshot(&self) -> HashMap<String, crate::adapter::PeerSnapshot> {
            HashMap::new()
        }
        async fn add(&self, _pubkey: &str, _client_ip: &str) -> bool {
            true
        }
        async fn remove(&self, _pubkey: &str) -> bool {
            true
        }
        async fn interface_status(&self) -> InterfaceStatus {
            InterfaceStatus::Running
        }
    }

    struct StubEngine;

    #[async_trait]
    impl SessionEngine for StubEngine {
        async fn close_for_admin(&self, _user_id: i64, _reason: CloseReason) -> wgsession_core::error::Result<()> {
            Ok(())
        }
        fn live_pubkey_for_user(&self, _user_id: i64) -> Option<String> {
            None
        }
        fn live_count(&self) -> usize {
            0
        }
    }

    fn test_state() -> ApiState {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let adapter: Arc<dyn PeerTableAdapter> = Arc::new(StubAdapter);
        let engine: Arc<dyn SessionEngine> = Arc::new(StubEngine);
        let config = Arc::new(DaemonConfig::default());
        let admin = Arc::new(UserAdmin::new(store.clone(), adapter.clone(), engine.clone(), config.clone()));
        let stats = Arc::new(StatisticsAggregator::new(store.clone()));
        ApiState {
            store,
            engine,
            adapter,
            admin,
            stats,
            config,
        }
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn unknown_api_path_returns_404() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/api/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn options_any_path_returns_200() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/anything/at/all")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    }

    #[tokio::test]
    async fn status_reports_interface_and_counts() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let value = body_json(response).await;
        assert_eq!(value["system"]["status"], "running");
        assert_eq!(value["users"]["online"], 0);
    }

    #[tokio::test]
    async fn create_user_then_duplicate_is_rejected() {
        let app = build_router(test_state());
        let pubkey = {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD.encode([9u8; 32])
        };
        let body = serde_json::to_vec(&json!({ "peer_pubkey": pubkey })).unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/users")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/users")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = body_json(response).await;
        assert_eq!(value["error"], "Public key already exists");
    }

    #[tokio::test]
    async fn create_user_missing_pubkey_is_400() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/users")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(serde_json::to_vec(&json!({})).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn management_clamps_per_page_over_100() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/users/management?per_page=500")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let value = body_json(response).await;
        assert_eq!(value["pagination"]["per_page"], 100);
    }

    #[tokio::test]
    async fn traffic_chart_clamps_days_range() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/traffic/chart?days=999")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let value = body_json(response).await;
        assert_eq!(value["period"]["days"], 365);
    }

    #[tokio::test]
    async fn delete_missing_user_is_404() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/users/999")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_action_is_400() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/users/1/bogus")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
