//! WebSocket upgrade endpoint and the inbound HTTP API.
//!
//! The backend injects events with `POST /notify` (event name in the body)
//! or `POST /notify/{event}` (event name in the path), both guarded by the
//! shared-secret `x-backend-key` header. The read-only endpoints expose
//! liveness and connected-user statistics.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::CorsLayer;

use crate::connection;
use crate::registry::RawId;
use crate::router::{self, RoutingHint, Target};
use crate::server::RelayState;

/// Build the axum router.
pub fn router(state: Arc<RelayState>) -> Router {
    let cors = if state.config.cors_origin.is_empty() {
        CorsLayer::permissive()
    } else {
        use tower_http::cors::AllowOrigin;
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(
                state
                    .config
                    .cors_origin
                    .iter()
                    .filter_map(|origin| origin.parse().ok()),
            ))
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers([header::CONTENT_TYPE, BACKEND_KEY_HEADER.clone()])
    };

    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/notify", post(notify))
        .route("/notify/{event}", post(notify_event))
        .route("/api/v1/health", get(api_health))
        .route("/api/v1/stats", get(api_stats))
        .layer(cors)
        .with_state(state)
}

static BACKEND_KEY_HEADER: header::HeaderName = header::HeaderName::from_static("x-backend-key");

// ── WebSocket handler ──────────────────────────────────────────────────

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<Arc<RelayState>>,
) -> impl IntoResponse {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    ws.on_upgrade(move |socket| {
        connection::handle_socket(socket, state, addr.to_string(), user_agent)
    })
}

// ── Notify endpoints ───────────────────────────────────────────────────

/// Inbound notify body: `{event?, data?, notification?, userId?, userType?}`.
/// `data`/`notification` carry the payload; when both are absent the whole
/// body is forwarded.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct NotifyRequest {
    event: Option<String>,
    data: Option<Value>,
    notification: Option<Value>,
    user_id: Option<RawId>,
    user_type: Option<String>,
}

#[derive(Debug, Serialize)]
struct NotifyResponse {
    success: bool,
    message: String,
    event: String,
    target: String,
    sent: bool,
}

fn backend_authorized(state: &RelayState, headers: &HeaderMap) -> bool {
    match state.config.backend_key.as_deref() {
        // No key configured: open relay (development setups).
        None => true,
        Some(expected) => headers
            .get(&BACKEND_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|got| got == expected),
    }
}

async fn notify(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<NotifyResponse>) {
    handle_notify(&state, &headers, None, body)
}

async fn notify_event(
    State(state): State<Arc<RelayState>>,
    Path(event): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<NotifyResponse>) {
    handle_notify(&state, &headers, Some(event), body)
}

fn handle_notify(
    state: &RelayState,
    headers: &HeaderMap,
    path_event: Option<String>,
    body: Value,
) -> (StatusCode, Json<NotifyResponse>) {
    if !backend_authorized(state, headers) {
        tracing::warn!("Notify request rejected: bad or missing backend key");
        return (
            StatusCode::UNAUTHORIZED,
            Json(NotifyResponse {
                success: false,
                message: "Invalid backend key".into(),
                event: String::new(),
                target: String::new(),
                sent: false,
            }),
        );
    }

    let request: NotifyRequest = serde_json::from_value(body.clone()).unwrap_or_default();
    let event_name = path_event
        .or(request.event)
        .unwrap_or_else(|| "notification".to_string());
    let payload = request
        .data
        .or(request.notification)
        .unwrap_or(body);
    let hint = RoutingHint {
        user_id: request.user_id.as_ref().map(RawId::normalized),
        user_type: request.user_type,
    };

    let routing = router::classify(&event_name, &payload, &hint);
    let target = describe_targets(&routing.routes);
    let sent = state.dispatcher.execute(&routing.routes);
    tracing::info!(
        event = %routing.canonical,
        matched = routing.matched,
        %target,
        sent,
        "Notification relayed"
    );

    (
        StatusCode::OK,
        Json(NotifyResponse {
            success: true,
            message: "Notification sent".into(),
            event: routing.canonical,
            target,
            sent,
        }),
    )
}

fn describe_targets(routes: &[router::Route]) -> String {
    if routes.is_empty() {
        return "nobody".into();
    }
    let mut parts = Vec::new();
    for route in routes {
        match &route.target {
            Target::User(id) => parts.push(format!("user {id}")),
            Target::Group(group) => parts.push(group.clone()),
            Target::All => parts.push("all users".into()),
        }
    }
    parts.dedup();
    parts.join(", ")
}

// ── Read-only endpoints ────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    success: bool,
    message: &'static str,
    connections: usize,
    uptime_secs: u64,
    timestamp: String,
}

async fn api_health(State(state): State<Arc<RelayState>>) -> Json<HealthResponse> {
    let uptime = (chrono::Utc::now() - state.started_at).num_seconds().max(0) as u64;
    Json(HealthResponse {
        success: true,
        message: "WebSocket relay is running",
        connections: state.registry.connection_count(),
        uptime_secs: uptime,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

#[derive(Serialize)]
struct UserSummary {
    #[serde(rename = "userId")]
    user_id: String,
    #[serde(rename = "userName")]
    user_name: String,
    #[serde(rename = "userType")]
    user_type: String,
    #[serde(rename = "connectionId")]
    connection_id: String,
    #[serde(rename = "connectedAt")]
    connected_at: String,
}

#[derive(Serialize)]
struct StatsResponse {
    total: usize,
    connections: usize,
    rooms: usize,
    by_role: HashMap<String, usize>,
    users: Vec<UserSummary>,
}

async fn api_stats(State(state): State<Arc<RelayState>>) -> Json<StatsResponse> {
    let entries = state.registry.all_entries();
    let mut by_role: HashMap<String, usize> = HashMap::new();
    let mut users = Vec::with_capacity(entries.len());
    for (connection_id, identity) in entries {
        *by_role.entry(identity.user_type.clone()).or_insert(0) += 1;
        users.push(UserSummary {
            user_id: identity.user_id,
            user_name: identity.user_name,
            user_type: identity.user_type,
            connection_id,
            connected_at: identity.connected_at.to_rfc3339(),
        });
    }
    Json(StatsResponse {
        total: users.len(),
        connections: state.registry.connection_count(),
        rooms: state.rooms.group_count(),
        by_role,
        users,
    })
}
