//! HTTP surface: SSE stream, message ingress, session recovery, health,
//! and the admin API.
//!
//! Admin routes call the same service methods as the tool plane, so the two
//! surfaces cannot drift apart semantically.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tracing::debug;

use waggle_bridge::BridgeConfig;
use waggle_memory::SearchRequest;
use waggle_swarm::RosterRequest;
use waggle_tickets::TicketFilter;
use waggle_types::{
    HubError, SessionId, ToolInvocation, EVENT_BROADCAST, EVENT_RESULT, EVENT_SESSION,
};

use crate::auth::bearer_token;
use crate::hub::Hub;
use crate::session::Frame;

/// Build the full router.
pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/sse", get(sse_stream))
        .route("/messages", post(ingress))
        .route("/api/session/recover", post(recover_session))
        .route("/api/session/info", get(session_info))
        .route("/health", get(health))
        .route("/admin/api/login", post(admin_login))
        .route("/admin/api/agents", get(admin_agents))
        .route("/admin/api/memories/search", post(admin_memory_search))
        .route("/admin/api/bridges", get(admin_bridges).post(admin_register_bridge))
        .route("/admin/api/tickets", get(admin_tickets))
        .route("/admin/api/backup/systems", get(admin_backup_systems))
        .route("/admin/api/backup/snapshots", get(admin_backup_snapshots))
        .route("/admin/api/backup/drift", get(admin_backup_drift))
        .route("/admin/api/backup/alerts", get(admin_backup_alerts))
        .layer(CorsLayer::permissive())
        .with_state(hub)
}

// =============================================================================
// Session plane
// =============================================================================

#[derive(Debug, Deserialize)]
struct SseQuery {
    session_id: Option<String>,
}

/// Signals the session table when the client drops the stream.
struct StreamGuard {
    hub: Arc<Hub>,
    session_id: SessionId,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.hub.services.sessions.stream_dropped(self.session_id);
    }
}

async fn sse_stream(
    State(hub): State<Arc<Hub>>,
    Query(query): Query<SseQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, Response> {
    let requested = query
        .session_id
        .as_deref()
        .and_then(|raw| SessionId::parse(raw).ok());

    let attach = hub
        .services
        .sessions
        .attach_stream(requested)
        .map_err(|e| error_response(&e))?;
    let session_id = attach.session_id;

    // Replay missed broadcasts behind the session frame, before any new one
    // can be fanned out to this stream.
    if attach.resumed {
        let missed = hub.services.bus.replay_after(attach.replay_after);
        if !missed.is_empty() {
            debug!(session = %session_id.short(), count = missed.len(), "replaying broadcasts");
        }
        hub.services.sessions.replay(session_id, missed).await;
    }

    let guard = StreamGuard {
        hub: hub.clone(),
        session_id,
    };
    let stream = ReceiverStream::new(attach.rx).map(move |frame| {
        let _keepalive = &guard;
        Ok::<Event, Infallible>(frame_to_event(frame))
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    ))
}

fn frame_to_event(frame: Frame) -> Event {
    match frame {
        Frame::Session(id) => Event::default().event(EVENT_SESSION).data(id.to_hex()),
        Frame::Result(result) => Event::default()
            .event(EVENT_RESULT)
            .data(compact_json(&result)),
        Frame::Broadcast(broadcast) => Event::default()
            .event(EVENT_BROADCAST)
            .data(compact_json(&broadcast)),
    }
}

fn compact_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".into())
}

#[derive(Debug, Deserialize)]
struct IngressQuery {
    session_id: Option<String>,
}

async fn ingress(
    State(hub): State<Arc<Hub>>,
    Query(query): Query<IngressQuery>,
    body: Result<Json<ToolInvocation>, JsonRejection>,
) -> Response {
    let Some(session_id) = query
        .session_id
        .as_deref()
        .and_then(|raw| SessionId::parse(raw).ok())
        .filter(|id| hub.services.sessions.is_live(*id))
    else {
        return stale_session(&hub, query.session_id.as_deref());
    };

    let invocation = match body {
        Ok(Json(invocation)) => invocation,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "malformed_body",
                    "message": rejection.to_string(),
                })),
            )
                .into_response();
        }
    };

    hub.services.sessions.touch(session_id);
    let correlation = invocation.id.clone();
    hub.submit(session_id, invocation);

    (
        StatusCode::ACCEPTED,
        Json(json!({"status": "accepted", "id": correlation})),
    )
        .into_response()
}

/// 410 with a machine-readable recovery payload. The suggested id is
/// pre-created so the reconnect lands on a known session.
fn stale_session(hub: &Arc<Hub>, old: Option<&str>) -> Response {
    let suggested = match hub.services.sessions.precreate() {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };
    (
        StatusCode::GONE,
        Json(json!({
            "error": "session_expired",
            "old_session_id": old,
            "suggested_new_session_id": suggested.to_hex(),
            "sse_url": format!("/sse?session_id={}", suggested.to_hex()),
        })),
    )
        .into_response()
}

#[derive(Debug, Default, Deserialize)]
struct RecoverBody {
    #[serde(default)]
    old_session_id: Option<String>,
}

async fn recover_session(
    State(hub): State<Arc<Hub>>,
    body: Option<Json<RecoverBody>>,
) -> Response {
    let old = body.and_then(|Json(b)| b.old_session_id);
    let new_id = match hub.services.sessions.precreate() {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };
    debug!(old = ?old, new = %new_id.short(), "session recovery");
    Json(json!({
        "new_session_id": new_id.to_hex(),
        "sse_url": format!("/sse?session_id={}", new_id.to_hex()),
    }))
    .into_response()
}

async fn session_info(State(hub): State<Arc<Hub>>) -> Response {
    Json(hub.session_info()).into_response()
}

async fn health(State(hub): State<Arc<Hub>>) -> Response {
    Json(hub.health()).into_response()
}

// =============================================================================
// Admin plane
// =============================================================================

#[derive(Debug, Deserialize)]
struct LoginBody {
    username: String,
    password: String,
}

async fn admin_login(State(hub): State<Arc<Hub>>, body: Json<LoginBody>) -> Response {
    match hub.auth.login(&body.username, &body.password) {
        Ok(token) => Json(json!({"token": token})).into_response(),
        Err(e) => error_response(&e),
    }
}

fn authorize(hub: &Hub, headers: &HeaderMap) -> Result<(), Response> {
    let header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| error_response(&HubError::Unauthorized("missing bearer token".into())))?;
    let token = bearer_token(header)
        .ok_or_else(|| error_response(&HubError::Unauthorized("missing bearer token".into())))?;
    hub.auth
        .require_admin(token)
        .map(|_| ())
        .map_err(|e| error_response(&e))
}

async fn admin_agents(
    State(hub): State<Arc<Hub>>,
    headers: HeaderMap,
    Query(query): Query<RosterRequest>,
) -> Response {
    if let Err(denied) = authorize(&hub, &headers) {
        return denied;
    }
    Json(hub.services.swarm.roster(query)).into_response()
}

async fn admin_memory_search(
    State(hub): State<Arc<Hub>>,
    headers: HeaderMap,
    body: Result<Json<SearchRequest>, JsonRejection>,
) -> Response {
    if let Err(denied) = authorize(&hub, &headers) {
        return denied;
    }
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return error_response(&HubError::BadArgument(rejection.to_string()));
        }
    };
    match hub.services.memory.search(request).await {
        Ok(page) => Json(page).into_response(),
        Err(e) => error_response(&crate::tools::memory_err(e)),
    }
}

async fn admin_bridges(State(hub): State<Arc<Hub>>, headers: HeaderMap) -> Response {
    if let Err(denied) = authorize(&hub, &headers) {
        return denied;
    }
    Json(hub.services.bridges.list()).into_response()
}

async fn admin_register_bridge(
    State(hub): State<Arc<Hub>>,
    headers: HeaderMap,
    body: Result<Json<BridgeConfig>, JsonRejection>,
) -> Response {
    if let Err(denied) = authorize(&hub, &headers) {
        return denied;
    }
    let config = match body {
        Ok(Json(config)) => config,
        Err(rejection) => return error_response(&HubError::BadArgument(rejection.to_string())),
    };
    match hub.services.bridges.register(config).await {
        Ok(info) => Json(info).into_response(),
        Err(e) => error_response(&crate::tools::bridge_err(e)),
    }
}

async fn admin_tickets(
    State(hub): State<Arc<Hub>>,
    headers: HeaderMap,
    Query(filter): Query<TicketFilter>,
) -> Response {
    if let Err(denied) = authorize(&hub, &headers) {
        return denied;
    }
    match hub.services.tickets.list_tickets(filter).await {
        Ok(tickets) => Json(tickets).into_response(),
        Err(e) => error_response(&crate::tools::ticket_err(e)),
    }
}

async fn admin_backup_systems(State(hub): State<Arc<Hub>>, headers: HeaderMap) -> Response {
    if let Err(denied) = authorize(&hub, &headers) {
        return denied;
    }
    match hub.services.backup.list_systems() {
        Ok(systems) => Json(systems).into_response(),
        Err(e) => error_response(&crate::tools::backup_err(e)),
    }
}

#[derive(Debug, Deserialize)]
struct SnapshotQuery {
    system_id: String,
    #[serde(default = "default_snapshot_limit")]
    limit: usize,
}

fn default_snapshot_limit() -> usize {
    20
}

async fn admin_backup_snapshots(
    State(hub): State<Arc<Hub>>,
    headers: HeaderMap,
    Query(query): Query<SnapshotQuery>,
) -> Response {
    if let Err(denied) = authorize(&hub, &headers) {
        return denied;
    }
    match hub.services.backup.list_snapshots(&query.system_id, query.limit) {
        Ok(snapshots) => Json(snapshots).into_response(),
        Err(e) => error_response(&crate::tools::backup_err(e)),
    }
}

#[derive(Debug, Deserialize)]
struct DriftQuery {
    #[serde(default)]
    system_id: Option<String>,
    #[serde(default = "default_drift_hours")]
    hours_back: i64,
}

fn default_drift_hours() -> i64 {
    24
}

async fn admin_backup_drift(
    State(hub): State<Arc<Hub>>,
    headers: HeaderMap,
    Query(query): Query<DriftQuery>,
) -> Response {
    if let Err(denied) = authorize(&hub, &headers) {
        return denied;
    }
    match hub
        .services
        .backup
        .detect_drift(query.system_id.as_deref(), query.hours_back)
    {
        Ok(findings) => Json(findings).into_response(),
        Err(e) => error_response(&crate::tools::backup_err(e)),
    }
}

#[derive(Debug, Deserialize)]
struct AlertQuery {
    #[serde(default)]
    system_id: Option<String>,
    #[serde(default)]
    include_acknowledged: bool,
}

async fn admin_backup_alerts(
    State(hub): State<Arc<Hub>>,
    headers: HeaderMap,
    Query(query): Query<AlertQuery>,
) -> Response {
    if let Err(denied) = authorize(&hub, &headers) {
        return denied;
    }
    match hub
        .services
        .backup
        .get_alerts(query.system_id.as_deref(), query.include_acknowledged)
    {
        Ok(alerts) => Json(alerts).into_response(),
        Err(e) => error_response(&crate::tools::backup_err(e)),
    }
}

// =============================================================================
// Error mapping
// =============================================================================

/// JSON-shaped error response with the taxonomy's HTTP status.
pub fn error_response(error: &HubError) -> Response {
    let status = match error {
        HubError::BadArgument(_) => StatusCode::BAD_REQUEST,
        HubError::ToolNotFound(_) => StatusCode::NOT_FOUND,
        HubError::Tool(_) => StatusCode::UNPROCESSABLE_ENTITY,
        HubError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        HubError::Forbidden(_) => StatusCode::FORBIDDEN,
        HubError::SessionExpired(_) => StatusCode::GONE,
        HubError::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
        HubError::BridgeTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        HubError::BridgeDown(_) => StatusCode::BAD_GATEWAY,
        HubError::MemoryStoreUnavailable(_) | HubError::BackendUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        HubError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(error.to_payload())).into_response()
}
