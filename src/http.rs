//! Core-relevant HTTP surface (§6, §11)
//!
//! Every route here assumes an upstream layer (not part of this core, §1)
//! has already authenticated the caller: user-facing routes expect a
//! [`UserId`] in the request extensions, internal supervisor routes expect a
//! bearer token the [`SupervisorGateway`] validates itself against the
//! server's own `auth_token`. No session/JWT handling lives in this module.

use crate::billing::CheckoutSession;
use crate::error::CoreError;
use crate::runtime::ControlPlane;
use crate::supervisor_gateway::SupervisorStatus;
use crate::types::{ServerId, UserId};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::IntervalStream;
use tracing::warn;

/// Assemble the full router over a built [`ControlPlane`].
pub fn build_router(app: Arc<ControlPlane>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .route("/servers/checkout", post(checkout_handler))
        .route("/servers/status", get(status_stream_handler))
        .route("/servers/:id/start", post(start_handler))
        .route("/servers/:id/stop", post(stop_handler))
        .route("/servers/:id/restart", post(restart_handler))
        .route("/servers/:id/env", put(set_env_handler))
        .route("/servers/:id/logs", get(logs_stream_handler))
        .route("/webhooks/payment", post(webhook_handler))
        .route("/internal/servers/:id/status", post(internal_status_handler))
        .route("/internal/servers/:id/heartbeat", post(internal_heartbeat_handler))
        .with_state(app)
}

/// Wraps [`CoreError`] so handlers can `?` straight into an HTTP response
/// (§7's class-to-status mapping).
struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::Authorization(_) => StatusCode::UNAUTHORIZED,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::Capacity(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Catalog(_) => StatusCode::BAD_REQUEST,
            CoreError::Billing(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::Transient(_) | CoreError::Store(_) | CoreError::Orchestrator(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            CoreError::Io(_) | CoreError::Serialization(_) | CoreError::Config(_) | CoreError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(ErrorBody { error: self.0.to_string() })).into_response()
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?.strip_prefix("Bearer ")
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy", version: env!("CARGO_PKG_VERSION") })
}

async fn ready_handler() -> StatusCode {
    StatusCode::OK
}

async fn metrics_handler(State(app): State<Arc<ControlPlane>>) -> Result<String, ApiError> {
    app.metrics().gather_text().map_err(ApiError::from)
}

#[derive(Debug, Deserialize)]
struct CheckoutRequest {
    display_name: String,
    subdomain: String,
    game: String,
    plan: String,
    #[serde(default)]
    resubscribe_server_id: Option<ServerId>,
}

#[derive(Debug, Serialize)]
struct CheckoutResponse {
    checkout_url: String,
}

/// `POST /servers/checkout` (§6): validates subdomain uniqueness and
/// capacity, creates a `PendingRequest`, and returns the checkout URL the
/// caller redirects the user to.
async fn checkout_handler(
    State(app): State<Arc<ControlPlane>>,
    Extension(user_id): Extension<UserId>,
    Json(body): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    if app.store().subdomain_exists(&body.subdomain).await? {
        return Err(CoreError::validation(format!("subdomain '{}' already in use", body.subdomain)).into());
    }

    let game = app.catalog().game(&body.game)?;
    let plan = game.plan(&body.plan)?;

    if !app.allocator().has_capacity(plan.resource_requirement()).await? {
        return Err(CoreError::capacity("no node has free capacity for this plan").into());
    }

    let price_id = app
        .config()
        .game_price_ids
        .get(&body.game)
        .ok_or_else(|| CoreError::config(format!("no price configured for game '{}'", body.game)))?;

    let mut metadata = HashMap::new();
    metadata.insert("user_id".to_string(), user_id.to_string());
    if let Some(resub) = body.resubscribe_server_id {
        metadata.insert("resubscribe_server_id".to_string(), resub.to_string());
    }

    let session: CheckoutSession = app.billing().payment_gateway().create_checkout_session(price_id, &metadata)?;

    let expires_at: DateTime<Utc> = Utc::now() + chrono::Duration::minutes(30);
    app.store()
        .create_pending_request(
            user_id,
            &body.display_name,
            &body.subdomain,
            &body.game,
            &body.plan,
            &session.id,
            body.resubscribe_server_id,
            expires_at,
        )
        .await?;

    Ok(Json(CheckoutResponse { checkout_url: session.url }))
}

async fn start_handler(
    State(app): State<Arc<ControlPlane>>,
    Extension(user_id): Extension<UserId>,
    Path(server_id): Path<ServerId>,
) -> Result<StatusCode, ApiError> {
    app.lifecycle().start(server_id, user_id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn stop_handler(
    State(app): State<Arc<ControlPlane>>,
    Extension(user_id): Extension<UserId>,
    Path(server_id): Path<ServerId>,
) -> Result<StatusCode, ApiError> {
    app.lifecycle().stop(server_id, user_id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn restart_handler(
    State(app): State<Arc<ControlPlane>>,
    Extension(user_id): Extension<UserId>,
    Path(server_id): Path<ServerId>,
) -> Result<StatusCode, ApiError> {
    app.lifecycle().restart(server_id, user_id).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct SetEnvRequest {
    #[serde(default)]
    overrides: Option<HashMap<String, String>>,
}

async fn set_env_handler(
    State(app): State<Arc<ControlPlane>>,
    Extension(user_id): Extension<UserId>,
    Path(server_id): Path<ServerId>,
    Json(body): Json<SetEnvRequest>,
) -> Result<StatusCode, ApiError> {
    app.lifecycle().set_env(server_id, user_id, body.overrides).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Serialize)]
struct ServerSummary {
    id: ServerId,
    status: crate::types::ServerStatus,
    status_message: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatusSnapshot {
    servers: Vec<ServerSummary>,
}

const STREAM_HEARTBEAT: Duration = Duration::from_secs(30);

/// `GET /servers/status` (§6): an SSE stream. The first frame is a full
/// snapshot for the caller's servers, then every published [`StatusEvent`]
/// for that user, with a 30 s heartbeat comment keeping idle connections
/// open. Closes when the client disconnects, which drops the subscription.
async fn status_stream_handler(
    State(app): State<Arc<ControlPlane>>,
    Extension(user_id): Extension<UserId>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let servers = app.store().list_servers_by_user(user_id).await?;
    let snapshot = StatusSnapshot {
        servers: servers
            .into_iter()
            .map(|s| ServerSummary { id: s.id, status: s.status, status_message: s.status_message })
            .collect(),
    };
    let snapshot_event = Event::default().json_data(snapshot).unwrap_or_else(|_| Event::default().data("{}"));
    let snapshot_stream = stream::once(async move { Ok(snapshot_event) });

    let handle = crate::hub::HubHandle::subscribe(app.hub().clone(), user_id);
    let event_stream = stream::unfold(handle, |mut handle| async move {
        let event = handle.receiver().recv().await?;
        Some((event, handle))
    })
    .map(|event| Ok(Event::default().json_data(&event).unwrap_or_else(|_| Event::default().data("{}"))));

    let heartbeat_stream =
        IntervalStream::new(tokio::time::interval(STREAM_HEARTBEAT)).map(|_| Ok(Event::default().comment("keep-alive")));

    let combined = snapshot_stream.chain(stream::select(event_stream, heartbeat_stream));
    Ok(Sse::new(combined).keep_alive(KeepAlive::default()))
}

/// `GET /servers/:id/logs` (§6): tails the supervisor's container logs via
/// the Orchestrator, with the same 30 s heartbeat as the status stream.
async fn logs_stream_handler(
    State(app): State<Arc<ControlPlane>>,
    Extension(user_id): Extension<UserId>,
    Path(server_id): Path<ServerId>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let server = app.store().get_server(server_id).await?.ok_or_else(|| CoreError::authorization("server not found"))?;
    if server.user_id != user_id {
        return Err(CoreError::authorization("server not owned by caller").into());
    }

    let log_stream = app.orchestrator().stream_logs(&server_id.to_string(), true).await?;
    let log_events = log_stream.map(|line| {
        let event = match line {
            Ok(text) => Event::default().data(text),
            Err(e) => Event::default().event("error").data(e.to_string()),
        };
        Ok(event)
    });
    let heartbeat_stream =
        IntervalStream::new(tokio::time::interval(STREAM_HEARTBEAT)).map(|_| Ok(Event::default().comment("keep-alive")));

    let combined = stream::select(log_events, heartbeat_stream);
    Ok(Sse::new(combined).keep_alive(KeepAlive::default()))
}

/// `POST /webhooks/payment` (§6, §7 class 7): raw body, signature header
/// required. 200 on success or idempotent replay, 401 on a bad signature,
/// 500 on processing failure so the gateway retries.
async fn webhook_handler(State(app): State<Arc<ControlPlane>>, headers: HeaderMap, body: axum::body::Bytes) -> StatusCode {
    let signature = headers
        .get("X-Webhook-Signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    match app.billing().handle_webhook(&body, signature).await {
        Ok(()) => StatusCode::OK,
        Err(CoreError::Authorization(_)) => StatusCode::UNAUTHORIZED,
        Err(e) => {
            warn!(error = %e, "webhook processing failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[derive(Debug, Deserialize)]
struct InternalStatusRequest {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

fn parse_supervisor_status(s: &str) -> Result<SupervisorStatus, ApiError> {
    match s {
        "starting" => Ok(SupervisorStatus::Starting),
        "running" => Ok(SupervisorStatus::Running),
        "stopping" => Ok(SupervisorStatus::Stopping),
        "stopped" => Ok(SupervisorStatus::Stopped),
        "failed" => Ok(SupervisorStatus::Failed),
        other => Err(CoreError::validation(format!("unknown supervisor status '{other}'")).into()),
    }
}

/// `POST /internal/servers/:id/status` (§6, §4.9): authenticated by the
/// server's own bearer token, not a user session.
async fn internal_status_handler(
    State(app): State<Arc<ControlPlane>>,
    Path(server_id): Path<ServerId>,
    headers: HeaderMap,
    Json(body): Json<InternalStatusRequest>,
) -> Result<StatusCode, ApiError> {
    let token = bearer_token(&headers).ok_or_else(|| CoreError::authorization("missing bearer token"))?;
    let status = parse_supervisor_status(&body.status)?;
    app.supervisor_gateway().report_status(server_id, token, status, body.message.as_deref()).await?;
    Ok(StatusCode::OK)
}

/// `POST /internal/servers/:id/heartbeat` (§6, §4.9).
async fn internal_heartbeat_handler(
    State(app): State<Arc<ControlPlane>>,
    Path(server_id): Path<ServerId>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let token = bearer_token(&headers).ok_or_else(|| CoreError::authorization("missing bearer token"))?;
    app.supervisor_gateway().report_heartbeat(server_id, token).await?;
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_strips_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer abc123".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc123"));
    }

    #[test]
    fn bearer_token_rejects_other_schemes() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Basic abc123".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn parse_supervisor_status_rejects_unknown() {
        assert!(parse_supervisor_status("zzz").is_err());
        assert!(parse_supervisor_status("running").is_ok());
    }
}
