use crate::clock::{Clock, OffsetClock};
use crate::hub::{Connection, Hub};
use crate::router::{MessageRouter, RouterError};
use crate::sync::RuleSync;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use prts_core::rules::{format_rule_time, next_rule_id};
use prts_core::wire::encode_envelope;
use prts_core::{AccessControlRule, NodeCommand, RuleKind, RuleStatus};
use prts_storage::{FleetStore, StorageError, SETTING_LAST_SYNC_TIME, SETTING_TIME_OFFSET};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use prts_core::wire::WS_PATH;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub router: Arc<MessageRouter>,
    pub rules: Arc<RuleSync>,
    pub store: Arc<dyn FleetStore>,
    pub clock: Arc<OffsetClock>,
    pub write_timeout: Duration,
    pub max_frame_bytes: usize,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route(WS_PATH, get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .route("/api/v1/nodes/command", post(send_command))
        .route("/api/v1/access-rules", post(create_rule))
        .route("/api/v1/access-rules/sync", post(sync_rules))
        .route("/api/v1/access-rules/:id", delete(delete_rule))
        .route("/api/v1/system/time-offset", put(set_time_offset))
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(state.max_frame_bytes)
        .on_upgrade(move |socket| handle_socket(state, socket))
}

/// Drives one connection: a writer draining the hub queue and a reader feeding the router.
async fn handle_socket(state: AppState, socket: WebSocket) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let Connection {
        id: conn_id,
        mut outbound,
        closed,
    } = state.hub.register().await;

    let writer_hub = state.hub.clone();
    let writer_conn = conn_id.clone();
    let mut writer_closed = closed.clone();
    let write_timeout = state.write_timeout;
    let write_task = tokio::spawn(async move {
        loop {
            let envelope = tokio::select! {
                _ = writer_closed.changed() => break,
                next = outbound.recv() => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            let text = match encode_envelope(&envelope) {
                Ok(text) => text,
                Err(err) => {
                    warn!(event = "encode_error", conn_id = %writer_conn, error = %err);
                    continue;
                }
            };
            match tokio::time::timeout(write_timeout, ws_sender.send(Message::Text(text))).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(event = "write_error", conn_id = %writer_conn, error = %err);
                    writer_hub.unregister(&writer_conn).await;
                    return;
                }
                Err(_) => {
                    warn!(event = "write_timeout", conn_id = %writer_conn);
                    writer_hub.unregister(&writer_conn).await;
                    return;
                }
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    let mut reader_closed = closed;
    loop {
        let next = tokio::select! {
            _ = reader_closed.changed() => break,
            next = ws_receiver.next() => next,
        };
        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(err)) => {
                warn!(event = "read_error", conn_id = %conn_id, error = %err);
                break;
            }
            None => break,
        };
        let data = match msg {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(_) => {
                info!(event = "client_close", conn_id = %conn_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        state.router.handle_frame(&conn_id, &data).await;
    }

    state.hub.unregister(&conn_id).await;
    let _ = write_task.await;
    debug!(event = "socket_done", conn_id = %conn_id);
}

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<RouterError> for ApiError {
    fn from(err: RouterError) -> Self {
        match err {
            RouterError::NotConnected(_) => ApiError::NotFound("node not connected".to_string()),
            RouterError::Storage(err) => err.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Internal(message) => {
                warn!(event = "api_error", error = %message);
                (StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandRequest {
    node_id: String,
    command: String,
}

async fn send_command(
    State(state): State<AppState>,
    Json(req): Json<CommandRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let command: NodeCommand = req.command.parse().map_err(ApiError::BadRequest)?;
    state.router.handle_command(&req.node_id, command).await?;
    Ok(Json(json!({ "status": "command sent" })))
}

async fn sync_rules(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let count = state.rules.publish_all().await?;
    Ok(Json(
        json!({ "message": "Sync command broadcasted", "count": count }),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuleRequest {
    #[serde(default)]
    id: String,
    ip: String,
    #[serde(rename = "type", default)]
    kind: RuleKind,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    expire_time: String,
    #[serde(default)]
    add_time: String,
    #[serde(default)]
    status: Option<RuleStatus>,
}

async fn create_rule(
    State(state): State<AppState>,
    Json(req): Json<RuleRequest>,
) -> Result<Json<AccessControlRule>, ApiError> {
    if req.ip.trim().is_empty() {
        return Err(ApiError::BadRequest("ip is required".to_string()));
    }
    let rule = AccessControlRule {
        id: if req.id.trim().is_empty() {
            next_rule_id()
        } else {
            req.id
        },
        ip: req.ip.trim().to_string(),
        kind: req.kind,
        reason: req.reason,
        source: req.source,
        expire_time: req.expire_time,
        add_time: if req.add_time.trim().is_empty() {
            format_rule_time(state.clock.now())
        } else {
            req.add_time
        },
        status: req.status.unwrap_or_default(),
    };
    state.store.insert_rule(&rule)?;
    info!(event = "rule_created", rule_id = %rule.id, ip = %rule.ip, kind = %rule.kind);
    state.rules.publish_all().await?;
    Ok(Json(rule))
}

async fn delete_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.store.delete_rule(&id)? {
        return Err(ApiError::NotFound("rule not found".to_string()));
    }
    info!(event = "rule_deleted", rule_id = %id);
    state.rules.publish_all().await?;
    Ok(Json(json!({ "message": "Rule deleted" })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimeOffsetRequest {
    offset_nanos: i64,
}

async fn set_time_offset(
    State(state): State<AppState>,
    Json(req): Json<TimeOffsetRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.clock.set_offset(req.offset_nanos);
    state
        .store
        .put_setting(SETTING_TIME_OFFSET, &req.offset_nanos.to_string())?;
    let now = state.clock.now().to_rfc3339();
    state.store.put_setting(SETTING_LAST_SYNC_TIME, &now)?;
    info!(event = "time_offset_set", offset_nanos = req.offset_nanos);
    Ok(Json(json!({
        "status": "success",
        "offsetNanos": req.offset_nanos,
        "remoteTime": now,
    })))
}
