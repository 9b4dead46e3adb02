use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{ws::WebSocket, Path, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, put},
    Json, Router,
};
use panel_api::{
    command_lamp, delete_all_logs, delete_log, delete_user, lamp_status, list_logs, list_users,
    panel_snapshot, parse_device, require_session, set_role, sign_in, Session,
};
use serde::Serialize;
use shared::{
    domain::{LogEntry, LogEntryId, Uid, UserProfile},
    error::{ApiError, ErrorCode},
    protocol::{
        LampCommandRequest, LampStatusResponse, PanelEvent, PanelSnapshot, SessionResponse,
        SessionView, SetRoleRequest, SignInRequest,
    },
};
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{debug, warn};

use crate::app_state::AppState;

type HttpError = (StatusCode, Json<ApiError>);

#[derive(Debug, Serialize)]
pub(crate) struct ClearedResponse {
    pub(crate) removed: u64,
}

pub(crate) fn build_router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/session", get(current_session).post(http_sign_in))
        .route("/lamps", get(http_lamps))
        .route(
            "/lamps/:device",
            get(http_lamp_status)
                .post(http_lamp_command)
                .fallback(method_not_allowed),
        )
        .route("/logs", get(http_list_logs).delete(http_clear_logs))
        .route("/logs/:id", delete(http_delete_log))
        .route("/users", get(http_list_users))
        .route("/users/:uid/role", put(http_set_role))
        .route("/users/:uid", delete(http_delete_user))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub(crate) fn http_error(err: ApiError) -> HttpError {
    let status = match err.code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
        ErrorCode::Connection | ErrorCode::Timeout | ErrorCode::Write | ErrorCode::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(err))
}

/// `Authorization: Bearer <token>`. No header means no session; a bad token
/// is rejected rather than treated as anonymous.
fn session(state: &AppState, headers: &HeaderMap) -> Result<Option<Session>, HttpError> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    let token = value
        .to_str()
        .ok()
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .map(str::trim)
        .ok_or_else(|| {
            http_error(ApiError::new(
                ErrorCode::Unauthorized,
                "expected a bearer token",
            ))
        })?;
    state
        .api
        .access
        .verify(token)
        .map(Some)
        .map_err(|err| http_error(err.into()))
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, HttpError> {
    state.api.storage.health_check().await.map_err(|err| {
        warn!(error = %format!("{err:#}"), "health check failed");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new(ErrorCode::Internal, "database unavailable")),
        )
    })?;
    Ok("ok")
}

async fn http_sign_in(
    State(state): State<Arc<AppState>>,
    Json(identity): Json<SignInRequest>,
) -> Result<Json<SessionResponse>, HttpError> {
    let response = sign_in(&state.api, &identity).await.map_err(http_error)?;
    Ok(Json(response))
}

async fn current_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<SessionView>, HttpError> {
    let session = session(&state, &headers)?;
    let session = require_session(session.as_ref()).map_err(|err| http_error(err.into()))?;
    Ok(Json(session.view()))
}

async fn http_lamps(State(state): State<Arc<AppState>>) -> Json<PanelSnapshot> {
    Json(panel_snapshot(&state.api).await)
}

async fn http_lamp_status(
    State(state): State<Arc<AppState>>,
    Path(device): Path<String>,
) -> Result<Json<LampStatusResponse>, HttpError> {
    let device = parse_device(&device).map_err(http_error)?;
    Ok(Json(lamp_status(&state.api, device).await))
}

/// Body is optional: `{"state": "ON"}` sets, an empty body toggles.
async fn http_lamp_command(
    State(state): State<Arc<AppState>>,
    Path(device): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<LampStatusResponse>, HttpError> {
    let device = parse_device(&device).map_err(http_error)?;
    let session = session(&state, &headers)?;
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        LampCommandRequest::default()
    } else {
        serde_json::from_slice::<LampCommandRequest>(&body).map_err(|err| {
            http_error(ApiError::new(
                ErrorCode::Validation,
                format!("invalid lamp command: {err}"),
            ))
        })?
    };
    let response = command_lamp(&state.api, session.as_ref(), device, request.state)
        .await
        .map_err(http_error)?;
    Ok(Json(response))
}

async fn method_not_allowed() -> HttpError {
    http_error(ApiError::new(
        ErrorCode::MethodNotAllowed,
        "only GET and POST are supported",
    ))
}

async fn http_list_logs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<LogEntry>>, HttpError> {
    let session = session(&state, &headers)?;
    let logs = list_logs(&state.api, session.as_ref())
        .await
        .map_err(http_error)?;
    Ok(Json(logs))
}

async fn http_clear_logs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ClearedResponse>, HttpError> {
    let session = session(&state, &headers)?;
    let removed = delete_all_logs(&state.api, session.as_ref())
        .await
        .map_err(http_error)?;
    Ok(Json(ClearedResponse { removed }))
}

async fn http_delete_log(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, HttpError> {
    let id = id.parse::<i64>().map_err(|_| {
        http_error(ApiError::new(
            ErrorCode::Validation,
            format!("invalid log entry id '{id}'"),
        ))
    })?;
    let session = session(&state, &headers)?;
    delete_log(&state.api, session.as_ref(), LogEntryId(id))
        .await
        .map_err(http_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_list_users(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<UserProfile>>, HttpError> {
    let session = session(&state, &headers)?;
    let users = list_users(&state.api, session.as_ref())
        .await
        .map_err(http_error)?;
    Ok(Json(users))
}

async fn http_set_role(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
    headers: HeaderMap,
    Json(req): Json<SetRoleRequest>,
) -> Result<Json<UserProfile>, HttpError> {
    let session = session(&state, &headers)?;
    let profile = set_role(&state.api, session.as_ref(), &Uid(uid), req.role)
        .await
        .map_err(http_error)?;
    Ok(Json(profile))
}

async fn http_delete_user(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, HttpError> {
    let session = session(&state, &headers)?;
    delete_user(&state.api, session.as_ref(), &Uid(uid))
        .await
        .map_err(http_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

/// Streams panel events as JSON text frames, starting with the current state
/// of every lamp.
async fn ws_connection(state: Arc<AppState>, socket: WebSocket) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.api.reconciler.subscribe();
    let snapshot = panel_snapshot(&state.api).await;

    let send_task = tokio::spawn(async move {
        let initial = std::iter::once(PanelEvent::ConnectionChanged {
            status: snapshot.connection,
        })
        .chain(
            snapshot
                .devices
                .into_iter()
                .map(|snapshot| PanelEvent::StateChanged { snapshot }),
        );
        for event in initial {
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if sender.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
        loop {
            let event = match events_rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "websocket client lagged behind panel events");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
