// =============================================================================
// Query Facade — HTTP surface (§4.G/§6).
// =============================================================================
//
// All routes accept GET plus a matching OPTIONS stub (empty body, for CORS).
// Every response is the canonical envelope `{status, message, data}` with
// `Content-Type: application/json`. Grounded on
// `original_source/Src/appserver.cpp`'s `makeServer()`: one handler per
// route, a validation failure renders BAD_REQUEST, and a 404 fallback for
// unknown routes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, options};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::app_state::{AppState, SERVER_NAME, SERVER_VERSION};
use crate::error::ApiError;
use crate::session::SessionId;
use crate::types::{KLineInterval, UserConfig};

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/login", get(login).options(empty_options))
        .route("/logout", get(logout).options(empty_options))
        .route("/config", get(update_config).options(empty_options))
        .route("/detect", get(detect).options(empty_options))
        .route("/stockexchanges", get(stockexchanges).options(empty_options))
        .route("/klinesidlist", get(klinesidlist).options(empty_options))
        .route("/serverstatus", get(serverstatus).options(empty_options))
        .fallback(not_found)
        .layer(cors)
        .with_state(state)
}

async fn empty_options() -> impl IntoResponse {
    (StatusCode::OK, "")
}

async fn not_found() -> impl IntoResponse {
    envelope(StatusCode::NOT_FOUND, "not found", Value::Null)
}

fn envelope(status: StatusCode, message: &str, data: Value) -> axum::response::Response {
    let body = json!({
        "status": status.as_u16(),
        "message": message,
        "data": data,
    });
    (status, Json(body)).into_response()
}

fn ok(data: Value) -> axum::response::Response {
    envelope(StatusCode::OK, "ok", data)
}

fn log_request(path: &str, remote: SocketAddr, started: Instant, status: u16) {
    info!(
        path,
        remote_addr = %remote,
        latency_ms = started.elapsed().as_millis() as u64,
        status,
        "request handled"
    );
}

fn required<'a>(params: &'a HashMap<String, String>, key: &str) -> Result<&'a str, ApiError> {
    params
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("missing required parameter '{key}'")))
}

fn parse_session_id(params: &HashMap<String, String>) -> Result<SessionId, ApiError> {
    required(params, "sessionId")?
        .parse::<SessionId>()
        .map_err(|_| ApiError::BadRequest("sessionId must be an integer".to_string()))
}

// ---------------------------------------------------------------------------
// /login
// ---------------------------------------------------------------------------

async fn login(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
) -> axum::response::Response {
    let started = Instant::now();
    let result = login_inner(&state, &params).await;
    let status = result.as_ref().map(|_| 200).unwrap_or_else(|e| status_of(e));
    log_request("/login", remote, started, status);
    match result {
        Ok(data) => ok(data),
        Err(e) => e.into_response(),
    }
}

async fn login_inner(state: &Arc<AppState>, params: &HashMap<String, String>) -> Result<Value, ApiError> {
    let user = required(params, "user")?;
    let password = required(params, "password")?;
    let (session_id, config) = state.sessions.login(user, password).await?;
    Ok(json!({ "sessionId": session_id, "config": config }))
}

// ---------------------------------------------------------------------------
// /logout
// ---------------------------------------------------------------------------

async fn logout(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
) -> axum::response::Response {
    let started = Instant::now();
    let result = (|| {
        let sid = parse_session_id(&params)?;
        state.sessions.logout(sid)
    })();
    let status = result.as_ref().map(|_| 200).unwrap_or_else(|e| status_of(e));
    log_request("/logout", remote, started, status);
    match result {
        Ok(()) => ok(json!({})),
        Err(e) => e.into_response(),
    }
}

// ---------------------------------------------------------------------------
// /config
// ---------------------------------------------------------------------------

async fn update_config(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
) -> axum::response::Response {
    let started = Instant::now();
    let result = (|| {
        let sid = parse_session_id(&params)?;
        let raw = required(&params, "config")?;
        let config: UserConfig =
            serde_json::from_str(raw).map_err(|e| ApiError::BadRequest(format!("invalid config JSON: {e}")))?;
        state.sessions.update_config(sid, config)
    })();
    let status = result.as_ref().map(|_| 200).unwrap_or_else(|e| status_of(e));
    log_request("/config", remote, started, status);
    match result {
        Ok(()) => ok(json!({})),
        Err(e) => e.into_response(),
    }
}

// ---------------------------------------------------------------------------
// /detect
// ---------------------------------------------------------------------------

async fn detect(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
) -> axum::response::Response {
    let started = Instant::now();
    let result = (|| {
        let sid = parse_session_id(&params)?;
        state.sessions.poll_detect(sid)
    })();
    let status = result.as_ref().map(|_| 200).unwrap_or_else(|e| status_of(e));
    log_request("/detect", remote, started, status);
    match result {
        Ok((events, is_full)) => ok(json!({ "events": events, "isFull": is_full })),
        Err(e) => e.into_response(),
    }
}

// ---------------------------------------------------------------------------
// /stockexchanges
// ---------------------------------------------------------------------------

async fn stockexchanges(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
) -> axum::response::Response {
    let started = Instant::now();
    let result = (|| {
        let sid = parse_session_id(&params)?;
        state.sessions.touch(sid)
    })();
    let status = result.as_ref().map(|_| 200).unwrap_or_else(|e| status_of(e));
    log_request("/stockexchanges", remote, started, status);
    match result {
        Ok(()) => ok(json!({ "venues": state.venues() })),
        Err(e) => e.into_response(),
    }
}

// ---------------------------------------------------------------------------
// /klinesidlist
// ---------------------------------------------------------------------------

async fn klinesidlist(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
) -> axum::response::Response {
    let started = Instant::now();
    let result = (|| {
        let sid = parse_session_id(&params)?;
        state.sessions.touch(sid)?;
        let venue_id = required(&params, "venueId")?;
        Ok::<_, ApiError>(state.history.kline_ids(venue_id))
    })();
    let status = result.as_ref().map(|_| 200).unwrap_or_else(|e| status_of(e));
    log_request("/klinesidlist", remote, started, status);
    match result {
        Ok(ids) => {
            let ids: Vec<Value> = ids
                .into_iter()
                .map(|(symbol, interval): (String, KLineInterval)| json!({ "symbol": symbol, "interval": interval }))
                .collect();
            ok(json!({ "ids": ids }))
        }
        Err(e) => e.into_response(),
    }
}

// ---------------------------------------------------------------------------
// /serverstatus
// ---------------------------------------------------------------------------

async fn serverstatus(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> axum::response::Response {
    let started = Instant::now();
    let data = json!({
        "name": SERVER_NAME,
        "version": SERVER_VERSION,
        "now": chrono::Utc::now().to_rfc3339(),
        "uptimeSec": state.uptime_secs(),
        "usersOnline": state.sessions.users_online(),
    });
    log_request("/serverstatus", remote, started, 200);
    ok(data)
}

fn status_of(err: &ApiError) -> u16 {
    match err {
        ApiError::BadRequest(_) => 400,
        ApiError::Unauthorized => 401,
        ApiError::NotFound => 404,
    }
}
