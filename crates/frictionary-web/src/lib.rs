//! Axum JSON API for Frictionary.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::{to_bytes, Bytes},
    extract::{ConnectInfo, Path as AxumPath, Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use frictionary_sync::{ServiceError, SuggestionService, VoteError};
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{error, info};

pub mod session;

use session::{new_session_id, session_cookie, session_from_headers, SessionStore};

pub const CRATE_NAME: &str = "frictionary-web";

const MAX_VOTE_BODY_BYTES: usize = 4 * 1024;

pub struct AppState {
    pub service: SuggestionService,
    pub sessions: SessionStore,
}

impl AppState {
    pub fn new(service: SuggestionService) -> Self {
        Self {
            service,
            sessions: SessionStore::default(),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/sites", get(sites_handler))
        .route("/suggestions/{site}", get(suggestions_handler))
        .route("/vote/{suggestion}", post(vote_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(service: SuggestionService, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(
        listener,
        app(AppState::new(service)).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn sites_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({ "data": state.service.sites() })).into_response()
}

async fn suggestions_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(site): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    let (session_id, is_new) = match session_from_headers(&headers) {
        Some(id) => (id, false),
        None => (new_session_id(), true),
    };
    let seen = state.sessions.seen(&session_id);

    let mut response = match state.service.request_suggestions(&site, &seen).await {
        Ok(page) => {
            state.sessions.mark_seen(&session_id, &page.newly_seen);
            Json(json!({ "data": page.suggestions })).into_response()
        }
        Err(err @ ServiceError::UnknownSite(_)) => error_response(StatusCode::NOT_FOUND, &err),
        Err(err) => {
            error!(site, error = %err, "failed to load suggestions");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &err)
        }
    };

    if is_new {
        if let Some(cookie) = session_cookie(&session_id) {
            response.headers_mut().insert(header::SET_COOKIE, cookie);
        }
    }
    response
}

async fn vote_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(suggestion): AxumPath<String>,
    request: Request,
) -> Response {
    let remote = client_address(&request);
    let body = match to_bytes(request.into_body(), MAX_VOTE_BODY_BYTES).await {
        Ok(body) => body,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, &VoteError::InvalidVote),
    };
    let Some(vote) = parse_vote_body(&body) else {
        return error_response(StatusCode::BAD_REQUEST, &VoteError::InvalidVote);
    };

    match state.service.cast_vote(&remote, &suggestion, vote).await {
        Ok(votes) => Json(json!({ "status": "OK", "votes": votes })).into_response(),
        Err(err) => {
            let status = match &err {
                VoteError::InvalidVote => StatusCode::BAD_REQUEST,
                VoteError::AlreadyVoted => StatusCode::FORBIDDEN,
                VoteError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
                VoteError::NotFound(_) => StatusCode::NOT_FOUND,
                VoteError::Store(_) => {
                    error!(suggestion, error = %err, "failed to record vote");
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            error_response(status, &err)
        }
    }
}

fn error_response(status: StatusCode, err: &dyn std::fmt::Display) -> Response {
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

/// First `X-Forwarded-For` hop, else the socket peer.
fn client_address(request: &Request) -> String {
    let forwarded = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(addr) = forwarded {
        return addr.to_string();
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// `{"vote": n}` where `n` is a number or a string with a leading integer.
fn parse_vote_body(body: &Bytes) -> Option<i64> {
    let value: JsonValue = serde_json::from_slice(body).ok()?;
    match value.get("vote")? {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        JsonValue::String(s) => leading_integer(s),
        _ => None,
    }
}

fn leading_integer(input: &str) -> Option<i64> {
    let s = input.trim_start();
    let (sign, digits) = match s.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, s.strip_prefix('+').unwrap_or(s)),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse::<i64>().ok().map(|n| sign * n)
}
