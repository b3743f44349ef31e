//! HTTP surface
//!
//! - `GET /api/stream?stream=<id>&stream=<id>&startIndex=<n>` multiplexed SSE
//! - `GET /api/state/:stream` catch-up read as JSON
//! - `GET /healthz`
//!
//! Authentication happens upstream. A request carrying the viewer header is
//! treated as signed in and may also see `auth:private` streams.

use crate::client::VIEWER_HEADER;
use crate::core::RunStateError;
use crate::resolver::{StreamResolver, StreamSnapshot};
use crate::stream::{MuxOptions, spawn_mux};
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::Stream;
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

pub const PUBLIC_TAG: &str = "auth:public";
pub const PRIVATE_TAG: &str = "auth:private";

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug)]
pub enum WebError {
    RunState(RunStateError),
    Input(String),
    NotFound(String),
}

impl From<RunStateError> for WebError {
    fn from(err: RunStateError) -> Self {
        WebError::RunState(err)
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let (status, message, code) = match self {
            WebError::RunState(err @ RunStateError::AlreadyOwned { .. }) => {
                (StatusCode::CONFLICT, err.to_string(), "conflict")
            }
            WebError::RunState(RunStateError::NotFound(msg)) => {
                (StatusCode::NOT_FOUND, msg, "not_found")
            }
            WebError::RunState(err) if err.is_transient() => (
                StatusCode::SERVICE_UNAVAILABLE,
                err.to_string(),
                "backend_unavailable",
            ),
            WebError::RunState(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                err.to_string(),
                "internal_error",
            ),
            WebError::Input(msg) => (StatusCode::BAD_REQUEST, msg, "input_error"),
            WebError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, "not_found"),
        };

        let body = Json(ErrorResponse {
            error: message,
            code: code.to_string(),
        });

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, WebError>;

#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<StreamResolver>,
    pub mux: MuxOptions,
}

impl AppState {
    pub fn new(resolver: Arc<StreamResolver>, mux: MuxOptions) -> Self {
        Self { resolver, mux }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/stream", get(stream_events))
        .route("/api/state/:stream", get(stream_state))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Tags that make a stream visible to this request
fn visibility(headers: &HeaderMap) -> Vec<String> {
    let mut tags = vec![PUBLIC_TAG.to_string()];
    if headers.contains_key(VIEWER_HEADER) {
        tags.push(PRIVATE_TAG.to_string());
    }
    tags
}

fn parse_start_index(params: &[(String, String)]) -> Result<u64> {
    params
        .iter()
        .find(|(key, _)| key == "startIndex")
        .map(|(_, value)| {
            value.parse::<u64>().map_err(|_| {
                WebError::Input(format!("startIndex must be a non-negative integer, got '{value}'"))
            })
        })
        .transpose()
        .map(|start| start.unwrap_or(0))
}

async fn stream_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Response> {
    let requested: Vec<String> = params
        .iter()
        .filter(|(key, _)| key == "stream")
        .map(|(_, value)| value.clone())
        .collect();
    let start = parse_start_index(&params)?;

    let visible = state
        .resolver
        .visible_streams(&requested, &visibility(&headers))
        .await?;
    let sources = state.resolver.open_readers(&visible, start).await?;
    debug!(
        requested = requested.len(),
        opened = sources.len(),
        start,
        "opening stream connection"
    );

    // the body owns the guard: a client disconnect drops it and cancels the pump
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let mut rx = spawn_mux(sources, cancel, state.mux);

    let body = async_stream::stream! {
        let _guard = guard;
        while let Some(event) = rx.recv().await {
            yield Ok::<Bytes, Infallible>(Bytes::from(event.to_sse_frame()));
        }
    };
    Ok(sse_response(body))
}

async fn stream_state(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(stream_id): Path<String>,
) -> Result<Json<StreamSnapshot>> {
    let ids = [stream_id.clone()];
    let visible = state
        .resolver
        .visible_streams(&ids, &visibility(&headers))
        .await?;
    if visible.is_empty() {
        return Err(WebError::NotFound(format!("no run holds stream '{stream_id}'")));
    }

    let snapshot = state.resolver.get_stream_state(&stream_id, None).await?;
    Ok(Json(snapshot))
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

pub fn sse_response<S>(stream: S) -> Response
where
    S: Stream<Item = std::result::Result<Bytes, Infallible>> + Send + 'static,
{
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    (headers, Body::from_stream(stream)).into_response()
}
