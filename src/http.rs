//! HTTP surface
//!
//! Routes:
//!
//! - `POST /stats/:id` — submit a [`StatsUpdate`] for a contributor
//! - `GET /stats/:dim` — query one dimension's rollups (`/stats/` = all);
//!   `/stats/country` is served from the single-slot TTL cache when warm
//! - `GET /stream/:dim/:key/:statType/:statName` — WebSocket; frames carry
//!   one interval's projected values each, starting with buffered history
//!
//! Every body is a JSON envelope `{succeeded, error?, …payload}`.

use crate::cache::SnapshotCache;
use crate::engine::{DimSnapshot, StatsHub};
use crate::error::Error;
use crate::stream::{StreamFilter, StreamHandle, StreamingUpdate, Subscription};
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Dimension served through the TTL cache
const CACHED_DIM: &str = "country";

/// Shared state behind every handler
pub struct AppState {
    /// The rollup engine
    pub hub: Arc<StatsHub>,
    /// Streaming fan-out handle
    pub stream: StreamHandle,
    /// Fast-path cache for the country query
    pub country_cache: SnapshotCache,
    /// Cache TTL
    pub cache_ttl: Duration,
}

/// Build the hub's router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/stats/", get(get_all_stats).post(post_stats_no_id))
        .route("/stats/:id", get(get_stats).post(post_stats))
        .route(
            "/stream/:dim/:key/:stat_type/:stat_name",
            get(stream_stats),
        )
        .with_state(state)
}

// ============================================================================
// Envelope
// ============================================================================

/// Envelope common to every response body
#[derive(Debug, Serialize)]
pub struct ResponseEnvelope {
    /// Whether the request succeeded
    pub succeeded: bool,
    /// Failure description, present only on errors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseEnvelope {
    fn ok() -> Self {
        Self {
            succeeded: true,
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Serialize)]
struct QueryResponse {
    #[serde(flatten)]
    envelope: ResponseEnvelope,
    dims: DimSnapshot,
}

#[derive(Debug, Serialize)]
struct StreamFrame {
    #[serde(flatten)]
    envelope: ResponseEnvelope,
    #[serde(rename = "asOfSeconds")]
    as_of_seconds: i64,
    values: BTreeMap<String, i64>,
}

fn failure(status: StatusCode, err: &Error) -> HttpResponse {
    (status, Json(ResponseEnvelope::err(err.to_string()))).into_response()
}

fn status_for(err: &Error) -> StatusCode {
    if err.is_validation() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

// ============================================================================
// Stats handlers
// ============================================================================

async fn post_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Result<Json<crate::model::StatsUpdate>, JsonRejection>,
) -> HttpResponse {
    let update = match body {
        Ok(Json(update)) => update,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ResponseEnvelope::err(format!(
                    "unable to decode request: {rejection}"
                ))),
            )
                .into_response();
        }
    };

    let id = if id.is_empty() { "unknown".to_string() } else { id };
    match state.hub.write(&id, &update).await {
        Ok(()) => (StatusCode::OK, Json(ResponseEnvelope::ok())).into_response(),
        Err(e) => {
            if !e.is_validation() {
                error!(error = %e, id = %id, "unable to post stats");
            }
            failure(status_for(&e), &e)
        }
    }
}

async fn post_stats_no_id(
    state: State<Arc<AppState>>,
    body: Result<Json<crate::model::StatsUpdate>, JsonRejection>,
) -> HttpResponse {
    post_stats(state, Path(String::new()), body).await
}

async fn get_all_stats(State(state): State<Arc<AppState>>) -> HttpResponse {
    serve_query(&state, "").await
}

async fn get_stats(State(state): State<Arc<AppState>>, Path(dim): Path<String>) -> HttpResponse {
    serve_query(&state, &dim).await
}

async fn serve_query(state: &AppState, dim: &str) -> HttpResponse {
    let cacheable = dim == CACHED_DIM;
    if cacheable {
        if let Some(bytes) = state.country_cache.get() {
            return json_bytes(bytes);
        }
        debug!("country stats not cached, querying");
    }

    let dim_names: Vec<String> = if dim.is_empty() {
        Vec::new()
    } else {
        vec![dim.to_string()]
    };

    match state.hub.query_dims(&dim_names).await {
        Ok(dims) => {
            let response = QueryResponse {
                envelope: ResponseEnvelope::ok(),
                dims,
            };
            match serde_json::to_vec(&response) {
                Ok(bytes) => {
                    if cacheable {
                        state.country_cache.set(bytes.clone(), state.cache_ttl);
                    }
                    json_bytes(bytes)
                }
                Err(e) => {
                    error!(error = %e, "unable to serialize query response");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(ResponseEnvelope::err("serialization failed")),
                    )
                        .into_response()
                }
            }
        }
        Err(e) => {
            error!(error = %e, "unable to query stats");
            failure(status_for(&e), &e)
        }
    }
}

fn json_bytes(bytes: Vec<u8>) -> HttpResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        bytes,
    )
        .into_response()
}

// ============================================================================
// Streaming handler
// ============================================================================

async fn stream_stats(
    State(state): State<Arc<AppState>>,
    Path((dim, key, stat_type, stat_name)): Path<(String, String, String, String)>,
    ws: WebSocketUpgrade,
) -> HttpResponse {
    let filter = match StreamFilter::parse(&dim, &key, &stat_type, &stat_name) {
        Ok(filter) => filter,
        Err(e) => return failure(StatusCode::BAD_REQUEST, &e),
    };
    ws.on_upgrade(move |socket| serve_subscriber(state, socket, filter))
}

/// Run one subscriber: a writer task draining the mailbox into the socket
/// and a reader task watching for peer close. Either side ending moves the
/// subscriber to CLOSED and deregisters it.
async fn serve_subscriber(state: Arc<AppState>, socket: WebSocket, filter: StreamFilter) {
    let Some(subscription) = state.stream.subscribe(filter.clone()).await else {
        return;
    };
    let id = subscription.id;

    let (sender, receiver) = socket.split();
    let mut writer = tokio::spawn(write_frames(sender, subscription, filter));
    let mut reader = tokio::spawn(watch_close(receiver));

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    state.stream.unsubscribe(id).await;
    debug!(subscriber = id, "stream subscriber disconnected");
}

async fn write_frames(
    mut sender: SplitSink<WebSocket, Message>,
    mut subscription: Subscription,
    filter: StreamFilter,
) {
    while let Some(update) = subscription.updates.recv().await {
        let frame = frame_update(&update, &filter);
        let encoded = match serde_json::to_string(&frame) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!(error = %e, "unable to encode stream frame");
                continue;
            }
        };
        if sender.send(Message::Text(encoded)).await.is_err() {
            return;
        }
    }
}

async fn watch_close(mut receiver: SplitStream<WebSocket>) {
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Close(_)) | Err(_) => return,
            _ => {}
        }
    }
}

fn frame_update(update: &StreamingUpdate, filter: &StreamFilter) -> StreamFrame {
    StreamFrame {
        envelope: ResponseEnvelope::ok(),
        as_of_seconds: update.as_of.timestamp(),
        values: filter.project(update),
    }
}
