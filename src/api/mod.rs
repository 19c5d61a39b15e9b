//! HTTP API handlers

pub mod resource;
pub mod ws;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::cache::{keys, ResourceCache};
use crate::mpd::{Command, CommandList, Executor, MpdError};
use crate::playlist::{Engine, EngineError, Filter, Outcome, SortSpec};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<ResourceCache>,
    pub engine: Engine,
    pub executor: Arc<dyn Executor>,
    pub ws_keepalive: Duration,
}

impl AppState {
    pub fn new(
        cache: Arc<ResourceCache>,
        engine: Engine,
        executor: Arc<dyn Executor>,
        ws_keepalive: Duration,
    ) -> Self {
        Self {
            cache,
            engine,
            executor,
            ws_keepalive,
        }
    }
}

/// All routes. Middleware is layered on by the caller.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/status", get(status_handler))
        .route("/api/version", get(resource_handler))
        // Player
        .route("/api/music", get(resource_handler).post(music_update_handler))
        .route("/api/music/stats", get(resource_handler))
        // Queue
        .route(
            "/api/music/playlist",
            get(resource_handler).post(playlist_sort_handler),
        )
        .route("/api/music/playlist/songs", get(resource_handler))
        .route("/api/music/playlist/songs/current", get(resource_handler))
        // Library
        .route(
            "/api/music/library",
            get(resource_handler).post(library_update_handler),
        )
        .route("/api/music/library/songs", get(resource_handler))
        // Outputs
        .route(
            "/api/music/outputs",
            get(resource_handler).post(outputs_update_handler),
        )
        // Change feed
        .route("/api/music/ws", get(ws::ws_handler))
        .with_state(state)
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Handler failures, mapped onto status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Mpd(#[from] MpdError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Mpd(MpdError::Ack(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Mpd(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Engine(EngineError::Mpd(MpdError::Ack(_))) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Engine(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("Request failed: {}", self);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

// =============================================================================
// Status and cached resources
// =============================================================================

#[derive(Serialize)]
pub struct StatusResponse {
    pub service: &'static str,
    pub version: &'static str,
    pub mpd_version: String,
    pub subscribers: usize,
}

/// GET /status - Service health
pub async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        service: env!("CARGO_PKG_NAME"),
        version: env!("MIRROR_VERSION"),
        mpd_version: state.executor.version().await,
        subscribers: state.cache.bus().subscriber_count(),
    })
}

/// GET on any mirrored resource; the request path is the cache key.
pub async fn resource_handler(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    resource::serve(&state.cache, uri.path(), &headers, None).await
}

// =============================================================================
// Player
// =============================================================================

/// POST /api/music body. Every field is optional; present ones are applied
/// as one command list.
#[derive(Debug, Default, Deserialize)]
pub struct PlayerRequest {
    pub state: Option<String>,
    pub volume: Option<u32>,
    pub repeat: Option<bool>,
    pub random: Option<bool>,
    pub single: Option<bool>,
    pub oneshot: Option<bool>,
    pub consume: Option<bool>,
    pub song_elapsed: Option<f64>,
    pub crossfade: Option<u32>,
    pub replay_gain: Option<String>,
}

fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

impl PlayerRequest {
    pub fn commands(&self) -> Result<CommandList, ApiError> {
        let mut list = CommandList::new();
        if let Some(state) = &self.state {
            let command = match state.as_str() {
                "play" => Command::new("play"),
                "pause" => Command::new("pause").arg("1"),
                "next" => Command::new("next"),
                "previous" => Command::new("previous"),
                other => {
                    return Err(ApiError::BadRequest(format!("unknown state: {}", other)));
                }
            };
            list.push(command);
        }
        if let Some(volume) = self.volume {
            list.push(Command::new("setvol").arg(volume.min(100)));
        }
        if let Some(repeat) = self.repeat {
            list.push(Command::new("repeat").arg(flag(repeat)));
        }
        if let Some(random) = self.random {
            list.push(Command::new("random").arg(flag(random)));
        }
        match (self.oneshot, self.single) {
            (Some(true), _) => {
                list.push(Command::new("single").arg("oneshot"));
            }
            (_, Some(single)) => {
                list.push(Command::new("single").arg(flag(single)));
            }
            (Some(false), None) => {
                list.push(Command::new("single").arg("0"));
            }
            (None, None) => {}
        }
        if let Some(consume) = self.consume {
            list.push(Command::new("consume").arg(flag(consume)));
        }
        if let Some(elapsed) = self.song_elapsed {
            list.push(Command::new("seekcur").arg(elapsed.max(0.0)));
        }
        if let Some(crossfade) = self.crossfade {
            list.push(Command::new("crossfade").arg(crossfade));
        }
        if let Some(mode) = &self.replay_gain {
            list.push(Command::new("replay_gain_mode").arg(mode));
        }
        if list.is_empty() {
            return Err(ApiError::BadRequest("no player field given".into()));
        }
        Ok(list)
    }
}

/// POST /api/music - Playback control
pub async fn music_update_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<PlayerRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body?;
    let commands = request.commands()?;
    let issued_at = Utc::now();
    state.executor.exec_batch(commands).await?;
    Ok(resource::serve(&state.cache, keys::MUSIC, &headers, Some(issued_at)).await)
}

// =============================================================================
// Playlist
// =============================================================================

/// POST /api/music/playlist body
#[derive(Debug, Deserialize)]
pub struct SortRequest {
    #[serde(default)]
    pub current: Option<i64>,
    pub sort: Option<Vec<String>>,
    pub filters: Option<Vec<Filter>>,
    #[serde(default)]
    pub must: Option<usize>,
}

impl SortRequest {
    pub fn into_spec(self) -> Result<SortSpec, ApiError> {
        let (Some(keys), Some(filters)) = (self.sort, self.filters) else {
            return Err(ApiError::BadRequest("sort and filters are required".into()));
        };
        if keys.is_empty() {
            return Err(ApiError::BadRequest("sort needs at least one tag".into()));
        }
        Ok(SortSpec {
            keys,
            filters,
            must: self.must.unwrap_or(0),
            target: self
                .current
                .filter(|c| *c >= 0)
                .and_then(|c| usize::try_from(c).ok()),
        })
    }
}

/// POST /api/music/playlist - Sort the queue
pub async fn playlist_sort_handler(
    State(state): State<AppState>,
    body: Result<Json<SortRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body?;
    let spec = request.into_spec()?;
    let response = match state.engine.sort(spec).await? {
        Outcome::Predicted(view) => (StatusCode::ACCEPTED, Json(view)).into_response(),
        Outcome::Confirmed(view) => (StatusCode::OK, Json(view)).into_response(),
    };
    Ok(response)
}

// =============================================================================
// Library and outputs
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct LibraryRequest {
    pub updating: bool,
}

/// POST /api/music/library - Start a database update
pub async fn library_update_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<LibraryRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body?;
    if !request.updating {
        return Err(ApiError::BadRequest("a running update cannot be stopped".into()));
    }
    let issued_at = Utc::now();
    state.executor.exec(Command::new("update")).await?;
    Ok(resource::serve(&state.cache, keys::LIBRARY, &headers, Some(issued_at)).await)
}

#[derive(Debug, Deserialize)]
pub struct OutputRequest {
    pub enabled: bool,
}

/// POST /api/music/outputs - Enable or disable outputs by id
pub async fn outputs_update_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<BTreeMap<String, OutputRequest>>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body?;
    if request.is_empty() {
        return Err(ApiError::BadRequest("no output given".into()));
    }
    let mut commands = CommandList::new();
    for (id, output) in &request {
        if id.parse::<u32>().is_err() {
            return Err(ApiError::BadRequest(format!("invalid output id: {}", id)));
        }
        let name = if output.enabled {
            "enableoutput"
        } else {
            "disableoutput"
        };
        commands.push(Command::new(name).arg(id));
    }
    let issued_at = Utc::now();
    state.executor.exec_batch(commands).await?;
    Ok(resource::serve(&state.cache, keys::OUTPUTS, &headers, Some(issued_at)).await)
}
