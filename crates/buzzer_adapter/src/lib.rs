#![forbid(unsafe_code)]

pub mod auth;
pub mod config;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use buzzer_contracts::device::{DeviceRecord, DeviceRegistration};
use buzzer_contracts::pitch::{NextPitchSnapshot, Pitch, PitchDocument, PitchDraft, PitchId};
use buzzer_engines::registry_client::{NextUpdateAck, RegistryErrorBody};
use buzzer_storage::{DeviceRegistry, NextPitchCache, PitchStore, StorageError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::auth::{require_basic_auth, BasicAuth};
use crate::config::RegistryServerConfig;

/// Exit status for configuration errors.
pub const EXIT_CONFIG: i32 = 2;
/// Exit status for hardware or storage initialization failures.
pub const EXIT_INIT: i32 = 1;

/// Shared state behind every registry route.
#[derive(Debug, Clone)]
pub struct RegistryState {
    pub store: Arc<PitchStore>,
    pub cache: Arc<NextPitchCache>,
    pub devices: Arc<DeviceRegistry>,
    pub auth: Option<Arc<BasicAuth>>,
}

impl RegistryState {
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(PitchStore::new_in_memory()),
            cache: Arc::new(NextPitchCache::new_in_memory()),
            devices: Arc::new(DeviceRegistry::new()),
            auth: None,
        }
    }

    pub fn open(config: &RegistryServerConfig) -> Result<Self, StorageError> {
        let store = match &config.store_path {
            Some(path) => PitchStore::open(path)?,
            None => PitchStore::new_in_memory(),
        };
        let cache = match &config.cache_path {
            Some(path) => NextPitchCache::load(path),
            None => NextPitchCache::new_in_memory(),
        };
        Ok(Self {
            store: Arc::new(store),
            cache: Arc::new(cache),
            devices: Arc::new(DeviceRegistry::new()),
            auth: config.auth.clone().map(Arc::new),
        })
    }

    pub fn with_auth(mut self, auth: BasicAuth) -> Self {
        self.auth = Some(Arc::new(auth));
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Storage(StorageError::Validation(_)) => StatusCode::BAD_REQUEST,
            ApiError::Storage(StorageError::NotFound { .. }) => StatusCode::NOT_FOUND,
            ApiError::Storage(StorageError::AlreadyReleased { .. }) => StatusCode::CONFLICT,
            ApiError::Storage(StorageError::Persistence { .. }) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        } else {
            debug!(status = status.as_u16(), error = %self, "request rejected");
        }
        let body = RegistryErrorBody {
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

// An id that cannot be valid cannot exist either.
fn parse_id(raw: &str) -> Result<PitchId, ApiError> {
    PitchId::new(raw).map_err(|_| {
        ApiError::Storage(StorageError::NotFound {
            id: raw.to_string(),
        })
    })
}

pub fn router(state: RegistryState) -> Router {
    Router::new()
        .route("/next", get(get_next).post(post_next))
        .route("/device", post(post_device))
        .route("/devices", get(list_devices))
        .route("/pitches", get(list_pitches).post(create_pitch))
        .route("/pitches/:id", get(get_pitch).delete(delete_pitch))
        .route("/pitches/:id/release", post(release_pitch))
        .route("/start/:id", get(release_pitch))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_basic_auth,
        ))
        .route("/healthz", get(healthz))
        .with_state(state)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub pitches: usize,
    pub devices: usize,
}

async fn healthz(State(state): State<RegistryState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        pitches: state.store.len(),
        devices: state.devices.len(),
    })
}

async fn get_next(State(state): State<RegistryState>) -> Json<PitchDocument> {
    Json(state.cache.get().to_document())
}

async fn post_next(
    State(state): State<RegistryState>,
    body: Result<Json<PitchDocument>, JsonRejection>,
) -> Result<Json<NextUpdateAck>, ApiError> {
    let Json(doc) = body?;
    let snapshot = NextPitchSnapshot::from_document(doc)
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;
    let changed = state.cache.set(snapshot);
    Ok(Json(NextUpdateAck { changed }))
}

async fn post_device(
    State(state): State<RegistryState>,
    body: Result<Json<DeviceRegistration>, JsonRejection>,
) -> Result<Json<DeviceRecord>, ApiError> {
    let Json(registration) = body?;
    Ok(Json(state.devices.register(registration, Utc::now())?))
}

async fn list_devices(State(state): State<RegistryState>) -> Json<Vec<DeviceRecord>> {
    Json(state.devices.list())
}

async fn list_pitches(State(state): State<RegistryState>) -> Json<Vec<Pitch>> {
    Json(state.store.list())
}

async fn create_pitch(
    State(state): State<RegistryState>,
    body: Result<Json<PitchDraft>, JsonRejection>,
) -> Result<(StatusCode, Json<Pitch>), ApiError> {
    let Json(draft) = body?;
    let pitch = state.store.add(draft, Utc::now())?;
    info!(pitch = %pitch.id, speaker = %pitch.speaker, "pitch added");
    Ok((StatusCode::CREATED, Json(pitch)))
}

async fn get_pitch(
    State(state): State<RegistryState>,
    Path(id): Path<String>,
) -> Result<Json<Pitch>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.store.get(&id)?))
}

async fn release_pitch(
    State(state): State<RegistryState>,
    Path(id): Path<String>,
) -> Result<Json<Pitch>, ApiError> {
    let id = parse_id(&id)?;
    let pitch = state.store.release(&id, Utc::now())?;
    info!(pitch = %pitch.id, "pitch released");
    Ok(Json(pitch))
}

async fn delete_pitch(
    State(state): State<RegistryState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    let removed = state.store.delete(&id)?;
    info!(pitch = %removed.id, "pitch deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Points the next-pitch cache at the store's next pitch. Returns whether the
/// cache changed.
pub fn announce_once(state: &RegistryState, now: DateTime<Utc>) -> bool {
    let snapshot = state
        .store
        .next(now)
        .map(NextPitchSnapshot::of)
        .unwrap_or_default();
    let id = snapshot.id_str().to_string();
    let changed = state.cache.set(snapshot);
    if changed {
        info!(%id, "next pitch announced");
    }
    changed
}

pub async fn run_announcer(state: RegistryState, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                announce_once(&state, Utc::now());
            }
        }
    }
    debug!("announcer stopped");
}

/// `RUST_LOG`-driven subscriber, `info` by default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}

/// Cancels `cancel` on Ctrl-C or SIGTERM.
pub async fn cancel_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("interrupt received"),
        _ = terminate => info!("terminate received"),
        _ = cancel.cancelled() => return,
    }
    cancel.cancel();
}

pub fn exit_config_error(err: &dyn std::fmt::Display) -> ! {
    error!(error = %err, "invalid configuration");
    eprintln!("configuration error: {err}");
    std::process::exit(EXIT_CONFIG)
}
