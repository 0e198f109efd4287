#![forbid(unsafe_code)]

//! Axum backend exposing the import pipeline over JSON.
//!
//! Every handler is a thin mapping onto one pipeline operation; errors come
//! back as `{ "error": message, "kind": variant }`.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    extract::{Path as AxumPath, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use commentvault_tools::{
    ImportError, ImportPipeline, PrepareResponse,
    commit::CommitStats,
    config::{RuntimeOverrides, resolve_runtime_config},
    logging::init_tracing,
    metadata::{TagId, TagRecord, VideoRecord},
    reconcile::ReconcileReport,
};
use serde::Deserialize;
use tokio::signal;
use tracing::{debug, error, info};
use uuid::Uuid;

const STAGING_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct BackendArgs {
    database_path: Option<PathBuf>,
    port: Option<u16>,
    host: Option<String>,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut database_path: Option<PathBuf> = None;
        let mut port: Option<u16> = None;
        let mut host: Option<String> = None;
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--database=") {
                database_path = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                port = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--host=") {
                host = Some(value.to_string());
                continue;
            }

            match arg.as_str() {
                "--database" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--database requires a value"))?;
                    database_path = Some(PathBuf::from(value));
                }
                "--port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--port requires a value"))?;
                    port = Some(parse_port_arg(&value)?);
                }
                "--host" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--host requires a value"))?;
                    host = Some(value);
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }

        Ok(Self {
            database_path,
            port,
            host,
        })
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/COMMENTVAULT_HOST")
}

/// Shared state injected into every Axum handler.
#[derive(Clone)]
struct AppState {
    pipeline: ImportPipeline,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "bad_request",
            message: message.into(),
        }
    }
}

impl From<ImportError> for ApiError {
    fn from(err: ImportError) -> Self {
        let status = match &err {
            ImportError::InvalidSource(_) | ImportError::MalformedSource(_) => {
                StatusCode::BAD_REQUEST
            }
            ImportError::Validation(_) | ImportError::InvalidTag(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ImportError::ImportExpired(_) => StatusCode::GONE,
            ImportError::VideoNotFound(_) => StatusCode::NOT_FOUND,
            ImportError::ImportFailed { .. } => StatusCode::CONFLICT,
            ImportError::SourceUnavailable { .. } | ImportError::MalformedResponse { .. } => {
                StatusCode::BAD_GATEWAY
            }
            ImportError::Storage(_) | ImportError::Staging(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            error!(kind = err.kind(), error = %err, "request failed");
        }
        Self {
            status,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        let body = serde_json::json!({
            "error": self.message,
            "kind": self.kind,
        });
        (self.status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrepareRequest {
    source: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ConfirmRequest {
    #[serde(default)]
    tags: Vec<TagId>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTagRequest {
    name: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let BackendArgs {
        database_path,
        port,
        host,
    } = BackendArgs::parse()?;

    let config = resolve_runtime_config(RuntimeOverrides {
        database_path,
        port,
        host,
        ..RuntimeOverrides::default()
    })?;
    let listen_host = parse_host_arg(&config.host)?;
    let pipeline = ImportPipeline::from_config(&config)
        .await
        .context("initializing import pipeline")?;

    spawn_staging_purge(pipeline.clone());
    let app = router(AppState { pipeline });

    let addr = SocketAddr::new(listen_host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(%addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/imports", post(prepare_import))
        .route("/api/imports/{id}/confirm", post(confirm_import))
        .route("/api/imports/{id}", delete(cancel_import))
        .route("/api/videos", get(list_videos))
        .route("/api/videos/{id}/reconcile", post(reconcile_video))
        .route("/api/tags", get(list_tags).post(create_tag))
        .fallback(api_fallback)
        .with_state(state)
}

/// Expired staging entries are invisible anyway; this only bounds memory.
fn spawn_staging_purge(pipeline: ImportPipeline) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STAGING_PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            let purged = pipeline.staging().purge_expired();
            if purged > 0 {
                debug!(purged, "purged expired pending imports");
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "failed to install Ctrl+C handler");
    }
}

async fn api_fallback() -> ApiError {
    ApiError {
        status: StatusCode::NOT_FOUND,
        kind: "not_found",
        message: "endpoint not found".into(),
    }
}

fn parse_import_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| ApiError::bad_request(format!("invalid import id: {raw}")))
}

async fn prepare_import(
    State(state): State<AppState>,
    Json(request): Json<PrepareRequest>,
) -> ApiResult<Json<PrepareResponse>> {
    Ok(Json(state.pipeline.prepare(&request.source).await?))
}

async fn confirm_import(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(request): Json<ConfirmRequest>,
) -> ApiResult<Json<CommitStats>> {
    let import_id = parse_import_id(&id)?;
    Ok(Json(state.pipeline.confirm(import_id, &request.tags).await?))
}

async fn cancel_import(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<StatusCode> {
    let import_id = parse_import_id(&id)?;
    state.pipeline.cancel(import_id);
    Ok(StatusCode::NO_CONTENT)
}

async fn list_videos(State(state): State<AppState>) -> ApiResult<Json<Vec<VideoRecord>>> {
    Ok(Json(state.pipeline.store().list_videos().await?))
}

async fn reconcile_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<ReconcileReport>> {
    Ok(Json(state.pipeline.reconcile(&id).await?))
}

async fn list_tags(State(state): State<AppState>) -> ApiResult<Json<Vec<TagRecord>>> {
    Ok(Json(state.pipeline.store().list_tags().await?))
}

async fn create_tag(
    State(state): State<AppState>,
    Json(request): Json<CreateTagRequest>,
) -> ApiResult<(StatusCode, Json<TagRecord>)> {
    let id = state.pipeline.store().create_tag(&request.name).await?;
    Ok((
        StatusCode::CREATED,
        Json(TagRecord {
            id,
            name: request.name.trim().to_string(),
        }),
    ))
}
