use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::{
    config::SinkCfg,
    error::SinkError,
    paths::ImageRef,
    sink::{CommitReport, ImageSink},
};

#[derive(Clone)]
pub struct AppState {
    sink: ImageSink,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualSaveRequest {
    pub images: Vec<ImageRef>,
    #[serde(default)]
    pub filename_prefix: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManualSaveResponse {
    pub saved: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<FailedItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedItem {
    pub filename: String,
    pub error: String,
}

pub fn manual_save_path(namespace: &str) -> String { format!("/{namespace}/manual_save") }

pub fn router(sink: ImageSink, namespace: &str) -> Router {
    Router::new()
        .route(&manual_save_path(namespace), post(manual_save))
        .route(&format!("/{namespace}/health"), get(health))
        .layer(CorsLayer::permissive())
        .with_state(AppState { sink })
}

pub async fn serve(cfg: SinkCfg) -> Result<()> {
    tokio::fs::create_dir_all(&cfg.output_dir).await?;
    tokio::fs::create_dir_all(&cfg.temp_dir).await?;

    let app = router(cfg.build_sink(), &cfg.namespace);
    let listener = tokio::net::TcpListener::bind(&cfg.bind).await?;
    info!(bind = %cfg.bind, route = %manual_save_path(&cfg.namespace), "preview-sink listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> &'static str { "ok" }

async fn manual_save(
    State(st): State<AppState>,
    Json(req): Json<ManualSaveRequest>,
) -> Result<(StatusCode, Json<ManualSaveResponse>), ApiErr> {
    if req.images.is_empty() {
        return Err(ApiErr::from(SinkError::EmptyBatch));
    }
    let report = st.sink.commit(&req.images, &req.filename_prefix).await.map_err(ApiErr::from)?;
    respond(report)
}

fn respond(report: CommitReport) -> Result<(StatusCode, Json<ManualSaveResponse>), ApiErr> {
    if report.saved.is_empty() {
        return Err(ApiErr::all_failed(&report.failed));
    }
    let status = if report.is_complete() { StatusCode::OK } else { StatusCode::MULTI_STATUS };
    let body = ManualSaveResponse {
        saved: report.saved.iter().map(|p| p.display().to_string()).collect(),
        failed: report
            .failed
            .iter()
            .map(|(r, e)| FailedItem { filename: r.filename.clone(), error: e.to_string() })
            .collect(),
    };
    if status != StatusCode::OK {
        warn!(saved = body.saved.len(), failed = body.failed.len(), "manual save partially succeeded");
    }
    Ok((status, Json(body)))
}

/// Failures render as plain text.
#[derive(Debug)]
struct ApiErr {
    status: StatusCode,
    message: String,
}

impl ApiErr {
    fn all_failed(failed: &[(ImageRef, SinkError)]) -> Self {
        let status = if failed.iter().all(|(_, e)| matches!(e, SinkError::NotFound(_))) {
            StatusCode::NOT_FOUND
        } else if failed.iter().all(|(_, e)| e.is_client_error()) {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        let message = failed
            .iter()
            .map(|(r, e)| format!("{}: {e}", r.filename))
            .collect::<Vec<_>>()
            .join("; ");
        Self { status, message: format!("No images were saved. {message}") }
    }
}

impl From<SinkError> for ApiErr {
    fn from(e: SinkError) -> Self {
        let status = match &e {
            SinkError::NotFound(_) => StatusCode::NOT_FOUND,
            e if e.is_client_error() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self { status, message: e.to_string() }
    }
}

impl IntoResponse for ApiErr {
    fn into_response(self) -> axum::response::Response {
        if self.status.is_server_error() {
            error!(status = %self.status, error = %self.message, "manual save failed");
        } else {
            warn!(status = %self.status, error = %self.message, "manual save rejected");
        }
        (self.status, self.message).into_response()
    }
}
