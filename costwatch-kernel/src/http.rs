/**
 * API REST COSTWATCH - Serveur HTTP principal du kernel
 *
 * RÔLE :
 * Expose l'état du kernel, les plugins et leurs routes, le flux WebSocket
 * d'événements et la surface minimale projets/sources qui alimente le scheduler.
 *
 * ROUTES :
 * - GET  /health                              → "ok"
 * - GET  /readyz                              → 200 ready / 503 not ready
 * - GET  /api/v1/health                       → état détaillé du kernel
 * - GET  /api/v1/plugins                      → plugins enregistrés et leur état
 * - GET  /api/v1/stream                       → WebSocket d'événements
 * - GET  /api/v1/{allocation,assets,cloudcost,customcost} → proxy OpenCost
 * - GET  /api/v1/plugins/{name}{path}         → routes déclarées par les plugins
 * - GET|POST /api/v1/projects
 * - GET  /api/v1/projects/{id}
 * - GET|POST /api/v1/projects/{id}/sources
 * - GET  /api/v1/projects/{id}/costs
 *
 * ERREURS : toujours `{"error": "<message>"}`
 */

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use costwatch_sdk::models::{CostRecord, CostSource, Project};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::collectors::CollectorRegistry;
use crate::health::{HealthTracker, KernelHealth};
use crate::hub::EventHub;
use crate::plugins::PluginManager;
use crate::proxy::{self, OpenCostProxy};
use crate::store::{NewCostSource, NewProject, Store, StoreError};
use crate::stream::stream_handler;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub registry: Arc<CollectorRegistry>,
    pub plugins: Arc<PluginManager>,
    pub hub: Arc<EventHub>,
    pub health: HealthTracker,
    pub opencost: Arc<OpenCostProxy>,
    /// Jeton racine : les connexions WebSocket en dérivent
    pub shutdown: CancellationToken,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
    #[error("{0}")]
    BadGateway(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => ApiError::NotFound(format!("{} not found", what)),
            StoreError::Invalid(msg) => ApiError::BadRequest(msg),
            other => {
                error!(error = %other, "[http] store failure");
                ApiError::Internal("storage failure".into())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn build_router(app_state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(get_health))
        .route("/plugins", get(list_plugins))
        .route("/stream", get(stream_handler))
        .route("/projects", get(list_projects).post(create_project))
        .route("/projects/{id}", get(get_project))
        .route("/projects/{id}/sources", get(list_sources).post(create_source))
        .route("/projects/{id}/costs", get(get_costs))
        .merge(proxy::routes());
    let api = app_state.plugins.mount_routes(api);

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/readyz", get(get_readiness))
        .nest("/api/v1", api)
        .with_state(app_state)
}

// GET /readyz
async fn get_readiness(State(app): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    if app.health.is_ready() {
        (StatusCode::OK, Json(json!({ "status": "ready" })))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "not ready" })))
    }
}

// GET /api/v1/health
async fn get_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health.get_health())
}

// GET /api/v1/plugins
async fn list_plugins(State(app): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "plugins": app.plugins.list_plugin_info() }))
}

fn parse_body<T: DeserializeOwned>(body: serde_json::Value) -> Result<T, ApiError> {
    serde_json::from_value(body)
        .map_err(|e| ApiError::BadRequest(format!("invalid request body: {}", e)))
}

// GET /api/v1/projects
async fn list_projects(State(app): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let projects = app.store.list_projects().await?;
    Ok(Json(json!({ "projects": projects })))
}

// POST /api/v1/projects
async fn create_project(
    State(app): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<Project>), ApiError> {
    let new: NewProject = parse_body(body)?;
    let project = app.store.create_project(new).await?;
    info!(project = %project.id, name = %project.name, "[http] project created");
    Ok((StatusCode::CREATED, Json(project)))
}

// GET /api/v1/projects/{id}
async fn get_project(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Project>, ApiError> {
    Ok(Json(app.store.get_project(&id).await?))
}

// GET /api/v1/projects/{id}/sources
async fn list_sources(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    app.store.get_project(&id).await?;
    let sources = app.store.list_cost_sources(&id).await?;
    Ok(Json(json!({ "sources": sources })))
}

// POST /api/v1/projects/{id}/sources (config validée par le collecteur du type)
async fn create_source(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<CostSource>), ApiError> {
    let new: NewCostSource = parse_body(body)?;
    if new.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name and type are required".into()));
    }
    app.store.get_project(&id).await?;

    match app.registry.get(new.source_type) {
        Some(collector) => collector
            .validate(&new.config)
            .map_err(|e| ApiError::BadRequest(e.to_string()))?,
        None => warn!(
            source_type = %new.source_type,
            "[http] no collector for this source type, it will not be collected"
        ),
    }

    let source = app.store.create_cost_source(&id, new).await?;
    info!(
        project = %id,
        source = %source.id,
        source_type = %source.source_type,
        "[http] cost source created"
    );
    Ok((StatusCode::CREATED, Json(source)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CostSummary {
    project_id: String,
    record_count: usize,
    total_list_cost: f64,
    total_net_cost: f64,
    total_amortized_cost: f64,
    by_provider: BTreeMap<String, f64>,
    records: Vec<CostRecord>,
}

fn summarize(project_id: String, records: Vec<CostRecord>) -> CostSummary {
    let mut by_provider = BTreeMap::new();
    for r in &records {
        *by_provider.entry(r.provider.clone()).or_insert(0.0) += r.net_cost;
    }
    CostSummary {
        project_id,
        record_count: records.len(),
        total_list_cost: records.iter().map(|r| r.list_cost).sum(),
        total_net_cost: records.iter().map(|r| r.net_cost).sum(),
        total_amortized_cost: records.iter().map(|r| r.amortized_cost).sum(),
        by_provider,
        records,
    }
}

// GET /api/v1/projects/{id}/costs
async fn get_costs(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CostSummary>, ApiError> {
    app.store.get_project(&id).await?;
    let records = app.store.list_cost_records(&id).await?;
    Ok(Json(summarize(id, records)))
}
