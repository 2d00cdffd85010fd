//! API routes for medgated
//!
//! Failed calls still return the structured response body; the HTTP status
//! mirrors the error code so plain HTTP clients can branch on it.

use crate::audit_store::{AuditCursor, DEFAULT_PAGE_SIZE};
use crate::server::AppState;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use medgate_shared::analytics::{UsageAnalytics, DEFAULT_TOP_TASKS};
use medgate_shared::audit::{AuditFilter, ModelCallAudit};
use medgate_shared::request::{ProcessRequest, ProcessResponse, RequestMetadata, WorkflowResult};
use medgate_shared::VERSION;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

type AppStateArc = Arc<AppState>;

/// Largest page a client may ask for
const MAX_PAGE_SIZE: usize = 2000;

fn status_for(code: Option<&str>) -> StatusCode {
    match code {
        None => StatusCode::OK,
        Some("VALIDATION_ERROR") => StatusCode::BAD_REQUEST,
        Some("SECURITY_VIOLATION") | Some("PERMISSION_DENIED") => StatusCode::FORBIDDEN,
        Some("UNKNOWN_WORKFLOW") => StatusCode::NOT_FOUND,
        Some("ALL_MODELS_FAILED") => StatusCode::BAD_GATEWAY,
        Some(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Fill request metadata from headers when the caller left it out
fn with_client_metadata(mut req: ProcessRequest, headers: &HeaderMap) -> ProcessRequest {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    };
    let meta = req.metadata.get_or_insert_with(RequestMetadata::default);
    if meta.ip.is_none() {
        meta.ip = header("x-forwarded-for").and_then(|v| v.split(',').next().map(|s| s.trim().to_string()));
    }
    if meta.user_agent.is_none() {
        meta.user_agent = header("user-agent");
    }
    req
}

// ============================================================================
// Process Routes
// ============================================================================

pub fn process_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/v1/process", post(process))
        .route("/v1/batch", post(batch))
}

async fn process(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    Json(req): Json<ProcessRequest>,
) -> (StatusCode, Json<ProcessResponse>) {
    let req = with_client_metadata(req, &headers);
    let response = state.mediator.process(req).await;
    (status_for(response.error_code()), Json(response))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchRequest {
    pub requests: Vec<ProcessRequest>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchResponse {
    pub responses: Vec<ProcessResponse>,
    pub succeeded: usize,
    pub failed: usize,
}

async fn batch(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    Json(body): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, (StatusCode, String)> {
    if body.requests.len() > state.max_batch_size {
        warn!("Batch of {} rejected (max {})", body.requests.len(), state.max_batch_size);
        return Err((
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("batch holds {} requests, limit is {}", body.requests.len(), state.max_batch_size),
        ));
    }
    info!("Processing batch of {} requests", body.requests.len());

    let requests = body
        .requests
        .into_iter()
        .map(|r| with_client_metadata(r, &headers))
        .collect();
    let responses = state.mediator.process_batch(requests).await;
    let succeeded = responses.iter().filter(|r| r.success).count();
    let failed = responses.len() - succeeded;

    Ok(Json(BatchResponse {
        responses,
        succeeded,
        failed,
    }))
}

// ============================================================================
// Workflow Routes
// ============================================================================

pub fn workflow_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/v1/workflows", get(list_workflows))
        .route("/v1/workflows/:name", post(run_workflow))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkflowInfo {
    pub name: String,
    pub description: String,
    pub required_roles: Vec<String>,
    pub steps: usize,
}

async fn list_workflows(State(state): State<AppStateArc>) -> Json<Vec<WorkflowInfo>> {
    let catalog = state.mediator.workflows();
    let infos = catalog
        .names()
        .filter_map(|name| catalog.get(name).ok())
        .map(|def| WorkflowInfo {
            name: def.name.clone(),
            description: def.description.clone(),
            required_roles: def.required_roles.iter().map(|r| r.as_str().to_string()).collect(),
            steps: def.steps.len(),
        })
        .collect();
    Json(infos)
}

async fn run_workflow(
    State(state): State<AppStateArc>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ProcessRequest>,
) -> (StatusCode, Json<WorkflowResult>) {
    let req = with_client_metadata(req, &headers);
    let result = state.mediator.execute_workflow(&name, req).await;
    let code = result.error.as_ref().map(|e| e.code.as_str());
    (status_for(code), Json(result))
}

// ============================================================================
// Audit & Analytics Routes
// ============================================================================

pub fn audit_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/v1/audit", get(audit_log))
        .route("/v1/analytics", get(analytics))
}

#[derive(Debug, Default, Deserialize)]
pub struct AuditQuery {
    pub user_id: Option<String>,
    pub model_name: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    /// Cursor from a previous page
    pub after_ts: Option<i64>,
    pub after_id: Option<String>,
    /// Analytics only: number of task types to rank
    pub top: Option<usize>,
}

impl AuditQuery {
    fn filter(&self) -> AuditFilter {
        AuditFilter {
            user_id: self.user_id.clone(),
            model_name: self.model_name.clone(),
            start: self.start,
            end: self.end,
        }
    }

    fn cursor(&self) -> Option<AuditCursor> {
        match (self.after_ts, &self.after_id) {
            (Some(ts_micros), Some(id)) => Some(AuditCursor {
                ts_micros,
                id: id.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuditLogResponse {
    pub records: Vec<ModelCallAudit>,
    pub next: Option<AuditCursor>,
}

async fn audit_log(
    State(state): State<AppStateArc>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<AuditLogResponse>, (StatusCode, String)> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let cursor = query.cursor();
    let page = state
        .mediator
        .get_audit_page(&query.filter(), cursor.as_ref(), limit)
        .await
        .map_err(|e| {
            error!("Audit query failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;

    Ok(Json(AuditLogResponse {
        records: page.records,
        next: page.next,
    }))
}

async fn analytics(
    State(state): State<AppStateArc>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<UsageAnalytics>, (StatusCode, String)> {
    let top = query.top.unwrap_or(DEFAULT_TOP_TASKS);
    let summary = state
        .mediator
        .get_usage_analytics(&query.filter(), top)
        .await
        .map_err(|e| {
            error!("Analytics query failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;
    Ok(Json(summary))
}

// ============================================================================
// Health Routes
// ============================================================================

pub fn health_routes() -> Router<AppStateArc> {
    Router::new().route("/v1/health", get(health))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub active_sessions: usize,
    pub providers: Vec<String>,
    pub workflows: Vec<String>,
}

async fn health(State(state): State<AppStateArc>) -> Json<HealthResponse> {
    let mediator = &state.mediator;
    Json(HealthResponse {
        status: "ok".to_string(),
        version: VERSION.to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        active_sessions: mediator.active_sessions().await,
        providers: mediator.registered_models(),
        workflows: mediator.workflows().names().map(|n| n.to_string()).collect(),
    })
}
