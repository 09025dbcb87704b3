//! Thin HTTP surface.
//!
//! The exec endpoint translates HTTP into bus envelopes; everything else
//! reads the operational store and the ledger. Controllers never go through
//! this layer.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::adapters::sqlite::{AuditLog, CellEventRepo, SpawnRequestRepo};
use crate::domain::models::envelope::{inbox_subject, validate_identifier};
use crate::domain::models::{
    Cell, Envelope, ObjectMeta, RecursionSpec, SpawnDecision, SpawnPolicy, SpawnRequestStatus,
};
use crate::domain::ports::{Bus, ResourceStore};
use crate::services::cell_tree::CellTreeStore;
use crate::services::ledger::BudgetLedger;
use crate::services::recursion::RecursionValidator;

#[derive(Clone)]
pub struct ApiState {
    pub bus: Arc<dyn Bus>,
    pub ledger: BudgetLedger,
    pub tree: CellTreeStore,
    pub events: CellEventRepo,
    pub spawn_requests: SpawnRequestRepo,
    pub audit: AuditLog,
    pub validator: Arc<RecursionValidator>,
    pub cells: Arc<dyn ResourceStore<Cell>>,
}

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    Forbidden(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::Forbidden(message) => (StatusCode::FORBIDDEN, message),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, message),
            Self::Internal(message) => {
                tracing::error!(error = %message, "internal API error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({ "ok": false, "error": message }))).into_response()
    }
}

fn internal(err: impl std::fmt::Display) -> ApiError {
    ApiError::Internal(err.to_string())
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/cells/:name/exec", post(exec))
        .route("/api/v1/cells/:name/events", get(cell_events))
        .route("/api/v1/budgets/:cell_id", get(budget_balance))
        .route("/api/v1/budgets/:cell_id/history", get(budget_history))
        .route("/api/v1/tree/:cell_id", get(tree_subtree))
        .route("/api/v1/spawn-requests", get(list_spawn_requests))
        .route("/api/v1/spawn-requests/:id/decide", post(decide_spawn_request))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

/// Bind and serve until the listener fails.
pub async fn serve(state: ApiState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "API listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

// ============================================================================
// exec
// ============================================================================

#[derive(Debug, Deserialize)]
struct ExecRequest {
    message: String,
    #[serde(default)]
    namespace: Option<String>,
}

async fn exec(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(body): Json<ExecRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let namespace = body.namespace.unwrap_or_else(|| "default".to_string());

    // Identifier validation happens before anything touches the bus.
    if !validate_identifier(&name) {
        return Err(ApiError::BadRequest(format!("invalid cell name '{name}'")));
    }
    if !validate_identifier(&namespace) {
        return Err(ApiError::BadRequest(format!("invalid namespace '{namespace}'")));
    }

    let envelope = Envelope::message("api", &name, body.message);
    state
        .bus
        .publish(&inbox_subject(&namespace, &name), &envelope)
        .await
        .map_err(internal)?;

    Ok(Json(json!({ "ok": true, "messageId": envelope.id })))
}

// ============================================================================
// reads
// ============================================================================

#[derive(Debug, Deserialize)]
struct ListParams {
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    status: Option<String>,
}

async fn cell_events(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let namespace = params.namespace.unwrap_or_else(|| "default".to_string());
    let limit = params.limit.unwrap_or(50).clamp(1, 500);

    let events = state
        .events
        .list_for_cell(&namespace, &name, limit)
        .await
        .map_err(internal)?;

    let items: Vec<serde_json::Value> = events
        .iter()
        .map(|e| {
            json!({
                "id": e.id,
                "type": e.event_type,
                "payload": e.payload,
                "createdAt": e.created_at,
            })
        })
        .collect();
    Ok(Json(json!({ "ok": true, "events": items })))
}

async fn budget_balance(
    State(state): State<ApiState>,
    Path(cell_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let balance = state
        .ledger
        .get_balance(&cell_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::NotFound(format!("no budget record for cell '{cell_id}'")))?;

    Ok(Json(json!({
        "ok": true,
        "balance": {
            "cellId": balance.cell_id,
            "allocated": balance.allocated,
            "spent": balance.spent,
            "delegated": balance.delegated,
            "available": balance.available(),
        }
    })))
}

async fn budget_history(
    State(state): State<ApiState>,
    Path(cell_id): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    let history = state.ledger.get_history(&cell_id, limit).await.map_err(internal)?;
    Ok(Json(json!({ "ok": true, "history": history })))
}

async fn tree_subtree(
    State(state): State<ApiState>,
    Path(cell_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let subtree = state.tree.subtree(&cell_id).await.map_err(internal)?;
    if subtree.is_empty() {
        return Err(ApiError::NotFound(format!("cell '{cell_id}' not in tree")));
    }
    Ok(Json(json!({ "ok": true, "nodes": subtree })))
}

// ============================================================================
// spawn requests
// ============================================================================

async fn list_spawn_requests(
    State(state): State<ApiState>,
    Query(params): Query<ListParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = params
        .status
        .as_deref()
        .map(SpawnRequestStatus::from_str)
        .transpose()
        .map_err(ApiError::BadRequest)?;

    let requests = state.spawn_requests.list(status).await.map_err(internal)?;
    Ok(Json(json!({ "ok": true, "requests": requests })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DecideRequest {
    approve: bool,
    #[serde(default)]
    decided_by: Option<String>,
}

/// Approve or reject a pending spawn request. Approval re-runs validation
/// (limits may have changed since the request was queued) and materializes
/// the child on success.
async fn decide_spawn_request(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<DecideRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = Uuid::from_str(&id).map_err(|_| ApiError::BadRequest(format!("invalid request id '{id}'")))?;
    let actor = body.decided_by.unwrap_or_else(|| "operator".to_string());

    let request = state
        .spawn_requests
        .get(id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::NotFound(format!("spawn request '{id}' not found")))?;

    if request.status != SpawnRequestStatus::Pending {
        return Err(ApiError::BadRequest(format!("spawn request '{id}' already decided")));
    }

    if !body.approve {
        state
            .spawn_requests
            .decide(id, SpawnRequestStatus::Rejected, &actor)
            .await
            .map_err(internal)?;
        state
            .audit
            .record(&actor, "spawn.reject", &id.to_string(), None)
            .await
            .map_err(internal)?;
        return Ok(Json(json!({ "ok": true, "status": "rejected" })));
    }

    // Re-validate with the approval granted: the policy gate is lifted, the
    // structural limits still apply.
    let recursion = RecursionSpec {
        spawn_policy: SpawnPolicy::Open,
        ..request.input.spec.recursion.unwrap_or_default()
    };
    let decision = state
        .validator
        .validate(&recursion, &request.input)
        .await
        .map_err(internal)?;

    if let SpawnDecision::Denied { reason } = &decision {
        return Err(ApiError::Forbidden(reason.clone()));
    }

    // Materialize the child: resource, tree node, and delegated budget.
    let meta = ObjectMeta::named(&request.input.cell_name, &request.namespace);
    state
        .cells
        .create(Cell::new(meta, request.input.spec.clone()))
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    state
        .tree
        .register_child(&request.parent_cell_id, &request.input.cell_name)
        .await
        .map_err(internal)?;
    if let Some(budget) = request.input.budget {
        state
            .ledger
            .allocate(&request.parent_cell_id, &request.input.cell_name, budget)
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    }

    state
        .spawn_requests
        .decide(id, SpawnRequestStatus::Approved, &actor)
        .await
        .map_err(internal)?;
    state
        .audit
        .record(&actor, "spawn.approve", &id.to_string(), Some(&request.input.cell_name))
        .await
        .map_err(internal)?;

    Ok(Json(json!({ "ok": true, "status": "approved", "cell": request.input.cell_name })))
}
