//! Operator endpoints for terminal pods.
//!
//! - `GET    /api/terminal/{assessment_id}/pods`              — list pods
//! - `DELETE /api/terminal/{assessment_id}/pods/{session_id}` — destroy pod

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};
use tracing::info;

use crate::k8s::workload::SessionKey;
use crate::state::AppState;

/// `GET /api/terminal/{assessment_id}/pods` — every pod for the
/// assessment, with the reaper-relevant annotations surfaced.
pub async fn list_pods(
    State(state): State<AppState>,
    Path(assessment_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let pods = state
        .workload
        .list_pods(&assessment_id)
        .await
        .map_err(|e| {
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": e.to_string(), "code": "CLUSTER_ERROR"})),
            )
        })?;

    let pods_json: Vec<Value> = pods
        .iter()
        .map(|p| {
            json!({
                "name": p.name,
                "namespace": p.namespace,
                "session_id": p.session_id,
                "ready": p.ready,
                "address": p.address,
                "last_activity": p.last_activity.map(|ts| ts.to_rfc3339()),
                "ttl": p.ttl.map(|ttl| humantime::format_duration(ttl).to_string()),
            })
        })
        .collect();

    Ok(Json(json!({
        "assessment_id": assessment_id,
        "pods": pods_json,
    })))
}

/// `DELETE /api/terminal/{assessment_id}/pods/{session_id}` — delete the
/// pod backing one session. Idempotent: deleting a pod that is already
/// gone succeeds.
pub async fn destroy_pod(
    State(state): State<AppState>,
    Path((assessment_id, session_id)): Path<(String, String)>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let key = SessionKey {
        assessment_id,
        session_id,
    };
    let timeout = Duration::from_secs(state.config.cluster.delete_timeout_secs);

    tokio::time::timeout(timeout, state.workload.destroy(&key))
        .await
        .map_err(|_| {
            (
                StatusCode::GATEWAY_TIMEOUT,
                Json(json!({"error": "Pod deletion timed out", "code": "DELETE_TIMEOUT"})),
            )
        })?
        .map_err(|e| {
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": e.to_string(), "code": "CLUSTER_ERROR"})),
            )
        })?;

    info!(
        "Terminal pod destroyed via API (assessment {}, session {})",
        key.assessment_id, key.session_id
    );
    Ok(Json(json!({
        "ok": true,
        "assessment_id": key.assessment_id,
        "session_id": key.session_id,
    })))
}
