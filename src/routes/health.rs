//! Liveness probe.

use axum::Json;
use serde_json::{json, Value};

/// `GET /api/health` — always 200 while the process is serving.
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
