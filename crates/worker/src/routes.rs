//! Health endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tracing::error;

use reportflow_infra::dlq::DeadLetterQueueService;
use reportflow_infra::jobs::{JobQueue, QueueCounts};

use crate::runtime::Runtime;
use crate::services::Backend;

/// Shared state of the health routes.
#[derive(Clone)]
pub struct HealthState {
    backend: Backend,
    queues: Vec<Arc<dyn JobQueue>>,
    dead_letter: Arc<DeadLetterQueueService>,
}

impl HealthState {
    pub fn from_runtime(runtime: &Runtime) -> Self {
        let services = runtime.services();
        Self {
            backend: services.backend,
            queues: services.queues().into_iter().cloned().collect(),
            dead_letter: runtime.dead_letter().clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    backend: Backend,
    queues: BTreeMap<String, QueueCounts>,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/dlq", get(dlq_health))
        .layer(Extension(Arc::new(state)))
}

async fn health(Extension(state): Extension<Arc<HealthState>>) -> Response {
    let mut queues = BTreeMap::new();
    for queue in &state.queues {
        match queue.counts().await {
            Ok(counts) => {
                queues.insert(queue.name().to_string(), counts);
            }
            Err(e) => {
                error!(queue = queue.name(), error = %e, "queue unreachable");
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({ "status": "unavailable", "queue": queue.name() })),
                )
                    .into_response();
            }
        }
    }

    Json(HealthResponse {
        status: "ok",
        backend: state.backend,
        queues,
    })
    .into_response()
}

/// 200 while the dead letter backlog is under its threshold, 503 otherwise.
async fn dlq_health(Extension(state): Extension<Arc<HealthState>>) -> Response {
    match state.dead_letter.get_health_status().await {
        Ok(health) => {
            let code = if health.healthy {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            (code, Json(health)).into_response()
        }
        Err(e) => {
            error!(error = %e, "dead letter health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "healthy": false, "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
