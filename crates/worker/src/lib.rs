//! Report worker process: background workers plus a small health API.

pub mod routes;
pub mod runtime;
pub mod services;

use axum::Router;

use reportflow_infra::config::Settings;

use crate::routes::HealthState;
use crate::runtime::Runtime;
use crate::services::Services;

/// Start the background tasks and build the health router over them.
pub fn build_app(services: Services, settings: &Settings) -> (Router, Runtime) {
    let runtime = Runtime::start(services, settings);
    let router = routes::router(HealthState::from_runtime(&runtime));
    (router, runtime)
}
