use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use axum::{
    Json,
    extract::State,
    http,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::handler::AppState;

#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self) -> Result<(), String>;
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ReadinessReport {
    pub status: &'static str,
    pub checks: BTreeMap<String, String>,
}

pub async fn run_checks(checks: &[Arc<dyn HealthCheck>]) -> ReadinessReport {
    let mut report = ReadinessReport {
        status: "ok",
        checks: BTreeMap::new(),
    };
    for check in checks {
        let outcome = match check.check().await {
            Ok(()) => "ok".to_string(),
            Err(e) => {
                tracing::warn!(check = check.name(), "readiness check failed: {e}");
                report.status = "unavailable";
                e
            }
        };
        report.checks.insert(check.name().to_string(), outcome);
    }
    report
}

pub async fn handle_healthz() -> Response {
    (http::StatusCode::OK, "ok").into_response()
}

pub async fn handle_readyz(State(state): State<Arc<AppState>>) -> Response {
    let report = run_checks(&state.health_checks).await;
    let status = if report.status == "ok" {
        http::StatusCode::OK
    } else {
        http::StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}
