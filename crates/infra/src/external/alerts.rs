//! Operator alerting.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, warn};

/// Alert about a system-level issue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemAlert {
    pub component: String,
    pub message: String,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl SystemAlert {
    pub fn new(
        component: impl Into<String>,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            component: component.into(),
            message: message.into(),
            details,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("alert delivery failed: {0}")]
pub struct AlertError(pub String);

#[async_trait]
pub trait AlertService: Send + Sync {
    async fn alert_system_issue(&self, alert: SystemAlert) -> Result<(), AlertError>;
}

/// Send an alert; delivery failures are logged and swallowed.
pub async fn alert_fire_and_forget(alerts: &dyn AlertService, alert: SystemAlert) {
    let component = alert.component.clone();
    if let Err(e) = alerts.alert_system_issue(alert).await {
        error!(component = %component, error = %e, "failed to send system alert");
    }
}

/// Writes alerts to the log at `warn`.
#[derive(Debug, Default, Clone)]
pub struct TracingAlertService;

#[async_trait]
impl AlertService for TracingAlertService {
    async fn alert_system_issue(&self, alert: SystemAlert) -> Result<(), AlertError> {
        warn!(
            component = %alert.component,
            details = %alert.details,
            timestamp = %alert.timestamp,
            "system alert: {}",
            alert.message
        );
        Ok(())
    }
}

/// Records alerts for assertions in tests.
#[derive(Debug, Default)]
pub struct InMemoryAlertService {
    alerts: Mutex<Vec<SystemAlert>>,
}

impl InMemoryAlertService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<SystemAlert> {
        self.alerts.lock().await.clone()
    }
}

#[async_trait]
impl AlertService for InMemoryAlertService {
    async fn alert_system_issue(&self, alert: SystemAlert) -> Result<(), AlertError> {
        self.alerts.lock().await.push(alert);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    #[async_trait]
    impl AlertService for Broken {
        async fn alert_system_issue(&self, _alert: SystemAlert) -> Result<(), AlertError> {
            Err(AlertError("smtp down".to_string()))
        }
    }

    #[tokio::test]
    async fn fire_and_forget_swallows_delivery_failures() {
        alert_fire_and_forget(&Broken, SystemAlert::new("test", "hello", serde_json::json!({}))).await;
    }

    #[tokio::test]
    async fn in_memory_service_records_alerts() {
        let alerts = InMemoryAlertService::new();
        alert_fire_and_forget(&alerts, SystemAlert::new("backup", "done", serde_json::json!({"n": 1}))).await;
        let recorded = alerts.all().await;
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].component, "backup");
    }
}
