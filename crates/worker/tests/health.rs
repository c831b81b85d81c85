use std::time::Duration;

use reportflow_core::{Company, CompanyId, Owner, ReportSchedule, RunStatus, UserId};
use reportflow_infra::config::Settings;
use reportflow_infra::db::{InMemoryDatabase, ReportRunRepository};
use reportflow_infra::jobs::{Job, JobOptions};
use reportflow_infra::scheduling::{ReportQueuer, GENERATE_REPORT_JOB, REPORT_QUEUE};
use reportflow_worker::runtime::Runtime;
use reportflow_worker::services::{build_in_memory_services, Services};
use reqwest::StatusCode;
use serde_json::json;

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
    runtime: Runtime,
}

impl TestServer {
    async fn spawn(services: Services, settings: Settings) -> Self {
        // Same router and workers as prod, bound to an ephemeral port.
        let (app, runtime) = reportflow_worker::build_app(services, &settings);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            handle,
            runtime,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn fast_settings() -> Settings {
    Settings {
        poll_interval: Duration::from_millis(10),
        dlq_poll_interval: Duration::from_millis(10),
        backup_check_interval: Duration::from_secs(1),
        ..Settings::default()
    }
}

#[tokio::test]
async fn health_reports_backend_and_queues() {
    let server = TestServer::spawn(build_in_memory_services(), fast_settings()).await;

    let res = reqwest::get(format!("{}/health", server.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["backend"], "in-memory");
    assert!(body["queues"]["report-generation"].is_object());
    assert!(body["queues"]["dead-letter-queue"].is_object());
    assert!(body["queues"]["backup-report-scheduler"].is_object());
}

#[tokio::test]
async fn dlq_health_is_ok_with_an_empty_backlog() {
    let server = TestServer::spawn(build_in_memory_services(), fast_settings()).await;

    let res = reqwest::get(format!("{}/health/dlq", server.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["healthy"], true);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["failedJobs"], 0);
}

#[tokio::test]
async fn dlq_health_is_unavailable_above_threshold() {
    let mut settings = fast_settings();
    settings.dlq.degraded_threshold = 0;
    let server = TestServer::spawn(build_in_memory_services(), settings).await;

    let job = Job::new(
        REPORT_QUEUE,
        GENERATE_REPORT_JOB,
        json!({}),
        JobOptions::default(),
    );
    server
        .runtime
        .dead_letter()
        .capture_failed_job(&job, "invalid API key")
        .await
        .unwrap();

    let res = reqwest::get(format!("{}/health/dlq", server.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["healthy"], false);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["failedJobs"], 1);
}

#[tokio::test]
async fn queued_report_is_generated_by_the_running_workers() {
    let db = InMemoryDatabase::arc();
    let company = Company {
        id: CompanyId::new(),
        name: "Acme Analytics".to_string(),
        owner: Owner {
            id: UserId::new(),
            subscription_status: Some("active".to_string()),
            is_admin: false,
        },
        competitors: Vec::new(),
        schedule: ReportSchedule::Daily,
    };
    db.insert_company(company.clone()).await;

    let services = Services {
        companies: db.clone(),
        runs: db.clone(),
        ..build_in_memory_services()
    };
    let server = TestServer::spawn(services, fast_settings()).await;

    let outcome = server
        .runtime
        .scheduler()
        .queue_report(company.id, false)
        .await
        .unwrap();

    let mut status = RunStatus::Pending;
    for _ in 0..200 {
        status = db.get(outcome.run_id).await.unwrap().unwrap().status;
        if status == RunStatus::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, RunStatus::Completed);
}

#[tokio::test]
async fn backup_check_runs_on_startup() {
    let server = TestServer::spawn(build_in_memory_services(), fast_settings()).await;

    let mut succeeded = 0;
    for _ in 0..200 {
        succeeded = server
            .runtime
            .worker_stats()
            .into_iter()
            .find(|(name, _)| *name == "backup-scheduler")
            .map(|(_, stats)| stats.jobs_succeeded)
            .unwrap_or(0);
        if succeeded > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(succeeded >= 1);
}

#[tokio::test]
async fn runtime_shuts_down_cleanly() {
    let (_, runtime) = reportflow_worker::build_app(build_in_memory_services(), &fast_settings());
    tokio::time::timeout(Duration::from_secs(5), runtime.shutdown())
        .await
        .expect("runtime did not stop");
}
