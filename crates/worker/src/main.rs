use anyhow::Context;
use reportflow_infra::config::Settings;
use reportflow_observability::LogFormat;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env()?;
    let format = settings.log_format.parse::<LogFormat>();
    reportflow_observability::init(format.clone().unwrap_or_default());
    if let Err(e) = format {
        tracing::warn!("{e}; using json logs");
    }

    let services = reportflow_worker::services::build_services(&settings).await?;
    let (app, runtime) = reportflow_worker::build_app(services, &settings);

    let listener = tokio::net::TcpListener::bind(&settings.http_bind)
        .await
        .with_context(|| format!("failed to bind {}", settings.http_bind))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    runtime.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
