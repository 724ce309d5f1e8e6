use anyhow::Context;
use tracing::info;

use paysettle_api::app::{build_app, services};
use paysettle_infra::{db, AppConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    paysettle_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let pool = db::connect(config.database_url()?, config.database_max_connections)
        .await
        .context("failed to initialise database")?;

    let (app_services, workers) = services::start(&config, services::Backends::postgres(pool));
    let app = build_app(app_services);

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address))?;
    info!(address = %listener.local_addr()?, workers = config.worker_count, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    let report = workers.shutdown(config.shutdown_grace).await;
    info!(
        drained = report.drained,
        forced_cancellations = report.forced_cancellations,
        processed = report.stats.jobs_processed,
        "shutdown complete"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
