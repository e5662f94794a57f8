//! tally-server
//!
//! Long-running service that:
//! - Pulls marketplace orders on a schedule
//! - Posts VAT-split sales documents to the ERP
//! - Pushes tracking numbers back to marketplaces
//! - Retries failed work with backoff

use tally_server::adapters::AdapterRegistry;
use tally_server::tasks::{BackgroundTasks, TaskKind};
use tally_server::{Config, Engine, api, logger, workers};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("configuration error: {e}"))?;
    logger::init_logger(&config.log_level, config.log_json, config.log_dir.as_deref())?;
    if let Some(dir) = config.log_dir.as_deref() {
        let today = chrono::Utc::now().date_naive();
        match logger::cleanup_old_logs(std::path::Path::new(dir), today) {
            Ok(0) => {}
            Ok(n) => tracing::info!(removed = n, "Old log files removed"),
            Err(e) => tracing::warn!(error = %e, "Log cleanup failed"),
        }
    }

    tracing::info!("Starting tally-server (env: {})", config.environment);

    // Vendor clients register here
    let adapters = AdapterRegistry::new();
    if adapters.marketplace_codes().is_empty() {
        tracing::warn!("No marketplace adapters registered");
    }

    let engine = Engine::connect(config, adapters)
        .await
        .map_err(|e| anyhow::anyhow!("startup failed: {e}"))?;
    workers::recover_interrupted(&engine).await;

    let mut tasks = BackgroundTasks::new();
    workers::spawn_all(&mut tasks, &engine);

    let http_addr = format!("0.0.0.0:{}", engine.config.http_port);
    let listener = tokio::net::TcpListener::bind(&http_addr).await?;
    tracing::info!("tally-server HTTP listening on {http_addr}");
    let app = api::create_router(engine.clone());
    let token = tasks.shutdown_token();
    tasks.spawn("http_server", TaskKind::Server, async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(token.cancelled_owned());
        if let Err(e) = serve.await {
            tracing::error!("HTTP server error: {e}");
        }
    });
    tasks.log_summary();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    tasks.shutdown().await;

    Ok(())
}
