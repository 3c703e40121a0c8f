use anyhow::Context;
use fenceline::agent::ApplyAgent;
use fenceline::config::AppConfig;
use fenceline::sql::MysqlExecutor;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = AppConfig::load(std::env::args().nth(1).map(PathBuf::from))
        .context("load config")?
        .agent
        .unwrap_or_default();

    let agent = ApplyAgent::new(&config, Arc::new(MysqlExecutor))
        .map_err(|err| anyhow::anyhow!("build agent: {err}"))?;
    let metrics = agent.metrics();

    let metrics_listener = TcpListener::bind(&config.metrics_listen)
        .await
        .with_context(|| format!("bind metrics to {}", config.metrics_listen))?;

    info!(
        ledger = %config.ledger_addr,
        backend = %format!("{}:{}", config.sql_host, config.sql_port),
        from = config.start_commit_index,
        "agent starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let apply_task = tokio::spawn(agent.run(shutdown_rx.clone()));

    let mut metrics_shutdown = shutdown_rx;
    axum::serve(metrics_listener, metrics.app())
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                    let _ = shutdown_tx.send(true);
                }
                _ = metrics_shutdown.changed() => {}
            }
        })
        .await
        .context("serve metrics")?;

    let _ = apply_task.await;
    info!("agent stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
