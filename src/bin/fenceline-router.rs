use anyhow::Context;
use fenceline::config::AppConfig;
use fenceline::router::WriteRouter;
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
        .router
        .unwrap_or_default();

    let router = WriteRouter::new(&config, Arc::new(MysqlExecutor))
        .map_err(|err| anyhow::anyhow!("build router: {err}"))?;

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("bind to {}", config.listen))?;
    let metrics_listener = TcpListener::bind(&config.metrics_listen)
        .await
        .with_context(|| format!("bind metrics to {}", config.metrics_listen))?;

    info!(
        addr = %config.listen,
        ledger = %config.ledger_addr,
        range_id = %config.range_id,
        "router listening"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics_task = tokio::spawn(serve_until(
        metrics_listener,
        router.metrics().app(),
        shutdown_rx,
    ));

    axum::serve(listener, router.app())
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("serve router")?;

    let _ = metrics_task.await;
    info!("router stopped");
    Ok(())
}

async fn serve_until(
    listener: TcpListener,
    app: axum::Router,
    mut shutdown: watch::Receiver<bool>,
) {
    let _ = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
