use anyhow::Context;
use fenceline::config::AppConfig;
use fenceline::ledger::LedgerService;
use fenceline::store::DurableStore;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = AppConfig::load(std::env::args().nth(1).map(PathBuf::from))
        .context("load config")?
        .ledger
        .unwrap_or_default();

    let store = DurableStore::open(&config.data_path)
        .with_context(|| format!("open store at {}", config.data_path.display()))?;
    let service = LedgerService::new(&config, store).context("build ledger service")?;

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("bind to {}", config.listen))?;
    let metrics_listener = TcpListener::bind(&config.metrics_listen)
        .await
        .with_context(|| format!("bind metrics to {}", config.metrics_listen))?;

    info!(
        addr = %config.listen,
        leader = %config.leader_addr(),
        peers = config.peers.len(),
        data = %config.data_path.display(),
        "ledger listening"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics_task = tokio::spawn(serve_until(
        metrics_listener,
        service.metrics().app(),
        shutdown_rx,
    ));

    axum::serve(listener, service.app())
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("serve ledger")?;

    let _ = metrics_task.await;
    info!("ledger stopped");
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
