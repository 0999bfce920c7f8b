// Agent service main entry point.
use agent::config::AgentConfig;
use agent::{AppState, api, collect, observability};
use anyhow::{Context, Result};
use std::future::Future;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("skiff-agent");

    let config = AgentConfig::from_env_or_yaml()?;
    // Expose Prometheus metrics on the configured bind address.
    tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));

    let state = AppState::new(config.clone());

    // Host collectors refresh the snapshot store on their own cadence.
    let collector_task = tokio::spawn(collect::run_collectors(
        state.store.clone(),
        config.collect_interval(),
    ));

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("bind {}", config.bind))?;
    tracing::info!(addr = %listener.local_addr()?, "agent listening");

    let manager = state.manager.clone();
    let server_task = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, api::router(state)).await {
            tracing::warn!(error = %err, "http server exited");
        }
    });

    // Block until SIGINT so the process stays alive.
    shutdown.await;
    manager.shutdown_all();
    server_task.abort();
    collector_task.abort();
    tracing::info!("agent stopped");
    Ok(())
}
