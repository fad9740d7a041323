use anyhow::Context;
use avion_core::{build_app_with_state, load_config};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path =
        std::env::var("AVION_CONFIG").unwrap_or_else(|_| "./configs/avion.yaml".to_string());
    let config = load_config(&config_path).with_env();
    if config.proxy.api_key.is_none() {
        tracing::warn!("no vendor API key in the environment; the relay will answer 500");
    }

    let addr = config.proxy.listen;
    let (app, state) = build_app_with_state(config.proxy);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("listening on http://{addr}");
    state.set_ready();

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
