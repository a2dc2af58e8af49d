use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use parafrase::api::{self, AppState};
use parafrase::config::ServerConfig;
use parafrase::inference::T5Service;
use parafrase::paraphrase::Paraphraser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------
    // Logging
    // -----------------------------
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env()?;
    info!(mode = %config.mode, bind = %config.bind, "🚀 Starting paraphrase server");

    // -----------------------------
    // Model
    // -----------------------------
    let settings = config.model.clone();
    let model = tokio::task::spawn_blocking(move || T5Service::load(&settings)).await??;

    let paraphraser = Paraphraser::new(Arc::new(model), config.mode).with_seed(config.seed);
    let app = api::router(AppState { paraphraser });

    // -----------------------------
    // Serve
    // -----------------------------
    let listener = TcpListener::bind(config.bind).await?;
    info!("🌐 HTTP listening on http://{}", config.bind);
    info!("🛠 POST http://{}/paraphrase", config.bind);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
