use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use ai_task_server::build_router;
use ai_task_server::config::Settings;
use ai_task_server::mq::{
    build_registry, connector_for_url, BrokerHealth, ConnectionManager, ConnectionOptions,
    MessagePublisher,
};
use ai_task_server::services::{
    CompletionService, ContextStore, GeminiService, ModelClient, ObjectStore, S3ObjectStore,
};
use ai_task_server::state::AppState;
use ai_task_server::utils::logger::init_logger;
use ai_task_server::utils::metrics::Metrics;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::load()?;

    init_logger(&settings.logging)?;
    info!("🚀 Starting AI Task Server...");
    info!("✅ Configuration loaded");

    let addr = settings.server.socket_addr()?;
    let metrics = Metrics::new();

    // Collaborators; missing credentials stop us here
    let model: Arc<dyn ModelClient> = Arc::new(GeminiService::new(settings.gemini.clone())?);
    let object_store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::new(&settings.storage)?);
    info!("✅ Model and object store clients ready");

    let completions = Arc::new(CompletionService::new(
        ContextStore::new(),
        model.clone(),
        &settings.gemini,
        metrics.clone(),
    ));

    // Broker topology and consumers
    let publisher = MessagePublisher::new(metrics.clone());
    let (registry, producers) = build_registry(
        &settings.broker,
        &settings.tasks,
        object_store,
        model,
        publisher.clone(),
    )?;

    let connector = connector_for_url(&settings.broker.url, &settings.broker.connection_name);
    let manager = ConnectionManager::initialize(
        connector,
        Arc::new(registry),
        publisher.clone(),
        metrics.clone(),
        ConnectionOptions::from(&settings.broker),
    )
    .await
    .context("broker startup failed")?;

    let state = Arc::new(AppState {
        settings: settings.clone(),
        completions,
        publisher,
        producers,
        broker_health: manager.health_receiver(),
        metrics,
    });

    let app = build_router(state);

    let served = serve(app, addr, manager.health_receiver()).await;
    let final_health = manager.health();

    manager.shutdown().await;

    served?;
    if let BrokerHealth::Failed { reason } = final_health {
        anyhow::bail!("broker connection lost: {}", reason);
    }

    info!("Server stopped");
    Ok(())
}

async fn serve(
    app: axum::Router,
    addr: SocketAddr,
    broker_health: watch::Receiver<BrokerHealth>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("🎯 Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(broker_health))
        .await?;
    Ok(())
}

async fn shutdown_signal(mut broker_health: watch::Receiver<BrokerHealth>) {
    let broker_failed = async move {
        let failed = broker_health
            .wait_for(|health| matches!(health, BrokerHealth::Failed { .. }))
            .await
            .is_ok();
        if !failed {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
        _ = broker_failed => error!("Broker unavailable, shutting down"),
    }
}
