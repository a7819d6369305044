use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ratemyrest_recs::{
    api::{create_router, AppState},
    config::Config,
    db::{create_pool, create_redis_client, Cache, PgStore, RecommendationStore},
    jobs::{spawn_scheduler, SimilarityRefreshJob},
    services::RecommendationEngine,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let settings = config.engine_settings();

    let pool = create_pool(&config.database_url).await?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;
    let store: Arc<dyn RecommendationStore> =
        Arc::new(PgStore::new(pool, settings.similarity_batch_size));

    let refresh_job = Arc::new(SimilarityRefreshJob::new(store.clone(), settings.clone()));

    // One-shot maintenance run, e.g. from cron
    if std::env::args().nth(1).as_deref() == Some("refresh-similarities") {
        let stats = refresh_job.run().await;
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let (cache, cache_writer) = if config.cache_enabled {
        let client = create_redis_client(&config.redis_url)?;
        let (cache, writer) =
            Cache::new(client, Duration::from_millis(config.cache_timeout_ms)).await;
        (Some(cache), Some(writer))
    } else {
        tracing::info!("Recommendation cache disabled");
        (None, None)
    };

    let engine = Arc::new(RecommendationEngine::new(store, cache, settings));

    let scheduler = (config.maintenance_interval_secs > 0).then(|| {
        spawn_scheduler(
            refresh_job.clone(),
            Duration::from_secs(config.maintenance_interval_secs),
        )
    });

    let app = create_router(AppState::new(engine, refresh_job));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(%addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = scheduler {
        handle.abort();
    }
    if let Some(writer) = cache_writer {
        writer.shutdown().await;
    }
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}
