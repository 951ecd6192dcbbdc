use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use control_plane::{PgControlStore, StopFlag, Supervisor, SupervisorConfig};
use db_pool::{create_pool, DbConfig};
use reddit_scraper::api::RedditApi;
use reddit_scraper::config::RedditConfig;
use reddit_scraper::proxy::ProxyPool;
use reddit_scraper::services::RedditScraper;
use reddit_scraper::store::PgRedditStore;
use system_logging::{PgLogSink, SystemLogger, SystemLoggerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SERVICE_NAME: &str = "reddit-scraper";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "info,sqlx=warn,reqwest=warn,hyper=warn".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RedditConfig::from_env();
    tracing::info!("Reddit harvester starting: {:?}", config);

    let db_config = DbConfig::from_env(SERVICE_NAME)
        .map_err(anyhow::Error::msg)
        .context("database configuration")?;
    db_config.log_config();
    let pool = create_pool(db_config).await.context("database pool")?;

    let logger = SystemLogger::new(
        "reddit_scraper",
        "reddit_scraper",
        Arc::new(PgLogSink::new(pool.clone())),
        SystemLoggerConfig::default(),
    );

    let store = Arc::new(PgRedditStore::new(pool.clone()));
    let proxies = Arc::new(ProxyPool::new(store.clone()));
    let api = Arc::new(RedditApi::new(
        proxies.clone(),
        config.max_retries,
        Duration::from_millis(config.base_delay_ms),
    ));

    let supervisor_config = SupervisorConfig {
        check_interval: Duration::from_secs(config.supervisor_check_interval_seconds),
        hang_threshold: config.hang_threshold(),
        ..Default::default()
    };

    let engine = Arc::new(RedditScraper::new(
        store,
        api,
        proxies,
        config,
        logger.clone(),
    ));
    let control = Arc::new(PgControlStore::new(pool));
    let supervisor = Supervisor::new(control, engine, supervisor_config);

    // Supervisor runs until SIGINT/SIGTERM
    let shutdown = StopFlag::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::info!("shutdown signal received");
            shutdown.stop();
        });
    }

    supervisor.run(shutdown).await;

    logger.shutdown().await;
    tracing::info!("Reddit harvester stopped");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
