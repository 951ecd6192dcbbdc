use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use control_plane::{PgControlStore, StopFlag, Supervisor, SupervisorConfig};
use db_pool::{create_pool, DbConfig};
use instagram_scraper::api::InstagramApi;
use instagram_scraper::config::InstagramConfig;
use instagram_scraper::services::InstagramScraper;
use instagram_scraper::store::PgInstagramStore;
use system_logging::{PgLogSink, SystemLogger, SystemLoggerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SERVICE_NAME: &str = "instagram-scraper";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "info,sqlx=warn,reqwest=warn,hyper=warn".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = InstagramConfig::from_env();
    tracing::info!(
        "Instagram harvester starting: {} concurrent creators, {} rps cap",
        config.concurrent_creators,
        config.requests_per_second
    );

    let db_config = DbConfig::from_env(SERVICE_NAME)
        .map_err(anyhow::Error::msg)
        .context("database configuration")?;
    db_config.log_config();
    let pool = create_pool(db_config).await.context("database pool")?;

    let logger = SystemLogger::new(
        "instagram_scraper",
        "instagram_scraper",
        Arc::new(PgLogSink::new(pool.clone())),
        SystemLoggerConfig::default(),
    );

    let store = Arc::new(PgInstagramStore::new(pool.clone()));
    let api = Arc::new(InstagramApi::new(config.clone()).map_err(anyhow::Error::msg)?);

    // No log-freshness watchdog here: creator passes legitimately go
    // quiet during the 4h inter-cycle wait
    let supervisor_config = SupervisorConfig {
        check_interval: Duration::from_secs(config.supervisor_check_interval_seconds),
        hang_threshold: None,
        ..Default::default()
    };

    let engine = Arc::new(InstagramScraper::new(store, api, config, logger.clone()));
    let control = Arc::new(PgControlStore::new(pool));
    let supervisor = Supervisor::new(control, engine, supervisor_config);

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
    tracing::info!("Instagram harvester stopped");
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
