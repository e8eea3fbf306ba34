// Scheduler worker entry point.
//
// Runs three services until shutdown: the scheduling loop, the zombie
// sweeper, and (when an API key is configured) the AI planner.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use engine_core::ai_planner::{AiPlannerConfig, AiPlannerWorker};
use engine_core::kernel::{
    ClaudeClient, PostgresSigningKeys, SystemClock, UnmeteredQuota, UtcCron,
};
use engine_core::scheduler::{
    DispatcherConfig, HttpDispatcher, PostgresEndpointStore, PostgresRunStore, SchedulerConfig,
    SchedulerWorker, ZombieSweeper, ZombieSweeperConfig,
};
use engine_core::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,engine_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Cronicorn scheduler");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    // Wire up the services
    let clock = Arc::new(SystemClock);
    let cron = Arc::new(UtcCron);
    let endpoints = Arc::new(PostgresEndpointStore::new(pool.clone()));
    let runs = Arc::new(PostgresRunStore::new(pool.clone()));
    let keys = Arc::new(PostgresSigningKeys::new(pool.clone()));

    let http_client = reqwest::Client::builder()
        .user_agent("cronicorn-scheduler/0.1")
        .build()
        .context("Failed to build HTTP client")?;

    let dispatcher = Arc::new(HttpDispatcher::new(
        http_client,
        keys,
        clock.clone(),
        DispatcherConfig {
            default_timeout_ms: config.default_timeout_ms,
            default_max_response_size_kb: config.max_response_size_kb,
            signing_required: config.signing_required,
            allow_private_urls: config.allow_private_urls,
        },
    ));

    let mut scheduler_config = SchedulerConfig {
        batch_size: config.batch_size,
        lock_ttl_ms: config.lock_ttl_ms,
        tick_interval_ms: config.tick_interval_ms,
        default_max_response_size_kb: config.max_response_size_kb,
        ..Default::default()
    };
    if let Some(worker_id) = &config.worker_id {
        scheduler_config.worker_id = worker_id.clone();
    }

    let scheduler = SchedulerWorker::new(
        endpoints.clone(),
        runs.clone(),
        dispatcher,
        clock.clone(),
        cron,
        scheduler_config,
    );

    let sweeper = ZombieSweeper::new(
        runs.clone(),
        clock.clone(),
        ZombieSweeperConfig::from_threshold(config.zombie_threshold_ms),
    );

    let shutdown = CancellationToken::new();
    let mut services = Vec::new();

    services.push(tokio::spawn(scheduler.run(shutdown.clone())));
    services.push(tokio::spawn(sweeper.run(shutdown.clone())));

    match &config.anthropic_api_key {
        Some(api_key) => {
            let planner = AiPlannerWorker::new(
                endpoints,
                runs,
                Arc::new(ClaudeClient::new(api_key.clone())),
                Arc::new(UnmeteredQuota),
                clock,
                AiPlannerConfig {
                    analysis_interval_ms: config.ai_planner_interval_ms,
                    max_hint_ttl_ms: config.ai_max_hint_ttl_ms,
                    ..Default::default()
                },
            );
            services.push(tokio::spawn(planner.run(shutdown.clone())));
        }
        None => {
            tracing::info!("ANTHROPIC_API_KEY not set, AI planner disabled");
        }
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal, draining...");
    shutdown.cancel();

    for service in services {
        let _ = service.await;
    }

    tracing::info!("Scheduler stopped");
    Ok(())
}
