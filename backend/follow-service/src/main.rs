use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::info;
use tracing_actix_web::TracingLogger;

use follow_service::cache::CounterCache;
use follow_service::config::{Config, DatabaseConfig, StorageBackend};
use follow_service::handlers;
use follow_service::logging::init_tracing;
use follow_service::repository::{
    InMemoryRelationStore, InMemoryUserDirectory, PostgresRelationStore, PostgresUserDirectory,
};
use follow_service::state::AppState;
use follow_service::workers::ReconciliationWorker;

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn connect_postgres(database: &DatabaseConfig) -> Result<sqlx::PgPool> {
    // Prepared statement caching disabled for PgBouncer transaction mode
    let connect_options = PgConnectOptions::from_str(&database.url)
        .context("Failed to parse DATABASE_URL")?
        .statement_cache_capacity(0)
        .options([(
            "statement_timeout",
            database.statement_timeout_ms.to_string(),
        )]);

    let pool = PgPoolOptions::new()
        .max_connections(database.max_connections)
        .min_connections(database.min_connections)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect_with(connect_options)
        .await
        .context("Failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;

    Ok(pool)
}

async fn build_state(config: &Config) -> Result<AppState> {
    let step_timeout = config.follow.operation_timeout();

    match config.storage.backend {
        StorageBackend::Postgres => {
            let database = config
                .storage
                .database
                .as_ref()
                .context("DATABASE_URL is required for the postgres backend")?;
            let pool = connect_postgres(database).await?;
            info!("Database pool created and migrations applied");

            let relations = Arc::new(PostgresRelationStore::new(pool.clone()));
            let directory = Arc::new(PostgresUserDirectory::new(pool));
            Ok(AppState::new(
                relations,
                directory.clone(),
                directory,
                step_timeout,
            ))
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; all follow data is lost on restart");
            let relations = Arc::new(InMemoryRelationStore::new());
            let directory = Arc::new(InMemoryUserDirectory::new());
            Ok(AppState::new(
                relations,
                directory.clone(),
                directory,
                step_timeout,
            ))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("Failed to load configuration")?;
    init_tracing(config.app.log_format);

    info!(
        env = %config.app.env,
        http_port = config.app.http_port,
        backend = ?config.storage.backend,
        "Starting follow-service"
    );

    let mut state = build_state(&config).await?;

    if let Some(redis_url) = &config.cache.redis_url {
        let redis_client =
            redis::Client::open(redis_url.as_str()).context("Failed to create Redis client")?;
        let redis_conn = redis::aio::ConnectionManager::new(redis_client)
            .await
            .context("Failed to connect to Redis")?;
        state = state.with_cache(CounterCache::new(
            redis_conn,
            config.cache.ttl_secs,
            config.cache.command_timeout(),
        ));
        info!("Redis counters cache enabled");
    } else {
        info!("Redis counters cache disabled: REDIS_URL not set");
    }

    let mut join_set = JoinSet::new();

    if config.reconciliation.enabled {
        let worker = ReconciliationWorker::new(
            state.maintainer.clone(),
            state.directory.clone(),
            state.drift.clone(),
            &config.reconciliation,
        )
        .with_cache(state.cache.clone());
        join_set.spawn(async move {
            worker.run().await;
            Ok(())
        });
    } else {
        info!("Counter reconciliation disabled by configuration");
    }

    let http_addr = format!("{}:{}", config.app.host, config.app.http_port);
    let app_state = web::Data::new(state);
    let http_server = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .app_data(app_state.clone())
            .configure(handlers::configure)
    })
    .bind(&http_addr)
    .context("Failed to bind HTTP server")?
    .disable_signals()
    .run();
    let server_handle = http_server.handle();

    join_set.spawn(async move {
        http_server
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))
    });
    info!("HTTP server listening on http://{}", http_addr);

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            server_handle.stop(true).await;
        }
        Some(result) = join_set.join_next() => {
            match result {
                Ok(Ok(())) => info!("Task completed"),
                Ok(Err(e)) => {
                    tracing::error!("Task failed: {:#}", e);
                    return Err(e);
                }
                Err(e) => {
                    tracing::error!("Task panicked: {:#}", e);
                    return Err(anyhow::anyhow!("Task panicked: {}", e));
                }
            }
        }
    }

    join_set.abort_all();
    info!("follow-service shutting down");
    Ok(())
}
