//! Courier reliable email delivery service.
//!
//! Main entry point for the Courier server. Initializes all subsystems
//! and coordinates graceful startup and shutdown.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_api::AppState;
use courier_core::{time::RealClock, Storage};
use courier_delivery::{
    feedback::FeedbackConsumer, smtp::SmtpConfig, storage::PostgresDeliveryStorage,
    template::TemplateConfig, DeliveryConfig, DeliveryEngine,
};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with structured logging
    init_tracing();

    info!("Starting Courier email delivery service");

    // Load configuration from environment
    let config = Config::from_env()?;
    info!(
        database_url = %config.database_url_masked(),
        server_addr = %config.server_addr,
        max_connections = config.database_max_connections,
        worker_count = config.delivery.worker_count,
        "Configuration loaded"
    );

    // Create database connection pool
    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    // Run database migrations
    run_migrations(&db_pool).await?;
    info!("Database migrations completed");

    let clock = Arc::new(RealClock::new());
    let storage = Arc::new(Storage::new(db_pool.clone()));

    // Start the delivery engine
    let mut engine = DeliveryEngine::new(&db_pool, config.delivery.clone(), clock.clone())?;
    engine.start().await?;
    info!(workers = config.delivery.worker_count, "Delivery engine started");

    // Start the status feedback consumer
    let feedback_token = CancellationToken::new();
    let feedback = FeedbackConsumer::new(
        Arc::new(PostgresDeliveryStorage::new(storage.clone())),
        config.delivery.batch_size,
        config.delivery.poll_interval,
        feedback_token.clone(),
        clock.clone(),
    );
    let feedback_handle = tokio::spawn(async move { feedback.run().await });

    // Start HTTP server
    let state = AppState::new(storage, engine.metrics_handle(), clock);
    let server_handle = tokio::spawn({
        let addr = config.server_addr;
        async move {
            if let Err(e) = courier_api::start_server(state, addr).await {
                error!(error = %e, "Server failed");
            }
        }
    });

    info!(addr = %config.server_addr, "Courier is ready to accept email jobs");

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    // Stop the feedback consumer and drain the delivery workers
    feedback_token.cancel();
    if let Err(e) = engine.shutdown().await {
        error!(error = %e, "Delivery engine shutdown failed");
    }
    if let Err(e) = feedback_handle.await {
        error!(error = %e, "Feedback consumer task failed");
    }

    // Give in-flight requests time to complete
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(30)) => {
            info!("Shutdown grace period expired");
        }
        _ = server_handle => {
            info!("Server stopped");
        }
    }

    // Close database connections
    db_pool.close().await;
    info!("Database connections closed");

    info!("Courier shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,courier=debug,tower_http=debug"))
        .expect("Invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                // Verify connection works
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(_e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Runs database migrations.
async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    // TODO: Use sqlx::migrate! macro once migrations are set up
    // For now, ensure tables exist

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS email_jobs (
            id UUID PRIMARY KEY,
            job_key TEXT NOT NULL,
            recipient TEXT NOT NULL,
            template_ref TEXT NOT NULL,
            params JSONB NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            last_error TEXT,
            next_retry_at TIMESTAMPTZ,
            claimed_at TIMESTAMPTZ,
            received_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            delivered_at TIMESTAMPTZ,
            dead_lettered_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create email_jobs table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS idempotency_records (
            job_key TEXT PRIMARY KEY,
            completed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create idempotency_records table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS retry_counters (
            job_key TEXT PRIMARY KEY,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create retry_counters table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS delivery_attempts (
            id UUID PRIMARY KEY,
            job_id UUID NOT NULL REFERENCES email_jobs(id),
            attempt_number INTEGER NOT NULL,
            smtp_code INTEGER,
            succeeded BOOLEAN NOT NULL,
            error_message TEXT,
            attempted_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create delivery_attempts table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS status_updates (
            id UUID PRIMARY KEY,
            notification_id TEXT NOT NULL,
            status TEXT NOT NULL,
            error TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            consumed_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create status_updates table")?;

    // Create indexes
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_email_jobs_pending
        ON email_jobs(priority DESC, received_at ASC)
        WHERE status = 'pending'
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create email_jobs pending index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_email_jobs_job_key
        ON email_jobs(job_key, received_at DESC)
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create email_jobs job_key index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_status_updates_unconsumed
        ON status_updates(created_at ASC)
        WHERE consumed_at IS NULL
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create status_updates unconsumed index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_delivery_attempts_job
        ON delivery_attempts(job_id, attempt_number)
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create delivery_attempts index")?;

    Ok(())
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

/// Service configuration.
///
/// Relay and template settings come from `SMTP_*`, `TEMPLATE_SERVICE_URL`
/// and `TEMPLATE_TIMEOUT_SECONDS`; the remaining knobs are listed on the
/// fields below.
struct Config {
    /// PostgreSQL connection string
    database_url: String,
    /// Maximum database connections (`DATABASE_MAX_CONNECTIONS`)
    database_max_connections: u32,
    /// Server bind address (`SERVER_ADDR`)
    server_addr: SocketAddr,
    /// Delivery engine tuning (`WORKER_COUNT`, `BATCH_SIZE`,
    /// `POLL_INTERVAL_MS`, `VISIBILITY_TIMEOUT_SECONDS`,
    /// `SHUTDOWN_TIMEOUT_SECONDS`)
    delivery: DeliveryConfig,
}

impl Config {
    /// Loads configuration from environment variables.
    fn from_env() -> Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL environment variable not set")?;

        let database_max_connections = env_parse("DATABASE_MAX_CONNECTIONS").unwrap_or(10);

        let server_addr = std::env::var("SERVER_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .context("Invalid SERVER_ADDR format")?;

        let mut delivery = DeliveryConfig {
            smtp: SmtpConfig::from_env().context("Invalid SMTP configuration")?,
            template: TemplateConfig::from_env().context("Invalid template configuration")?,
            ..DeliveryConfig::default()
        };
        if let Some(count) = env_parse("WORKER_COUNT") {
            delivery.worker_count = count;
        }
        if let Some(size) = env_parse("BATCH_SIZE") {
            delivery.batch_size = size;
        }
        if let Some(millis) = env_parse("POLL_INTERVAL_MS") {
            delivery.poll_interval = Duration::from_millis(millis);
        }
        if let Some(secs) = env_parse("VISIBILITY_TIMEOUT_SECONDS") {
            delivery.visibility_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("SHUTDOWN_TIMEOUT_SECONDS") {
            delivery.shutdown_timeout = Duration::from_secs(secs);
        }

        Ok(Self { database_url, database_max_connections, server_addr, delivery })
    }

    /// Returns database URL with password masked for logging.
    fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(password_start) = self.database_url[..at_pos].rfind(':') {
                if let Some(user_start) = self.database_url[..password_start].rfind('/') {
                    return format!(
                        "{}//{}:***@{}",
                        &self.database_url[..user_start],
                        &self.database_url[user_start + 2..password_start],
                        &self.database_url[at_pos + 1..]
                    );
                }
            }
        }
        // Fallback: just return postgresql://***
        "postgresql://***".to_string()
    }
}

/// Parses an environment variable, ignoring unset or malformed values.
fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}
