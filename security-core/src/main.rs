use chrono::Utc;
use clap::{Parser, Subcommand};
use security_core::{
    config::{SecurityConfig, MAX_RETENTION_DAYS},
    db,
    maintenance,
    services::Database,
};
use service_core::error::AppError;
use service_core::observability::logging::init_tracing;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "security-core")]
#[command(about = "Maintenance tasks for the CMS security tables", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,

    /// Purge expired tokens, sessions, rate limits, blacklist entries and old audit events
    Cleanup {
        /// Audit retention in days (defaults to AUDIT_RETENTION_DAYS)
        #[arg(long, value_parser = clap::value_parser!(i64).range(1..=MAX_RETENTION_DAYS))]
        retention_days: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse();

    // Fail fast on invalid configuration
    let config = SecurityConfig::from_env()?;

    let _guard = init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
        config.log_dir.as_deref(),
    );

    let pool = db::create_pool(&config.database.url, config.database.max_connections).await?;
    let database = Database::new(pool.clone());
    database.health_check().await?;

    match cli.command {
        Commands::Migrate => {
            tracing::info!("Running migrations");
            db::run_migrations(&pool).await?;
            tracing::info!("Migrations applied");
        }
        Commands::Cleanup { retention_days } => {
            let retention_days = retention_days.unwrap_or(config.audit.retention_days);
            let report =
                maintenance::cleanup(Arc::new(database), retention_days, Utc::now()).await?;
            println!(
                "Removed {} audit events, {} remember tokens, {} sessions, {} rate limit entries, {} blacklist entries",
                report.audit_events,
                report.remember_tokens,
                report.sessions,
                report.rate_limits,
                report.blacklist_entries
            );
        }
    }

    pool.close().await;
    Ok(())
}
