//! DLQ Redrive - dead letter queue capture, classification and redrive for
//! background task pipelines.
//!
//! Failed tasks are captured with their arguments and error details,
//! classified, and later re-submitted to the execution engine either by an
//! operator or by the auto-redrive loop, behind per-bucket circuit breakers.

pub mod breaker;
pub mod capture;
pub mod cli;
pub mod config;
pub mod error;
pub mod health;
pub mod notify;
pub mod queue;
pub mod redrive;
pub mod scheduler;
pub mod validation;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::breaker::{BreakerRegistry, LocalBreakerRegistry, RedisBreakerRegistry};
use crate::capture::{DlqCapture, ErrorClassifier, FailureListener, Redactor};
use crate::cli::{Cli, Commands, ListArgs, RedriveArgs};
use crate::config::hot_reload::ConfigReloadEvent;
use crate::config::model::StorageBackend;
use crate::config::{AppConfig, ConfigManager};
use crate::health::HealthService;
use crate::notify::{DiscordNotifier, MetricsServer, MetricsSink, NoopMetrics, PrometheusMetrics};
use crate::queue::entry::DlqStatus;
use crate::queue::repository::{with_timeout, DlqRepository};
use crate::queue::{InMemoryRepository, RedisRepository};
use crate::redrive::executor::RedisTaskDispatcher;
use crate::redrive::{RedriveEngine, RedriveOutcome};
use crate::scheduler::Scheduler;
use crate::validation::{report, validate_config};

/// Runs the command selected on the command line.
pub async fn run(cli: Cli) -> Result<()> {
    setup_logging(&effective_log_level(&cli))?;

    match cli.command {
        Commands::Run => run_service(&cli.config).await,
        Commands::List(ref args) => list_entries(&cli.config, args).await,
        Commands::Show { ref id } => show_entry(&cli.config, id).await,
        Commands::ShowTask { ref task_id } => show_task(&cli.config, task_id).await,
        Commands::Redrive { ref id, ref options } => redrive_one(&cli.config, id, options).await,
        Commands::RedriveBulk {
            ref ids,
            ref options,
        } => redrive_many(&cli.config, ids, options).await,
        Commands::Stats { days } => show_stats(&cli.config, days).await,
        Commands::Health => show_health(&cli.config).await,
        Commands::Recommend { ref id } => show_recommendation(&cli.config, id).await,
        Commands::Delete { ref id } => delete_entry(&cli.config, id).await,
        Commands::Cleanup {
            older_than_days,
            status,
        } => cleanup_entries(&cli.config, older_than_days, status).await,
        Commands::ConfigValidate => validate_config_file(&cli.config),
        Commands::ConfigShow => show_config(&cli.config),
    }
}

/// `-v` flags win; otherwise the config file's level, falling back to info.
fn effective_log_level(cli: &Cli) -> String {
    if cli.verbose > 0 {
        return cli.log_level().to_string();
    }
    config::loader::load_from_path(&cli.config)
        .map(|c| c.global.log_level)
        .unwrap_or_else(|_| cli.log_level().to_string())
}

/// Initializes the tracing subscriber for structured logging.
fn setup_logging(level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .json()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

fn storage_timeout(config: &AppConfig) -> Duration {
    Duration::from_secs(config.global.storage.timeout_seconds.max(1))
}

/// Repository and breaker registry for the configured backend.
struct Storage {
    repository: Arc<dyn DlqRepository>,
    breakers: Arc<dyn BreakerRegistry>,
}

async fn open_storage(config: &AppConfig) -> Result<Storage> {
    let prefix = &config.global.storage.key_prefix;
    let policy = config.circuit_breaker.policy();

    match config.global.storage.backend {
        StorageBackend::Redis => {
            let connection = queue::redis::connect(&config.global.redis.url())
                .await
                .context("Failed to connect to Redis")?;
            info!(host = %config.global.redis.host, port = config.global.redis.port, "Connected to Redis");

            let breakers: Arc<dyn BreakerRegistry> = if config.circuit_breaker.shared {
                Arc::new(RedisBreakerRegistry::new(connection.clone(), prefix, policy))
            } else {
                Arc::new(LocalBreakerRegistry::new(policy))
            };

            Ok(Storage {
                repository: Arc::new(RedisRepository::from_connection(connection, prefix)),
                breakers,
            })
        }
        StorageBackend::Memory => {
            warn!("Using in-memory storage; entries are lost when the process exits");
            Ok(Storage {
                repository: Arc::new(InMemoryRepository::new()),
                breakers: Arc::new(LocalBreakerRegistry::new(policy)),
            })
        }
    }
}

/// Builds a redrive engine that dispatches through the execution engine's Redis queues.
async fn build_engine(
    config: &AppConfig,
    storage: &Storage,
    metrics: Arc<dyn MetricsSink>,
) -> Result<RedriveEngine> {
    let connection = queue::redis::connect(&config.global.redis.url())
        .await
        .context("Failed to connect to the execution engine's Redis")?;

    let execution_timeout = Duration::from_secs(config.redrive.execution_timeout_seconds.max(1));
    let dispatcher = RedisTaskDispatcher::new(
        connection,
        &config.global.storage.key_prefix,
        &config.redrive.dispatch_queue_prefix,
        config.redrive.wait_for_result,
        execution_timeout,
    );

    Ok(RedriveEngine::new(
        storage.repository.clone(),
        storage.breakers.clone(),
        Arc::new(dispatcher),
        metrics,
        config.redrive.backoff,
        execution_timeout,
        storage_timeout(config),
    ))
}

fn health_service(config: &AppConfig, storage: &Storage) -> HealthService {
    HealthService::new(
        storage.repository.clone(),
        storage.breakers.clone(),
        config.health.alerts.clone(),
        config.health.stats_window_days,
        storage_timeout(config),
    )
}

/// Runs the long-lived service until Ctrl+C.
async fn run_service(config_path: &Path) -> Result<()> {
    info!("Starting DLQ redrive service");

    let config_manager = ConfigManager::new(config_path)?;
    let config = config_manager.get_config();
    info!(path = %config_manager.config_path().display(), "Configuration loaded and validated");

    let config_read = config.read().await.clone();
    let storage = open_storage(&config_read).await?;

    let prometheus = if config_read.global.prometheus.enabled {
        Some(Arc::new(PrometheusMetrics::new()?))
    } else {
        None
    };
    let metrics: Arc<dyn MetricsSink> = match &prometheus {
        Some(p) => p.clone(),
        None => Arc::new(NoopMetrics),
    };

    let discord = config_read
        .global
        .notifications
        .discord
        .as_ref()
        .map(|dc| Arc::new(DiscordNotifier::new(dc)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    // Prometheus metrics and health endpoints
    if let Some(prometheus) = &prometheus {
        let port = config_read.global.prometheus.port;
        let server = MetricsServer::new(
            prometheus.clone(),
            Arc::new(HealthService::live(
                storage.repository.clone(),
                storage.breakers.clone(),
                config.clone(),
            )),
            port,
        );
        tokio::spawn(async move {
            if let Err(e) = server.start().await {
                error!(error = %e, "Metrics server failed");
            }
        });
        info!(port, "Metrics server started");
    }

    // Failure capture
    if config_read.capture.listener_enabled {
        let capture = Arc::new(DlqCapture::new(
            storage.repository.clone(),
            ErrorClassifier::from_config(&config_read.capture)?,
            Redactor::new(&config_read.capture.redact_keys)?,
            metrics.clone(),
            config_read.capture.default_max_retries,
            storage_timeout(&config_read),
        ));
        let connection = queue::redis::connect(&config_read.global.redis.url())
            .await
            .context("Failed to connect the failure listener to Redis")?;
        let listener = FailureListener::new(
            connection,
            &config_read.global.storage.key_prefix,
            capture,
            Duration::from_millis(config_read.capture.poll_interval_ms.max(1)),
        );
        handles.push(tokio::spawn(listener.run(shutdown_rx.clone())));
        info!("Failure listener started");
    }

    // Redrive engine and background loops
    let engine = Arc::new(build_engine(&config_read, &storage, metrics.clone()).await?);
    let scheduler = Arc::new(Scheduler::new(
        config.clone(),
        engine,
        storage.repository.clone(),
        storage.breakers.clone(),
        metrics,
        discord,
    ));
    handles.extend(scheduler.spawn(shutdown_rx.clone()));
    info!("Scheduler started");

    // Config hot reload
    let (reload_tx, mut reload_rx) = mpsc::channel(10);
    config_manager.watch(reload_tx)?;
    info!("Config hot-reload enabled");

    info!("DLQ redrive service is running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }

            Some(event) = reload_rx.recv() => {
                match event {
                    ConfigReloadEvent::Reloaded => {
                        info!("Configuration reloaded; storage, capture and dispatch settings apply after restart");
                    }
                    ConfigReloadEvent::ValidationFailed { error_count } => {
                        warn!(error_count, "Configuration reload failed validation");
                    }
                }
            }
        }
    }

    info!("Shutting down DLQ redrive service");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        match tokio::time::timeout(Duration::from_secs(30), handle).await {
            Ok(Err(e)) => error!(error = %e, "Background task panicked"),
            Err(_) => warn!("Background task did not stop within 30 seconds"),
            Ok(Ok(())) => {}
        }
    }

    Ok(())
}

/// Loads the config and opens storage for one-shot commands.
async fn open_for_command(config_path: &Path) -> Result<(AppConfig, Storage)> {
    let config = config::loader::load_and_validate(config_path)?;
    let storage = open_storage(&config).await?;
    Ok((config, storage))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn list_entries(config_path: &Path, args: &ListArgs) -> Result<()> {
    let (config, storage) = open_for_command(config_path).await?;
    let query = args.to_query();
    let page = with_timeout(storage_timeout(&config), storage.repository.list(&query)).await?;

    if page.entries.is_empty() {
        println!("No matching entries ({} total).", page.total);
        return Ok(());
    }

    println!(
        "Page {} ({} of {} matching entries):",
        page.page,
        page.entries.len(),
        page.total
    );
    println!(
        "  {:<36}  {:<28}  {:<18}  {:<13}  {:<8}  {:<7}  CREATED",
        "ID", "TASK", "STATUS", "CATEGORY", "PRIORITY", "RETRIES"
    );
    for entry in page.entries {
        println!(
            "  {:<36}  {:<28}  {:<18}  {:<13}  {:<8}  {:<7}  {}",
            entry.id,
            entry.task_name,
            entry.status,
            entry.error_category,
            entry.priority,
            format!("{}/{}", entry.retry_count, entry.max_retries),
            entry.created_at.to_rfc3339()
        );
    }

    Ok(())
}

async fn show_entry(config_path: &Path, id: &str) -> Result<()> {
    let (config, storage) = open_for_command(config_path).await?;
    match with_timeout(storage_timeout(&config), storage.repository.get_by_id(id)).await? {
        Some(entry) => print_json(&entry),
        None => anyhow::bail!("DLQ entry not found: {}", id),
    }
}

async fn show_task(config_path: &Path, task_id: &str) -> Result<()> {
    let (config, storage) = open_for_command(config_path).await?;
    match with_timeout(
        storage_timeout(&config),
        storage.repository.get_by_task_id(task_id),
    )
    .await?
    {
        Some(entry) => print_json(&entry),
        None => anyhow::bail!("No DLQ entry recorded for task {}", task_id),
    }
}

fn print_outcome(outcome: &RedriveOutcome) {
    let mark = if outcome.success {
        "ok"
    } else if outcome.is_skipped() {
        "skipped"
    } else {
        "failed"
    };
    match outcome.status {
        Some(status) => println!("  {} [{}] {} -> {}", outcome.entry_id, mark, outcome.message, status),
        None => println!("  {} [{}] {}", outcome.entry_id, mark, outcome.message),
    }
}

async fn redrive_one(config_path: &Path, id: &str, args: &RedriveArgs) -> Result<()> {
    let (config, storage) = open_for_command(config_path).await?;
    let engine = build_engine(&config, &storage, Arc::new(NoopMetrics)).await?;

    let outcome = engine.redrive_single(id, &args.to_options()).await;
    print_outcome(&outcome);

    if !outcome.success {
        anyhow::bail!("Redrive of {} did not succeed", id);
    }
    Ok(())
}

async fn redrive_many(config_path: &Path, ids: &[String], args: &RedriveArgs) -> Result<()> {
    let (config, storage) = open_for_command(config_path).await?;
    let engine = build_engine(&config, &storage, Arc::new(NoopMetrics)).await?;

    let result = engine.redrive_bulk(ids, &args.to_options()).await;
    for outcome in &result.results {
        print_outcome(outcome);
    }
    println!(
        "Redriven: {} succeeded, {} failed, {} skipped.",
        result.success_count, result.failed_count, result.skipped_count
    );

    Ok(())
}

async fn show_stats(config_path: &Path, days: u32) -> Result<()> {
    let (config, storage) = open_for_command(config_path).await?;
    let stats = with_timeout(storage_timeout(&config), storage.repository.stats(days)).await?;

    print_json(&serde_json::json!({
        "stats": stats,
        "failure_rate": stats.failure_rate(),
        "health_score": health::health_score(&stats),
    }))
}

async fn show_health(config_path: &Path) -> Result<()> {
    let (config, storage) = open_for_command(config_path).await?;
    let report = health_service(&config, &storage).report().await?;
    print_json(&report)
}

async fn show_recommendation(config_path: &Path, id: &str) -> Result<()> {
    let (config, storage) = open_for_command(config_path).await?;
    let recommendation = match with_timeout(
        storage_timeout(&config),
        storage.repository.get_by_id(id),
    )
    .await?
    {
        Some(entry) => redrive::recommend::recommend(&entry),
        None => anyhow::bail!("DLQ entry not found: {}", id),
    };
    print_json(&recommendation)
}

async fn delete_entry(config_path: &Path, id: &str) -> Result<()> {
    let (config, storage) = open_for_command(config_path).await?;
    if with_timeout(storage_timeout(&config), storage.repository.delete(id)).await? {
        info!(entry_id = %id, "Deleted DLQ entry");
        println!("Deleted entry {}.", id);
        Ok(())
    } else {
        anyhow::bail!("DLQ entry not found: {}", id)
    }
}

async fn cleanup_entries(
    config_path: &Path,
    older_than_days: u32,
    status: Option<DlqStatus>,
) -> Result<()> {
    let (config, storage) = open_for_command(config_path).await?;
    let deleted = with_timeout(
        storage_timeout(&config),
        storage.repository.cleanup(older_than_days, status),
    )
    .await?;

    info!(deleted, older_than_days, status = ?status, "Cleanup finished");
    println!("Deleted {} entr{}.", deleted, if deleted == 1 { "y" } else { "ies" });
    Ok(())
}

/// Validates the configuration file and prints the full report.
fn validate_config_file(config_path: &Path) -> Result<()> {
    let config = config::loader::load_from_path(config_path)?;
    let result = validate_config(&config);

    println!("{}", report::format_report(&result));

    if !result.is_valid() {
        anyhow::bail!(error::ConfigError::ValidationFailed {
            error_count: result.error_count()
        });
    }
    Ok(())
}

/// Displays the parsed configuration.
fn show_config(config_path: &Path) -> Result<()> {
    let config = config::loader::load_and_validate(config_path)?;
    let yaml = serde_yaml::to_string(&config)?;
    println!("{}", yaml);
    Ok(())
}
