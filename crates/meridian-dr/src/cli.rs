//! Command-line interface for the `meridian-dr` binary.

use crate::collaborators::{Collaborators, DryRunProbe, HttpEndpointValidator, HttpProbe, RegionProbe};
use crate::config::DrConfig;
use crate::detector::ConflictDetector;
use crate::engine::DrEngine;
use crate::metrics::EngineMetrics;
use crate::notify::{FanoutNotifier, Notifier, TracingNotifier, WebhookNotifier};
use crate::resolver::ConflictResolver;
use crate::store::AuditStore;
use crate::types::ConflictType;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Top-level arguments.
#[derive(Parser, Debug)]
#[command(name = "meridian-dr")]
#[command(about = "Cross-region conflict resolution and disaster-recovery orchestration", long_about = None)]
pub struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true, env = "MERIDIAN_LOG_JSON")]
    pub log_json: bool,

    /// Subcommand.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run monitoring, orchestration, retention and detection loops until Ctrl-C.
    Serve {
        /// Configuration file (.toml or .json).
        #[arg(short, long, default_value = "/etc/meridian/dr.toml")]
        config: PathBuf,
        /// Store snapshot loaded at start and written on shutdown.
        #[arg(long)]
        snapshot: Option<PathBuf>,
        /// Probe nothing and only log infrastructure actions.
        #[arg(long)]
        dry_run: bool,
    },
    /// Load and validate a configuration file.
    CheckConfig {
        /// Configuration file.
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Detect conflicts for one record in a store snapshot.
    Detect {
        /// Store snapshot.
        #[arg(long)]
        snapshot: PathBuf,
        /// Table name.
        #[arg(long)]
        table: String,
        /// Record identifier.
        #[arg(long)]
        record: String,
        /// Detection window in seconds.
        #[arg(long, default_value = "300")]
        window_secs: u64,
    },
    /// Resolve one record and append the outcome to the snapshot.
    Resolve {
        /// Store snapshot, rewritten with the new outcome.
        #[arg(long)]
        snapshot: PathBuf,
        /// Configuration supplying region priority and window.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Table name.
        #[arg(long)]
        table: String,
        /// Record identifier.
        #[arg(long)]
        record: String,
        /// timestamp, region_priority, manual or preserve_all.
        #[arg(long, default_value = "timestamp")]
        conflict_type: ConflictType,
    },
    /// Print Prometheus metrics computed from a snapshot.
    Metrics {
        /// Store snapshot.
        #[arg(long)]
        snapshot: PathBuf,
        /// Environment whose failover history is reported.
        #[arg(long, default_value = "production")]
        environment: String,
        /// Detection window in seconds for open conflicts.
        #[arg(long, default_value = "300")]
        window_secs: u64,
    },
}

impl Cli {
    /// Execute the selected command.
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Serve {
                ref config,
                ref snapshot,
                dry_run,
            } => serve(config, snapshot.as_deref(), dry_run).await,
            Command::CheckConfig { ref config } => check_config(config),
            Command::Detect {
                ref snapshot,
                ref table,
                ref record,
                window_secs,
            } => detect(snapshot, table, record, window_secs),
            Command::Resolve {
                ref snapshot,
                ref config,
                ref table,
                ref record,
                conflict_type,
            } => resolve(snapshot, config.as_deref(), table, record, conflict_type).await,
            Command::Metrics {
                ref snapshot,
                ref environment,
                window_secs,
            } => metrics(snapshot, environment, window_secs),
        }
    }
}

fn load_store(path: &Path) -> Result<AuditStore> {
    AuditStore::load_snapshot(path).with_context(|| format!("loading snapshot {}", path.display()))
}

fn window(secs: u64) -> chrono::Duration {
    crate::config::span_secs(secs)
}

fn notifier_for(config: &DrConfig) -> Result<Arc<dyn Notifier>> {
    let mut sinks: Vec<Arc<dyn Notifier>> = vec![Arc::new(TracingNotifier)];
    if !config.notification.webhook_urls.is_empty() {
        sinks.push(Arc::new(WebhookNotifier::new(
            config.notification.webhook_urls.clone(),
            config.notification_timeout(),
        )?));
    }
    Ok(Arc::new(FanoutNotifier::new(sinks)))
}

async fn serve(config_path: &Path, snapshot: Option<&Path>, dry_run: bool) -> Result<()> {
    let config = if config_path.exists() {
        DrConfig::from_file(config_path)?
    } else {
        tracing::warn!("Config file not found, using defaults: {}", config_path.display());
        DrConfig::default()
    };

    let store = match snapshot {
        Some(path) if path.exists() => load_store(path)?,
        _ => AuditStore::with_rules(crate::rules::RuleSet::seed(&config.rules)),
    };

    let (probe, collaborators): (Arc<dyn RegionProbe>, Collaborators) = if dry_run || config.health_check_urls.is_empty() {
        if !dry_run {
            tracing::warn!("no health_check_urls configured, probing in dry-run mode");
        }
        (Arc::new(DryRunProbe), Collaborators::dry_run())
    } else {
        let probe = HttpProbe::new(config.health_check_urls.clone(), config.probe_timeout())?;
        let collaborators = Collaborators {
            validator: Arc::new(HttpEndpointValidator::new(config.validation_timeout())?),
            ..Collaborators::dry_run()
        };
        (Arc::new(probe), collaborators)
    };

    let notifier = notifier_for(&config)?;
    let engine = Arc::new(DrEngine::with_store(
        config,
        Arc::new(store),
        probe,
        collaborators,
        notifier,
    )?);
    engine.start().await?;

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("shutdown requested");
    engine.stop().await;

    if let Some(path) = snapshot {
        engine.store().save_snapshot(path)?;
        tracing::info!("snapshot written to {}", path.display());
    }
    Ok(())
}

fn check_config(path: &Path) -> Result<()> {
    let config = DrConfig::from_file(path)?;
    println!("Configuration OK: {}", path.display());
    println!("Environment: {}", config.environment);
    println!(
        "Regions: {}",
        config.regions.iter().map(|r| r.as_str()).collect::<Vec<_>>().join(", ")
    );
    println!("Primary: {}", config.primary_region);
    println!("Conflict window: {}s", config.conflict_detection_window_secs);
    println!(
        "Probe: every {}s, timeout {}s, {} retries, unhealthy after {}",
        config.probe_interval_secs, config.probe_timeout_secs, config.probe_retries, config.unhealthy_threshold
    );
    println!(
        "Failover: auto={}, RTO {}m, RPO {}m, rollback={}",
        config.auto_failover_enabled, config.rto_minutes, config.rpo_minutes, config.enable_automatic_rollback
    );
    println!("Rules: {}", crate::rules::RuleSet::seed(&config.rules).rules().len());
    Ok(())
}

fn detect(snapshot: &Path, table: &str, record: &str, window_secs: u64) -> Result<()> {
    let store = Arc::new(load_store(snapshot)?);
    let report = ConflictDetector::new(store).detect_conflicts(table, record, window(window_secs));
    if !report.is_conflict() {
        println!("No conflict for {table}/{record}");
        return Ok(());
    }
    println!(
        "Conflict on {table}/{record}: {}",
        report.regions.iter().map(|r| r.as_str()).collect::<Vec<_>>().join(", ")
    );
    for r in &report.records {
        println!(
            "  seq={} region={} op={:?} at={} hash={}",
            r.seq,
            r.region,
            r.operation,
            r.timestamp.to_rfc3339(),
            r.data_hash
        );
    }
    Ok(())
}

async fn resolve(
    snapshot: &Path,
    config: Option<&Path>,
    table: &str,
    record: &str,
    conflict_type: ConflictType,
) -> Result<()> {
    let config = match config {
        Some(path) => DrConfig::from_file(path)?,
        None => DrConfig::default(),
    };
    let store = Arc::new(load_store(snapshot)?);
    let resolver = ConflictResolver::new(store.clone(), config.region_priority.clone(), config.conflict_window())
        .with_notifier(notifier_for(&config)?, config.notification.channel.clone(), config.notification_timeout());
    let resolution = resolver.resolve(table, record, conflict_type).await?;
    store.save_snapshot(snapshot)?;
    println!("{}", serde_json::to_string_pretty(&resolution.outcome)?);
    Ok(())
}

fn metrics(snapshot: &Path, environment: &str, window_secs: u64) -> Result<()> {
    let store = Arc::new(load_store(snapshot)?);
    print!(
        "{}",
        EngineMetrics::collect(&store, environment, window(window_secs)).format_prometheus()
    );
    Ok(())
}
