//! Engine configuration.
//!
//! Loaded from TOML or JSON; every field has a default so partial files work.

use crate::error::{DrError, Result};
use crate::rules::ResolutionRule;
use crate::types::{ConflictType, RegionId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// How the database tier is failed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseFailoverStrategy {
    /// Promote the replica in the target region.
    #[default]
    PromoteReplica,
    /// Restore the target region from a point-in-time snapshot.
    PointInTimeRestore,
}

/// How traffic is re-pointed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DnsFailoverStrategy {
    /// Target becomes primary, old primary becomes secondary.
    #[default]
    FailoverRouting,
    /// Only the target is updated, as primary.
    Weighted,
}

/// How compute capacity is adjusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServiceFailoverStrategy {
    /// Scale the target region up to `target_capacity`.
    #[default]
    ScaleUpTarget,
    /// Leave capacity untouched.
    None,
}

/// Retention periods for the append-only logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Age after which modification records are pruned.
    pub modification_log_days: u64,
    /// Age after which replica-lag samples are pruned.
    pub lag_sample_days: u64,
    /// Age after which resolution outcomes are pruned. `None` keeps the
    /// outcome audit log forever.
    pub outcome_days: Option<u64>,
    /// Interval between modification-log sweeps.
    pub modification_sweep_secs: u64,
    /// Interval between lag-sample sweeps.
    pub lag_sweep_secs: u64,
    /// Interval between outcome-log sweeps.
    pub outcome_sweep_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            modification_log_days: 7,
            lag_sample_days: 30,
            outcome_days: None,
            modification_sweep_secs: 3600,
            lag_sweep_secs: 3600,
            outcome_sweep_secs: 86400,
        }
    }
}

/// Stakeholder notification settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Channel name used for workflow notifications.
    pub channel: String,
    /// Webhook URLs receiving JSON notifications.
    pub webhook_urls: Vec<String>,
    /// Budget for delivering one notification, in seconds.
    pub timeout_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            channel: "dr-oncall".to_string(),
            webhook_urls: Vec::new(),
            timeout_secs: 30,
        }
    }
}

const MAX_WINDOW_SECS: u64 = 30 * 24 * 3600;
const MAX_WORKFLOW_MINUTES: u64 = 24 * 60;
const MAX_STEP_SECS: u64 = 24 * 3600;
const MAX_RETENTION_DAYS: u64 = 3650;

/// Full engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrConfig {
    /// Deployment scope owning one failover lease.
    pub environment: String,
    /// All regions holding a replica.
    pub regions: Vec<RegionId>,
    /// Region currently holding primary read/write responsibility.
    pub primary_region: RegionId,
    /// Candidate order for choosing a failover target.
    pub failover_order: Vec<RegionId>,
    /// Ranking for the `region_priority` strategy, highest first.
    pub region_priority: Vec<RegionId>,
    /// Domain updated by the traffic router.
    pub domain: String,

    /// Window for conflict detection, in seconds.
    pub conflict_detection_window_secs: u64,
    /// Interval between scheduled detection sweeps, in seconds.
    pub detection_sweep_interval_secs: u64,
    /// Resolve conflicts found by the scheduled sweep.
    pub auto_resolve_on_sweep: bool,
    /// Conflict type used when the sweep resolves.
    pub sweep_conflict_type: ConflictType,
    /// Record all tables unless explicitly disabled.
    pub track_all_tables: bool,
    /// Actor recorded on tracked writes when none is given.
    pub tracker_actor: String,
    /// Seed rules; empty uses the built-in defaults.
    pub rules: Vec<ResolutionRule>,

    /// Interval between probe cycles, in seconds.
    pub probe_interval_secs: u64,
    /// Per-attempt probe timeout, in seconds. Must be below the interval.
    pub probe_timeout_secs: u64,
    /// Retries per probe cycle after a transient failure.
    pub probe_retries: u32,
    /// Base backoff between probe retries, in milliseconds.
    pub probe_backoff_ms: u64,
    /// Consecutive failed cycles before a region is unhealthy.
    pub unhealthy_threshold: u32,
    /// Health URL per region, probed over HTTP when not in dry-run mode.
    pub health_check_urls: BTreeMap<RegionId, String>,

    /// Window in which unhealthy transitions count toward an alarm.
    pub failover_threshold_seconds: u64,
    /// Unhealthy transitions inside the window that raise an alarm.
    pub alarm_threshold: u32,
    /// Fail over automatically once a failure is confirmed.
    pub auto_failover_enabled: bool,
    /// Recovery time objective bounding the whole workflow.
    pub rto_minutes: u64,
    /// Recovery point objective used for replica-lag classification.
    pub rpo_minutes: u64,
    /// Endpoints checked against the new primary.
    pub validation_endpoints: Vec<String>,
    /// Budget for all validation checks.
    pub validation_timeout_minutes: u64,
    /// Roll back automatically when validation fails.
    pub enable_automatic_rollback: bool,
    /// Maximum simultaneously held failover leases per environment.
    pub max_concurrent_failovers: u32,
    /// Timeout for each parallel failover branch, in seconds.
    pub sub_action_timeout_secs: u64,
    /// Database failover mode.
    pub database_failover_strategy: DatabaseFailoverStrategy,
    /// Routing failover mode.
    pub dns_failover_strategy: DnsFailoverStrategy,
    /// Service scaling mode.
    pub service_failover_strategy: ServiceFailoverStrategy,
    /// Desired capacity for the target region after failover.
    pub target_capacity: u32,
    /// Snapshot used by point-in-time restore.
    pub restore_snapshot: String,

    /// Retention settings.
    pub retention: RetentionConfig,
    /// Notification settings.
    pub notification: NotificationConfig,
}

impl Default for DrConfig {
    fn default() -> Self {
        let regions = vec![
            RegionId::from("us-east-1"),
            RegionId::from("eu-west-1"),
            RegionId::from("ap-southeast-1"),
        ];
        Self {
            environment: "production".to_string(),
            primary_region: regions[0].clone(),
            failover_order: regions.clone(),
            region_priority: regions.clone(),
            regions,
            domain: "app.example.com".to_string(),
            conflict_detection_window_secs: 300,
            detection_sweep_interval_secs: 60,
            auto_resolve_on_sweep: true,
            sweep_conflict_type: ConflictType::Timestamp,
            track_all_tables: true,
            tracker_actor: "system".to_string(),
            rules: Vec::new(),
            probe_interval_secs: 300,
            probe_timeout_secs: 10,
            probe_retries: 2,
            probe_backoff_ms: 500,
            unhealthy_threshold: 3,
            health_check_urls: BTreeMap::new(),
            failover_threshold_seconds: 300,
            alarm_threshold: 1,
            auto_failover_enabled: true,
            rto_minutes: 15,
            rpo_minutes: 5,
            validation_endpoints: Vec::new(),
            validation_timeout_minutes: 5,
            enable_automatic_rollback: true,
            max_concurrent_failovers: 1,
            sub_action_timeout_secs: 300,
            database_failover_strategy: DatabaseFailoverStrategy::default(),
            dns_failover_strategy: DnsFailoverStrategy::default(),
            service_failover_strategy: ServiceFailoverStrategy::default(),
            target_capacity: 4,
            restore_snapshot: "latest".to_string(),
            retention: RetentionConfig::default(),
            notification: NotificationConfig::default(),
        }
    }
}

impl DrConfig {
    /// Load from a `.toml` or `.json` file and validate.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: DrConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                return Err(DrError::Config {
                    msg: format!("unsupported config file extension: {ext}"),
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(DrError::Config { msg });

        if self.environment.is_empty() {
            return fail("environment must not be empty".into());
        }
        if self.regions.len() < 2 {
            return fail(format!(
                "at least two regions are required, got {}",
                self.regions.len()
            ));
        }
        if !self.regions.contains(&self.primary_region) {
            return fail(format!(
                "primary region {} is not in regions",
                self.primary_region
            ));
        }
        for r in self
            .failover_order
            .iter()
            .chain(&self.region_priority)
            .chain(self.health_check_urls.keys())
        {
            if !self.regions.contains(r) {
                return fail(format!("region {r} is not in regions"));
            }
        }
        if self.probe_timeout_secs == 0 || self.probe_timeout_secs >= self.probe_interval_secs {
            return fail(format!(
                "probe_timeout_secs ({}) must be non-zero and shorter than probe_interval_secs ({})",
                self.probe_timeout_secs, self.probe_interval_secs
            ));
        }
        if self.unhealthy_threshold == 0 || self.alarm_threshold == 0 {
            return fail("unhealthy_threshold and alarm_threshold must be at least 1".into());
        }
        if self.max_concurrent_failovers == 0 {
            return fail("max_concurrent_failovers must be at least 1".into());
        }
        if self.rto_minutes == 0 {
            return fail("rto_minutes must be at least 1".into());
        }
        if self.conflict_detection_window_secs == 0 {
            return fail("conflict_detection_window_secs must be at least 1".into());
        }
        let r = &self.retention;
        if self.detection_sweep_interval_secs == 0
            || r.modification_sweep_secs == 0
            || r.lag_sweep_secs == 0
            || r.outcome_sweep_secs == 0
        {
            return fail("sweep intervals must be at least 1 second".into());
        }
        if self.notification.timeout_secs == 0 {
            return fail("notification.timeout_secs must be at least 1".into());
        }

        let bounds = [
            ("conflict_detection_window_secs", self.conflict_detection_window_secs, MAX_WINDOW_SECS),
            ("failover_threshold_seconds", self.failover_threshold_seconds, MAX_WINDOW_SECS),
            ("detection_sweep_interval_secs", self.detection_sweep_interval_secs, MAX_WINDOW_SECS),
            ("rto_minutes", self.rto_minutes, MAX_WORKFLOW_MINUTES),
            ("rpo_minutes", self.rpo_minutes, MAX_WORKFLOW_MINUTES),
            ("validation_timeout_minutes", self.validation_timeout_minutes, MAX_WORKFLOW_MINUTES),
            ("probe_interval_secs", self.probe_interval_secs, MAX_STEP_SECS),
            ("probe_backoff_ms", self.probe_backoff_ms, MAX_STEP_SECS * 1000),
            ("sub_action_timeout_secs", self.sub_action_timeout_secs, MAX_STEP_SECS),
            ("notification.timeout_secs", self.notification.timeout_secs, MAX_STEP_SECS),
            ("retention.modification_log_days", r.modification_log_days, MAX_RETENTION_DAYS),
            ("retention.lag_sample_days", r.lag_sample_days, MAX_RETENTION_DAYS),
            ("retention.outcome_days", r.outcome_days.unwrap_or(0), MAX_RETENTION_DAYS),
            ("retention.modification_sweep_secs", r.modification_sweep_secs, MAX_WINDOW_SECS),
            ("retention.lag_sweep_secs", r.lag_sweep_secs, MAX_WINDOW_SECS),
            ("retention.outcome_sweep_secs", r.outcome_sweep_secs, MAX_WINDOW_SECS),
        ];
        for (name, value, max) in bounds {
            if value > max {
                return fail(format!("{name} ({value}) exceeds the maximum of {max}"));
            }
        }
        Ok(())
    }

    /// Conflict detection window.
    pub fn conflict_window(&self) -> chrono::Duration {
        span_secs(self.conflict_detection_window_secs)
    }

    /// Interval between probe cycles.
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    /// Per-attempt probe timeout.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Whole-workflow deadline.
    pub fn rto(&self) -> Duration {
        Duration::from_secs(self.rto_minutes.saturating_mul(60))
    }

    /// Recovery point objective.
    pub fn rpo(&self) -> Duration {
        Duration::from_secs(self.rpo_minutes.saturating_mul(60))
    }

    /// Validation budget.
    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout_minutes.saturating_mul(60))
    }

    /// Per-branch failover timeout.
    pub fn sub_action_timeout(&self) -> Duration {
        Duration::from_secs(self.sub_action_timeout_secs)
    }

    /// Alarm window.
    pub fn failover_threshold(&self) -> chrono::Duration {
        span_secs(self.failover_threshold_seconds)
    }

    /// Budget for delivering one notification.
    pub fn notification_timeout(&self) -> Duration {
        Duration::from_secs(self.notification.timeout_secs)
    }
}

/// Seconds as a chrono span, clamped to the largest window accepted by
/// [`DrConfig::validate`].
pub fn span_secs(secs: u64) -> chrono::Duration {
    chrono::Duration::try_seconds(secs.min(MAX_WINDOW_SECS) as i64).unwrap_or_else(chrono::Duration::zero)
}
