//! Age-based retention for the append-only logs.
//!
//! Each log is swept on its own schedule, concurrently with detection and
//! resolution. Retention is the only path that removes modification records.

use crate::config::RetentionConfig;
use crate::store::AuditStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Log swept by a retention policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionTarget {
    /// ModificationRecord log.
    ModificationLog,
    /// ReplicaLagSample log.
    LagSamples,
    /// ResolutionOutcome log.
    Outcomes,
}

impl fmt::Display for RetentionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RetentionTarget::ModificationLog => "modification_log",
            RetentionTarget::LagSamples => "lag_samples",
            RetentionTarget::Outcomes => "outcomes",
        })
    }
}

/// Keep entries younger than `max_age`, swept every `interval`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Log swept.
    pub target: RetentionTarget,
    /// Maximum age kept.
    pub max_age: chrono::Duration,
    /// Sweep interval.
    pub interval: Duration,
}

impl RetentionPolicy {
    /// One policy per log. The outcome log only gets a policy when
    /// `outcome_days` is set.
    pub fn from_config(c: &RetentionConfig) -> Vec<RetentionPolicy> {
        let days = |d: u64| {
            chrono::Duration::try_days(d.min(i32::MAX as u64) as i64).unwrap_or_else(chrono::Duration::zero)
        };
        let mut policies = vec![
            RetentionPolicy {
                target: RetentionTarget::ModificationLog,
                max_age: days(c.modification_log_days),
                interval: Duration::from_secs(c.modification_sweep_secs),
            },
            RetentionPolicy {
                target: RetentionTarget::LagSamples,
                max_age: days(c.lag_sample_days),
                interval: Duration::from_secs(c.lag_sweep_secs),
            },
        ];
        if let Some(outcome_days) = c.outcome_days {
            policies.push(RetentionPolicy {
                target: RetentionTarget::Outcomes,
                max_age: days(outcome_days),
                interval: Duration::from_secs(c.outcome_sweep_secs),
            });
        }
        policies
    }
}

/// Retention counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionStats {
    /// Sweeps run.
    pub sweeps: u64,
    /// Modification records removed.
    pub modifications_removed: u64,
    /// Lag samples removed.
    pub lag_samples_removed: u64,
    /// Outcomes removed.
    pub outcomes_removed: u64,
}

/// Runs retention sweeps against the store.
pub struct RetentionJob {
    store: Arc<AuditStore>,
    policies: Vec<RetentionPolicy>,
    sweeps: AtomicU64,
    modifications_removed: AtomicU64,
    lag_samples_removed: AtomicU64,
    outcomes_removed: AtomicU64,
}

impl RetentionJob {
    /// Create a job with the given policies.
    pub fn new(store: Arc<AuditStore>, policies: Vec<RetentionPolicy>) -> Self {
        Self {
            store,
            policies,
            sweeps: AtomicU64::new(0),
            modifications_removed: AtomicU64::new(0),
            lag_samples_removed: AtomicU64::new(0),
            outcomes_removed: AtomicU64::new(0),
        }
    }

    /// Policies in effect.
    pub fn policies(&self) -> &[RetentionPolicy] {
        &self.policies
    }

    /// Remove entries of `policy.target` older than `now - max_age`. A
    /// cutoff before the representable range removes nothing.
    pub fn sweep(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> usize {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        let Some(cutoff) = now.checked_sub_signed(policy.max_age) else {
            debug!(target_log = %policy.target, "retention cutoff out of range, nothing expired");
            return 0;
        };
        let (removed, counter) = match policy.target {
            RetentionTarget::ModificationLog => (
                self.store.prune_modifications_before(cutoff),
                &self.modifications_removed,
            ),
            RetentionTarget::LagSamples => (
                self.store.prune_lag_samples_before(cutoff),
                &self.lag_samples_removed,
            ),
            RetentionTarget::Outcomes => (self.store.prune_outcomes_before(cutoff), &self.outcomes_removed),
        };
        counter.fetch_add(removed as u64, Ordering::Relaxed);
        if removed > 0 {
            info!(target_log = %policy.target, removed, %cutoff, "retention sweep");
        } else {
            debug!(target_log = %policy.target, %cutoff, "retention sweep, nothing expired");
        }
        removed
    }

    /// Sweep every policy once.
    pub fn sweep_all(&self, now: DateTime<Utc>) -> usize {
        self.policies.iter().map(|p| self.sweep(p, now)).sum()
    }

    /// Current counters.
    pub fn stats(&self) -> RetentionStats {
        RetentionStats {
            sweeps: self.sweeps.load(Ordering::Relaxed),
            modifications_removed: self.modifications_removed.load(Ordering::Relaxed),
            lag_samples_removed: self.lag_samples_removed.load(Ordering::Relaxed),
            outcomes_removed: self.outcomes_removed.load(Ordering::Relaxed),
        }
    }

    /// One task per policy, each on its own interval.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.policies.len())
            .map(|i| {
                let job = self.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let policy = job.policies[i].clone();
                    let mut ticker = tokio::time::interval(policy.interval);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    loop {
                        tokio::select! {
                            _ = ticker.tick() => {
                                job.sweep(&policy, Utc::now());
                            }
                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    break;
                                }
                            }
                        }
                    }
                    debug!(target_log = %policy.target, "retention loop stopped");
                })
            })
            .collect()
    }
}
