//! FailoverState lease.
//!
//! Each environment owns at most `max_concurrent_failovers` held
//! [`FailoverState`] records. Acquiring a lease starts a workflow instance and
//! releasing it ends one. Every update carries the lease token and the
//! version the caller last saw; a mismatch is rejected.

use crate::error::Result;
use crate::store::AuditStore;
use crate::types::RegionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Phase of a failover workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    /// Nothing in flight.
    Idle,
    /// Deciding whether the failure is real.
    AssessingFailure,
    /// Database, routing and scaling running in parallel.
    Failover,
    /// Checking the new primary.
    Validating,
    /// Undoing the failover after failed validation.
    RolledBack,
    /// Telling stakeholders what happened.
    NotifyingStakeholders,
    /// Workflow finished.
    Completed,
    /// Failure not confirmed or auto failover disabled.
    MonitoringOnly,
    /// Workflow halted.
    Failed,
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowPhase::Idle => "idle",
            WorkflowPhase::AssessingFailure => "assessing_failure",
            WorkflowPhase::Failover => "failover",
            WorkflowPhase::Validating => "validating",
            WorkflowPhase::RolledBack => "rolled_back",
            WorkflowPhase::NotifyingStakeholders => "notifying_stakeholders",
            WorkflowPhase::Completed => "completed",
            WorkflowPhase::MonitoringOnly => "monitoring_only",
            WorkflowPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How a workflow ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    /// New primary validated.
    Succeeded,
    /// Validation failed and the failover was rolled back.
    RolledBack,
    /// Validation failed, rollback disabled, operator engaged.
    ManualIntervention,
    /// Halted: sub-action failure, no target, or RTO breach.
    Failed,
    /// No failover performed.
    MonitoringOnly,
}

impl TerminalStatus {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalStatus::Succeeded => "succeeded",
            TerminalStatus::RolledBack => "rolled_back",
            TerminalStatus::ManualIntervention => "manual_intervention",
            TerminalStatus::Failed => "failed",
            TerminalStatus::MonitoringOnly => "monitoring_only",
        }
    }
}

/// The three parallel failover branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubAction {
    /// Database promotion or restore.
    DatabaseFailover,
    /// Routing update.
    DnsUpdate,
    /// Capacity scaling.
    ServiceScale,
}

impl fmt::Display for SubAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubAction::DatabaseFailover => "database_failover",
            SubAction::DnsUpdate => "dns_update",
            SubAction::ServiceScale => "service_scale",
        };
        f.write_str(s)
    }
}

/// How one branch ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubActionOutcome {
    /// Completed.
    Succeeded,
    /// Reported an error.
    Failed(String),
    /// Did not report within the branch timeout.
    TimedOut,
}

/// Result of one branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubActionResult {
    /// Which branch.
    pub action: SubAction,
    /// How it ended.
    pub outcome: SubActionOutcome,
    /// Wall time spent.
    pub elapsed_ms: u64,
}

impl SubActionResult {
    /// True when the branch succeeded.
    pub fn succeeded(&self) -> bool {
        self.outcome == SubActionOutcome::Succeeded
    }

    /// Build from a branch's elapsed time and outcome.
    pub fn new(action: SubAction, outcome: SubActionOutcome, elapsed: Duration) -> Self {
        Self {
            action,
            outcome,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}

/// One recorded phase change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTransition {
    /// Phase entered.
    pub phase: WorkflowPhase,
    /// When it was entered.
    pub at: DateTime<Utc>,
}

/// What started the workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// Health alarm on the primary.
    HealthAlarm,
    /// Operator request.
    Manual {
        /// Who asked.
        requested_by: String,
    },
}

/// The leased workflow record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverState {
    /// Owning environment.
    pub environment: String,
    /// Proof of ownership.
    pub lease_token: Uuid,
    /// Optimistic version, bumped on every update.
    pub version: u64,
    /// True while the lease is held.
    pub lease_held: bool,
    /// Current phase.
    pub phase: WorkflowPhase,
    /// What started the workflow.
    pub trigger: TriggerSource,
    /// Primary at the time of the trigger.
    pub source_region: RegionId,
    /// Region being promoted, once chosen.
    pub target_region: Option<RegionId>,
    /// When the lease was acquired.
    pub started_at: DateTime<Utc>,
    /// When the workflow ended.
    pub completed_at: Option<DateTime<Utc>>,
    /// How it ended.
    pub terminal: Option<TerminalStatus>,
    /// Set when the RTO deadline fired.
    pub rto_breached: bool,
    /// Per-branch results of the failover fan-out.
    pub sub_actions: Vec<SubActionResult>,
    /// Phase history.
    pub transitions: Vec<PhaseTransition>,
    /// Free-form reason for the terminal status.
    pub detail: Option<String>,
}

/// Handle proving ownership of a held lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Environment.
    pub environment: String,
    /// Token.
    pub token: Uuid,
    /// Version last observed by the holder.
    pub version: u64,
}

/// Grants and updates failover leases for one environment.
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<AuditStore>,
    environment: String,
    max_active: u32,
}

impl LeaseManager {
    /// Create a manager for `environment`.
    pub fn new(store: Arc<AuditStore>, environment: impl Into<String>, max_active: u32) -> Self {
        Self {
            store,
            environment: environment.into(),
            max_active: max_active.max(1),
        }
    }

    /// Environment managed.
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Acquire a lease, starting a workflow instance in `Idle`.
    ///
    /// Fails with `FailoverInProgress` when the environment is at capacity.
    pub fn acquire(&self, source_region: RegionId, trigger: TriggerSource) -> Result<(Lease, FailoverState)> {
        let now = Utc::now();
        let state = FailoverState {
            environment: self.environment.clone(),
            lease_token: Uuid::new_v4(),
            version: 0,
            lease_held: true,
            phase: WorkflowPhase::Idle,
            trigger,
            source_region,
            target_region: None,
            started_at: now,
            completed_at: None,
            terminal: None,
            rto_breached: false,
            sub_actions: Vec::new(),
            transitions: vec![PhaseTransition {
                phase: WorkflowPhase::Idle,
                at: now,
            }],
            detail: None,
        };
        let state = self.store.try_acquire_failover(state, self.max_active)?;
        info!(environment = %self.environment, token = %state.lease_token, "failover lease acquired");
        Ok((
            Lease {
                environment: self.environment.clone(),
                token: state.lease_token,
                version: state.version,
            },
            state,
        ))
    }

    /// Apply `update` under the lease and advance the holder's version.
    pub fn update<F>(&self, lease: &mut Lease, update: F) -> Result<FailoverState>
    where
        F: FnOnce(&mut FailoverState),
    {
        let state = self
            .store
            .update_failover(&lease.environment, lease.token, lease.version, update)?;
        lease.version = state.version;
        Ok(state)
    }

    /// Move to `phase`, recording the transition.
    pub fn transition(&self, lease: &mut Lease, phase: WorkflowPhase) -> Result<FailoverState> {
        debug!(environment = %lease.environment, %phase, "workflow transition");
        self.update(lease, |s| {
            s.phase = phase;
            s.transitions.push(PhaseTransition {
                phase,
                at: Utc::now(),
            });
        })
    }

    /// Record the terminal status and release the lease.
    pub fn release(
        &self,
        mut lease: Lease,
        terminal: TerminalStatus,
        detail: Option<String>,
    ) -> Result<FailoverState> {
        let state = self.update(&mut lease, |s| {
            s.lease_held = false;
            s.terminal = Some(terminal);
            s.completed_at = Some(Utc::now());
            if detail.is_some() {
                s.detail = detail;
            }
        })?;
        info!(
            environment = %self.environment,
            token = %state.lease_token,
            terminal = terminal.as_str(),
            "failover lease released"
        );
        Ok(state)
    }

    /// Held leases.
    pub fn active(&self) -> Vec<FailoverState> {
        self.store.active_failovers(&self.environment)
    }

    /// All workflow records, oldest first.
    pub fn history(&self) -> Vec<FailoverState> {
        self.store.failover_history(&self.environment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DrError;

    fn manager(max: u32) -> LeaseManager {
        LeaseManager::new(Arc::new(AuditStore::new()), "production", max)
    }

    #[test]
    fn test_second_acquire_rejected() {
        let m = manager(1);
        let (_lease, _) = m.acquire(RegionId::from("us-east-1"), TriggerSource::HealthAlarm).unwrap();
        let err = m
            .acquire(RegionId::from("us-east-1"), TriggerSource::HealthAlarm)
            .unwrap_err();
        assert!(matches!(err, DrError::FailoverInProgress { .. }));
        assert_eq!(m.active().len(), 1);
    }

    #[test]
    fn test_release_frees_the_slot() {
        let m = manager(1);
        let (lease, _) = m.acquire(RegionId::from("us-east-1"), TriggerSource::HealthAlarm).unwrap();
        let state = m.release(lease, TerminalStatus::Succeeded, None).unwrap();
        assert!(!state.lease_held);
        assert!(state.completed_at.is_some());
        assert!(m.active().is_empty());
        assert!(m.acquire(RegionId::from("us-east-1"), TriggerSource::HealthAlarm).is_ok());
        assert_eq!(m.history().len(), 2);
    }

    #[test]
    fn test_stale_version_rejected() {
        let m = manager(1);
        let (mut lease, _) = m.acquire(RegionId::from("us-east-1"), TriggerSource::HealthAlarm).unwrap();
        let stale = lease.clone();
        m.transition(&mut lease, WorkflowPhase::AssessingFailure).unwrap();
        let mut stale = stale;
        let err = m.transition(&mut stale, WorkflowPhase::Failover).unwrap_err();
        assert!(matches!(err, DrError::LeaseConflict { .. }));
        assert_eq!(lease.version, 1);
    }

    #[test]
    fn test_transitions_recorded() {
        let m = manager(1);
        let (mut lease, _) = m.acquire(RegionId::from("us-east-1"), TriggerSource::HealthAlarm).unwrap();
        m.transition(&mut lease, WorkflowPhase::AssessingFailure).unwrap();
        let state = m.transition(&mut lease, WorkflowPhase::Failover).unwrap();
        let phases: Vec<_> = state.transitions.iter().map(|t| t.phase).collect();
        assert_eq!(
            phases,
            vec![WorkflowPhase::Idle, WorkflowPhase::AssessingFailure, WorkflowPhase::Failover]
        );
    }

    #[test]
    fn test_capacity_of_two() {
        let m = manager(2);
        assert!(m.acquire(RegionId::from("a"), TriggerSource::HealthAlarm).is_ok());
        assert!(m.acquire(RegionId::from("b"), TriggerSource::HealthAlarm).is_ok());
        assert!(m.acquire(RegionId::from("c"), TriggerSource::HealthAlarm).is_err());
    }
}
