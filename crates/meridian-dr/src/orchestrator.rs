//! Disaster-recovery workflow.
//!
//! A workflow starts from a health alarm on the current primary or from an
//! operator request, holds the environment's failover lease for its whole
//! life, and always ends with an explicit [`TerminalStatus`] and a
//! stakeholder notification. The whole run is bounded by the RTO.

use crate::collaborators::{Collaborators, RoutingMode};
use crate::config::{DatabaseFailoverStrategy, DnsFailoverStrategy, DrConfig, ServiceFailoverStrategy};
use crate::error::{DrError, Result};
use crate::health::HealthEvent;
use crate::lease::{
    FailoverState, Lease, LeaseManager, SubAction, SubActionOutcome, SubActionResult, TerminalStatus,
    TriggerSource, WorkflowPhase,
};
use crate::notify::{deliver, NotificationContext, Notifier, Severity};
use crate::store::AuditStore;
use crate::types::RegionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Operator request to fail over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverRequest {
    /// Who asked.
    pub requested_by: String,
    /// Region to promote. `None` picks from `failover_order`.
    pub target: Option<RegionId>,
    /// Proceed even if the primary is still reported healthy.
    pub force: bool,
}

impl FailoverRequest {
    /// Forced request without an explicit target.
    pub fn forced(requested_by: impl Into<String>) -> Self {
        Self {
            requested_by: requested_by.into(),
            target: None,
            force: true,
        }
    }

    /// Set the target region.
    pub fn with_target(mut self, target: RegionId) -> Self {
        self.target = Some(target);
        self
    }
}

/// Orchestrator history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowEvent {
    /// Enough unhealthy transitions of the primary inside the window.
    AlarmRaised {
        /// Primary region.
        region: RegionId,
        /// Transitions counted.
        transitions: usize,
        /// When.
        at: DateTime<Utc>,
    },
    /// A trigger arrived while the lease was held.
    TriggerRejected {
        /// What tried to start a workflow.
        trigger: TriggerSource,
        /// Why it was rejected.
        reason: String,
        /// When.
        at: DateTime<Utc>,
    },
    /// Lease acquired.
    WorkflowStarted {
        /// Lease token.
        token: Uuid,
        /// What started it.
        trigger: TriggerSource,
        /// When.
        at: DateTime<Utc>,
    },
    /// Phase change.
    PhaseEntered {
        /// Lease token.
        token: Uuid,
        /// Phase entered.
        phase: WorkflowPhase,
        /// When.
        at: DateTime<Utc>,
    },
    /// Lease released.
    WorkflowFinished {
        /// Lease token.
        token: Uuid,
        /// How it ended.
        terminal: TerminalStatus,
        /// Whether the RTO fired.
        rto_breached: bool,
        /// When.
        at: DateTime<Utc>,
    },
}

/// Orchestrator counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorStats {
    /// Alarms raised from health events.
    pub alarms_raised: u64,
    /// Workflows that acquired the lease.
    pub workflows_started: u64,
    /// Triggers turned away because the lease was held.
    pub rejected_triggers: u64,
}

/// State of one running workflow.
struct WorkflowRun {
    lease: Mutex<Lease>,
    trigger: TriggerSource,
    source: RegionId,
    requested_target: Option<RegionId>,
    force: bool,
}

impl WorkflowRun {
    fn is_manual(&self) -> bool {
        matches!(self.trigger, TriggerSource::Manual { .. })
    }

    fn token(&self) -> Uuid {
        lock(&self.lease).token
    }
}

/// Result the workflow body hands back before the lease is released.
struct Verdict {
    terminal: TerminalStatus,
    detail: Option<String>,
}

impl Verdict {
    fn new(terminal: TerminalStatus, detail: Option<String>) -> Self {
        Self { terminal, detail }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Drives failover workflows for one environment.
pub struct DrOrchestrator {
    config: DrConfig,
    leases: LeaseManager,
    store: Arc<AuditStore>,
    collaborators: Collaborators,
    notifier: Arc<dyn Notifier>,
    primary: RwLock<RegionId>,
    alarm_window: Mutex<VecDeque<DateTime<Utc>>>,
    history: Mutex<Vec<WorkflowEvent>>,
    alarms_raised: AtomicU64,
    workflows_started: AtomicU64,
    rejected_triggers: AtomicU64,
}

impl DrOrchestrator {
    /// Create an orchestrator for `config.environment`.
    pub fn new(
        config: DrConfig,
        store: Arc<AuditStore>,
        collaborators: Collaborators,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let leases = LeaseManager::new(store.clone(), config.environment.clone(), config.max_concurrent_failovers);
        let primary = RwLock::new(config.primary_region.clone());
        Self {
            config,
            leases,
            store,
            collaborators,
            notifier,
            primary,
            alarm_window: Mutex::new(VecDeque::new()),
            history: Mutex::new(Vec::new()),
            alarms_raised: AtomicU64::new(0),
            workflows_started: AtomicU64::new(0),
            rejected_triggers: AtomicU64::new(0),
        }
    }

    /// Region currently holding primary responsibility.
    pub fn primary_region(&self) -> RegionId {
        self.primary.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_primary(&self, region: RegionId) {
        *self.primary.write().unwrap_or_else(|e| e.into_inner()) = region;
    }

    /// Configuration in effect.
    pub fn config(&self) -> &DrConfig {
        &self.config
    }

    /// Lease manager for the environment.
    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    /// Event history, oldest first.
    pub fn events(&self) -> Vec<WorkflowEvent> {
        lock(&self.history).clone()
    }

    /// Current counters.
    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            alarms_raised: self.alarms_raised.load(Ordering::Relaxed),
            workflows_started: self.workflows_started.load(Ordering::Relaxed),
            rejected_triggers: self.rejected_triggers.load(Ordering::Relaxed),
        }
    }

    fn push_event(&self, event: WorkflowEvent) {
        lock(&self.history).push(event);
    }

    /// Feed one health transition. Returns the workflow result when the
    /// event raised an alarm.
    pub async fn handle_health_event(&self, event: HealthEvent) -> Option<Result<FailoverState>> {
        let (region, at) = match event {
            HealthEvent::RegionUnhealthy { region, at, .. } => (region, at),
            HealthEvent::RegionRecovered { region, .. } => {
                debug!(region = %region, "region recovered");
                return None;
            }
        };
        if region != self.primary_region() {
            info!(region = %region, "non-primary region unhealthy, no alarm");
            return None;
        }

        let transitions = {
            let mut window = lock(&self.alarm_window);
            window.push_back(at);
            if let Some(floor) = at.checked_sub_signed(self.config.failover_threshold()) {
                while window.front().is_some_and(|t| *t < floor) {
                    window.pop_front();
                }
            }
            if window.len() < self.config.alarm_threshold as usize {
                debug!(region = %region, transitions = window.len(), "below alarm threshold");
                return None;
            }
            let n = window.len();
            window.clear();
            n
        };

        self.alarms_raised.fetch_add(1, Ordering::Relaxed);
        warn!(region = %region, transitions, "primary region alarm raised");
        self.push_event(WorkflowEvent::AlarmRaised {
            region: region.clone(),
            transitions,
            at: Utc::now(),
        });
        Some(self.start(TriggerSource::HealthAlarm, None, false).await)
    }

    /// Start a workflow on operator request. Manual requests bypass
    /// `auto_failover_enabled`.
    pub async fn trigger_failover(&self, request: FailoverRequest) -> Result<FailoverState> {
        if let Some(target) = &request.target {
            if !self.config.regions.contains(target) {
                return Err(DrError::Config {
                    msg: format!("target region {target} is not configured"),
                });
            }
            if *target == self.primary_region() {
                return Err(DrError::Config {
                    msg: format!("target region {target} is already primary"),
                });
            }
        }
        let trigger = TriggerSource::Manual {
            requested_by: request.requested_by,
        };
        self.start(trigger, request.target, request.force).await
    }

    async fn start(
        &self,
        trigger: TriggerSource,
        requested_target: Option<RegionId>,
        force: bool,
    ) -> Result<FailoverState> {
        let source = self.primary_region();
        let (lease, state) = match self.leases.acquire(source.clone(), trigger.clone()) {
            Ok(acquired) => acquired,
            Err(e @ DrError::FailoverInProgress { .. }) => {
                self.rejected_triggers.fetch_add(1, Ordering::Relaxed);
                warn!(environment = %self.config.environment, ?trigger, error = %e, "failover trigger rejected");
                self.push_event(WorkflowEvent::TriggerRejected {
                    trigger,
                    reason: e.to_string(),
                    at: Utc::now(),
                });
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        self.workflows_started.fetch_add(1, Ordering::Relaxed);
        self.push_event(WorkflowEvent::WorkflowStarted {
            token: state.lease_token,
            trigger: trigger.clone(),
            at: state.started_at,
        });
        info!(
            environment = %self.config.environment,
            source = %source,
            token = %state.lease_token,
            "failover workflow started"
        );

        let run = WorkflowRun {
            lease: Mutex::new(lease),
            trigger,
            source,
            requested_target,
            force,
        };

        let verdict = match tokio::time::timeout(self.config.rto(), self.run_workflow(&run)).await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(e)) => {
                error!(token = %run.token(), error = %e, "failover workflow aborted");
                self.enter(&run, WorkflowPhase::Failed).ok();
                self.notify(&run, Severity::Critical, &format!("Failover workflow aborted: {e}"))
                    .await;
                Verdict::new(TerminalStatus::Failed, Some(e.to_string()))
            }
            Err(_) => self.rto_breached(&run).await,
        };

        self.finish(run, verdict)
    }

    async fn rto_breached(&self, run: &WorkflowRun) -> Verdict {
        let breach = DrError::RtoBreach {
            rto_minutes: self.config.rto_minutes,
        };
        error!(token = %run.token(), "{}", breach);
        let marked = {
            let mut lease = lock(&run.lease);
            self.leases.update(&mut lease, |s| s.rto_breached = true)
        };
        if let Err(e) = marked {
            warn!(error = %e, "could not mark RTO breach on workflow record");
        }
        self.enter(run, WorkflowPhase::Failed).ok();
        self.notify(
            run,
            Severity::Critical,
            &format!("RTO breach: failover did not complete within {} minutes", self.config.rto_minutes),
        )
        .await;
        Verdict::new(TerminalStatus::Failed, Some(breach.to_string()))
    }

    fn finish(&self, run: WorkflowRun, verdict: Verdict) -> Result<FailoverState> {
        let lease = run.lease.into_inner().unwrap_or_else(|e| e.into_inner());
        let token = lease.token;
        let state = self.leases.release(lease, verdict.terminal, verdict.detail)?;
        self.push_event(WorkflowEvent::WorkflowFinished {
            token,
            terminal: verdict.terminal,
            rto_breached: state.rto_breached,
            at: Utc::now(),
        });
        Ok(state)
    }

    fn enter(&self, run: &WorkflowRun, phase: WorkflowPhase) -> Result<FailoverState> {
        let state = {
            let mut lease = lock(&run.lease);
            self.leases.transition(&mut lease, phase)?
        };
        info!(token = %state.lease_token, %phase, "workflow phase");
        self.push_event(WorkflowEvent::PhaseEntered {
            token: state.lease_token,
            phase,
            at: Utc::now(),
        });
        Ok(state)
    }

    fn record(&self, run: &WorkflowRun, f: impl FnOnce(&mut FailoverState)) -> Result<FailoverState> {
        let mut lease = lock(&run.lease);
        self.leases.update(&mut lease, f)
    }

    async fn notify(&self, run: &WorkflowRun, severity: Severity, message: &str) {
        let state = self
            .leases
            .history()
            .into_iter()
            .find(|s| s.lease_token == run.token());
        let mut ctx = NotificationContext::new();
        ctx.insert("environment".into(), self.config.environment.clone());
        ctx.insert("source_region".into(), run.source.to_string());
        if let Some(state) = state {
            ctx.insert("lease_token".into(), state.lease_token.to_string());
            ctx.insert("phase".into(), state.phase.to_string());
            if let Some(target) = state.target_region {
                ctx.insert("target_region".into(), target.to_string());
            }
        }
        deliver(
            self.notifier.as_ref(),
            &self.config.notification.channel,
            severity,
            message,
            &ctx,
            self.config.notification_timeout(),
        )
        .await;
    }

    async fn run_workflow(&self, run: &WorkflowRun) -> Result<Verdict> {
        self.enter(run, WorkflowPhase::AssessingFailure)?;

        let primary_down = self.store.health(&run.source).is_some_and(|h| !h.healthy);
        let confirmed = primary_down || (run.is_manual() && run.force);
        let allowed = run.is_manual() || self.config.auto_failover_enabled;
        if !(confirmed && allowed) {
            let reason = if confirmed {
                "automatic failover disabled"
            } else {
                "primary failure not confirmed"
            };
            warn!(source = %run.source, reason, "failover not performed, monitoring only");
            self.enter(run, WorkflowPhase::MonitoringOnly)?;
            self.notify(
                run,
                Severity::Warning,
                &format!("Region {} degraded, failover not performed: {reason}", run.source),
            )
            .await;
            self.enter(run, WorkflowPhase::Idle)?;
            return Ok(Verdict::new(TerminalStatus::MonitoringOnly, Some(reason.to_string())));
        }

        let Some(target) = self.pick_target(run) else {
            error!(source = %run.source, "no healthy failover target");
            self.enter(run, WorkflowPhase::Failed)?;
            self.notify(
                run,
                Severity::Critical,
                &format!("Region {} failed and no healthy failover target is available", run.source),
            )
            .await;
            return Ok(Verdict::new(TerminalStatus::Failed, Some("no healthy target region".to_string())));
        };
        self.record(run, |s| s.target_region = Some(target.clone()))?;

        self.enter(run, WorkflowPhase::Failover)?;
        let results = self.fan_out(&run.source, &target).await;
        self.record(run, |s| s.sub_actions = results.clone())?;

        let failed: Vec<String> = results
            .iter()
            .filter(|r| !r.succeeded())
            .map(|r| format!("{}: {:?}", r.action, r.outcome))
            .collect();
        let database_ok = results
            .iter()
            .any(|r| r.action == SubAction::DatabaseFailover && r.succeeded());
        if !database_ok {
            let detail = failed.join("; ");
            error!(target = %target, %detail, "database failover failed, halting");
            self.enter(run, WorkflowPhase::Failed)?;
            self.notify(
                run,
                Severity::Critical,
                &format!("Database failover to {target} failed, workflow halted: {detail}"),
            )
            .await;
            return Ok(Verdict::new(TerminalStatus::Failed, Some(detail)));
        }
        if !failed.is_empty() {
            warn!(target = %target, failed = ?failed, "failover continued with failed sub-actions");
        }

        self.enter(run, WorkflowPhase::Validating)?;
        match self.validate(&target).await {
            Ok(()) => {
                self.set_primary(target.clone());
                self.enter(run, WorkflowPhase::NotifyingStakeholders)?;
                self.notify(
                    run,
                    Severity::Info,
                    &format!("Failover from {} to {target} completed", run.source),
                )
                .await;
                self.enter(run, WorkflowPhase::Completed)?;
                Ok(Verdict::new(TerminalStatus::Succeeded, None))
            }
            Err(reason) if self.config.enable_automatic_rollback => {
                warn!(target = %target, %reason, "validation failed, rolling back");
                self.enter(run, WorkflowPhase::RolledBack)?;
                self.rollback(&run.source, &target).await;
                self.enter(run, WorkflowPhase::NotifyingStakeholders)?;
                self.notify(
                    run,
                    Severity::Warning,
                    &format!("Failover to {target} failed validation and was rolled back: {reason}"),
                )
                .await;
                self.enter(run, WorkflowPhase::Completed)?;
                Ok(Verdict::new(TerminalStatus::RolledBack, Some(reason)))
            }
            Err(reason) => {
                error!(target = %target, %reason, "validation failed, manual intervention required");
                self.enter(run, WorkflowPhase::NotifyingStakeholders)?;
                self.notify(
                    run,
                    Severity::Critical,
                    &format!("Failover to {target} failed validation, manual intervention required: {reason}"),
                )
                .await;
                self.enter(run, WorkflowPhase::Completed)?;
                Ok(Verdict::new(TerminalStatus::ManualIntervention, Some(reason)))
            }
        }
    }

    /// Requested target, else the first healthy region in `failover_order`.
    /// Regions without a health row count as healthy.
    fn pick_target(&self, run: &WorkflowRun) -> Option<RegionId> {
        if let Some(target) = &run.requested_target {
            return Some(target.clone());
        }
        self.config
            .failover_order
            .iter()
            .filter(|r| **r != run.source)
            .find(|r| self.store.health(r).map_or(true, |h| h.healthy))
            .cloned()
    }

    /// Run database, routing and scaling in parallel, each under the
    /// sub-action timeout, and collect one result per branch.
    async fn fan_out(&self, source: &RegionId, target: &RegionId) -> Vec<SubActionResult> {
        let limit = self.config.sub_action_timeout();

        let database = {
            let db = self.collaborators.database.clone();
            let target = target.clone();
            let strategy = self.config.database_failover_strategy;
            let snapshot = self.config.restore_snapshot.clone();
            spawn_branch(SubAction::DatabaseFailover, limit, async move {
                match strategy {
                    DatabaseFailoverStrategy::PromoteReplica => db.promote(&target).await,
                    DatabaseFailoverStrategy::PointInTimeRestore => {
                        db.restore_point_in_time(&target, &snapshot).await
                    }
                }
            })
        };

        let routing = {
            let router = self.collaborators.router.clone();
            let domain = self.config.domain.clone();
            let (source, target) = (source.clone(), target.clone());
            let strategy = self.config.dns_failover_strategy;
            spawn_branch(SubAction::DnsUpdate, limit, async move {
                router.update_routing(&domain, &target, RoutingMode::Primary).await?;
                if strategy == DnsFailoverStrategy::FailoverRouting {
                    router.update_routing(&domain, &source, RoutingMode::Secondary).await?;
                }
                Ok(())
            })
        };

        let scaling = {
            let scaler = self.collaborators.scaler.clone();
            let target = target.clone();
            let strategy = self.config.service_failover_strategy;
            let capacity = self.config.target_capacity;
            spawn_branch(SubAction::ServiceScale, limit, async move {
                match strategy {
                    ServiceFailoverStrategy::ScaleUpTarget => scaler.scale(&target, capacity).await,
                    ServiceFailoverStrategy::None => Ok(()),
                }
            })
        };

        let started = Instant::now();
        let (db, dns, svc) = tokio::join!(database, routing, scaling);
        [
            (SubAction::DatabaseFailover, db),
            (SubAction::DnsUpdate, dns),
            (SubAction::ServiceScale, svc),
        ]
        .into_iter()
        .map(|(action, joined)| {
            joined.unwrap_or_else(|e| {
                SubActionResult::new(
                    action,
                    SubActionOutcome::Failed(format!("task panicked: {e}")),
                    started.elapsed(),
                )
            })
        })
        .collect()
    }

    /// Check every validation endpoint against `target` within the
    /// validation budget. `Err` carries the reason.
    async fn validate(&self, target: &RegionId) -> std::result::Result<(), String> {
        let validator = self.collaborators.validator.clone();
        let checks = futures::future::join_all(self.config.validation_endpoints.iter().map(|endpoint| {
            let validator = validator.clone();
            async move { (endpoint, validator.validate(endpoint, target).await) }
        }));

        let results = match tokio::time::timeout(self.config.validation_timeout(), checks).await {
            Ok(results) => results,
            Err(_) => {
                return Err(DrError::ValidationTimeout {
                    minutes: self.config.validation_timeout_minutes,
                }
                .to_string())
            }
        };

        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|(endpoint, result)| match result {
                Ok(true) => None,
                Ok(false) => Some(format!("{endpoint}: check failed")),
                Err(e) => Some(format!("{endpoint}: {e}")),
            })
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures.join("; "))
        }
    }

    /// Point routing back at the old primary. The database side has no
    /// automated rollback and is only logged.
    async fn rollback(&self, source: &RegionId, target: &RegionId) {
        if let Err(e) = self
            .collaborators
            .router
            .update_routing(&self.config.domain, source, RoutingMode::Primary)
            .await
        {
            error!(region = %source, error = %e, "routing rollback failed");
        }
        warn!(
            source = %source,
            target = %target,
            "database rollback has no automated steps, operator action needed"
        );
    }

    /// Consume health events until shutdown. Each alarm is handled on its
    /// own task so a running workflow does not hold up later triggers.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<HealthEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(environment = %self.config.environment, "orchestrator started");
        loop {
            tokio::select! {
                ev = events.recv() => {
                    let Some(ev) = ev else { break };
                    let orchestrator = self.clone();
                    tokio::spawn(async move {
                        if let Some(Err(e)) = orchestrator.handle_health_event(ev).await {
                            debug!(error = %e, "alarm did not start a workflow");
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(environment = %self.config.environment, "orchestrator stopped");
    }
}

/// Spawn one failover branch bounded by `limit`. The branch logs its own
/// result so that a detached branch still reports when it finishes.
fn spawn_branch<F>(action: SubAction, limit: Duration, fut: F) -> JoinHandle<SubActionResult>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let started = Instant::now();
        let outcome = match tokio::time::timeout(limit, fut).await {
            Ok(Ok(())) => SubActionOutcome::Succeeded,
            Ok(Err(e)) => SubActionOutcome::Failed(
                DrError::FailoverSubAction {
                    action: action.to_string(),
                    msg: e.to_string(),
                }
                .to_string(),
            ),
            Err(_) => SubActionOutcome::TimedOut,
        };
        let result = SubActionResult::new(action, outcome, started.elapsed());
        match &result.outcome {
            SubActionOutcome::Succeeded => {
                info!(%action, elapsed_ms = result.elapsed_ms, "failover sub-action succeeded")
            }
            other => warn!(%action, elapsed_ms = result.elapsed_ms, outcome = ?other, "failover sub-action did not succeed"),
        }
        result
    })
}
