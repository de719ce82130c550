//! The engine wiring tracking, detection, resolution, health monitoring,
//! failover orchestration and retention together.

use crate::collaborators::{Collaborators, RegionProbe};
use crate::config::DrConfig;
use crate::detector::{ConflictDetector, ConflictReport};
use crate::error::{DrError, Result};
use crate::health::{HealthEvent, HealthMonitor, ProbeSettings};
use crate::lag::LagMonitor;
use crate::lease::FailoverState;
use crate::metrics::EngineMetrics;
use crate::notify::Notifier;
use crate::orchestrator::{DrOrchestrator, FailoverRequest};
use crate::resolver::{ConflictResolver, Resolution};
use crate::retention::{RetentionJob, RetentionPolicy};
use crate::rules::RuleSet;
use crate::store::AuditStore;
use crate::tracker::{ModificationTracker, TrackOutcome};
use crate::types::{ConflictType, Operation, RegionId};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Constructed, background loops not running.
    Idle,
    /// Background loops running.
    Running,
    /// Stopped; cannot be restarted.
    Stopped,
}

/// Result of one detection sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Conflicts found.
    pub conflicts: Vec<ConflictReport>,
    /// Conflicts resolved in this sweep.
    pub resolved: Vec<Resolution>,
    /// Conflicts skipped because nothing changed since the last sweep resolved them.
    pub unchanged: usize,
    /// Resolutions that returned an error.
    pub errors: usize,
}

type RecordKey = (String, String);

/// The DR engine.
pub struct DrEngine {
    config: DrConfig,
    store: Arc<AuditStore>,
    tracker: ModificationTracker,
    detector: ConflictDetector,
    resolver: ConflictResolver,
    lag: LagMonitor,
    orchestrator: Arc<DrOrchestrator>,
    monitor: Arc<HealthMonitor>,
    retention: Arc<RetentionJob>,
    health_rx: std::sync::Mutex<Option<mpsc::Receiver<HealthEvent>>>,
    state: Mutex<EngineState>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Newest modification seq already resolved by the sweep, per record.
    swept: DashMap<RecordKey, u64>,
}

impl DrEngine {
    /// Build an engine with an empty store seeded from `config.rules`.
    pub fn new(
        config: DrConfig,
        probe: Arc<dyn RegionProbe>,
        collaborators: Collaborators,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let store = Arc::new(AuditStore::with_rules(RuleSet::seed(&config.rules)));
        Self::with_store(config, store, probe, collaborators, notifier)
    }

    /// Build an engine over an existing store.
    pub fn with_store(
        config: DrConfig,
        store: Arc<AuditStore>,
        probe: Arc<dyn RegionProbe>,
        collaborators: Collaborators,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        config.validate()?;

        let tracker = ModificationTracker::new(store.clone(), config.tracker_actor.clone(), config.track_all_tables);
        let detector = ConflictDetector::new(store.clone());
        let resolver = ConflictResolver::new(store.clone(), config.region_priority.clone(), config.conflict_window())
            .with_notifier(
                notifier.clone(),
                config.notification.channel.clone(),
                config.notification_timeout(),
            );
        let lag = LagMonitor::new(store.clone(), config.rpo());

        let (health_tx, health_rx) = mpsc::channel(64);
        let monitor = Arc::new(HealthMonitor::new(
            store.clone(),
            probe,
            config.regions.clone(),
            ProbeSettings::from(&config),
            health_tx,
        ));
        let orchestrator = Arc::new(DrOrchestrator::new(
            config.clone(),
            store.clone(),
            collaborators,
            notifier,
        ));
        let retention = Arc::new(RetentionJob::new(
            store.clone(),
            RetentionPolicy::from_config(&config.retention),
        ));
        let (shutdown, _) = watch::channel(false);

        info!(
            environment = %config.environment,
            regions = config.regions.len(),
            primary = %config.primary_region,
            "DR engine created"
        );

        Ok(Self {
            config,
            store,
            tracker,
            detector,
            resolver,
            lag,
            orchestrator,
            monitor,
            retention,
            health_rx: std::sync::Mutex::new(Some(health_rx)),
            state: Mutex::new(EngineState::Idle),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            swept: DashMap::new(),
        })
    }

    /// Configuration in effect.
    pub fn config(&self) -> &DrConfig {
        &self.config
    }

    /// The shared store.
    pub fn store(&self) -> &Arc<AuditStore> {
        &self.store
    }

    /// Modification tracker.
    pub fn tracker(&self) -> &ModificationTracker {
        &self.tracker
    }

    /// Conflict resolver.
    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    /// Failover orchestrator.
    pub fn orchestrator(&self) -> &Arc<DrOrchestrator> {
        &self.orchestrator
    }

    /// Health monitor.
    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    /// Replica lag monitor.
    pub fn lag(&self) -> &LagMonitor {
        &self.lag
    }

    /// Retention job.
    pub fn retention(&self) -> &Arc<RetentionJob> {
        &self.retention
    }

    /// Track a write. Never fails the caller.
    pub fn record_write<P: Serialize + ?Sized>(
        &self,
        table: &str,
        record_id: &str,
        region: &RegionId,
        op: Operation,
        payload: &P,
    ) -> TrackOutcome {
        self.tracker.record(table, record_id, region, op, payload)
    }

    /// Detect conflicts for one record using the configured window.
    pub fn detect_conflicts(&self, table: &str, record_id: &str) -> ConflictReport {
        self.detector
            .detect_conflicts(table, record_id, self.config.conflict_window())
    }

    /// Resolve one record.
    pub async fn resolve(&self, table: &str, record_id: &str, conflict_type: ConflictType) -> Result<Resolution> {
        self.resolver.resolve(table, record_id, conflict_type).await
    }

    /// Start a failover on operator request.
    pub async fn trigger_failover(&self, request: FailoverRequest) -> Result<FailoverState> {
        self.orchestrator.trigger_failover(request).await
    }

    /// Scan the whole log for conflicts and, when enabled, resolve those
    /// with modifications newer than the last sweep's resolution.
    pub async fn sweep(&self) -> SweepReport {
        let conflicts = self.detector.scan(self.config.conflict_window());
        let mut report = SweepReport::default();

        if self.config.auto_resolve_on_sweep {
            for conflict in &conflicts {
                let newest = conflict.records.iter().map(|r| r.seq).max().unwrap_or(0);
                let key = (conflict.table.clone(), conflict.record_id.clone());
                let already = self.swept.get(&key).map(|seq| *seq);
                if already.is_some_and(|seq| seq >= newest) {
                    report.unchanged += 1;
                    continue;
                }
                match self
                    .resolver
                    .resolve(&conflict.table, &conflict.record_id, self.config.sweep_conflict_type)
                    .await
                {
                    Ok(resolution) => {
                        self.swept.insert(key, newest);
                        report.resolved.push(resolution);
                    }
                    Err(e) => {
                        warn!(table = %conflict.table, record_id = %conflict.record_id, error = %e, "sweep resolution failed");
                        report.errors += 1;
                    }
                }
            }
        }

        if conflicts.is_empty() {
            debug!("detection sweep found no conflicts");
        } else {
            info!(
                conflicts = conflicts.len(),
                resolved = report.resolved.len(),
                unchanged = report.unchanged,
                "detection sweep"
            );
        }
        report.conflicts = conflicts;
        report
    }

    /// Current metrics.
    pub fn metrics(&self) -> EngineMetrics {
        EngineMetrics::collect(&self.store, &self.config.environment, self.config.conflict_window())
            .with_components(self.tracker.stats(), self.resolver.stats(), self.orchestrator.stats())
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> EngineState {
        *self.state.lock().await
    }

    /// Spawn probing, orchestration, retention and detection loops.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock().await;
        if *state != EngineState::Idle {
            return Err(DrError::Config {
                msg: format!("engine cannot start from state {:?}", *state),
            });
        }
        let health_rx = self
            .health_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(DrError::Shutdown)?;

        let mut tasks = self.tasks.lock().await;
        tasks.extend(self.monitor.clone().spawn(self.shutdown.subscribe()));
        tasks.extend(self.retention.clone().spawn(self.shutdown.subscribe()));
        tasks.push(tokio::spawn(
            self.orchestrator
                .clone()
                .run(health_rx, self.shutdown.subscribe()),
        ));
        tasks.push(self.spawn_sweeper());

        *state = EngineState::Running;
        info!(environment = %self.config.environment, tasks = tasks.len(), "DR engine started");
        Ok(())
    }

    fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        let period = Duration::from_secs(self.config.detection_sweep_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        engine.sweep().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Signal every loop to stop and wait for them.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if *state == EngineState::Stopped {
            return;
        }
        let _ = self.shutdown.send(true);
        let handles: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        *state = EngineState::Stopped;
        info!(environment = %self.config.environment, "DR engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::DryRunProbe;
    use crate::notify::MemoryNotifier;
    use serde_json::json;

    fn engine() -> Arc<DrEngine> {
        Arc::new(
            DrEngine::new(
                DrConfig::default(),
                Arc::new(DryRunProbe),
                Collaborators::dry_run(),
                Arc::new(MemoryNotifier::new()),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = DrConfig {
            regions: vec![RegionId::from("us-east-1")],
            ..Default::default()
        };
        let result = DrEngine::new(
            config,
            Arc::new(DryRunProbe),
            Collaborators::dry_run(),
            Arc::new(MemoryNotifier::new()),
        );
        assert!(matches!(result, Err(DrError::Config { .. })));
    }

    #[tokio::test]
    async fn test_sweep_resolves_each_change_once() {
        let e = engine();
        let east = RegionId::from("us-east-1");
        let west = RegionId::from("eu-west-1");
        e.record_write("users", "1", &east, Operation::Update, &json!({"v": 1}));
        e.record_write("users", "1", &west, Operation::Update, &json!({"v": 2}));

        let first = e.sweep().await;
        assert_eq!(first.conflicts.len(), 1);
        assert_eq!(first.resolved.len(), 1);

        let second = e.sweep().await;
        assert_eq!(second.resolved.len(), 0);
        assert_eq!(second.unchanged, 1);
        assert_eq!(e.store().outcome_count(), 1);

        e.record_write("users", "1", &east, Operation::Update, &json!({"v": 3}));
        assert_eq!(e.sweep().await.resolved.len(), 1);
        assert_eq!(e.store().outcome_count(), 2);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let e = engine();
        e.start().await.unwrap();
        assert_eq!(e.state().await, EngineState::Running);
        assert!(e.start().await.is_err());
        e.stop().await;
        assert_eq!(e.state().await, EngineState::Stopped);
        assert!(e.tasks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_metrics_include_components() {
        let e = engine();
        e.record_write("users", "9", &RegionId::from("us-east-1"), Operation::Insert, &json!({}));
        let text = e.metrics().format_prometheus();
        assert!(text.contains("meridian_dr_tracked_writes_total{result=\"recorded\"} 1"));
        assert!(text.contains("meridian_dr_rejected_triggers_total 0"));
    }
}
