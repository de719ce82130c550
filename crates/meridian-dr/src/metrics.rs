//! Prometheus text exposition of engine state.

use crate::detector::ConflictDetector;
use crate::orchestrator::OrchestratorStats;
use crate::resolver::ResolverStats;
use crate::store::AuditStore;
use crate::tracker::TrackerStats;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Label set of one sample.
pub type Labels = Vec<(String, String)>;

/// One metric family: a name, help text, type and one or more samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    /// Metric name, e.g. `meridian_dr_outcomes_total`.
    pub name: String,
    /// Help text.
    pub help: String,
    /// "counter" or "gauge".
    pub metric_type: String,
    /// Samples, each with its own labels.
    pub samples: Vec<(Labels, f64)>,
}

impl Metric {
    /// Unlabelled counter.
    pub fn counter(name: &str, help: &str, value: f64) -> Self {
        Self::new(name, help, "counter", vec![(Vec::new(), value)])
    }

    /// Unlabelled gauge.
    pub fn gauge(name: &str, help: &str, value: f64) -> Self {
        Self::new(name, help, "gauge", vec![(Vec::new(), value)])
    }

    /// Labelled family.
    pub fn new(name: &str, help: &str, metric_type: &str, samples: Vec<(Labels, f64)>) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            metric_type: metric_type.to_string(),
            samples,
        }
    }

    /// Prometheus text format. HELP and TYPE are written once per family.
    pub fn format(&self) -> String {
        let mut output = format!("# HELP {} {}\n", self.name, self.help);
        output.push_str(&format!("# TYPE {} {}\n", self.name, self.metric_type));
        for (labels, value) in &self.samples {
            if labels.is_empty() {
                output.push_str(&format!("{} {}\n", self.name, format_value(*value)));
            } else {
                let label_str = labels
                    .iter()
                    .map(|(k, v)| format!("{}=\"{}\"", k, escape(v)))
                    .collect::<Vec<_>>()
                    .join(",");
                output.push_str(&format!("{}{{{}}} {}\n", self.name, label_str, format_value(*value)));
            }
        }
        output
    }
}

fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

fn escape(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn label(k: &str, v: impl ToString) -> Labels {
    vec![(k.to_string(), v.to_string())]
}

/// Point-in-time engine metrics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineMetrics {
    /// Modification records retained.
    pub modifications: u64,
    /// Outcome rows by strategy id.
    pub outcomes_by_strategy: BTreeMap<String, u64>,
    /// Records currently in conflict within the detection window.
    pub open_conflicts: u64,
    /// Finished workflows by terminal status.
    pub failovers_by_terminal: BTreeMap<String, u64>,
    /// Workflows holding the lease.
    pub active_failovers: u64,
    /// Regions whose health row is unhealthy.
    pub unhealthy_regions: u64,
    /// Latest replica lag per region.
    pub replica_lag_ms: BTreeMap<String, u64>,
    /// Counters from live components; absent when rendering a snapshot.
    pub tracker: Option<TrackerStats>,
    /// Resolver counters.
    pub resolver: Option<ResolverStats>,
    /// Orchestrator counters.
    pub orchestrator: Option<OrchestratorStats>,
}

impl EngineMetrics {
    /// Collect from the store.
    pub fn collect(store: &Arc<AuditStore>, environment: &str, window: chrono::Duration) -> Self {
        let mut outcomes_by_strategy = BTreeMap::new();
        for o in store.all_outcomes() {
            *outcomes_by_strategy.entry(o.strategy_used).or_insert(0) += 1;
        }

        let mut failovers_by_terminal = BTreeMap::new();
        let mut active_failovers = 0;
        for f in store.failover_history(environment) {
            match f.terminal {
                Some(t) => *failovers_by_terminal.entry(t.as_str().to_string()).or_insert(0) += 1,
                None if f.lease_held => active_failovers += 1,
                None => {}
            }
        }

        Self {
            modifications: store.modification_count() as u64,
            outcomes_by_strategy,
            open_conflicts: ConflictDetector::new(store.clone()).scan(window).len() as u64,
            failovers_by_terminal,
            active_failovers,
            unhealthy_regions: store.all_health().iter().filter(|h| !h.healthy).count() as u64,
            replica_lag_ms: store
                .latest_lag()
                .into_iter()
                .map(|s| (s.region.to_string(), s.lag_ms))
                .collect(),
            tracker: None,
            resolver: None,
            orchestrator: None,
        }
    }

    /// Attach live component counters.
    pub fn with_components(
        mut self,
        tracker: TrackerStats,
        resolver: ResolverStats,
        orchestrator: OrchestratorStats,
    ) -> Self {
        self.tracker = Some(tracker);
        self.resolver = Some(resolver);
        self.orchestrator = Some(orchestrator);
        self
    }

    /// Every metric family.
    pub fn to_metrics(&self) -> Vec<Metric> {
        let mut out = vec![
            Metric::gauge(
                "meridian_dr_modifications",
                "Modification records retained in the log",
                self.modifications as f64,
            ),
            Metric::new(
                "meridian_dr_outcomes_total",
                "Resolution outcomes by strategy",
                "counter",
                self.outcomes_by_strategy
                    .iter()
                    .map(|(s, n)| (label("strategy", s), *n as f64))
                    .collect(),
            ),
            Metric::gauge(
                "meridian_dr_open_conflicts",
                "Records modified by two or more regions inside the detection window",
                self.open_conflicts as f64,
            ),
            Metric::new(
                "meridian_dr_failovers_total",
                "Finished failover workflows by terminal status",
                "counter",
                self.failovers_by_terminal
                    .iter()
                    .map(|(s, n)| (label("status", s), *n as f64))
                    .collect(),
            ),
            Metric::gauge(
                "meridian_dr_active_failovers",
                "Failover workflows holding the lease",
                self.active_failovers as f64,
            ),
            Metric::gauge(
                "meridian_dr_unhealthy_regions",
                "Regions currently marked unhealthy",
                self.unhealthy_regions as f64,
            ),
            Metric::new(
                "meridian_dr_replica_lag_ms",
                "Latest replica lag per region in milliseconds",
                "gauge",
                self.replica_lag_ms
                    .iter()
                    .map(|(r, ms)| (label("region", r), *ms as f64))
                    .collect(),
            ),
        ];

        if let Some(t) = &self.tracker {
            out.push(Metric::new(
                "meridian_dr_tracked_writes_total",
                "Writes seen by the modification tracker by result",
                "counter",
                vec![
                    (label("result", "recorded"), t.recorded as f64),
                    (label("result", "skipped"), t.skipped as f64),
                    (label("result", "failed"), t.failed as f64),
                ],
            ));
        }
        if let Some(r) = &self.resolver {
            out.push(Metric::counter(
                "meridian_dr_resolutions_total",
                "Resolve calls completed",
                r.resolutions as f64,
            ));
            out.push(Metric::counter(
                "meridian_dr_default_strategy_fallbacks_total",
                "Resolutions that fell back to the default strategy",
                r.default_fallbacks as f64,
            ));
            out.push(Metric::counter(
                "meridian_dr_outcome_write_retries_total",
                "Outcome writes retried after a failed append",
                r.write_retries as f64,
            ));
            out.push(Metric::counter(
                "meridian_dr_outcomes_unpersisted_total",
                "Outcomes returned without an audit row",
                r.unpersisted as f64,
            ));
        }
        if let Some(o) = &self.orchestrator {
            out.push(Metric::counter(
                "meridian_dr_alarms_total",
                "Primary-region alarms raised",
                o.alarms_raised as f64,
            ));
            out.push(Metric::counter(
                "meridian_dr_rejected_triggers_total",
                "Failover triggers rejected because the lease was held",
                o.rejected_triggers as f64,
            ));
        }
        out
    }

    /// Render as Prometheus text.
    pub fn format_prometheus(&self) -> String {
        self.to_metrics().iter().map(Metric::format).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewModification;
    use crate::types::{Operation, RegionHealthStatus, RegionId, ReplicaLagSample};
    use chrono::Utc;

    #[test]
    fn test_metric_format_with_labels() {
        let m = Metric::new(
            "x_total",
            "Help text",
            "counter",
            vec![(label("a", "1"), 2.0), (label("a", "2"), 3.5)],
        );
        let out = m.format();
        assert_eq!(out.matches("# HELP").count(), 1);
        assert!(out.contains("# TYPE x_total counter"));
        assert!(out.contains("x_total{a=\"1\"} 2\n"));
        assert!(out.contains("x_total{a=\"2\"} 3.5\n"));
    }

    #[test]
    fn test_label_values_escaped() {
        let m = Metric::new("m", "h", "gauge", vec![(label("k", "a\"b"), 1.0)]);
        assert!(m.format().contains("m{k=\"a\\\"b\"} 1"));
    }

    #[test]
    fn test_collect_from_store() {
        let store = Arc::new(AuditStore::new());
        let now = Utc::now();
        for region in ["us-east-1", "eu-west-1"] {
            store
                .append_modification(NewModification {
                    table: "users".into(),
                    record_id: "42".into(),
                    region: RegionId::from(region),
                    operation: Operation::Update,
                    timestamp: now,
                    data_hash: String::new(),
                    actor: "system".into(),
                })
                .unwrap();
        }
        let mut down = RegionHealthStatus::new(RegionId::from("us-east-1"), now);
        down.healthy = false;
        store.put_health(down);
        store
            .append_lag_sample(ReplicaLagSample {
                region: RegionId::from("eu-west-1"),
                lag_ms: 1200,
                captured_at: now,
            })
            .unwrap();

        let metrics = EngineMetrics::collect(&store, "production", chrono::Duration::minutes(5));
        assert_eq!(metrics.modifications, 2);
        assert_eq!(metrics.open_conflicts, 1);
        assert_eq!(metrics.unhealthy_regions, 1);
        let text = metrics.format_prometheus();
        assert!(text.contains("meridian_dr_replica_lag_ms{region=\"eu-west-1\"} 1200"));
        assert!(text.contains("meridian_dr_open_conflicts 1"));
        assert!(!text.contains("meridian_dr_rejected_triggers_total"));
    }

    #[test]
    fn test_component_counters_rendered() {
        let store = Arc::new(AuditStore::new());
        let metrics = EngineMetrics::collect(&store, "production", chrono::Duration::minutes(5))
            .with_components(
                TrackerStats::default(),
                ResolverStats::default(),
                OrchestratorStats {
                    rejected_triggers: 2,
                    ..Default::default()
                },
            );
        let text = metrics.format_prometheus();
        assert!(text.contains("meridian_dr_rejected_triggers_total 2"));
        assert!(text.contains("meridian_dr_tracked_writes_total{result=\"failed\"} 0"));
    }
}
