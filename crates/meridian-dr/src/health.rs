//! Region health monitoring.
//!
//! One tokio task per region probes on a fixed interval and is the only writer
//! of that region's [`RegionHealthStatus`] row. A cycle fails only when every
//! attempt (initial plus retries) fails; `unhealthy_threshold` failed cycles in
//! a row flip the region to unhealthy and one good cycle flips it back.

use crate::collaborators::{ProbeReport, RegionProbe};
use crate::config::DrConfig;
use crate::error::{DrError, Result};
use crate::store::AuditStore;
use crate::types::{RegionHealthStatus, RegionId};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Health state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthEvent {
    /// Region crossed the failure threshold.
    RegionUnhealthy {
        /// Region.
        region: RegionId,
        /// Failed cycles in a row.
        consecutive_failures: u32,
        /// When the transition happened.
        at: DateTime<Utc>,
    },
    /// Region answered healthy again.
    RegionRecovered {
        /// Region.
        region: RegionId,
        /// When the transition happened.
        at: DateTime<Utc>,
    },
}

impl HealthEvent {
    /// Region the event is about.
    pub fn region(&self) -> &RegionId {
        match self {
            HealthEvent::RegionUnhealthy { region, .. } | HealthEvent::RegionRecovered { region, .. } => region,
        }
    }
}

/// Probe timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSettings {
    /// Interval between cycles.
    pub interval: Duration,
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub retries: u32,
    /// Base backoff, doubled per retry.
    pub backoff: Duration,
    /// Failed cycles before a region is unhealthy.
    pub unhealthy_threshold: u32,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self::from(&DrConfig::default())
    }
}

impl From<&DrConfig> for ProbeSettings {
    fn from(c: &DrConfig) -> Self {
        Self {
            interval: c.probe_interval(),
            timeout: c.probe_timeout(),
            retries: c.probe_retries,
            backoff: Duration::from_millis(c.probe_backoff_ms),
            unhealthy_threshold: c.unhealthy_threshold.max(1),
        }
    }
}

/// Probes regions and publishes [`HealthEvent`]s.
pub struct HealthMonitor {
    store: Arc<AuditStore>,
    probe: Arc<dyn RegionProbe>,
    regions: Vec<RegionId>,
    settings: ProbeSettings,
    events: mpsc::Sender<HealthEvent>,
}

impl HealthMonitor {
    /// Create a monitor and seed a healthy row for every region without one.
    pub fn new(
        store: Arc<AuditStore>,
        probe: Arc<dyn RegionProbe>,
        regions: Vec<RegionId>,
        settings: ProbeSettings,
        events: mpsc::Sender<HealthEvent>,
    ) -> Self {
        let now = Utc::now();
        for region in &regions {
            if store.health(region).is_none() {
                store.put_health(RegionHealthStatus::new(region.clone(), now));
            }
        }
        Self {
            store,
            probe,
            regions,
            settings,
            events,
        }
    }

    /// Regions monitored.
    pub fn regions(&self) -> &[RegionId] {
        &self.regions
    }

    /// Timing in effect.
    pub fn settings(&self) -> &ProbeSettings {
        &self.settings
    }

    /// Run one probe cycle for `region`, update its row and publish any
    /// state transition. Returns the transition, if any.
    pub async fn probe_cycle(&self, region: &RegionId) -> Option<HealthEvent> {
        let result = self.run_attempts(region).await;
        let now = Utc::now();
        let mut row = self
            .store
            .health(region)
            .unwrap_or_else(|| RegionHealthStatus::new(region.clone(), now));
        row.last_check = now;

        let event = match result {
            Ok(report) => {
                row.consecutive_failures = 0;
                row.last_latency_ms = Some(report.latency_ms);
                if row.healthy {
                    None
                } else {
                    row.healthy = true;
                    info!(region = %region, latency_ms = report.latency_ms, "region recovered");
                    Some(HealthEvent::RegionRecovered {
                        region: region.clone(),
                        at: now,
                    })
                }
            }
            Err(e) => {
                row.consecutive_failures = row.consecutive_failures.saturating_add(1);
                debug!(
                    region = %region,
                    consecutive_failures = row.consecutive_failures,
                    error = %e,
                    "probe cycle failed"
                );
                if row.healthy && row.consecutive_failures >= self.settings.unhealthy_threshold {
                    row.healthy = false;
                    let confirmed = DrError::ConfirmedRegionFailure {
                        region: region.to_string(),
                        consecutive_failures: row.consecutive_failures,
                    };
                    warn!(region = %region, "{}", confirmed);
                    Some(HealthEvent::RegionUnhealthy {
                        region: region.clone(),
                        consecutive_failures: row.consecutive_failures,
                        at: now,
                    })
                } else {
                    None
                }
            }
        };

        self.store.put_health(row);
        if let Some(ev) = &event {
            if self.events.send(ev.clone()).await.is_err() {
                debug!(region = %region, "health event receiver dropped");
            }
        }
        event
    }

    /// Attempts for one cycle. Stops retrying when the next attempt could
    /// not finish inside the interval.
    async fn run_attempts(&self, region: &RegionId) -> Result<ProbeReport> {
        let started = Instant::now();
        let mut last_err = None;

        for attempt in 0..=self.settings.retries {
            match tokio::time::timeout(self.settings.timeout, self.probe.probe(region)).await {
                Ok(Ok(report)) if report.healthy => return Ok(report),
                Ok(Ok(report)) => {
                    last_err = Some(DrError::TransientProbe {
                        region: region.to_string(),
                        msg: format!("reported unhealthy after {} ms", report.latency_ms),
                    })
                }
                Ok(Err(e)) => {
                    last_err = Some(DrError::TransientProbe {
                        region: region.to_string(),
                        msg: e.to_string(),
                    })
                }
                Err(_) => {
                    last_err = Some(DrError::TransientProbe {
                        region: region.to_string(),
                        msg: format!("timed out after {:?}", self.settings.timeout),
                    })
                }
            }

            if attempt == self.settings.retries {
                break;
            }
            let wait = self.backoff(attempt);
            if started.elapsed() + wait + self.settings.timeout >= self.settings.interval {
                debug!(region = %region, attempt, "no time left in cycle for another attempt");
                break;
            }
            tokio::time::sleep(wait).await;
        }

        Err(last_err.unwrap_or_else(|| DrError::TransientProbe {
            region: region.to_string(),
            msg: "no probe attempts made".to_string(),
        }))
    }

    /// Exponential backoff with up to 50 % jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.settings.backoff.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << attempt.min(16));
        let jitter = if exp > 1 {
            rand::thread_rng().gen_range(0..=exp / 2)
        } else {
            0
        };
        Duration::from_millis(exp + jitter)
    }

    /// Spawn one probing task per region. Tasks stop when `shutdown` flips
    /// to `true` or its sender is dropped.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.regions
            .clone()
            .into_iter()
            .map(|region| {
                let monitor = self.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(monitor.settings.interval);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    info!(region = %region, interval = ?monitor.settings.interval, "probe loop started");
                    loop {
                        tokio::select! {
                            _ = ticker.tick() => {
                                monitor.probe_cycle(&region).await;
                            }
                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    break;
                                }
                            }
                        }
                    }
                    info!(region = %region, "probe loop stopped");
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Probe whose answer per region can be flipped.
    #[derive(Default)]
    struct Switch {
        down: Mutex<HashMap<RegionId, bool>>,
        calls: AtomicU32,
        hang: bool,
    }

    impl Switch {
        fn set_down(&self, region: &str, down: bool) {
            self.down.lock().unwrap().insert(RegionId::from(region), down);
        }
    }

    #[async_trait]
    impl RegionProbe for Switch {
        async fn probe(&self, region: &RegionId) -> Result<ProbeReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            let down = self.down.lock().unwrap().get(region).copied().unwrap_or(false);
            if down {
                Err(DrError::Collaborator {
                    name: "probe".into(),
                    msg: "connection refused".into(),
                })
            } else {
                Ok(ProbeReport::healthy(12))
            }
        }
    }

    fn settings() -> ProbeSettings {
        ProbeSettings {
            interval: Duration::from_secs(300),
            timeout: Duration::from_secs(10),
            retries: 2,
            backoff: Duration::from_millis(500),
            unhealthy_threshold: 3,
        }
    }

    fn monitor(probe: Arc<Switch>) -> (Arc<AuditStore>, HealthMonitor, mpsc::Receiver<HealthEvent>) {
        let store = Arc::new(AuditStore::new());
        let (tx, rx) = mpsc::channel(16);
        let m = HealthMonitor::new(
            store.clone(),
            probe,
            vec![RegionId::from("us-east-1"), RegionId::from("eu-west-1")],
            settings(),
            tx,
        );
        (store, m, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_failures_flip_to_unhealthy() {
        let probe = Arc::new(Switch::default());
        probe.set_down("us-east-1", true);
        let (store, m, mut rx) = monitor(probe.clone());
        let region = RegionId::from("us-east-1");

        assert!(m.probe_cycle(&region).await.is_none());
        assert!(m.probe_cycle(&region).await.is_none());
        let ev = m.probe_cycle(&region).await.unwrap();
        assert!(matches!(ev, HealthEvent::RegionUnhealthy { consecutive_failures: 3, .. }));
        assert_eq!(rx.recv().await.unwrap(), ev);

        let row = store.health(&region).unwrap();
        assert!(!row.healthy);
        assert_eq!(row.consecutive_failures, 3);
        // three attempts per cycle
        assert_eq!(probe.calls.load(Ordering::SeqCst), 9);

        // staying down does not re-emit
        assert!(m.probe_cycle(&region).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_success_recovers() {
        let probe = Arc::new(Switch::default());
        probe.set_down("us-east-1", true);
        let (store, m, _rx) = monitor(probe.clone());
        let region = RegionId::from("us-east-1");
        for _ in 0..3 {
            m.probe_cycle(&region).await;
        }
        probe.set_down("us-east-1", false);
        let ev = m.probe_cycle(&region).await.unwrap();
        assert!(matches!(ev, HealthEvent::RegionRecovered { .. }));
        let row = store.health(&region).unwrap();
        assert!(row.healthy);
        assert_eq!(row.consecutive_failures, 0);
        assert_eq!(row.last_latency_ms, Some(12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_probe_times_out() {
        let probe = Arc::new(Switch {
            hang: true,
            ..Default::default()
        });
        let (store, m, _rx) = monitor(probe);
        let region = RegionId::from("eu-west-1");
        let started = Instant::now();
        assert!(m.probe_cycle(&region).await.is_none());
        assert!(started.elapsed() < Duration::from_secs(300));
        assert_eq!(store.health(&region).unwrap().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_regions_are_independent() {
        let probe = Arc::new(Switch::default());
        probe.set_down("us-east-1", true);
        let (store, m, _rx) = monitor(probe);
        for _ in 0..3 {
            m.probe_cycle(&RegionId::from("us-east-1")).await;
            m.probe_cycle(&RegionId::from("eu-west-1")).await;
        }
        assert!(!store.health(&RegionId::from("us-east-1")).unwrap().healthy);
        assert!(store.health(&RegionId::from("eu-west-1")).unwrap().healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_loops_stop_on_shutdown() {
        let probe = Arc::new(Switch::default());
        probe.set_down("eu-west-1", true);
        let (store, m, mut rx) = monitor(probe);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handles = Arc::new(m).spawn(stop_rx);
        assert_eq!(handles.len(), 2);

        // first tick fires immediately, then every 300 s
        tokio::time::sleep(Duration::from_secs(601)).await;
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.region(), &RegionId::from("eu-west-1"));
        assert!(!store.health(&RegionId::from("eu-west-1")).unwrap().healthy);

        stop_tx.send(true).unwrap();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[test]
    fn test_settings_from_config() {
        let s = ProbeSettings::from(&DrConfig::default());
        assert_eq!(s.interval, Duration::from_secs(300));
        assert_eq!(s.timeout, Duration::from_secs(10));
        assert_eq!(s.unhealthy_threshold, 3);
    }
}
