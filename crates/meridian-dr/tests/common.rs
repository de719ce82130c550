//! Shared fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use meridian_dr::collaborators::{
    CapacityScaler, Collaborators, DatabaseFailover, DryRunProbe, EndpointValidator, ProbeReport,
    RegionProbe, RoutingMode, TrafficRouter,
};
use meridian_dr::notify::{MemoryNotifier, NotificationContext, Notifier, Severity};
use meridian_dr::{DrConfig, DrEngine, DrError, RegionId, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const US: &str = "us-east-1";
pub const EU: &str = "eu-west-1";
pub const AP: &str = "ap-southeast-1";

/// Fixed base instant; offsets in seconds are added to it.
pub fn at(offset_secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(offset_secs)
}

/// Config with short probe timing suited to paused-clock tests.
pub fn fast_config() -> DrConfig {
    DrConfig {
        probe_interval_secs: 10,
        probe_timeout_secs: 1,
        probe_retries: 0,
        probe_backoff_ms: 10,
        unhealthy_threshold: 3,
        failover_threshold_seconds: 300,
        ..Default::default()
    }
}

/// Probe that fails for the regions marked down.
#[derive(Default)]
pub struct ScriptedProbe {
    down: Mutex<HashSet<RegionId>>,
}

impl ScriptedProbe {
    pub fn with_down(regions: &[&str]) -> Self {
        Self {
            down: Mutex::new(regions.iter().map(|r| RegionId::from(*r)).collect()),
        }
    }
}

#[async_trait]
impl RegionProbe for ScriptedProbe {
    async fn probe(&self, region: &RegionId) -> Result<ProbeReport> {
        if self.down.lock().unwrap().contains(region) {
            Err(DrError::TransientProbe {
                region: region.to_string(),
                msg: "connection refused".into(),
            })
        } else {
            Ok(ProbeReport::healthy(5))
        }
    }
}

/// Everything the recording collaborators were asked to do, in order.
#[derive(Default)]
pub struct CallLog {
    calls: Mutex<Vec<String>>,
}

impl CallLog {
    pub fn push(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

/// Database that records promotions, optionally after a delay.
pub struct RecordingDb {
    pub log: Arc<CallLog>,
    pub delay: Duration,
}

#[async_trait]
impl DatabaseFailover for RecordingDb {
    async fn promote(&self, region: &RegionId) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.log.push(format!("promote {region}"));
        Ok(())
    }

    async fn restore_point_in_time(&self, region: &RegionId, snapshot: &str) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.log.push(format!("restore {region} {snapshot}"));
        Ok(())
    }
}

pub struct RecordingRouter {
    pub log: Arc<CallLog>,
}

#[async_trait]
impl TrafficRouter for RecordingRouter {
    async fn update_routing(&self, domain: &str, region: &RegionId, mode: RoutingMode) -> Result<()> {
        self.log.push(format!("route {domain} {region} {mode}"));
        Ok(())
    }
}

pub struct RecordingScaler {
    pub log: Arc<CallLog>,
}

#[async_trait]
impl CapacityScaler for RecordingScaler {
    async fn scale(&self, region: &RegionId, desired_capacity: u32) -> Result<()> {
        self.log.push(format!("scale {region} {desired_capacity}"));
        Ok(())
    }
}

/// Validator answering a fixed verdict.
pub struct FixedValidator(pub bool);

#[async_trait]
impl EndpointValidator for FixedValidator {
    async fn validate(&self, _endpoint: &str, _region: &RegionId) -> Result<bool> {
        Ok(self.0)
    }
}

/// Collaborator and notifier that never answer.
pub struct Hanging;

#[async_trait]
impl DatabaseFailover for Hanging {
    async fn promote(&self, _region: &RegionId) -> Result<()> {
        std::future::pending().await
    }

    async fn restore_point_in_time(&self, _region: &RegionId, _snapshot: &str) -> Result<()> {
        std::future::pending().await
    }
}

#[async_trait]
impl CapacityScaler for Hanging {
    async fn scale(&self, _region: &RegionId, _desired_capacity: u32) -> Result<()> {
        std::future::pending().await
    }
}

#[async_trait]
impl EndpointValidator for Hanging {
    async fn validate(&self, _endpoint: &str, _region: &RegionId) -> Result<bool> {
        std::future::pending().await
    }
}

#[async_trait]
impl Notifier for Hanging {
    async fn notify(
        &self,
        _channel: &str,
        _severity: Severity,
        _message: &str,
        _context: &NotificationContext,
    ) -> Result<()> {
        std::future::pending().await
    }
}

/// Recording collaborators with a database delay and a validation verdict.
pub fn recording(db_delay: Duration, validation_passes: bool) -> (Collaborators, Arc<CallLog>) {
    let log = Arc::new(CallLog::default());
    let collaborators = Collaborators {
        database: Arc::new(RecordingDb {
            log: log.clone(),
            delay: db_delay,
        }),
        router: Arc::new(RecordingRouter { log: log.clone() }),
        scaler: Arc::new(RecordingScaler { log: log.clone() }),
        validator: Arc::new(FixedValidator(validation_passes)),
    };
    (collaborators, log)
}

/// Engine over dry-run collaborators with a memory notifier.
pub fn dry_engine(config: DrConfig) -> (Arc<DrEngine>, MemoryNotifier) {
    let sink = MemoryNotifier::new();
    let engine = DrEngine::new(
        config,
        Arc::new(DryRunProbe),
        Collaborators::dry_run(),
        Arc::new(sink.clone()),
    )
    .unwrap();
    (Arc::new(engine), sink)
}
