//! Replica lag against the recovery point objective.

use crate::error::Result;
use crate::store::AuditStore;
use crate::types::{RegionId, ReplicaLagSample};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lag classification relative to the RPO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LagStatus {
    /// Below half the RPO.
    Ok,
    /// At or above half the RPO.
    Warning {
        /// Measured lag in milliseconds.
        lag_ms: u64,
    },
    /// At or above the RPO; data written in this window would be lost on failover.
    Exceeded {
        /// Measured lag in milliseconds.
        lag_ms: u64,
    },
}

/// Per-region lag summary over retained samples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionLagStats {
    /// Region.
    pub region: RegionId,
    /// Retained samples.
    pub sample_count: usize,
    /// Most recent lag.
    pub latest_ms: u64,
    /// Largest retained lag.
    pub max_ms: u64,
    /// Classification of the most recent lag.
    pub status: LagStatus,
}

/// Records replica lag and classifies it.
#[derive(Clone)]
pub struct LagMonitor {
    store: Arc<AuditStore>,
    rpo_ms: u64,
}

impl LagMonitor {
    /// Create a monitor using `rpo` as the exceeded threshold.
    pub fn new(store: Arc<AuditStore>, rpo: Duration) -> Self {
        let rpo_ms = rpo.as_millis() as u64;
        info!(rpo_ms, warn_ms = rpo_ms / 2, "lag monitor initialized");
        Self { store, rpo_ms }
    }

    /// Classify a lag value.
    pub fn classify(&self, lag_ms: u64) -> LagStatus {
        if lag_ms >= self.rpo_ms {
            LagStatus::Exceeded { lag_ms }
        } else if lag_ms.saturating_mul(2) >= self.rpo_ms {
            LagStatus::Warning { lag_ms }
        } else {
            LagStatus::Ok
        }
    }

    /// Append a sample for `region` and return its classification.
    pub fn record(&self, region: &RegionId, lag_ms: u64) -> Result<LagStatus> {
        self.store.append_lag_sample(ReplicaLagSample {
            region: region.clone(),
            lag_ms,
            captured_at: Utc::now(),
        })?;
        let status = self.classify(lag_ms);
        match status {
            LagStatus::Exceeded { .. } => {
                warn!(region = %region, lag_ms, rpo_ms = self.rpo_ms, "replica lag exceeds RPO")
            }
            LagStatus::Warning { .. } => {
                info!(region = %region, lag_ms, rpo_ms = self.rpo_ms, "replica lag above half of RPO")
            }
            LagStatus::Ok => debug!(region = %region, lag_ms, "replica lag sample"),
        }
        Ok(status)
    }

    /// Summary for one region, `None` without samples.
    pub fn stats(&self, region: &RegionId) -> Option<RegionLagStats> {
        let samples = self.store.lag_samples_for(region);
        let latest = samples.iter().max_by_key(|s| s.captured_at)?;
        let max_ms = samples.iter().map(|s| s.lag_ms).max().unwrap_or(0);
        Some(RegionLagStats {
            region: region.clone(),
            sample_count: samples.len(),
            latest_ms: latest.lag_ms,
            max_ms,
            status: self.classify(latest.lag_ms),
        })
    }

    /// Summary for every region with samples.
    pub fn all_stats(&self) -> Vec<RegionLagStats> {
        self.store
            .latest_lag()
            .iter()
            .filter_map(|s| self.stats(&s.region))
            .collect()
    }
}
