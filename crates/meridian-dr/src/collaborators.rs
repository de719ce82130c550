//! Interfaces to the infrastructure the engine drives.
//!
//! Production deployments plug in real implementations; the `DryRun*` types
//! only log the action and succeed.

use crate::error::{DrError, Result};
use crate::types::RegionId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Result of one health probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    /// Whether the region answered healthy.
    pub healthy: bool,
    /// Round-trip latency.
    pub latency_ms: u64,
    /// When the probe completed.
    pub checked_at: DateTime<Utc>,
}

impl ProbeReport {
    /// Healthy report stamped now.
    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            healthy: true,
            latency_ms,
            checked_at: Utc::now(),
        }
    }

    /// Unhealthy report stamped now.
    pub fn unhealthy(latency_ms: u64) -> Self {
        Self {
            healthy: false,
            latency_ms,
            checked_at: Utc::now(),
        }
    }
}

/// Role a region takes in routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Receives traffic.
    Primary,
    /// Standby target.
    Secondary,
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingMode::Primary => f.write_str("primary"),
            RoutingMode::Secondary => f.write_str("secondary"),
        }
    }
}

/// Region health check.
#[async_trait]
pub trait RegionProbe: Send + Sync {
    /// Probe one region.
    async fn probe(&self, region: &RegionId) -> Result<ProbeReport>;
}

/// Database tier failover.
#[async_trait]
pub trait DatabaseFailover: Send + Sync {
    /// Promote the replica in `region` to primary.
    async fn promote(&self, region: &RegionId) -> Result<()>;
    /// Restore `region` from `snapshot`.
    async fn restore_point_in_time(&self, region: &RegionId, snapshot: &str) -> Result<()>;
}

/// DNS or load-balancer routing.
#[async_trait]
pub trait TrafficRouter: Send + Sync {
    /// Point `domain` at `region` in the given role.
    async fn update_routing(&self, domain: &str, region: &RegionId, mode: RoutingMode) -> Result<()>;
}

/// Compute capacity.
#[async_trait]
pub trait CapacityScaler: Send + Sync {
    /// Set the desired capacity of `region`.
    async fn scale(&self, region: &RegionId, desired_capacity: u32) -> Result<()>;
}

/// Post-failover checks.
#[async_trait]
pub trait EndpointValidator: Send + Sync {
    /// Check `endpoint` served from `region`. `Ok(false)` is a failed check.
    async fn validate(&self, endpoint: &str, region: &RegionId) -> Result<bool>;
}

/// Every collaborator the orchestrator needs.
#[derive(Clone)]
pub struct Collaborators {
    /// Database failover.
    pub database: Arc<dyn DatabaseFailover>,
    /// Routing.
    pub router: Arc<dyn TrafficRouter>,
    /// Scaling.
    pub scaler: Arc<dyn CapacityScaler>,
    /// Validation.
    pub validator: Arc<dyn EndpointValidator>,
}

impl Collaborators {
    /// Log-only collaborators.
    pub fn dry_run() -> Self {
        Self {
            database: Arc::new(DryRunDatabase),
            router: Arc::new(DryRunRouter),
            scaler: Arc::new(DryRunScaler),
            validator: Arc::new(DryRunValidator),
        }
    }
}

/// Probes a per-region health URL; any 2xx answer is healthy.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    urls: BTreeMap<RegionId, String>,
}

impl HttpProbe {
    /// Create a probe for the given region URLs. `timeout` bounds each request.
    pub fn new(urls: BTreeMap<RegionId, String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DrError::Collaborator {
                name: "http_probe".to_string(),
                msg: e.to_string(),
            })?;
        Ok(Self { client, urls })
    }
}

#[async_trait]
impl RegionProbe for HttpProbe {
    async fn probe(&self, region: &RegionId) -> Result<ProbeReport> {
        let url = self.urls.get(region).ok_or_else(|| DrError::Config {
            msg: format!("no health check URL for region {region}"),
        })?;
        let started = Instant::now();
        let resp = self.client.get(url).send().await.map_err(|e| DrError::TransientProbe {
            region: region.to_string(),
            msg: e.to_string(),
        })?;
        let latency_ms = started.elapsed().as_millis() as u64;
        debug!(region = %region, status = %resp.status(), latency_ms, "health probe");
        Ok(ProbeReport {
            healthy: resp.status().is_success(),
            latency_ms,
            checked_at: Utc::now(),
        })
    }
}

/// GETs each validation endpoint; any 2xx answer passes.
#[derive(Debug, Clone)]
pub struct HttpEndpointValidator {
    client: reqwest::Client,
}

impl HttpEndpointValidator {
    /// Create a validator whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DrError::Collaborator {
                name: "http_validator".to_string(),
                msg: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl EndpointValidator for HttpEndpointValidator {
    async fn validate(&self, endpoint: &str, region: &RegionId) -> Result<bool> {
        let resp = self
            .client
            .get(endpoint)
            .send()
            .await
            .map_err(|e| DrError::Collaborator {
                name: "http_validator".to_string(),
                msg: format!("{endpoint}: {e}"),
            })?;
        debug!(endpoint, region = %region, status = %resp.status(), "validation check");
        Ok(resp.status().is_success())
    }
}

/// Reports every region healthy.
#[derive(Debug, Default, Clone)]
pub struct DryRunProbe;

#[async_trait]
impl RegionProbe for DryRunProbe {
    async fn probe(&self, region: &RegionId) -> Result<ProbeReport> {
        tracing::trace!(region = %region, "dry-run probe");
        Ok(ProbeReport::healthy(0))
    }
}

/// Logs database actions.
#[derive(Debug, Default, Clone)]
pub struct DryRunDatabase;

#[async_trait]
impl DatabaseFailover for DryRunDatabase {
    async fn promote(&self, region: &RegionId) -> Result<()> {
        info!(region = %region, "dry-run: promote replica");
        Ok(())
    }

    async fn restore_point_in_time(&self, region: &RegionId, snapshot: &str) -> Result<()> {
        info!(region = %region, snapshot, "dry-run: point-in-time restore");
        Ok(())
    }
}

/// Logs routing changes.
#[derive(Debug, Default, Clone)]
pub struct DryRunRouter;

#[async_trait]
impl TrafficRouter for DryRunRouter {
    async fn update_routing(&self, domain: &str, region: &RegionId, mode: RoutingMode) -> Result<()> {
        info!(domain, region = %region, %mode, "dry-run: update routing");
        Ok(())
    }
}

/// Logs scaling requests.
#[derive(Debug, Default, Clone)]
pub struct DryRunScaler;

#[async_trait]
impl CapacityScaler for DryRunScaler {
    async fn scale(&self, region: &RegionId, desired_capacity: u32) -> Result<()> {
        info!(region = %region, desired_capacity, "dry-run: scale service");
        Ok(())
    }
}

/// Passes every check.
#[derive(Debug, Default, Clone)]
pub struct DryRunValidator;

#[async_trait]
impl EndpointValidator for DryRunValidator {
    async fn validate(&self, endpoint: &str, region: &RegionId) -> Result<bool> {
        info!(endpoint, region = %region, "dry-run: validate endpoint");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dry_run_collaborators_succeed() {
        let c = Collaborators::dry_run();
        let region = RegionId::from("eu-west-1");
        c.database.promote(&region).await.unwrap();
        c.database.restore_point_in_time(&region, "latest").await.unwrap();
        c.router
            .update_routing("app.example.com", &region, RoutingMode::Primary)
            .await
            .unwrap();
        c.scaler.scale(&region, 4).await.unwrap();
        assert!(c.validator.validate("https://app/health", &region).await.unwrap());
        assert!(DryRunProbe.probe(&region).await.unwrap().healthy);
    }

    #[tokio::test]
    async fn test_http_probe_without_url_is_config_error() {
        let probe = HttpProbe::new(BTreeMap::new(), Duration::from_secs(1)).unwrap();
        let err = probe.probe(&RegionId::from("us-east-1")).await.unwrap_err();
        assert!(matches!(err, DrError::Config { .. }));
    }

    #[tokio::test]
    async fn test_http_validator_unreachable_endpoint_is_error() {
        let validator = HttpEndpointValidator::new(Duration::from_millis(200)).unwrap();
        let err = validator
            .validate("http://127.0.0.1:9/healthz", &RegionId::from("eu-west-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DrError::Collaborator { .. }));
    }

    #[test]
    fn test_routing_mode_display() {
        assert_eq!(RoutingMode::Primary.to_string(), "primary");
        assert_eq!(RoutingMode::Secondary.to_string(), "secondary");
    }
}
