//! Shared data model: regions, modification records, resolution outcomes,
//! health rows and replica-lag samples.
//!
//! All timestamps are UTC.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Region identifier wrapper type (e.g. `us-east-1`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionId(pub String);

impl RegionId {
    /// Create a region id from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RegionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of write recorded by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Row inserted.
    Insert,
    /// Row updated.
    Update,
    /// Row deleted.
    Delete,
}

/// An immutable record of one write to one record in one region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModificationRecord {
    /// Store-assigned append sequence, strictly increasing.
    pub seq: u64,
    /// Table name.
    pub table: String,
    /// Logical record identifier within the table.
    pub record_id: String,
    /// Region that performed the write.
    pub region: RegionId,
    /// Kind of write.
    pub operation: Operation,
    /// When the write happened.
    pub timestamp: DateTime<Utc>,
    /// BLAKE3 hex digest of the canonical payload.
    pub data_hash: String,
    /// Principal that performed the write.
    pub actor: String,
}

/// Kind of conflict a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Resolve by write time.
    Timestamp,
    /// Resolve by configured region ranking.
    RegionPriority,
    /// Requires an operator.
    Manual,
    /// Keep every version.
    PreserveAll,
}

impl ConflictType {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::Timestamp => "timestamp",
            ConflictType::RegionPriority => "region_priority",
            ConflictType::Manual => "manual",
            ConflictType::PreserveAll => "preserve_all",
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConflictType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timestamp" => Ok(ConflictType::Timestamp),
            "region_priority" => Ok(ConflictType::RegionPriority),
            "manual" => Ok(ConflictType::Manual),
            "preserve_all" => Ok(ConflictType::PreserveAll),
            other => Err(format!("unknown conflict type: {other}")),
        }
    }
}

/// Winning-region marker for `preserve_all`.
pub const WINNER_MULTIPLE: &str = "multiple";
/// Winning-region marker for `manual_review`.
pub const WINNER_MANUAL: &str = "manual";

/// Append-only audit entry written once per `resolve()` invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionOutcome {
    /// Store-assigned identifier.
    pub outcome_id: u64,
    /// Table of the record.
    pub table: String,
    /// Record identifier.
    pub record_id: String,
    /// Winning region, or `"multiple"` / `"manual"` when no single winner.
    pub winning_region: String,
    /// Timestamp of the winning write (newest write when no single winner).
    pub winning_timestamp: DateTime<Utc>,
    /// Strategy that produced the outcome.
    pub strategy_used: String,
    /// Conflict type requested by the caller.
    pub conflict_type: ConflictType,
    /// Distinct regions that touched the record inside the window.
    pub regions_involved: Vec<RegionId>,
    /// When the outcome was written.
    pub resolved_at: DateTime<Utc>,
}

/// Health row for one region, overwritten each probe cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionHealthStatus {
    /// Region identifier.
    pub region: RegionId,
    /// Current health verdict.
    pub healthy: bool,
    /// Time of the last completed probe cycle.
    pub last_check: DateTime<Utc>,
    /// Consecutive failed probe cycles.
    pub consecutive_failures: u32,
    /// Latency of the last successful probe.
    pub last_latency_ms: Option<u64>,
}

impl RegionHealthStatus {
    /// A fresh, healthy row.
    pub fn new(region: RegionId, now: DateTime<Utc>) -> Self {
        Self {
            region,
            healthy: true,
            last_check: now,
            consecutive_failures: 0,
            last_latency_ms: None,
        }
    }
}

/// A replica-lag measurement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaLagSample {
    /// Replica region.
    pub region: RegionId,
    /// Measured lag in milliseconds.
    pub lag_ms: u64,
    /// When the sample was taken.
    pub captured_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_id_ordering_is_lexical() {
        let mut regions = vec![
            RegionId::from("us-east-1"),
            RegionId::from("ap-southeast-1"),
            RegionId::from("eu-west-1"),
        ];
        regions.sort();
        assert_eq!(regions[0].as_str(), "ap-southeast-1");
        assert_eq!(regions[2].as_str(), "us-east-1");
    }

    #[test]
    fn test_conflict_type_parse() {
        assert_eq!(
            "region_priority".parse::<ConflictType>(),
            Ok(ConflictType::RegionPriority)
        );
        assert!("bogus".parse::<ConflictType>().is_err());
    }

    #[test]
    fn test_region_id_serializes_as_plain_string() {
        let json = serde_json::to_string(&RegionId::from("eu-west-1")).unwrap();
        assert_eq!(json, "\"eu-west-1\"");
    }

    #[test]
    fn test_operation_snake_case() {
        let json = serde_json::to_string(&Operation::Update).unwrap();
        assert_eq!(json, "\"update\"");
    }
}
