//! Metrics/audit store.
//!
//! Holds every persisted surface: the modification log, resolution rules,
//! resolution outcomes, region health rows, failover leases and replica-lag
//! samples. Logs are append-only; the only deletions are the age-gated
//! `prune_*` calls used by the retention jobs.
//!
//! Tables live behind `std::sync::RwLock`s that are never held across an
//! `.await`. A snapshot of all tables can be written to and read from JSON.

use crate::error::{DrError, Result};
use crate::lease::FailoverState;
use crate::rules::{ResolutionRule, RuleSet};
use crate::types::{
    ConflictType, ModificationRecord, Operation, RegionHealthStatus, RegionId,
    ReplicaLagSample, ResolutionOutcome,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

type RecordKey = (String, String);

/// A modification waiting for a sequence number.
#[derive(Debug, Clone)]
pub struct NewModification {
    /// Table name.
    pub table: String,
    /// Record identifier.
    pub record_id: String,
    /// Writing region.
    pub region: RegionId,
    /// Kind of write.
    pub operation: Operation,
    /// Write time.
    pub timestamp: DateTime<Utc>,
    /// Payload digest.
    pub data_hash: String,
    /// Writing principal.
    pub actor: String,
}

/// A resolution outcome waiting for an identifier.
#[derive(Debug, Clone)]
pub struct NewOutcome {
    /// Table of the record.
    pub table: String,
    /// Record identifier.
    pub record_id: String,
    /// Winner marker.
    pub winning_region: String,
    /// Winning timestamp.
    pub winning_timestamp: DateTime<Utc>,
    /// Strategy used.
    pub strategy_used: String,
    /// Requested conflict type.
    pub conflict_type: ConflictType,
    /// Regions involved.
    pub regions_involved: Vec<RegionId>,
    /// Resolution time.
    pub resolved_at: DateTime<Utc>,
}

/// Serialized form of the whole store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// Modification log in append order.
    pub modifications: Vec<ModificationRecord>,
    /// Resolution rules.
    pub rules: Vec<ResolutionRule>,
    /// Resolution outcomes in append order.
    pub outcomes: Vec<ResolutionOutcome>,
    /// Region health rows.
    pub health: Vec<RegionHealthStatus>,
    /// Failover records, active and finished.
    pub failovers: Vec<FailoverState>,
    /// Replica-lag samples in append order.
    pub lag_samples: Vec<ReplicaLagSample>,
}

/// Row counts per table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreCounts {
    /// Modification records.
    pub modifications: usize,
    /// Resolution outcomes.
    pub outcomes: usize,
    /// Health rows.
    pub health_rows: usize,
    /// Failover records.
    pub failovers: usize,
    /// Lag samples.
    pub lag_samples: usize,
}

#[derive(Debug, Default)]
struct ModificationLog {
    by_record: BTreeMap<RecordKey, Vec<ModificationRecord>>,
    next_seq: u64,
    len: usize,
}

#[derive(Debug, Default)]
struct OutcomeLog {
    entries: Vec<ResolutionOutcome>,
    next_id: u64,
}

/// In-process audit store shared by every component.
#[derive(Debug, Default)]
pub struct AuditStore {
    modifications: RwLock<ModificationLog>,
    rules: RwLock<RuleSet>,
    outcomes: RwLock<OutcomeLog>,
    health: RwLock<HashMap<RegionId, RegionHealthStatus>>,
    failovers: RwLock<Vec<FailoverState>>,
    lag_samples: RwLock<Vec<ReplicaLagSample>>,
    read_only: AtomicBool,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl AuditStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with the given rules.
    pub fn with_rules(rules: RuleSet) -> Self {
        let store = Self::default();
        *write(&store.rules) = rules;
        store
    }

    /// Freeze or unfreeze appends. While frozen, every append fails.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
        info!(read_only, "audit store write mode changed");
    }

    /// Whether appends are currently rejected.
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    fn check_writable(&self, table: &str) -> Result<()> {
        if self.is_read_only() {
            return Err(DrError::Store {
                msg: format!("store is read-only, cannot append to {table}"),
            });
        }
        Ok(())
    }

    // ---- modification log ----

    /// Append a modification record and return it with its sequence number.
    pub fn append_modification(&self, m: NewModification) -> Result<ModificationRecord> {
        self.check_writable("modifications")?;
        let mut log = write(&self.modifications);
        log.next_seq += 1;
        let record = ModificationRecord {
            seq: log.next_seq,
            table: m.table,
            record_id: m.record_id,
            region: m.region,
            operation: m.operation,
            timestamp: m.timestamp,
            data_hash: m.data_hash,
            actor: m.actor,
        };
        log.by_record
            .entry((record.table.clone(), record.record_id.clone()))
            .or_default()
            .push(record.clone());
        log.len += 1;
        Ok(record)
    }

    /// All modifications of one record, ordered by timestamp then sequence.
    pub fn modifications_for(&self, table: &str, record_id: &str) -> Vec<ModificationRecord> {
        let log = read(&self.modifications);
        let mut records = log
            .by_record
            .get(&(table.to_string(), record_id.to_string()))
            .cloned()
            .unwrap_or_default();
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.seq.cmp(&b.seq)));
        records
    }

    /// Every `(table, record_id)` present in the log.
    pub fn record_keys(&self) -> Vec<(String, String)> {
        read(&self.modifications).by_record.keys().cloned().collect()
    }

    /// Number of modification records held.
    pub fn modification_count(&self) -> usize {
        read(&self.modifications).len
    }

    /// Remove modification records older than `cutoff`. Returns the number removed.
    pub fn prune_modifications_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut log = write(&self.modifications);
        let before = log.len;
        log.by_record.retain(|_, records| {
            records.retain(|r| r.timestamp >= cutoff);
            !records.is_empty()
        });
        let remaining: usize = log.by_record.values().map(Vec::len).sum();
        log.len = remaining;
        let removed = before - remaining;
        if removed > 0 {
            debug!(removed, %cutoff, "pruned modification records");
        }
        removed
    }

    // ---- rules ----

    /// Copy of the current rule set.
    pub fn rules(&self) -> RuleSet {
        read(&self.rules).clone()
    }

    /// Best active rule for a table and conflict type.
    pub fn select_rule(&self, table: &str, conflict_type: ConflictType) -> Option<ResolutionRule> {
        read(&self.rules).select(table, conflict_type).cloned()
    }

    /// Insert or replace a rule.
    pub fn upsert_rule(&self, rule: ResolutionRule) {
        write(&self.rules).upsert(rule);
    }

    /// Deactivate matching rules. Returns how many changed.
    pub fn deactivate_rule(&self, scope: &str, conflict_type: ConflictType, strategy_id: &str) -> usize {
        write(&self.rules).deactivate(scope, conflict_type, strategy_id)
    }

    // ---- outcomes ----

    /// Append a resolution outcome.
    pub fn append_outcome(&self, o: NewOutcome) -> Result<ResolutionOutcome> {
        self.check_writable("outcomes")?;
        let mut log = write(&self.outcomes);
        log.next_id += 1;
        let outcome = ResolutionOutcome {
            outcome_id: log.next_id,
            table: o.table,
            record_id: o.record_id,
            winning_region: o.winning_region,
            winning_timestamp: o.winning_timestamp,
            strategy_used: o.strategy_used,
            conflict_type: o.conflict_type,
            regions_involved: o.regions_involved,
            resolved_at: o.resolved_at,
        };
        log.entries.push(outcome.clone());
        Ok(outcome)
    }

    /// Outcomes recorded for one record, oldest first.
    pub fn outcomes_for(&self, table: &str, record_id: &str) -> Vec<ResolutionOutcome> {
        read(&self.outcomes)
            .entries
            .iter()
            .filter(|o| o.table == table && o.record_id == record_id)
            .cloned()
            .collect()
    }

    /// All outcomes, oldest first.
    pub fn all_outcomes(&self) -> Vec<ResolutionOutcome> {
        read(&self.outcomes).entries.clone()
    }

    /// Number of outcomes held.
    pub fn outcome_count(&self) -> usize {
        read(&self.outcomes).entries.len()
    }

    /// Remove outcomes resolved before `cutoff`.
    pub fn prune_outcomes_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut log = write(&self.outcomes);
        let before = log.entries.len();
        log.entries.retain(|o| o.resolved_at >= cutoff);
        before - log.entries.len()
    }

    // ---- health ----

    /// Overwrite the health row of a region.
    pub fn put_health(&self, status: RegionHealthStatus) {
        write(&self.health).insert(status.region.clone(), status);
    }

    /// Health row of a region.
    pub fn health(&self, region: &RegionId) -> Option<RegionHealthStatus> {
        read(&self.health).get(region).cloned()
    }

    /// All health rows sorted by region.
    pub fn all_health(&self) -> Vec<RegionHealthStatus> {
        let mut rows: Vec<_> = read(&self.health).values().cloned().collect();
        rows.sort_by(|a, b| a.region.cmp(&b.region));
        rows
    }

    // ---- failover leases ----

    /// Insert `state` as a new held lease unless `max_active` leases are
    /// already held for its environment.
    pub fn try_acquire_failover(&self, state: FailoverState, max_active: u32) -> Result<FailoverState> {
        self.check_writable("failovers")?;
        let mut failovers = write(&self.failovers);
        let held: Vec<&FailoverState> = failovers
            .iter()
            .filter(|f| f.environment == state.environment && f.lease_held)
            .collect();
        if held.len() >= max_active as usize {
            let held_since = held
                .iter()
                .map(|f| f.started_at)
                .min()
                .map(|t| t.to_rfc3339())
                .unwrap_or_default();
            return Err(DrError::FailoverInProgress {
                environment: state.environment,
                held_since,
            });
        }
        failovers.push(state.clone());
        Ok(state)
    }

    /// Apply `update` to the failover record owning `token`, provided its
    /// version still equals `expected_version`. Bumps the version.
    pub fn update_failover<F>(
        &self,
        environment: &str,
        token: uuid::Uuid,
        expected_version: u64,
        update: F,
    ) -> Result<FailoverState>
    where
        F: FnOnce(&mut FailoverState),
    {
        let mut failovers = write(&self.failovers);
        let state = failovers
            .iter_mut()
            .find(|f| f.environment == environment && f.lease_token == token)
            .ok_or_else(|| DrError::LeaseConflict {
                environment: environment.to_string(),
                msg: format!("no failover record for token {token}"),
            })?;
        if state.version != expected_version {
            return Err(DrError::LeaseConflict {
                environment: environment.to_string(),
                msg: format!(
                    "stale version {expected_version}, current {}",
                    state.version
                ),
            });
        }
        update(state);
        state.version += 1;
        Ok(state.clone())
    }

    /// Records currently holding the lease for an environment.
    pub fn active_failovers(&self, environment: &str) -> Vec<FailoverState> {
        read(&self.failovers)
            .iter()
            .filter(|f| f.environment == environment && f.lease_held)
            .cloned()
            .collect()
    }

    /// Every failover record for an environment, oldest first.
    pub fn failover_history(&self, environment: &str) -> Vec<FailoverState> {
        read(&self.failovers)
            .iter()
            .filter(|f| f.environment == environment)
            .cloned()
            .collect()
    }

    // ---- replica lag ----

    /// Append a replica-lag sample.
    pub fn append_lag_sample(&self, sample: ReplicaLagSample) -> Result<()> {
        self.check_writable("lag_samples")?;
        write(&self.lag_samples).push(sample);
        Ok(())
    }

    /// Samples for one region, oldest first.
    pub fn lag_samples_for(&self, region: &RegionId) -> Vec<ReplicaLagSample> {
        read(&self.lag_samples)
            .iter()
            .filter(|s| &s.region == region)
            .cloned()
            .collect()
    }

    /// Most recent sample per region.
    pub fn latest_lag(&self) -> Vec<ReplicaLagSample> {
        let samples = read(&self.lag_samples);
        let mut latest: BTreeMap<RegionId, ReplicaLagSample> = BTreeMap::new();
        for s in samples.iter() {
            match latest.get(&s.region) {
                Some(existing) if existing.captured_at > s.captured_at => {}
                _ => {
                    latest.insert(s.region.clone(), s.clone());
                }
            }
        }
        latest.into_values().collect()
    }

    /// Remove lag samples captured before `cutoff`.
    pub fn prune_lag_samples_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut samples = write(&self.lag_samples);
        let before = samples.len();
        samples.retain(|s| s.captured_at >= cutoff);
        before - samples.len()
    }

    // ---- snapshots ----

    /// Row counts of every table.
    pub fn counts(&self) -> StoreCounts {
        StoreCounts {
            modifications: self.modification_count(),
            outcomes: self.outcome_count(),
            health_rows: read(&self.health).len(),
            failovers: read(&self.failovers).len(),
            lag_samples: read(&self.lag_samples).len(),
        }
    }

    /// Copy every table into a snapshot.
    pub fn snapshot(&self) -> StoreSnapshot {
        let modifications = {
            let log = read(&self.modifications);
            let mut all: Vec<_> = log.by_record.values().flatten().cloned().collect();
            all.sort_by_key(|m| m.seq);
            all
        };
        StoreSnapshot {
            modifications,
            rules: read(&self.rules).rules().to_vec(),
            outcomes: self.all_outcomes(),
            health: self.all_health(),
            failovers: read(&self.failovers).clone(),
            lag_samples: read(&self.lag_samples).clone(),
        }
    }

    /// Rebuild a store from a snapshot, preserving sequence numbers.
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let store = Self::with_rules(RuleSet::from_rules(snapshot.rules));
        {
            let mut log = write(&store.modifications);
            for m in snapshot.modifications {
                log.next_seq = log.next_seq.max(m.seq);
                log.len += 1;
                log.by_record
                    .entry((m.table.clone(), m.record_id.clone()))
                    .or_default()
                    .push(m);
            }
        }
        {
            let mut log = write(&store.outcomes);
            log.next_id = snapshot.outcomes.iter().map(|o| o.outcome_id).max().unwrap_or(0);
            log.entries = snapshot.outcomes;
        }
        {
            let mut health = write(&store.health);
            for row in snapshot.health {
                health.insert(row.region.clone(), row);
            }
        }
        *write(&store.failovers) = snapshot.failovers;
        *write(&store.lag_samples) = snapshot.lag_samples;
        store
    }

    /// Write a JSON snapshot to `path`.
    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        std::fs::write(path, json)?;
        info!(path = %path.display(), "store snapshot saved");
        Ok(())
    }

    /// Load a store from a JSON snapshot at `path`.
    pub fn load_snapshot(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let snapshot: StoreSnapshot = serde_json::from_str(&contents)?;
        Ok(Self::from_snapshot(snapshot))
    }
}
