//! Modification tracker.
//!
//! Appends one immutable record per write. Tracking must never fail the
//! originating write: every failure is absorbed, logged and counted.

use crate::error::Result;
use crate::store::{AuditStore, NewModification};
use crate::types::{ModificationRecord, Operation, RegionId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of a tracking attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackOutcome {
    /// The write was appended to the log.
    Recorded(ModificationRecord),
    /// Tracking is disabled for the table.
    Skipped,
    /// Tracking failed; the originating write is unaffected.
    Failed {
        /// Why tracking failed.
        reason: String,
    },
}

impl TrackOutcome {
    /// True when the write reached the log.
    pub fn is_recorded(&self) -> bool {
        matches!(self, TrackOutcome::Recorded(_))
    }
}

/// Tracker counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerStats {
    /// Writes appended.
    pub recorded: u64,
    /// Writes ignored because tracking was off.
    pub skipped: u64,
    /// Writes whose tracking failed.
    pub failed: u64,
}

/// Stable BLAKE3 hex digest of a payload.
///
/// The payload is first converted to a `serde_json::Value`, whose object maps
/// are key-sorted, so field order in the source type does not matter.
pub fn payload_digest<P: Serialize + ?Sized>(payload: &P) -> Result<String> {
    let value = serde_json::to_value(payload)?;
    let bytes = serde_json::to_vec(&value)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// Records writes into the modification log.
pub struct ModificationTracker {
    store: Arc<AuditStore>,
    default_actor: String,
    track_all_tables: bool,
    /// Explicit per-table toggles; absent tables follow `track_all_tables`.
    toggles: DashMap<String, bool>,
    recorded: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

impl ModificationTracker {
    /// Create a tracker writing into `store`.
    pub fn new(store: Arc<AuditStore>, default_actor: impl Into<String>, track_all_tables: bool) -> Self {
        Self {
            store,
            default_actor: default_actor.into(),
            track_all_tables,
            toggles: DashMap::new(),
            recorded: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Start tracking a table. Idempotent.
    pub fn enable_tracking(&self, table: &str) {
        if self.toggles.insert(table.to_string(), true) != Some(true) {
            debug!(table, "tracking enabled");
        }
    }

    /// Stop tracking a table. Idempotent.
    pub fn disable_tracking(&self, table: &str) {
        if self.toggles.insert(table.to_string(), false) != Some(false) {
            debug!(table, "tracking disabled");
        }
    }

    /// Whether writes to `table` are recorded.
    pub fn is_tracked(&self, table: &str) -> bool {
        self.toggles
            .get(table)
            .map(|t| *t)
            .unwrap_or(self.track_all_tables)
    }

    /// Record a write happening now, attributed to the default actor.
    pub fn record<P: Serialize + ?Sized>(
        &self,
        table: &str,
        record_id: &str,
        region: &RegionId,
        op: Operation,
        payload: &P,
    ) -> TrackOutcome {
        self.record_at(table, record_id, region, op, payload, Utc::now(), None)
    }

    /// Record a write happening now on behalf of `actor`.
    pub fn record_as<P: Serialize + ?Sized>(
        &self,
        table: &str,
        record_id: &str,
        region: &RegionId,
        op: Operation,
        payload: &P,
        actor: &str,
    ) -> TrackOutcome {
        self.record_at(table, record_id, region, op, payload, Utc::now(), Some(actor))
    }

    /// Record a write with an explicit write time and actor.
    #[allow(clippy::too_many_arguments)]
    pub fn record_at<P: Serialize + ?Sized>(
        &self,
        table: &str,
        record_id: &str,
        region: &RegionId,
        op: Operation,
        payload: &P,
        timestamp: DateTime<Utc>,
        actor: Option<&str>,
    ) -> TrackOutcome {
        if !self.is_tracked(table) {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            return TrackOutcome::Skipped;
        }

        let data_hash = match payload_digest(payload) {
            Ok(h) => h,
            Err(e) => return self.absorb(table, record_id, e.to_string()),
        };

        let appended = self.store.append_modification(NewModification {
            table: table.to_string(),
            record_id: record_id.to_string(),
            region: region.clone(),
            operation: op,
            timestamp,
            data_hash,
            actor: actor.unwrap_or(&self.default_actor).to_string(),
        });

        match appended {
            Ok(record) => {
                self.recorded.fetch_add(1, Ordering::Relaxed);
                debug!(table, record_id, region = %region, seq = record.seq, "modification recorded");
                TrackOutcome::Recorded(record)
            }
            Err(e) => self.absorb(table, record_id, e.to_string()),
        }
    }

    fn absorb(&self, table: &str, record_id: &str, reason: String) -> TrackOutcome {
        self.failed.fetch_add(1, Ordering::Relaxed);
        warn!(table, record_id, %reason, "modification tracking failed, write continues untracked");
        TrackOutcome::Failed { reason }
    }

    /// Current counters.
    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            recorded: self.recorded.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tracker(track_all: bool) -> (Arc<AuditStore>, ModificationTracker) {
        let store = Arc::new(AuditStore::new());
        let t = ModificationTracker::new(store.clone(), "system", track_all);
        (store, t)
    }

    #[test]
    fn test_digest_ignores_field_order() {
        #[derive(Serialize)]
        struct Ab {
            a: u32,
            b: u32,
        }
        #[derive(Serialize)]
        struct Ba {
            b: u32,
            a: u32,
        }
        let d1 = payload_digest(&Ab { a: 1, b: 2 }).unwrap();
        let d2 = payload_digest(&Ba { b: 2, a: 1 }).unwrap();
        assert_eq!(d1, d2);
        assert_eq!(d1.len(), 64);
        assert_ne!(d1, payload_digest(&json!({"a": 1, "b": 3})).unwrap());
    }

    #[test]
    fn test_record_appends() {
        let (store, t) = tracker(true);
        let region = RegionId::from("us-east-1");
        let out = t.record("users", "42", &region, Operation::Update, &json!({"name": "x"}));
        assert!(out.is_recorded());
        assert_eq!(store.modification_count(), 1);
        assert_eq!(t.stats().recorded, 1);
        let rec = &store.modifications_for("users", "42")[0];
        assert_eq!(rec.actor, "system");
    }

    #[test]
    fn test_actor_override() {
        let (store, t) = tracker(true);
        let region = RegionId::from("eu-west-1");
        t.record_as("users", "1", &region, Operation::Insert, &json!({}), "alice");
        t.record_at("users", "1", &region, Operation::Update, &json!({}), Utc::now(), Some("bob"));
        let actors: Vec<_> = store
            .modifications_for("users", "1")
            .into_iter()
            .map(|r| r.actor)
            .collect();
        assert_eq!(actors, vec!["alice", "bob"]);
    }

    #[test]
    fn test_toggles_are_idempotent() {
        let (store, t) = tracker(false);
        let region = RegionId::from("us-east-1");
        assert_eq!(
            t.record("orders", "1", &region, Operation::Insert, &json!({})),
            TrackOutcome::Skipped
        );
        t.enable_tracking("orders");
        t.enable_tracking("orders");
        assert!(t.is_tracked("orders"));
        assert!(t.record("orders", "1", &region, Operation::Insert, &json!({})).is_recorded());
        t.disable_tracking("orders");
        t.disable_tracking("orders");
        assert!(!t.is_tracked("orders"));
        assert_eq!(store.modification_count(), 1);
        assert_eq!(t.stats().skipped, 1);
    }

    #[test]
    fn test_store_failure_is_absorbed() {
        let (store, t) = tracker(true);
        store.set_read_only(true);
        let out = t.record("users", "1", &RegionId::from("us-east-1"), Operation::Delete, &json!(null));
        assert!(matches!(out, TrackOutcome::Failed { .. }));
        assert_eq!(t.stats().failed, 1);
        assert_eq!(store.modification_count(), 0);
    }
}
