//! Conflict detection over the modification log.
//!
//! A conflict exists when two or more distinct regions modified the same
//! `(table, record_id)` inside a window. The window is anchored at the
//! record's newest modification. Detection only reads the store.

use crate::store::AuditStore;
use crate::types::{ModificationRecord, Operation, RegionId};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Result of a detection query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictReport {
    /// Table queried.
    pub table: String,
    /// Record queried.
    pub record_id: String,
    /// Distinct regions in the window, sorted. Empty when there is no conflict.
    pub regions: Vec<RegionId>,
    /// Operations in record order.
    pub operations: Vec<Operation>,
    /// Timestamps in record order.
    pub timestamps: Vec<DateTime<Utc>>,
    /// Records forming the conflict.
    pub records: Vec<ModificationRecord>,
}

impl ConflictReport {
    fn empty(table: &str, record_id: &str) -> Self {
        Self {
            table: table.to_string(),
            record_id: record_id.to_string(),
            ..Default::default()
        }
    }

    /// True when at least two regions are involved.
    pub fn is_conflict(&self) -> bool {
        self.regions.len() >= 2
    }
}

/// Records of one `(table, record_id)` whose timestamp lies within `window`
/// of the newest one, ordered by timestamp then sequence. A window reaching
/// past the representable range covers every record.
pub fn windowed_records(
    store: &AuditStore,
    table: &str,
    record_id: &str,
    window: Duration,
) -> Vec<ModificationRecord> {
    let records = store.modifications_for(table, record_id);
    let Some(newest) = records.iter().map(|r| r.timestamp).max() else {
        return Vec::new();
    };
    match newest.checked_sub_signed(window) {
        Some(floor) => records.into_iter().filter(|r| r.timestamp >= floor).collect(),
        None => records,
    }
}

/// Read-only conflict detector.
#[derive(Clone)]
pub struct ConflictDetector {
    store: Arc<AuditStore>,
}

impl ConflictDetector {
    /// Create a detector reading from `store`.
    pub fn new(store: Arc<AuditStore>) -> Self {
        Self { store }
    }

    /// Report the regions, operations and timestamps touching one record
    /// inside `window`. Fewer than two regions yields an empty report.
    pub fn detect_conflicts(&self, table: &str, record_id: &str, window: Duration) -> ConflictReport {
        let records = windowed_records(&self.store, table, record_id, window);
        let regions: BTreeSet<RegionId> = records.iter().map(|r| r.region.clone()).collect();

        if regions.len() < 2 {
            debug!(table, record_id, regions = regions.len(), "no conflict");
            return ConflictReport::empty(table, record_id);
        }

        ConflictReport {
            table: table.to_string(),
            record_id: record_id.to_string(),
            regions: regions.into_iter().collect(),
            operations: records.iter().map(|r| r.operation).collect(),
            timestamps: records.iter().map(|r| r.timestamp).collect(),
            records,
        }
    }

    /// Sweep every record in the log and return all conflicts.
    pub fn scan(&self, window: Duration) -> Vec<ConflictReport> {
        self.store
            .record_keys()
            .into_iter()
            .map(|(table, record_id)| self.detect_conflicts(&table, &record_id, window))
            .filter(ConflictReport::is_conflict)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewModification;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn add(store: &AuditStore, table: &str, record: &str, region: &str, op: Operation, t: i64) {
        store
            .append_modification(NewModification {
                table: table.to_string(),
                record_id: record.to_string(),
                region: RegionId::from(region),
                operation: op,
                timestamp: ts(t),
                data_hash: String::new(),
                actor: "test".to_string(),
            })
            .unwrap();
    }

    #[test]
    fn test_two_regions_conflict() {
        let store = Arc::new(AuditStore::new());
        add(&store, "users", "42", "us-east-1", Operation::Update, 100);
        add(&store, "users", "42", "eu-west-1", Operation::Update, 105);
        let report = ConflictDetector::new(store).detect_conflicts("users", "42", Duration::minutes(5));
        assert!(report.is_conflict());
        assert_eq!(
            report.regions,
            vec![RegionId::from("eu-west-1"), RegionId::from("us-east-1")]
        );
        assert_eq!(report.operations, vec![Operation::Update, Operation::Update]);
        assert_eq!(report.timestamps, vec![ts(100), ts(105)]);
    }

    #[test]
    fn test_single_region_is_not_a_conflict() {
        let store = Arc::new(AuditStore::new());
        add(&store, "users", "1", "us-east-1", Operation::Insert, 1);
        add(&store, "users", "1", "us-east-1", Operation::Update, 2);
        let report = ConflictDetector::new(store).detect_conflicts("users", "1", Duration::minutes(5));
        assert!(!report.is_conflict());
        assert!(report.regions.is_empty());
        assert!(report.records.is_empty());
    }

    #[test]
    fn test_unknown_record_is_empty() {
        let store = Arc::new(AuditStore::new());
        let report = ConflictDetector::new(store).detect_conflicts("users", "nope", Duration::minutes(5));
        assert!(!report.is_conflict());
    }

    #[test]
    fn test_writes_outside_window_ignored() {
        let store = Arc::new(AuditStore::new());
        add(&store, "users", "7", "us-east-1", Operation::Update, 0);
        add(&store, "users", "7", "eu-west-1", Operation::Update, 1000);
        let detector = ConflictDetector::new(store);
        assert!(!detector.detect_conflicts("users", "7", Duration::seconds(300)).is_conflict());
        assert!(detector.detect_conflicts("users", "7", Duration::seconds(1000)).is_conflict());
    }

    #[test]
    fn test_window_past_time_range_covers_everything() {
        let store = Arc::new(AuditStore::new());
        add(&store, "users", "8", "us-east-1", Operation::Update, 0);
        add(&store, "users", "8", "eu-west-1", Operation::Update, 1000);
        let huge = Duration::try_days(i32::MAX as i64).unwrap();
        let report = ConflictDetector::new(store).detect_conflicts("users", "8", huge);
        assert!(report.is_conflict());
        assert_eq!(report.records.len(), 2);
    }

    #[test]
    fn test_scan_finds_only_conflicting_records() {
        let store = Arc::new(AuditStore::new());
        add(&store, "users", "1", "us-east-1", Operation::Update, 10);
        add(&store, "users", "1", "eu-west-1", Operation::Update, 12);
        add(&store, "users", "2", "us-east-1", Operation::Update, 10);
        add(&store, "orders", "9", "ap-southeast-1", Operation::Delete, 10);
        add(&store, "orders", "9", "us-east-1", Operation::Update, 11);
        let found = ConflictDetector::new(store).scan(Duration::minutes(5));
        let keys: Vec<_> = found.iter().map(|r| (r.table.as_str(), r.record_id.as_str())).collect();
        assert_eq!(keys, vec![("orders", "9"), ("users", "1")]);
    }
}
