//! Conflict resolution.
//!
//! Selects a rule for the requested conflict type, runs the rule's strategy
//! over the record's windowed modifications and appends exactly one
//! [`ResolutionOutcome`] per call.
//!
//! Strategies are looked up by id in a registry:
//! - `latest_timestamp_wins`: newest write wins. Equal timestamps go to the
//!   lexically smallest region id; equal `(timestamp, region)` go to the
//!   highest sequence number.
//! - `region_priority`: the best-ranked region that wrote wins, with that
//!   region's newest write. Unranked regions sort after ranked ones.
//! - `preserve_all`: no winner, every version kept (`"multiple"`).
//! - `manual_review`: no winner, operator notified (`"manual"`).
//!
//! Calls for the same record are serialized on a per-record lock; different
//! records resolve in parallel.

use crate::detector::windowed_records;
use crate::error::{DrError, Result};
use crate::notify::{deliver, NotificationContext, Notifier, Severity};
use crate::rules::{ResolutionRule, DEFAULT_STRATEGY};
use crate::store::{AuditStore, NewOutcome};
use crate::types::{
    ConflictType, ModificationRecord, RegionId, ResolutionOutcome, WINNER_MANUAL, WINNER_MULTIPLE,
};
use chrono::{Duration, Utc};
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Inputs a strategy may consult besides the records.
#[derive(Debug, Clone, Copy)]
pub struct StrategyContext<'a> {
    /// Region ranking, highest first.
    pub region_priority: &'a [RegionId],
}

/// What a strategy decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// A single winning write.
    Winner(ModificationRecord),
    /// Keep every version.
    Multiple,
    /// Leave it to an operator.
    Manual,
}

/// A pluggable resolution strategy.
pub trait ResolutionStrategy: Send + Sync {
    /// Registry key.
    fn id(&self) -> &str;

    /// Decide over a non-empty set of records.
    fn decide(&self, records: &[ModificationRecord], ctx: &StrategyContext<'_>) -> Verdict;
}

/// Newest timestamp wins.
#[derive(Debug, Default)]
pub struct LatestTimestampWins;

impl ResolutionStrategy for LatestTimestampWins {
    fn id(&self) -> &str {
        DEFAULT_STRATEGY
    }

    fn decide(&self, records: &[ModificationRecord], _ctx: &StrategyContext<'_>) -> Verdict {
        records
            .iter()
            .min_by(|a, b| {
                b.timestamp
                    .cmp(&a.timestamp)
                    .then_with(|| a.region.cmp(&b.region))
                    .then_with(|| b.seq.cmp(&a.seq))
            })
            .cloned()
            .map_or(Verdict::Multiple, Verdict::Winner)
    }
}

/// Highest-ranked region wins.
#[derive(Debug, Default)]
pub struct RegionPriorityWins;

impl RegionPriorityWins {
    fn rank(region: &RegionId, priority: &[RegionId]) -> usize {
        priority
            .iter()
            .position(|r| r == region)
            .unwrap_or(priority.len())
    }
}

impl ResolutionStrategy for RegionPriorityWins {
    fn id(&self) -> &str {
        "region_priority"
    }

    fn decide(&self, records: &[ModificationRecord], ctx: &StrategyContext<'_>) -> Verdict {
        let Some(best_region) = records
            .iter()
            .map(|r| &r.region)
            .min_by(|a, b| {
                Self::rank(a, ctx.region_priority)
                    .cmp(&Self::rank(b, ctx.region_priority))
                    .then_with(|| a.cmp(b))
            })
        else {
            return Verdict::Multiple;
        };

        records
            .iter()
            .filter(|r| &r.region == best_region)
            .max_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.seq.cmp(&b.seq)))
            .cloned()
            .map_or(Verdict::Multiple, Verdict::Winner)
    }
}

/// Keep all versions.
#[derive(Debug, Default)]
pub struct PreserveAll;

impl ResolutionStrategy for PreserveAll {
    fn id(&self) -> &str {
        "preserve_all"
    }

    fn decide(&self, _records: &[ModificationRecord], _ctx: &StrategyContext<'_>) -> Verdict {
        Verdict::Multiple
    }
}

/// Escalate to an operator.
#[derive(Debug, Default)]
pub struct ManualReview;

impl ResolutionStrategy for ManualReview {
    fn id(&self) -> &str {
        "manual_review"
    }

    fn decide(&self, _records: &[ModificationRecord], _ctx: &StrategyContext<'_>) -> Verdict {
        Verdict::Manual
    }
}

/// Result of one `resolve()` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// The outcome (with `outcome_id == 0` when not persisted).
    pub outcome: ResolutionOutcome,
    /// Rule that was applied, `None` when the default was used.
    pub rule: Option<ResolutionRule>,
    /// Whether the outcome reached the audit log.
    pub persisted: bool,
}

/// Resolver counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverStats {
    /// Completed resolutions.
    pub resolutions: u64,
    /// Resolutions that fell back to the default strategy.
    pub default_fallbacks: u64,
    /// Outcome writes that needed a retry.
    pub write_retries: u64,
    /// Outcomes that could not be persisted.
    pub unpersisted: u64,
}

type RecordKey = (String, String);

/// Applies rules and strategies and writes the audit outcome.
pub struct ConflictResolver {
    store: Arc<AuditStore>,
    strategies: HashMap<String, Arc<dyn ResolutionStrategy>>,
    region_priority: Vec<RegionId>,
    window: Duration,
    notifier: Option<(Arc<dyn Notifier>, String, std::time::Duration)>,
    record_locks: DashMap<RecordKey, Arc<tokio::sync::Mutex<()>>>,
    resolutions: AtomicU64,
    default_fallbacks: AtomicU64,
    write_retries: AtomicU64,
    unpersisted: AtomicU64,
}

impl ConflictResolver {
    /// Create a resolver with the built-in strategies registered.
    pub fn new(store: Arc<AuditStore>, region_priority: Vec<RegionId>, window: Duration) -> Self {
        let mut resolver = Self {
            store,
            strategies: HashMap::new(),
            region_priority,
            window,
            notifier: None,
            record_locks: DashMap::new(),
            resolutions: AtomicU64::new(0),
            default_fallbacks: AtomicU64::new(0),
            write_retries: AtomicU64::new(0),
            unpersisted: AtomicU64::new(0),
        };
        resolver.register(Arc::new(LatestTimestampWins));
        resolver.register(Arc::new(RegionPriorityWins));
        resolver.register(Arc::new(PreserveAll));
        resolver.register(Arc::new(ManualReview));
        resolver
    }

    /// Notify `channel` through `notifier` when a record needs manual review.
    /// Each delivery is abandoned after `limit`.
    pub fn with_notifier(
        mut self,
        notifier: Arc<dyn Notifier>,
        channel: impl Into<String>,
        limit: std::time::Duration,
    ) -> Self {
        self.notifier = Some((notifier, channel.into(), limit));
        self
    }

    /// Register or replace a strategy.
    pub fn register(&mut self, strategy: Arc<dyn ResolutionStrategy>) {
        self.strategies.insert(strategy.id().to_string(), strategy);
    }

    /// Registered strategy ids, sorted.
    pub fn strategy_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.strategies.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Resolve one record and append exactly one outcome.
    pub async fn resolve(
        &self,
        table: &str,
        record_id: &str,
        conflict_type: ConflictType,
    ) -> Result<Resolution> {
        let key = (table.to_string(), record_id.to_string());
        let lock = self
            .record_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().await;
            self.resolve_locked(table, record_id, conflict_type)
        };

        drop(lock);
        self.record_locks.remove_if(&key, |_, l| Arc::strong_count(l) == 1);

        if let Ok(resolution) = &result {
            if resolution.outcome.winning_region == WINNER_MANUAL {
                self.escalate(&resolution.outcome).await;
            }
        }
        result
    }

    fn resolve_locked(
        &self,
        table: &str,
        record_id: &str,
        conflict_type: ConflictType,
    ) -> Result<Resolution> {
        let records = windowed_records(&self.store, table, record_id, self.window);
        if records.is_empty() {
            return Err(DrError::RecordNotFound {
                table: table.to_string(),
                record_id: record_id.to_string(),
            });
        }

        let rule = self.store.select_rule(table, conflict_type);
        let strategy = self.strategy_for(table, conflict_type, rule.as_ref());
        let ctx = StrategyContext {
            region_priority: &self.region_priority,
        };
        let verdict = strategy.decide(&records, &ctx);

        let regions_involved: Vec<RegionId> = records
            .iter()
            .map(|r| r.region.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let newest = records
            .iter()
            .map(|r| r.timestamp)
            .max()
            .unwrap_or_else(Utc::now);

        let (winning_region, winning_timestamp) = match &verdict {
            Verdict::Winner(r) => (r.region.to_string(), r.timestamp),
            Verdict::Multiple => (WINNER_MULTIPLE.to_string(), newest),
            Verdict::Manual => (WINNER_MANUAL.to_string(), newest),
        };

        let pending = NewOutcome {
            table: table.to_string(),
            record_id: record_id.to_string(),
            winning_region,
            winning_timestamp,
            strategy_used: strategy.id().to_string(),
            conflict_type,
            regions_involved,
            resolved_at: Utc::now(),
        };

        let (outcome, persisted) = self.write_outcome(pending);
        self.resolutions.fetch_add(1, Ordering::Relaxed);
        info!(
            table,
            record_id,
            winner = %outcome.winning_region,
            strategy = %outcome.strategy_used,
            records = records.len(),
            "conflict resolved"
        );

        Ok(Resolution {
            outcome,
            rule,
            persisted,
        })
    }

    fn strategy_for(
        &self,
        table: &str,
        conflict_type: ConflictType,
        rule: Option<&ResolutionRule>,
    ) -> Arc<dyn ResolutionStrategy> {
        let default = || -> Arc<dyn ResolutionStrategy> {
            self.strategies
                .get(DEFAULT_STRATEGY)
                .cloned()
                .unwrap_or_else(|| Arc::new(LatestTimestampWins))
        };

        let Some(rule) = rule else {
            self.default_fallbacks.fetch_add(1, Ordering::Relaxed);
            let err = DrError::ResolutionRuleNotFound {
                table: table.to_string(),
                conflict_type: conflict_type.to_string(),
            };
            debug!(error = %err, "falling back to {}", DEFAULT_STRATEGY);
            return default();
        };

        match self.strategies.get(&rule.strategy_id) {
            Some(s) => s.clone(),
            None => {
                self.default_fallbacks.fetch_add(1, Ordering::Relaxed);
                warn!(
                    table,
                    strategy = %rule.strategy_id,
                    "rule names an unregistered strategy, using {}",
                    DEFAULT_STRATEGY
                );
                default()
            }
        }
    }

    /// Append with one retry; on a second failure log and keep the outcome
    /// unpersisted.
    fn write_outcome(&self, pending: NewOutcome) -> (ResolutionOutcome, bool) {
        match self.store.append_outcome(pending.clone()) {
            Ok(o) => return (o, true),
            Err(first) => {
                self.write_retries.fetch_add(1, Ordering::Relaxed);
                let race = DrError::ConflictWriteRace {
                    table: pending.table.clone(),
                    record_id: pending.record_id.clone(),
                    msg: first.to_string(),
                };
                debug!(error = %race, "retrying outcome write");
            }
        }
        match self.store.append_outcome(pending.clone()) {
            Ok(o) => (o, true),
            Err(e) => {
                self.unpersisted.fetch_add(1, Ordering::Relaxed);
                warn!(
                    table = %pending.table,
                    record_id = %pending.record_id,
                    error = %e,
                    "resolution outcome not persisted after retry"
                );
                (
                    ResolutionOutcome {
                        outcome_id: 0,
                        table: pending.table,
                        record_id: pending.record_id,
                        winning_region: pending.winning_region,
                        winning_timestamp: pending.winning_timestamp,
                        strategy_used: pending.strategy_used,
                        conflict_type: pending.conflict_type,
                        regions_involved: pending.regions_involved,
                        resolved_at: pending.resolved_at,
                    },
                    false,
                )
            }
        }
    }

    async fn escalate(&self, outcome: &ResolutionOutcome) {
        warn!(
            table = %outcome.table,
            record_id = %outcome.record_id,
            "conflict requires manual resolution"
        );
        if let Some((notifier, channel, limit)) = &self.notifier {
            let mut ctx = NotificationContext::new();
            ctx.insert("table".to_string(), outcome.table.clone());
            ctx.insert("record_id".to_string(), outcome.record_id.clone());
            ctx.insert(
                "regions".to_string(),
                outcome
                    .regions_involved
                    .iter()
                    .map(RegionId::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
            );
            deliver(
                notifier.as_ref(),
                channel,
                Severity::Warning,
                "conflict requires manual resolution",
                &ctx,
                *limit,
            )
            .await;
        }
    }

    /// Current counters.
    pub fn stats(&self) -> ResolverStats {
        ResolverStats {
            resolutions: self.resolutions.load(Ordering::Relaxed),
            default_fallbacks: self.default_fallbacks.load(Ordering::Relaxed),
            write_retries: self.write_retries.load(Ordering::Relaxed),
            unpersisted: self.unpersisted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::MemoryNotifier;
    use crate::rules::RuleSet;
    use crate::store::NewModification;
    use crate::types::Operation;
    use chrono::{DateTime, TimeZone};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn priority() -> Vec<RegionId> {
        vec![
            RegionId::from("us-east-1"),
            RegionId::from("eu-west-1"),
            RegionId::from("ap-southeast-1"),
        ]
    }

    fn setup(writes: &[(&str, i64)]) -> (Arc<AuditStore>, ConflictResolver) {
        let store = Arc::new(AuditStore::with_rules(RuleSet::defaults()));
        for (region, t) in writes {
            store
                .append_modification(NewModification {
                    table: "users".to_string(),
                    record_id: "42".to_string(),
                    region: RegionId::from(*region),
                    operation: Operation::Update,
                    timestamp: ts(*t),
                    data_hash: format!("{region}-{t}"),
                    actor: "test".to_string(),
                })
                .unwrap();
        }
        let resolver = ConflictResolver::new(store.clone(), priority(), Duration::minutes(5));
        (store, resolver)
    }

    #[tokio::test]
    async fn test_timestamp_newest_wins() {
        let (store, resolver) = setup(&[("us-east-1", 100), ("eu-west-1", 105)]);
        let res = resolver.resolve("users", "42", ConflictType::Timestamp).await.unwrap();
        assert_eq!(res.outcome.winning_region, "eu-west-1");
        assert_eq!(res.outcome.winning_timestamp, ts(105));
        assert_eq!(res.outcome.strategy_used, "latest_timestamp_wins");
        assert!(res.persisted);
        assert_eq!(store.outcome_count(), 1);
    }

    #[tokio::test]
    async fn test_timestamp_tie_goes_to_smallest_region() {
        let (_store, resolver) = setup(&[("us-east-1", 100), ("eu-west-1", 100), ("ap-southeast-1", 90)]);
        for _ in 0..5 {
            let res = resolver.resolve("users", "42", ConflictType::Timestamp).await.unwrap();
            assert_eq!(res.outcome.winning_region, "eu-west-1");
        }
    }

    #[tokio::test]
    async fn test_region_priority_beats_newer_write() {
        let (_store, resolver) = setup(&[("us-east-1", 90), ("eu-west-1", 99)]);
        let res = resolver
            .resolve("users", "42", ConflictType::RegionPriority)
            .await
            .unwrap();
        assert_eq!(res.outcome.winning_region, "us-east-1");
        assert_eq!(res.outcome.winning_timestamp, ts(90));
    }

    #[tokio::test]
    async fn test_region_priority_uses_newest_write_of_winner() {
        let (_store, resolver) = setup(&[("eu-west-1", 80), ("eu-west-1", 95), ("ap-southeast-1", 99)]);
        let res = resolver
            .resolve("users", "42", ConflictType::RegionPriority)
            .await
            .unwrap();
        assert_eq!(res.outcome.winning_region, "eu-west-1");
        assert_eq!(res.outcome.winning_timestamp, ts(95));
    }

    #[tokio::test]
    async fn test_preserve_all_reports_multiple_and_keeps_records() {
        let (store, resolver) = setup(&[("us-east-1", 100), ("eu-west-1", 105)]);
        let before = store.modifications_for("users", "42");
        let res = resolver
            .resolve("users", "42", ConflictType::PreserveAll)
            .await
            .unwrap();
        assert_eq!(res.outcome.winning_region, WINNER_MULTIPLE);
        assert_eq!(store.modifications_for("users", "42"), before);
    }

    #[tokio::test]
    async fn test_manual_review_notifies() {
        let (_store, resolver) = setup(&[("us-east-1", 100), ("eu-west-1", 105)]);
        let sink = MemoryNotifier::new();
        let resolver = resolver.with_notifier(Arc::new(sink.clone()), "dba", std::time::Duration::from_secs(5));
        let res = resolver.resolve("users", "42", ConflictType::Manual).await.unwrap();
        assert_eq!(res.outcome.winning_region, WINNER_MANUAL);
        assert_eq!(sink.count(), 1);
        assert_eq!(sink.sent()[0].channel, "dba");
    }

    #[tokio::test]
    async fn test_missing_rule_falls_back_to_latest() {
        let (store, resolver) = setup(&[("us-east-1", 100), ("eu-west-1", 105)]);
        store.deactivate_rule("*", ConflictType::PreserveAll, "preserve_all");
        let res = resolver
            .resolve("users", "42", ConflictType::PreserveAll)
            .await
            .unwrap();
        assert_eq!(res.outcome.winning_region, "eu-west-1");
        assert!(res.rule.is_none());
        assert_eq!(resolver.stats().default_fallbacks, 1);
    }

    #[tokio::test]
    async fn test_unknown_strategy_falls_back_to_latest() {
        let (store, resolver) = setup(&[("us-east-1", 100), ("eu-west-1", 105)]);
        store.upsert_rule(ResolutionRule::new("users", ConflictType::Timestamp, "coin_flip", 1));
        let res = resolver.resolve("users", "42", ConflictType::Timestamp).await.unwrap();
        assert_eq!(res.outcome.strategy_used, DEFAULT_STRATEGY);
        assert_eq!(res.rule.unwrap().strategy_id, "coin_flip");
    }

    #[tokio::test]
    async fn test_empty_record_not_found_and_no_outcome() {
        let (store, resolver) = setup(&[]);
        let err = resolver
            .resolve("users", "42", ConflictType::Timestamp)
            .await
            .unwrap_err();
        assert!(matches!(err, DrError::RecordNotFound { .. }));
        assert_eq!(store.outcome_count(), 0);
    }

    #[tokio::test]
    async fn test_unpersisted_outcome_after_retry() {
        let (store, resolver) = setup(&[("us-east-1", 100), ("eu-west-1", 105)]);
        store.set_read_only(true);
        let res = resolver.resolve("users", "42", ConflictType::Timestamp).await.unwrap();
        assert!(!res.persisted);
        assert_eq!(res.outcome.winning_region, "eu-west-1");
        let stats = resolver.stats();
        assert_eq!(stats.write_retries, 1);
        assert_eq!(stats.unpersisted, 1);
    }

    #[tokio::test]
    async fn test_concurrent_resolves_each_write_one_outcome() {
        let (store, resolver) = setup(&[("us-east-1", 100), ("eu-west-1", 105)]);
        let resolver = Arc::new(resolver);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let r = resolver.clone();
            handles.push(tokio::spawn(async move {
                r.resolve("users", "42", ConflictType::Timestamp).await
            }));
        }
        let mut ids = BTreeSet::new();
        for h in handles {
            ids.insert(h.await.unwrap().unwrap().outcome.outcome_id);
        }
        assert_eq!(ids.len(), 16);
        assert_eq!(store.outcome_count(), 16);
        assert!(resolver.record_locks.is_empty());
    }

    #[test]
    fn test_builtin_strategies_registered() {
        let (_store, resolver) = setup(&[]);
        assert_eq!(
            resolver.strategy_ids(),
            vec![
                "latest_timestamp_wins",
                "manual_review",
                "preserve_all",
                "region_priority"
            ]
        );
    }
}
