//! Resolution rules and rule selection.
//!
//! Rules form an ordered set scored by `(specificity, priority)`: an exact
//! table scope beats the `"*"` wildcard, then the lower priority wins. Adding
//! a scope or a strategy is a data change, not a code change.

use crate::types::ConflictType;
use serde::{Deserialize, Serialize};

/// Scope that matches every table.
pub const WILDCARD_SCOPE: &str = "*";

/// Strategy used when no rule matches.
pub const DEFAULT_STRATEGY: &str = "latest_timestamp_wins";

fn default_active() -> bool {
    true
}

/// A configured resolution rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionRule {
    /// Exact table name or `"*"`.
    pub scope: String,
    /// Conflict type the rule handles.
    pub conflict_type: ConflictType,
    /// Registered strategy identifier.
    pub strategy_id: String,
    /// Lower value means higher precedence.
    pub priority: i32,
    /// Inactive rules are never selected.
    #[serde(default = "default_active")]
    pub active: bool,
}

impl ResolutionRule {
    /// Create an active rule.
    pub fn new(
        scope: impl Into<String>,
        conflict_type: ConflictType,
        strategy_id: impl Into<String>,
        priority: i32,
    ) -> Self {
        Self {
            scope: scope.into(),
            conflict_type,
            strategy_id: strategy_id.into(),
            priority,
            active: true,
        }
    }

    /// 0 for an exact scope match, 1 for a wildcard match, `None` otherwise.
    pub fn specificity(&self, table: &str) -> Option<u8> {
        if self.scope == table {
            Some(0)
        } else if self.scope == WILDCARD_SCOPE {
            Some(1)
        } else {
            None
        }
    }

    fn same_identity(&self, other: &ResolutionRule) -> bool {
        self.scope == other.scope
            && self.conflict_type == other.conflict_type
            && self.strategy_id == other.strategy_id
    }
}

/// Ordered, queryable set of rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    rules: Vec<ResolutionRule>,
}

impl RuleSet {
    /// Build from explicit rules.
    pub fn from_rules(rules: Vec<ResolutionRule>) -> Self {
        Self { rules }
    }

    /// The rules seeded when configuration provides none: one wildcard rule
    /// per conflict type.
    pub fn defaults() -> Self {
        Self::from_rules(vec![
            ResolutionRule::new(WILDCARD_SCOPE, ConflictType::Timestamp, DEFAULT_STRATEGY, 100),
            ResolutionRule::new(WILDCARD_SCOPE, ConflictType::RegionPriority, "region_priority", 100),
            ResolutionRule::new(WILDCARD_SCOPE, ConflictType::Manual, "manual_review", 100),
            ResolutionRule::new(WILDCARD_SCOPE, ConflictType::PreserveAll, "preserve_all", 100),
        ])
    }

    /// Configured rules, or the defaults when none are configured.
    pub fn seed(configured: &[ResolutionRule]) -> Self {
        if configured.is_empty() {
            Self::defaults()
        } else {
            Self::from_rules(configured.to_vec())
        }
    }

    /// All rules in insertion order.
    pub fn rules(&self) -> &[ResolutionRule] {
        &self.rules
    }

    /// Best active rule for `table` and `conflict_type`.
    pub fn select(&self, table: &str, conflict_type: ConflictType) -> Option<&ResolutionRule> {
        self.rules
            .iter()
            .filter(|r| r.active && r.conflict_type == conflict_type)
            .filter_map(|r| r.specificity(table).map(|s| (s, r)))
            .min_by(|(sa, a), (sb, b)| {
                sa.cmp(sb)
                    .then(a.priority.cmp(&b.priority))
                    .then_with(|| a.strategy_id.cmp(&b.strategy_id))
            })
            .map(|(_, r)| r)
    }

    /// Insert a rule, replacing one with the same scope, type and strategy.
    pub fn upsert(&mut self, rule: ResolutionRule) {
        match self.rules.iter_mut().find(|r| r.same_identity(&rule)) {
            Some(existing) => *existing = rule,
            None => self.rules.push(rule),
        }
    }

    /// Deactivate matching rules. Returns how many were active before.
    pub fn deactivate(&mut self, scope: &str, conflict_type: ConflictType, strategy_id: &str) -> usize {
        let mut changed = 0;
        for r in self.rules.iter_mut().filter(|r| {
            r.scope == scope && r.conflict_type == conflict_type && r.strategy_id == strategy_id
        }) {
            if r.active {
                r.active = false;
                changed += 1;
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_every_conflict_type() {
        let rules = RuleSet::defaults();
        for ct in [
            ConflictType::Timestamp,
            ConflictType::RegionPriority,
            ConflictType::Manual,
            ConflictType::PreserveAll,
        ] {
            assert!(rules.select("anything", ct).is_some());
        }
    }

    #[test]
    fn test_exact_scope_beats_wildcard_even_with_worse_priority() {
        let rules = RuleSet::from_rules(vec![
            ResolutionRule::new("*", ConflictType::Timestamp, "latest_timestamp_wins", 1),
            ResolutionRule::new("orders", ConflictType::Timestamp, "preserve_all", 50),
        ]);
        let rule = rules.select("orders", ConflictType::Timestamp).unwrap();
        assert_eq!(rule.strategy_id, "preserve_all");
        let rule = rules.select("users", ConflictType::Timestamp).unwrap();
        assert_eq!(rule.strategy_id, "latest_timestamp_wins");
    }

    #[test]
    fn test_lower_priority_wins_within_same_specificity() {
        let rules = RuleSet::from_rules(vec![
            ResolutionRule::new("*", ConflictType::Timestamp, "a", 20),
            ResolutionRule::new("*", ConflictType::Timestamp, "b", 10),
        ]);
        assert_eq!(rules.select("t", ConflictType::Timestamp).unwrap().strategy_id, "b");
    }

    #[test]
    fn test_inactive_and_mismatched_types_ignored() {
        let mut rules = RuleSet::from_rules(vec![ResolutionRule::new(
            "*",
            ConflictType::Timestamp,
            "latest_timestamp_wins",
            1,
        )]);
        assert!(rules.select("t", ConflictType::PreserveAll).is_none());
        assert_eq!(rules.deactivate("*", ConflictType::Timestamp, "latest_timestamp_wins"), 1);
        assert_eq!(rules.deactivate("*", ConflictType::Timestamp, "latest_timestamp_wins"), 0);
        assert!(rules.select("t", ConflictType::Timestamp).is_none());
    }

    #[test]
    fn test_upsert_replaces_same_identity() {
        let mut rules = RuleSet::defaults();
        let before = rules.rules().len();
        rules.upsert(ResolutionRule::new("*", ConflictType::Timestamp, DEFAULT_STRATEGY, 5));
        assert_eq!(rules.rules().len(), before);
        assert_eq!(rules.select("t", ConflictType::Timestamp).unwrap().priority, 5);

        rules.upsert(ResolutionRule::new("users", ConflictType::Timestamp, "region_priority", 500));
        assert_eq!(rules.rules().len(), before + 1);
    }

    #[test]
    fn test_seed_falls_back_to_defaults() {
        assert_eq!(RuleSet::seed(&[]), RuleSet::defaults());
        let custom = vec![ResolutionRule::new("x", ConflictType::Manual, "manual_review", 1)];
        assert_eq!(RuleSet::seed(&custom).rules().len(), 1);
    }

    #[test]
    fn test_rule_deserializes_active_by_default() {
        let rule: ResolutionRule = serde_json::from_str(
            r#"{"scope":"*","conflict_type":"timestamp","strategy_id":"latest_timestamp_wins","priority":1}"#,
        )
        .unwrap();
        assert!(rule.active);
    }
}
