//! Temporal record store: validity-interval history for mutable attributes.
//!
//! Two attributes carry history: a validator's display name (versioned by
//! block height) and its group membership (versioned by epoch). Each fact
//! covers the half-open interval `[valid_from, valid_to)`; `valid_to = None`
//! marks the open (current) fact.
//!
//! For one `(network, kind, entity)` there is at most one open fact and the
//! intervals are non-overlapping and contiguous from the first one onward.
//! Backends keep that invariant by executing [`plan_record`] and applying its
//! result atomically (or as idempotent sequential steps where the engine has
//! no transactions).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::WatchError;
use crate::types::{EntityId, FactId, NetworkId};

// ─── FactKind / FactValue ────────────────────────────────────────────────────

/// Which attribute a fact versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactKind {
    /// Validator display name, versioned by block height.
    Name,
    /// Validator → group membership, versioned by epoch.
    GroupMembership,
}

impl FactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::GroupMembership => "group",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "name" => Some(Self::Name),
            "group" => Some(Self::GroupMembership),
            _ => None,
        }
    }
}

/// The versioned value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FactValue {
    Name(String),
    /// Surrogate id of the group entity.
    Group(EntityId),
}

impl FactValue {
    pub fn kind(&self) -> FactKind {
        match self {
            Self::Name(_) => FactKind::Name,
            Self::Group(_) => FactKind::GroupMembership,
        }
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            Self::Name(n) => Some(n),
            Self::Group(_) => None,
        }
    }

    pub fn as_group(&self) -> Option<EntityId> {
        match self {
            Self::Group(g) => Some(*g),
            Self::Name(_) => None,
        }
    }
}

impl std::fmt::Display for FactValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Name(n) => write!(f, "name:{n}"),
            Self::Group(g) => write!(f, "group:{g}"),
        }
    }
}

// ─── TemporalFact ────────────────────────────────────────────────────────────

/// A stored fact with its validity interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporalFact {
    pub id: FactId,
    pub network_id: NetworkId,
    pub entity_id: EntityId,
    pub value: FactValue,
    /// Inclusive start (block height or epoch).
    pub valid_from: u64,
    /// Exclusive end; `None` while the fact is current.
    pub valid_to: Option<u64>,
}

impl TemporalFact {
    pub fn kind(&self) -> FactKind {
        self.value.kind()
    }

    pub fn is_open(&self) -> bool {
        self.valid_to.is_none()
    }

    /// Returns `true` if `at` falls inside `[valid_from, valid_to)`.
    pub fn contains(&self, at: u64) -> bool {
        self.valid_from <= at && self.valid_to.map_or(true, |to| to > at)
    }
}

/// Pick the fact whose interval contains `at`.
///
/// At most one fact matches when the history is well formed; after manual
/// repair several may, in which case the one with the latest `valid_from` wins.
pub fn select_fact_at<'a, I>(facts: I, at: u64) -> Option<&'a TemporalFact>
where
    I: IntoIterator<Item = &'a TemporalFact>,
{
    facts
        .into_iter()
        .filter(|f| f.contains(at))
        .max_by_key(|f| f.valid_from)
}

// ─── Record planning ─────────────────────────────────────────────────────────

/// What a backend must do to record a new observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordPlan {
    /// A fact already starts at `effective_from`; return it unchanged.
    ///
    /// `same_value = false` is the duplicate-key path: a concurrent
    /// reconciliation won the race and its row is kept.
    Existing { id: FactId, same_value: bool },
    /// Close `close` (if any) at `effective_from`, then insert an open fact.
    Insert { close: Option<FactId> },
}

/// Decide how to record `value` taking effect at `effective_from`, given every
/// stored fact of the same `(network, kind, entity)`.
pub fn plan_record(
    facts: &[TemporalFact],
    value: &FactValue,
    effective_from: u64,
) -> Result<RecordPlan, WatchError> {
    if let Some(same) = facts
        .iter()
        .find(|f| f.valid_from == effective_from && &f.value == value)
    {
        return Ok(RecordPlan::Existing { id: same.id, same_value: true });
    }
    if let Some(taken) = facts.iter().find(|f| f.valid_from == effective_from) {
        return Ok(RecordPlan::Existing { id: taken.id, same_value: false });
    }

    if let Some(latest) = facts.iter().max_by_key(|f| f.valid_from) {
        if latest.valid_from > effective_from {
            return Err(WatchError::OutOfOrderFact {
                entity_id: latest.entity_id,
                effective_from,
                latest_from: latest.valid_from,
            });
        }
    }

    let close = facts
        .iter()
        .filter(|f| f.is_open() && f.valid_from < effective_from)
        .max_by_key(|f| f.valid_from)
        .map(|f| f.id);

    Ok(RecordPlan::Insert { close })
}

// ─── Invariant check ─────────────────────────────────────────────────────────

/// A broken history invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryViolation {
    MultipleOpen { count: usize },
    EmptyInterval { id: FactId },
    Overlap { earlier: FactId, later: FactId },
    Gap { earlier: FactId, later: FactId },
    /// A closed fact follows the open one.
    OpenNotLast { id: FactId },
}

/// Verify the history of one `(network, kind, entity)`.
pub fn verify_history(facts: &[TemporalFact]) -> Result<(), HistoryViolation> {
    let open = facts.iter().filter(|f| f.is_open()).count();
    if open > 1 {
        return Err(HistoryViolation::MultipleOpen { count: open });
    }

    let mut sorted: Vec<&TemporalFact> = facts.iter().collect();
    sorted.sort_by_key(|f| f.valid_from);

    for f in &sorted {
        if let Some(to) = f.valid_to {
            if to <= f.valid_from {
                return Err(HistoryViolation::EmptyInterval { id: f.id });
            }
        }
    }

    for pair in sorted.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        match a.valid_to {
            None => return Err(HistoryViolation::OpenNotLast { id: a.id }),
            Some(to) if to > b.valid_from => {
                return Err(HistoryViolation::Overlap { earlier: a.id, later: b.id })
            }
            Some(to) if to < b.valid_from => {
                return Err(HistoryViolation::Gap { earlier: a.id, later: b.id })
            }
            Some(_) => {}
        }
    }
    Ok(())
}

// ─── FactStore ───────────────────────────────────────────────────────────────

/// Storage contract for temporal facts.
///
/// Implementations: `InMemoryStorage` and `SqliteStorage` in `rpcwatch-storage`.
#[async_trait]
pub trait FactStore: Send + Sync {
    /// Record `value` as the entity's fact from `effective_from` onward.
    ///
    /// Idempotent: replaying the same `(entity, effective_from, value)`
    /// returns the existing id. A duplicate key raised by a concurrent writer
    /// is resolved by re-reading the row that won.
    async fn record_fact(
        &self,
        network_id: NetworkId,
        entity_id: EntityId,
        value: &FactValue,
        effective_from: u64,
    ) -> Result<FactId, WatchError>;

    /// The fact whose interval contains `at` (see [`select_fact_at`]).
    async fn fact_at(
        &self,
        network_id: NetworkId,
        kind: FactKind,
        entity_id: EntityId,
        at: u64,
    ) -> Result<Option<TemporalFact>, WatchError>;

    /// Every fact for the entity, ordered by `valid_from`.
    async fn history(
        &self,
        network_id: NetworkId,
        kind: FactKind,
        entity_id: EntityId,
    ) -> Result<Vec<TemporalFact>, WatchError>;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn fact(id: FactId, name: &str, from: u64, to: Option<u64>) -> TemporalFact {
        TemporalFact {
            id,
            network_id: 1,
            entity_id: 10,
            value: FactValue::Name(name.into()),
            valid_from: from,
            valid_to: to,
        }
    }

    #[test]
    fn contains_is_inclusive_start_exclusive_end() {
        let f = fact(1, "Alice", 100, Some(150));
        assert!(!f.contains(99));
        assert!(f.contains(100));
        assert!(f.contains(149));
        assert!(!f.contains(150));
        assert!(fact(2, "Bob", 150, None).contains(u64::MAX));
    }

    #[test]
    fn select_at_boundary_returns_newer_fact() {
        let facts = vec![fact(1, "Alice", 0, Some(100)), fact(2, "Bob", 100, None)];
        assert_eq!(select_fact_at(&facts, 99).unwrap().id, 1);
        assert_eq!(select_fact_at(&facts, 100).unwrap().id, 2);
        assert!(select_fact_at(&facts[1..], 50).is_none());
    }

    #[test]
    fn select_prefers_latest_valid_from_on_overlap() {
        // Two open rows left behind by a manual repair.
        let facts = vec![fact(1, "Old", 0, None), fact(2, "New", 40, None)];
        assert_eq!(select_fact_at(&facts, 50).unwrap().id, 2);
        assert_eq!(select_fact_at(&facts, 10).unwrap().id, 1);
    }

    #[test]
    fn plan_first_fact_inserts_without_close() {
        let plan = plan_record(&[], &FactValue::Name("Alice".into()), 0).unwrap();
        assert_eq!(plan, RecordPlan::Insert { close: None });
    }

    #[test]
    fn plan_closes_open_fact() {
        let facts = vec![fact(1, "Alice", 0, Some(100)), fact(2, "Alice", 100, None)];
        let plan = plan_record(&facts, &FactValue::Name("Bob".into()), 150).unwrap();
        assert_eq!(plan, RecordPlan::Insert { close: Some(2) });
    }

    #[test]
    fn plan_replay_is_idempotent() {
        let facts = vec![fact(1, "Alice", 0, Some(150)), fact(2, "Bob", 150, None)];
        let plan = plan_record(&facts, &FactValue::Name("Bob".into()), 150).unwrap();
        assert_eq!(plan, RecordPlan::Existing { id: 2, same_value: true });
    }

    #[test]
    fn plan_same_start_different_value_keeps_existing_row() {
        let facts = vec![fact(1, "Bob", 150, None)];
        let plan = plan_record(&facts, &FactValue::Name("Carol".into()), 150).unwrap();
        assert_eq!(plan, RecordPlan::Existing { id: 1, same_value: false });
    }

    #[test]
    fn plan_rejects_observation_older_than_latest() {
        let facts = vec![fact(1, "Alice", 200, None)];
        let err = plan_record(&facts, &FactValue::Name("Bob".into()), 150).unwrap_err();
        assert!(matches!(
            err,
            WatchError::OutOfOrderFact { effective_from: 150, latest_from: 200, .. }
        ));
    }

    #[test]
    fn verify_accepts_contiguous_history() {
        let facts = vec![
            fact(1, "Alice", 0, Some(100)),
            fact(2, "Alice", 100, Some(150)),
            fact(3, "Bob", 150, None),
        ];
        assert!(verify_history(&facts).is_ok());
        assert!(verify_history(&[]).is_ok());
    }

    #[test]
    fn verify_rejects_broken_histories() {
        let two_open = vec![fact(1, "A", 0, None), fact(2, "B", 10, None)];
        assert_eq!(verify_history(&two_open), Err(HistoryViolation::MultipleOpen { count: 2 }));

        let overlap = vec![fact(1, "A", 0, Some(20)), fact(2, "B", 10, None)];
        assert_eq!(
            verify_history(&overlap),
            Err(HistoryViolation::Overlap { earlier: 1, later: 2 })
        );

        let gap = vec![fact(1, "A", 0, Some(5)), fact(2, "B", 10, None)];
        assert_eq!(verify_history(&gap), Err(HistoryViolation::Gap { earlier: 1, later: 2 }));

        let empty = vec![fact(1, "A", 10, Some(10))];
        assert_eq!(verify_history(&empty), Err(HistoryViolation::EmptyInterval { id: 1 }));
    }

    #[test]
    fn fact_value_accessors() {
        let name = FactValue::Name("Alice".into());
        let group = FactValue::Group(7);
        assert_eq!(name.kind(), FactKind::Name);
        assert_eq!(group.kind(), FactKind::GroupMembership);
        assert_eq!(name.as_name(), Some("Alice"));
        assert_eq!(group.as_group(), Some(7));
        assert_eq!(FactKind::parse(FactKind::GroupMembership.as_str()), Some(FactKind::GroupMembership));
    }
}
