//! Shared domain types.
//!
//! Every row is scoped by an immutable `network_id`; there are no relations
//! across networks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Storage surrogate key of a network row.
pub type NetworkId = i64;
/// Storage surrogate key of a validator or group row.
pub type EntityId = i64;
/// Storage surrogate key of a temporal fact row.
pub type FactId = i64;
/// Storage surrogate key of a run header row.
pub type HeaderId = i64;

// ─── Network ─────────────────────────────────────────────────────────────────

/// A chain the watcher observes (e.g. `"mainnet"`). Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub id: NetworkId,
    pub name: String,
}

// ─── Entity ──────────────────────────────────────────────────────────────────

/// The two kinds of registry participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Validator,
    Group,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validator => "validator",
            Self::Group => "group",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "validator" => Some(Self::Validator),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validator or validator group.
///
/// `address` is the natural key from the chain and never changes.
/// `endpoint_url` and `display_name` are mutable scalars updated in place;
/// their history is not kept here (see [`crate::temporal`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub network_id: NetworkId,
    pub kind: EntityKind,
    pub address: String,
    /// Advertised RPC endpoint (validators only).
    pub endpoint_url: Option<String>,
    /// Unversioned display name (groups only).
    pub display_name: Option<String>,
}

// ─── Measurements ────────────────────────────────────────────────────────────

/// One probe cycle. Created exactly once per cycle and never modified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHeader {
    pub id: HeaderId,
    pub network_id: NetworkId,
    /// Opaque, globally unique correlation token generated by the driver.
    pub run_id: String,
    pub executed_at: DateTime<Utc>,
}

/// One probed entity's result within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMeasurement {
    pub network_id: NetworkId,
    pub entity_id: EntityId,
    pub header_id: HeaderId,
    pub up: bool,
    /// Block height reported by the endpoint; `None` when down.
    pub height: Option<u64>,
    pub http_status: Option<u16>,
    /// Round-trip latency; `None` when down.
    pub latency_ms: Option<u64>,
}

/// The URL that was actually probed for an entity in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSnapshot {
    pub network_id: NetworkId,
    pub entity_id: EntityId,
    pub header_id: HeaderId,
    pub endpoint_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_kind_roundtrips_through_str() {
        for kind in [EntityKind::Validator, EntityKind::Group] {
            assert_eq!(EntityKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EntityKind::parse("account"), None);
    }

    #[test]
    fn entity_kind_serializes_lowercase() {
        let json = serde_json::to_string(&EntityKind::Group).unwrap();
        assert_eq!(json, "\"group\"");
    }
}
