//! Storage traits.
//!
//! Implementations include `InMemoryStorage` and `SqliteStorage` in
//! `rpcwatch-storage`. The storage backend is the only shared mutable
//! resource; every write is scoped by `network_id`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::WatchError;
use crate::query::{RosterEntry, RunFilter, RunWithResults};
use crate::temporal::FactStore;
use crate::types::{
    Entity, EntityId, EntityKind, Network, NetworkId, NewMeasurement, NewSnapshot, RunHeader,
};

/// Network rows: looked up or created once at startup.
#[async_trait]
pub trait NetworkStore: Send + Sync {
    async fn get_or_insert_network(&self, name: &str) -> Result<Network, WatchError>;
}

/// Validator and group rows.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// All entities of `kind` in the network.
    async fn entities(&self, network_id: NetworkId, kind: EntityKind)
        -> Result<Vec<Entity>, WatchError>;

    /// Entities of `kind` whose address is in `addresses`. Unknown addresses are ignored.
    async fn entities_by_addresses(
        &self,
        network_id: NetworkId,
        kind: EntityKind,
        addresses: &[String],
    ) -> Result<Vec<Entity>, WatchError>;

    /// Insert-or-ignore; returns how many addresses were new.
    async fn insert_entities(
        &self,
        network_id: NetworkId,
        kind: EntityKind,
        addresses: &[String],
    ) -> Result<usize, WatchError>;

    /// Overwrite the current endpoint (not versioned).
    async fn set_endpoint(&self, entity_id: EntityId, url: Option<&str>) -> Result<(), WatchError>;

    /// Overwrite the group display name (not versioned).
    async fn set_display_name(
        &self,
        entity_id: EntityId,
        name: Option<&str>,
    ) -> Result<(), WatchError>;
}

/// Run headers, per-entity results and endpoint snapshots.
#[async_trait]
pub trait MeasurementStore: Send + Sync {
    /// Insert a run header. A duplicate `run_id` yields [`WatchError::Conflict`].
    async fn insert_run_header(
        &self,
        network_id: NetworkId,
        run_id: &str,
        executed_at: DateTime<Utc>,
    ) -> Result<RunHeader, WatchError>;

    async fn run_header(
        &self,
        network_id: NetworkId,
        run_id: &str,
    ) -> Result<Option<RunHeader>, WatchError>;

    /// Insert result rows. A row for an `(header, entity)` pair that already
    /// has one is ignored, so a run can be re-recorded safely.
    async fn insert_results(&self, rows: &[NewMeasurement]) -> Result<(), WatchError>;

    /// Insert endpoint snapshots; same `(header, entity)` rule as results.
    async fn insert_snapshots(&self, rows: &[NewSnapshot]) -> Result<(), WatchError>;

    /// The most recently recorded endpoint snapshot for an entity.
    async fn latest_snapshot(
        &self,
        network_id: NetworkId,
        entity_id: EntityId,
    ) -> Result<Option<String>, WatchError>;
}

/// Read-only projections served to the query layer.
#[async_trait]
pub trait ProjectionStore: Send + Sync {
    /// Runs with nested results, ordered by `executed_at ASC, address ASC`.
    /// An empty range yields an empty vector.
    async fn runs_in_range(
        &self,
        network_id: NetworkId,
        filter: &RunFilter,
    ) -> Result<Vec<RunWithResults>, WatchError>;

    /// Current validators with their open name and group facts, ordered by address.
    async fn current_roster(&self, network_id: NetworkId) -> Result<Vec<RosterEntry>, WatchError>;
}

/// Everything the watcher needs from a backend.
pub trait Storage:
    NetworkStore + EntityStore + FactStore + MeasurementStore + ProjectionStore
{
}

impl<T> Storage for T where
    T: NetworkStore + EntityStore + FactStore + MeasurementStore + ProjectionStore
{
}
