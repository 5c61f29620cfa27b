//! In-memory storage backend.
//!
//! Every table sits behind one mutex, so the close-then-insert pair of a fact
//! transition is atomic. All data is lost when the process exits.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use rpcwatch_core::query::{sort_runs, ExportRow, RosterEntry, RunFilter, RunWithResults};
use rpcwatch_core::store::{EntityStore, MeasurementStore, NetworkStore, ProjectionStore};
use rpcwatch_core::temporal::{
    plan_record, select_fact_at, FactKind, FactStore, FactValue, RecordPlan, TemporalFact,
};
use rpcwatch_core::types::{
    Entity, EntityId, EntityKind, FactId, HeaderId, Network, NetworkId, NewMeasurement,
    NewSnapshot, RunHeader,
};
use rpcwatch_core::WatchError;

#[derive(Default)]
struct Tables {
    networks: Vec<Network>,
    entities: Vec<Entity>,
    facts: Vec<TemporalFact>,
    headers: Vec<RunHeader>,
    results: Vec<NewMeasurement>,
    snapshots: Vec<NewSnapshot>,
}

impl Tables {
    fn facts_of(&self, network_id: NetworkId, kind: FactKind, entity_id: EntityId) -> Vec<TemporalFact> {
        let mut facts: Vec<TemporalFact> = self
            .facts
            .iter()
            .filter(|f| f.network_id == network_id && f.entity_id == entity_id && f.kind() == kind)
            .cloned()
            .collect();
        facts.sort_by_key(|f| f.valid_from);
        facts
    }

    fn open_fact(&self, network_id: NetworkId, kind: FactKind, entity_id: EntityId) -> Option<&TemporalFact> {
        self.facts
            .iter()
            .filter(|f| {
                f.network_id == network_id && f.entity_id == entity_id && f.kind() == kind && f.is_open()
            })
            .max_by_key(|f| f.valid_from)
    }
}

/// In-memory watcher storage.
#[derive(Default)]
pub struct InMemoryStorage {
    tables: Mutex<Tables>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, WatchError> {
        self.tables
            .lock()
            .map_err(|_| WatchError::Storage("in-memory tables poisoned".into()))
    }

    /// Number of stored result rows for a run header.
    pub fn result_count(&self, header_id: i64) -> usize {
        self.tables()
            .map(|t| t.results.iter().filter(|r| r.header_id == header_id).count())
            .unwrap_or(0)
    }

    /// Number of stored run headers.
    pub fn header_count(&self) -> usize {
        self.tables().map(|t| t.headers.len()).unwrap_or(0)
    }
}

#[async_trait]
impl NetworkStore for InMemoryStorage {
    async fn get_or_insert_network(&self, name: &str) -> Result<Network, WatchError> {
        let mut t = self.tables()?;
        if let Some(n) = t.networks.iter().find(|n| n.name == name) {
            return Ok(n.clone());
        }
        let network = Network { id: t.networks.len() as NetworkId + 1, name: name.to_string() };
        t.networks.push(network.clone());
        Ok(network)
    }
}

#[async_trait]
impl EntityStore for InMemoryStorage {
    async fn entities(
        &self,
        network_id: NetworkId,
        kind: EntityKind,
    ) -> Result<Vec<Entity>, WatchError> {
        let t = self.tables()?;
        let mut found: Vec<Entity> = t
            .entities
            .iter()
            .filter(|e| e.network_id == network_id && e.kind == kind)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(found)
    }

    async fn entities_by_addresses(
        &self,
        network_id: NetworkId,
        kind: EntityKind,
        addresses: &[String],
    ) -> Result<Vec<Entity>, WatchError> {
        let t = self.tables()?;
        Ok(t.entities
            .iter()
            .filter(|e| {
                e.network_id == network_id
                    && e.kind == kind
                    && addresses.iter().any(|a| a.eq_ignore_ascii_case(&e.address))
            })
            .cloned()
            .collect())
    }

    async fn insert_entities(
        &self,
        network_id: NetworkId,
        kind: EntityKind,
        addresses: &[String],
    ) -> Result<usize, WatchError> {
        let mut t = self.tables()?;
        let mut inserted = 0;
        for address in addresses {
            let exists = t.entities.iter().any(|e| {
                e.network_id == network_id && e.kind == kind && e.address.eq_ignore_ascii_case(address)
            });
            if exists {
                continue;
            }
            let id = t.entities.len() as EntityId + 1;
            t.entities.push(Entity {
                id,
                network_id,
                kind,
                address: address.clone(),
                endpoint_url: None,
                display_name: None,
            });
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn set_endpoint(&self, entity_id: EntityId, url: Option<&str>) -> Result<(), WatchError> {
        let mut t = self.tables()?;
        let entity = t
            .entities
            .iter_mut()
            .find(|e| e.id == entity_id)
            .ok_or_else(|| WatchError::Storage(format!("entity {entity_id} not found")))?;
        entity.endpoint_url = url.map(str::to_string);
        Ok(())
    }

    async fn set_display_name(
        &self,
        entity_id: EntityId,
        name: Option<&str>,
    ) -> Result<(), WatchError> {
        let mut t = self.tables()?;
        let entity = t
            .entities
            .iter_mut()
            .find(|e| e.id == entity_id)
            .ok_or_else(|| WatchError::Storage(format!("entity {entity_id} not found")))?;
        entity.display_name = name.map(str::to_string);
        Ok(())
    }
}

#[async_trait]
impl FactStore for InMemoryStorage {
    async fn record_fact(
        &self,
        network_id: NetworkId,
        entity_id: EntityId,
        value: &FactValue,
        effective_from: u64,
    ) -> Result<FactId, WatchError> {
        let mut t = self.tables()?;
        let existing = t.facts_of(network_id, value.kind(), entity_id);
        match plan_record(&existing, value, effective_from)? {
            RecordPlan::Existing { id, .. } => Ok(id),
            RecordPlan::Insert { close } => {
                if let Some(close_id) = close {
                    if let Some(f) = t.facts.iter_mut().find(|f| f.id == close_id) {
                        f.valid_to = Some(effective_from);
                    }
                }
                let id = t.facts.len() as FactId + 1;
                t.facts.push(TemporalFact {
                    id,
                    network_id,
                    entity_id,
                    value: value.clone(),
                    valid_from: effective_from,
                    valid_to: None,
                });
                Ok(id)
            }
        }
    }

    async fn fact_at(
        &self,
        network_id: NetworkId,
        kind: FactKind,
        entity_id: EntityId,
        at: u64,
    ) -> Result<Option<TemporalFact>, WatchError> {
        let t = self.tables()?;
        let facts = t.facts_of(network_id, kind, entity_id);
        Ok(select_fact_at(&facts, at).cloned())
    }

    async fn history(
        &self,
        network_id: NetworkId,
        kind: FactKind,
        entity_id: EntityId,
    ) -> Result<Vec<TemporalFact>, WatchError> {
        Ok(self.tables()?.facts_of(network_id, kind, entity_id))
    }
}

#[async_trait]
impl MeasurementStore for InMemoryStorage {
    async fn insert_run_header(
        &self,
        network_id: NetworkId,
        run_id: &str,
        executed_at: DateTime<Utc>,
    ) -> Result<RunHeader, WatchError> {
        let mut t = self.tables()?;
        if t.headers.iter().any(|h| h.run_id == run_id) {
            return Err(WatchError::Conflict(format!("run {run_id} already recorded")));
        }
        let header = RunHeader {
            id: t.headers.len() as i64 + 1,
            network_id,
            run_id: run_id.to_string(),
            executed_at,
        };
        t.headers.push(header.clone());
        Ok(header)
    }

    async fn run_header(
        &self,
        network_id: NetworkId,
        run_id: &str,
    ) -> Result<Option<RunHeader>, WatchError> {
        let t = self.tables()?;
        Ok(t.headers
            .iter()
            .find(|h| h.network_id == network_id && h.run_id == run_id)
            .cloned())
    }

    async fn insert_results(&self, rows: &[NewMeasurement]) -> Result<(), WatchError> {
        let mut t = self.tables()?;
        let mut seen: HashSet<(HeaderId, EntityId)> =
            t.results.iter().map(|r| (r.header_id, r.entity_id)).collect();
        for row in rows {
            if seen.insert((row.header_id, row.entity_id)) {
                t.results.push(row.clone());
            }
        }
        Ok(())
    }

    async fn insert_snapshots(&self, rows: &[NewSnapshot]) -> Result<(), WatchError> {
        let mut t = self.tables()?;
        let mut seen: HashSet<(HeaderId, EntityId)> =
            t.snapshots.iter().map(|s| (s.header_id, s.entity_id)).collect();
        for row in rows {
            if seen.insert((row.header_id, row.entity_id)) {
                t.snapshots.push(row.clone());
            }
        }
        Ok(())
    }

    async fn latest_snapshot(
        &self,
        network_id: NetworkId,
        entity_id: EntityId,
    ) -> Result<Option<String>, WatchError> {
        let t = self.tables()?;
        Ok(t.snapshots
            .iter()
            .filter(|s| s.network_id == network_id && s.entity_id == entity_id)
            .max_by_key(|s| s.header_id)
            .map(|s| s.endpoint_url.clone()))
    }
}

#[async_trait]
impl ProjectionStore for InMemoryStorage {
    async fn runs_in_range(
        &self,
        network_id: NetworkId,
        filter: &RunFilter,
    ) -> Result<Vec<RunWithResults>, WatchError> {
        let t = self.tables()?;
        let addresses: HashMap<EntityId, &str> =
            t.entities.iter().map(|e| (e.id, e.address.as_str())).collect();

        let mut by_header: HashMap<HeaderId, Vec<&NewMeasurement>> = HashMap::new();
        for r in &t.results {
            by_header.entry(r.header_id).or_default().push(r);
        }

        let mut rows = Vec::new();
        for header in t
            .headers
            .iter()
            .filter(|h| h.network_id == network_id && filter.covers(h.executed_at))
        {
            for r in by_header.get(&header.id).into_iter().flatten() {
                let Some(address) = addresses.get(&r.entity_id) else {
                    continue;
                };
                if !filter.matches_address(address) {
                    continue;
                }
                rows.push(ExportRow {
                    run_id: header.run_id.clone(),
                    executed_at: header.executed_at,
                    address: address.to_string(),
                    up: r.up,
                    height: r.height,
                    http_status: r.http_status,
                    latency_ms: r.latency_ms,
                });
            }
        }

        let mut runs = RunWithResults::group(rows);
        sort_runs(&mut runs);
        Ok(runs)
    }

    async fn current_roster(&self, network_id: NetworkId) -> Result<Vec<RosterEntry>, WatchError> {
        let t = self.tables()?;
        let mut roster: Vec<RosterEntry> = t
            .entities
            .iter()
            .filter(|e| e.network_id == network_id && e.kind == EntityKind::Validator)
            .map(|v| {
                let current_name = t
                    .open_fact(network_id, FactKind::Name, v.id)
                    .and_then(|f| f.value.as_name().map(str::to_string));
                let current_group_name = t
                    .open_fact(network_id, FactKind::GroupMembership, v.id)
                    .and_then(|f| f.value.as_group())
                    .and_then(|gid| t.entities.iter().find(|g| g.id == gid))
                    .and_then(|g| g.display_name.clone());
                RosterEntry {
                    address: v.address.clone(),
                    current_name,
                    current_group_name,
                    endpoint_url: v.endpoint_url.clone(),
                }
            })
            .collect();
        roster.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(roster)
    }
}
