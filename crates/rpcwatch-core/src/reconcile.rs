//! Registry reconciler: syncs stored entities and their history to chain state.
//!
//! One pass reads the chain at a single observed height and epoch. Names are
//! versioned by that height, memberships by that epoch. A failed read for one
//! entity is logged and recorded in the summary; only storage failures abort
//! the pass.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::WatchError;
use crate::oracle::ChainOracle;
use crate::store::Storage;
use crate::temporal::{FactKind, FactValue};
use crate::types::{Entity, EntityId, EntityKind, NetworkId};

/// A per-entity failure that was skipped rather than propagated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityFailure {
    pub address: String,
    /// Which step failed: `name`, `endpoint`, `backfill`, `roster` or `membership`.
    pub stage: String,
    pub reason: String,
}

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    /// Chain height the pass observed.
    pub height: u64,
    pub epoch: u64,
    pub groups_inserted: usize,
    pub validators_inserted: usize,
    pub names_recorded: usize,
    pub memberships_recorded: usize,
    pub memberships_backfilled: usize,
    pub endpoints_updated: usize,
    pub group_names_updated: usize,
    pub failures: Vec<EntityFailure>,
}

impl ReconcileSummary {
    pub fn inserted(&self) -> usize {
        self.groups_inserted + self.validators_inserted
    }

    pub fn updated(&self) -> usize {
        self.names_recorded
            + self.memberships_recorded
            + self.memberships_backfilled
            + self.endpoints_updated
            + self.group_names_updated
    }
}

/// Entities keyed by case-insensitive address.
struct AddressIndex(HashMap<String, Entity>);

impl AddressIndex {
    fn new(entities: Vec<Entity>) -> Self {
        let mut index = Self(HashMap::with_capacity(entities.len()));
        for e in entities {
            index.insert(e);
        }
        index
    }

    fn insert(&mut self, entity: Entity) {
        self.0.insert(entity.address.to_ascii_lowercase(), entity);
    }

    fn get(&self, address: &str) -> Option<&Entity> {
        self.0.get(&address.to_ascii_lowercase())
    }
}

fn is_zero_address(address: &str) -> bool {
    let hex = address.trim_start_matches("0x");
    !hex.is_empty() && hex.bytes().all(|b| b == b'0')
}

type StageResult<T> = Result<T, (&'static str, WatchError)>;

pub struct Reconciler {
    oracle: Arc<dyn ChainOracle>,
    store: Arc<dyn Storage>,
    backfill_membership_history: bool,
}

impl Reconciler {
    pub fn new(oracle: Arc<dyn ChainOracle>, store: Arc<dyn Storage>) -> Self {
        Self { oracle, store, backfill_membership_history: true }
    }

    pub fn with_backfill(mut self, enabled: bool) -> Self {
        self.backfill_membership_history = enabled;
        self
    }

    /// Run one reconciliation pass for `network_id`.
    ///
    /// Fails only when the roster itself cannot be read or storage is down.
    pub async fn reconcile(&self, network_id: NetworkId) -> Result<ReconcileSummary, WatchError> {
        let height = self.oracle.current_height().await?;
        let epoch = self.oracle.epoch_at(height).await?;
        let mut summary = ReconcileSummary { height, epoch, ..Default::default() };

        let group_addresses = self.oracle.registered_addresses(EntityKind::Group).await?;
        let validator_addresses = self.oracle.registered_addresses(EntityKind::Validator).await?;
        tracing::info!(
            height,
            epoch,
            groups = group_addresses.len(),
            validators = validator_addresses.len(),
            "reconciling registry"
        );

        summary.groups_inserted = self
            .store
            .insert_entities(network_id, EntityKind::Group, &group_addresses)
            .await?;
        summary.validators_inserted = self
            .store
            .insert_entities(network_id, EntityKind::Validator, &validator_addresses)
            .await?;

        let validators = self
            .store
            .entities_by_addresses(network_id, EntityKind::Validator, &validator_addresses)
            .await?;
        let mut group_index =
            AddressIndex::new(self.store.entities(network_id, EntityKind::Group).await?);

        for validator in &validators {
            let synced = self
                .sync_validator(network_id, validator, height, epoch, &mut group_index, &mut summary)
                .await;
            if let Err((stage, e)) = synced {
                skip(&mut summary, &validator.address, stage, e)?;
            }
        }

        let mut validator_index = AddressIndex::new(validators);
        let groups = self
            .store
            .entities_by_addresses(network_id, EntityKind::Group, &group_addresses)
            .await?;
        for group in &groups {
            self.sync_group(network_id, group, epoch, &mut validator_index, &mut summary)
                .await?;
        }

        tracing::info!(
            height,
            epoch,
            inserted = summary.inserted(),
            updated = summary.updated(),
            failures = summary.failures.len(),
            "reconciliation complete"
        );
        Ok(summary)
    }

    async fn sync_validator(
        &self,
        network_id: NetworkId,
        validator: &Entity,
        height: u64,
        epoch: u64,
        groups: &mut AddressIndex,
        summary: &mut ReconcileSummary,
    ) -> StageResult<()> {
        let name = self
            .oracle
            .display_name(&validator.address, height)
            .await
            .map_err(|e| ("name", e))?;
        if let Some(name) = name {
            let changed = self
                .record_if_changed(network_id, validator.id, FactValue::Name(name), height)
                .await
                .map_err(|e| ("name", e))?;
            if changed {
                summary.names_recorded += 1;
            }
        }

        let url = self
            .oracle
            .endpoint_url(&validator.address)
            .await
            .map_err(|e| ("endpoint", e))?
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty());
        if url != validator.endpoint_url {
            self.store
                .set_endpoint(validator.id, url.as_deref())
                .await
                .map_err(|e| ("endpoint", e))?;
            tracing::debug!(address = %validator.address, url = ?url, "endpoint updated");
            summary.endpoints_updated += 1;
        }

        if self.backfill_membership_history {
            summary.memberships_backfilled += self
                .backfill_membership(network_id, validator, epoch, groups)
                .await
                .map_err(|e| ("backfill", e))?;
        }
        Ok(())
    }

    /// Replay on-chain membership history for a validator with none stored.
    async fn backfill_membership(
        &self,
        network_id: NetworkId,
        validator: &Entity,
        epoch: u64,
        groups: &mut AddressIndex,
    ) -> Result<usize, WatchError> {
        let stored = self
            .store
            .history(network_id, FactKind::GroupMembership, validator.id)
            .await?;
        if !stored.is_empty() {
            return Ok(0);
        }

        // Later entries for the same epoch win.
        let mut by_epoch: BTreeMap<u64, String> = BTreeMap::new();
        for entry in self.oracle.membership_history(&validator.address).await? {
            if entry.epoch <= epoch && !is_zero_address(&entry.group) {
                by_epoch.insert(entry.epoch, entry.group);
            }
        }

        let mut recorded = 0;
        for (at, group_address) in by_epoch {
            let group_id = match groups.get(&group_address) {
                Some(g) => g.id,
                None => {
                    let group = self.ensure_entity(network_id, EntityKind::Group, &group_address).await?;
                    let id = group.id;
                    groups.insert(group);
                    id
                }
            };
            if self
                .record_if_changed(network_id, validator.id, FactValue::Group(group_id), at)
                .await?
            {
                recorded += 1;
            }
        }
        if recorded > 0 {
            tracing::debug!(address = %validator.address, recorded, "membership history backfilled");
        }
        Ok(recorded)
    }

    async fn sync_group(
        &self,
        network_id: NetworkId,
        group: &Entity,
        epoch: u64,
        validators: &mut AddressIndex,
        summary: &mut ReconcileSummary,
    ) -> Result<(), WatchError> {
        let roster = match self.oracle.group_roster(&group.address, true).await {
            Ok(roster) => roster,
            Err(e) => return skip(summary, &group.address, "roster", e),
        };

        let name = roster.name.as_deref().map(str::trim).filter(|n| !n.is_empty());
        if name != group.display_name.as_deref() {
            self.store.set_display_name(group.id, name).await?;
            summary.group_names_updated += 1;
        }

        let missing: Vec<String> = roster
            .members
            .iter()
            .filter(|m| validators.get(m).is_none())
            .cloned()
            .collect();
        if !missing.is_empty() {
            summary.validators_inserted += self
                .store
                .insert_entities(network_id, EntityKind::Validator, &missing)
                .await?;
            for v in self
                .store
                .entities_by_addresses(network_id, EntityKind::Validator, &missing)
                .await?
            {
                validators.insert(v);
            }
        }

        for member in &roster.members {
            let Some(validator) = validators.get(member) else {
                continue;
            };
            match self
                .record_if_changed(network_id, validator.id, FactValue::Group(group.id), epoch)
                .await
            {
                Ok(true) => summary.memberships_recorded += 1,
                Ok(false) => {}
                Err(e) => skip(summary, &validator.address, "membership", e)?,
            }
        }
        Ok(())
    }

    /// Record `value` at `at` unless the fact already in effect there carries it.
    ///
    /// A change observed at a point whose slot is already taken (a second
    /// membership change within one epoch) keeps the stored fact and reports
    /// `false`; the next epoch records it.
    async fn record_if_changed(
        &self,
        network_id: NetworkId,
        entity_id: EntityId,
        value: FactValue,
        at: u64,
    ) -> Result<bool, WatchError> {
        let current = self.store.fact_at(network_id, value.kind(), entity_id, at).await?;
        if current.as_ref().map(|f| &f.value) == Some(&value) {
            return Ok(false);
        }
        let id = self.store.record_fact(network_id, entity_id, &value, at).await?;
        if current.as_ref().map(|f| f.id) == Some(id) {
            tracing::debug!(entity_id, value = %value, at, "slot taken, change deferred");
            return Ok(false);
        }
        tracing::debug!(entity_id, value = %value, at, "fact recorded");
        Ok(true)
    }

    async fn ensure_entity(
        &self,
        network_id: NetworkId,
        kind: EntityKind,
        address: &str,
    ) -> Result<Entity, WatchError> {
        let addresses = [address.to_string()];
        self.store.insert_entities(network_id, kind, &addresses).await?;
        self.store
            .entities_by_addresses(network_id, kind, &addresses)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| WatchError::Storage(format!("{kind} {address} missing after insert")))
    }
}

/// Record a skipped entity. Storage outages are not skippable and propagate.
fn skip(
    summary: &mut ReconcileSummary,
    address: &str,
    stage: &'static str,
    error: WatchError,
) -> Result<(), WatchError> {
    if matches!(error, WatchError::Storage(_)) {
        return Err(error);
    }
    tracing::warn!(address, stage, error = %error, "skipping entity");
    summary.failures.push(EntityFailure {
        address: address.to_string(),
        stage: stage.to_string(),
        reason: error.to_string(),
    });
    Ok(())
}
