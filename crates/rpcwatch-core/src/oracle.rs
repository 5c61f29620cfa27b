//! Read-only access to on-chain registry state.
//!
//! The watcher never writes to the chain; it treats these reads as the source
//! of truth for the roster, names, memberships and endpoints.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::WatchError;
use crate::types::EntityKind;

/// A group's display name and (optionally) its member validators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRoster {
    pub name: Option<String>,
    pub members: Vec<String>,
}

/// One entry of a validator's on-chain membership history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEntry {
    pub epoch: u64,
    pub group: String,
}

/// Read-only chain capability consumed by the reconciler and driver.
#[async_trait]
pub trait ChainOracle: Send + Sync {
    /// Every registered address of `kind`.
    async fn registered_addresses(&self, kind: EntityKind) -> Result<Vec<String>, WatchError>;

    async fn current_height(&self) -> Result<u64, WatchError>;

    async fn epoch_at(&self, height: u64) -> Result<u64, WatchError>;

    /// Display name as of `height`; `None` when unset.
    async fn display_name(&self, address: &str, height: u64)
        -> Result<Option<String>, WatchError>;

    async fn group_roster(
        &self,
        group: &str,
        include_members: bool,
    ) -> Result<GroupRoster, WatchError>;

    async fn membership_history(&self, validator: &str)
        -> Result<Vec<MembershipEntry>, WatchError>;

    /// Map a consensus signer to its validator account address.
    async fn signer_to_entity(&self, signer: &str) -> Result<String, WatchError>;

    /// Signers of the currently elected set.
    async fn current_live_set(&self) -> Result<Vec<String>, WatchError>;

    /// The validator's advertised RPC endpoint; `None` when unset.
    async fn endpoint_url(&self, address: &str) -> Result<Option<String>, WatchError>;
}

// ─── FallbackOracle ──────────────────────────────────────────────────────────

/// Tries `primary` first and repeats a failed read once against `secondary`.
pub struct FallbackOracle<P, S> {
    primary: P,
    secondary: S,
}

impl<P: ChainOracle, S: ChainOracle> FallbackOracle<P, S> {
    pub fn new(primary: P, secondary: S) -> Self {
        Self { primary, secondary }
    }
}

macro_rules! with_fallback {
    ($op:literal, $primary:expr, $secondary:expr) => {
        match $primary.await {
            Ok(v) => Ok(v),
            Err(e) => {
                tracing::warn!(error = %e, op = $op, "primary node read failed, trying fallback");
                $secondary.await
            }
        }
    };
}

#[async_trait]
impl<P: ChainOracle, S: ChainOracle> ChainOracle for FallbackOracle<P, S> {
    async fn registered_addresses(&self, kind: EntityKind) -> Result<Vec<String>, WatchError> {
        with_fallback!(
            "registered_addresses",
            self.primary.registered_addresses(kind),
            self.secondary.registered_addresses(kind)
        )
    }

    async fn current_height(&self) -> Result<u64, WatchError> {
        with_fallback!(
            "current_height",
            self.primary.current_height(),
            self.secondary.current_height()
        )
    }

    async fn epoch_at(&self, height: u64) -> Result<u64, WatchError> {
        with_fallback!(
            "epoch_at",
            self.primary.epoch_at(height),
            self.secondary.epoch_at(height)
        )
    }

    async fn display_name(
        &self,
        address: &str,
        height: u64,
    ) -> Result<Option<String>, WatchError> {
        with_fallback!(
            "display_name",
            self.primary.display_name(address, height),
            self.secondary.display_name(address, height)
        )
    }

    async fn group_roster(
        &self,
        group: &str,
        include_members: bool,
    ) -> Result<GroupRoster, WatchError> {
        with_fallback!(
            "group_roster",
            self.primary.group_roster(group, include_members),
            self.secondary.group_roster(group, include_members)
        )
    }

    async fn membership_history(
        &self,
        validator: &str,
    ) -> Result<Vec<MembershipEntry>, WatchError> {
        with_fallback!(
            "membership_history",
            self.primary.membership_history(validator),
            self.secondary.membership_history(validator)
        )
    }

    async fn signer_to_entity(&self, signer: &str) -> Result<String, WatchError> {
        with_fallback!(
            "signer_to_entity",
            self.primary.signer_to_entity(signer),
            self.secondary.signer_to_entity(signer)
        )
    }

    async fn current_live_set(&self) -> Result<Vec<String>, WatchError> {
        with_fallback!(
            "current_live_set",
            self.primary.current_live_set(),
            self.secondary.current_live_set()
        )
    }

    async fn endpoint_url(&self, address: &str) -> Result<Option<String>, WatchError> {
        with_fallback!(
            "endpoint_url",
            self.primary.endpoint_url(address),
            self.secondary.endpoint_url(address)
        )
    }
}

#[async_trait]
impl<T: ChainOracle + ?Sized> ChainOracle for std::sync::Arc<T> {
    async fn registered_addresses(&self, kind: EntityKind) -> Result<Vec<String>, WatchError> {
        (**self).registered_addresses(kind).await
    }
    async fn current_height(&self) -> Result<u64, WatchError> {
        (**self).current_height().await
    }
    async fn epoch_at(&self, height: u64) -> Result<u64, WatchError> {
        (**self).epoch_at(height).await
    }
    async fn display_name(
        &self,
        address: &str,
        height: u64,
    ) -> Result<Option<String>, WatchError> {
        (**self).display_name(address, height).await
    }
    async fn group_roster(
        &self,
        group: &str,
        include_members: bool,
    ) -> Result<GroupRoster, WatchError> {
        (**self).group_roster(group, include_members).await
    }
    async fn membership_history(
        &self,
        validator: &str,
    ) -> Result<Vec<MembershipEntry>, WatchError> {
        (**self).membership_history(validator).await
    }
    async fn signer_to_entity(&self, signer: &str) -> Result<String, WatchError> {
        (**self).signer_to_entity(signer).await
    }
    async fn current_live_set(&self) -> Result<Vec<String>, WatchError> {
        (**self).current_live_set().await
    }
    async fn endpoint_url(&self, address: &str) -> Result<Option<String>, WatchError> {
        (**self).endpoint_url(address).await
    }
}
