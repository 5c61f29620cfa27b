//! Cycle driver: the single control loop.
//!
//! ```text
//! WaitForChainReady ─▶ Reconcile ─▶ Probe ─▶ Record ─▶ Sleep
//!                          ▲                              │
//!                          └──────────────────────────────┘
//! ```
//!
//! `WaitForChainReady` runs once at startup. A failed cycle is logged and the
//! loop sleeps until the next aligned boundary.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::backoff::RetryPolicy;
use crate::config::{ProbeScope, WatchConfig};
use crate::error::WatchError;
use crate::oracle::ChainOracle;
use crate::probe::{HealthProber, LivenessProbe, ProbeTarget};
use crate::reconcile::{ReconcileSummary, Reconciler};
use crate::record::MeasurementRecorder;
use crate::store::Storage;
use crate::types::{Entity, EntityKind, Network};

/// Where the control loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverState {
    WaitForChainReady,
    Reconcile,
    Probe,
    Record,
    Sleep,
}

impl std::fmt::Display for DriverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WaitForChainReady => write!(f, "wait-for-chain-ready"),
            Self::Reconcile => write!(f, "reconcile"),
            Self::Probe => write!(f, "probe"),
            Self::Record => write!(f, "record"),
            Self::Sleep => write!(f, "sleep"),
        }
    }
}

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Reconciled, probed and fully recorded.
    Complete,
    /// Reconciliation failed upstream; probed the stored roster instead.
    Degraded { reason: String },
    /// Header written but results or snapshots were not.
    Incomplete { reason: String },
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub run_id: String,
    pub executed_at: DateTime<Utc>,
    pub summary: Option<ReconcileSummary>,
    pub probed: usize,
    pub up: usize,
    pub down: usize,
    pub outcome: CycleOutcome,
}

/// Delay from `now_ms` (unix millis) to the next multiple of `interval`.
///
/// Exactly on a boundary the full interval is returned, so a cycle that
/// finished instantly does not run twice for the same slot.
pub fn delay_until_next_boundary(now_ms: i64, interval: Duration) -> Duration {
    let interval_ms = (interval.as_millis() as i64).max(1);
    let rem = now_ms.rem_euclid(interval_ms);
    Duration::from_millis((interval_ms - rem) as u64)
}

pub struct CycleDriver {
    network: Network,
    oracle: Arc<dyn ChainOracle>,
    store: Arc<dyn Storage>,
    reconciler: Reconciler,
    prober: HealthProber,
    recorder: MeasurementRecorder,
    scope: ProbeScope,
    min_start_height: u64,
    interval: Duration,
    chain_ready_backoff: RetryPolicy,
    state: DriverState,
}

impl CycleDriver {
    pub fn new(
        config: &WatchConfig,
        network: Network,
        oracle: Arc<dyn ChainOracle>,
        store: Arc<dyn Storage>,
        probe: Arc<dyn LivenessProbe>,
    ) -> Self {
        let reconciler = Reconciler::new(oracle.clone(), store.clone())
            .with_backfill(config.backfill_membership_history);
        let prober = HealthProber::new(probe)
            .with_timeout(config.probe_timeout())
            .with_concurrency(config.probe_concurrency);
        Self {
            network,
            reconciler,
            prober,
            recorder: MeasurementRecorder::new(store.clone()),
            oracle,
            store,
            scope: config.probe_scope,
            min_start_height: config.min_start_height,
            interval: config.interval(),
            chain_ready_backoff: RetryPolicy::capped(config.chain_ready_poll()),
            state: DriverState::WaitForChainReady,
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Block until the chain reports a height at or beyond the configured minimum.
    pub async fn wait_for_chain_ready(&mut self) -> u64 {
        self.state = DriverState::WaitForChainReady;
        let mut attempt = 0u32;
        loop {
            match self.oracle.current_height().await {
                Ok(height) if height >= self.min_start_height => {
                    tracing::info!(height, min = self.min_start_height, "chain ready");
                    return height;
                }
                Ok(height) => {
                    tracing::info!(height, min = self.min_start_height, "waiting for start height");
                }
                Err(e) => tracing::warn!(error = %e, "height read failed while waiting for chain"),
            }
            attempt = attempt.saturating_add(1);
            let delay = self
                .chain_ready_backoff
                .next_delay(attempt)
                .unwrap_or(self.chain_ready_backoff.config.max_backoff);
            tokio::time::sleep(delay).await;
        }
    }

    /// Run one reconcile → probe → record cycle.
    ///
    /// Upstream failures degrade the cycle; a failed header insert or a
    /// storage outage fails it.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, WatchError> {
        let executed_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("cycle", run_id = %run_id, network = %self.network.name);
        self.cycle(run_id, executed_at).instrument(span).await
    }

    async fn cycle(
        &mut self,
        run_id: String,
        executed_at: DateTime<Utc>,
    ) -> Result<CycleReport, WatchError> {
        self.state = DriverState::Reconcile;
        let (summary, degraded) = match self.reconciler.reconcile(self.network.id).await {
            Ok(summary) => (Some(summary), None),
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, "reconciliation skipped, probing stored roster");
                (None, Some(e.to_string()))
            }
            Err(e) => return Err(e),
        };

        self.state = DriverState::Probe;
        let targets = self.probe_targets().await?;
        let results = self.prober.probe(targets).await;
        let up = results.iter().filter(|r| r.outcome.up).count();

        self.state = DriverState::Record;
        let outcome = match self
            .recorder
            .record(self.network.id, &run_id, executed_at, &results)
            .await
        {
            Ok(_) => match degraded {
                Some(reason) => CycleOutcome::Degraded { reason },
                None => CycleOutcome::Complete,
            },
            Err(e @ WatchError::IncompleteRun { .. }) => {
                tracing::error!(error = %e, "run recorded incompletely");
                CycleOutcome::Incomplete { reason: e.to_string() }
            }
            Err(e) => return Err(e),
        };

        Ok(CycleReport {
            run_id,
            executed_at,
            summary,
            probed: results.len(),
            up,
            down: results.len() - up,
            outcome,
        })
    }

    /// The validators to probe this cycle, per the configured scope.
    pub async fn probe_targets(&self) -> Result<Vec<ProbeTarget>, WatchError> {
        let entities = match self.scope {
            ProbeScope::Registered => {
                self.store.entities(self.network.id, EntityKind::Validator).await?
            }
            ProbeScope::Elected => match self.elected_addresses().await {
                Some(addresses) => {
                    self.store
                        .entities_by_addresses(self.network.id, EntityKind::Validator, &addresses)
                        .await?
                }
                None => self.store.entities(self.network.id, EntityKind::Validator).await?,
            },
        };
        Ok(entities.into_iter().map(to_target).collect())
    }

    /// Elected signers mapped to accounts; `None` if the set cannot be read.
    async fn elected_addresses(&self) -> Option<Vec<String>> {
        let signers = match self.oracle.current_live_set().await {
            Ok(signers) => signers,
            Err(e) => {
                tracing::warn!(error = %e, "live set unavailable, probing all registered validators");
                return None;
            }
        };
        let mut addresses = Vec::with_capacity(signers.len());
        for signer in signers {
            match self.oracle.signer_to_entity(&signer).await {
                Ok(address) => addresses.push(address),
                Err(e) => tracing::warn!(signer = %signer, error = %e, "unmapped signer skipped"),
            }
        }
        Some(addresses)
    }

    /// Wait for the chain, then cycle on aligned boundaries until `shutdown` resolves.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<(), WatchError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        tokio::select! {
            _ = self.wait_for_chain_ready() => {}
            _ = &mut shutdown => {
                tracing::info!("shutdown requested before chain was ready");
                return Ok(());
            }
        }

        loop {
            match self.run_cycle().await {
                Ok(report) => tracing::info!(
                    run_id = %report.run_id,
                    probed = report.probed,
                    up = report.up,
                    down = report.down,
                    outcome = ?report.outcome,
                    "cycle finished"
                ),
                Err(e) => tracing::error!(error = %e, "cycle aborted"),
            }

            self.state = DriverState::Sleep;
            let delay = delay_until_next_boundary(Utc::now().timestamp_millis(), self.interval);
            tracing::debug!(delay_ms = delay.as_millis() as u64, "sleeping until next boundary");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested, stopping");
                    return Ok(());
                }
            }
        }
    }
}

fn to_target(entity: Entity) -> ProbeTarget {
    ProbeTarget {
        entity_id: entity.id,
        address: entity.address,
        endpoint_url: entity.endpoint_url,
    }
}
