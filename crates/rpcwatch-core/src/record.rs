//! Measurement recorder: commits one probe cycle.
//!
//! The header is written first. Results and snapshots reference its id, so a
//! failed header insert leaves nothing behind. A failure after the header is
//! reported as [`WatchError::IncompleteRun`]; the header stays.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WatchError;
use crate::probe::ProbeResult;
use crate::store::Storage;
use crate::types::{HeaderId, NetworkId, NewMeasurement, NewSnapshot, RunHeader};

/// What was written for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedRun {
    pub header: RunHeader,
    pub results: usize,
    pub snapshots: usize,
}

impl RecordedRun {
    pub fn header_id(&self) -> HeaderId {
        self.header.id
    }
}

pub struct MeasurementRecorder {
    store: Arc<dyn Storage>,
}

impl MeasurementRecorder {
    pub fn new(store: Arc<dyn Storage>) -> Self {
        Self { store }
    }

    /// Write the header, then every result and a snapshot per probed URL.
    ///
    /// Re-recording an existing `run_id` reuses its header.
    pub async fn record(
        &self,
        network_id: NetworkId,
        run_id: &str,
        executed_at: DateTime<Utc>,
        results: &[ProbeResult],
    ) -> Result<RecordedRun, WatchError> {
        let header = match self.store.insert_run_header(network_id, run_id, executed_at).await {
            Ok(header) => header,
            Err(e) if e.is_conflict() => {
                tracing::debug!(run_id, "run header exists, re-reading");
                self.store
                    .run_header(network_id, run_id)
                    .await?
                    .ok_or_else(|| WatchError::Storage(format!("run header {run_id} vanished")))?
            }
            Err(e) => return Err(e),
        };

        let rows: Vec<NewMeasurement> = results
            .iter()
            .map(|r| NewMeasurement {
                network_id,
                entity_id: r.entity_id,
                header_id: header.id,
                up: r.outcome.up,
                height: r.outcome.height,
                http_status: r.outcome.http_status,
                latency_ms: r.outcome.latency_ms,
            })
            .collect();

        let snapshots: Vec<NewSnapshot> = results
            .iter()
            .filter_map(|r| {
                r.endpoint_url.as_ref().map(|url| NewSnapshot {
                    network_id,
                    entity_id: r.entity_id,
                    header_id: header.id,
                    endpoint_url: url.clone(),
                })
            })
            .collect();

        let incomplete = |stage: &str, e: WatchError| WatchError::IncompleteRun {
            run_id: run_id.to_string(),
            header_id: header.id,
            reason: format!("{stage}: {e}"),
        };

        self.store
            .insert_results(&rows)
            .await
            .map_err(|e| incomplete("results", e))?;
        self.store
            .insert_snapshots(&snapshots)
            .await
            .map_err(|e| incomplete("snapshots", e))?;

        tracing::info!(
            run_id,
            header_id = header.id,
            results = rows.len(),
            snapshots = snapshots.len(),
            "run recorded"
        );

        Ok(RecordedRun { header, results: rows.len(), snapshots: snapshots.len() })
    }
}
