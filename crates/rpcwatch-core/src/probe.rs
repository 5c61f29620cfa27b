//! Health prober: concurrent, timeout-bounded liveness checks.
//!
//! Every probe is isolated. A hung or failing endpoint only affects its own
//! result; the prober always returns exactly one [`ProbeResult`] per target.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use crate::types::EntityId;

/// The outcome of one liveness check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub up: bool,
    /// Height reported by the endpoint (set only when `up`).
    pub height: Option<u64>,
    /// HTTP status, or one of the synthetic codes below. `None` when no
    /// request was made.
    pub http_status: Option<u16>,
    /// Round-trip time in whole milliseconds (set only when `up`).
    pub latency_ms: Option<u64>,
}

impl ProbeOutcome {
    /// Status recorded when the probe exceeded its timeout.
    pub const TIMEOUT_STATUS: u16 = 408;
    /// Status recorded when the transport failed without an HTTP response.
    pub const TRANSPORT_ERROR_STATUS: u16 = 500;

    pub fn up(height: u64, http_status: u16, latency: Duration) -> Self {
        Self {
            up: true,
            height: Some(height),
            http_status: Some(http_status),
            latency_ms: Some(round_ms(latency)),
        }
    }

    pub fn down(http_status: u16) -> Self {
        Self { up: false, height: None, http_status: Some(http_status), latency_ms: None }
    }

    pub fn timed_out() -> Self {
        Self::down(Self::TIMEOUT_STATUS)
    }

    /// Down without a request (no endpoint configured).
    pub fn unreachable() -> Self {
        Self { up: false, height: None, http_status: None, latency_ms: None }
    }
}

fn round_ms(d: Duration) -> u64 {
    (d.as_micros() as u64 + 500) / 1_000
}

/// A single liveness check against one URL.
///
/// Implementations map every failure into a down [`ProbeOutcome`]; the
/// timeout is applied by [`HealthProber`].
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn check(&self, url: &str) -> ProbeOutcome;
}

/// An entity scheduled for probing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeTarget {
    pub entity_id: EntityId,
    pub address: String,
    pub endpoint_url: Option<String>,
}

impl ProbeTarget {
    /// The endpoint to probe, ignoring empty strings.
    pub fn url(&self) -> Option<&str> {
        self.endpoint_url.as_deref().map(str::trim).filter(|u| !u.is_empty())
    }
}

/// One probed entity's result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub entity_id: EntityId,
    pub address: String,
    /// The URL actually probed, if any.
    pub endpoint_url: Option<String>,
    pub outcome: ProbeOutcome,
}

/// Fans probes out over all targets.
pub struct HealthProber {
    probe: Arc<dyn LivenessProbe>,
    timeout: Duration,
    /// Upper bound on in-flight probes; `None` runs every probe at once.
    concurrency: Option<usize>,
}

impl HealthProber {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(probe: Arc<dyn LivenessProbe>) -> Self {
        Self { probe, timeout: Self::DEFAULT_TIMEOUT, concurrency: None }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_concurrency(mut self, limit: Option<usize>) -> Self {
        self.concurrency = limit.filter(|n| *n > 0);
        self
    }

    /// Probe every target. Output order is not guaranteed; cardinality is.
    pub async fn probe(&self, targets: Vec<ProbeTarget>) -> Vec<ProbeResult> {
        let limit = self.concurrency.unwrap_or(targets.len()).max(1);
        let results: Vec<ProbeResult> = stream::iter(targets)
            .map(|target| self.probe_one(target))
            .buffer_unordered(limit)
            .collect()
            .await;

        let up = results.iter().filter(|r| r.outcome.up).count();
        tracing::info!(probed = results.len(), up, down = results.len() - up, "probe fan-out complete");
        results
    }

    async fn probe_one(&self, target: ProbeTarget) -> ProbeResult {
        let Some(url) = target.url().map(str::to_string) else {
            tracing::debug!(address = %target.address, "no endpoint configured, skipping request");
            return ProbeResult {
                entity_id: target.entity_id,
                address: target.address,
                endpoint_url: None,
                outcome: ProbeOutcome::unreachable(),
            };
        };

        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.timeout, self.probe.check(&url)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(
                    address = %target.address,
                    url = %url,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "probe timed out"
                );
                ProbeOutcome::timed_out()
            }
        };
        if !outcome.up {
            tracing::debug!(
                address = %target.address,
                url = %url,
                status = ?outcome.http_status,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "endpoint down"
            );
        }

        ProbeResult {
            entity_id: target.entity_id,
            address: target.address,
            endpoint_url: Some(url),
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted probe: `hang` URLs never answer, `fail` URLs return 503.
    struct ScriptedProbe {
        hang: Vec<String>,
        fail: Vec<String>,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(hang: &[&str], fail: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                hang: hang.iter().map(|s| s.to_string()).collect(),
                fail: fail.iter().map(|s| s.to_string()).collect(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LivenessProbe for ScriptedProbe {
        async fn check(&self, url: &str) -> ProbeOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang.iter().any(|u| u == url) {
                std::future::pending::<()>().await;
            }
            if self.fail.iter().any(|u| u == url) {
                return ProbeOutcome::down(503);
            }
            ProbeOutcome::up(1_000, 200, Duration::from_millis(12))
        }
    }

    fn target(id: EntityId, url: Option<&str>) -> ProbeTarget {
        ProbeTarget {
            entity_id: id,
            address: format!("0x{id:040x}"),
            endpoint_url: url.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn no_endpoint_means_down_without_request() {
        let probe = ScriptedProbe::new(&[], &[]);
        let prober = HealthProber::new(probe.clone());
        let results = prober.probe(vec![target(1, None), target(2, Some("  "))]).await;

        assert_eq!(results.len(), 2);
        for r in &results {
            assert_eq!(r.outcome, ProbeOutcome::unreachable());
            assert!(r.endpoint_url.is_none());
        }
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_isolated_and_marked_distinctly() {
        let probe = ScriptedProbe::new(&["http://slow"], &["http://broken"]);
        let prober = HealthProber::new(probe.clone()).with_timeout(Duration::from_secs(5));
        let started = tokio::time::Instant::now();

        let results = prober
            .probe(vec![
                target(1, Some("http://a")),
                target(2, Some("http://slow")),
                target(3, Some("http://broken")),
                target(4, Some("http://b")),
            ])
            .await;

        assert_eq!(results.len(), 4);
        assert!(started.elapsed() <= Duration::from_secs(6));
        let by_id: HashMap<EntityId, &ProbeResult> =
            results.iter().map(|r| (r.entity_id, r)).collect();
        assert!(by_id[&1].outcome.up);
        assert!(by_id[&4].outcome.up);
        assert_eq!(by_id[&2].outcome.http_status, Some(ProbeOutcome::TIMEOUT_STATUS));
        assert!(!by_id[&2].outcome.up);
        assert_eq!(by_id[&3].outcome.http_status, Some(503));
        assert_eq!(by_id[&2].endpoint_url.as_deref(), Some("http://slow"));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_concurrency_still_probes_everything() {
        let probe = ScriptedProbe::new(&[], &[]);
        let prober = HealthProber::new(probe.clone()).with_concurrency(Some(2));
        let targets = (1..=7).map(|i| target(i, Some("http://ok"))).collect();

        let results = prober.probe(targets).await;
        assert_eq!(results.len(), 7);
        assert!(results.iter().all(|r| r.outcome.up));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn empty_target_list() {
        let prober = HealthProber::new(ScriptedProbe::new(&[], &[]));
        assert!(prober.probe(Vec::new()).await.is_empty());
    }

    #[test]
    fn latency_rounds_to_nearest_ms() {
        assert_eq!(ProbeOutcome::up(1, 200, Duration::from_micros(12_499)).latency_ms, Some(12));
        assert_eq!(ProbeOutcome::up(1, 200, Duration::from_micros(12_500)).latency_ms, Some(13));
    }
}
