//! `eth_blockNumber` liveness check over plain HTTP.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rpcwatch_core::{LivenessProbe, ProbeOutcome};

use crate::error::TransportError;
use crate::rpc::{parse_hex_u64, JsonRpcRequest, JsonRpcResponse};

/// Posts a single `eth_blockNumber` request and classifies the reply.
///
/// The endpoint is up only when it answers 2xx with a parseable hex height.
/// Everything else is down:
/// - request timeout: status 408
/// - no HTTP response at all: status 500
/// - non-2xx status, unparseable body, JSON-RPC error or bad result: that status
pub struct HttpLivenessProbe {
    http: reqwest::Client,
}

impl HttpLivenessProbe {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl LivenessProbe for HttpLivenessProbe {
    async fn check(&self, url: &str) -> ProbeOutcome {
        let started = Instant::now();
        let resp = match self.http.post(url).json(&JsonRpcRequest::block_number()).send().await {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                tracing::debug!(url, "probe timed out");
                return ProbeOutcome::timed_out();
            }
            Err(e) => {
                tracing::debug!(url, error = %e, "probe transport failure");
                return ProbeOutcome::down(ProbeOutcome::TRANSPORT_ERROR_STATUS);
            }
        };

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            return ProbeOutcome::down(status);
        }
        match resp.bytes().await {
            Ok(body) => classify_body(status, &body, started.elapsed()),
            Err(e) if e.is_timeout() => ProbeOutcome::timed_out(),
            Err(_) => ProbeOutcome::down(status),
        }
    }
}

/// Classify a 2xx reply body.
pub fn classify_body(status: u16, body: &[u8], latency: Duration) -> ProbeOutcome {
    let Ok(resp) = serde_json::from_slice::<JsonRpcResponse>(body) else {
        return ProbeOutcome::down(status);
    };
    match resp.into_result() {
        Ok(value) => match value.as_str().and_then(parse_hex_u64) {
            Some(height) => ProbeOutcome::up(height, status, latency),
            None => ProbeOutcome::down(status),
        },
        Err(_) => ProbeOutcome::down(status),
    }
}
