//! Validator identity metadata: the off-chain document an account points to
//! with its metadata URL. The RPC endpoint is advertised as an `RPC_URL` claim.

use std::time::Duration;

use serde::Deserialize;

use crate::error::TransportError;

const RPC_URL_CLAIM: &str = "RPC_URL";

#[derive(Debug, Deserialize)]
struct MetadataDocument {
    #[serde(default)]
    claims: Vec<Claim>,
}

#[derive(Debug, Deserialize)]
struct Claim {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "rpcUrl", default)]
    rpc_url: Option<String>,
}

/// Extract the advertised RPC URL from a metadata document.
///
/// Claim signatures are not verified. The first non-empty `RPC_URL` claim wins.
pub fn rpc_url_from_metadata(body: &[u8]) -> Result<Option<String>, TransportError> {
    let doc: MetadataDocument = serde_json::from_slice(body)?;
    Ok(doc
        .claims
        .into_iter()
        .filter(|c| c.kind == RPC_URL_CLAIM)
        .filter_map(|c| c.rpc_url)
        .map(|u| u.trim().to_string())
        .find(|u| !u.is_empty()))
}

/// Fetches metadata documents over HTTP.
pub struct MetadataClient {
    http: reqwest::Client,
}

impl MetadataClient {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http })
    }

    pub async fn rpc_url(&self, metadata_url: &str) -> Result<Option<String>, TransportError> {
        let resp = self
            .http
            .get(metadata_url)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(TransportError::Http(format!(
                "HTTP {} fetching {metadata_url}",
                resp.status().as_u16()
            )));
        }
        let body = resp.bytes().await.map_err(|e| TransportError::Http(e.to_string()))?;
        rpc_url_from_metadata(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_rpc_url_claim() {
        let body = br#"{
            "claims": [
                {"type": "NAME", "name": "Alice", "timestamp": 1},
                {"type": "RPC_URL", "rpcUrl": "  https://rpc.alice.example  ", "timestamp": 2}
            ],
            "meta": {"address": "0x01", "signature": "0x02"}
        }"#;
        assert_eq!(
            rpc_url_from_metadata(body).unwrap().as_deref(),
            Some("https://rpc.alice.example")
        );
    }

    #[test]
    fn missing_or_blank_claim_is_none() {
        assert_eq!(rpc_url_from_metadata(br#"{"claims": []}"#).unwrap(), None);
        assert_eq!(rpc_url_from_metadata(br#"{}"#).unwrap(), None);
        assert_eq!(
            rpc_url_from_metadata(br#"{"claims":[{"type":"RPC_URL","rpcUrl":" "}]}"#).unwrap(),
            None
        );
    }

    #[test]
    fn malformed_document_is_an_error() {
        assert!(rpc_url_from_metadata(b"not json").is_err());
    }
}
