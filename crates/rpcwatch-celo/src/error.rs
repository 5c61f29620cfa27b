//! Transport-level error types.

use rpcwatch_core::WatchError;
use thiserror::Error;

use crate::rpc::JsonRpcError;

/// Errors that can occur while talking to a node or fetching metadata.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed (connection refused, reset, non-2xx status).
    #[error("HTTP error: {0}")]
    Http(String),

    /// JSON-RPC protocol-level error returned by the node.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    /// Request timed out after the configured duration.
    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Response could not be deserialized.
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// Call data could not be encoded or return data decoded.
    #[error("ABI error: {0}")]
    Abi(String),
}

impl TransportError {
    /// Returns `true` if this error is retryable (transient).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Timeout { .. })
    }
}

impl From<TransportError> for WatchError {
    fn from(e: TransportError) -> Self {
        WatchError::Rpc(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(TransportError::Http("connection reset".into()).is_retryable());
        assert!(TransportError::Timeout { ms: 5000 }.is_retryable());
        let reverted = TransportError::Rpc(JsonRpcError {
            code: 3,
            message: "execution reverted".into(),
            data: None,
        });
        assert!(!reverted.is_retryable());
        assert!(!TransportError::Abi("short return data".into()).is_retryable());
    }

    #[test]
    fn converts_to_transient_watch_error() {
        let err: WatchError = TransportError::Http("HTTP 502".into()).into();
        assert!(err.is_transient());
    }
}
