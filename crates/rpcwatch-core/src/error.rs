//! Error types for the rpcwatch pipeline.

use thiserror::Error;

/// Errors that can occur while reconciling, probing or recording.
#[derive(Debug, Error)]
pub enum WatchError {
    /// Chain RPC read failed (transient upstream).
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Liveness probe could not be executed (transient upstream).
    #[error("Probe error for {url}: {reason}")]
    Probe { url: String, reason: String },

    /// Duplicate key on insert. Callers recover by re-reading the existing row.
    #[error("Storage conflict: {0}")]
    Conflict(String),

    /// Storage backend unavailable or query failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Startup configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An observation older than the latest stored interval for the entity.
    #[error("Fact for entity {entity_id} at {effective_from} precedes open interval starting at {latest_from}")]
    OutOfOrderFact {
        entity_id: i64,
        effective_from: u64,
        latest_from: u64,
    },

    /// The run header was committed but its rows were not (fully) written.
    #[error("Run {run_id} (header {header_id}) is incomplete: {reason}")]
    IncompleteRun {
        run_id: String,
        header_id: i64,
        reason: String,
    },

    #[error("{0}")]
    Other(String),
}

impl WatchError {
    /// Returns `true` for upstream failures that are recovered by skipping.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Rpc(_) | Self::Probe { .. })
    }

    /// Returns `true` for duplicate-key conflicts (recovered by re-read).
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Returns `true` if the process must not enter (or stay in) the loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(WatchError::Rpc("down".into()).is_transient());
        assert!(WatchError::Probe { url: "http://x".into(), reason: "timeout".into() }.is_transient());
        assert!(!WatchError::Storage("locked".into()).is_transient());
        assert!(WatchError::Conflict("dup".into()).is_conflict());
        assert!(WatchError::Config("MIGRATION_BLOCK is not set".into()).is_fatal());
        assert!(!WatchError::Storage("gone".into()).is_fatal());
    }

    #[test]
    fn incomplete_run_message() {
        let err = WatchError::IncompleteRun {
            run_id: "abc".into(),
            header_id: 7,
            reason: "disk full".into(),
        };
        assert_eq!(err.to_string(), "Run abc (header 7) is incomplete: disk full");
    }
}
