//! rpcwatch-core: temporal history and uptime measurement for validator RPC endpoints.
//!
//! # Architecture
//!
//! ```text
//! CycleDriver
//!     ├── Reconciler          (chain roster → entities + temporal facts)
//!     │     └── FactStore     (validity-interval history: names, memberships)
//!     ├── HealthProber        (concurrent, timeout-bounded liveness checks)
//!     ├── MeasurementRecorder (run header + results + endpoint snapshots)
//!     └── Storage backend     (memory / SQLite)
//! ```
//!
//! The chain is consumed through the [`ChainOracle`] trait and storage through
//! the [`Storage`] traits, so every component can run against test doubles.

pub mod backoff;
pub mod config;
pub mod driver;
pub mod error;
pub mod oracle;
pub mod probe;
pub mod query;
pub mod reconcile;
pub mod record;
pub mod store;
pub mod temporal;
pub mod types;

pub use backoff::{RetryConfig, RetryPolicy};
pub use config::{LogConfig, ProbeScope, WatchConfig, WatchConfigBuilder};
pub use driver::{CycleDriver, CycleOutcome, CycleReport, DriverState};
pub use error::WatchError;
pub use oracle::{ChainOracle, FallbackOracle, GroupRoster, MembershipEntry};
pub use probe::{HealthProber, LivenessProbe, ProbeOutcome, ProbeResult, ProbeTarget};
pub use query::{MeasurementWindow, RosterEntry, RunFilter, RunWithResults};
pub use reconcile::{EntityFailure, ReconcileSummary, Reconciler};
pub use record::{MeasurementRecorder, RecordedRun};
pub use store::{EntityStore, MeasurementStore, NetworkStore, ProjectionStore, Storage};
pub use temporal::{FactKind, FactStore, FactValue, TemporalFact};
pub use types::{Entity, EntityKind, Network};
