//! Watcher configuration.
//!
//! Loaded once at startup from environment variables. Every problem found
//! here is fatal: the process does not enter the cycle loop.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::WatchError;

/// Which validators are probed each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeScope {
    /// The currently elected set, mapped from signers to accounts.
    #[default]
    Elected,
    /// Every stored validator.
    Registered,
}

impl ProbeScope {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "elected" => Some(Self::Elected),
            "registered" | "all" => Some(Self::Registered),
            _ => None,
        }
    }
}

/// Log level per component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Global default level: "trace" | "debug" | "info" | "warn" | "error"
    #[serde(default = "default_level")]
    pub level: String,
    /// Override per component: component_name → level
    #[serde(default)]
    pub components: HashMap<String, String>,
    /// Emit JSON structured logs (true) or human-readable text (false)
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: default_level(), components: HashMap::new(), json: false }
    }
}

impl LogConfig {
    /// The `EnvFilter` directive string, e.g. `"info,rpcwatch_core=debug"`.
    pub fn directives(&self) -> String {
        let mut components: Vec<_> = self.components.iter().collect();
        components.sort();
        let mut directives = self.level.clone();
        for (component, level) in components {
            directives.push_str(&format!(",{}={}", component.replace('-', "_"), level));
        }
        directives
    }
}

/// Configuration for a watcher instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Network name; rows are partitioned by it (e.g. `"mainnet"`).
    pub network: String,
    /// Primary chain node.
    pub node_url: String,
    /// Secondary node used when a primary read fails.
    pub fallback_node_url: Option<String>,
    pub database_url: String,
    /// The loop does not start before the chain reaches this height.
    pub min_start_height: u64,
    /// Cycle interval; cycles start on multiples of it (milliseconds).
    pub interval_ms: u64,
    /// Per-probe timeout (milliseconds).
    pub probe_timeout_ms: u64,
    /// Max in-flight probes. `None` = unbounded.
    pub probe_concurrency: Option<usize>,
    /// Upper bound for the chain-ready polling backoff (milliseconds).
    pub chain_ready_poll_ms: u64,
    pub probe_scope: ProbeScope,
    /// Replay on-chain membership history for validators with none stored.
    pub backfill_membership_history: bool,
    pub log: LogConfig,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            network: "mainnet".into(),
            node_url: String::new(),
            fallback_node_url: None,
            database_url: "sqlite:./rpcwatch.db?mode=rwc".into(),
            min_start_height: 0,
            interval_ms: 300_000,
            probe_timeout_ms: 5_000,
            probe_concurrency: None,
            chain_ready_poll_ms: 5_000,
            probe_scope: ProbeScope::Elected,
            backfill_membership_history: true,
            log: LogConfig::default(),
        }
    }
}

impl WatchConfig {
    pub fn builder() -> WatchConfigBuilder {
        WatchConfigBuilder::new()
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn chain_ready_poll(&self) -> Duration {
        Duration::from_millis(self.chain_ready_poll_ms)
    }

    /// Load from the process environment and validate.
    pub fn from_env() -> Result<Self, WatchError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through `lookup` (variable name → value) and validate.
    ///
    /// Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, WatchError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut cfg = Self::default();

        if let Some(v) = get("NETWORK_ID") {
            cfg.network = v;
        }
        if let Some(v) = get("NODE_URL") {
            cfg.node_url = v;
        }
        cfg.fallback_node_url = get("EXTERNAL_NODE_URL");
        if let Some(v) = get("DATABASE_URL") {
            cfg.database_url = v;
        }
        match get("MIGRATION_BLOCK") {
            Some(v) => cfg.min_start_height = parse_num("MIGRATION_BLOCK", &v)?,
            None => return Err(WatchError::Config("MIGRATION_BLOCK is not set".into())),
        }
        if let Some(v) = get("RPC_TIMER_MS") {
            cfg.interval_ms = parse_num("RPC_TIMER_MS", &v)?;
        }
        if let Some(v) = get("PROBE_TIMEOUT_MS") {
            cfg.probe_timeout_ms = parse_num("PROBE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("PROBE_CONCURRENCY") {
            cfg.probe_concurrency = Some(parse_num::<usize>("PROBE_CONCURRENCY", &v)?)
                .filter(|n| *n > 0);
        }
        if let Some(v) = get("CHAIN_READY_POLL_MS") {
            cfg.chain_ready_poll_ms = parse_num("CHAIN_READY_POLL_MS", &v)?;
        }
        if let Some(v) = get("PROBE_SCOPE") {
            cfg.probe_scope = ProbeScope::parse(&v).ok_or_else(|| {
                WatchError::Config(format!("PROBE_SCOPE must be elected or registered, got {v:?}"))
            })?;
        }
        if let Some(v) = get("BACKFILL_MEMBERSHIP") {
            cfg.backfill_membership_history = parse_bool("BACKFILL_MEMBERSHIP", &v)?;
        }
        if let Some(v) = get("LOG_LEVEL") {
            cfg.log.level = v;
        }
        if let Some(v) = get("LOG_JSON") {
            cfg.log.json = parse_bool("LOG_JSON", &v)?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations the loop cannot run with.
    pub fn validate(&self) -> Result<(), WatchError> {
        if self.node_url.is_empty() {
            return Err(WatchError::Config("NODE_URL is not set".into()));
        }
        if self.min_start_height == 0 {
            return Err(WatchError::Config("MIGRATION_BLOCK must be non-zero".into()));
        }
        if self.interval_ms == 0 {
            return Err(WatchError::Config("RPC_TIMER_MS must be non-zero".into()));
        }
        if self.probe_timeout_ms == 0 {
            return Err(WatchError::Config("PROBE_TIMEOUT_MS must be non-zero".into()));
        }
        if self.network.is_empty() {
            return Err(WatchError::Config("NETWORK_ID is empty".into()));
        }
        Ok(())
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, WatchError> {
    value
        .parse()
        .map_err(|_| WatchError::Config(format!("{key} is not a valid number: {value:?}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, WatchError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(WatchError::Config(format!("{key} is not a boolean: {value:?}"))),
    }
}

/// Fluent builder for `WatchConfig`.
#[derive(Default)]
pub struct WatchConfigBuilder {
    config: WatchConfig,
}

impl WatchConfigBuilder {
    pub fn new() -> Self {
        Self { config: WatchConfig::default() }
    }

    pub fn network(mut self, name: impl Into<String>) -> Self {
        self.config.network = name.into();
        self
    }

    pub fn node_url(mut self, url: impl Into<String>) -> Self {
        self.config.node_url = url.into();
        self
    }

    pub fn fallback_node_url(mut self, url: impl Into<String>) -> Self {
        self.config.fallback_node_url = Some(url.into());
        self
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.config.database_url = url.into();
        self
    }

    pub fn min_start_height(mut self, height: u64) -> Self {
        self.config.min_start_height = height;
        self
    }

    /// Set the cycle interval in milliseconds.
    pub fn interval_ms(mut self, ms: u64) -> Self {
        self.config.interval_ms = ms;
        self
    }

    pub fn probe_timeout_ms(mut self, ms: u64) -> Self {
        self.config.probe_timeout_ms = ms;
        self
    }

    pub fn probe_concurrency(mut self, limit: usize) -> Self {
        self.config.probe_concurrency = Some(limit).filter(|n| *n > 0);
        self
    }

    pub fn chain_ready_poll_ms(mut self, ms: u64) -> Self {
        self.config.chain_ready_poll_ms = ms;
        self
    }

    pub fn probe_scope(mut self, scope: ProbeScope) -> Self {
        self.config.probe_scope = scope;
        self
    }

    pub fn backfill_membership_history(mut self, enabled: bool) -> Self {
        self.config.backfill_membership_history = enabled;
        self
    }

    pub fn log(mut self, log: LogConfig) -> Self {
        self.config.log = log;
        self
    }

    pub fn build(self) -> Result<WatchConfig, WatchError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn loads_defaults_with_required_vars() {
        let cfg = WatchConfig::from_lookup(lookup(&[
            ("NODE_URL", "http://localhost:8545"),
            ("MIGRATION_BLOCK", "31056500"),
        ]))
        .unwrap();
        assert_eq!(cfg.network, "mainnet");
        assert_eq!(cfg.min_start_height, 31_056_500);
        assert_eq!(cfg.interval(), Duration::from_secs(300));
        assert_eq!(cfg.probe_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.probe_scope, ProbeScope::Elected);
        assert!(cfg.backfill_membership_history);
        assert!(cfg.fallback_node_url.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = WatchConfig::from_lookup(lookup(&[
            ("NETWORK_ID", "alfajores"),
            ("NODE_URL", "http://a"),
            ("EXTERNAL_NODE_URL", "https://forno.celo.org"),
            ("MIGRATION_BLOCK", "1"),
            ("RPC_TIMER_MS", "60000"),
            ("PROBE_CONCURRENCY", "16"),
            ("PROBE_SCOPE", "registered"),
            ("BACKFILL_MEMBERSHIP", "false"),
            ("LOG_JSON", "1"),
        ]))
        .unwrap();
        assert_eq!(cfg.network, "alfajores");
        assert_eq!(cfg.fallback_node_url.as_deref(), Some("https://forno.celo.org"));
        assert_eq!(cfg.interval_ms, 60_000);
        assert_eq!(cfg.probe_concurrency, Some(16));
        assert_eq!(cfg.probe_scope, ProbeScope::Registered);
        assert!(!cfg.backfill_membership_history);
        assert!(cfg.log.json);
    }

    #[test]
    fn missing_or_zero_migration_block_is_fatal() {
        let err = WatchConfig::from_lookup(lookup(&[("NODE_URL", "http://a")])).unwrap_err();
        assert!(err.is_fatal());

        let err = WatchConfig::from_lookup(lookup(&[
            ("NODE_URL", "http://a"),
            ("MIGRATION_BLOCK", "0"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("non-zero"));
    }

    #[test]
    fn malformed_values_are_rejected() {
        for (key, value) in [("RPC_TIMER_MS", "soon"), ("PROBE_SCOPE", "some"), ("LOG_JSON", "maybe")] {
            let err = WatchConfig::from_lookup(lookup(&[
                ("NODE_URL", "http://a"),
                ("MIGRATION_BLOCK", "5"),
                (key, value),
            ]))
            .unwrap_err();
            assert!(err.is_fatal(), "{key}={value} should be fatal");
        }
    }

    #[test]
    fn builder_validates() {
        assert!(WatchConfig::builder().node_url("http://a").build().is_err());
        let cfg = WatchConfig::builder()
            .node_url("http://a")
            .min_start_height(10)
            .interval_ms(1_000)
            .probe_concurrency(0)
            .build()
            .unwrap();
        assert_eq!(cfg.interval_ms, 1_000);
        assert_eq!(cfg.probe_concurrency, None);
    }

    #[test]
    fn log_directives_include_components() {
        let mut log = LogConfig::default();
        log.components.insert("rpcwatch-core".into(), "debug".into());
        assert_eq!(log.directives(), "info,rpcwatch_core=debug");
    }
}
