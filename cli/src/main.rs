//! rpcwatch CLI: run the watcher and inspect what it recorded.
//!
//! Usage:
//! ```bash
//! # Run the reconcile/probe/record loop (configured from the environment)
//! NODE_URL=http://localhost:8545 MIGRATION_BLOCK=31056500 rpcwatch run
//!
//! # Run one cycle right now and print its report
//! rpcwatch cycle
//!
//! # Check a single endpoint
//! rpcwatch probe --url https://forno.celo.org
//!
//! # Query recorded runs
//! rpcwatch runs --from 2025-03-01T00:00:00Z --address 0xabc...
//! rpcwatch export --from 1740787200 --to 1740873600
//! ```

mod logging;

use std::env;
use std::process;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, Duration, Utc};

use rpcwatch_celo::{CeloOracle, HttpLivenessProbe, HttpRpcClient};
use rpcwatch_core::{
    ChainOracle, CycleDriver, FallbackOracle, HealthProber, LogConfig, MeasurementWindow,
    NetworkStore, ProbeTarget, ProjectionStore, RunFilter, WatchConfig,
};
use rpcwatch_storage::SqliteStorage;

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "run" => cmd_run().await,
        "cycle" => cmd_cycle().await,
        "probe" => cmd_probe(&args[2..]).await,
        "roster" => cmd_roster().await,
        "runs" => cmd_runs(&args[2..], false).await,
        "export" => cmd_runs(&args[2..], true).await,
        "version" | "--version" | "-V" => {
            println!("rpcwatch {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("rpcwatch {}", env!("CARGO_PKG_VERSION"));
    println!("Track Celo validator history and RPC endpoint uptime\n");
    println!("USAGE:");
    println!("    rpcwatch <COMMAND>\n");
    println!("COMMANDS:");
    println!("    run        Wait for the start height, then reconcile/probe/record every interval");
    println!("    cycle      Run a single cycle now and print its report");
    println!("    probe      Check one RPC endpoint with eth_blockNumber");
    println!("    roster     Print current validators with names, groups and endpoints");
    println!("    runs       Print recorded runs with nested results (max 24h span)");
    println!("    export     Print recorded results as flat rows (max 1y span)");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("QUERY FLAGS (runs, export):");
    println!("    --from <TIME>        RFC 3339 timestamp or unix seconds");
    println!("    --to <TIME>          RFC 3339 timestamp or unix seconds");
    println!("    --address <ADDR>     Only include this validator (repeatable)\n");
    println!("PROBE FLAGS:");
    println!("    --url <URL>          RPC endpoint URL  [required]\n");
    println!("ENVIRONMENT:");
    println!("    NODE_URL, EXTERNAL_NODE_URL, MIGRATION_BLOCK, NETWORK_ID, DATABASE_URL,");
    println!("    RPC_TIMER_MS, PROBE_TIMEOUT_MS, PROBE_CONCURRENCY, PROBE_SCOPE,");
    println!("    CHAIN_READY_POLL_MS, BACKFILL_MEMBERSHIP, LOG_LEVEL, LOG_JSON, RUST_LOG");
}

// ─── Watcher ─────────────────────────────────────────────────────────────────

async fn cmd_run() -> anyhow::Result<()> {
    let config = WatchConfig::from_env()?;
    logging::init_tracing(&config.log);

    let mut driver = build_driver(&config).await?;
    tracing::info!(
        network = %config.network,
        node = %config.node_url,
        interval_ms = config.interval_ms,
        min_start_height = config.min_start_height,
        "starting watcher"
    );
    driver.run(shutdown_signal()).await?;
    Ok(())
}

async fn cmd_cycle() -> anyhow::Result<()> {
    let config = WatchConfig::from_env()?;
    logging::init_tracing(&config.log);

    let mut driver = build_driver(&config).await?;
    let report = driver.run_cycle().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn build_driver(config: &WatchConfig) -> anyhow::Result<CycleDriver> {
    let store = Arc::new(
        SqliteStorage::open(&config.database_url)
            .await
            .with_context(|| format!("opening {}", config.database_url))?,
    );
    let network = store.get_or_insert_network(&config.network).await?;
    let oracle = build_oracle(config)?;
    let probe = Arc::new(HttpLivenessProbe::new(config.probe_timeout())?);
    Ok(CycleDriver::new(config, network, oracle, store, probe))
}

fn build_oracle(config: &WatchConfig) -> anyhow::Result<Arc<dyn ChainOracle>> {
    let primary = CeloOracle::new(Arc::new(HttpRpcClient::default_for(&config.node_url)?))?;
    let oracle: Arc<dyn ChainOracle> = match &config.fallback_node_url {
        Some(url) => {
            let secondary = CeloOracle::new(Arc::new(HttpRpcClient::default_for(url)?))?;
            Arc::new(FallbackOracle::new(primary, secondary))
        }
        None => Arc::new(primary),
    };
    Ok(oracle)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

async fn cmd_probe(args: &[String]) -> anyhow::Result<()> {
    let url = parse_flag(args, "--url").ok_or_else(|| anyhow!("--url is required"))?;
    let timeout = std::time::Duration::from_millis(
        env::var("PROBE_TIMEOUT_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(5_000),
    );

    let prober =
        HealthProber::new(Arc::new(HttpLivenessProbe::new(timeout)?)).with_timeout(timeout);
    let target = ProbeTarget { entity_id: 0, address: String::new(), endpoint_url: Some(url) };
    let results = prober.probe(vec![target]).await;
    for result in results {
        println!("{}", serde_json::to_string_pretty(&result.outcome)?);
    }
    Ok(())
}

// ─── Queries ─────────────────────────────────────────────────────────────────

/// Storage settings for the read-only commands; the chain settings are not needed.
async fn open_store() -> anyhow::Result<(SqliteStorage, i64)> {
    let defaults = WatchConfig::default();
    let log = LogConfig {
        level: env::var("LOG_LEVEL").unwrap_or_else(|_| "warn".into()),
        ..LogConfig::default()
    };
    logging::init_tracing(&log);

    let database_url = env::var("DATABASE_URL").unwrap_or(defaults.database_url);
    let network = env::var("NETWORK_ID").unwrap_or(defaults.network);
    let store = SqliteStorage::open(&database_url)
        .await
        .with_context(|| format!("opening {database_url}"))?;
    let network = store.get_or_insert_network(&network).await?;
    Ok((store, network.id))
}

async fn cmd_roster() -> anyhow::Result<()> {
    let (store, network_id) = open_store().await?;
    let roster = store.current_roster(network_id).await?;
    println!("{}", serde_json::to_string_pretty(&roster)?);
    Ok(())
}

async fn cmd_runs(args: &[String], flat: bool) -> anyhow::Result<()> {
    let from = parse_flag(args, "--from").map(|v| parse_time(&v)).transpose()?;
    let to = parse_flag(args, "--to").map(|v| parse_time(&v)).transpose()?;
    let addresses = parse_multi_flag(args, "--address");

    let max_span = Duration::hours(if flat {
        MeasurementWindow::EXPORT_MAX_SPAN_HOURS
    } else {
        MeasurementWindow::NESTED_MAX_SPAN_HOURS
    });
    let (from, to) = MeasurementWindow::normalize(from, to, Utc::now(), max_span)?;

    let mut filter = RunFilter::new(from, to);
    if !addresses.is_empty() {
        filter = filter.addresses(addresses);
    }

    let (store, network_id) = open_store().await?;
    let runs = store.runs_in_range(network_id, &filter).await?;
    if flat {
        let rows: Vec<_> = runs.iter().flat_map(|r| r.flatten()).collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        println!("{}", serde_json::to_string_pretty(&runs)?);
    }
    Ok(())
}

fn parse_time(value: &str) -> anyhow::Result<DateTime<Utc>> {
    if value.chars().all(|c| c.is_ascii_digit()) {
        let secs: i64 = value.parse().with_context(|| format!("invalid unix time {value:?}"))?;
        return DateTime::<Utc>::from_timestamp(secs, 0)
            .ok_or_else(|| anyhow!("unix time {value} is out of range"));
    }
    match DateTime::parse_from_rfc3339(value) {
        Ok(t) => Ok(t.with_timezone(&Utc)),
        Err(e) => bail!("invalid timestamp {value:?}: {e}"),
    }
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

fn parse_multi_flag(args: &[String], flag: &str) -> Vec<String> {
    args.windows(2)
        .filter(|w| w[0] == flag)
        .map(|w| w[1].clone())
        .collect()
}
