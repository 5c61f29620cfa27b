//! SQLite storage backend for RPCWatch.
//!
//! Persists networks, entities, temporal facts and measurement runs to a
//! single SQLite file. Uses `sqlx` with WAL mode for concurrent read
//! performance.
//!
//! # Usage
//! ```rust,no_run
//! use rpcwatch_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./rpcwatch.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::debug;

use rpcwatch_core::query::{sort_runs, ExportRow, RosterEntry, RunFilter, RunWithResults};
use rpcwatch_core::store::{EntityStore, MeasurementStore, NetworkStore, ProjectionStore};
use rpcwatch_core::temporal::{
    plan_record, select_fact_at, FactKind, FactStore, FactValue, RecordPlan, TemporalFact,
};
use rpcwatch_core::types::{
    Entity, EntityId, EntityKind, FactId, Network, NetworkId, NewMeasurement, NewSnapshot,
    RunHeader,
};
use rpcwatch_core::WatchError;

use crate::codec::{decode_name, encode_name};

/// Bound parameters per `IN (...)` chunk; stays under SQLite's variable limit.
const IN_CHUNK: usize = 500;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS networks (
        id   INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT    NOT NULL UNIQUE
    );",
    "CREATE TABLE IF NOT EXISTS entities (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        network_id   INTEGER NOT NULL REFERENCES networks (id),
        kind         TEXT    NOT NULL,
        address      TEXT    NOT NULL COLLATE NOCASE,
        endpoint_url TEXT,
        display_name TEXT,
        UNIQUE (network_id, kind, address)
    );",
    "CREATE TABLE IF NOT EXISTS facts (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        network_id INTEGER NOT NULL,
        entity_id  INTEGER NOT NULL REFERENCES entities (id),
        kind       TEXT    NOT NULL,
        value      TEXT    NOT NULL,
        valid_from INTEGER NOT NULL,
        valid_to   INTEGER,
        UNIQUE (network_id, kind, entity_id, valid_from)
    );",
    "CREATE TABLE IF NOT EXISTS run_headers (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        network_id  INTEGER NOT NULL,
        run_id      TEXT    NOT NULL UNIQUE,
        executed_at INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS measurements (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        network_id  INTEGER NOT NULL,
        entity_id   INTEGER NOT NULL REFERENCES entities (id),
        header_id   INTEGER NOT NULL REFERENCES run_headers (id),
        up          INTEGER NOT NULL,
        height      INTEGER,
        http_status INTEGER,
        latency_ms  INTEGER
    );",
    "CREATE TABLE IF NOT EXISTS endpoint_snapshots (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        network_id   INTEGER NOT NULL,
        entity_id    INTEGER NOT NULL REFERENCES entities (id),
        header_id    INTEGER NOT NULL REFERENCES run_headers (id),
        endpoint_url TEXT    NOT NULL
    );",
    "CREATE INDEX IF NOT EXISTS idx_facts_open ON facts (network_id, kind, entity_id, valid_to);",
    "CREATE INDEX IF NOT EXISTS idx_headers_time ON run_headers (network_id, executed_at);",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_measurements_run_entity ON measurements (header_id, entity_id);",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_snapshots_run_entity ON endpoint_snapshots (header_id, entity_id);",
    "CREATE INDEX IF NOT EXISTS idx_snapshots_entity ON endpoint_snapshots (network_id, entity_id);",
];

fn db_err(e: sqlx::Error) -> WatchError {
    WatchError::Storage(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// SQLite-backed storage for the whole watcher schema.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./rpcwatch.db"`) or a full
    /// SQLite URL (`"sqlite:./rpcwatch.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, WatchError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(db_err)?;
        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Every pooled connection would get its own empty database, so the pool
    /// is pinned to one connection. All data is lost when the pool is dropped.
    pub async fn in_memory() -> Result<Self, WatchError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(db_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), WatchError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await.map_err(db_err)?;
        }
        Ok(())
    }

    async fn fact_starting_at(
        &self,
        network_id: NetworkId,
        kind: FactKind,
        entity_id: EntityId,
        valid_from: u64,
    ) -> Result<Option<TemporalFact>, WatchError> {
        let row = sqlx::query(
            "SELECT id, network_id, entity_id, kind, value, valid_from, valid_to FROM facts
             WHERE network_id = ? AND kind = ? AND entity_id = ? AND valid_from = ?",
        )
        .bind(network_id)
        .bind(kind.as_str())
        .bind(entity_id)
        .bind(valid_from as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(fact_from_row).transpose()
    }
}

// ─── Row mapping ─────────────────────────────────────────────────────────────

fn encode_value(value: &FactValue) -> String {
    match value {
        FactValue::Name(name) => encode_name(name),
        FactValue::Group(group_id) => group_id.to_string(),
    }
}

fn fact_from_row(row: &SqliteRow) -> Result<TemporalFact, WatchError> {
    let kind: String = row.get("kind");
    let raw: String = row.get("value");
    let value = match FactKind::parse(&kind) {
        Some(FactKind::Name) => FactValue::Name(decode_name(&raw)?),
        Some(FactKind::GroupMembership) => FactValue::Group(
            raw.parse()
                .map_err(|_| WatchError::Storage(format!("bad group id in fact: {raw:?}")))?,
        ),
        None => return Err(WatchError::Storage(format!("unknown fact kind {kind:?}"))),
    };
    Ok(TemporalFact {
        id: row.get("id"),
        network_id: row.get("network_id"),
        entity_id: row.get("entity_id"),
        value,
        valid_from: row.get::<i64, _>("valid_from") as u64,
        valid_to: row.get::<Option<i64>, _>("valid_to").map(|v| v as u64),
    })
}

fn entity_from_row(row: &SqliteRow) -> Result<Entity, WatchError> {
    let kind: String = row.get("kind");
    Ok(Entity {
        id: row.get("id"),
        network_id: row.get("network_id"),
        kind: EntityKind::parse(&kind)
            .ok_or_else(|| WatchError::Storage(format!("unknown entity kind {kind:?}")))?,
        address: row.get("address"),
        endpoint_url: row.get("endpoint_url"),
        display_name: row
            .get::<Option<String>, _>("display_name")
            .map(|n| decode_name(&n))
            .transpose()?,
    })
}

fn timestamp(ms: i64) -> Result<DateTime<Utc>, WatchError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| WatchError::Storage(format!("bad timestamp {ms}")))
}

fn header_from_row(row: &SqliteRow) -> Result<RunHeader, WatchError> {
    Ok(RunHeader {
        id: row.get("id"),
        network_id: row.get("network_id"),
        run_id: row.get("run_id"),
        executed_at: timestamp(row.get("executed_at"))?,
    })
}

enum FactWrite {
    Inserted(FactId),
    Existing { id: FactId, same_value: bool },
    Raced,
}

/// Check, close and insert inside the caller's open transaction.
async fn write_fact(
    conn: &mut SqliteConnection,
    network_id: NetworkId,
    entity_id: EntityId,
    value: &FactValue,
    effective_from: u64,
) -> Result<FactWrite, WatchError> {
    let kind = value.kind();
    let rows = sqlx::query(
        "SELECT id, network_id, entity_id, kind, value, valid_from, valid_to FROM facts
         WHERE network_id = ? AND kind = ? AND entity_id = ? ORDER BY valid_from",
    )
    .bind(network_id)
    .bind(kind.as_str())
    .bind(entity_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err)?;
    let facts = rows.iter().map(fact_from_row).collect::<Result<Vec<_>, _>>()?;

    let close = match plan_record(&facts, value, effective_from)? {
        RecordPlan::Existing { id, same_value } => {
            return Ok(FactWrite::Existing { id, same_value })
        }
        RecordPlan::Insert { close } => close,
    };

    if let Some(close_id) = close {
        sqlx::query("UPDATE facts SET valid_to = ? WHERE id = ? AND valid_to IS NULL")
            .bind(effective_from as i64)
            .bind(close_id)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
    }

    let inserted = sqlx::query(
        "INSERT INTO facts (network_id, entity_id, kind, value, valid_from, valid_to)
         VALUES (?, ?, ?, ?, ?, NULL)",
    )
    .bind(network_id)
    .bind(entity_id)
    .bind(kind.as_str())
    .bind(encode_value(value))
    .bind(effective_from as i64)
    .execute(&mut *conn)
    .await;

    match inserted {
        Ok(result) => Ok(FactWrite::Inserted(result.last_insert_rowid())),
        Err(e) if is_unique_violation(&e) => Ok(FactWrite::Raced),
        Err(e) => Err(db_err(e)),
    }
}

// ─── NetworkStore ────────────────────────────────────────────────────────────

#[async_trait]
impl NetworkStore for SqliteStorage {
    async fn get_or_insert_network(&self, name: &str) -> Result<Network, WatchError> {
        sqlx::query("INSERT OR IGNORE INTO networks (name) VALUES (?)")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        let row = sqlx::query("SELECT id, name FROM networks WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(Network { id: row.get("id"), name: row.get("name") })
    }
}

// ─── EntityStore ─────────────────────────────────────────────────────────────

#[async_trait]
impl EntityStore for SqliteStorage {
    async fn entities(
        &self,
        network_id: NetworkId,
        kind: EntityKind,
    ) -> Result<Vec<Entity>, WatchError> {
        let rows = sqlx::query(
            "SELECT id, network_id, kind, address, endpoint_url, display_name FROM entities
             WHERE network_id = ? AND kind = ? ORDER BY address",
        )
        .bind(network_id)
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(entity_from_row).collect()
    }

    async fn entities_by_addresses(
        &self,
        network_id: NetworkId,
        kind: EntityKind,
        addresses: &[String],
    ) -> Result<Vec<Entity>, WatchError> {
        let mut found = Vec::with_capacity(addresses.len());
        for chunk in addresses.chunks(IN_CHUNK) {
            let sql = format!(
                "SELECT id, network_id, kind, address, endpoint_url, display_name FROM entities
                 WHERE network_id = ? AND kind = ? AND address IN ({}) ORDER BY address",
                placeholders(chunk.len())
            );
            let mut query = sqlx::query(&sql).bind(network_id).bind(kind.as_str());
            for address in chunk {
                query = query.bind(address);
            }
            let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;
            for row in &rows {
                found.push(entity_from_row(row)?);
            }
        }
        Ok(found)
    }

    async fn insert_entities(
        &self,
        network_id: NetworkId,
        kind: EntityKind,
        addresses: &[String],
    ) -> Result<usize, WatchError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut inserted = 0usize;
        for address in addresses {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO entities (network_id, kind, address) VALUES (?, ?, ?)",
            )
            .bind(network_id)
            .bind(kind.as_str())
            .bind(address)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit().await.map_err(db_err)?;

        if inserted > 0 {
            debug!(network_id, kind = %kind, inserted, "entities inserted");
        }
        Ok(inserted)
    }

    async fn set_endpoint(&self, entity_id: EntityId, url: Option<&str>) -> Result<(), WatchError> {
        sqlx::query("UPDATE entities SET endpoint_url = ? WHERE id = ?")
            .bind(url)
            .bind(entity_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_display_name(
        &self,
        entity_id: EntityId,
        name: Option<&str>,
    ) -> Result<(), WatchError> {
        sqlx::query("UPDATE entities SET display_name = ? WHERE id = ?")
            .bind(name.map(encode_name))
            .bind(entity_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

// ─── FactStore ───────────────────────────────────────────────────────────────

#[async_trait]
impl FactStore for SqliteStorage {
    async fn record_fact(
        &self,
        network_id: NetworkId,
        entity_id: EntityId,
        value: &FactValue,
        effective_from: u64,
    ) -> Result<FactId, WatchError> {
        let kind = value.kind();
        let mut conn = self.pool.acquire().await.map_err(db_err)?;

        // IMMEDIATE: the write lock is taken before the read, so concurrent
        // writers queue on busy_timeout instead of failing the lock upgrade.
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await.map_err(db_err)?;
        let written = write_fact(&mut conn, network_id, entity_id, value, effective_from).await;
        let end = if matches!(written, Ok(FactWrite::Inserted(_))) { "COMMIT" } else { "ROLLBACK" };
        sqlx::query(end).execute(&mut *conn).await.map_err(db_err)?;
        drop(conn);

        match written? {
            FactWrite::Inserted(id) => {
                debug!(entity_id, kind = kind.as_str(), at = effective_from, "fact recorded");
                Ok(id)
            }
            FactWrite::Existing { id, same_value } => {
                if !same_value {
                    debug!(entity_id, at = effective_from, "fact slot already taken, keeping stored row");
                }
                Ok(id)
            }
            FactWrite::Raced => {
                debug!(entity_id, at = effective_from, "concurrent fact insert, re-reading");
                self.fact_starting_at(network_id, kind, entity_id, effective_from)
                    .await?
                    .map(|f| f.id)
                    .ok_or_else(|| WatchError::Storage("fact vanished after conflict".into()))
            }
        }
    }

    async fn fact_at(
        &self,
        network_id: NetworkId,
        kind: FactKind,
        entity_id: EntityId,
        at: u64,
    ) -> Result<Option<TemporalFact>, WatchError> {
        let rows = sqlx::query(
            "SELECT id, network_id, entity_id, kind, value, valid_from, valid_to FROM facts
             WHERE network_id = ? AND kind = ? AND entity_id = ?
               AND valid_from <= ? AND (valid_to IS NULL OR valid_to > ?)
             ORDER BY valid_from DESC",
        )
        .bind(network_id)
        .bind(kind.as_str())
        .bind(entity_id)
        .bind(at as i64)
        .bind(at as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let facts = rows.iter().map(fact_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(select_fact_at(&facts, at).cloned())
    }

    async fn history(
        &self,
        network_id: NetworkId,
        kind: FactKind,
        entity_id: EntityId,
    ) -> Result<Vec<TemporalFact>, WatchError> {
        let rows = sqlx::query(
            "SELECT id, network_id, entity_id, kind, value, valid_from, valid_to FROM facts
             WHERE network_id = ? AND kind = ? AND entity_id = ? ORDER BY valid_from",
        )
        .bind(network_id)
        .bind(kind.as_str())
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(fact_from_row).collect()
    }
}

// ─── MeasurementStore ────────────────────────────────────────────────────────

#[async_trait]
impl MeasurementStore for SqliteStorage {
    async fn insert_run_header(
        &self,
        network_id: NetworkId,
        run_id: &str,
        executed_at: DateTime<Utc>,
    ) -> Result<RunHeader, WatchError> {
        let result = sqlx::query(
            "INSERT INTO run_headers (network_id, run_id, executed_at) VALUES (?, ?, ?)",
        )
        .bind(network_id)
        .bind(run_id)
        .bind(executed_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                WatchError::Conflict(format!("run {run_id} already recorded"))
            } else {
                db_err(e)
            }
        })?;

        Ok(RunHeader {
            id: result.last_insert_rowid(),
            network_id,
            run_id: run_id.to_string(),
            executed_at,
        })
    }

    async fn run_header(
        &self,
        network_id: NetworkId,
        run_id: &str,
    ) -> Result<Option<RunHeader>, WatchError> {
        let row = sqlx::query(
            "SELECT id, network_id, run_id, executed_at FROM run_headers
             WHERE network_id = ? AND run_id = ?",
        )
        .bind(network_id)
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(header_from_row).transpose()
    }

    async fn insert_results(&self, rows: &[NewMeasurement]) -> Result<(), WatchError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for r in rows {
            sqlx::query(
                "INSERT OR IGNORE INTO measurements
                 (network_id, entity_id, header_id, up, height, http_status, latency_ms)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(r.network_id)
            .bind(r.entity_id)
            .bind(r.header_id)
            .bind(r.up)
            .bind(r.height.map(|h| h as i64))
            .bind(r.http_status.map(i64::from))
            .bind(r.latency_ms.map(|l| l as i64))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        debug!(rows = rows.len(), "measurements stored");
        Ok(())
    }

    async fn insert_snapshots(&self, rows: &[NewSnapshot]) -> Result<(), WatchError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for s in rows {
            sqlx::query(
                "INSERT OR IGNORE INTO endpoint_snapshots (network_id, entity_id, header_id, endpoint_url)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(s.network_id)
            .bind(s.entity_id)
            .bind(s.header_id)
            .bind(&s.endpoint_url)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn latest_snapshot(
        &self,
        network_id: NetworkId,
        entity_id: EntityId,
    ) -> Result<Option<String>, WatchError> {
        let row = sqlx::query(
            "SELECT endpoint_url FROM endpoint_snapshots
             WHERE network_id = ? AND entity_id = ? ORDER BY header_id DESC LIMIT 1",
        )
        .bind(network_id)
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|r| r.get::<String, _>("endpoint_url")))
    }
}

// ─── ProjectionStore ─────────────────────────────────────────────────────────

#[async_trait]
impl ProjectionStore for SqliteStorage {
    async fn runs_in_range(
        &self,
        network_id: NetworkId,
        filter: &RunFilter,
    ) -> Result<Vec<RunWithResults>, WatchError> {
        let rows = sqlx::query(
            "SELECT h.run_id, h.executed_at, e.address, m.up, m.height, m.http_status, m.latency_ms
             FROM run_headers h
             JOIN measurements m ON m.header_id = h.id
             JOIN entities e ON e.id = m.entity_id
             WHERE h.network_id = ? AND h.executed_at >= ? AND h.executed_at <= ?
             ORDER BY h.executed_at ASC, h.run_id ASC, e.address ASC",
        )
        .bind(network_id)
        .bind(filter.from.timestamp_millis())
        .bind(filter.to.timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut flat = Vec::with_capacity(rows.len());
        for row in &rows {
            let address: String = row.get("address");
            if !filter.matches_address(&address) {
                continue;
            }
            flat.push(ExportRow {
                run_id: row.get("run_id"),
                executed_at: timestamp(row.get("executed_at"))?,
                address,
                up: row.get("up"),
                height: row.get::<Option<i64>, _>("height").map(|h| h as u64),
                http_status: row.get::<Option<i64>, _>("http_status").map(|s| s as u16),
                latency_ms: row.get::<Option<i64>, _>("latency_ms").map(|l| l as u64),
            });
        }

        let mut runs = RunWithResults::group(flat);
        sort_runs(&mut runs);
        Ok(runs)
    }

    async fn current_roster(&self, network_id: NetworkId) -> Result<Vec<RosterEntry>, WatchError> {
        let rows = sqlx::query(
            "SELECT v.address, v.endpoint_url, n.value AS name, g.display_name AS group_name
             FROM entities v
             LEFT JOIN facts n
               ON n.entity_id = v.id AND n.network_id = v.network_id
              AND n.kind = 'name' AND n.valid_to IS NULL
             LEFT JOIN facts m
               ON m.entity_id = v.id AND m.network_id = v.network_id
              AND m.kind = 'group' AND m.valid_to IS NULL
             LEFT JOIN entities g ON g.id = CAST(m.value AS INTEGER)
             WHERE v.network_id = ? AND v.kind = 'validator'
             ORDER BY v.address",
        )
        .bind(network_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut roster = Vec::with_capacity(rows.len());
        for row in &rows {
            roster.push(RosterEntry {
                address: row.get("address"),
                current_name: row
                    .get::<Option<String>, _>("name")
                    .map(|n| decode_name(&n))
                    .transpose()?,
                current_group_name: row
                    .get::<Option<String>, _>("group_name")
                    .map(|n| decode_name(&n))
                    .transpose()?,
                endpoint_url: row.get("endpoint_url"),
            });
        }
        Ok(roster)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rpcwatch_core::temporal::verify_history;

    async fn setup() -> (SqliteStorage, NetworkId, EntityId) {
        let store = SqliteStorage::in_memory().await.unwrap();
        let net = store.get_or_insert_network("mainnet").await.unwrap();
        store
            .insert_entities(net.id, EntityKind::Validator, &["0xaaa".into()])
            .await
            .unwrap();
        let v = store.entities(net.id, EntityKind::Validator).await.unwrap();
        (store, net.id, v[0].id)
    }

    fn name(s: &str) -> FactValue {
        FactValue::Name(s.into())
    }

    fn at_hour(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, h, 0, 0).unwrap()
    }

    // ── Entities ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn addresses_are_case_insensitive() {
        let (store, net, _) = setup().await;
        let added = store
            .insert_entities(net, EntityKind::Validator, &["0xAAA".into(), "0xbbb".into()])
            .await
            .unwrap();
        assert_eq!(added, 1);

        let found = store
            .entities_by_addresses(net, EntityKind::Validator, &["0xAaA".into(), "0xccc".into()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].address, "0xaaa");
    }

    #[tokio::test]
    async fn group_display_name_is_encoded_at_rest() {
        let (store, net, _) = setup().await;
        store.insert_entities(net, EntityKind::Group, &["0xg".into()]).await.unwrap();
        let g = store.entities(net, EntityKind::Group).await.unwrap()[0].id;
        store.set_display_name(g, Some("Bob's Group")).await.unwrap();

        let raw: String = sqlx::query("SELECT display_name FROM entities WHERE id = ?")
            .bind(g)
            .fetch_one(&store.pool)
            .await
            .unwrap()
            .get("display_name");
        assert_eq!(raw, encode_name("Bob's Group"));

        let group = &store.entities(net, EntityKind::Group).await.unwrap()[0];
        assert_eq!(group.display_name.as_deref(), Some("Bob's Group"));
    }

    // ── Facts ─────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn transition_at_observed_height() {
        let (store, net, v) = setup().await;
        store.record_fact(net, v, &name("Alice"), 0).await.unwrap();
        store.record_fact(net, v, &name("Alice"), 100).await.unwrap();
        store.record_fact(net, v, &name("Bob"), 150).await.unwrap();

        let history = store.history(net, FactKind::Name, v).await.unwrap();
        let spans: Vec<(u64, Option<u64>)> =
            history.iter().map(|f| (f.valid_from, f.valid_to)).collect();
        assert_eq!(spans, vec![(0, Some(100)), (100, Some(150)), (150, None)]);
        assert!(verify_history(&history).is_ok());

        let at = store.fact_at(net, FactKind::Name, v, 150).await.unwrap().unwrap();
        assert_eq!(at.value, name("Bob"));
        let before = store.fact_at(net, FactKind::Name, v, 149).await.unwrap().unwrap();
        assert_eq!(before.value, name("Alice"));
    }

    #[tokio::test]
    async fn retry_at_same_height_yields_one_transition() {
        let (store, net, v) = setup().await;
        store.record_fact(net, v, &name("Alice"), 100).await.unwrap();
        let a = store.record_fact(net, v, &name("Bob"), 150).await.unwrap();
        let b = store.record_fact(net, v, &name("Bob"), 150).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.history(net, FactKind::Name, v).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stale_observation_is_rejected() {
        let (store, net, v) = setup().await;
        store.record_fact(net, v, &name("Bob"), 150).await.unwrap();
        let err = store.record_fact(net, v, &name("Alice"), 120).await.unwrap_err();
        assert!(matches!(err, WatchError::OutOfOrderFact { .. }));
    }

    #[tokio::test]
    async fn concurrent_writers_agree_on_one_fact() {
        let path = std::env::temp_dir().join(format!(
            "rpcwatch-facts-{}-{}.db",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let path_str = path.to_string_lossy().to_string();
        let store = std::sync::Arc::new(SqliteStorage::open(&path_str).await.unwrap());
        let net = store.get_or_insert_network("mainnet").await.unwrap().id;
        store.insert_entities(net, EntityKind::Validator, &["0xaaa".into()]).await.unwrap();
        let v = store.entities(net, EntityKind::Validator).await.unwrap()[0].id;
        store.record_fact(net, v, &name("Alice"), 100).await.unwrap();

        let writers: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.record_fact(net, v, &name("Bob"), 150).await })
            })
            .collect();
        let mut ids = Vec::new();
        for writer in writers {
            ids.push(writer.await.unwrap().unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);

        let history = store.history(net, FactKind::Name, v).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(verify_history(&history).is_ok());

        drop(store);
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{path_str}{suffix}"));
        }
    }

    #[tokio::test]
    async fn fact_at_prefers_latest_start_after_repair() {
        let (store, net, v) = setup().await;
        // Two open rows, as left by a manual repair.
        for (value, from) in [("Old", 0i64), ("New", 40)] {
            sqlx::query(
                "INSERT INTO facts (network_id, entity_id, kind, value, valid_from) VALUES (?, ?, 'name', ?, ?)",
            )
            .bind(net)
            .bind(v)
            .bind(encode_name(value))
            .bind(from)
            .execute(&store.pool)
            .await
            .unwrap();
        }
        let f = store.fact_at(net, FactKind::Name, v, 50).await.unwrap().unwrap();
        assert_eq!(f.value, name("New"));
    }

    #[tokio::test]
    async fn names_are_encoded_at_rest() {
        let (store, net, v) = setup().await;
        store.record_fact(net, v, &name("Zoë"), 1).await.unwrap();
        let raw: String = sqlx::query("SELECT value FROM facts WHERE entity_id = ?")
            .bind(v)
            .fetch_one(&store.pool)
            .await
            .unwrap()
            .get("value");
        assert_eq!(raw, encode_name("Zoë"));
    }

    // ── Measurements ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn header_conflict_and_reread() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let h = store.insert_run_header(1, "run-a", at_hour(1)).await.unwrap();
        let err = store.insert_run_header(1, "run-a", at_hour(2)).await.unwrap_err();
        assert!(err.is_conflict());
        let again = store.run_header(1, "run-a").await.unwrap().unwrap();
        assert_eq!(again, h);
    }

    #[tokio::test]
    async fn runs_in_range_nests_and_orders() {
        let (store, net, v1) = setup().await;
        store.insert_entities(net, EntityKind::Validator, &["0x000".into()]).await.unwrap();
        let v0 = store
            .entities_by_addresses(net, EntityKind::Validator, &["0x000".into()])
            .await
            .unwrap()[0]
            .id;

        for (run, hour) in [("late", 3), ("early", 1)] {
            let h = store.insert_run_header(net, run, at_hour(hour)).await.unwrap();
            let rows: Vec<NewMeasurement> = [v1, v0]
                .iter()
                .map(|&entity_id| NewMeasurement {
                    network_id: net,
                    entity_id,
                    header_id: h.id,
                    up: entity_id == v1,
                    height: (entity_id == v1).then_some(42),
                    http_status: Some(if entity_id == v1 { 200 } else { 408 }),
                    latency_ms: (entity_id == v1).then_some(9),
                })
                .collect();
            store.insert_results(&rows).await.unwrap();
        }

        let runs = store
            .runs_in_range(net, &RunFilter::new(at_hour(0), at_hour(5)))
            .await
            .unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, "early");
        assert_eq!(runs[0].results[0].address, "0x000");
        assert_eq!(runs[0].results[0].http_status, Some(408));
        assert!(runs[0].results[1].up);

        let filtered = store
            .runs_in_range(net, &RunFilter::new(at_hour(2), at_hour(5)).addresses(vec!["0xAAA".into()]))
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].results.len(), 1);

        let empty = store
            .runs_in_range(net, &RunFilter::new(at_hour(10), at_hour(11)))
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn duplicate_result_and_snapshot_rows_are_ignored() {
        let (store, net, v) = setup().await;
        let h = store.insert_run_header(net, "dup", at_hour(1)).await.unwrap();
        let row = NewMeasurement {
            network_id: net,
            entity_id: v,
            header_id: h.id,
            up: true,
            height: Some(7),
            http_status: Some(200),
            latency_ms: Some(3),
        };
        let snap = NewSnapshot {
            network_id: net,
            entity_id: v,
            header_id: h.id,
            endpoint_url: "http://node".into(),
        };
        for _ in 0..2 {
            store.insert_results(std::slice::from_ref(&row)).await.unwrap();
            store.insert_snapshots(std::slice::from_ref(&snap)).await.unwrap();
        }

        assert_eq!(count_rows(&store, "measurements").await, 1);
        assert_eq!(count_rows(&store, "endpoint_snapshots").await, 1);
    }

    async fn count_rows(store: &SqliteStorage, table: &str) -> i64 {
        let sql = format!("SELECT COUNT(*) AS n FROM {table}");
        sqlx::query(&sql).fetch_one(&store.pool).await.unwrap().get("n")
    }

    #[tokio::test]
    async fn latest_snapshot_tracks_last_run() {
        let (store, net, v) = setup().await;
        for (i, url) in ["http://old", "http://new"].iter().enumerate() {
            let h = store
                .insert_run_header(net, &format!("r{i}"), at_hour(i as u32))
                .await
                .unwrap();
            store
                .insert_snapshots(&[NewSnapshot {
                    network_id: net,
                    entity_id: v,
                    header_id: h.id,
                    endpoint_url: url.to_string(),
                }])
                .await
                .unwrap();
        }
        assert_eq!(store.latest_snapshot(net, v).await.unwrap().as_deref(), Some("http://new"));
    }

    #[tokio::test]
    async fn roster_joins_open_facts() {
        let (store, net, v) = setup().await;
        store.insert_entities(net, EntityKind::Group, &["0xg".into()]).await.unwrap();
        let g = store.entities(net, EntityKind::Group).await.unwrap()[0].id;
        store.set_display_name(g, Some("Group One")).await.unwrap();
        store.set_endpoint(v, Some("http://node:8545")).await.unwrap();
        store.record_fact(net, v, &name("Alice"), 5).await.unwrap();
        store.record_fact(net, v, &name("Alicia"), 9).await.unwrap();
        store.record_fact(net, v, &FactValue::Group(g), 1).await.unwrap();

        let roster = store.current_roster(net).await.unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].current_name.as_deref(), Some("Alicia"));
        assert_eq!(roster[0].current_group_name.as_deref(), Some("Group One"));
        assert_eq!(roster[0].endpoint_url.as_deref(), Some("http://node:8545"));
    }
}
