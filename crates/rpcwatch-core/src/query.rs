//! Query-side projections over the measurement and roster tables.
//!
//! These are the shapes handed to the HTTP layer; they carry addresses rather
//! than surrogate ids.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WatchError;

// ─── Filters ─────────────────────────────────────────────────────────────────

/// Time range (inclusive on both ends) plus an optional address filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFilter {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// Only include results for these validator addresses (`None` = all).
    pub addresses: Option<Vec<String>>,
}

impl RunFilter {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to, addresses: None }
    }

    pub fn addresses(mut self, addresses: Vec<String>) -> Self {
        self.addresses = Some(addresses);
        self
    }

    /// Returns `true` if `executed_at` lies in the range.
    pub fn covers(&self, executed_at: DateTime<Utc>) -> bool {
        self.from <= executed_at && executed_at <= self.to
    }

    /// Returns `true` if `address` passes the address filter.
    pub fn matches_address(&self, address: &str) -> bool {
        match &self.addresses {
            None => true,
            Some(list) => list.iter().any(|a| a.eq_ignore_ascii_case(address)),
        }
    }
}

/// Normalization of user-supplied query bounds.
pub struct MeasurementWindow;

impl MeasurementWindow {
    /// Widest span served for nested run queries.
    pub const NESTED_MAX_SPAN_HOURS: i64 = 24;
    /// Widest span served for flat exports.
    pub const EXPORT_MAX_SPAN_HOURS: i64 = 24 * 365;

    /// Fill in missing bounds and clip the span.
    ///
    /// - no bounds: the 24 hours ending at `now`
    /// - one bound: one day from (or to) the given bound
    /// - `to <= from` is rejected
    /// - spans wider than `max_span` keep `to` and move `from` forward
    pub fn normalize(
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        max_span: Duration,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>), WatchError> {
        let day = Duration::hours(24);
        let (from, to) = match (from, to) {
            (None, None) => (now - day, now),
            (None, Some(to)) => (to - day, to),
            (Some(from), None) => (from, from + day),
            (Some(from), Some(to)) => (from, to),
        };
        if to <= from {
            return Err(WatchError::Other(
                "from date should be less than to date".into(),
            ));
        }
        if to - from > max_span {
            return Ok((to - max_span, to));
        }
        Ok((from, to))
    }
}

// ─── Runs ────────────────────────────────────────────────────────────────────

/// One validator's result inside a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorMeasurement {
    pub address: String,
    pub up: bool,
    pub height: Option<u64>,
    pub http_status: Option<u16>,
    pub latency_ms: Option<u64>,
}

/// A run header with its nested results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunWithResults {
    pub run_id: String,
    pub executed_at: DateTime<Utc>,
    pub results: Vec<ValidatorMeasurement>,
}

/// A flattened `(run, result)` row, used for exports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRow {
    pub run_id: String,
    pub executed_at: DateTime<Utc>,
    pub address: String,
    pub up: bool,
    pub height: Option<u64>,
    pub http_status: Option<u16>,
    pub latency_ms: Option<u64>,
}

impl RunWithResults {
    /// Flatten into one row per result, keeping order.
    pub fn flatten(&self) -> Vec<ExportRow> {
        self.results
            .iter()
            .map(|r| ExportRow {
                run_id: self.run_id.clone(),
                executed_at: self.executed_at,
                address: r.address.clone(),
                up: r.up,
                height: r.height,
                http_status: r.http_status,
                latency_ms: r.latency_ms,
            })
            .collect()
    }

    /// Group flat rows into runs. Rows of one run must be adjacent, as they are
    /// when ordered by `executed_at, run_id, address`.
    pub fn group(rows: impl IntoIterator<Item = ExportRow>) -> Vec<RunWithResults> {
        let mut runs: Vec<RunWithResults> = Vec::new();
        for row in rows {
            let result = ValidatorMeasurement {
                address: row.address,
                up: row.up,
                height: row.height,
                http_status: row.http_status,
                latency_ms: row.latency_ms,
            };
            match runs.last_mut() {
                Some(run) if run.run_id == row.run_id => run.results.push(result),
                _ => runs.push(RunWithResults {
                    run_id: row.run_id,
                    executed_at: row.executed_at,
                    results: vec![result],
                }),
            }
        }
        runs
    }
}

/// Sort runs by `executed_at ASC` (ties by `run_id`) and results by `address ASC`.
pub fn sort_runs(runs: &mut [RunWithResults]) {
    runs.sort_by(|a, b| a.executed_at.cmp(&b.executed_at).then_with(|| a.run_id.cmp(&b.run_id)));
    for run in runs.iter_mut() {
        run.results.sort_by(|a, b| a.address.cmp(&b.address));
    }
}

// ─── Roster ──────────────────────────────────────────────────────────────────

/// A validator's current identity and endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub address: String,
    pub current_name: Option<String>,
    pub current_group_name: Option<String>,
    pub endpoint_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, h, 0, 0).unwrap()
    }

    fn row(run: &str, h: u32, addr: &str, up: bool) -> ExportRow {
        ExportRow {
            run_id: run.into(),
            executed_at: at(h),
            address: addr.into(),
            up,
            height: up.then_some(100),
            http_status: Some(if up { 200 } else { 500 }),
            latency_ms: up.then_some(12),
        }
    }

    #[test]
    fn window_defaults_to_last_day() {
        let now = at(12);
        let (from, to) =
            MeasurementWindow::normalize(None, None, now, Duration::hours(24)).unwrap();
        assert_eq!(to, now);
        assert_eq!(to - from, Duration::hours(24));
    }

    #[test]
    fn window_fills_single_bound() {
        let (from, to) =
            MeasurementWindow::normalize(Some(at(1)), None, at(12), Duration::days(365)).unwrap();
        assert_eq!(from, at(1));
        assert_eq!(to - from, Duration::hours(24));

        let (from, to) =
            MeasurementWindow::normalize(None, Some(at(5)), at(12), Duration::days(365)).unwrap();
        assert_eq!(to, at(5));
        assert_eq!(to - from, Duration::hours(24));
    }

    #[test]
    fn window_rejects_inverted_range_and_clips_span() {
        assert!(MeasurementWindow::normalize(Some(at(5)), Some(at(5)), at(12), Duration::hours(1))
            .is_err());

        let (from, to) =
            MeasurementWindow::normalize(Some(at(0)), Some(at(10)), at(12), Duration::hours(2))
                .unwrap();
        assert_eq!((from, to), (at(8), at(10)));
    }

    #[test]
    fn group_and_flatten_preserve_order() {
        let rows = vec![
            row("r1", 1, "0xa", true),
            row("r1", 1, "0xb", false),
            row("r2", 2, "0xa", true),
        ];
        let runs = RunWithResults::group(rows.clone());
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].results.len(), 2);
        assert_eq!(runs[1].run_id, "r2");

        let flat: Vec<ExportRow> = runs.iter().flat_map(|r| r.flatten()).collect();
        assert_eq!(flat, rows);
    }

    #[test]
    fn group_splits_on_run_change() {
        let rows = vec![
            row("r1", 1, "0xa", true),
            row("r2", 1, "0xa", false),
            row("r2", 1, "0xb", true),
            row("r3", 2, "0xa", true),
        ];
        let runs = RunWithResults::group(rows);
        let shape: Vec<(&str, usize)> =
            runs.iter().map(|r| (r.run_id.as_str(), r.results.len())).collect();
        assert_eq!(shape, vec![("r1", 1), ("r2", 2), ("r3", 1)]);
    }

    #[test]
    fn filter_matching() {
        let f = RunFilter::new(at(1), at(3)).addresses(vec!["0xAbC".into()]);
        assert!(f.covers(at(1)) && f.covers(at(3)));
        assert!(!f.covers(at(4)));
        assert!(f.matches_address("0xabc"));
        assert!(!f.matches_address("0xdef"));
        assert!(RunFilter::new(at(1), at(2)).matches_address("anything"));
    }
}
