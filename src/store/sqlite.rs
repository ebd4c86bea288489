//! SQLite metric store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{
    params, params_from_iter, Connection, ErrorCode, OptionalExtension, Result as SqlResult, Row,
    Transaction, TransactionBehavior,
};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

use super::models::{fingerprint, Dimensions, Metric};
use super::{MetricFilter, MetricKind, MetricRepository, MetricStore, StoreError, StoreResult};

/// Fixed-width so that lexical order in SQL equals time order.
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

const METRIC_COLUMNS: &str = "id, name, value, timestamp, source, dimensions, is_aggregate";

#[derive(Error, Debug)]
#[error("invalid stored timestamp {0:?}")]
struct InvalidTimestamp(String);

/// Row counts and file size for operators.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub raw_count: i64,
    pub aggregate_count: i64,
    pub db_size_bytes: i64,
}

/// Thread-safe SQLite store.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply migrations.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        // Other workers may hold the write lock while they aggregate.
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| StoreError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("sqlite connection lock poisoned".to_string()))
    }

    /// Row counts and database size.
    pub fn get_stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.lock()?;
        let raw_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM metrics WHERE is_aggregate = 0",
            [],
            |r| r.get(0),
        )?;
        let aggregate_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM metrics WHERE is_aggregate = 1",
            [],
            |r| r.get(0),
        )?;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
        Ok(StoreStats {
            raw_count,
            aggregate_count,
            db_size_bytes: page_count * page_size,
        })
    }
}

impl MetricRepository for SqliteStore {
    fn save(&self, metric: &Metric) -> StoreResult<Metric> {
        let conn = self.lock()?;
        insert_metric(&conn, metric)
    }

    fn save_batch(&self, metrics: &[Metric]) -> StoreResult<Vec<Metric>> {
        if metrics.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        let saved = metrics
            .iter()
            .map(|m| insert_metric(&tx, m))
            .collect::<StoreResult<Vec<_>>>()?;
        tx.commit()?;
        Ok(saved)
    }

    fn list(&self, filter: &MetricFilter) -> StoreResult<Vec<Metric>> {
        let conn = self.lock()?;
        query_metrics(&conn, filter)
    }

    fn find_aggregate(&self, name: &str, dimensions: &Dimensions) -> StoreResult<Option<Metric>> {
        let conn = self.lock()?;
        find_aggregate(&conn, name, dimensions)
    }

    fn update(&self, metric: &Metric) -> StoreResult<()> {
        let conn = self.lock()?;
        update_metric(&conn, metric)
    }

    fn delete(&self, filter: &MetricFilter) -> StoreResult<usize> {
        let conn = self.lock()?;
        delete_metrics(&conn, filter)
    }
}

impl MetricStore for SqliteStore {
    fn transaction(
        &self,
        work: &mut dyn FnMut(&dyn MetricRepository) -> StoreResult<()>,
    ) -> StoreResult<()> {
        let conn = self.lock()?;
        // IMMEDIATE takes the write lock up front so two processes cannot both
        // read "missing" and then insert the same aggregate.
        let tx = Transaction::new_unchecked(&conn, TransactionBehavior::Immediate)?;
        work(&SqliteTx { conn: &tx })?;
        tx.commit()?;
        Ok(())
    }
}

/// Repository bound to an open transaction.
struct SqliteTx<'a> {
    conn: &'a Connection,
}

impl MetricRepository for SqliteTx<'_> {
    fn save(&self, metric: &Metric) -> StoreResult<Metric> {
        insert_metric(self.conn, metric)
    }

    fn list(&self, filter: &MetricFilter) -> StoreResult<Vec<Metric>> {
        query_metrics(self.conn, filter)
    }

    fn find_aggregate(&self, name: &str, dimensions: &Dimensions) -> StoreResult<Option<Metric>> {
        find_aggregate(self.conn, name, dimensions)
    }

    fn update(&self, metric: &Metric) -> StoreResult<()> {
        update_metric(self.conn, metric)
    }

    fn delete(&self, filter: &MetricFilter) -> StoreResult<usize> {
        delete_metrics(self.conn, filter)
    }
}

// --- Queries ---

fn insert_metric(conn: &Connection, metric: &Metric) -> StoreResult<Metric> {
    let dimensions = serde_json::to_string(&metric.dimensions)?;
    conn.execute(
        "INSERT INTO metrics (name, value, timestamp, source, dimensions, fingerprint, is_aggregate)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            metric.name,
            metric.value,
            db_time(&metric.timestamp),
            metric.source,
            dimensions,
            metric.fingerprint(),
            metric.is_aggregate(),
        ],
    )
    .map_err(|e| conflict_or(e, metric))?;
    Ok(metric.clone().with_id(conn.last_insert_rowid()))
}

fn query_metrics(conn: &Connection, filter: &MetricFilter) -> StoreResult<Vec<Metric>> {
    let (clause, values) = filter_clause(filter);
    let sql = format!(
        "SELECT {} FROM metrics{} ORDER BY timestamp ASC, id ASC",
        METRIC_COLUMNS, clause
    );
    let mut stmt = conn.prepare(&sql)?;
    let metrics = stmt
        .query_map(params_from_iter(values.iter()), row_to_metric)?
        .collect::<SqlResult<Vec<_>>>()?;
    Ok(metrics)
}

fn find_aggregate(
    conn: &Connection,
    name: &str,
    dimensions: &Dimensions,
) -> StoreResult<Option<Metric>> {
    let sql = format!(
        "SELECT {} FROM metrics WHERE name = ?1 AND fingerprint = ?2 AND is_aggregate = 1",
        METRIC_COLUMNS
    );
    let metric = conn
        .query_row(&sql, params![name, fingerprint(dimensions)], row_to_metric)
        .optional()?;
    Ok(metric)
}

fn update_metric(conn: &Connection, metric: &Metric) -> StoreResult<()> {
    let id = metric.id.ok_or(StoreError::NotFound)?;
    let dimensions = serde_json::to_string(&metric.dimensions)?;
    let changed = conn
        .execute(
            "UPDATE metrics SET name=?1, value=?2, timestamp=?3, source=?4, dimensions=?5,
             fingerprint=?6, is_aggregate=?7 WHERE id=?8",
            params![
                metric.name,
                metric.value,
                db_time(&metric.timestamp),
                metric.source,
                dimensions,
                metric.fingerprint(),
                metric.is_aggregate(),
                id,
            ],
        )
        .map_err(|e| conflict_or(e, metric))?;
    if changed == 0 {
        return Err(StoreError::NotFound);
    }
    Ok(())
}

fn delete_metrics(conn: &Connection, filter: &MetricFilter) -> StoreResult<usize> {
    let (clause, values) = filter_clause(filter);
    let sql = format!("DELETE FROM metrics{}", clause);
    Ok(conn.execute(&sql, params_from_iter(values.iter()))?)
}

/// Build a `WHERE` clause and its positional parameters.
fn filter_clause(filter: &MetricFilter) -> (String, Vec<SqlValue>) {
    let mut clauses: Vec<&str> = Vec::new();
    let mut values: Vec<SqlValue> = Vec::new();

    if let Some(name) = &filter.name {
        clauses.push("name = ?");
        values.push(SqlValue::Text(name.clone()));
    }
    if let Some(pattern) = &filter.name_pattern {
        clauses.push("name GLOB ?");
        values.push(SqlValue::Text(sqlite_glob(pattern)));
    }
    if let Some(source) = &filter.source {
        clauses.push("source = ?");
        values.push(SqlValue::Text(source.clone()));
    }
    for (key, value) in &filter.dimensions {
        clauses.push("json_extract(dimensions, ?) = ?");
        values.push(SqlValue::Text(json_path(key)));
        values.push(SqlValue::Text(value.clone()));
    }
    if let Some(start) = &filter.start_time {
        clauses.push("timestamp >= ?");
        values.push(SqlValue::Text(db_time(start)));
    }
    if let Some(end) = &filter.end_time {
        clauses.push("timestamp < ?");
        values.push(SqlValue::Text(db_time(end)));
    }
    match filter.kind {
        Some(MetricKind::Raw) => clauses.push("is_aggregate = 0"),
        Some(MetricKind::Aggregate) => clauses.push("is_aggregate = 1"),
        None => {}
    }

    if clauses.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), values)
    }
}

/// Only `*` is a wildcard in name patterns; quote the other GLOB metacharacters.
fn sqlite_glob(pattern: &str) -> String {
    pattern.replace('[', "[[]").replace('?', "[?]")
}

fn json_path(key: &str) -> String {
    format!("$.\"{}\"", key.replace('"', "\\\""))
}

fn row_to_metric(row: &Row<'_>) -> SqlResult<Metric> {
    let time_str: String = row.get(3)?;
    let timestamp = parse_db_time(&time_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(InvalidTimestamp(time_str.clone())))
    })?;
    let dims_str: String = row.get(5)?;
    let dimensions: Dimensions = serde_json::from_str(&dims_str)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;

    Ok(Metric {
        id: Some(row.get(0)?),
        name: row.get(1)?,
        value: row.get(2)?,
        timestamp,
        source: row.get(4)?,
        dimensions,
        kind: if row.get::<_, bool>(6)? {
            MetricKind::Aggregate
        } else {
            MetricKind::Raw
        },
    })
}

fn conflict_or(err: rusqlite::Error, metric: &Metric) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
            StoreError::Conflict {
                name: metric.name.clone(),
                fingerprint: metric.fingerprint(),
            }
        }
        _ => StoreError::Sqlite(err),
    }
}

fn db_time(dt: &DateTime<Utc>) -> String {
    dt.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
