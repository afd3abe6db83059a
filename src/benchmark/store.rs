// src/benchmark/store.rs
//! Benchmark result persistence (SQLite)

use crate::benchmark::{BenchmarkResult, RunMeasurement, SinkSummary};
use crate::utils::errors::{PipelineError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Upper bound on one listing page
pub const MAX_PAGE_SIZE: usize = 200;

const COLUMNS: &str = "id, run_at, run_label, duration_sec, http_reqs, \
     http_req_duration_avg_ms, http_req_duration_p95_ms, error_rate, successful_registrations, \
     relational_processed, relational_errors, relational_throughput_per_sec, \
     relational_last_db_write_ms, relational_error_rate, \
     document_processed, document_errors, document_throughput_per_sec, \
     document_last_db_write_ms, document_error_rate, \
     raw_summary, raw_relational_metrics, raw_document_metrics, \
     relational_reported, document_reported";

/// Store of benchmark runs, one row per run
pub struct BenchmarkStore {
    db: Arc<Mutex<Connection>>,
}

impl BenchmarkStore {
    /// Open (or create) a results database at `path`
    pub async fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| {
            PipelineError::PersistenceFailure(format!("Failed to open database: {}", e))
        })?;
        let store = Self::with_connection(Arc::new(Mutex::new(conn))).await?;
        info!("Benchmark store initialized at {}", path);
        Ok(store)
    }

    /// Share a connection with another store (the relational sink)
    pub async fn with_connection(db: Arc<Mutex<Connection>>) -> Result<Self> {
        let store = Self { db };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        let db = self.db.lock().await;

        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS benchmark_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_at TEXT NOT NULL,
                run_label TEXT,
                duration_sec INTEGER,
                http_reqs INTEGER,
                http_req_duration_avg_ms REAL,
                http_req_duration_p95_ms REAL,
                error_rate REAL,
                successful_registrations INTEGER,
                relational_processed INTEGER,
                relational_errors INTEGER,
                relational_throughput_per_sec REAL,
                relational_last_db_write_ms REAL,
                relational_error_rate REAL,
                document_processed INTEGER,
                document_errors INTEGER,
                document_throughput_per_sec REAL,
                document_last_db_write_ms REAL,
                document_error_rate REAL,
                raw_summary TEXT,
                raw_relational_metrics TEXT,
                raw_document_metrics TEXT,
                relational_reported INTEGER NOT NULL DEFAULT 0,
                document_reported INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_benchmark_results_run_at ON benchmark_results(run_at);
            "#,
        )
        .map_err(|e| PipelineError::PersistenceFailure(format!("Schema creation failed: {}", e)))?;

        Ok(())
    }

    /// Persist one run and return the stored row
    pub async fn insert(&self, measurement: &RunMeasurement) -> Result<BenchmarkResult> {
        let run_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let relational = measurement.relational.clone().unwrap_or_default();
        let document = measurement.document.clone().unwrap_or_default();

        let db = self.db.lock().await;
        db.execute(
            r#"
            INSERT INTO benchmark_results (
                run_at, run_label, duration_sec, http_reqs,
                http_req_duration_avg_ms, http_req_duration_p95_ms, error_rate, successful_registrations,
                relational_processed, relational_errors, relational_throughput_per_sec,
                relational_last_db_write_ms, relational_error_rate,
                document_processed, document_errors, document_throughput_per_sec,
                document_last_db_write_ms, document_error_rate,
                raw_summary, raw_relational_metrics, raw_document_metrics,
                relational_reported, document_reported
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                run_at,
                measurement.run_label,
                measurement.duration_sec as i64,
                measurement.http_reqs as i64,
                measurement.http_req_duration_avg_ms,
                measurement.http_req_duration_p95_ms,
                measurement.error_rate,
                measurement.successful_registrations as i64,
                relational.processed.map(|n| n as i64),
                relational.errors.map(|n| n as i64),
                relational.throughput_per_sec,
                relational.last_db_write_ms,
                relational.error_rate,
                document.processed.map(|n| n as i64),
                document.errors.map(|n| n as i64),
                document.throughput_per_sec,
                document.last_db_write_ms,
                document.error_rate,
                measurement.raw_summary,
                measurement.raw_relational_metrics,
                measurement.raw_document_metrics,
                measurement.relational.is_some(),
                measurement.document.is_some(),
            ],
        )
        .map_err(|e| PipelineError::PersistenceFailure(format!("Insert failed: {}", e)))?;
        let id = db.last_insert_rowid();

        let row = db
            .query_row(
                &format!("SELECT {} FROM benchmark_results WHERE id = ?", COLUMNS),
                params![id],
                result_from_row,
            )
            .map_err(|e| PipelineError::PersistenceFailure(format!("Read-back failed: {}", e)))?;

        debug!("Stored benchmark result {}", id);
        Ok(row)
    }

    /// One page of runs, newest first, and the total row count
    pub async fn list(&self, limit: usize, offset: usize) -> Result<(Vec<BenchmarkResult>, u64)> {
        let limit = limit.min(MAX_PAGE_SIZE);
        let db = self.db.lock().await;

        let total: i64 = db
            .query_row("SELECT COUNT(*) FROM benchmark_results", [], |row| row.get(0))
            .map_err(|e| PipelineError::PersistenceFailure(format!("Count failed: {}", e)))?;

        let mut stmt = db
            .prepare(&format!(
                "SELECT {} FROM benchmark_results ORDER BY run_at DESC, id DESC LIMIT ? OFFSET ?",
                COLUMNS
            ))
            .map_err(|e| PipelineError::PersistenceFailure(format!("Query preparation failed: {}", e)))?;

        let results = stmt
            .query_map(params![limit as i64, offset as i64], result_from_row)
            .map_err(|e| PipelineError::PersistenceFailure(format!("Query execution failed: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| PipelineError::PersistenceFailure(format!("Result collection failed: {}", e)))?;

        Ok((results, total as u64))
    }

    /// Fetch one stored run by id
    pub async fn get(&self, id: i64) -> Result<Option<BenchmarkResult>> {
        let db = self.db.lock().await;
        db.query_row(
            &format!("SELECT {} FROM benchmark_results WHERE id = ?", COLUMNS),
            params![id],
            result_from_row,
        )
        .optional()
        .map_err(|e| PipelineError::PersistenceFailure(format!("Query failed: {}", e)))
    }

    /// Round-trip a trivial query on the results connection
    pub async fn ping(&self) -> Result<()> {
        let db = self.db.lock().await;
        db.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(|e| PipelineError::PersistenceFailure(format!("Ping failed: {}", e)))?;
        Ok(())
    }
}

fn result_from_row(row: &Row<'_>) -> rusqlite::Result<BenchmarkResult> {
    let run_at: String = row.get(1)?;

    Ok(BenchmarkResult {
        id: row.get(0)?,
        run_at: DateTime::parse_from_rfc3339(&run_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_default(),
        measurement: RunMeasurement {
            run_label: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            duration_sec: row.get::<_, Option<i64>>(3)?.unwrap_or(0) as u64,
            http_reqs: row.get::<_, Option<i64>>(4)?.unwrap_or(0) as u64,
            http_req_duration_avg_ms: row.get(5)?,
            http_req_duration_p95_ms: row.get(6)?,
            error_rate: row.get(7)?,
            successful_registrations: row.get::<_, Option<i64>>(8)?.unwrap_or(0) as u64,
            relational: summary_from_row(row, 9, 22)?,
            document: summary_from_row(row, 14, 23)?,
            raw_summary: row.get::<_, Option<serde_json::Value>>(19)?.unwrap_or_default(),
            raw_relational_metrics: row.get(20)?,
            raw_document_metrics: row.get(21)?,
        },
    })
}

/// Five sink columns starting at `first`, present when the `reported` flag is set
fn summary_from_row(
    row: &Row<'_>,
    first: usize,
    reported: usize,
) -> rusqlite::Result<Option<SinkSummary>> {
    if !row.get::<_, bool>(reported)? {
        return Ok(None);
    }
    Ok(Some(SinkSummary {
        processed: row.get::<_, Option<i64>>(first)?.map(|n| n as u64),
        errors: row.get::<_, Option<i64>>(first + 1)?.map(|n| n as u64),
        throughput_per_sec: row.get(first + 2)?,
        last_db_write_ms: row.get(first + 3)?,
        error_rate: row.get(first + 4)?,
    }))
}
