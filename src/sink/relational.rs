// src/sink/relational.rs
//! Relational sink backed by SQLite

use crate::event::{AuditEvent, AuditRecord, Metadata, RoutingTarget};
use crate::sink::AuditSink;
use crate::utils::config::RelationalConfig;
use crate::utils::errors::{PipelineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Relational audit store
pub struct RelationalSink {
    db: Arc<Mutex<Connection>>,
}

impl RelationalSink {
    /// Open (or create) the store at the configured path
    pub async fn open(config: &RelationalConfig) -> Result<Self> {
        let conn = Connection::open(&config.path).map_err(|e| {
            PipelineError::StoreWriteFailure(format!("Failed to open database: {}", e))
        })?;

        let sink = Self::with_connection(Arc::new(Mutex::new(conn))).await?;
        info!("Relational sink initialized at {}", config.path);
        Ok(sink)
    }

    /// Private in-memory store
    pub async fn in_memory() -> Result<Self> {
        Self::open(&RelationalConfig {
            path: ":memory:".to_string(),
        })
        .await
    }

    /// Use an already-open connection
    pub async fn with_connection(db: Arc<Mutex<Connection>>) -> Result<Self> {
        let sink = Self { db };
        sink.init_schema().await?;
        Ok(sink)
    }

    /// Shared handle to the underlying connection
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.db.clone()
    }

    async fn init_schema(&self) -> Result<()> {
        let db = self.db.lock().await;

        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS audit_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                action TEXT NOT NULL,
                actor TEXT,
                entity TEXT NOT NULL,
                entity_id TEXT,
                metadata TEXT,
                timestamp TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_logs_created_at ON audit_logs(created_at);
            CREATE INDEX IF NOT EXISTS idx_audit_logs_action_created ON audit_logs(action, created_at);
            "#,
        )
        .map_err(|e| PipelineError::StoreWriteFailure(format!("Schema creation failed: {}", e)))?;

        Ok(())
    }

    /// Most recent records first
    pub async fn list_recent(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        let db = self.db.lock().await;

        let mut stmt = db
            .prepare(
                "SELECT id, action, actor, entity, entity_id, metadata, timestamp, created_at
                 FROM audit_logs ORDER BY id DESC LIMIT ?",
            )
            .map_err(|e| PipelineError::StoreWriteFailure(format!("Query preparation failed: {}", e)))?;

        let records = stmt
            .query_map(params![limit as i64], record_from_row)
            .map_err(|e| PipelineError::StoreWriteFailure(format!("Query execution failed: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| PipelineError::StoreWriteFailure(format!("Result collection failed: {}", e)))?;

        Ok(records)
    }

    /// Rows in the audit table
    pub async fn count(&self) -> Result<u64> {
        let db = self.db.lock().await;
        let count: i64 = db
            .query_row("SELECT COUNT(*) FROM audit_logs", [], |row| row.get(0))
            .map_err(|e| PipelineError::StoreWriteFailure(format!("Count failed: {}", e)))?;
        Ok(count as u64)
    }
}

#[async_trait]
impl AuditSink for RelationalSink {
    fn target(&self) -> RoutingTarget {
        RoutingTarget::Relational
    }

    async fn write(&self, event: &AuditEvent) -> Result<AuditRecord> {
        let created_at = Utc::now();
        let metadata = event
            .metadata
            .as_ref()
            .map(|m| serde_json::Value::Object(m.clone()));

        let db = self.db.lock().await;
        db.execute(
            r#"
            INSERT INTO audit_logs (action, actor, entity, entity_id, metadata, timestamp, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                event.action,
                event.actor,
                event.entity,
                event.entity_id,
                metadata,
                event.timestamp.map(|t| t.to_rfc3339()),
                created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| PipelineError::StoreWriteFailure(format!("Insert failed: {}", e)))?;
        let id = db.last_insert_rowid();
        drop(db);

        debug!("Stored audit record {} ({})", id, event.action);
        Ok(AuditRecord::from_event(id.to_string(), event, created_at))
    }

    async fn ping(&self) -> Result<()> {
        let db = self.db.lock().await;
        db.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(|e| PipelineError::StoreWriteFailure(format!("Ping failed: {}", e)))?;
        Ok(())
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<AuditRecord> {
    let metadata: Option<serde_json::Value> = row.get(5)?;
    let timestamp: Option<String> = row.get(6)?;
    let created_at: String = row.get(7)?;

    Ok(AuditRecord {
        id: row.get::<_, i64>(0)?.to_string(),
        action: row.get(1)?,
        actor: row.get(2)?,
        entity: row.get(3)?,
        entity_id: row.get(4)?,
        metadata: metadata.and_then(|v| match v {
            serde_json::Value::Object(map) => Some::<Metadata>(map),
            _ => None,
        }),
        timestamp: timestamp.as_deref().and_then(parse_time),
        created_at: parse_time(&created_at).unwrap_or_default(),
    })
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn event() -> AuditEvent {
        let metadata = json!({"ip": "10.0.0.1", "attempt": 2}).as_object().unwrap().clone();
        AuditEvent::new("user.register", "user")
            .unwrap()
            .with_actor("alice@example.com")
            .with_entity_id("7")
            .with_metadata(metadata)
            .with_timestamp(Utc::now())
    }

    #[tokio::test]
    async fn test_sink_creation() {
        let dir = tempdir().unwrap();
        let config = RelationalConfig {
            path: dir.path().join("audit.db").to_string_lossy().into_owned(),
        };

        let sink = RelationalSink::open(&config).await;
        assert!(sink.is_ok());
        assert!(sink.unwrap().ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_write_assigns_id_and_created_at() {
        let sink = RelationalSink::in_memory().await.unwrap();
        let event = event();

        let record = sink.write(&event).await.unwrap();
        assert_eq!(record.id, "1");
        assert_eq!(record.action, "user.register");
        assert_eq!(record.timestamp, event.timestamp);
        assert!(record.created_at >= event.timestamp.unwrap());

        let stored = sink.list_recent(10).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].metadata, event.metadata);
        assert_eq!(stored[0].entity_id.as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn test_duplicates_are_stored_twice() {
        let sink = RelationalSink::in_memory().await.unwrap();
        let event = event();

        let first = sink.write(&event).await.unwrap();
        let second = sink.write(&event).await.unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(sink.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_write_fails_when_table_missing() {
        let sink = RelationalSink::in_memory().await.unwrap();
        sink.connection()
            .lock()
            .await
            .execute("DROP TABLE audit_logs", [])
            .unwrap();

        let result = sink.write(&event()).await;
        assert!(matches!(result, Err(PipelineError::StoreWriteFailure(_))));
    }
}
