// src/sink/document.rs
//! Document sink backed by MongoDB

use crate::event::{AuditEvent, AuditRecord, Metadata, RoutingTarget};
use crate::sink::AuditSink;
use crate::utils::config::DocumentConfig;
use crate::utils::errors::{PipelineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use mongodb::bson::{doc, oid::ObjectId, DateTime as BsonDateTime};
use mongodb::{Client, Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Stored shape of one audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditDocument {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub action: String,
    pub actor: Option<String>,
    pub entity: String,
    pub entity_id: Option<String>,
    pub metadata: Option<Metadata>,
    pub timestamp: Option<BsonDateTime>,
    pub created_at: BsonDateTime,
}

impl AuditDocument {
    /// Document for `event` under a fresh ObjectId
    pub fn from_event(event: &AuditEvent, created_at: DateTime<Utc>) -> Self {
        Self {
            id: ObjectId::new(),
            action: event.action.clone(),
            actor: event.actor.clone(),
            entity: event.entity.clone(),
            entity_id: event.entity_id.clone(),
            metadata: event.metadata.clone(),
            timestamp: event
                .timestamp
                .map(|t| BsonDateTime::from_millis(t.timestamp_millis())),
            created_at: BsonDateTime::from_millis(created_at.timestamp_millis()),
        }
    }

    /// Read-back form, with the ObjectId rendered as hex
    pub fn into_record(self) -> AuditRecord {
        AuditRecord {
            id: self.id.to_hex(),
            action: self.action,
            actor: self.actor,
            entity: self.entity,
            entity_id: self.entity_id,
            metadata: self.metadata,
            timestamp: self.timestamp.map(from_bson_time),
            created_at: from_bson_time(self.created_at),
        }
    }
}

fn from_bson_time(t: BsonDateTime) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(t.timestamp_millis())
        .single()
        .unwrap_or_default()
}

/// Document audit store
pub struct DocumentSink {
    database: Database,
    collection: Collection<AuditDocument>,
}

impl DocumentSink {
    /// Create a client for the configured deployment.
    ///
    /// The driver connects lazily, so an unreachable server is not an error
    /// here; index setup failing is only logged and writes will fail later.
    pub async fn connect(config: &DocumentConfig) -> Result<Self> {
        let client = Client::with_uri_str(&config.uri)
            .await
            .map_err(|e| PipelineError::StoreWriteFailure(format!("Invalid MongoDB URI: {}", e)))?;

        let database = client.database(&config.database);
        let collection = database.collection::<AuditDocument>(&config.collection);
        let sink = Self {
            database,
            collection,
        };

        if let Err(e) = sink.ensure_indexes().await {
            warn!("Document sink index setup failed: {}", e);
        }

        info!(
            "Document sink using {}.{}",
            config.database, config.collection
        );
        Ok(sink)
    }

    async fn ensure_indexes(&self) -> Result<()> {
        let indexes = vec![
            IndexModel::builder().keys(doc! { "createdAt": -1 }).build(),
            IndexModel::builder()
                .keys(doc! { "action": 1, "createdAt": -1 })
                .build(),
        ];

        self.collection
            .create_indexes(indexes, None)
            .await
            .map_err(|e| PipelineError::StoreWriteFailure(format!("Index creation failed: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl AuditSink for DocumentSink {
    fn target(&self) -> RoutingTarget {
        RoutingTarget::Document
    }

    async fn write(&self, event: &AuditEvent) -> Result<AuditRecord> {
        let document = AuditDocument::from_event(event, Utc::now());

        self.collection
            .insert_one(&document, None)
            .await
            .map_err(|e| PipelineError::StoreWriteFailure(format!("Insert failed: {}", e)))?;

        debug!("Stored audit document {} ({})", document.id, event.action);
        Ok(document.into_record())
    }

    async fn ping(&self) -> Result<()> {
        self.database
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| PipelineError::StoreWriteFailure(format!("Ping failed: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_from_event() {
        let now = Utc::now();
        let metadata = json!({"ip": "10.0.0.1"}).as_object().unwrap().clone();
        let event = AuditEvent::new("user.login", "user")
            .unwrap()
            .with_actor("bob")
            .with_metadata(metadata.clone())
            .with_timestamp(now);

        let document = AuditDocument::from_event(&event, now);
        let bson = mongodb::bson::to_document(&document).unwrap();
        assert!(bson.contains_key("_id"));
        assert!(bson.contains_key("createdAt"));
        assert!(bson.contains_key("entityId"));

        let id = document.id.to_hex();
        let record = document.into_record();
        assert_eq!(record.id, id);
        assert_eq!(record.metadata, Some(metadata));
        assert_eq!(
            record.timestamp.unwrap().timestamp_millis(),
            now.timestamp_millis()
        );
    }

    #[test]
    fn test_each_document_gets_new_id() {
        let event = AuditEvent::new("user.login", "user").unwrap();
        let a = AuditDocument::from_event(&event, Utc::now());
        let b = AuditDocument::from_event(&event, Utc::now());
        assert_ne!(a.id, b.id);
    }
}
