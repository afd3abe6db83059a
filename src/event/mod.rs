// src/event/mod.rs
//! Audit event envelope
//!
//! The envelope travels producer → broker → consumer as JSON with camelCase
//! field names. It carries no identifier of its own, so a redelivered message
//! is indistinguishable from the first delivery and every sink persists it again.

use crate::utils::errors::{PipelineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque, order-preserving key/value payload stored and forwarded verbatim
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Audit event published on a state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Triggering operation, e.g. `user.register`
    pub action: String,

    /// Acting principal
    #[serde(default)]
    pub actor: Option<String>,

    /// Affected resource type
    pub entity: String,

    #[serde(default)]
    pub entity_id: Option<String>,

    #[serde(default)]
    pub metadata: Option<Metadata>,

    /// Set by the producer at publish time
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl AuditEvent {
    /// Create an event for `action` on `entity`
    pub fn new(action: impl Into<String>, entity: impl Into<String>) -> Result<Self> {
        let event = Self {
            action: action.into(),
            actor: None,
            entity: entity.into(),
            entity_id: None,
            metadata: None,
            timestamp: None,
        };
        event.validate()?;
        Ok(event)
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    /// Replace the metadata map
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Set the event time; the producer stamps one when unset
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// `action` and `entity` must be non-empty
    pub fn validate(&self) -> Result<()> {
        if self.action.trim().is_empty() {
            return Err(PipelineError::MalformedEvent("action is empty".into()));
        }
        if self.entity.trim().is_empty() {
            return Err(PipelineError::MalformedEvent("entity is empty".into()));
        }
        Ok(())
    }

    /// Serialize to the wire body
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| PipelineError::MalformedEvent(format!("Serialization error: {}", e)))
    }

    /// Parse and validate a wire body
    pub fn from_bytes(body: &[u8]) -> Result<Self> {
        let event: AuditEvent = serde_json::from_slice(body)
            .map_err(|e| PipelineError::MalformedEvent(format!("Parse error: {}", e)))?;
        event.validate()?;
        Ok(event)
    }
}

/// Sink selected by a routing key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingTarget {
    #[serde(alias = "postgres")]
    Relational,
    #[serde(alias = "mongodb")]
    Document,
}

impl RoutingTarget {
    /// Every sink, in broadcast order
    pub const ALL: [RoutingTarget; 2] = [RoutingTarget::Relational, RoutingTarget::Document];

    /// Lowercase name used in logs, metrics and routing hints
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingTarget::Relational => "relational",
            RoutingTarget::Document => "document",
        }
    }
}

impl fmt::Display for RoutingTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutingTarget {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relational" | "postgres" => Ok(RoutingTarget::Relational),
            "document" | "mongodb" => Ok(RoutingTarget::Document),
            other => Err(PipelineError::validation(
                "routing target must be one of relational, document",
                Some(other.to_string()),
            )),
        }
    }
}

/// Resolve a target restriction to the sinks that receive the event.
///
/// An empty restriction broadcasts to every sink. The result is deduplicated
/// and in canonical order.
pub fn resolve_targets(targets: &[RoutingTarget]) -> Vec<RoutingTarget> {
    if targets.is_empty() {
        return RoutingTarget::ALL.to_vec();
    }
    RoutingTarget::ALL
        .into_iter()
        .filter(|t| targets.contains(t))
        .collect()
}

/// Audit event as persisted by one sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    /// Sink-assigned identifier
    pub id: String,

    pub action: String,
    pub actor: Option<String>,
    pub entity: String,
    pub entity_id: Option<String>,
    pub metadata: Option<Metadata>,

    /// Producer's publish time, if the envelope carried one
    pub timestamp: Option<DateTime<Utc>>,

    /// Sink write time
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    /// Persisted form of `event` under the store-assigned `id`
    pub fn from_event(id: impl Into<String>, event: &AuditEvent, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            action: event.action.clone(),
            actor: event.actor.clone(),
            entity: event.entity.clone(),
            entity_id: event.entity_id.clone(),
            metadata: event.metadata.clone(),
            timestamp: event.timestamp,
            created_at,
        }
    }
}
