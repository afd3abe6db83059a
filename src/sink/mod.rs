// src/sink/mod.rs
//! Audit record sinks
//!
//! Each sink is the sole writer of its own record collection. Writes are
//! insert-only: there is no upsert key, so a redelivered event is stored
//! twice.
//!
//! - **RelationalSink**: SQLite table `audit_logs`
//! - **DocumentSink**: MongoDB collection

pub mod document;
pub mod relational;

use crate::event::{AuditEvent, AuditRecord, RoutingTarget};
use crate::utils::errors::Result;
use async_trait::async_trait;

pub use document::DocumentSink;
pub use relational::RelationalSink;

/// Write path of one sink store
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Which sink this is
    fn target(&self) -> RoutingTarget;

    /// Persist one record derived from `event`, stamping the sink id and
    /// write time
    async fn write(&self, event: &AuditEvent) -> Result<AuditRecord>;

    /// Check that the store answers
    async fn ping(&self) -> Result<()>;
}
