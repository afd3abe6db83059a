// src/ingress/mod.rs
//! Auth entry point
//!
//! A deliberately thin user registry that exists to trigger audit events.
//! Every successful register or login publishes one event, restricted to the
//! sinks named in the request's routing hint. Credentials are not verified
//! beyond presence, and no tokens are issued.

use crate::event::{AuditEvent, Metadata, RoutingTarget};
use crate::producer::EventProducer;
use crate::utils::errors::{PipelineError, Result};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Action recorded for a successful registration
pub const REGISTER_ACTION: &str = "user.register";
/// Action recorded for a successful login
pub const LOGIN_ACTION: &str = "user.login";
pub const USER_ENTITY: &str = "user";

/// Body of `POST /auth/register-user`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    pub firstname: Option<String>,
    pub lastname: Option<String>,
    pub phone_number: Option<String>,
}

/// Body of `POST /auth/login`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

/// Registered user as returned to callers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAccount {
    pub id: String,
    pub email: String,
    pub firstname: Option<String>,
    pub lastname: Option<String>,
    pub phone_number: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// In-memory user registry that produces audit events
pub struct AuthTrigger {
    users: DashMap<String, UserAccount>,
    next_id: AtomicU64,
    producer: EventProducer,
}

impl AuthTrigger {
    /// Trigger with an empty user table, publishing through `producer`
    pub fn new(producer: EventProducer) -> Self {
        Self {
            users: DashMap::new(),
            next_id: AtomicU64::new(1),
            producer,
        }
    }

    /// Registered users held in memory
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Create an account; fails on a malformed body or a taken email
    pub async fn register(
        &self,
        request: RegisterRequest,
        targets: &[RoutingTarget],
    ) -> Result<UserAccount> {
        let email = normalize_email(&request.email)?;
        if request.password.is_empty() {
            return Err(PipelineError::validation("password is required", None));
        }

        let account = match self.users.entry(email.clone()) {
            Entry::Occupied(_) => {
                return Err(PipelineError::Conflict("Email already registered".into()));
            }
            Entry::Vacant(slot) => {
                let account = UserAccount {
                    id: self.next_id.fetch_add(1, Ordering::Relaxed).to_string(),
                    email,
                    firstname: request.firstname,
                    lastname: request.lastname,
                    phone_number: request.phone_number,
                    created_at: Utc::now(),
                };
                slot.insert(account.clone());
                account
            }
        };

        let mut metadata = Metadata::new();
        metadata.insert("email".into(), Value::String(account.email.clone()));
        if let Some(name) = &account.firstname {
            metadata.insert("firstname".into(), Value::String(name.clone()));
        }
        self.emit(REGISTER_ACTION, &account, metadata, targets).await;

        Ok(account)
    }

    /// Log in as a registered user
    pub async fn login(&self, request: LoginRequest, targets: &[RoutingTarget]) -> Result<UserAccount> {
        let invalid = || PipelineError::Unauthorized("Invalid email or password".into());

        let email = normalize_email(&request.email).map_err(|_| invalid())?;
        if request.password.is_empty() {
            return Err(invalid());
        }
        let account = self
            .users
            .get(&email)
            .map(|entry| entry.value().clone())
            .ok_or_else(invalid)?;

        let mut metadata = Metadata::new();
        metadata.insert("email".into(), Value::String(account.email.clone()));
        self.emit(LOGIN_ACTION, &account, metadata, targets).await;

        Ok(account)
    }

    /// Publish without letting the audit pipeline fail the request
    async fn emit(
        &self,
        action: &str,
        account: &UserAccount,
        metadata: Metadata,
        targets: &[RoutingTarget],
    ) {
        let event = match AuditEvent::new(action, USER_ENTITY) {
            Ok(event) => event
                .with_actor(account.id.clone())
                .with_entity_id(account.id.clone())
                .with_metadata(metadata),
            Err(e) => {
                warn!("Could not build {} event: {}", action, e);
                return;
            }
        };

        match self.producer.publish(event, targets).await {
            Ok(sent) => debug!("{} for user {} sent to {:?}", action, account.id, sent),
            Err(e) => warn!("Audit publish for {} failed: {}", action, e),
        }
    }
}

fn normalize_email(raw: &str) -> Result<String> {
    let email = raw.trim().to_ascii_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && !domain.is_empty(),
        None => false,
    };
    if !valid {
        return Err(PipelineError::validation(
            "email must be a valid address",
            Some(raw.to_string()),
        ));
    }
    Ok(email)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, Topology};
    use crate::producer::BrokerHandle;
    use std::sync::Arc;

    fn register_request(email: &str) -> RegisterRequest {
        RegisterRequest {
            email: email.to_string(),
            password: "BenchPass123!".to_string(),
            firstname: Some("Benchmark".to_string()),
            ..Default::default()
        }
    }

    async fn trigger() -> (Arc<MemoryBroker>, AuthTrigger) {
        let broker = Arc::new(MemoryBroker::new());
        let handle = BrokerHandle::with_broker(broker.clone(), Topology::default()).await;
        (broker, AuthTrigger::new(EventProducer::new(handle)))
    }

    #[tokio::test]
    async fn test_register_then_login_publishes_events() {
        let (broker, auth) = trigger().await;

        let account = auth.register(register_request("a@bench.local"), &[]).await.unwrap();
        assert_eq!(account.id, "1");
        let login = LoginRequest {
            email: "A@bench.local".into(),
            password: "x".into(),
        };
        assert_eq!(auth.login(login, &[]).await.unwrap(), account);

        assert_eq!(broker.queue_depth("audit.relational"), Some(2));
        assert_eq!(broker.queue_depth("audit.document"), Some(2));
    }

    #[tokio::test]
    async fn test_routing_hint_restricts_events() {
        let (broker, auth) = trigger().await;
        auth.register(register_request("b@bench.local"), &[RoutingTarget::Document])
            .await
            .unwrap();

        assert_eq!(broker.queue_depth("audit.relational"), Some(0));
        assert_eq!(broker.queue_depth("audit.document"), Some(1));
    }

    #[tokio::test]
    async fn test_duplicate_registration_conflicts() {
        let (_broker, auth) = trigger().await;
        auth.register(register_request("c@bench.local"), &[]).await.unwrap();

        let result = auth.register(register_request("c@bench.local"), &[]).await;
        assert!(matches!(result, Err(PipelineError::Conflict(_))));
        assert_eq!(auth.user_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_inputs() {
        let (broker, auth) = trigger().await;

        let result = auth.register(register_request("not-an-email"), &[]).await;
        assert!(matches!(result, Err(PipelineError::Validation { .. })));

        let unknown = LoginRequest {
            email: "nobody@bench.local".into(),
            password: "x".into(),
        };
        let result = auth.login(unknown, &[]).await;
        assert!(matches!(result, Err(PipelineError::Unauthorized(_))));
        assert_eq!(broker.queue_depth("audit.relational"), Some(0));
    }

    #[tokio::test]
    async fn test_works_without_broker() {
        let auth = AuthTrigger::new(EventProducer::disabled());
        assert!(auth.register(register_request("d@bench.local"), &[]).await.is_ok());
    }
}
