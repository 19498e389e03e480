//! Append-only per-instance audit trail
//!
//! Pure recording; nothing here affects control flow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use flowforge_core::InstanceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
    NodeStarted,
    NodeCompleted,
    NodeFailed,
    ApprovalRequested,
    ApprovalDecision,
    DelayStarted,
    DelayCompleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    #[serde(default)]
    pub node_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, message: impl Into<String>) -> Self {
        Self {
            event_type,
            node_id: None,
            message: message.into(),
            details: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// In-memory audit store.
#[derive(Clone)]
pub struct AuditLog {
    events: Arc<RwLock<HashMap<InstanceId, Vec<AuditEvent>>>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn record(&self, instance_id: InstanceId, event: AuditEvent) {
        let mut events = self.events.write().await;
        events.entry(instance_id).or_default().push(event);
    }

    /// Full trail for an instance, in recording order.
    pub async fn trail(&self, instance_id: InstanceId) -> Vec<AuditEvent> {
        let events = self.events.read().await;
        events.get(&instance_id).cloned().unwrap_or_default()
    }

    /// Drop trails for instances finished before the cutoff.
    pub async fn prune_before(&self, cutoff: DateTime<Utc>) {
        let mut events = self.events.write().await;
        events.retain(|_, trail| {
            trail
                .last()
                .map_or(false, |event| event.timestamp >= cutoff)
        });
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_trail_keeps_order() {
        let log = AuditLog::new();
        let instance_id = InstanceId::new();

        log.record(
            instance_id,
            AuditEvent::new(AuditEventType::WorkflowStarted, "started"),
        )
        .await;
        log.record(
            instance_id,
            AuditEvent::new(AuditEventType::NodeStarted, "entering node")
                .with_node("a")
                .with_details(json!({"attempt": 1})),
        )
        .await;

        let trail = log.trail(instance_id).await;
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[0].event_type, AuditEventType::WorkflowStarted);
        assert_eq!(trail[1].node_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_unknown_instance_has_empty_trail() {
        let log = AuditLog::new();
        assert!(log.trail(InstanceId::new()).await.is_empty());
    }
}
