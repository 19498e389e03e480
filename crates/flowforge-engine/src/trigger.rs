//! Event-to-workflow trigger matching
//!
//! Matches incoming events against active definitions by trigger type and
//! entry conditions, starting one instance per match. Delivery transports
//! (webhooks, queues) live in the host.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use flowforge_core::{InstanceId, TargetRef};

use crate::condition::evaluate;
use crate::definition::DefinitionRepository;
use crate::runner::InstanceRunner;
use crate::{Context, Result};

/// An event that may start workflows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub id: String,
    /// Matched against `TriggerSpec::trigger_type`.
    pub event_type: String,
    pub payload: Context,
    #[serde(default)]
    pub target: Option<TargetRef>,
    pub timestamp: DateTime<Utc>,
}

impl TriggerEvent {
    pub fn new(event_type: impl Into<String>, payload: Context) -> Self {
        Self {
            id: format!("evt_{}", Uuid::new_v4().simple()),
            event_type: event_type.into(),
            payload,
            target: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_target(mut self, target: TargetRef) -> Self {
        self.target = Some(target);
        self
    }
}

/// Starts instances for definitions matched by an event.
pub struct TriggerRouter {
    definitions: Arc<dyn DefinitionRepository>,
    runner: Arc<InstanceRunner>,
}

impl TriggerRouter {
    pub fn new(definitions: Arc<dyn DefinitionRepository>, runner: Arc<InstanceRunner>) -> Self {
        Self {
            definitions,
            runner,
        }
    }

    /// Start every active definition the event matches; failures to start
    /// one workflow never block the others.
    pub async fn process_event(&self, event: TriggerEvent) -> Result<Vec<InstanceId>> {
        let definitions = self.definitions.list_active().await?;
        let mut started = Vec::new();

        tracing::debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            candidate_count = definitions.len(),
            "Processing trigger event"
        );

        for definition in definitions {
            if definition.trigger.trigger_type != event.event_type {
                continue;
            }
            if !evaluate(&definition.entry_conditions, &event.payload) {
                continue;
            }

            match self
                .runner
                .start(definition.id, event.payload.clone(), event.target.clone())
                .await
            {
                Ok(instance_id) => {
                    tracing::info!(
                        event_id = %event.id,
                        definition_id = %definition.id,
                        instance_id = %instance_id,
                        "Workflow triggered by event"
                    );
                    started.push(instance_id);
                }
                Err(e) => {
                    tracing::error!(
                        event_id = %event.id,
                        definition_id = %definition.id,
                        error = %e,
                        "Failed to start workflow from event"
                    );
                }
            }
        }

        Ok(started)
    }
}
