//! Instance and node-execution state

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use flowforge_core::{DefinitionId, ExecutionId, InstanceId, TargetRef};

use crate::{Context, EngineError, Result};

/// Status of one workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Waiting,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed
                | InstanceStatus::Failed
                | InstanceStatus::Cancelled
                | InstanceStatus::Timeout
        )
    }

    /// Counts toward a definition's `max_concurrent` limit.
    pub fn is_active(&self) -> bool {
        matches!(self, InstanceStatus::Running | InstanceStatus::Waiting)
    }
}

/// One execution of a definition against concrete trigger data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: InstanceId,
    pub definition_id: DefinitionId,
    pub definition_version: u32,
    pub status: InstanceStatus,
    pub current_node: Option<String>,
    /// Append-only run context; node outputs land under `node_<id>`.
    pub context: Context,
    #[serde(default)]
    pub target: Option<TargetRef>,
    #[serde(default)]
    pub resume_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resume_data: Option<Context>,
    #[serde(default)]
    pub error_node: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Node executions consumed so far, bounded by the engine step budget.
    #[serde(default)]
    pub steps_taken: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    pub fn new(
        definition_id: DefinitionId,
        definition_version: u32,
        target: Option<TargetRef>,
    ) -> Self {
        Self {
            id: InstanceId::new(),
            definition_id,
            definition_version,
            status: InstanceStatus::Running,
            current_node: None,
            context: Context::new(),
            target,
            resume_at: None,
            resume_data: None,
            error_node: None,
            error_message: None,
            steps_taken: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Append a context entry without overwriting.
    ///
    /// A key that already exists keeps its first value; revisits through an
    /// error branch must not rewrite recorded history.
    pub fn append_context(&mut self, key: impl Into<String>, value: serde_json::Value) {
        let key = key.into();
        if self.context.contains_key(&key) {
            tracing::debug!(
                instance_id = %self.id,
                key = %key,
                "Context key already recorded, keeping first value"
            );
            return;
        }
        self.context.insert(key, value);
    }

    /// Merge resume data under the `resume` context key.
    ///
    /// Unlike node outputs this key accumulates across suspensions: later
    /// payloads add fields, first writer wins per field.
    pub fn merge_resume_context(&mut self, resume_data: &Context) {
        let slot = self
            .context
            .entry("resume".to_string())
            .or_insert_with(|| serde_json::Value::Object(Context::new()));

        if let serde_json::Value::Object(existing) = slot {
            for (key, value) in resume_data {
                existing.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
    }
}

/// Status of one node entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Waiting,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            ExecutionStatus::Pending | ExecutionStatus::Running | ExecutionStatus::Waiting
        )
    }
}

/// One entry of a node within an instance; retries create fresh records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: ExecutionId,
    pub instance_id: InstanceId,
    pub node_id: String,
    pub status: ExecutionStatus,
    pub attempt_number: u32,
    #[serde(default)]
    pub input_data: Context,
    #[serde(default)]
    pub output_data: Context,
    #[serde(default)]
    pub error: Option<String>,
    /// Declared delay before the next attempt; recorded, not slept in-process.
    #[serde(default)]
    pub retry_delay_minutes: Option<u32>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub approval_status: Option<String>,
    #[serde(default)]
    pub approved_by: Option<String>,
    #[serde(default)]
    pub approval_comment: Option<String>,
}

impl NodeExecution {
    pub fn new(instance_id: InstanceId, node_id: impl Into<String>, attempt_number: u32) -> Self {
        Self {
            id: ExecutionId::new(),
            instance_id,
            node_id: node_id.into(),
            status: ExecutionStatus::Pending,
            attempt_number,
            input_data: Context::new(),
            output_data: Context::new(),
            error: None,
            retry_delay_minutes: None,
            started_at: None,
            finished_at: None,
            approval_status: None,
            approved_by: None,
            approval_comment: None,
        }
    }
}

/// Instance repository trait
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    async fn save(&self, instance: &WorkflowInstance) -> Result<()>;
    async fn get(&self, id: InstanceId) -> Result<Option<WorkflowInstance>>;
    async fn update(&self, instance: &WorkflowInstance) -> Result<()>;

    /// Instances of a definition in {running, waiting}.
    async fn count_active(&self, definition_id: DefinitionId) -> Result<usize>;

    /// Waiting instances whose `resume_at` has elapsed; feeds the external
    /// delay poller.
    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<WorkflowInstance>>;

    /// Atomically transition status when the current status is in `from`.
    ///
    /// Returns the post-transition instance; rejects with `InvalidState`
    /// otherwise. This is the exactly-once gate for resume and cancel.
    async fn transition(
        &self,
        id: InstanceId,
        from: &[InstanceStatus],
        to: InstanceStatus,
    ) -> Result<WorkflowInstance>;
}

/// In-memory instance repository
pub struct InMemoryInstanceRepository {
    instances: Arc<RwLock<HashMap<InstanceId, WorkflowInstance>>>,
}

impl InMemoryInstanceRepository {
    pub fn new() -> Self {
        Self {
            instances: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryInstanceRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceRepository for InMemoryInstanceRepository {
    async fn save(&self, instance: &WorkflowInstance) -> Result<()> {
        let mut instances = self.instances.write().await;
        instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get(&self, id: InstanceId) -> Result<Option<WorkflowInstance>> {
        let instances = self.instances.read().await;
        Ok(instances.get(&id).cloned())
    }

    async fn update(&self, instance: &WorkflowInstance) -> Result<()> {
        let mut instances = self.instances.write().await;
        if instances.contains_key(&instance.id) {
            instances.insert(instance.id, instance.clone());
            Ok(())
        } else {
            Err(EngineError::NotFound(instance.id.to_string()))
        }
    }

    async fn count_active(&self, definition_id: DefinitionId) -> Result<usize> {
        let instances = self.instances.read().await;
        Ok(instances
            .values()
            .filter(|i| i.definition_id == definition_id && i.status.is_active())
            .count())
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<WorkflowInstance>> {
        let instances = self.instances.read().await;
        Ok(instances
            .values()
            .filter(|i| {
                i.status == InstanceStatus::Waiting
                    && i.resume_at.map_or(false, |at| at <= now)
            })
            .cloned()
            .collect())
    }

    async fn transition(
        &self,
        id: InstanceId,
        from: &[InstanceStatus],
        to: InstanceStatus,
    ) -> Result<WorkflowInstance> {
        // Single write lock covers check and swap; a duplicate caller
        // observes the post-transition status and is rejected.
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;

        if !from.contains(&instance.status) {
            return Err(EngineError::InvalidState(format!(
                "instance {} is {:?}, expected one of {:?}",
                id, instance.status, from
            )));
        }

        instance.status = to;
        Ok(instance.clone())
    }
}

/// Node execution repository trait
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    async fn save(&self, execution: &NodeExecution) -> Result<()>;
    async fn get(&self, id: ExecutionId) -> Result<Option<NodeExecution>>;
    async fn update(&self, execution: &NodeExecution) -> Result<()>;
    async fn list_for_instance(&self, instance_id: InstanceId) -> Result<Vec<NodeExecution>>;

    /// The single execution in {running, waiting} for an instance, if any.
    async fn active_for_instance(&self, instance_id: InstanceId) -> Result<Option<NodeExecution>>;
}

/// In-memory node execution repository
pub struct InMemoryExecutionRepository {
    executions: Arc<RwLock<HashMap<ExecutionId, NodeExecution>>>,
    /// Insertion order per instance, so trails read in execution order.
    by_instance: Arc<RwLock<HashMap<InstanceId, Vec<ExecutionId>>>>,
}

impl InMemoryExecutionRepository {
    pub fn new() -> Self {
        Self {
            executions: Arc::new(RwLock::new(HashMap::new())),
            by_instance: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryExecutionRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryExecutionRepository {
    async fn save(&self, execution: &NodeExecution) -> Result<()> {
        let mut executions = self.executions.write().await;
        let mut by_instance = self.by_instance.write().await;

        if !executions.contains_key(&execution.id) {
            by_instance
                .entry(execution.instance_id)
                .or_default()
                .push(execution.id);
        }
        executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get(&self, id: ExecutionId) -> Result<Option<NodeExecution>> {
        let executions = self.executions.read().await;
        Ok(executions.get(&id).cloned())
    }

    async fn update(&self, execution: &NodeExecution) -> Result<()> {
        let mut executions = self.executions.write().await;
        if executions.contains_key(&execution.id) {
            executions.insert(execution.id, execution.clone());
            Ok(())
        } else {
            Err(EngineError::NotFound(execution.id.to_string()))
        }
    }

    async fn list_for_instance(&self, instance_id: InstanceId) -> Result<Vec<NodeExecution>> {
        let executions = self.executions.read().await;
        let by_instance = self.by_instance.read().await;

        Ok(by_instance
            .get(&instance_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| executions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn active_for_instance(&self, instance_id: InstanceId) -> Result<Option<NodeExecution>> {
        let executions = self.list_for_instance(instance_id).await?;
        Ok(executions
            .into_iter()
            .find(|e| matches!(e.status, ExecutionStatus::Running | ExecutionStatus::Waiting)))
    }
}
