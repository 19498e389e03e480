//! Instance run-loop and lifecycle
//!
//! One instance executes strictly sequentially: a single node is in flight
//! at a time and the loop is cooperative, suspending only when a node
//! returns a waiting outcome. Many instances may run concurrently; the only
//! state they share is the per-definition run counters, which are atomic.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{Duration, Utc};
use flowforge_core::{DefinitionId, EngineConfig, InstanceId, TargetRef};

use crate::approval::{ApprovalCoordinator, ApprovalOptions};
use crate::audit::{AuditEvent, AuditEventType, AuditLog};
use crate::condition::evaluate;
use crate::definition::{DefinitionRepository, DefinitionStatus, WorkflowDefinition};
use crate::executor::{NodeExecutor, NodeOutcome, OutcomeStatus};
use crate::graph::WorkflowGraph;
use crate::instance::{
    ExecutionRepository, ExecutionStatus, InstanceRepository, InstanceStatus, NodeExecution,
    WorkflowInstance,
};
use crate::node::{Node, NodeConfig, NodeKind, OnErrorPolicy};
use crate::router::ConnectionRouter;
use crate::{Context, EngineError, Result};

/// Per-definition aggregate counters; atomic so concurrent completions
/// never lose updates.
#[derive(Debug, Default)]
pub struct RunStats {
    run_count: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatsSnapshot {
    pub run_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
}

impl RunStats {
    pub fn snapshot(&self) -> RunStatsSnapshot {
        RunStatsSnapshot {
            run_count: self.run_count.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
        }
    }
}

/// The orchestrator: owns the run-loop, suspend/resume, error-policy
/// application, and instance lifecycle.
pub struct InstanceRunner {
    definitions: Arc<dyn DefinitionRepository>,
    instances: Arc<dyn InstanceRepository>,
    executions: Arc<dyn ExecutionRepository>,
    executor: NodeExecutor,
    audit: AuditLog,
    stats: DashMap<DefinitionId, Arc<RunStats>>,
    config: EngineConfig,
    approvals: OnceLock<Arc<ApprovalCoordinator>>,
}

impl InstanceRunner {
    pub fn new(
        definitions: Arc<dyn DefinitionRepository>,
        instances: Arc<dyn InstanceRepository>,
        executions: Arc<dyn ExecutionRepository>,
        executor: NodeExecutor,
        audit: AuditLog,
        config: EngineConfig,
    ) -> Self {
        Self {
            definitions,
            instances,
            executions,
            executor,
            audit,
            stats: DashMap::new(),
            config,
            approvals: OnceLock::new(),
        }
    }

    /// Wire in the approval coordinator after construction; the coordinator
    /// needs this runner to resume instances, so it is built second.
    pub fn attach_approvals(&self, coordinator: Arc<ApprovalCoordinator>) {
        let _ = self.approvals.set(coordinator);
    }

    pub fn stats_for(&self, definition_id: DefinitionId) -> RunStatsSnapshot {
        self.stats
            .get(&definition_id)
            .map(|entry| entry.snapshot())
            .unwrap_or(RunStatsSnapshot {
                run_count: 0,
                success_count: 0,
                failure_count: 0,
            })
    }

    fn stats_entry(&self, definition_id: DefinitionId) -> Arc<RunStats> {
        self.stats
            .entry(definition_id)
            .or_insert_with(|| Arc::new(RunStats::default()))
            .clone()
    }

    /// Begin a new run of an active definition.
    pub async fn start(
        &self,
        definition_id: DefinitionId,
        trigger_data: Context,
        target: Option<TargetRef>,
    ) -> Result<InstanceId> {
        let definition = self
            .definitions
            .get(definition_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("workflow {}", definition_id)))?;

        if definition.status != DefinitionStatus::Active {
            return Err(EngineError::InvalidState(format!(
                "definition {} is {:?}, not active",
                definition.id, definition.status
            )));
        }

        if !evaluate(&definition.entry_conditions, &trigger_data) {
            return Err(EngineError::Validation(
                "entry conditions not satisfied by trigger data".into(),
            ));
        }

        if let Some(limit) = definition.max_concurrent {
            let active = self.instances.count_active(definition.id).await?;
            if active >= limit as usize {
                return Err(EngineError::InvalidState(format!(
                    "definition {} already has {} active instances (limit {})",
                    definition.id, active, limit
                )));
            }
        }

        let graph = WorkflowGraph::build(&definition.nodes, &definition.connections)?;

        let mut instance = WorkflowInstance::new(definition.id, definition.version, target);

        let defaults: Context = definition
            .variables
            .iter()
            .filter(|v| !v.default.is_null())
            .map(|v| (v.name.clone(), v.default.clone()))
            .collect();
        if !defaults.is_empty() {
            instance.append_context("variables", serde_json::Value::Object(defaults));
        }
        instance.append_context("trigger", serde_json::Value::Object(trigger_data));
        instance.current_node = Some(graph.entry_node().node_id.clone());

        self.stats_entry(definition.id)
            .run_count
            .fetch_add(1, Ordering::Relaxed);
        self.instances.save(&instance).await?;

        self.audit
            .record(
                instance.id,
                AuditEvent::new(
                    AuditEventType::WorkflowStarted,
                    format!("Workflow {} started", definition.name),
                )
                .with_details(json!({
                    "definition_id": definition.id,
                    "version": definition.version,
                })),
            )
            .await;

        tracing::info!(
            instance_id = %instance.id,
            definition_id = %definition.id,
            entry_node = %graph.entry_node().node_id,
            "Workflow instance started"
        );

        let instance_id = instance.id;
        self.run_loop(&definition, &graph, instance).await?;
        Ok(instance_id)
    }

    /// Advance a suspended run. Valid only from `waiting`; the transition is
    /// a compare-and-swap, so a duplicate timer fire or approval callback is
    /// rejected instead of re-executing the step.
    pub async fn resume(&self, instance_id: InstanceId, resume_data: Context) -> Result<()> {
        let mut instance = self
            .instances
            .transition(instance_id, &[InstanceStatus::Waiting], InstanceStatus::Running)
            .await?;

        tracing::info!(
            instance_id = %instance.id,
            current_node = instance.current_node.as_deref().unwrap_or(""),
            "Workflow instance resumed"
        );

        let definition = self
            .definitions
            .get(instance.definition_id)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("workflow {}", instance.definition_id))
            })?;
        let graph = WorkflowGraph::build(&definition.nodes, &definition.connections)?;

        let node_id = instance
            .current_node
            .clone()
            .ok_or_else(|| EngineError::InvalidState("waiting instance has no current node".into()))?;
        let node = graph.node(&node_id).ok_or_else(|| {
            EngineError::Validation(format!("current node {} not in definition", node_id))
        })?;

        // Routing output: the supplied resume payload wins per field, the
        // payload recorded at suspension fills the rest.
        let mut routing_output = resume_data.clone();
        if let Some(recorded) = instance.resume_data.take() {
            for (key, value) in recorded {
                routing_output.entry(key).or_insert(value);
            }
        }
        if let Some(decision) = routing_output
            .get("approval_decision")
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned)
        {
            // Lets approval nodes route over edges labeled by decision.
            routing_output
                .entry("branch".to_string())
                .or_insert_with(|| json!(decision));
        }

        let was_delay = routing_output.get("reason").and_then(serde_json::Value::as_str)
            == Some("delay");

        // The suspension that brought us here is completed once resumed.
        if let Some(mut execution) = self.executions.active_for_instance(instance.id).await? {
            execution.status = ExecutionStatus::Completed;
            execution.finished_at = Some(Utc::now());
            execution.output_data = routing_output.clone();
            if let Some(decision) = resume_data.get("approval_decision").and_then(|v| v.as_str()) {
                execution.approval_status = Some(decision.to_string());
            }
            if let Some(by) = resume_data.get("approved_by").and_then(|v| v.as_str()) {
                execution.approved_by = Some(by.to_string());
            }
            if let Some(comment) = resume_data.get("approval_comment").and_then(|v| v.as_str()) {
                execution.approval_comment = Some(comment.to_string());
            }
            self.executions.update(&execution).await?;
        }

        instance.merge_resume_context(&resume_data);
        instance.resume_at = None;
        instance.resume_data = None;
        self.instances.update(&instance).await?;

        if was_delay {
            self.audit
                .record(
                    instance.id,
                    AuditEvent::new(AuditEventType::DelayCompleted, "Delay elapsed")
                        .with_node(&node_id),
                )
                .await;
        }

        let outcome = NodeOutcome::completed(routing_output);
        if self.route(&graph, &mut instance, node, &outcome).await? {
            self.run_loop(&definition, &graph, instance).await?;
        }
        Ok(())
    }

    /// Terminate a non-terminal run. Does not interrupt a handler already
    /// mid-execution; the status flips and the loop observes it.
    pub async fn cancel(&self, instance_id: InstanceId) -> Result<()> {
        let mut instance = self
            .instances
            .transition(
                instance_id,
                &[InstanceStatus::Running, InstanceStatus::Waiting],
                InstanceStatus::Cancelled,
            )
            .await?;

        instance.resume_at = None;
        instance.resume_data = None;
        instance.finished_at = Some(Utc::now());
        self.instances.update(&instance).await?;

        if let Some(mut execution) = self.executions.active_for_instance(instance_id).await? {
            execution.status = ExecutionStatus::Skipped;
            execution.finished_at = Some(Utc::now());
            self.executions.update(&execution).await?;
        }

        self.audit
            .record(
                instance_id,
                AuditEvent::new(AuditEventType::WorkflowCancelled, "Workflow cancelled"),
            )
            .await;

        tracing::info!(instance_id = %instance_id, "Workflow instance cancelled");
        Ok(())
    }

    /// Force the timeout terminal state; called by the external deadline
    /// poller when a declared timeout elapsed without progress.
    pub async fn expire(&self, instance_id: InstanceId) -> Result<()> {
        let mut instance = self
            .instances
            .transition(
                instance_id,
                &[InstanceStatus::Running, InstanceStatus::Waiting],
                InstanceStatus::Timeout,
            )
            .await?;

        instance.resume_at = None;
        instance.resume_data = None;
        instance.finished_at = Some(Utc::now());
        self.instances.update(&instance).await?;

        self.audit
            .record(
                instance_id,
                AuditEvent::new(AuditEventType::WorkflowFailed, "Workflow timed out"),
            )
            .await;

        tracing::warn!(instance_id = %instance_id, "Workflow instance timed out");
        Ok(())
    }

    /// Sequential run-loop; exits on suspension or a terminal transition.
    async fn run_loop(
        &self,
        definition: &WorkflowDefinition,
        graph: &WorkflowGraph,
        mut instance: WorkflowInstance,
    ) -> Result<()> {
        while instance.status == InstanceStatus::Running {
            // Cooperative cancellation: an external transition wins.
            if let Some(stored) = self.instances.get(instance.id).await? {
                if stored.status != InstanceStatus::Running {
                    tracing::debug!(
                        instance_id = %instance.id,
                        status = ?stored.status,
                        "Instance transitioned externally, leaving run-loop"
                    );
                    break;
                }
            }

            let node_id = instance.current_node.clone().ok_or_else(|| {
                EngineError::InvalidState("running instance has no current node".into())
            })?;
            let node = graph.node(&node_id).ok_or_else(|| {
                EngineError::Validation(format!("current node {} not in definition", node_id))
            })?;

            if instance.steps_taken >= self.config.max_steps_per_instance {
                self.fail_instance(
                    &mut instance,
                    &node_id,
                    format!(
                        "step budget of {} exceeded",
                        self.config.max_steps_per_instance
                    ),
                )
                .await?;
                break;
            }

            if let Some(stale) = self.executions.active_for_instance(instance.id).await? {
                return Err(EngineError::InvalidState(format!(
                    "instance {} already has an active execution for node {}",
                    instance.id, stale.node_id
                )));
            }

            let (outcome, execution) = self.execute_with_retries(&mut instance, node).await?;

            match outcome.status {
                OutcomeStatus::Completed => {
                    instance.append_context(
                        format!("node_{}", node.node_id),
                        serde_json::Value::Object(outcome.output.clone()),
                    );
                    self.audit
                        .record(
                            instance.id,
                            AuditEvent::new(
                                AuditEventType::NodeCompleted,
                                format!("Node {} completed", node.name),
                            )
                            .with_node(&node.node_id),
                        )
                        .await;

                    if !self.route(graph, &mut instance, node, &outcome).await? {
                        break;
                    }
                }
                OutcomeStatus::Waiting => {
                    self.suspend(&mut instance, node, &execution, outcome).await?;
                    break;
                }
                OutcomeStatus::Failed => {
                    if !self
                        .apply_error_policy(definition, graph, &mut instance, node, &outcome)
                        .await?
                    {
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Run one node, retrying failed attempts up to the node's retry_count.
    ///
    /// Each attempt is its own NodeExecution record. The declared retry
    /// delay is recorded on the failed attempt but not slept here; the loop
    /// stays non-blocking and delayed retries belong to the poller.
    async fn execute_with_retries(
        &self,
        instance: &mut WorkflowInstance,
        node: &Node,
    ) -> Result<(NodeOutcome, NodeExecution)> {
        let attempts = node.retry_count.saturating_add(1);
        let mut last: Option<(NodeOutcome, NodeExecution)> = None;

        for attempt in 1..=attempts {
            let mut execution = NodeExecution::new(instance.id, &node.node_id, attempt);
            execution.status = ExecutionStatus::Running;
            execution.started_at = Some(Utc::now());
            execution.input_data = instance.context.clone();
            self.executions.save(&execution).await?;

            self.audit
                .record(
                    instance.id,
                    AuditEvent::new(
                        AuditEventType::NodeStarted,
                        format!("Node {} started", node.name),
                    )
                    .with_node(&node.node_id)
                    .with_details(json!({"attempt": attempt})),
                )
                .await;

            instance.steps_taken += 1;
            let outcome = self.executor.execute(instance, node).await?;

            match outcome.status {
                OutcomeStatus::Completed => {
                    execution.status = ExecutionStatus::Completed;
                    execution.output_data = outcome.output.clone();
                    execution.finished_at = Some(Utc::now());
                    self.executions.update(&execution).await?;
                    return Ok((outcome, execution));
                }
                OutcomeStatus::Waiting => {
                    execution.status = ExecutionStatus::Waiting;
                    self.executions.update(&execution).await?;
                    return Ok((outcome, execution));
                }
                OutcomeStatus::Failed => {
                    execution.status = ExecutionStatus::Failed;
                    execution.error = outcome.error.clone();
                    execution.finished_at = Some(Utc::now());
                    if node.retry_delay_minutes > 0 && attempt < attempts {
                        execution.retry_delay_minutes = Some(node.retry_delay_minutes);
                    }
                    self.executions.update(&execution).await?;

                    self.audit
                        .record(
                            instance.id,
                            AuditEvent::new(
                                AuditEventType::NodeFailed,
                                format!(
                                    "Node {} failed: {}",
                                    node.name,
                                    outcome.error.as_deref().unwrap_or("unknown error")
                                ),
                            )
                            .with_node(&node.node_id)
                            .with_details(json!({"attempt": attempt})),
                        )
                        .await;

                    if attempt < attempts {
                        tracing::warn!(
                            instance_id = %instance.id,
                            node_id = %node.node_id,
                            attempt,
                            "Node attempt failed, retrying"
                        );
                    }
                    last = Some((outcome, execution));
                }
            }
        }

        // All attempts failed.
        Ok(last.expect("at least one attempt runs"))
    }

    /// Route to the next node; `false` means the instance reached a dead end
    /// and was completed.
    async fn route(
        &self,
        graph: &WorkflowGraph,
        instance: &mut WorkflowInstance,
        node: &Node,
        outcome: &NodeOutcome,
    ) -> Result<bool> {
        match ConnectionRouter::next(graph, node, outcome) {
            Some(next) => {
                instance.current_node = Some(next.node_id.clone());
                self.instances.update(instance).await?;
                Ok(true)
            }
            None => {
                self.complete_instance(instance).await?;
                Ok(false)
            }
        }
    }

    async fn suspend(
        &self,
        instance: &mut WorkflowInstance,
        node: &Node,
        execution: &NodeExecution,
        outcome: NodeOutcome,
    ) -> Result<()> {
        // Status may have been flipped externally (cancel) while the node
        // ran; the CAS makes that the winner and we just stop.
        let transitioned = self
            .instances
            .transition(instance.id, &[InstanceStatus::Running], InstanceStatus::Waiting)
            .await;
        if let Err(EngineError::InvalidState(_)) = transitioned {
            tracing::debug!(
                instance_id = %instance.id,
                "Instance left running state during node execution, not suspending"
            );
            return Ok(());
        }
        transitioned?;

        instance.status = InstanceStatus::Waiting;
        instance.resume_at = outcome.resume_at;
        instance.resume_data = outcome.resume_data.clone();
        self.instances.update(instance).await?;

        match node.kind() {
            NodeKind::Delay => {
                self.audit
                    .record(
                        instance.id,
                        AuditEvent::new(
                            AuditEventType::DelayStarted,
                            format!("Node {} waiting", node.name),
                        )
                        .with_node(&node.node_id)
                        .with_details(json!({"resume_at": outcome.resume_at})),
                    )
                    .await;
            }
            NodeKind::Approval => {
                self.open_approvals(instance, node, execution).await?;
            }
            _ => {}
        }

        tracing::info!(
            instance_id = %instance.id,
            node_id = %node.node_id,
            resume_at = ?outcome.resume_at,
            "Workflow instance suspended"
        );
        Ok(())
    }

    async fn open_approvals(
        &self,
        instance: &WorkflowInstance,
        node: &Node,
        execution: &NodeExecution,
    ) -> Result<()> {
        let NodeConfig::Approval {
            approvers,
            policy,
            due_hours,
            ..
        } = &node.config
        else {
            return Ok(());
        };

        let Some(coordinator) = self.approvals.get() else {
            tracing::warn!(
                instance_id = %instance.id,
                node_id = %node.node_id,
                "Approval node suspended without an attached coordinator"
            );
            return Ok(());
        };

        let due_hours = due_hours.unwrap_or(self.config.default_approval_due_hours);
        let options = ApprovalOptions {
            policy: *policy,
            due_date: Some(Utc::now() + Duration::hours(i64::from(due_hours))),
        };
        coordinator
            .request_approval(execution, approvers, options)
            .await?;
        Ok(())
    }

    /// Apply the node's on_error policy; `true` keeps the loop going.
    async fn apply_error_policy(
        &self,
        definition: &WorkflowDefinition,
        graph: &WorkflowGraph,
        instance: &mut WorkflowInstance,
        node: &Node,
        outcome: &NodeOutcome,
    ) -> Result<bool> {
        let reason = outcome
            .error
            .clone()
            .unwrap_or_else(|| "node failed".to_string());

        match node.on_error {
            OnErrorPolicy::Stop => {
                self.fail_instance(instance, &node.node_id, reason).await?;
                Ok(false)
            }
            OnErrorPolicy::Continue => {
                tracing::warn!(
                    instance_id = %instance.id,
                    node_id = %node.node_id,
                    error = %reason,
                    "Node failed, continuing per policy"
                );
                instance.append_context(
                    format!("node_{}", node.node_id),
                    serde_json::Value::Object(Context::new()),
                );
                let empty = NodeOutcome::completed(Context::new());
                self.route(graph, instance, node, &empty).await
            }
            OnErrorPolicy::Branch => {
                let target = node
                    .error_branch_node
                    .as_deref()
                    .filter(|target| definition.node(target).is_some());

                match target {
                    Some(target) => {
                        tracing::warn!(
                            instance_id = %instance.id,
                            node_id = %node.node_id,
                            error_branch = %target,
                            "Node failed, branching to error handler"
                        );
                        instance.current_node = Some(target.to_string());
                        self.instances.update(instance).await?;
                        Ok(true)
                    }
                    // Unresolved branch target degrades to stop semantics.
                    None => {
                        self.fail_instance(instance, &node.node_id, reason).await?;
                        Ok(false)
                    }
                }
            }
        }
    }

    async fn complete_instance(&self, instance: &mut WorkflowInstance) -> Result<()> {
        instance.status = InstanceStatus::Completed;
        instance.finished_at = Some(Utc::now());
        self.instances.update(instance).await?;

        self.stats_entry(instance.definition_id)
            .success_count
            .fetch_add(1, Ordering::Relaxed);

        self.audit
            .record(
                instance.id,
                AuditEvent::new(AuditEventType::WorkflowCompleted, "Workflow completed"),
            )
            .await;

        tracing::info!(instance_id = %instance.id, "Workflow instance completed");
        Ok(())
    }

    async fn fail_instance(
        &self,
        instance: &mut WorkflowInstance,
        node_id: &str,
        message: String,
    ) -> Result<()> {
        instance.status = InstanceStatus::Failed;
        instance.error_node = Some(node_id.to_string());
        instance.error_message = Some(message.clone());
        instance.finished_at = Some(Utc::now());
        self.instances.update(instance).await?;

        self.stats_entry(instance.definition_id)
            .failure_count
            .fetch_add(1, Ordering::Relaxed);

        self.audit
            .record(
                instance.id,
                AuditEvent::new(
                    AuditEventType::WorkflowFailed,
                    format!("Workflow failed at {}: {}", node_id, message),
                )
                .with_node(node_id),
            )
            .await;

        tracing::warn!(
            instance_id = %instance.id,
            node_id = %node_id,
            error = %message,
            "Workflow instance failed"
        );
        Ok(())
    }
}
