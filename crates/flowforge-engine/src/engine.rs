//! Engine assembly
//!
//! Wires repositories, executor, runner, approval coordinator and trigger
//! router into one handle. Hosts that bring their own persistence construct
//! the pieces directly; `Engine::in_memory` is the batteries-included setup
//! used by tests and single-process deployments.

use std::sync::Arc;

use flowforge_core::EngineConfig;

use crate::approval::{ApprovalCoordinator, ApprovalRepository, InMemoryApprovalRepository};
use crate::audit::AuditLog;
use crate::definition::{
    DefinitionRepository, InMemoryDefinitionRepository, ValidationWarning, WorkflowDefinition,
};
use crate::executor::{HandlerRegistry, NodeExecutor};
use crate::instance::{
    ExecutionRepository, InMemoryExecutionRepository, InMemoryInstanceRepository,
    InstanceRepository,
};
use crate::runner::InstanceRunner;
use crate::trigger::TriggerRouter;
use crate::Result;

pub struct Engine {
    definitions: Arc<dyn DefinitionRepository>,
    instances: Arc<dyn InstanceRepository>,
    executions: Arc<dyn ExecutionRepository>,
    approvals_repo: Arc<dyn ApprovalRepository>,
    runner: Arc<InstanceRunner>,
    approvals: Arc<ApprovalCoordinator>,
    triggers: TriggerRouter,
    audit: AuditLog,
}

impl Engine {
    /// Fully in-memory engine with the default handler registry.
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::with_registry(config, HandlerRegistry::with_defaults())
    }

    /// In-memory engine with a caller-supplied handler registry.
    pub fn with_registry(config: EngineConfig, registry: HandlerRegistry) -> Self {
        let definitions: Arc<dyn DefinitionRepository> =
            Arc::new(InMemoryDefinitionRepository::new());
        let instances: Arc<dyn InstanceRepository> = Arc::new(InMemoryInstanceRepository::new());
        let executions: Arc<dyn ExecutionRepository> =
            Arc::new(InMemoryExecutionRepository::new());
        let approvals_repo: Arc<dyn ApprovalRepository> =
            Arc::new(InMemoryApprovalRepository::new());

        let audit = AuditLog::new();
        let executor = NodeExecutor::new(Arc::new(registry));

        let runner = Arc::new(InstanceRunner::new(
            definitions.clone(),
            instances.clone(),
            executions.clone(),
            executor,
            audit.clone(),
            config,
        ));

        let approvals = Arc::new(ApprovalCoordinator::new(
            approvals_repo.clone(),
            executions.clone(),
            runner.clone(),
            audit.clone(),
        ));
        runner.attach_approvals(approvals.clone());

        let triggers = TriggerRouter::new(definitions.clone(), runner.clone());

        Self {
            definitions,
            instances,
            executions,
            approvals_repo,
            runner,
            approvals,
            triggers,
            audit,
        }
    }

    /// Activate a definition and store it, returning validation warnings.
    pub async fn publish(
        &self,
        mut definition: WorkflowDefinition,
    ) -> Result<(WorkflowDefinition, Vec<ValidationWarning>)> {
        let warnings = definition.activate()?;
        self.definitions.save(&definition).await?;
        Ok((definition, warnings))
    }

    pub fn runner(&self) -> &Arc<InstanceRunner> {
        &self.runner
    }

    pub fn approvals(&self) -> &Arc<ApprovalCoordinator> {
        &self.approvals
    }

    pub fn triggers(&self) -> &TriggerRouter {
        &self.triggers
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn definitions(&self) -> &Arc<dyn DefinitionRepository> {
        &self.definitions
    }

    pub fn instances(&self) -> &Arc<dyn InstanceRepository> {
        &self.instances
    }

    pub fn executions(&self) -> &Arc<dyn ExecutionRepository> {
        &self.executions
    }

    pub fn approval_requests(&self) -> &Arc<dyn ApprovalRepository> {
        &self.approvals_repo
    }
}
