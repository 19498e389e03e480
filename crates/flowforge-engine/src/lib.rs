//! Workflow execution engine for FlowForge
//!
//! This crate executes user-defined graphs of typed nodes against a mutable
//! run context:
//! - Definition model with activation-time validation
//! - Declarative condition evaluation and `{{path}}` templating
//! - Node dispatch through a pluggable handler registry
//! - Sequential instance run-loop with suspend/resume/cancel
//! - Per-node failure policy (stop/continue/branch) with bounded retries
//! - Multi-party approval coordination with aggregation gating
//! - Append-only per-instance audit trail

pub mod approval;
pub mod audit;
pub mod condition;
pub mod definition;
pub mod engine;
pub mod executor;
pub mod graph;
pub mod instance;
pub mod node;
pub mod router;
pub mod runner;
pub mod template;
pub mod trigger;

pub use approval::{
    AggregationPolicy, ApprovalCoordinator, ApprovalDecision, ApprovalOptions, ApprovalRepository,
    ApprovalRequest, ApprovalStatus, InMemoryApprovalRepository,
};
pub use audit::{AuditEvent, AuditEventType, AuditLog};
pub use condition::{evaluate, lookup_path, ConditionOperator, Predicate};
pub use definition::{
    DefinitionRepository, DefinitionStatus, InMemoryDefinitionRepository, TriggerSpec,
    ValidationWarning, Variable, WorkflowDefinition,
};
pub use engine::Engine;
pub use executor::{
    HandlerContext, HandlerRegistry, NodeExecutor, NodeHandler, NodeOutcome, OutcomeStatus,
};
pub use graph::WorkflowGraph;
pub use instance::{
    ExecutionRepository, ExecutionStatus, InMemoryExecutionRepository, InMemoryInstanceRepository,
    InstanceRepository, InstanceStatus, NodeExecution, WorkflowInstance,
};
pub use node::{Connection, EndDisposition, Node, NodeConfig, NodeKind, OnErrorPolicy};
pub use router::ConnectionRouter;
pub use runner::{InstanceRunner, RunStats, RunStatsSnapshot};
pub use template::TemplateRenderer;
pub use trigger::{TriggerEvent, TriggerRouter};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Node execution failed: {node_id}: {reason}")]
    Execution { node_id: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Core error: {0}")]
    Core(#[from] flowforge_core::CoreError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Accumulated run context: `trigger` data, one `node_<id>` entry per
/// completed node, and `resume` payloads supplied on reactivation.
pub type Context = serde_json::Map<String, serde_json::Value>;
