//! Node dispatch and handler plumbing
//!
//! A node is executed by looking up its kind in the handler registry and
//! running the handler on its own tokio task, so a panicking handler becomes
//! a failed outcome rather than tearing down the run-loop. Side-effecting
//! handlers (email, webhooks, record CRUD) live in the host; the built-ins
//! here cover the control-flow kinds and provide logging stand-ins for the
//! action kinds so a bare engine is fully runnable.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use flowforge_core::InstanceId;

use crate::condition::evaluate;
use crate::instance::WorkflowInstance;
use crate::node::{Node, NodeConfig, NodeKind};
use crate::template::TemplateRenderer;
use crate::{Context, EngineError, Result};

/// Normalized result of executing one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    Waiting,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeOutcome {
    pub status: OutcomeStatus,
    #[serde(default)]
    pub output: Context,
    #[serde(default)]
    pub resume_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resume_data: Option<Context>,
    #[serde(default)]
    pub error: Option<String>,
}

impl NodeOutcome {
    pub fn completed(output: Context) -> Self {
        Self {
            status: OutcomeStatus::Completed,
            output,
            resume_at: None,
            resume_data: None,
            error: None,
        }
    }

    pub fn waiting(resume_at: Option<DateTime<Utc>>, resume_data: Context) -> Self {
        Self {
            status: OutcomeStatus::Waiting,
            output: Context::new(),
            resume_at,
            resume_data: Some(resume_data),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Failed,
            output: Context::new(),
            resume_at: None,
            resume_data: None,
            error: Some(error.into()),
        }
    }
}

/// Everything a handler may see: a context snapshot and the node's config.
///
/// Handlers never receive the instance itself; recorded history stays
/// immutable from their point of view.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub instance_id: InstanceId,
    pub node_id: String,
    pub context: Context,
    pub config: NodeConfig,
}

/// Node handler plugin contract.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn handle(&self, ctx: HandlerContext) -> Result<NodeOutcome>;
}

/// Handler registry keyed by node kind.
pub struct HandlerRegistry {
    handlers: HashMap<NodeKind, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry with built-in handlers for every node kind.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(NodeKind::Task, Arc::new(TaskHandler));
        registry.register(NodeKind::Notify, Arc::new(NotifyHandler));
        registry.register(NodeKind::Delay, Arc::new(DelayHandler));
        registry.register(NodeKind::Branch, Arc::new(BranchHandler));
        registry.register(NodeKind::SetVariables, Arc::new(SetVariablesHandler));
        registry.register(NodeKind::Approval, Arc::new(ApprovalHandler));
        registry.register(NodeKind::AiPrompt, Arc::new(AiPromptHandler));
        registry.register(NodeKind::End, Arc::new(EndHandler));
        registry
    }

    pub fn register(&mut self, kind: NodeKind, handler: Arc<dyn NodeHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn get(&self, kind: NodeKind) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Kinds used by the given nodes that have no registered handler.
    pub fn missing_handlers(&self, nodes: &[Node]) -> Vec<NodeKind> {
        let mut missing: Vec<NodeKind> = nodes
            .iter()
            .map(Node::kind)
            .filter(|kind| !self.handlers.contains_key(kind))
            .collect();
        missing.sort_by_key(|k| k.to_string());
        missing.dedup();
        missing
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Dispatches a node to its handler and normalizes the result.
#[derive(Clone)]
pub struct NodeExecutor {
    registry: Arc<HandlerRegistry>,
}

impl NodeExecutor {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    /// Run one node. Handler errors and panics become failed outcomes; an
    /// unregistered handler is the caller's configuration error.
    pub async fn execute(&self, instance: &WorkflowInstance, node: &Node) -> Result<NodeOutcome> {
        let handler = self.registry.get(node.kind()).ok_or_else(|| {
            EngineError::Validation(format!("no handler registered for node kind {}", node.kind()))
        })?;

        let ctx = HandlerContext {
            instance_id: instance.id,
            node_id: node.node_id.clone(),
            context: instance.context.clone(),
            config: node.config.clone(),
        };

        let started = std::time::Instant::now();
        let node_id = node.node_id.clone();

        // Own task: a panicking handler surfaces as a JoinError, not a
        // run-loop crash.
        let joined = tokio::spawn(async move { handler.handle(ctx).await }).await;

        let outcome = match joined {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => NodeOutcome::failed(e.to_string()),
            Err(join_error) if join_error.is_panic() => {
                tracing::error!(
                    instance_id = %instance.id,
                    node_id = %node_id,
                    "Node handler panicked"
                );
                NodeOutcome::failed(format!("handler panicked: {}", join_error))
            }
            Err(join_error) => NodeOutcome::failed(join_error.to_string()),
        };

        tracing::debug!(
            instance_id = %instance.id,
            node_id = %node_id,
            status = ?outcome.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Node executed"
        );

        Ok(outcome)
    }
}

// Built-in handlers

struct TaskHandler;

#[async_trait]
impl NodeHandler for TaskHandler {
    async fn handle(&self, ctx: HandlerContext) -> Result<NodeOutcome> {
        let NodeConfig::Task { action, params } = ctx.config else {
            return Ok(NodeOutcome::failed("misconfigured task node"));
        };

        let renderer = TemplateRenderer::new();
        let rendered: Context = params
            .into_iter()
            .map(|(key, value)| match value {
                serde_json::Value::String(s) => {
                    (key, serde_json::Value::String(renderer.render(&s, &ctx.context)))
                }
                other => (key, other),
            })
            .collect();

        let mut output = Context::new();
        output.insert("action".into(), json!(action));
        output.insert("params".into(), serde_json::Value::Object(rendered));
        Ok(NodeOutcome::completed(output))
    }
}

struct NotifyHandler;

#[async_trait]
impl NodeHandler for NotifyHandler {
    async fn handle(&self, ctx: HandlerContext) -> Result<NodeOutcome> {
        let NodeConfig::Notify {
            channel,
            message,
            recipients,
        } = ctx.config
        else {
            return Ok(NodeOutcome::failed("misconfigured notify node"));
        };

        let rendered = TemplateRenderer::new().render(&message, &ctx.context);

        tracing::info!(
            instance_id = %ctx.instance_id,
            node_id = %ctx.node_id,
            channel = %channel,
            recipient_count = recipients.len(),
            "Notification dispatched"
        );

        let mut output = Context::new();
        output.insert("channel".into(), json!(channel));
        output.insert("message".into(), json!(rendered));
        output.insert("recipients".into(), json!(recipients));
        Ok(NodeOutcome::completed(output))
    }
}

struct DelayHandler;

#[async_trait]
impl NodeHandler for DelayHandler {
    async fn handle(&self, ctx: HandlerContext) -> Result<NodeOutcome> {
        let NodeConfig::Delay { duration_minutes } = ctx.config else {
            return Ok(NodeOutcome::failed("misconfigured delay node"));
        };

        let resume_at = Utc::now() + Duration::minutes(i64::from(duration_minutes));
        let mut resume_data = Context::new();
        resume_data.insert("reason".into(), json!("delay"));
        resume_data.insert("duration_minutes".into(), json!(duration_minutes));

        Ok(NodeOutcome::waiting(Some(resume_at), resume_data))
    }
}

struct BranchHandler;

#[async_trait]
impl NodeHandler for BranchHandler {
    async fn handle(&self, ctx: HandlerContext) -> Result<NodeOutcome> {
        let NodeConfig::Branch { conditions } = ctx.config else {
            return Ok(NodeOutcome::failed("misconfigured branch node"));
        };

        let matched = evaluate(&conditions, &ctx.context);

        let mut output = Context::new();
        output.insert("branch".into(), json!(if matched { "yes" } else { "no" }));
        output.insert("matched".into(), json!(matched));
        Ok(NodeOutcome::completed(output))
    }
}

struct SetVariablesHandler;

#[async_trait]
impl NodeHandler for SetVariablesHandler {
    async fn handle(&self, ctx: HandlerContext) -> Result<NodeOutcome> {
        let NodeConfig::SetVariables { assignments } = ctx.config else {
            return Ok(NodeOutcome::failed("misconfigured set_variables node"));
        };

        let renderer = TemplateRenderer::new();
        let output: Context = assignments
            .into_iter()
            .map(|(name, template)| (name, json!(renderer.render(&template, &ctx.context))))
            .collect();

        Ok(NodeOutcome::completed(output))
    }
}

struct ApprovalHandler;

#[async_trait]
impl NodeHandler for ApprovalHandler {
    async fn handle(&self, ctx: HandlerContext) -> Result<NodeOutcome> {
        let NodeConfig::Approval {
            approvers,
            policy,
            due_hours,
            instructions,
        } = ctx.config
        else {
            return Ok(NodeOutcome::failed("misconfigured approval node"));
        };

        if approvers.is_empty() {
            return Ok(NodeOutcome::failed("approval node has no approvers"));
        }

        let resume_at = due_hours.map(|hours| Utc::now() + Duration::hours(i64::from(hours)));

        let mut resume_data = Context::new();
        resume_data.insert("reason".into(), json!("approval"));
        resume_data.insert("approvers".into(), json!(approvers));
        resume_data.insert("policy".into(), json!(policy));
        if !instructions.is_empty() {
            let rendered = TemplateRenderer::new().render(&instructions, &ctx.context);
            resume_data.insert("instructions".into(), json!(rendered));
        }

        Ok(NodeOutcome::waiting(resume_at, resume_data))
    }
}

struct AiPromptHandler;

#[async_trait]
impl NodeHandler for AiPromptHandler {
    async fn handle(&self, ctx: HandlerContext) -> Result<NodeOutcome> {
        let NodeConfig::AiPrompt { prompt, model } = ctx.config else {
            return Ok(NodeOutcome::failed("misconfigured ai_prompt node"));
        };

        // Stand-in for a host-registered model handler: echoes the rendered
        // prompt so downstream nodes can template against it.
        let rendered = TemplateRenderer::new().render(&prompt, &ctx.context);

        let mut output = Context::new();
        output.insert("prompt".into(), json!(rendered));
        if let Some(model) = model {
            output.insert("model".into(), json!(model));
        }
        Ok(NodeOutcome::completed(output))
    }
}

struct EndHandler;

#[async_trait]
impl NodeHandler for EndHandler {
    async fn handle(&self, ctx: HandlerContext) -> Result<NodeOutcome> {
        let NodeConfig::End { disposition } = ctx.config else {
            return Ok(NodeOutcome::failed("misconfigured end node"));
        };

        let mut output = Context::new();
        output.insert("disposition".into(), json!(disposition));
        Ok(NodeOutcome::completed(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowforge_core::DefinitionId;
    use crate::condition::{ConditionOperator, Predicate};

    fn instance_with_context(context: Context) -> WorkflowInstance {
        let mut instance = WorkflowInstance::new(DefinitionId::new(), 1, None);
        instance.context = context;
        instance
    }

    fn ctx_of(value: serde_json::Value) -> Context {
        value.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn test_delay_handler_suspends() {
        let executor = NodeExecutor::new(Arc::new(HandlerRegistry::with_defaults()));
        let instance = instance_with_context(Context::new());
        let node = Node::new("wait", "Wait", NodeConfig::Delay { duration_minutes: 5 });

        let outcome = executor.execute(&instance, &node).await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Waiting);

        let resume_at = outcome.resume_at.unwrap();
        assert!(resume_at > Utc::now() + Duration::minutes(4));
        assert!(resume_at <= Utc::now() + Duration::minutes(5));
    }

    #[tokio::test]
    async fn test_branch_handler_emits_yes_no() {
        let executor = NodeExecutor::new(Arc::new(HandlerRegistry::with_defaults()));
        let node = Node::new(
            "check",
            "Check",
            NodeConfig::Branch {
                conditions: vec![Predicate::new(
                    "trigger.amount",
                    ConditionOperator::GreaterThan,
                    json!(1000),
                )],
            },
        );

        let instance = instance_with_context(ctx_of(json!({"trigger": {"amount": 2000}})));
        let outcome = executor.execute(&instance, &node).await.unwrap();
        assert_eq!(outcome.output["branch"], json!("yes"));

        let instance = instance_with_context(ctx_of(json!({"trigger": {"amount": 10}})));
        let outcome = executor.execute(&instance, &node).await.unwrap();
        assert_eq!(outcome.output["branch"], json!("no"));
    }

    #[tokio::test]
    async fn test_set_variables_renders_templates() {
        let executor = NodeExecutor::new(Arc::new(HandlerRegistry::with_defaults()));
        let mut assignments = HashMap::new();
        assignments.insert("greeting".to_string(), "Hi {{trigger.name}}".to_string());

        let node = Node::new("vars", "Vars", NodeConfig::SetVariables { assignments });
        let instance = instance_with_context(ctx_of(json!({"trigger": {"name": "Ann"}})));

        let outcome = executor.execute(&instance, &node).await.unwrap();
        assert_eq!(outcome.output["greeting"], json!("Hi Ann"));
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_failed_outcome() {
        struct PanickingHandler;

        #[async_trait]
        impl NodeHandler for PanickingHandler {
            async fn handle(&self, _ctx: HandlerContext) -> Result<NodeOutcome> {
                panic!("boom");
            }
        }

        let mut registry = HandlerRegistry::empty();
        registry.register(NodeKind::Task, Arc::new(PanickingHandler));
        let executor = NodeExecutor::new(Arc::new(registry));

        let instance = instance_with_context(Context::new());
        let node = Node::new(
            "t",
            "T",
            NodeConfig::Task {
                action: "explode".into(),
                params: Context::new(),
            },
        );

        let outcome = executor.execute(&instance, &node).await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert!(outcome.error.unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn test_unregistered_handler_is_an_error() {
        let executor = NodeExecutor::new(Arc::new(HandlerRegistry::empty()));
        let instance = instance_with_context(Context::new());
        let node = Node::new("wait", "Wait", NodeConfig::Delay { duration_minutes: 1 });

        assert!(matches!(
            executor.execute(&instance, &node).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_approval_handler_requires_approvers() {
        let executor = NodeExecutor::new(Arc::new(HandlerRegistry::with_defaults()));
        let instance = instance_with_context(Context::new());
        let node = Node::new(
            "gate",
            "Gate",
            NodeConfig::Approval {
                approvers: vec![],
                policy: Default::default(),
                due_hours: None,
                instructions: String::new(),
            },
        );

        let outcome = executor.execute(&instance, &node).await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Failed);
    }
}
