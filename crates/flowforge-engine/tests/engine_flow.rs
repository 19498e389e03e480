//! End-to-end engine flows against the in-memory assembly.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use flowforge_core::EngineConfig;
use flowforge_engine::{
    AggregationPolicy, ApprovalDecision, ApprovalStatus, AuditEventType, ConditionOperator,
    Connection, Context, Engine, EngineError, ExecutionStatus, HandlerContext, HandlerRegistry,
    InstanceStatus, Node, NodeConfig, NodeHandler, NodeKind, NodeOutcome, Predicate, TriggerEvent,
    TriggerSpec, WorkflowDefinition,
};

fn ctx(value: serde_json::Value) -> Context {
    value.as_object().unwrap().clone()
}

fn task(id: &str) -> Node {
    Node::new(
        id,
        id.to_uppercase(),
        NodeConfig::Task {
            action: "noop".into(),
            params: Context::new(),
        },
    )
}

fn end(id: &str) -> Node {
    Node::new(id, "End", NodeConfig::End { disposition: Default::default() })
}

struct FailingHandler;

#[async_trait]
impl NodeHandler for FailingHandler {
    async fn handle(&self, _ctx: HandlerContext) -> flowforge_engine::Result<NodeOutcome> {
        Ok(NodeOutcome::failed("simulated handler failure"))
    }
}

fn engine_with_failing_tasks() -> Engine {
    let mut registry = HandlerRegistry::with_defaults();
    registry.register(NodeKind::Task, Arc::new(FailingHandler));
    Engine::with_registry(EngineConfig::default(), registry)
}

#[tokio::test]
async fn linear_chain_completes_in_order() {
    let engine = Engine::in_memory(EngineConfig::default());

    let definition = WorkflowDefinition::new("Linear", TriggerSpec::new("manual"))
        .add_node(task("a"))
        .add_node(task("b"))
        .add_node(end("end_success"))
        .add_connection(Connection::new("a", "b"))
        .add_connection(Connection::new("b", "end_success"));

    let (definition, warnings) = engine.publish(definition).await.unwrap();
    assert!(warnings.is_empty());

    let instance_id = engine
        .runner()
        .start(definition.id, ctx(json!({"kind": "manual"})), None)
        .await
        .unwrap();

    let instance = engine.instances().get(instance_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert!(instance.finished_at.is_some());

    let executions = engine.executions().list_for_instance(instance_id).await.unwrap();
    let order: Vec<&str> = executions.iter().map(|e| e.node_id.as_str()).collect();
    assert_eq!(order, vec!["a", "b", "end_success"]);
    assert!(executions
        .iter()
        .all(|e| e.status == ExecutionStatus::Completed));

    // Context accumulated one entry per node plus the trigger.
    assert!(instance.context.contains_key("trigger"));
    assert!(instance.context.contains_key("node_a"));
    assert!(instance.context.contains_key("node_b"));

    let trail = engine.audit().trail(instance_id).await;
    assert_eq!(trail.first().unwrap().event_type, AuditEventType::WorkflowStarted);
    assert_eq!(trail.last().unwrap().event_type, AuditEventType::WorkflowCompleted);
}

#[tokio::test]
async fn delay_suspends_and_resumes_early() {
    let engine = Engine::in_memory(EngineConfig::default());

    let definition = WorkflowDefinition::new("Delayed", TriggerSpec::new("manual"))
        .add_node(task("prep"))
        .add_node(Node::new("wait", "Wait", NodeConfig::Delay { duration_minutes: 5 }))
        .add_node(end("done"))
        .add_connection(Connection::new("prep", "wait"))
        .add_connection(Connection::new("wait", "done"));

    let (definition, _) = engine.publish(definition).await.unwrap();

    let instance_id = engine
        .runner()
        .start(definition.id, Context::new(), None)
        .await
        .unwrap();

    let instance = engine.instances().get(instance_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Waiting);
    assert_eq!(instance.current_node.as_deref(), Some("wait"));
    let resume_at = instance.resume_at.expect("delay records resume_at");
    assert!(resume_at > chrono::Utc::now());

    // No early-resume guard: resuming before resume_at advances the run.
    engine.runner().resume(instance_id, Context::new()).await.unwrap();

    let instance = engine.instances().get(instance_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert!(instance.resume_at.is_none());

    let trail = engine.audit().trail(instance_id).await;
    assert!(trail.iter().any(|e| e.event_type == AuditEventType::DelayStarted));
    assert!(trail.iter().any(|e| e.event_type == AuditEventType::DelayCompleted));
}

#[tokio::test]
async fn resume_is_rejected_unless_waiting() {
    let engine = Engine::in_memory(EngineConfig::default());

    let definition = WorkflowDefinition::new("Short", TriggerSpec::new("manual"))
        .add_node(task("a"))
        .add_node(end("done"))
        .add_connection(Connection::new("a", "done"));

    let (definition, _) = engine.publish(definition).await.unwrap();
    let instance_id = engine
        .runner()
        .start(definition.id, Context::new(), None)
        .await
        .unwrap();

    let before = engine.instances().get(instance_id).await.unwrap().unwrap();
    assert_eq!(before.status, InstanceStatus::Completed);

    let result = engine.runner().resume(instance_id, Context::new()).await;
    assert!(matches!(result, Err(EngineError::InvalidState(_))));

    // State unchanged by the rejected resume.
    let after = engine.instances().get(instance_id).await.unwrap().unwrap();
    assert_eq!(after.status, InstanceStatus::Completed);
    assert_eq!(after.context, before.context);
}

#[tokio::test]
async fn branch_labels_route_case_insensitively() {
    let engine = Engine::in_memory(EngineConfig::default());

    let definition = WorkflowDefinition::new("Branchy", TriggerSpec::new("manual"))
        .add_node(Node::new(
            "check",
            "Check amount",
            NodeConfig::Branch {
                conditions: vec![Predicate::new(
                    "trigger.amount",
                    ConditionOperator::GreaterThan,
                    json!(1000),
                )],
            },
        ))
        .add_node(task("big"))
        .add_node(task("small"))
        .add_node(end("done"))
        .add_connection(Connection::new("check", "big").with_label("Yes"))
        .add_connection(Connection::new("check", "small").with_label("No"))
        .add_connection(Connection::new("big", "done"))
        .add_connection(Connection::new("small", "done").with_priority(1));

    let (definition, _) = engine.publish(definition).await.unwrap();

    let instance_id = engine
        .runner()
        .start(definition.id, ctx(json!({"amount": 2000})), None)
        .await
        .unwrap();

    let executions = engine.executions().list_for_instance(instance_id).await.unwrap();
    let visited: Vec<&str> = executions.iter().map(|e| e.node_id.as_str()).collect();
    assert_eq!(visited, vec!["check", "big", "done"]);

    let instance_id = engine
        .runner()
        .start(definition.id, ctx(json!({"amount": 10})), None)
        .await
        .unwrap();

    let executions = engine.executions().list_for_instance(instance_id).await.unwrap();
    let visited: Vec<&str> = executions.iter().map(|e| e.node_id.as_str()).collect();
    assert_eq!(visited, vec!["check", "small", "done"]);
}

#[tokio::test]
async fn on_error_stop_fails_the_instance() {
    let engine = engine_with_failing_tasks();

    let definition = WorkflowDefinition::new("Fragile", TriggerSpec::new("manual"))
        .add_node(task("boom"))
        .add_node(end("done"))
        .add_connection(Connection::new("boom", "done"));

    let (definition, _) = engine.publish(definition).await.unwrap();
    let instance_id = engine
        .runner()
        .start(definition.id, Context::new(), None)
        .await
        .unwrap();

    let instance = engine.instances().get(instance_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert_eq!(instance.error_node.as_deref(), Some("boom"));
    assert!(instance
        .error_message
        .as_deref()
        .unwrap()
        .contains("simulated handler failure"));

    let trail = engine.audit().trail(instance_id).await;
    assert!(trail.iter().any(|e| e.event_type == AuditEventType::NodeFailed));
    assert_eq!(trail.last().unwrap().event_type, AuditEventType::WorkflowFailed);
}

#[tokio::test]
async fn on_error_continue_advances_with_empty_output() {
    let engine = engine_with_failing_tasks();

    let definition = WorkflowDefinition::new("Tolerant", TriggerSpec::new("manual"))
        .add_node(task("boom").with_on_error(flowforge_engine::OnErrorPolicy::Continue))
        .add_node(end("done"))
        .add_connection(Connection::new("boom", "done"));

    let (definition, _) = engine.publish(definition).await.unwrap();
    let instance_id = engine
        .runner()
        .start(definition.id, Context::new(), None)
        .await
        .unwrap();

    let instance = engine.instances().get(instance_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(instance.context["node_boom"], json!({}));
}

#[tokio::test]
async fn on_error_branch_jumps_to_error_handler() {
    let engine = engine_with_failing_tasks();

    let definition = WorkflowDefinition::new("Recovering", TriggerSpec::new("manual"))
        .add_node(task("boom").with_error_branch("cleanup").entry())
        .add_node(Node::new(
            "cleanup",
            "Cleanup",
            NodeConfig::Notify {
                channel: "ops".into(),
                message: "run failed".into(),
                recipients: vec![],
            },
        ))
        .add_node(end("done"))
        .add_connection(Connection::new("boom", "done"))
        .add_connection(Connection::new("cleanup", "done").with_priority(1));

    let (definition, _) = engine.publish(definition).await.unwrap();
    let instance_id = engine
        .runner()
        .start(definition.id, Context::new(), None)
        .await
        .unwrap();

    let executions = engine.executions().list_for_instance(instance_id).await.unwrap();
    let visited: Vec<&str> = executions.iter().map(|e| e.node_id.as_str()).collect();
    assert_eq!(visited, vec!["boom", "cleanup", "done"]);

    let instance = engine.instances().get(instance_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
}

#[tokio::test]
async fn retries_create_one_execution_per_attempt() {
    let engine = engine_with_failing_tasks();

    let definition = WorkflowDefinition::new("Retrying", TriggerSpec::new("manual"))
        .add_node(task("boom").with_retries(2, 15))
        .add_node(end("done"))
        .add_connection(Connection::new("boom", "done"));

    let (definition, _) = engine.publish(definition).await.unwrap();
    let instance_id = engine
        .runner()
        .start(definition.id, Context::new(), None)
        .await
        .unwrap();

    let instance = engine.instances().get(instance_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);

    let executions = engine.executions().list_for_instance(instance_id).await.unwrap();
    let attempts: Vec<u32> = executions
        .iter()
        .filter(|e| e.node_id == "boom")
        .map(|e| e.attempt_number)
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);

    // Delay before the next attempt is recorded, never slept in-process.
    assert_eq!(executions[0].retry_delay_minutes, Some(15));
    assert_eq!(executions[2].retry_delay_minutes, None);
}

#[tokio::test]
async fn entry_conditions_gate_start() {
    let engine = Engine::in_memory(EngineConfig::default());

    let definition = WorkflowDefinition::new("Gated", TriggerSpec::new("manual"))
        .with_entry_conditions(vec![Predicate::new(
            "amount",
            ConditionOperator::GreaterThan,
            json!(1000),
        )])
        .add_node(task("a"))
        .add_node(end("done"))
        .add_connection(Connection::new("a", "done"));

    let (definition, _) = engine.publish(definition).await.unwrap();

    let rejected = engine
        .runner()
        .start(definition.id, ctx(json!({"amount": 500})), None)
        .await;
    assert!(matches!(rejected, Err(EngineError::Validation(_))));

    let accepted = engine
        .runner()
        .start(definition.id, ctx(json!({"amount": 1500})), None)
        .await;
    assert!(accepted.is_ok());
}

#[tokio::test]
async fn max_concurrent_limits_active_instances() {
    let engine = Engine::in_memory(EngineConfig::default());

    let definition = WorkflowDefinition::new("Limited", TriggerSpec::new("manual"))
        .with_max_concurrent(1)
        .add_node(Node::new("wait", "Wait", NodeConfig::Delay { duration_minutes: 60 }))
        .add_node(end("done"))
        .add_connection(Connection::new("wait", "done"));

    let (definition, _) = engine.publish(definition).await.unwrap();

    let first = engine
        .runner()
        .start(definition.id, Context::new(), None)
        .await
        .unwrap();
    let instance = engine.instances().get(first).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Waiting);

    let second = engine.runner().start(definition.id, Context::new(), None).await;
    assert!(matches!(second, Err(EngineError::InvalidState(_))));

    // Finishing the first frees the slot.
    engine.runner().resume(first, Context::new()).await.unwrap();
    assert!(engine.runner().start(definition.id, Context::new(), None).await.is_ok());
}

#[tokio::test]
async fn cancel_discards_pending_resume() {
    let engine = Engine::in_memory(EngineConfig::default());

    let definition = WorkflowDefinition::new("Cancellable", TriggerSpec::new("manual"))
        .add_node(Node::new("wait", "Wait", NodeConfig::Delay { duration_minutes: 60 }))
        .add_node(end("done"))
        .add_connection(Connection::new("wait", "done"));

    let (definition, _) = engine.publish(definition).await.unwrap();
    let instance_id = engine
        .runner()
        .start(definition.id, Context::new(), None)
        .await
        .unwrap();

    engine.runner().cancel(instance_id).await.unwrap();

    let instance = engine.instances().get(instance_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Cancelled);
    assert!(instance.resume_at.is_none());

    // Terminal states reject both resume and a second cancel.
    assert!(matches!(
        engine.runner().resume(instance_id, Context::new()).await,
        Err(EngineError::InvalidState(_))
    ));
    assert!(matches!(
        engine.runner().cancel(instance_id).await,
        Err(EngineError::InvalidState(_))
    ));
}

#[tokio::test]
async fn step_budget_stops_runaway_graphs() {
    let engine = Engine::in_memory(EngineConfig {
        max_steps_per_instance: 10,
        ..EngineConfig::default()
    });

    // A cyclic graph cannot pass activation; simulate a legacy definition
    // stored as active to prove the runtime backstop holds.
    let mut definition = WorkflowDefinition::new("Loopy", TriggerSpec::new("manual"))
        .add_node(task("a").entry())
        .add_node(task("b"))
        .add_connection(Connection::new("a", "b"))
        .add_connection(Connection::new("b", "a"));
    definition.status = flowforge_engine::DefinitionStatus::Active;
    engine.definitions().save(&definition).await.unwrap();

    let instance_id = engine
        .runner()
        .start(definition.id, Context::new(), None)
        .await
        .unwrap();

    let instance = engine.instances().get(instance_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert!(instance.error_message.as_deref().unwrap().contains("step budget"));
    assert_eq!(instance.steps_taken, 10);
}

fn approval_definition(approvers: Vec<&str>, policy: AggregationPolicy) -> WorkflowDefinition {
    WorkflowDefinition::new("Approval flow", TriggerSpec::new("record.created"))
        .with_entry_conditions(vec![Predicate::new(
            "amount",
            ConditionOperator::GreaterThan,
            json!(1000),
        )])
        .add_node(Node::new(
            "gate",
            "Manager approval",
            NodeConfig::Approval {
                approvers: approvers.into_iter().map(String::from).collect(),
                policy,
                due_hours: Some(24),
                instructions: "Amount is {{trigger.amount}}".into(),
            },
        ))
        .add_node(task("record_task"))
        .add_node(end("end_success"))
        .add_connection(Connection::new("gate", "record_task"))
        .add_connection(Connection::new("record_task", "end_success"))
}

#[tokio::test]
async fn single_approver_flow_end_to_end() {
    let engine = Engine::in_memory(EngineConfig::default());

    let (definition, _) = engine
        .publish(approval_definition(vec!["manager"], AggregationPolicy::All))
        .await
        .unwrap();

    let instance_id = engine
        .runner()
        .start(definition.id, ctx(json!({"amount": 2000})), None)
        .await
        .unwrap();

    let instance = engine.instances().get(instance_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Waiting);
    assert_eq!(instance.current_node.as_deref(), Some("gate"));

    let executions = engine.executions().list_for_instance(instance_id).await.unwrap();
    let gate = executions.iter().find(|e| e.node_id == "gate").unwrap();
    let requests = engine.approval_requests().list_for_execution(gate.id).await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].status, ApprovalStatus::Pending);
    assert_eq!(requests[0].approver, "manager");

    engine
        .approvals()
        .decide(requests[0].id, ApprovalDecision::Approve, Some("ok".into()))
        .await
        .unwrap();

    let instance = engine.instances().get(instance_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(instance.context["resume"]["approval_decision"], json!("approved"));
    assert_eq!(instance.context["resume"]["approved_by"], json!("manager"));

    let executions = engine.executions().list_for_instance(instance_id).await.unwrap();
    let visited: Vec<&str> = executions.iter().map(|e| e.node_id.as_str()).collect();
    assert_eq!(visited, vec!["gate", "record_task", "end_success"]);

    let gate = executions.iter().find(|e| e.node_id == "gate").unwrap();
    assert_eq!(gate.status, ExecutionStatus::Completed);
    assert_eq!(gate.approval_status.as_deref(), Some("approved"));
    assert_eq!(gate.approved_by.as_deref(), Some("manager"));

    // Deciding an already-settled request is rejected.
    let duplicate = engine
        .approvals()
        .decide(requests[0].id, ApprovalDecision::Reject, None)
        .await;
    assert!(matches!(duplicate, Err(EngineError::InvalidState(_))));
}

#[tokio::test]
async fn majority_policy_waits_for_second_vote() {
    let engine = Engine::in_memory(EngineConfig::default());

    let (definition, _) = engine
        .publish(approval_definition(
            vec!["alice", "bob", "carol"],
            AggregationPolicy::Majority,
        ))
        .await
        .unwrap();

    let instance_id = engine
        .runner()
        .start(definition.id, ctx(json!({"amount": 5000})), None)
        .await
        .unwrap();

    let executions = engine.executions().list_for_instance(instance_id).await.unwrap();
    let gate = executions.iter().find(|e| e.node_id == "gate").unwrap();
    let requests = engine.approval_requests().list_for_execution(gate.id).await.unwrap();
    assert_eq!(requests.len(), 3);
    let by_approver = |name: &str| requests.iter().find(|r| r.approver == name).unwrap().id;

    // One approval out of three does not resolve a majority.
    engine
        .approvals()
        .decide(by_approver("alice"), ApprovalDecision::Approve, None)
        .await
        .unwrap();
    let instance = engine.instances().get(instance_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Waiting);

    engine
        .approvals()
        .decide(by_approver("bob"), ApprovalDecision::Approve, None)
        .await
        .unwrap();
    let instance = engine.instances().get(instance_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);

    // The undecided request is expired once the round resolves.
    let requests = engine.approval_requests().list_for_execution(gate.id).await.unwrap();
    let carol = requests.iter().find(|r| r.approver == "carol").unwrap();
    assert_eq!(carol.status, ApprovalStatus::Expired);
}

#[tokio::test]
async fn all_policy_rejects_on_first_rejection() {
    let engine = Engine::in_memory(EngineConfig::default());

    let (definition, _) = engine
        .publish(approval_definition(
            vec!["alice", "bob"],
            AggregationPolicy::All,
        ))
        .await
        .unwrap();

    let instance_id = engine
        .runner()
        .start(definition.id, ctx(json!({"amount": 5000})), None)
        .await
        .unwrap();

    let executions = engine.executions().list_for_instance(instance_id).await.unwrap();
    let gate = executions.iter().find(|e| e.node_id == "gate").unwrap();
    let requests = engine.approval_requests().list_for_execution(gate.id).await.unwrap();

    engine
        .approvals()
        .decide(requests[0].id, ApprovalDecision::Reject, Some("too costly".into()))
        .await
        .unwrap();

    let instance = engine.instances().get(instance_id).await.unwrap().unwrap();
    // Rejection resumes the run; routing decides what a rejection means.
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(instance.context["resume"]["approval_decision"], json!("rejected"));

    let executions = engine.executions().list_for_instance(instance_id).await.unwrap();
    let gate = executions.iter().find(|e| e.node_id == "gate").unwrap();
    assert_eq!(gate.approval_status.as_deref(), Some("rejected"));
}

#[tokio::test]
async fn delegation_reassigns_the_request() {
    let engine = Engine::in_memory(EngineConfig::default());

    let (definition, _) = engine
        .publish(approval_definition(vec!["manager"], AggregationPolicy::All))
        .await
        .unwrap();

    let instance_id = engine
        .runner()
        .start(definition.id, ctx(json!({"amount": 3000})), None)
        .await
        .unwrap();

    let executions = engine.executions().list_for_instance(instance_id).await.unwrap();
    let gate = executions.iter().find(|e| e.node_id == "gate").unwrap();
    let requests = engine.approval_requests().list_for_execution(gate.id).await.unwrap();

    let delegated = engine
        .approvals()
        .delegate(requests[0].id, "director", "on vacation")
        .await
        .unwrap();
    assert_eq!(delegated.approver, "director");
    assert_eq!(delegated.status, ApprovalStatus::Pending);

    let original = engine
        .approval_requests()
        .get(requests[0].id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(original.status, ApprovalStatus::Delegated);
    assert_eq!(original.delegated_to.as_deref(), Some("director"));

    // The delegate's decision resolves the round.
    engine
        .approvals()
        .decide(delegated.id, ApprovalDecision::Approve, None)
        .await
        .unwrap();

    let instance = engine.instances().get(instance_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
}

#[tokio::test]
async fn trigger_router_starts_matching_definitions() {
    let engine = Engine::in_memory(EngineConfig::default());

    let (matching, _) = engine
        .publish(approval_definition(vec!["manager"], AggregationPolicy::All))
        .await
        .unwrap();

    let other = WorkflowDefinition::new("Unrelated", TriggerSpec::new("user.deleted"))
        .add_node(task("a"))
        .add_node(end("done"))
        .add_connection(Connection::new("a", "done"));
    engine.publish(other).await.unwrap();

    let started = engine
        .triggers()
        .process_event(TriggerEvent::new(
            "record.created",
            ctx(json!({"amount": 9000})),
        ))
        .await
        .unwrap();

    assert_eq!(started.len(), 1);
    let instance = engine.instances().get(started[0]).await.unwrap().unwrap();
    assert_eq!(instance.definition_id, matching.id);
    assert_eq!(instance.status, InstanceStatus::Waiting);

    // Entry conditions filter events that match only by type.
    let started = engine
        .triggers()
        .process_event(TriggerEvent::new(
            "record.created",
            ctx(json!({"amount": 1})),
        ))
        .await
        .unwrap();
    assert!(started.is_empty());
}

#[tokio::test]
async fn set_variables_feed_downstream_templates() {
    let engine = Engine::in_memory(EngineConfig::default());

    let mut assignments = HashMap::new();
    assignments.insert(
        "summary".to_string(),
        "{{trigger.customer}} owes {{trigger.amount}}".to_string(),
    );

    let definition = WorkflowDefinition::new("Templating", TriggerSpec::new("manual"))
        .add_node(Node::new("vars", "Vars", NodeConfig::SetVariables { assignments }))
        .add_node(Node::new(
            "notify",
            "Notify",
            NodeConfig::Notify {
                channel: "email".into(),
                message: "Reminder: {{node_vars.summary}}".into(),
                recipients: vec!["billing@example.com".into()],
            },
        ))
        .add_node(end("done"))
        .add_connection(Connection::new("vars", "notify"))
        .add_connection(Connection::new("notify", "done"));

    let (definition, _) = engine.publish(definition).await.unwrap();
    let instance_id = engine
        .runner()
        .start(
            definition.id,
            ctx(json!({"customer": "ACME", "amount": 250})),
            None,
        )
        .await
        .unwrap();

    let instance = engine.instances().get(instance_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(
        instance.context["node_notify"]["message"],
        json!("Reminder: ACME owes 250")
    );
}
