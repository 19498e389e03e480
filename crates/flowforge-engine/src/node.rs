//! Node and connection model
//!
//! Node behavior is a closed sum type with per-variant structured config, so
//! an unknown node type fails at deserialization time rather than
//! mid-execution. Handlers are still looked up through a registry keyed by
//! [`NodeKind`], which keeps the dispatch surface pluggable for hosts that
//! replace the built-in action handlers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::approval::AggregationPolicy;
use crate::condition::Predicate;
use crate::Context;

/// Discriminant of a node's behavior, used as the handler registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Task,
    Notify,
    Delay,
    Branch,
    SetVariables,
    Approval,
    AiPrompt,
    End,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeKind::Task => "task",
            NodeKind::Notify => "notify",
            NodeKind::Delay => "delay",
            NodeKind::Branch => "branch",
            NodeKind::SetVariables => "set_variables",
            NodeKind::Approval => "approval",
            NodeKind::AiPrompt => "ai_prompt",
            NodeKind::End => "end",
        };
        write!(f, "{}", name)
    }
}

/// Terminal disposition requested by an end node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndDisposition {
    #[default]
    Success,
    Failure,
}

/// Type-specific node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeConfig {
    /// Generic business action carried out by a host-registered handler.
    Task {
        action: String,
        #[serde(default)]
        params: Context,
    },
    /// Notification dispatch; message supports `{{path}}` templating.
    Notify {
        channel: String,
        message: String,
        #[serde(default)]
        recipients: Vec<String>,
    },
    /// Suspend the instance until `resume` is called by the delay poller.
    Delay { duration_minutes: u32 },
    /// Evaluate predicates against the context and emit a yes/no branch.
    Branch { conditions: Vec<Predicate> },
    /// Write templated values into the node's output.
    SetVariables { assignments: HashMap<String, String> },
    /// Suspend the instance until the approval policy resolves.
    Approval {
        approvers: Vec<String>,
        #[serde(default)]
        policy: AggregationPolicy,
        #[serde(default)]
        due_hours: Option<u32>,
        #[serde(default)]
        instructions: String,
    },
    /// Prompt dispatched to a host-registered model handler.
    AiPrompt {
        prompt: String,
        #[serde(default)]
        model: Option<String>,
    },
    /// Terminal node.
    End {
        #[serde(default)]
        disposition: EndDisposition,
    },
}

impl NodeConfig {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeConfig::Task { .. } => NodeKind::Task,
            NodeConfig::Notify { .. } => NodeKind::Notify,
            NodeConfig::Delay { .. } => NodeKind::Delay,
            NodeConfig::Branch { .. } => NodeKind::Branch,
            NodeConfig::SetVariables { .. } => NodeKind::SetVariables,
            NodeConfig::Approval { .. } => NodeKind::Approval,
            NodeConfig::AiPrompt { .. } => NodeKind::AiPrompt,
            NodeConfig::End { .. } => NodeKind::End,
        }
    }
}

/// Per-node declaration of how a failure affects the enclosing instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnErrorPolicy {
    #[default]
    Stop,
    Continue,
    Branch,
}

/// One typed step in a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// String key, unique within the definition.
    pub node_id: String,
    pub name: String,
    #[serde(flatten)]
    pub config: NodeConfig,
    /// Explicit entry marker; validated at activation.
    #[serde(default)]
    pub is_entry: bool,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub retry_delay_minutes: u32,
    #[serde(default)]
    pub on_error: OnErrorPolicy,
    #[serde(default)]
    pub error_branch_node: Option<String>,
}

impl Node {
    pub fn new(node_id: impl Into<String>, name: impl Into<String>, config: NodeConfig) -> Self {
        Self {
            node_id: node_id.into(),
            name: name.into(),
            config,
            is_entry: false,
            timeout_minutes: None,
            retry_count: 0,
            retry_delay_minutes: 0,
            on_error: OnErrorPolicy::default(),
            error_branch_node: None,
        }
    }

    pub fn entry(mut self) -> Self {
        self.is_entry = true;
        self
    }

    pub fn with_on_error(mut self, policy: OnErrorPolicy) -> Self {
        self.on_error = policy;
        self
    }

    pub fn with_error_branch(mut self, node_id: impl Into<String>) -> Self {
        self.on_error = OnErrorPolicy::Branch;
        self.error_branch_node = Some(node_id.into());
        self
    }

    pub fn with_retries(mut self, count: u32, delay_minutes: u32) -> Self {
        self.retry_count = count;
        self.retry_delay_minutes = delay_minutes;
        self
    }

    pub fn with_timeout(mut self, minutes: u32) -> Self {
        self.timeout_minutes = Some(minutes);
        self
    }

    pub fn kind(&self) -> NodeKind {
        self.config.kind()
    }

    pub fn is_end(&self) -> bool {
        self.kind() == NodeKind::End
    }
}

/// A directed, optionally conditioned edge between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub source_node: String,
    #[serde(default)]
    pub source_port: Option<String>,
    pub target_node: String,
    #[serde(default)]
    pub target_port: Option<String>,
    /// Predicates evaluated against the source node's output.
    #[serde(default)]
    pub condition: Vec<Predicate>,
    /// When set, additionally requires `output.branch` to equal this label
    /// case-insensitively.
    #[serde(default)]
    pub label: Option<String>,
    /// Lower sorts first.
    #[serde(default)]
    pub priority: i32,
}

impl Connection {
    pub fn new(source_node: impl Into<String>, target_node: impl Into<String>) -> Self {
        Self {
            source_node: source_node.into(),
            source_port: None,
            target_node: target_node.into(),
            target_port: None,
            condition: Vec::new(),
            label: None,
            priority: 0,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_condition(mut self, condition: Vec<Predicate>) -> Self {
        self.condition = condition;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Does this connection accept the given source-node output?
    pub fn accepts(&self, output: &Context) -> bool {
        if !self.condition.is_empty() && !crate::condition::evaluate(&self.condition, output) {
            return false;
        }

        if let Some(ref label) = self.label {
            let branch = output
                .get("branch")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !branch.eq_ignore_ascii_case(label) {
                return false;
            }
        }

        true
    }
}
