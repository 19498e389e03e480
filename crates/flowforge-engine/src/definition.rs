//! Workflow definition model and activation validation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use flowforge_core::DefinitionId;

use crate::condition::Predicate;
use crate::graph::WorkflowGraph;
use crate::node::{Connection, Node, OnErrorPolicy};
use crate::{Context, EngineError, Result};

/// Lifecycle status of a definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    Draft,
    Active,
    Paused,
    Archived,
}

/// How instances of this definition are started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSpec {
    /// Event type that starts the workflow, e.g. `record.created`.
    pub trigger_type: String,
    #[serde(default)]
    pub config: Context,
}

impl TriggerSpec {
    pub fn new(trigger_type: impl Into<String>) -> Self {
        Self {
            trigger_type: trigger_type.into(),
            config: Context::new(),
        }
    }
}

/// Declared workflow variable with an optional default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    #[serde(default)]
    pub default: serde_json::Value,
    #[serde(default)]
    pub required: bool,
}

/// Non-fatal finding from the activation validation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationWarning {
    UnreachableNode { node_id: String },
}

/// A workflow definition: the immutable-per-version graph of typed nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: DefinitionId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: DefinitionStatus,
    pub version: u32,
    pub trigger: TriggerSpec,
    #[serde(default)]
    pub entry_conditions: Vec<Predicate>,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub variables: Vec<Variable>,
    #[serde(default)]
    pub max_concurrent: Option<u32>,
    #[serde(default)]
    pub timeout_hours: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, trigger: TriggerSpec) -> Self {
        let now = Utc::now();
        Self {
            id: DefinitionId::new(),
            name: name.into(),
            description: String::new(),
            status: DefinitionStatus::Draft,
            version: 1,
            trigger,
            entry_conditions: Vec::new(),
            nodes: Vec::new(),
            connections: Vec::new(),
            variables: Vec::new(),
            max_concurrent: None,
            timeout_hours: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn add_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn add_connection(mut self, connection: Connection) -> Self {
        self.connections.push(connection);
        self
    }

    pub fn with_entry_conditions(mut self, conditions: Vec<Predicate>) -> Self {
        self.entry_conditions = conditions;
        self
    }

    pub fn with_variables(mut self, variables: Vec<Variable>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_max_concurrent(mut self, limit: u32) -> Self {
        self.max_concurrent = Some(limit);
        self
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    /// Record a structural edit: bump the version, demote to draft.
    ///
    /// Running instances keep executing against the version they captured at
    /// start; the bumped definition must pass activation again.
    pub fn record_structural_edit(&mut self) {
        self.version += 1;
        self.status = DefinitionStatus::Draft;
        self.updated_at = Utc::now();
    }

    /// Full validation pass required before activation.
    pub fn validate(&self) -> Result<Vec<ValidationWarning>> {
        let graph = WorkflowGraph::build(&self.nodes, &self.connections)?;

        if !self.nodes.iter().any(Node::is_end) {
            return Err(EngineError::Validation(
                "workflow has no end node".into(),
            ));
        }

        for node in &self.nodes {
            let needs_branch = node.on_error == OnErrorPolicy::Branch;
            match (&node.error_branch_node, needs_branch) {
                (Some(target), _) if self.node(target).is_none() => {
                    return Err(EngineError::Validation(format!(
                        "node {} declares unresolved error_branch_node {}",
                        node.node_id, target
                    )));
                }
                (None, true) => {
                    return Err(EngineError::Validation(format!(
                        "node {} has on_error=branch but no error_branch_node",
                        node.node_id
                    )));
                }
                _ => {}
            }
        }

        if graph.has_cycles() {
            return Err(EngineError::Validation(
                "workflow graph contains a cycle".into(),
            ));
        }

        let warnings = graph
            .unreachable_nodes()
            .into_iter()
            .map(|node_id| ValidationWarning::UnreachableNode { node_id })
            .collect();

        Ok(warnings)
    }

    /// Validate and transition draft/paused -> active.
    pub fn activate(&mut self) -> Result<Vec<ValidationWarning>> {
        match self.status {
            DefinitionStatus::Draft | DefinitionStatus::Paused => {}
            status => {
                return Err(EngineError::InvalidState(format!(
                    "cannot activate definition in status {:?}",
                    status
                )))
            }
        }

        let warnings = self.validate()?;

        for warning in &warnings {
            let ValidationWarning::UnreachableNode { node_id } = warning;
            tracing::warn!(
                definition_id = %self.id,
                node_id = %node_id,
                "Unreachable node in activated workflow"
            );
        }

        self.status = DefinitionStatus::Active;
        self.updated_at = Utc::now();

        tracing::info!(
            definition_id = %self.id,
            name = %self.name,
            version = self.version,
            node_count = self.nodes.len(),
            "Workflow definition activated"
        );

        Ok(warnings)
    }
}

/// Definition repository trait
#[async_trait]
pub trait DefinitionRepository: Send + Sync {
    async fn save(&self, definition: &WorkflowDefinition) -> Result<()>;
    async fn get(&self, id: DefinitionId) -> Result<Option<WorkflowDefinition>>;
    async fn list(&self) -> Result<Vec<WorkflowDefinition>>;
    async fn list_active(&self) -> Result<Vec<WorkflowDefinition>>;
    async fn update(&self, definition: &WorkflowDefinition) -> Result<()>;
    async fn delete(&self, id: DefinitionId) -> Result<()>;
}

/// In-memory definition repository
pub struct InMemoryDefinitionRepository {
    definitions: Arc<RwLock<HashMap<DefinitionId, WorkflowDefinition>>>,
}

impl InMemoryDefinitionRepository {
    pub fn new() -> Self {
        Self {
            definitions: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryDefinitionRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DefinitionRepository for InMemoryDefinitionRepository {
    async fn save(&self, definition: &WorkflowDefinition) -> Result<()> {
        let mut definitions = self.definitions.write().await;
        definitions.insert(definition.id, definition.clone());
        Ok(())
    }

    async fn get(&self, id: DefinitionId) -> Result<Option<WorkflowDefinition>> {
        let definitions = self.definitions.read().await;
        Ok(definitions.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<WorkflowDefinition>> {
        let definitions = self.definitions.read().await;
        Ok(definitions.values().cloned().collect())
    }

    async fn list_active(&self) -> Result<Vec<WorkflowDefinition>> {
        let definitions = self.definitions.read().await;
        Ok(definitions
            .values()
            .filter(|d| d.status == DefinitionStatus::Active)
            .cloned()
            .collect())
    }

    async fn update(&self, definition: &WorkflowDefinition) -> Result<()> {
        let mut definitions = self.definitions.write().await;
        if definitions.contains_key(&definition.id) {
            definitions.insert(definition.id, definition.clone());
            Ok(())
        } else {
            Err(EngineError::NotFound(definition.id.to_string()))
        }
    }

    async fn delete(&self, id: DefinitionId) -> Result<()> {
        let mut definitions = self.definitions.write().await;
        definitions.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{EndDisposition, NodeConfig};

    fn linear_definition() -> WorkflowDefinition {
        WorkflowDefinition::new("Test", TriggerSpec::new("manual"))
            .add_node(Node::new(
                "start",
                "Start",
                NodeConfig::Task {
                    action: "noop".into(),
                    params: Context::new(),
                },
            ))
            .add_node(Node::new(
                "finish",
                "Finish",
                NodeConfig::End {
                    disposition: EndDisposition::Success,
                },
            ))
            .add_connection(Connection::new("start", "finish"))
    }

    #[test]
    fn test_activation_happy_path() {
        let mut definition = linear_definition();
        let warnings = definition.activate().unwrap();
        assert!(warnings.is_empty());
        assert_eq!(definition.status, DefinitionStatus::Active);
    }

    #[test]
    fn test_activation_requires_end_node() {
        let mut definition = WorkflowDefinition::new("Test", TriggerSpec::new("manual"))
            .add_node(Node::new(
                "only",
                "Only",
                NodeConfig::Task {
                    action: "noop".into(),
                    params: Context::new(),
                },
            ));

        assert!(matches!(
            definition.activate(),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_activation_rejects_cycles() {
        let mut definition = linear_definition().add_connection(Connection::new("finish", "start"));
        // The back edge also removes the sole entry candidate; flag it.
        definition.nodes[0].is_entry = true;

        assert!(matches!(
            definition.activate(),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_unresolved_error_branch_rejected() {
        let mut definition = linear_definition();
        definition.nodes[0] = definition.nodes[0].clone().with_error_branch("ghost");

        assert!(matches!(
            definition.activate(),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_unreachable_node_is_warning_not_error() {
        let mut definition = linear_definition().add_node(Node::new(
            "island",
            "Island",
            NodeConfig::End {
                disposition: EndDisposition::Success,
            },
        ));
        definition.nodes[0].is_entry = true;

        let warnings = definition.activate().unwrap();
        assert_eq!(
            warnings,
            vec![ValidationWarning::UnreachableNode {
                node_id: "island".into()
            }]
        );
        assert_eq!(definition.status, DefinitionStatus::Active);
    }

    #[test]
    fn test_structural_edit_bumps_version_and_demotes() {
        let mut definition = linear_definition();
        definition.activate().unwrap();

        definition.record_structural_edit();
        assert_eq!(definition.version, 2);
        assert_eq!(definition.status, DefinitionStatus::Draft);
    }

    #[tokio::test]
    async fn test_in_memory_repository() {
        let repo = InMemoryDefinitionRepository::new();
        let mut definition = linear_definition();

        repo.save(&definition).await.unwrap();
        assert!(repo.list_active().await.unwrap().is_empty());

        definition.activate().unwrap();
        repo.update(&definition).await.unwrap();
        assert_eq!(repo.list_active().await.unwrap().len(), 1);
    }
}
