//! Graph view over a definition's nodes and connections
//!
//! Built once per run (and at validation time) from the flat node/connection
//! lists. Entry resolution, ordered outgoing edges, cycle and reachability
//! checks all live here.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::HashMap;

use crate::node::{Connection, Node};
use crate::{EngineError, Result};

pub struct WorkflowGraph {
    graph: DiGraph<String, ()>,
    node_to_index: HashMap<String, NodeIndex>,
    nodes: HashMap<String, Node>,
    /// Outgoing connections per node, ascending by priority.
    outgoing: HashMap<String, Vec<Connection>>,
    entry: String,
}

impl WorkflowGraph {
    /// Build the graph, resolving the entry node.
    ///
    /// Entry resolution: an explicit `is_entry` flag wins and must be unique;
    /// without any flag, a single node with no incoming connection is
    /// accepted. Zero candidates or ambiguity is a validation error.
    pub fn build(nodes: &[Node], connections: &[Connection]) -> Result<Self> {
        if nodes.is_empty() {
            return Err(EngineError::Validation("workflow has no nodes".into()));
        }

        let mut graph = DiGraph::new();
        let mut node_to_index = HashMap::new();
        let mut node_map = HashMap::new();

        for node in nodes {
            if node_map.contains_key(&node.node_id) {
                return Err(EngineError::Validation(format!(
                    "duplicate node id: {}",
                    node.node_id
                )));
            }
            let index = graph.add_node(node.node_id.clone());
            node_to_index.insert(node.node_id.clone(), index);
            node_map.insert(node.node_id.clone(), node.clone());
        }

        let mut outgoing: HashMap<String, Vec<Connection>> = HashMap::new();
        for connection in connections {
            let source = node_to_index.get(&connection.source_node).ok_or_else(|| {
                EngineError::Validation(format!(
                    "connection references unknown source node: {}",
                    connection.source_node
                ))
            })?;
            let target = node_to_index.get(&connection.target_node).ok_or_else(|| {
                EngineError::Validation(format!(
                    "connection references unknown target node: {}",
                    connection.target_node
                ))
            })?;

            graph.add_edge(*source, *target, ());
            outgoing
                .entry(connection.source_node.clone())
                .or_default()
                .push(connection.clone());
        }

        for edges in outgoing.values_mut() {
            edges.sort_by_key(|c| c.priority);
        }

        let entry = resolve_entry(nodes, &graph, &node_to_index)?;

        Ok(Self {
            graph,
            node_to_index,
            nodes: node_map,
            outgoing,
            entry,
        })
    }

    pub fn entry_node(&self) -> &Node {
        &self.nodes[&self.entry]
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Outgoing connections of a node, ascending by priority.
    pub fn outgoing(&self, node_id: &str) -> &[Connection] {
        self.outgoing
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn has_cycles(&self) -> bool {
        petgraph::algo::is_cyclic_directed(&self.graph)
    }

    /// Node ids not reachable from the entry node.
    pub fn unreachable_nodes(&self) -> Vec<String> {
        let start = self.node_to_index[&self.entry];
        let mut reached = vec![false; self.graph.node_count()];
        let mut dfs = Dfs::new(&self.graph, start);
        while let Some(index) = dfs.next(&self.graph) {
            reached[index.index()] = true;
        }

        let mut unreachable: Vec<String> = self
            .graph
            .node_indices()
            .filter(|index| !reached[index.index()])
            .map(|index| self.graph[index].clone())
            .collect();
        unreachable.sort();
        unreachable
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn resolve_entry(
    nodes: &[Node],
    graph: &DiGraph<String, ()>,
    node_to_index: &HashMap<String, NodeIndex>,
) -> Result<String> {
    let flagged: Vec<&Node> = nodes.iter().filter(|n| n.is_entry).collect();
    match flagged.len() {
        1 => return Ok(flagged[0].node_id.clone()),
        0 => {}
        _ => {
            return Err(EngineError::Validation(format!(
                "multiple nodes marked as entry: {}",
                flagged
                    .iter()
                    .map(|n| n.node_id.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )))
        }
    }

    let mut candidates: Vec<&str> = nodes
        .iter()
        .filter(|node| {
            let index = node_to_index[&node.node_id];
            graph
                .neighbors_directed(index, petgraph::Direction::Incoming)
                .next()
                .is_none()
        })
        .map(|node| node.node_id.as_str())
        .collect();

    match candidates.len() {
        0 => Err(EngineError::Validation(
            "no entry candidate: every node has an incoming connection".into(),
        )),
        1 => Ok(candidates.remove(0).to_string()),
        _ => Err(EngineError::Validation(format!(
            "ambiguous entry: {} nodes have no incoming connection; mark one with is_entry",
            candidates.len()
        ))),
    }
}
