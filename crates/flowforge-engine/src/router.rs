//! Connection routing
//!
//! Selects the next node after a completed one by walking the node's
//! outgoing connections in ascending priority order. A connection matches
//! when its condition list accepts the node's output and, if labeled, the
//! output's `branch` value equals the label case-insensitively.
//!
//! No outgoing connection matching is not an error: the run-loop treats a
//! dead end as successful completion of the instance. That conflation of
//! "dead end" and "workflow success" is deliberate, inherited behavior.

use crate::executor::NodeOutcome;
use crate::graph::WorkflowGraph;
use crate::node::Node;

pub struct ConnectionRouter;

impl ConnectionRouter {
    /// First matching outgoing connection's target, or `None` for a dead end.
    pub fn next<'a>(
        graph: &'a WorkflowGraph,
        from: &Node,
        outcome: &NodeOutcome,
    ) -> Option<&'a Node> {
        for connection in graph.outgoing(&from.node_id) {
            if !connection.accepts(&outcome.output) {
                tracing::trace!(
                    source = %connection.source_node,
                    target = %connection.target_node,
                    "Connection rejected"
                );
                continue;
            }

            tracing::debug!(
                source = %connection.source_node,
                target = %connection.target_node,
                label = connection.label.as_deref().unwrap_or(""),
                "Connection selected"
            );
            return graph.node(&connection.target_node);
        }

        None
    }
}
