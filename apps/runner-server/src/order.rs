use std::collections::{HashMap, HashSet};

use crate::models::{AgentNode, PipelineConnection};

/// Compute the execution order of a pipeline.
///
/// Pipelines are built as a single chain, so this walks the chain from the
/// first node without an incoming edge instead of doing a full topological
/// sort. Nodes the walk never reaches run afterwards in their input
/// order. When every node has an incoming edge (a ring), the input order
/// is returned unchanged.
pub fn resolve_execution_order(nodes: &[AgentNode], connections: &[PipelineConnection]) -> Vec<String> {
    if nodes.is_empty() {
        return Vec::new();
    }

    let known: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();

    // One edge per source under the chain convention; a later edge wins.
    let mut outgoing: HashMap<&str, &str> = HashMap::new();
    let mut incoming: HashSet<&str> = HashSet::new();
    for conn in connections {
        if !known.contains(conn.source_node_id.as_str()) || !known.contains(conn.target_node_id.as_str()) {
            tracing::warn!(
                connection_id = %conn.id,
                "Ignoring connection to unknown node ({} -> {})",
                conn.source_node_id,
                conn.target_node_id
            );
            continue;
        }
        outgoing.insert(&conn.source_node_id, &conn.target_node_id);
        incoming.insert(&conn.target_node_id);
    }

    let start = match nodes.iter().find(|n| !incoming.contains(n.id.as_str())) {
        Some(node) => node.id.as_str(),
        None => {
            tracing::warn!("No root node found, falling back to insertion order");
            return nodes.iter().map(|n| n.id.clone()).collect();
        }
    };

    let mut order = Vec::with_capacity(nodes.len());
    let mut visited: HashSet<&str> = HashSet::new();
    let mut current = Some(start);

    while let Some(id) = current {
        if !visited.insert(id) {
            break;
        }
        order.push(id.to_string());
        current = outgoing.get(id).copied();
    }

    for node in nodes {
        if !visited.contains(node.id.as_str()) {
            order.push(node.id.clone());
        }
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentType;

    fn node(id: &str) -> AgentNode {
        AgentNode::new(id, AgentType::Writer)
    }

    fn edge(from: &str, to: &str) -> PipelineConnection {
        PipelineConnection::new(from, to)
    }

    #[test]
    fn test_linear_chain_ignores_input_order() {
        let nodes = vec![node("c"), node("a"), node("b")];
        let conns = vec![edge("b", "c"), edge("a", "b")];

        assert_eq!(resolve_execution_order(&nodes, &conns), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_disconnected_node_runs_last() {
        let nodes = vec![node("a"), node("b"), node("c"), node("d")];
        let conns = vec![edge("a", "b"), edge("b", "c")];

        assert_eq!(
            resolve_execution_order(&nodes, &conns),
            vec!["a", "b", "c", "d"]
        );
    }

    #[test]
    fn test_orphan_before_chain_starts_first() {
        // The orphan is the first node without an incoming edge.
        let nodes = vec![node("x"), node("a"), node("b")];
        let conns = vec![edge("a", "b")];

        assert_eq!(resolve_execution_order(&nodes, &conns), vec!["x", "a", "b"]);
    }

    #[test]
    fn test_empty() {
        assert!(resolve_execution_order(&[], &[]).is_empty());
    }

    #[test]
    fn test_ring_falls_back_to_insertion_order() {
        let nodes = vec![node("b"), node("a")];
        let conns = vec![edge("a", "b"), edge("b", "a")];

        assert_eq!(resolve_execution_order(&nodes, &conns), vec!["b", "a"]);
    }

    #[test]
    fn test_cycle_after_root_is_cut() {
        let nodes = vec![node("a"), node("b"), node("c")];
        let conns = vec![edge("a", "b"), edge("b", "c"), edge("c", "b")];

        assert_eq!(resolve_execution_order(&nodes, &conns), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_branch_last_edge_wins() {
        let nodes = vec![node("a"), node("b"), node("c")];
        let conns = vec![edge("a", "b"), edge("a", "c")];

        assert_eq!(resolve_execution_order(&nodes, &conns), vec!["a", "c", "b"]);
    }

    #[test]
    fn test_unknown_endpoint_ignored() {
        let nodes = vec![node("a"), node("b")];
        let conns = vec![edge("ghost", "a"), edge("a", "b")];

        assert_eq!(resolve_execution_order(&nodes, &conns), vec!["a", "b"]);
    }
}
