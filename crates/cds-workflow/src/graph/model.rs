use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::label::EdgeLabel;

/// Reserved id of the node every execution starts from.
pub const START: &str = "START";
/// Reserved id of the node whose resolution ends an execution.
pub const END: &str = "END";

/// A labeled transition between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    pub label: EdgeLabel,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>, label: EdgeLabel) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            label,
        }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}>{}/{}", self.source, self.target, self.label)
    }
}

/// Directed graph of node ids connected by labeled edges.
///
/// Keeps a forward and a reverse adjacency index so both the scheduler
/// (outgoing edges) and the join tracker (incoming edges) can look up a
/// node's edges without scanning the whole edge list.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    /// Node ids in first-seen order.
    nodes: Vec<String>,
    edges: Vec<Edge>,
    /// node_id -> indices into `edges` leaving that node.
    outgoing: HashMap<String, Vec<usize>>,
    /// node_id -> indices into `edges` entering that node.
    incoming: HashMap<String, Vec<usize>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. Returns false if it already existed.
    pub fn add_node(&mut self, id: impl Into<String>) -> bool {
        let id = id.into();
        if self.outgoing.contains_key(&id) {
            return false;
        }
        self.outgoing.insert(id.clone(), Vec::new());
        self.incoming.insert(id.clone(), Vec::new());
        self.nodes.push(id);
        true
    }

    /// Add an edge, creating missing endpoints.
    ///
    /// An identical `(source, target, label)` triple is stored once; the same
    /// pair under a different label is a separate edge. Returns false if the
    /// edge already existed.
    pub fn add_edge(
        &mut self,
        source: impl Into<String>,
        target: impl Into<String>,
        label: EdgeLabel,
    ) -> bool {
        let edge = Edge::new(source, target, label);
        if self.outgoing_edges(&edge.source).any(|e| *e == edge) {
            return false;
        }
        self.add_node(edge.source.clone());
        self.add_node(edge.target.clone());

        let idx = self.edges.len();
        if let Some(out) = self.outgoing.get_mut(&edge.source) {
            out.push(idx);
        }
        if let Some(inc) = self.incoming.get_mut(&edge.target) {
            inc.push(idx);
        }
        self.edges.push(edge);
        true
    }

    /// All node ids in first-seen order.
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.outgoing.contains_key(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Edges leaving `node`.
    pub fn outgoing_edges<'a>(&'a self, node: &str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.indexed(self.outgoing.get(node))
    }

    /// Edges entering `node`.
    pub fn incoming_edges<'a>(&'a self, node: &str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.indexed(self.incoming.get(node))
    }

    /// Edges leaving `node` under `label`.
    pub fn outgoing_edges_with_label<'a>(
        &'a self,
        node: &str,
        label: EdgeLabel,
    ) -> impl Iterator<Item = &'a Edge> + 'a {
        self.outgoing_edges(node).filter(move |e| e.label == label)
    }

    /// Edges leaving `node` whose label is not in `labels`.
    pub fn outgoing_edges_not_in_labels<'a>(
        &'a self,
        node: &str,
        labels: &'a [EdgeLabel],
    ) -> impl Iterator<Item = &'a Edge> + 'a {
        self.outgoing_edges(node)
            .filter(move |e| !labels.contains(&e.label))
    }

    /// Number of incoming edges (join width) of `node`.
    pub fn in_degree(&self, node: &str) -> usize {
        self.incoming.get(node).map_or(0, Vec::len)
    }

    pub fn out_degree(&self, node: &str) -> usize {
        self.outgoing.get(node).map_or(0, Vec::len)
    }

    /// Nodes with more than one incoming edge.
    pub fn join_nodes(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| self.in_degree(n) > 1)
            .map(String::as_str)
            .collect()
    }

    /// Nodes without incoming edges.
    pub fn start_nodes(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| self.in_degree(n) == 0)
            .map(String::as_str)
            .collect()
    }

    /// Nodes without outgoing edges.
    pub fn end_nodes(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| self.out_degree(n) == 0)
            .map(String::as_str)
            .collect()
    }

    /// Nodes that take part in no edge at all.
    pub fn standalone_nodes(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| self.in_degree(n) == 0 && self.out_degree(n) == 0)
            .map(String::as_str)
            .collect()
    }

    /// Multi-line listing of nodes and edges, for diagnostics.
    pub fn describe(&self) -> String {
        let mut out = String::from("Nodes:");
        for node in &self.nodes {
            out.push_str(&format!(
                "\n\t{} (in {}, out {})",
                node,
                self.in_degree(node),
                self.out_degree(node)
            ));
        }
        out.push_str("\nEdges:");
        for edge in &self.edges {
            out.push_str(&format!("\n\t{}", edge));
        }
        out
    }

    fn indexed<'a>(&'a self, indices: Option<&'a Vec<usize>>) -> impl Iterator<Item = &'a Edge> + 'a {
        indices
            .into_iter()
            .flatten()
            .filter_map(move |&i| self.edges.get(i))
    }
}

/// Structural equality: same node set and same edge set, regardless of order.
impl PartialEq for Graph {
    fn eq(&self, other: &Self) -> bool {
        if self.nodes.len() != other.nodes.len() || self.edges.len() != other.edges.len() {
            return false;
        }
        let nodes: HashSet<&String> = self.nodes.iter().collect();
        let edges: HashSet<&Edge> = self.edges.iter().collect();
        other.nodes.iter().all(|n| nodes.contains(n)) && other.edges.iter().all(|e| edges.contains(e))
    }
}

impl Eq for Graph {}

/// Renders the bracket notation accepted by [`Graph::from_str`](std::str::FromStr).
impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .edges
            .iter()
            .map(ToString::to_string)
            .chain(self.standalone_nodes().into_iter().map(str::to_string))
            .collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> Graph {
        let mut g = Graph::new();
        g.add_edge(START, "A", EdgeLabel::Success);
        g.add_edge("A", "B", EdgeLabel::Success);
        g.add_edge("A", "C", EdgeLabel::Failure);
        g.add_edge("B", "D", EdgeLabel::Success);
        g.add_edge("C", "D", EdgeLabel::Success);
        g.add_edge("D", END, EdgeLabel::Success);
        g
    }

    #[test]
    fn test_adjacency_indexes() {
        let g = diamond();
        assert_eq!(g.node_count(), 6);
        assert_eq!(g.edge_count(), 6);
        assert_eq!(g.outgoing_edges("A").count(), 2);
        assert_eq!(g.in_degree("D"), 2);
        assert_eq!(g.in_degree(START), 0);
        assert_eq!(g.join_nodes(), vec!["D"]);
        assert_eq!(g.start_nodes(), vec![START]);
        assert_eq!(g.end_nodes(), vec![END]);
    }

    #[test]
    fn test_label_filters() {
        let g = diamond();
        let success: Vec<_> = g
            .outgoing_edges_with_label("A", EdgeLabel::Success)
            .map(|e| e.target.as_str())
            .collect();
        assert_eq!(success, vec!["B"]);

        let others: Vec<_> = g
            .outgoing_edges_not_in_labels("A", &[EdgeLabel::Success])
            .map(|e| e.target.as_str())
            .collect();
        assert_eq!(others, vec!["C"]);
    }

    #[test]
    fn test_duplicate_triples_stored_once() {
        let mut g = Graph::new();
        assert!(g.add_edge("A", "B", EdgeLabel::Success));
        assert!(!g.add_edge("A", "B", EdgeLabel::Success));
        assert!(g.add_edge("A", "B", EdgeLabel::Failure));
        assert_eq!(g.edge_count(), 2);
        assert_eq!(g.in_degree("B"), 2);
    }

    #[test]
    fn test_structural_equality_ignores_order() {
        let mut a = Graph::new();
        a.add_edge("X", "Y", EdgeLabel::Success);
        a.add_edge("Y", "Z", EdgeLabel::Failure);

        let mut b = Graph::new();
        b.add_edge("Y", "Z", EdgeLabel::Failure);
        b.add_edge("X", "Y", EdgeLabel::Success);

        assert_eq!(a, b);

        b.add_node("W");
        assert_ne!(a, b);
    }

    #[test]
    fn test_display_lists_standalone_nodes_last() {
        let mut g = Graph::new();
        g.add_node("LONE");
        g.add_edge("A", "B", EdgeLabel::Success);
        assert_eq!(g.to_string(), "[A>B/SUCCESS, LONE]");
    }

    #[test]
    fn test_unknown_node_queries_are_empty() {
        let g = diamond();
        assert!(!g.contains_node("nope"));
        assert_eq!(g.outgoing_edges("nope").count(), 0);
        assert_eq!(g.in_degree("nope"), 0);
    }
}
