use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::graph::{EdgeLabel, Graph};

/// Input/output pair for a node's real execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionMessage<I, O> {
    pub node: String,
    pub input: I,
    pub output: O,
}

impl<I, O> ExecutionMessage<I, O> {
    pub fn new(node: impl Into<String>, input: I, output: O) -> Self {
        Self {
            node: node.into(),
            input,
            output,
        }
    }
}

/// Input/output pair for a node on a branch that was not taken.
///
/// Same shape as [`ExecutionMessage`], kept as its own type so a hook can never
/// mistake a pruned traversal for real work.
#[derive(Debug, Clone, PartialEq)]
pub struct SkipMessage<I, O> {
    pub node: String,
    pub input: I,
    pub output: O,
}

impl<I, O> SkipMessage<I, O> {
    pub fn new(node: impl Into<String>, input: I, output: O) -> Self {
        Self {
            node: node.into(),
            input,
            output,
        }
    }
}

/// Which hook a scheduled node is handed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    Execute,
    Skip,
    Cancel,
    Restart,
}

impl DispatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Execute => "execute",
            Self::Skip => "skip",
            Self::Cancel => "cancel",
            Self::Restart => "restart",
        }
    }

    /// Whether the label returned by the hook selects live outgoing edges.
    /// A skipped node never activates its successors.
    pub fn activates_successors(&self) -> bool {
        !matches!(self, Self::Skip)
    }

    /// Terminal status for a node that returned `label` under this mode.
    pub fn resolved_status(&self, label: EdgeLabel) -> NodeStatus {
        match self {
            Self::Execute | Self::Restart => NodeStatus::Executed(label),
            Self::Skip => NodeStatus::Skipped(label),
            Self::Cancel => NodeStatus::Cancelled(label),
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-node, per-execution state.
///
/// `Pending -> Running -> {Executed | Skipped | Cancelled | Failed}`; the
/// terminal states are final within one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "label", rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Executed(EdgeLabel),
    Skipped(EdgeLabel),
    Cancelled(EdgeLabel),
    Failed,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Executed, skipped, or cancelled: the node's outgoing edges were resolved.
    pub fn is_resolved(&self) -> bool {
        self.label().is_some()
    }

    pub fn label(&self) -> Option<EdgeLabel> {
        match self {
            Self::Executed(l) | Self::Skipped(l) | Self::Cancelled(l) => Some(*l),
            _ => None,
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Running => f.write_str("running"),
            Self::Executed(l) => write!(f, "executed({})", l),
            Self::Skipped(l) => write!(f, "skipped({})", l),
            Self::Cancelled(l) => write!(f, "cancelled({})", l),
            Self::Failed => f.write_str("failed"),
        }
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = String;

    /// Inverse of `Display`: `pending`, `running`, `failed`, `executed(LABEL)`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => return Ok(Self::Pending),
            "running" => return Ok(Self::Running),
            "failed" => return Ok(Self::Failed),
            _ => {}
        }
        let (state, label) = s
            .strip_suffix(')')
            .and_then(|rest| rest.split_once('('))
            .ok_or_else(|| format!("unknown node status: {}", s))?;
        let label = label.parse::<EdgeLabel>().map_err(|e| e.to_string())?;
        match state {
            "executed" => Ok(Self::Executed(label)),
            "skipped" => Ok(Self::Skipped(label)),
            "cancelled" => Ok(Self::Cancelled(label)),
            other => Err(format!("unknown node status: {}", other)),
        }
    }
}

/// Node id -> status for one execution.
///
/// Created fresh per execution and owned by it; the snapshot returned at the
/// end can be persisted and handed back to resume a later execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusTable(BTreeMap<String, NodeStatus>);

impl StatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every node of `graph` in `Pending`.
    pub fn for_graph(graph: &Graph) -> Self {
        Self(
            graph
                .nodes()
                .iter()
                .map(|n| (n.clone(), NodeStatus::Pending))
                .collect(),
        )
    }

    /// Status of `node`; unknown nodes read as `Pending`.
    pub fn get(&self, node: &str) -> NodeStatus {
        self.0.get(node).copied().unwrap_or(NodeStatus::Pending)
    }

    pub fn set(&mut self, node: impl Into<String>, status: NodeStatus) {
        self.0.insert(node.into(), status);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, NodeStatus)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Nodes currently in `status`.
    pub fn nodes_with(&self, status: NodeStatus) -> Vec<&str> {
        self.iter()
            .filter(|(_, s)| *s == status)
            .map(|(n, _)| n)
            .collect()
    }

    /// Nodes that never reached a terminal state.
    pub fn unresolved(&self) -> Vec<&str> {
        self.iter()
            .filter(|(_, s)| !s.is_terminal())
            .map(|(n, _)| n)
            .collect()
    }

    pub fn is_executed(&self, node: &str) -> bool {
        matches!(self.get(node), NodeStatus::Executed(_))
    }

    pub fn is_skipped(&self, node: &str) -> bool {
        matches!(self.get(node), NodeStatus::Skipped(_))
    }
}

impl FromIterator<(String, NodeStatus)> for StatusTable {
    fn from_iter<T: IntoIterator<Item = (String, NodeStatus)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::parse_graph;

    #[test]
    fn test_status_predicates() {
        assert!(!NodeStatus::Pending.is_terminal());
        assert!(!NodeStatus::Running.is_terminal());
        assert!(NodeStatus::Failed.is_terminal());
        assert!(!NodeStatus::Failed.is_resolved());
        assert!(NodeStatus::Skipped(EdgeLabel::Success).is_resolved());
        assert_eq!(
            NodeStatus::Cancelled(EdgeLabel::Failure).label(),
            Some(EdgeLabel::Failure)
        );
    }

    #[test]
    fn test_status_parses_its_display_form() {
        for status in [
            NodeStatus::Pending,
            NodeStatus::Running,
            NodeStatus::Executed(EdgeLabel::Success),
            NodeStatus::Skipped(EdgeLabel::Default),
            NodeStatus::Cancelled(EdgeLabel::Failure),
            NodeStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<NodeStatus>(), Ok(status));
        }
        assert!("executed(MAYBE)".parse::<NodeStatus>().is_err());
        assert!("done".parse::<NodeStatus>().is_err());
    }

    #[test]
    fn test_dispatch_mode_status() {
        assert_eq!(
            DispatchMode::Restart.resolved_status(EdgeLabel::Success),
            NodeStatus::Executed(EdgeLabel::Success)
        );
        assert!(!DispatchMode::Skip.activates_successors());
        assert!(DispatchMode::Cancel.activates_successors());
    }

    #[test]
    fn test_table_for_graph_starts_pending() {
        let graph = parse_graph("[START>A/SUCCESS, A>END/SUCCESS]").unwrap();
        let mut table = StatusTable::for_graph(&graph);
        assert_eq!(table.len(), 3);
        assert_eq!(table.unresolved().len(), 3);

        table.set("A", NodeStatus::Executed(EdgeLabel::Success));
        assert!(table.is_executed("A"));
        assert_eq!(table.get("missing"), NodeStatus::Pending);
        assert_eq!(table.nodes_with(NodeStatus::Pending), vec!["END", "START"]);
    }

    #[test]
    fn test_table_serializes_as_map() {
        let mut table = StatusTable::new();
        table.set("A", NodeStatus::Skipped(EdgeLabel::Failure));
        table.set("B", NodeStatus::Failed);

        let json = serde_json::to_value(&table).unwrap();
        assert_eq!(json["A"]["state"], "skipped");
        assert_eq!(json["A"]["label"], "FAILURE");
        assert_eq!(json["B"]["state"], "failed");

        let back: StatusTable = serde_json::from_value(json).unwrap();
        assert_eq!(back, table);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(
            NodeStatus::Executed(EdgeLabel::Success).to_string(),
            "executed(SUCCESS)"
        );
        assert_eq!(NodeStatus::Pending.to_string(), "pending");
    }
}
