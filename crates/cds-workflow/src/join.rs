use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::graph::{EdgeLabel, Graph};

/// How a node that became schedulable must be traversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// At least one incoming edge was taken.
    Execute,
    /// Every incoming edge belongs to a branch that was not taken.
    Skip,
}

#[derive(Debug)]
struct JoinSlot {
    remaining: AtomicUsize,
    activated: AtomicBool,
}

/// Per-execution join counters.
///
/// Each node starts with a counter equal to its in-degree. A resolving
/// predecessor decrements every outgoing edge's target; edges matching the
/// emitted label also mark the target activated. The decrement that reaches
/// zero schedules the node: Execute if activated, Skip otherwise.
///
/// Safe to share between tasks: the decrement that reaches zero is observed by
/// exactly one caller, so a join node fed by racing branches is scheduled once.
#[derive(Debug)]
pub struct JoinTracker {
    graph: Arc<Graph>,
    slots: HashMap<String, JoinSlot>,
}

impl JoinTracker {
    pub fn new(graph: Arc<Graph>) -> Self {
        let slots = graph
            .nodes()
            .iter()
            .map(|node| {
                (
                    node.clone(),
                    JoinSlot {
                        remaining: AtomicUsize::new(graph.in_degree(node)),
                        activated: AtomicBool::new(false),
                    },
                )
            })
            .collect();
        Self { graph, slots }
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Incoming edges of `node` not resolved yet.
    pub fn remaining(&self, node: &str) -> usize {
        self.slots
            .get(node)
            .map_or(0, |s| s.remaining.load(Ordering::SeqCst))
    }

    /// Resolve every outgoing edge of `node`.
    ///
    /// `emitted` is the label the node produced, or `None` when the node was
    /// skipped (none of its edges are live). Returns the successors that
    /// became schedulable, in edge order.
    pub fn resolve(&self, node: &str, emitted: Option<EdgeLabel>) -> Vec<(String, Schedule)> {
        let mut ready = Vec::new();
        for edge in self.graph.outgoing_edges(node) {
            let live = emitted == Some(edge.label);
            if let Some(schedule) = self.resolve_edge(&edge.target, live) {
                debug!(
                    from = %node,
                    node_id = %edge.target,
                    ?schedule,
                    "Join satisfied"
                );
                ready.push((edge.target.clone(), schedule));
            }
        }
        ready
    }

    fn resolve_edge(&self, target: &str, live: bool) -> Option<Schedule> {
        let slot = self.slots.get(target)?;
        if live {
            slot.activated.store(true, Ordering::SeqCst);
        }
        match slot
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(1) => Some(if slot.activated.load(Ordering::SeqCst) {
                Schedule::Execute
            } else {
                Schedule::Skip
            }),
            Ok(_) => None,
            Err(_) => {
                warn!(node_id = %target, "Incoming edge resolved after join was already satisfied");
                None
            }
        }
    }
}
