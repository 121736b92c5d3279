use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::debug;

use cds_core::error::{CdsError, Result};

use crate::error::WorkflowError;
use crate::executor::WorkflowHooks;
use crate::graph::EdgeLabel;
use crate::message::{ExecutionMessage, SkipMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    Initialize,
    PrepareExecution,
    Execute,
    PrepareSkip,
    Skip,
    Cancel,
    Restart,
    PrepareOutput,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookCall {
    pub hook: HookKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

/// Per-execution context: identity, input, and the call journal.
#[derive(Debug)]
pub struct DryRunContext {
    pub workflow_id: String,
    pub input: serde_json::Value,
    calls: Mutex<Vec<HookCall>>,
}

impl DryRunContext {
    pub fn new(workflow_id: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            input,
            calls: Mutex::new(Vec::new()),
        }
    }

    // A hook that panicked mid-record poisons the lock; the journal itself stays usable.
    fn journal(&self) -> MutexGuard<'_, Vec<HookCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, hook: HookKind, node: Option<&str>) {
        self.journal().push(HookCall {
            hook,
            node: node.map(str::to_string),
        });
    }

    /// Snapshot of the journal in call order.
    pub fn calls(&self) -> Vec<HookCall> {
        self.journal().clone()
    }

    /// Nodes passed to `hook`, in call order.
    pub fn nodes_for(&self, hook: HookKind) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.hook == hook)
            .filter_map(|c| c.node)
            .collect()
    }

    /// Position of the first call of `hook` for `node`.
    pub fn position(&self, hook: HookKind, node: &str) -> Option<usize> {
        self.calls()
            .iter()
            .position(|c| c.hook == hook && c.node.as_deref() == Some(node))
    }
}

/// Workflow output of a dry run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DryRunReport {
    pub workflow_id: String,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub calls: Vec<HookCall>,
}

/// Hook set that walks a workflow without doing any real work.
///
/// Each node returns a scripted outcome and every hook call is journaled in
/// the [`DryRunContext`]. Used by `cds run`.
#[derive(Debug, Clone)]
pub struct DryRunHooks {
    outcomes: HashMap<String, EdgeLabel>,
    default_outcome: Option<EdgeLabel>,
    failing: HashSet<String>,
    delays: HashMap<String, Duration>,
    start_label: EdgeLabel,
    cancel_label: EdgeLabel,
    init_error: Option<String>,
}

impl Default for DryRunHooks {
    fn default() -> Self {
        Self {
            outcomes: HashMap::new(),
            default_outcome: None,
            failing: HashSet::new(),
            delays: HashMap::new(),
            start_label: EdgeLabel::Success,
            cancel_label: EdgeLabel::Failure,
            init_error: None,
        }
    }
}

impl DryRunHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outcome(mut self, node: impl Into<String>, label: EdgeLabel) -> Self {
        self.outcomes.insert(node.into(), label);
        self
    }

    /// Outcome of nodes with no entry of their own.
    pub fn with_default_outcome(mut self, label: EdgeLabel) -> Self {
        self.default_outcome = Some(label);
        self
    }

    /// `node` raises a node error instead of returning a label.
    pub fn with_failing(mut self, node: impl Into<String>) -> Self {
        self.failing.insert(node.into());
        self
    }

    /// `node` sleeps before returning its outcome.
    pub fn with_delay(mut self, node: impl Into<String>, delay: Duration) -> Self {
        self.delays.insert(node.into(), delay);
        self
    }

    /// Label returned by `initialize_workflow`.
    pub fn with_start_label(mut self, label: EdgeLabel) -> Self {
        self.start_label = label;
        self
    }

    /// Label returned by `cancel_node` (FAILURE unless set).
    pub fn with_cancel_label(mut self, label: EdgeLabel) -> Self {
        self.cancel_label = label;
        self
    }

    /// `initialize_workflow` fails with `message`.
    pub fn with_init_error(mut self, message: impl Into<String>) -> Self {
        self.init_error = Some(message.into());
        self
    }

    /// Scripted outcome for `node`.
    pub fn outcome(&self, node: &str) -> Result<EdgeLabel> {
        if self.failing.contains(node) {
            return Err(CdsError::node(node, "scripted failure"));
        }
        self.outcomes
            .get(node)
            .copied()
            .or(self.default_outcome)
            .ok_or_else(|| CdsError::OutcomeLookup {
                node: node.to_string(),
            })
    }

    async fn run_scripted(
        &self,
        message: &mut ExecutionMessage<serde_json::Value, serde_json::Value>,
    ) -> Result<EdgeLabel> {
        if let Some(delay) = self.delays.get(&message.node) {
            tokio::time::sleep(*delay).await;
        }
        let label = self.outcome(&message.node)?;
        message.output = serde_json::json!({ "label": label });
        debug!(node_id = %message.node, label = %label, "Scripted outcome");
        Ok(label)
    }
}

impl WorkflowHooks for DryRunHooks {
    type Context = DryRunContext;
    type Input = serde_json::Value;
    type Output = DryRunReport;
    type NodeInput = serde_json::Value;
    type NodeOutput = serde_json::Value;

    fn initialize_workflow<'a>(
        &'a self,
        ctx: &'a DryRunContext,
        _input: &'a serde_json::Value,
    ) -> BoxFuture<'a, Result<EdgeLabel>> {
        Box::pin(async move {
            ctx.record(HookKind::Initialize, None);
            match &self.init_error {
                Some(msg) => Err(CdsError::Initialization(msg.clone())),
                None => Ok(self.start_label),
            }
        })
    }

    fn prepare_node_execution_message<'a>(
        &'a self,
        ctx: &'a DryRunContext,
        node: &'a str,
    ) -> BoxFuture<'a, Result<ExecutionMessage<serde_json::Value, serde_json::Value>>> {
        Box::pin(async move {
            ctx.record(HookKind::PrepareExecution, Some(node));
            Ok(ExecutionMessage::new(node, ctx.input.clone(), serde_json::Value::Null))
        })
    }

    fn execute_node<'a>(
        &'a self,
        ctx: &'a DryRunContext,
        message: &'a mut ExecutionMessage<serde_json::Value, serde_json::Value>,
    ) -> BoxFuture<'a, Result<EdgeLabel>> {
        Box::pin(async move {
            ctx.record(HookKind::Execute, Some(message.node.as_str()));
            self.run_scripted(message).await
        })
    }

    fn prepare_node_skip_message<'a>(
        &'a self,
        ctx: &'a DryRunContext,
        node: &'a str,
    ) -> BoxFuture<'a, Result<SkipMessage<serde_json::Value, serde_json::Value>>> {
        Box::pin(async move {
            ctx.record(HookKind::PrepareSkip, Some(node));
            Ok(SkipMessage::new(node, ctx.input.clone(), serde_json::Value::Null))
        })
    }

    fn skip_node<'a>(
        &'a self,
        ctx: &'a DryRunContext,
        message: &'a mut SkipMessage<serde_json::Value, serde_json::Value>,
    ) -> BoxFuture<'a, Result<EdgeLabel>> {
        Box::pin(async move {
            ctx.record(HookKind::Skip, Some(message.node.as_str()));
            Ok(EdgeLabel::Success)
        })
    }

    fn cancel_node<'a>(
        &'a self,
        ctx: &'a DryRunContext,
        message: &'a mut ExecutionMessage<serde_json::Value, serde_json::Value>,
    ) -> BoxFuture<'a, Result<EdgeLabel>> {
        Box::pin(async move {
            ctx.record(HookKind::Cancel, Some(message.node.as_str()));
            message.output = serde_json::json!({ "cancelled": true });
            Ok(self.cancel_label)
        })
    }

    fn restart_node<'a>(
        &'a self,
        ctx: &'a DryRunContext,
        message: &'a mut ExecutionMessage<serde_json::Value, serde_json::Value>,
    ) -> BoxFuture<'a, Result<EdgeLabel>> {
        Box::pin(async move {
            ctx.record(HookKind::Restart, Some(message.node.as_str()));
            self.run_scripted(message).await
        })
    }

    fn prepare_workflow_output<'a>(
        &'a self,
        ctx: &'a DryRunContext,
        error: Option<WorkflowError>,
    ) -> BoxFuture<'a, DryRunReport> {
        Box::pin(async move {
            ctx.record(HookKind::PrepareOutput, None);
            DryRunReport {
                workflow_id: ctx.workflow_id.clone(),
                succeeded: error.is_none(),
                error: error.map(|e| e.to_string()),
                calls: ctx.calls(),
            }
        })
    }
}
