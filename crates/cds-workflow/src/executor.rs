use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use cds_core::error::{CdsError, Result};
use cds_core::event::EventBus;
use cds_core::types::{ExecutionId, WorkflowEvent};

use crate::error::WorkflowError;
use crate::graph::{EdgeLabel, Graph, END, START};
use crate::join::{JoinTracker, Schedule};
use crate::message::{DispatchMode, ExecutionMessage, NodeStatus, SkipMessage, StatusTable};
use crate::result::ResultHandle;

/// Node behavior supplied by the caller.
///
/// The executor owns the walk over the graph; an implementation of this trait
/// owns what each step means. `Context` is the caller's runtime value for one
/// execution: it is passed to every hook and never inspected by the engine.
pub trait WorkflowHooks: Send + Sync + 'static {
    type Context: Send + Sync + 'static;
    /// Workflow input.
    type Input: Send + Sync + 'static;
    /// Workflow output delivered through the result handle.
    type Output: Send + 'static;
    type NodeInput: Send + Sync + 'static;
    type NodeOutput: Send + Sync + 'static;

    /// Called once per execution; the label selects the edges leaving `START`.
    fn initialize_workflow<'a>(
        &'a self,
        ctx: &'a Self::Context,
        input: &'a Self::Input,
    ) -> BoxFuture<'a, Result<EdgeLabel>>;

    /// Build the message for a node about to run (execute, cancel, or restart).
    fn prepare_node_execution_message<'a>(
        &'a self,
        ctx: &'a Self::Context,
        node: &'a str,
    ) -> BoxFuture<'a, Result<ExecutionMessage<Self::NodeInput, Self::NodeOutput>>>;

    /// Perform the node's work and report its outcome.
    fn execute_node<'a>(
        &'a self,
        ctx: &'a Self::Context,
        message: &'a mut ExecutionMessage<Self::NodeInput, Self::NodeOutput>,
    ) -> BoxFuture<'a, Result<EdgeLabel>>;

    /// Build the message for a node on a branch that was not taken.
    fn prepare_node_skip_message<'a>(
        &'a self,
        ctx: &'a Self::Context,
        node: &'a str,
    ) -> BoxFuture<'a, Result<SkipMessage<Self::NodeInput, Self::NodeOutput>>>;

    /// Record a no-op outcome for a pruned node.
    fn skip_node<'a>(
        &'a self,
        ctx: &'a Self::Context,
        message: &'a mut SkipMessage<Self::NodeInput, Self::NodeOutput>,
    ) -> BoxFuture<'a, Result<EdgeLabel>>;

    /// Used instead of `execute_node` once cancellation has been requested.
    fn cancel_node<'a>(
        &'a self,
        ctx: &'a Self::Context,
        message: &'a mut ExecutionMessage<Self::NodeInput, Self::NodeOutput>,
    ) -> BoxFuture<'a, Result<EdgeLabel>>;

    /// Used instead of `execute_node` for the first nodes run after resuming
    /// from a persisted status table.
    fn restart_node<'a>(
        &'a self,
        ctx: &'a Self::Context,
        message: &'a mut ExecutionMessage<Self::NodeInput, Self::NodeOutput>,
    ) -> BoxFuture<'a, Result<EdgeLabel>>;

    /// Turn the terminal state into the workflow output. Called exactly once.
    fn prepare_workflow_output<'a>(
        &'a self,
        ctx: &'a Self::Context,
        error: Option<WorkflowError>,
    ) -> BoxFuture<'a, Self::Output>;
}

/// Per-call knobs for [`WorkflowExecutor::execute_workflow_with`].
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Generated (uuid v4) when not set.
    pub execution_id: Option<String>,
    /// Once cancelled, live nodes not yet dispatched go to `cancel_node`.
    pub cancel: CancellationToken,
    /// Status table of an earlier, interrupted execution of the same graph.
    pub previous: Option<StatusTable>,
    /// Upper bound on node hooks running at once (0 = unlimited).
    pub max_parallel_nodes: usize,
}

impl ExecutionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_execution_id(mut self, id: impl Into<String>) -> Self {
        self.execution_id = Some(id.into());
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn resume_from(mut self, previous: StatusTable) -> Self {
        self.previous = Some(previous);
        self
    }

    pub fn with_max_parallel_nodes(mut self, limit: usize) -> Self {
        self.max_parallel_nodes = limit;
        self
    }
}

/// Walks a [`Graph`] and drives a [`WorkflowHooks`] implementation over it.
///
/// The executor holds no per-execution state: each call builds its own status
/// table and join counters, so one executor can run many workflows at once.
pub struct WorkflowExecutor<H: WorkflowHooks> {
    hooks: Arc<H>,
    event_bus: Option<Arc<EventBus>>,
}

impl<H: WorkflowHooks> Clone for WorkflowExecutor<H> {
    fn clone(&self) -> Self {
        Self {
            hooks: self.hooks.clone(),
            event_bus: self.event_bus.clone(),
        }
    }
}

impl<H: WorkflowHooks> WorkflowExecutor<H> {
    pub fn new(hooks: H) -> Self {
        Self::from_arc(Arc::new(hooks))
    }

    pub fn from_arc(hooks: Arc<H>) -> Self {
        Self {
            hooks,
            event_bus: None,
        }
    }

    /// Publish lifecycle events on `bus`.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn hooks(&self) -> &Arc<H> {
        &self.hooks
    }

    /// Execute `graph` with default options.
    ///
    /// `result` is completed exactly once, before this returns, with the value
    /// of `prepare_workflow_output`. The returned table is the final status of
    /// every node.
    pub async fn execute_workflow(
        &self,
        graph: Arc<Graph>,
        context: Arc<H::Context>,
        input: H::Input,
        result: ResultHandle<H::Output>,
    ) -> StatusTable {
        self.execute_workflow_with(graph, context, input, result, ExecutionOptions::default())
            .await
    }

    /// Resume an interrupted execution from its persisted status table.
    pub async fn restart_workflow(
        &self,
        graph: Arc<Graph>,
        context: Arc<H::Context>,
        input: H::Input,
        previous: StatusTable,
        result: ResultHandle<H::Output>,
    ) -> StatusTable {
        let options = ExecutionOptions::default().resume_from(previous);
        self.execute_workflow_with(graph, context, input, result, options)
            .await
    }

    pub async fn execute_workflow_with(
        &self,
        graph: Arc<Graph>,
        context: Arc<H::Context>,
        input: H::Input,
        result: ResultHandle<H::Output>,
        options: ExecutionOptions,
    ) -> StatusTable {
        let execution_id = ExecutionId::new(
            options
                .execution_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        );
        let span = info_span!("workflow_execute", execution_id = %execution_id);

        async move {
            info!(graph = %graph, restart = options.previous.is_some(), "Workflow started");
            self.publish(WorkflowEvent::WorkflowStarted {
                execution_id: execution_id.clone(),
                graph: graph.to_string(),
                restart: options.previous.is_some(),
            });

            let mut activation = Activation::new(self, graph, context.clone(), execution_id.clone(), options);
            let failure = activation.run(&input).await;
            let succeeded = failure.is_none();

            match &failure {
                None => info!("Workflow reached END"),
                Some(e) => error!(error = %e, "Workflow finished with error"),
            }

            // Hooks may panic while building their future, so call them inside the guard.
            let output = AssertUnwindSafe(async { self.hooks.prepare_workflow_output(&context, failure).await })
                .catch_unwind()
                .await;
            let delivered = match output {
                Ok(output) => {
                    if !result.complete(output) {
                        warn!("Workflow result receiver dropped before completion");
                    }
                    true
                }
                Err(_) => {
                    // No output value exists; the receiver observes ResultAbandoned.
                    error!("prepare_workflow_output panicked; result abandoned");
                    drop(result);
                    false
                }
            };
            self.publish(WorkflowEvent::WorkflowCompleted {
                execution_id,
                succeeded: succeeded && delivered,
            });

            activation.statuses
        }
        .instrument(span)
        .await
    }

    fn publish(&self, event: WorkflowEvent) {
        if let Some(ref bus) = self.event_bus {
            bus.publish(event);
        }
    }
}

type Completion = (String, DispatchMode, Result<EdgeLabel>);

/// A node whose join was satisfied and that waits to be dispatched.
struct Ready {
    node: String,
    schedule: Schedule,
    /// Became ready while replaying a previous status table.
    replayed: bool,
}

/// State of one execution call; dropped when the call returns.
struct Activation<'e, H: WorkflowHooks> {
    executor: &'e WorkflowExecutor<H>,
    graph: Arc<Graph>,
    context: Arc<H::Context>,
    execution_id: ExecutionId,
    tracker: JoinTracker,
    statuses: StatusTable,
    previous: Option<StatusTable>,
    cancel: CancellationToken,
    limiter: Option<Arc<Semaphore>>,
    ready: VecDeque<Ready>,
    errors: Vec<WorkflowError>,
    end_resolved: bool,
}

impl<'e, H: WorkflowHooks> Activation<'e, H> {
    fn new(
        executor: &'e WorkflowExecutor<H>,
        graph: Arc<Graph>,
        context: Arc<H::Context>,
        execution_id: ExecutionId,
        options: ExecutionOptions,
    ) -> Self {
        let limiter =
            (options.max_parallel_nodes > 0).then(|| Arc::new(Semaphore::new(options.max_parallel_nodes)));
        Self {
            executor,
            tracker: JoinTracker::new(graph.clone()),
            statuses: StatusTable::for_graph(&graph),
            graph,
            context,
            execution_id,
            previous: options.previous,
            cancel: options.cancel,
            limiter,
            ready: VecDeque::new(),
            errors: Vec::new(),
            end_resolved: false,
        }
    }

    /// Walk the graph until nothing is left to dispatch.
    /// Returns the error to report, if any.
    async fn run(&mut self, input: &H::Input) -> Option<WorkflowError> {
        let hooks = &self.executor.hooks;
        let init = AssertUnwindSafe(async { hooks.initialize_workflow(&self.context, input).await })
            .catch_unwind()
            .await;
        let label = match init {
            Ok(Ok(label)) => label,
            Ok(Err(e)) => {
                error!(error = %e, "Workflow initialization failed");
                return Some(WorkflowError::Initialize(e));
            }
            Err(_) => {
                error!("initialize_workflow panicked");
                return Some(WorkflowError::Initialize(CdsError::HookPanicked {
                    node: START.to_string(),
                }));
            }
        };

        if self.graph.contains_node(START) {
            self.record(START, NodeStatus::Executed(label));
        } else {
            warn!("Graph has no {} node; nothing to schedule", START);
        }
        let resuming = self.previous.is_some();
        self.enqueue(START, Some(label), resuming);

        let mut in_flight: FuturesUnordered<BoxFuture<'static, Completion>> = FuturesUnordered::new();
        loop {
            while let Some(ready) = self.ready.pop_front() {
                if let Some(task) = self.schedule(ready) {
                    in_flight.push(task);
                }
            }
            match in_flight.next().await {
                Some((node, mode, outcome)) => self.complete(node, mode, outcome),
                None => break,
            }
        }

        self.finish()
    }

    /// Resolve the outgoing edges of `node` and queue whatever became ready.
    fn enqueue(&mut self, node: &str, emitted: Option<EdgeLabel>, replayed: bool) {
        for (next, schedule) in self.tracker.resolve(node, emitted) {
            self.ready.push_back(Ready {
                node: next,
                schedule,
                replayed,
            });
        }
    }

    fn schedule(&mut self, ready: Ready) -> Option<BoxFuture<'static, Completion>> {
        let Ready {
            node,
            schedule,
            replayed,
        } = ready;

        if node == END {
            let status = match schedule {
                Schedule::Execute => NodeStatus::Executed(EdgeLabel::Success),
                Schedule::Skip => NodeStatus::Skipped(EdgeLabel::Success),
            };
            info!(status = %status, "END resolved");
            self.record(&node, status);
            self.end_resolved = true;
            return None;
        }

        if let Some(previous) = self.replayable(&node, schedule) {
            debug!(node_id = %node, status = %previous, "Replaying persisted status");
            self.record(&node, previous);
            let emitted = match previous {
                NodeStatus::Skipped(_) => None,
                other => other.label(),
            };
            self.enqueue(&node, emitted, true);
            return None;
        }

        let mode = match schedule {
            Schedule::Skip => DispatchMode::Skip,
            Schedule::Execute if self.cancel.is_cancelled() => DispatchMode::Cancel,
            Schedule::Execute if replayed => DispatchMode::Restart,
            Schedule::Execute => DispatchMode::Execute,
        };

        debug!(node_id = %node, mode = %mode, "Dispatching node");
        self.statuses.set(node.clone(), NodeStatus::Running);
        self.executor.publish(WorkflowEvent::NodeDispatched {
            execution_id: self.execution_id.clone(),
            node: node.clone(),
            mode: mode.to_string(),
        });

        let task = dispatch(
            self.executor.hooks.clone(),
            self.context.clone(),
            node.clone(),
            mode,
            self.limiter.clone(),
        )
        .instrument(info_span!("node", node_id = %node, mode = %mode));
        let handle = tokio::spawn(task);

        Some(Box::pin(async move {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => Err(CdsError::HookPanicked { node: node.clone() }),
                Err(e) => Err(CdsError::node(node.clone(), e.to_string())),
            };
            (node, mode, outcome)
        }))
    }

    fn complete(&mut self, node: String, mode: DispatchMode, outcome: Result<EdgeLabel>) {
        match outcome {
            Ok(label) => {
                let status = mode.resolved_status(label);
                info!(node_id = %node, status = %status, "Node resolved");
                self.record(&node, status);

                let emitted = mode.activates_successors().then_some(label);
                if emitted.is_some()
                    && self.graph.out_degree(&node) > 0
                    && self.graph.outgoing_edges_with_label(&node, label).next().is_none()
                {
                    warn!(node_id = %node, label = %label, "No outgoing edge for label; successors are pruned");
                }
                self.enqueue(&node, emitted, false);
            }
            Err(e) => {
                error!(node_id = %node, mode = %mode, error = %e, "Node failed; branch terminated");
                self.statuses.set(node.clone(), NodeStatus::Failed);
                self.executor.publish(WorkflowEvent::NodeFailed {
                    execution_id: self.execution_id.clone(),
                    node: node.clone(),
                    error: e.to_string(),
                });
                self.errors.push(WorkflowError::Node { node, source: e });
            }
        }
    }

    fn record(&mut self, node: &str, status: NodeStatus) {
        self.statuses.set(node, status);
        self.executor.publish(WorkflowEvent::NodeResolved {
            execution_id: self.execution_id.clone(),
            node: node.to_string(),
            status: status.to_string(),
        });
    }

    /// Status carried over from the previous execution, when it agrees with
    /// how the node is scheduled now. Cancelled nodes are run again, and so is
    /// anything a re-run node routed differently.
    fn replayable(&self, node: &str, schedule: Schedule) -> Option<NodeStatus> {
        self.previous
            .as_ref()
            .map(|p| p.get(node))
            .filter(|s| {
                matches!(
                    (s, schedule),
                    (NodeStatus::Executed(_), Schedule::Execute) | (NodeStatus::Skipped(_), Schedule::Skip)
                )
            })
    }

    fn finish(&mut self) -> Option<WorkflowError> {
        if !self.errors.is_empty() {
            let mut errors = std::mem::take(&mut self.errors).into_iter();
            let first = errors.next();
            for other in errors {
                warn!(error = %other, "Additional node failure");
            }
            return first;
        }
        if !self.end_resolved {
            let pending = self
                .statuses
                .unresolved()
                .into_iter()
                .map(str::to_string)
                .collect();
            return Some(WorkflowError::EndNotReached { pending });
        }
        None
    }
}

/// Run one node through the hook that matches `mode`.
async fn dispatch<H: WorkflowHooks>(
    hooks: Arc<H>,
    ctx: Arc<H::Context>,
    node: String,
    mode: DispatchMode,
    limiter: Option<Arc<Semaphore>>,
) -> Result<EdgeLabel> {
    let _permit = match limiter {
        Some(sem) => Some(
            sem.acquire_owned()
                .await
                .map_err(|e| CdsError::node(node.as_str(), e.to_string()))?,
        ),
        None => None,
    };

    match mode {
        DispatchMode::Execute => {
            let mut message = hooks.prepare_node_execution_message(&ctx, &node).await?;
            hooks.execute_node(&ctx, &mut message).await
        }
        DispatchMode::Skip => {
            let mut message = hooks.prepare_node_skip_message(&ctx, &node).await?;
            hooks.skip_node(&ctx, &mut message).await
        }
        DispatchMode::Cancel => {
            let mut message = hooks.prepare_node_execution_message(&ctx, &node).await?;
            hooks.cancel_node(&ctx, &mut message).await
        }
        DispatchMode::Restart => {
            let mut message = hooks.prepare_node_execution_message(&ctx, &node).await?;
            hooks.restart_node(&ctx, &mut message).await
        }
    }
}
