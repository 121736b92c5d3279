//! Directed-graph workflow engine: graph model, join tracking, and the executor.

pub mod checkpoint;
pub mod dry_run;
pub mod error;
pub mod executor;
pub mod graph;
pub mod join;
pub mod message;
pub mod result;
pub mod run_log;

pub use checkpoint::{Checkpointer, StatusSnapshot, StatusStore};
pub use dry_run::{DryRunContext, DryRunHooks, DryRunReport, HookCall, HookKind};
pub use error::{GraphParseError, WorkflowError};
pub use executor::{ExecutionOptions, WorkflowExecutor, WorkflowHooks};
pub use graph::{Edge, EdgeLabel, Graph, StepDefinition, WorkflowDefinition, END, START};
pub use join::{JoinTracker, Schedule};
pub use message::{DispatchMode, ExecutionMessage, NodeStatus, SkipMessage, StatusTable};
pub use result::{result_channel, ResultFuture, ResultHandle};
pub use run_log::RunLogger;
