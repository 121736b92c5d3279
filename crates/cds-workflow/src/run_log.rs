use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use cds_core::event::EventBus;
use cds_core::types::{ExecutionId, WorkflowEvent};

/// JSONL execution logger.
///
/// Listens on the EventBus and writes one JSON object per line for a single
/// execution. Lines are flushed as they are written, so a log cut short by a
/// crash is still readable up to the last event.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    execution_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// Logs go to `{log_dir}/{execution_id}/{timestamp}.jsonl`.
    /// `level`: 1=workflow lifecycle and failures, 2=+node results, 3=+dispatches.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Subscribe now and write in a background task.
    ///
    /// Subscribing before the task is spawned means no event published after
    /// this call returns can be missed.
    pub fn spawn(
        self,
        event_bus: &Arc<EventBus>,
        execution_id: ExecutionId,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, execution_id, cancel))
    }

    /// Write entries until `WorkflowCompleted` for this execution, or cancellation.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<WorkflowEvent>,
        execution_id: ExecutionId,
        cancel: CancellationToken,
    ) {
        let dir = self.log_dir.join(execution_id.as_str());
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");

        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if event.execution_id() != &execution_id {
                                continue;
                            }
                            if let Some(entry) = self.event_to_entry(&event) {
                                if let Ok(json) = serde_json::to_string(&entry) {
                                    let line = format!("{}\n", json);
                                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                                        error!(error = %e, "Failed to write log entry");
                                        break;
                                    }
                                    if let Err(e) = writer.flush().await {
                                        error!(error = %e, "Failed to flush log");
                                    }
                                }
                            }
                            if matches!(event, WorkflowEvent::WorkflowCompleted { .. }) {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// `None` when the event is below the configured level.
    fn event_to_entry(&self, event: &WorkflowEvent) -> Option<LogEntry> {
        let (node, detail) = match event {
            WorkflowEvent::WorkflowStarted { graph, restart, .. } => (
                None,
                Some(serde_json::json!({ "graph": graph, "restart": restart })),
            ),
            WorkflowEvent::WorkflowCompleted { succeeded, .. } => {
                (None, Some(serde_json::json!({ "succeeded": succeeded })))
            }
            WorkflowEvent::NodeFailed { node, error, .. } => (
                Some(node.clone()),
                Some(serde_json::json!({ "error": error })),
            ),
            WorkflowEvent::NodeResolved { node, status, .. } if self.level >= 2 => (
                Some(node.clone()),
                Some(serde_json::json!({ "status": status })),
            ),
            WorkflowEvent::NodeDispatched { node, mode, .. } if self.level >= 3 => (
                Some(node.clone()),
                Some(serde_json::json!({ "mode": mode })),
            ),
            _ => return None,
        };

        Some(LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            execution_id: event.execution_id().to_string(),
            event_type: event.kind().to_string(),
            node,
            detail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> ExecutionId {
        ExecutionId::new("exec-1")
    }

    #[test]
    fn test_entry_omits_empty_fields() {
        let logger = RunLogger::new(PathBuf::from("/tmp"), 1);
        let entry = logger
            .event_to_entry(&WorkflowEvent::WorkflowCompleted {
                execution_id: id(),
                succeeded: true,
            })
            .unwrap();

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("workflow_completed"));
        assert!(json.contains("exec-1"));
        assert!(!json.contains("\"node\""));
    }

    #[test]
    fn test_event_level_filtering() {
        let resolved = WorkflowEvent::NodeResolved {
            execution_id: id(),
            node: "A".into(),
            status: "executed(SUCCESS)".into(),
        };
        let dispatched = WorkflowEvent::NodeDispatched {
            execution_id: id(),
            node: "A".into(),
            mode: "execute".into(),
        };
        let failed = WorkflowEvent::NodeFailed {
            execution_id: id(),
            node: "A".into(),
            error: "boom".into(),
        };

        let l1 = RunLogger::new(PathBuf::from("/tmp"), 1);
        assert!(l1.event_to_entry(&failed).is_some());
        assert!(l1.event_to_entry(&resolved).is_none());

        let l2 = RunLogger::new(PathBuf::from("/tmp"), 2);
        assert_eq!(l2.event_to_entry(&resolved).unwrap().node.as_deref(), Some("A"));
        assert!(l2.event_to_entry(&dispatched).is_none());

        let l3 = RunLogger::new(PathBuf::from("/tmp"), 3);
        assert!(l3.event_to_entry(&dispatched).is_some());
    }

    #[tokio::test]
    async fn test_writes_only_own_execution() {
        let dir = std::env::temp_dir().join(format!("cds_runlog_test_{}", uuid::Uuid::new_v4()));
        let bus = Arc::new(EventBus::new(16));
        let handle = RunLogger::new(dir.clone(), 3).spawn(&bus, id(), CancellationToken::new());

        bus.publish(WorkflowEvent::WorkflowStarted {
            execution_id: id(),
            graph: "[]".into(),
            restart: false,
        });
        bus.publish(WorkflowEvent::NodeFailed {
            execution_id: ExecutionId::new("other"),
            node: "X".into(),
            error: "not ours".into(),
        });
        bus.publish(WorkflowEvent::WorkflowCompleted {
            execution_id: id(),
            succeeded: true,
        });
        handle.await.unwrap();

        let mut entries = std::fs::read_dir(dir.join("exec-1")).unwrap();
        let path = entries.next().unwrap().unwrap().path();
        let text = std::fs::read_to_string(path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("workflow_started"));
        assert!(lines[1].contains("workflow_completed"));
    }
}
