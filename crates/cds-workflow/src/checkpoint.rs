use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use cds_core::error::{CdsError, Result};
use cds_core::event::EventBus;
use cds_core::types::{ExecutionId, WorkflowEvent};

use crate::graph::Graph;
use crate::message::{NodeStatus, StatusTable};

/// Persisted state of one execution.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub execution_id: String,
    /// Graph in its textual form, so a resume can rebuild it.
    pub graph: String,
    pub statuses: StatusTable,
    /// Whether the execution reached a final result.
    pub completed: bool,
    pub updated_at: DateTime<Utc>,
}

impl StatusSnapshot {
    pub fn new(
        execution_id: impl Into<String>,
        graph: impl Into<String>,
        statuses: StatusTable,
        completed: bool,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            graph: graph.into(),
            statuses,
            completed,
            updated_at: Utc::now(),
        }
    }
}

/// Status tables of past executions, backed by SQLite.
///
/// One row per execution id; saving again replaces the row.
pub struct StatusStore {
    conn: Mutex<Connection>,
}

fn db_err(context: &str, e: impl std::fmt::Display) -> CdsError {
    CdsError::Database(format!("{}: {}", context, e))
}

impl StatusStore {
    /// Open or create the status database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn =
            Connection::open(path).map_err(|e| db_err("Failed to open status store", e))?;
        Self::init(conn)
    }

    /// Store that lives only as long as the process.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| db_err("Failed to open in-memory status store", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS executions (
                 execution_id TEXT PRIMARY KEY,
                 graph TEXT NOT NULL,
                 statuses_json TEXT NOT NULL,
                 completed INTEGER NOT NULL DEFAULT 0,
                 updated_at TEXT NOT NULL
             );",
        )
        .map_err(|e| db_err("Failed to initialize status schema", e))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn save(&self, snapshot: &StatusSnapshot) -> Result<()> {
        let statuses_json = serde_json::to_string(&snapshot.statuses)?;
        let conn = self.conn.lock().map_err(|e| db_err("Lock poisoned", e))?;
        conn.execute(
            "INSERT OR REPLACE INTO executions (execution_id, graph, statuses_json, completed, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                snapshot.execution_id,
                snapshot.graph,
                statuses_json,
                snapshot.completed as i64,
                snapshot.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| db_err("Failed to save status table", e))?;
        Ok(())
    }

    pub fn load(&self, execution_id: &str) -> Result<Option<StatusSnapshot>> {
        let conn = self.conn.lock().map_err(|e| db_err("Lock poisoned", e))?;
        let mut stmt = conn
            .prepare(
                "SELECT execution_id, graph, statuses_json, completed, updated_at
                 FROM executions
                 WHERE execution_id = ?1",
            )
            .map_err(|e| db_err("Failed to prepare query", e))?;

        let row = stmt
            .query_row(params![execution_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .ok();

        let Some((execution_id, graph, statuses_json, completed, ts)) = row else {
            return Ok(None);
        };
        Ok(Some(StatusSnapshot {
            execution_id,
            graph,
            statuses: serde_json::from_str(&statuses_json)?,
            completed: completed != 0,
            updated_at: DateTime::parse_from_rfc3339(&ts)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        }))
    }

    /// Ids of executions that never reached a final result, newest first.
    pub fn incomplete(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().map_err(|e| db_err("Lock poisoned", e))?;
        let mut stmt = conn
            .prepare(
                "SELECT execution_id FROM executions
                 WHERE completed = 0
                 ORDER BY updated_at DESC",
            )
            .map_err(|e| db_err("Failed to prepare query", e))?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| db_err("Failed to list executions", e))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    pub fn delete(&self, execution_id: &str) -> Result<usize> {
        let conn = self.conn.lock().map_err(|e| db_err("Lock poisoned", e))?;
        let deleted = conn
            .execute(
                "DELETE FROM executions WHERE execution_id = ?1",
                params![execution_id],
            )
            .map_err(|e| db_err("Failed to delete status table", e))?;
        Ok(deleted)
    }
}

/// Keeps the stored snapshot of one execution in step with its events.
///
/// The snapshot is rewritten after every dispatch, resolution and failure, so
/// a process killed mid-run leaves a table that a restart can pick up from.
pub struct Checkpointer {
    store: Arc<StatusStore>,
    graph: String,
    statuses: StatusTable,
}

impl Checkpointer {
    pub fn new(store: Arc<StatusStore>, graph: &Graph) -> Self {
        Self {
            store,
            graph: graph.to_string(),
            statuses: StatusTable::for_graph(graph),
        }
    }

    /// Seed with the table of the execution being resumed.
    pub fn resuming(mut self, previous: &StatusTable) -> Self {
        for (node, status) in previous.iter() {
            self.statuses.set(node, status);
        }
        self
    }

    /// Subscribe now and persist in a background task.
    pub fn spawn(
        self,
        event_bus: &Arc<EventBus>,
        execution_id: ExecutionId,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, execution_id, cancel))
    }

    /// Persist until `WorkflowCompleted` for this execution, or cancellation.
    pub async fn run(
        mut self,
        mut rx: broadcast::Receiver<WorkflowEvent>,
        execution_id: ExecutionId,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Checkpointer cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if event.execution_id() != &execution_id {
                                continue;
                            }
                            let completed = self.apply(&event);
                            let snapshot = StatusSnapshot::new(
                                execution_id.as_str(),
                                self.graph.clone(),
                                self.statuses.clone(),
                                completed.unwrap_or(false),
                            );
                            if let Err(e) = self.store.save(&snapshot) {
                                error!(error = %e, "Failed to save checkpoint");
                            }
                            if completed.is_some() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "Checkpointer lagged; snapshot may trail the execution");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, Checkpointer stopping");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Fold one event into the table. `Some(completed)` once the execution ended.
    fn apply(&mut self, event: &WorkflowEvent) -> Option<bool> {
        match event {
            WorkflowEvent::WorkflowStarted { .. } => {}
            WorkflowEvent::NodeDispatched { node, .. } => {
                self.statuses.set(node.as_str(), NodeStatus::Running);
            }
            WorkflowEvent::NodeResolved { node, status, .. } => match status.parse() {
                Ok(status) => self.statuses.set(node.as_str(), status),
                Err(e) => warn!(node_id = %node, error = %e, "Unrecognized node status"),
            },
            WorkflowEvent::NodeFailed { node, .. } => {
                self.statuses.set(node.as_str(), NodeStatus::Failed);
            }
            WorkflowEvent::WorkflowCompleted { succeeded, .. } => {
                // Cancelled nodes still owe a real run.
                let cancelled = self
                    .statuses
                    .iter()
                    .any(|(_, s)| matches!(s, NodeStatus::Cancelled(_)));
                return Some(*succeeded && !cancelled);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::EdgeLabel;

    fn temp_store() -> StatusStore {
        let dir = std::env::temp_dir().join(format!("cds_status_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        StatusStore::open(&dir.join("checkpoints.db")).unwrap()
    }

    fn table() -> StatusTable {
        let mut t = StatusTable::new();
        t.set("START", NodeStatus::Executed(EdgeLabel::Success));
        t.set("A", NodeStatus::Executed(EdgeLabel::Failure));
        t.set("B", NodeStatus::Pending);
        t
    }

    #[test]
    fn test_save_and_load() {
        let store = temp_store();
        let snap = StatusSnapshot::new("exec-1", "[START>A/SUCCESS]", table(), false);
        store.save(&snap).unwrap();

        let loaded = store.load("exec-1").unwrap().unwrap();
        assert_eq!(loaded.execution_id, "exec-1");
        assert_eq!(loaded.graph, "[START>A/SUCCESS]");
        assert_eq!(loaded.statuses, table());
        assert!(!loaded.completed);
    }

    #[test]
    fn test_save_replaces_same_execution() {
        let store = StatusStore::in_memory().unwrap();
        store
            .save(&StatusSnapshot::new("exec-1", "[]", StatusTable::new(), false))
            .unwrap();
        store
            .save(&StatusSnapshot::new("exec-1", "[]", table(), true))
            .unwrap();

        let loaded = store.load("exec-1").unwrap().unwrap();
        assert!(loaded.completed);
        assert_eq!(loaded.statuses.len(), 3);
        assert!(store.incomplete().unwrap().is_empty());
    }

    #[test]
    fn test_incomplete_and_delete() {
        let store = temp_store();
        store
            .save(&StatusSnapshot::new("open", "[]", table(), false))
            .unwrap();
        store
            .save(&StatusSnapshot::new("done", "[]", table(), true))
            .unwrap();

        assert_eq!(store.incomplete().unwrap(), vec!["open".to_string()]);
        assert_eq!(store.delete("open").unwrap(), 1);
        assert!(store.load("open").unwrap().is_none());
    }

    #[test]
    fn test_load_nonexistent() {
        let store = temp_store();
        assert!(store.load("nonexistent").unwrap().is_none());
    }

    fn event_id() -> ExecutionId {
        ExecutionId::new("exec-cp")
    }

    #[tokio::test]
    async fn test_checkpointer_persists_as_events_arrive() {
        let store = Arc::new(StatusStore::in_memory().unwrap());
        let graph: Graph = "[START>A/SUCCESS, A>END/SUCCESS]".parse().unwrap();
        let mut checkpointer = Checkpointer::new(store.clone(), &graph);

        checkpointer.apply(&WorkflowEvent::NodeDispatched {
            execution_id: event_id(),
            node: "A".into(),
            mode: "execute".into(),
        });
        assert_eq!(checkpointer.statuses.get("A"), NodeStatus::Running);

        let bus = Arc::new(EventBus::new(16));
        let handle = checkpointer.spawn(&bus, event_id(), CancellationToken::new());
        bus.publish(WorkflowEvent::NodeResolved {
            execution_id: event_id(),
            node: "A".into(),
            status: "executed(FAILURE)".into(),
        });
        bus.publish(WorkflowEvent::NodeFailed {
            execution_id: ExecutionId::new("other"),
            node: "A".into(),
            error: "not ours".into(),
        });
        bus.publish(WorkflowEvent::WorkflowCompleted {
            execution_id: event_id(),
            succeeded: true,
        });
        handle.await.unwrap();

        let snapshot = store.load("exec-cp").unwrap().unwrap();
        assert!(snapshot.completed);
        assert_eq!(snapshot.graph, graph.to_string());
        assert_eq!(snapshot.statuses.get("A"), NodeStatus::Executed(EdgeLabel::Failure));
        assert_eq!(snapshot.statuses.get("END"), NodeStatus::Pending);
    }

    #[test]
    fn test_cancelled_run_is_not_completed() {
        let store = Arc::new(StatusStore::in_memory().unwrap());
        let graph: Graph = "[START>A/SUCCESS, A>END/SUCCESS]".parse().unwrap();
        let mut checkpointer = Checkpointer::new(store, &graph).resuming(&table());
        assert_eq!(checkpointer.statuses.get("B"), NodeStatus::Pending);

        checkpointer.apply(&WorkflowEvent::NodeResolved {
            execution_id: event_id(),
            node: "A".into(),
            status: "cancelled(FAILURE)".into(),
        });
        let completed = checkpointer.apply(&WorkflowEvent::WorkflowCompleted {
            execution_id: event_id(),
            succeeded: true,
        });
        assert_eq!(completed, Some(false));
    }
}
