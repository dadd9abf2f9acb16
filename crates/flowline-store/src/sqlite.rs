use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, Connection as SqlConnection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use flowline_core::error::{FlowError, Result};
use flowline_core::traits::{
    NodeInstanceRepository, NodeRepository, TaskInstanceRepository, WorkflowInstanceRepository,
};
use flowline_core::types::*;

const SCHEMA: &str = "PRAGMA journal_mode=WAL;
     PRAGMA synchronous=NORMAL;

     CREATE TABLE IF NOT EXISTS workflow_nodes (
         workflow_id TEXT NOT NULL,
         id TEXT NOT NULL,
         position INTEGER NOT NULL,
         data TEXT NOT NULL,
         PRIMARY KEY (workflow_id, id)
     );

     CREATE TABLE IF NOT EXISTS workflow_connections (
         workflow_id TEXT NOT NULL,
         position INTEGER NOT NULL,
         data TEXT NOT NULL
     );

     CREATE TABLE IF NOT EXISTS workflow_instances (
         id TEXT PRIMARY KEY,
         workflow_id TEXT NOT NULL,
         status TEXT NOT NULL,
         data TEXT NOT NULL,
         updated_at TEXT NOT NULL
     );

     CREATE TABLE IF NOT EXISTS node_instances (
         id TEXT PRIMARY KEY,
         workflow_instance_id TEXT NOT NULL,
         status TEXT NOT NULL,
         seq INTEGER NOT NULL,
         data TEXT NOT NULL
     );
     CREATE INDEX IF NOT EXISTS idx_node_instances_wfi
         ON node_instances(workflow_instance_id, seq);

     CREATE TABLE IF NOT EXISTS task_instances (
         id TEXT PRIMARY KEY,
         node_instance_id TEXT NOT NULL,
         workflow_instance_id TEXT NOT NULL,
         status TEXT NOT NULL,
         seq INTEGER NOT NULL,
         data TEXT NOT NULL
     );
     CREATE INDEX IF NOT EXISTS idx_task_instances_node
         ON task_instances(node_instance_id, seq);

     CREATE TABLE IF NOT EXISTS context_snapshots (
         workflow_instance_id TEXT PRIMARY KEY,
         snapshot TEXT NOT NULL,
         saved_at TEXT NOT NULL
     );";

/// Every repository backed by one SQLite database.
///
/// Rows are stored as JSON documents next to the columns queries filter on.
pub struct SqliteStore {
    conn: Mutex<SqlConnection>,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = SqlConnection::open(path).map_err(db)?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(SqlConnection::open_in_memory().map_err(db)?)
    }

    fn init(conn: SqlConnection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(db)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, SqlConnection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Load a workflow definition, replacing any earlier version of it.
    pub fn seed_workflow(&self, definition: &WorkflowDefinition) -> Result<()> {
        definition.check()?;
        let definition = definition.clone().normalized();
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(db)?;
        let wf = definition.id.as_str();
        tx.execute("DELETE FROM workflow_nodes WHERE workflow_id = ?1", params![wf])
            .map_err(db)?;
        tx.execute(
            "DELETE FROM workflow_connections WHERE workflow_id = ?1",
            params![wf],
        )
        .map_err(db)?;
        for (position, node) in definition.nodes.iter().enumerate() {
            tx.execute(
                "INSERT INTO workflow_nodes (workflow_id, id, position, data) VALUES (?1, ?2, ?3, ?4)",
                params![wf, node.id.as_str(), position as i64, to_json(node)?],
            )
            .map_err(db)?;
        }
        for (position, connection) in definition.connections.iter().enumerate() {
            tx.execute(
                "INSERT INTO workflow_connections (workflow_id, position, data) VALUES (?1, ?2, ?3)",
                params![wf, position as i64, to_json(connection)?],
            )
            .map_err(db)?;
        }
        tx.commit().map_err(db)
    }

    fn query_docs<T: DeserializeOwned>(&self, sql: &str, key: &str) -> Result<Vec<T>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql).map_err(db)?;
        let docs = stmt
            .query_map(params![key], |row| row.get::<_, String>(0))
            .map_err(db)?
            .collect::<std::result::Result<Vec<String>, _>>()
            .map_err(db)?;
        docs.iter().map(|d| from_json(d)).collect()
    }

    fn query_doc<T: DeserializeOwned>(&self, sql: &str, key: &str) -> Result<Option<T>> {
        let conn = self.conn();
        let doc: Option<String> = conn
            .query_row(sql, params![key], |row| row.get(0))
            .optional()
            .map_err(db)?;
        doc.as_deref().map(from_json).transpose()
    }

    /// Run an UPDATE and fail with NotFound if it touched nothing.
    fn update_doc(
        &self,
        sql: &str,
        id: &str,
        status: &str,
        data: String,
        kind: &'static str,
    ) -> Result<()> {
        let changed = self
            .conn()
            .execute(sql, params![id, status, data])
            .map_err(db)?;
        if changed == 0 {
            return Err(FlowError::not_found(kind, id));
        }
        Ok(())
    }
}

fn db(e: rusqlite::Error) -> FlowError {
    FlowError::Database(e.to_string())
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: DeserializeOwned>(doc: &str) -> Result<T> {
    Ok(serde_json::from_str(doc)?)
}

impl NodeRepository for SqliteStore {
    fn get_node<'a>(&'a self, id: &'a NodeId) -> BoxFuture<'a, Result<Option<NodeDefinition>>> {
        Box::pin(async move {
            self.query_doc(
                "SELECT data FROM workflow_nodes WHERE id = ?1 LIMIT 1",
                id.as_str(),
            )
        })
    }

    fn workflow_nodes<'a>(
        &'a self,
        workflow_id: &'a WorkflowId,
    ) -> BoxFuture<'a, Result<Vec<NodeDefinition>>> {
        Box::pin(async move {
            self.query_docs(
                "SELECT data FROM workflow_nodes WHERE workflow_id = ?1 ORDER BY position",
                workflow_id.as_str(),
            )
        })
    }

    fn workflow_connections<'a>(
        &'a self,
        workflow_id: &'a WorkflowId,
    ) -> BoxFuture<'a, Result<Vec<Connection>>> {
        Box::pin(async move {
            self.query_docs(
                "SELECT data FROM workflow_connections WHERE workflow_id = ?1 ORDER BY position",
                workflow_id.as_str(),
            )
        })
    }
}

impl NodeInstanceRepository for SqliteStore {
    fn create<'a>(&'a self, instance: &'a NodeInstance) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let data = to_json(instance)?;
            self.conn()
                .execute(
                    "INSERT INTO node_instances (id, workflow_instance_id, status, seq, data)
                     VALUES (?1, ?2, ?3, (SELECT COALESCE(MAX(seq), 0) + 1 FROM node_instances), ?4)",
                    params![
                        instance.id.as_str(),
                        instance.workflow_instance_id.as_str(),
                        instance.status.as_str(),
                        data
                    ],
                )
                .map_err(db)?;
            Ok(())
        })
    }

    fn update<'a>(&'a self, instance: &'a NodeInstance) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.update_doc(
                "UPDATE node_instances SET status = ?2, data = ?3 WHERE id = ?1",
                instance.id.as_str(),
                instance.status.as_str(),
                to_json(instance)?,
                "node instance",
            )
        })
    }

    fn get<'a>(&'a self, id: &'a NodeInstanceId) -> BoxFuture<'a, Result<Option<NodeInstance>>> {
        Box::pin(async move {
            self.query_doc("SELECT data FROM node_instances WHERE id = ?1", id.as_str())
        })
    }

    fn list_for_workflow_instance<'a>(
        &'a self,
        workflow_instance_id: &'a WorkflowInstanceId,
    ) -> BoxFuture<'a, Result<Vec<NodeInstance>>> {
        Box::pin(async move {
            self.query_docs(
                "SELECT data FROM node_instances WHERE workflow_instance_id = ?1 ORDER BY seq",
                workflow_instance_id.as_str(),
            )
        })
    }
}

impl TaskInstanceRepository for SqliteStore {
    fn create<'a>(&'a self, task: &'a TaskInstance) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let data = to_json(task)?;
            self.conn()
                .execute(
                    "INSERT INTO task_instances (id, node_instance_id, workflow_instance_id, status, seq, data)
                     VALUES (?1, ?2, ?3, ?4, (SELECT COALESCE(MAX(seq), 0) + 1 FROM task_instances), ?5)",
                    params![
                        task.id.as_str(),
                        task.node_instance_id.as_str(),
                        task.workflow_instance_id.as_str(),
                        task.status.as_str(),
                        data
                    ],
                )
                .map_err(db)?;
            Ok(())
        })
    }

    fn update<'a>(&'a self, task: &'a TaskInstance) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.update_doc(
                "UPDATE task_instances SET status = ?2, data = ?3 WHERE id = ?1",
                task.id.as_str(),
                task.status.as_str(),
                to_json(task)?,
                "task",
            )
        })
    }

    fn get<'a>(&'a self, id: &'a TaskId) -> BoxFuture<'a, Result<Option<TaskInstance>>> {
        Box::pin(async move {
            self.query_doc("SELECT data FROM task_instances WHERE id = ?1", id.as_str())
        })
    }

    fn list_for_node_instance<'a>(
        &'a self,
        node_instance_id: &'a NodeInstanceId,
    ) -> BoxFuture<'a, Result<Vec<TaskInstance>>> {
        Box::pin(async move {
            self.query_docs(
                "SELECT data FROM task_instances WHERE node_instance_id = ?1 ORDER BY seq",
                node_instance_id.as_str(),
            )
        })
    }
}

impl WorkflowInstanceRepository for SqliteStore {
    fn create<'a>(&'a self, instance: &'a WorkflowInstance) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let data = to_json(instance)?;
            self.conn()
                .execute(
                    "INSERT INTO workflow_instances (id, workflow_id, status, data, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        instance.id.as_str(),
                        instance.workflow_id.as_str(),
                        instance.status.as_str(),
                        data,
                        instance.updated_at.to_rfc3339()
                    ],
                )
                .map_err(db)?;
            Ok(())
        })
    }

    fn update<'a>(&'a self, instance: &'a WorkflowInstance) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let changed = self
                .conn()
                .execute(
                    "UPDATE workflow_instances SET status = ?2, data = ?3, updated_at = ?4 WHERE id = ?1",
                    params![
                        instance.id.as_str(),
                        instance.status.as_str(),
                        to_json(instance)?,
                        instance.updated_at.to_rfc3339()
                    ],
                )
                .map_err(db)?;
            if changed == 0 {
                return Err(FlowError::not_found("workflow instance", &instance.id));
            }
            Ok(())
        })
    }

    fn get<'a>(
        &'a self,
        id: &'a WorkflowInstanceId,
    ) -> BoxFuture<'a, Result<Option<WorkflowInstance>>> {
        Box::pin(async move {
            self.query_doc(
                "SELECT data FROM workflow_instances WHERE id = ?1",
                id.as_str(),
            )
        })
    }

    fn list_active(&self) -> BoxFuture<'_, Result<Vec<WorkflowInstance>>> {
        Box::pin(async move {
            let conn = self.conn();
            let mut stmt = conn
                .prepare(
                    "SELECT data FROM workflow_instances
                     WHERE status NOT IN ('completed', 'failed', 'cancelled')
                     ORDER BY updated_at",
                )
                .map_err(db)?;
            let docs = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(db)?
                .collect::<std::result::Result<Vec<String>, _>>()
                .map_err(db)?;
            docs.iter().map(|d| from_json(d)).collect()
        })
    }

    fn save_snapshot<'a>(
        &'a self,
        id: &'a WorkflowInstanceId,
        snapshot: &'a Value,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.conn()
                .execute(
                    "INSERT INTO context_snapshots (workflow_instance_id, snapshot, saved_at)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(workflow_instance_id)
                     DO UPDATE SET snapshot = excluded.snapshot, saved_at = excluded.saved_at",
                    params![id.as_str(), to_json(snapshot)?, Utc::now().to_rfc3339()],
                )
                .map_err(db)?;
            Ok(())
        })
    }

    fn load_snapshot<'a>(
        &'a self,
        id: &'a WorkflowInstanceId,
    ) -> BoxFuture<'a, Result<Option<Value>>> {
        Box::pin(async move {
            self.query_doc(
                "SELECT snapshot FROM context_snapshots WHERE workflow_instance_id = ?1",
                id.as_str(),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition {
            id: WorkflowId::from("wf"),
            name: "review".into(),
            nodes: vec![
                NodeDefinition::start("start"),
                NodeDefinition::human("review", "ann"),
                NodeDefinition::end("end"),
            ],
            connections: vec![
                Connection::always("start", "review"),
                Connection::when(
                    "review",
                    "end",
                    json!({"type": "simple", "field_path": "output.ok", "operator": "equals", "expected_value": true}),
                ),
            ],
        }
    }

    #[tokio::test]
    async fn test_seed_and_read_back_definition() {
        let store = SqliteStore::in_memory().unwrap();
        store.seed_workflow(&definition()).unwrap();
        store.seed_workflow(&definition()).unwrap();

        let wf = WorkflowId::from("wf");
        let nodes = store.workflow_nodes(&wf).await.unwrap();
        let ids: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["start", "review", "end"]);
        assert_eq!(nodes[1].task_type(), TaskType::Human);

        let conns = store.workflow_connections(&wf).await.unwrap();
        assert_eq!(conns.len(), 2);
        assert!(conns[1].condition_config.is_some());

        let node = store.get_node(&NodeId::from("review")).await.unwrap().unwrap();
        assert_eq!(node.workflow_id, wf);
    }

    #[test]
    fn test_seed_rejects_invalid_definition() {
        let store = SqliteStore::in_memory().unwrap();
        let mut bad = definition();
        bad.connections.push(Connection::always("review", "nowhere"));
        assert!(matches!(store.seed_workflow(&bad), Err(FlowError::Validation(_))));
    }

    #[tokio::test]
    async fn test_rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("flowline.db");
        let wfi = WorkflowInstance::new(WorkflowId::from("wf"), "run", json!({"a": 1}), Value::Null);
        let row = NodeInstance::new(wfi.id.clone(), NodeId::from("start"));
        let mut task = TaskInstance::new(row.id.clone(), wfi.id.clone(), TaskType::Human, "Review");
        {
            let store = SqliteStore::open(&path).unwrap();
            WorkflowInstanceRepository::create(&store, &wfi).await.unwrap();
            NodeInstanceRepository::create(&store, &row).await.unwrap();
            TaskInstanceRepository::create(&store, &task).await.unwrap();
            task.status = TaskStatus::Assigned;
            task.assignee = Some(Assignee::User("ann".into()));
            TaskInstanceRepository::update(&store, &task).await.unwrap();
            store
                .save_snapshot(&wfi.id, &json!({"workflowInstanceId": wfi.id}))
                .await
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let loaded = WorkflowInstanceRepository::get(&store, &wfi.id).await.unwrap().unwrap();
        assert_eq!(loaded.input_data, json!({"a": 1}));
        assert_eq!(store.list_for_workflow_instance(&wfi.id).await.unwrap().len(), 1);
        let tasks = store.list_for_node_instance(&row.id).await.unwrap();
        assert_eq!(tasks[0].assignee, Some(Assignee::User("ann".into())));
        assert!(store.load_snapshot(&wfi.id).await.unwrap().is_some());
        assert_eq!(store.list_active().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_missing_row_is_not_found() {
        let store = SqliteStore::in_memory().unwrap();
        let ghost = NodeInstance::new(WorkflowInstanceId::from("w"), NodeId::from("x"));
        assert!(matches!(
            NodeInstanceRepository::update(&store, &ghost).await,
            Err(FlowError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_snapshot_is_replaced() {
        let store = SqliteStore::in_memory().unwrap();
        let id = WorkflowInstanceId::from("w");
        store.save_snapshot(&id, &json!({"v": 1})).await.unwrap();
        store.save_snapshot(&id, &json!({"v": 2})).await.unwrap();
        assert_eq!(store.load_snapshot(&id).await.unwrap(), Some(json!({"v": 2})));
    }
}
