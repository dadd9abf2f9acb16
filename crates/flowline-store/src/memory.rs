use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use futures::future::BoxFuture;
use serde_json::Value;

use flowline_core::error::{FlowError, Result};
use flowline_core::traits::{
    NodeInstanceRepository, NodeRepository, TaskInstanceRepository, WorkflowInstanceRepository,
};
use flowline_core::types::*;

#[derive(Default)]
struct Tables {
    nodes: Vec<NodeDefinition>,
    connections: Vec<(WorkflowId, Connection)>,
    workflow_instances: Vec<WorkflowInstance>,
    node_instances: Vec<NodeInstance>,
    tasks: Vec<TaskInstance>,
    snapshots: HashMap<WorkflowInstanceId, Value>,
}

/// Every repository held in process memory. Rows keep insertion order.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a workflow definition, replacing any earlier version of it.
    pub fn seed_workflow(&self, definition: &WorkflowDefinition) -> Result<()> {
        definition.check()?;
        let definition = definition.clone().normalized();
        let mut tables = self.tables();
        tables.nodes.retain(|n| n.workflow_id != definition.id);
        tables.connections.retain(|(wf, _)| wf != &definition.id);
        tables.nodes.extend(definition.nodes);
        let id = definition.id;
        tables
            .connections
            .extend(definition.connections.into_iter().map(|c| (id.clone(), c)));
        Ok(())
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn upsert_new<T>(rows: &mut Vec<T>, row: &T, id_of: impl Fn(&T) -> &str, kind: &str) -> Result<()>
where
    T: Clone,
{
    if rows.iter().any(|r| id_of(r) == id_of(row)) {
        return Err(FlowError::Database(format!(
            "{} {} already exists",
            kind,
            id_of(row)
        )));
    }
    rows.push(row.clone());
    Ok(())
}

fn replace<T>(rows: &mut [T], row: &T, id_of: impl Fn(&T) -> &str, kind: &'static str) -> Result<()>
where
    T: Clone,
{
    match rows.iter_mut().find(|r| id_of(r) == id_of(row)) {
        Some(slot) => {
            *slot = row.clone();
            Ok(())
        }
        None => Err(FlowError::not_found(kind, id_of(row))),
    }
}

impl NodeRepository for MemoryStore {
    fn get_node<'a>(&'a self, id: &'a NodeId) -> BoxFuture<'a, Result<Option<NodeDefinition>>> {
        Box::pin(async move { Ok(self.tables().nodes.iter().find(|n| &n.id == id).cloned()) })
    }

    fn workflow_nodes<'a>(
        &'a self,
        workflow_id: &'a WorkflowId,
    ) -> BoxFuture<'a, Result<Vec<NodeDefinition>>> {
        Box::pin(async move {
            Ok(self
                .tables()
                .nodes
                .iter()
                .filter(|n| &n.workflow_id == workflow_id)
                .cloned()
                .collect())
        })
    }

    fn workflow_connections<'a>(
        &'a self,
        workflow_id: &'a WorkflowId,
    ) -> BoxFuture<'a, Result<Vec<Connection>>> {
        Box::pin(async move {
            Ok(self
                .tables()
                .connections
                .iter()
                .filter(|(wf, _)| wf == workflow_id)
                .map(|(_, c)| c.clone())
                .collect())
        })
    }
}

impl NodeInstanceRepository for MemoryStore {
    fn create<'a>(&'a self, instance: &'a NodeInstance) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            upsert_new(
                &mut self.tables().node_instances,
                instance,
                |r| r.id.as_str(),
                "node instance",
            )
        })
    }

    fn update<'a>(&'a self, instance: &'a NodeInstance) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            replace(
                &mut self.tables().node_instances,
                instance,
                |r| r.id.as_str(),
                "node instance",
            )
        })
    }

    fn get<'a>(&'a self, id: &'a NodeInstanceId) -> BoxFuture<'a, Result<Option<NodeInstance>>> {
        Box::pin(async move {
            Ok(self
                .tables()
                .node_instances
                .iter()
                .find(|r| &r.id == id)
                .cloned())
        })
    }

    fn list_for_workflow_instance<'a>(
        &'a self,
        workflow_instance_id: &'a WorkflowInstanceId,
    ) -> BoxFuture<'a, Result<Vec<NodeInstance>>> {
        Box::pin(async move {
            Ok(self
                .tables()
                .node_instances
                .iter()
                .filter(|r| &r.workflow_instance_id == workflow_instance_id)
                .cloned()
                .collect())
        })
    }
}

impl TaskInstanceRepository for MemoryStore {
    fn create<'a>(&'a self, task: &'a TaskInstance) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { upsert_new(&mut self.tables().tasks, task, |t| t.id.as_str(), "task") })
    }

    fn update<'a>(&'a self, task: &'a TaskInstance) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { replace(&mut self.tables().tasks, task, |t| t.id.as_str(), "task") })
    }

    fn get<'a>(&'a self, id: &'a TaskId) -> BoxFuture<'a, Result<Option<TaskInstance>>> {
        Box::pin(async move { Ok(self.tables().tasks.iter().find(|t| &t.id == id).cloned()) })
    }

    fn list_for_node_instance<'a>(
        &'a self,
        node_instance_id: &'a NodeInstanceId,
    ) -> BoxFuture<'a, Result<Vec<TaskInstance>>> {
        Box::pin(async move {
            Ok(self
                .tables()
                .tasks
                .iter()
                .filter(|t| &t.node_instance_id == node_instance_id)
                .cloned()
                .collect())
        })
    }
}

impl WorkflowInstanceRepository for MemoryStore {
    fn create<'a>(&'a self, instance: &'a WorkflowInstance) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            upsert_new(
                &mut self.tables().workflow_instances,
                instance,
                |w| w.id.as_str(),
                "workflow instance",
            )
        })
    }

    fn update<'a>(&'a self, instance: &'a WorkflowInstance) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            replace(
                &mut self.tables().workflow_instances,
                instance,
                |w| w.id.as_str(),
                "workflow instance",
            )
        })
    }

    fn get<'a>(
        &'a self,
        id: &'a WorkflowInstanceId,
    ) -> BoxFuture<'a, Result<Option<WorkflowInstance>>> {
        Box::pin(async move {
            Ok(self
                .tables()
                .workflow_instances
                .iter()
                .find(|w| &w.id == id)
                .cloned())
        })
    }

    fn list_active(&self) -> BoxFuture<'_, Result<Vec<WorkflowInstance>>> {
        Box::pin(async move {
            Ok(self
                .tables()
                .workflow_instances
                .iter()
                .filter(|w| !w.status.is_terminal())
                .cloned()
                .collect())
        })
    }

    fn save_snapshot<'a>(
        &'a self,
        id: &'a WorkflowInstanceId,
        snapshot: &'a Value,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.tables().snapshots.insert(id.clone(), snapshot.clone());
            Ok(())
        })
    }

    fn load_snapshot<'a>(
        &'a self,
        id: &'a WorkflowInstanceId,
    ) -> BoxFuture<'a, Result<Option<Value>>> {
        Box::pin(async move { Ok(self.tables().snapshots.get(id).cloned()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition {
            id: WorkflowId::from("wf"),
            name: "demo".into(),
            nodes: vec![NodeDefinition::start("s"), NodeDefinition::end("e")],
            connections: vec![Connection::always("s", "e")],
        }
    }

    #[tokio::test]
    async fn test_seed_replaces_previous_version() {
        let store = MemoryStore::new();
        store.seed_workflow(&definition()).unwrap();
        store.seed_workflow(&definition()).unwrap();

        let wf = WorkflowId::from("wf");
        let nodes = store.workflow_nodes(&wf).await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(nodes.iter().all(|n| n.workflow_id == wf));
        assert_eq!(store.workflow_connections(&wf).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_node_instance_rows() {
        let store = MemoryStore::new();
        let wfi = WorkflowInstanceId::from("wfi");
        let mut row = NodeInstance::new(wfi.clone(), NodeId::from("s"));
        NodeInstanceRepository::create(&store, &row).await.unwrap();
        assert!(NodeInstanceRepository::create(&store, &row).await.is_err());

        row.status = NodeInstanceStatus::Completed;
        NodeInstanceRepository::update(&store, &row).await.unwrap();
        let loaded = NodeInstanceRepository::get(&store, &row.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, NodeInstanceStatus::Completed);
        assert_eq!(store.list_for_workflow_instance(&wfi).await.unwrap().len(), 1);

        let ghost = NodeInstance::new(wfi, NodeId::from("x"));
        assert!(matches!(
            NodeInstanceRepository::update(&store, &ghost).await,
            Err(FlowError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_active_skips_terminal() {
        let store = MemoryStore::new();
        let running = WorkflowInstance::new(WorkflowId::from("wf"), "a", Value::Null, Value::Null);
        let mut done = WorkflowInstance::new(WorkflowId::from("wf"), "b", Value::Null, Value::Null);
        done.status = WorkflowStatus::Completed;
        WorkflowInstanceRepository::create(&store, &running).await.unwrap();
        WorkflowInstanceRepository::create(&store, &done).await.unwrap();

        let active = store.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, running.id);
    }
}
