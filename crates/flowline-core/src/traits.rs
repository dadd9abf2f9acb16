use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::event::ListenerId;
use crate::types::*;

/// Static workflow graph lookup.
pub trait NodeRepository: Send + Sync + 'static {
    fn get_node<'a>(&'a self, id: &'a NodeId) -> BoxFuture<'a, Result<Option<NodeDefinition>>>;

    /// All nodes of a workflow definition.
    fn workflow_nodes<'a>(
        &'a self,
        workflow_id: &'a WorkflowId,
    ) -> BoxFuture<'a, Result<Vec<NodeDefinition>>>;

    /// All edges of a workflow definition, with their condition configs.
    fn workflow_connections<'a>(
        &'a self,
        workflow_id: &'a WorkflowId,
    ) -> BoxFuture<'a, Result<Vec<Connection>>>;
}

/// Node instance rows.
pub trait NodeInstanceRepository: Send + Sync + 'static {
    fn create<'a>(&'a self, instance: &'a NodeInstance) -> BoxFuture<'a, Result<()>>;

    /// Overwrite status, payloads and timestamps of an existing row.
    fn update<'a>(&'a self, instance: &'a NodeInstance) -> BoxFuture<'a, Result<()>>;

    fn get<'a>(&'a self, id: &'a NodeInstanceId) -> BoxFuture<'a, Result<Option<NodeInstance>>>;

    fn list_for_workflow_instance<'a>(
        &'a self,
        workflow_instance_id: &'a WorkflowInstanceId,
    ) -> BoxFuture<'a, Result<Vec<NodeInstance>>>;
}

/// Task instance rows.
pub trait TaskInstanceRepository: Send + Sync + 'static {
    fn create<'a>(&'a self, task: &'a TaskInstance) -> BoxFuture<'a, Result<()>>;

    fn update<'a>(&'a self, task: &'a TaskInstance) -> BoxFuture<'a, Result<()>>;

    fn get<'a>(&'a self, id: &'a TaskId) -> BoxFuture<'a, Result<Option<TaskInstance>>>;

    fn list_for_node_instance<'a>(
        &'a self,
        node_instance_id: &'a NodeInstanceId,
    ) -> BoxFuture<'a, Result<Vec<TaskInstance>>>;
}

/// Workflow instance rows plus the context-snapshot blob used for recovery.
pub trait WorkflowInstanceRepository: Send + Sync + 'static {
    fn create<'a>(&'a self, instance: &'a WorkflowInstance) -> BoxFuture<'a, Result<()>>;

    fn update<'a>(&'a self, instance: &'a WorkflowInstance) -> BoxFuture<'a, Result<()>>;

    fn get<'a>(
        &'a self,
        id: &'a WorkflowInstanceId,
    ) -> BoxFuture<'a, Result<Option<WorkflowInstance>>>;

    /// Instances that are not in a terminal status.
    fn list_active(&self) -> BoxFuture<'_, Result<Vec<WorkflowInstance>>>;

    /// Store the latest snapshot, replacing any previous one.
    fn save_snapshot<'a>(
        &'a self,
        id: &'a WorkflowInstanceId,
        snapshot: &'a serde_json::Value,
    ) -> BoxFuture<'a, Result<()>>;

    fn load_snapshot<'a>(
        &'a self,
        id: &'a WorkflowInstanceId,
    ) -> BoxFuture<'a, Result<Option<serde_json::Value>>>;
}

/// Receives agent task outcomes.
pub trait TaskCompletionListener: Send + Sync + 'static {
    fn on_task_completed<'a>(
        &'a self,
        task_id: &'a TaskId,
        result: &'a serde_json::Value,
    ) -> BoxFuture<'a, ()>;

    fn on_task_failed<'a>(&'a self, task_id: &'a TaskId, error: &'a str) -> BoxFuture<'a, ()>;
}

/// External agent execution service.
pub trait AgentTaskService: Send + Sync + 'static {
    /// Queue a task for an agent. Outcomes arrive through the listeners.
    fn submit<'a>(&'a self, task: &'a TaskInstance) -> BoxFuture<'a, Result<SubmitStatus>>;

    fn subscribe(&self, listener: Arc<dyn TaskCompletionListener>) -> ListenerId;

    fn unsubscribe(&self, id: ListenerId) -> bool;
}

/// The repository collaborators, bundled for constructor injection.
#[derive(Clone)]
pub struct Repositories {
    pub nodes: Arc<dyn NodeRepository>,
    pub node_instances: Arc<dyn NodeInstanceRepository>,
    pub tasks: Arc<dyn TaskInstanceRepository>,
    pub workflow_instances: Arc<dyn WorkflowInstanceRepository>,
}

impl Repositories {
    /// Use one store that implements every repository.
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: NodeRepository
            + NodeInstanceRepository
            + TaskInstanceRepository
            + WorkflowInstanceRepository,
    {
        Self {
            nodes: store.clone(),
            node_instances: store.clone(),
            tasks: store.clone(),
            workflow_instances: store,
        }
    }
}
