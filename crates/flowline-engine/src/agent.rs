use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, warn};

use flowline_core::error::Result;
use flowline_core::event::{ListenerId, ListenerSet};
use flowline_core::traits::{AgentTaskService, TaskCompletionListener};
use flowline_core::types::{Assignee, SubmitStatus, TaskInstance};

/// What an agent handler produces: the task output, or an error message.
pub type AgentOutcome = std::result::Result<Value, String>;

type Handler = Arc<dyn Fn(TaskInstance) -> BoxFuture<'static, AgentOutcome> + Send + Sync>;

/// Agent service that runs registered handlers in-process.
///
/// `submit` only spawns the handler; outcomes reach the listeners from the
/// spawned task, never from inside `submit`.
#[derive(Default)]
pub struct LocalAgentService {
    handlers: RwLock<HashMap<String, Handler>>,
    listeners: Arc<ListenerSet>,
}

impl LocalAgentService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `agent_id`.
    pub fn register<F, Fut>(&self, agent_id: impl Into<String>, handler: F)
    where
        F: Fn(TaskInstance) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AgentOutcome> + Send + 'static,
    {
        let handler: Handler =
            Arc::new(move |task| -> BoxFuture<'static, AgentOutcome> { Box::pin(handler(task)) });
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.insert(agent_id.into(), handler);
        }
    }

    pub fn agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .handlers
            .read()
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    fn handler(&self, agent_id: &str) -> Option<Handler> {
        self.handlers.read().ok()?.get(agent_id).cloned()
    }
}

impl AgentTaskService for LocalAgentService {
    fn submit<'a>(&'a self, task: &'a TaskInstance) -> BoxFuture<'a, Result<SubmitStatus>> {
        Box::pin(async move {
            let Some(Assignee::Agent(agent_id)) = &task.assignee else {
                warn!(task_id = %task.id, "Task has no agent assignee");
                return Ok(SubmitStatus::Rejected);
            };
            let Some(handler) = self.handler(agent_id) else {
                warn!(task_id = %task.id, agent_id = %agent_id, "Unknown agent");
                return Ok(SubmitStatus::Rejected);
            };

            let listeners = self.listeners.clone();
            let task = task.clone();
            debug!(task_id = %task.id, agent_id = %agent_id, "Agent task queued");
            tokio::spawn(async move {
                let task_id = task.id.clone();
                match handler(task).await {
                    Ok(output) => listeners.notify_completed(&task_id, &output).await,
                    Err(error) => listeners.notify_failed(&task_id, &error).await,
                }
            });
            Ok(SubmitStatus::Queued)
        })
    }

    fn subscribe(&self, listener: Arc<dyn TaskCompletionListener>) -> ListenerId {
        self.listeners.subscribe(listener)
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }
}
