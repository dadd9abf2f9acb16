//! Fixtures and mocks shared by Flowline's integration tests.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::{json, Value};

use flowline_core::config::{AppConfig, StorageBackend};
use flowline_core::error::Result;
use flowline_core::event::{ListenerId, ListenerSet};
use flowline_core::traits::{AgentTaskService, TaskCompletionListener};
use flowline_core::types::{
    Assignee, Connection, NodeDefinition, SubmitStatus, TaskInstance, WorkflowDefinition,
    WorkflowId,
};

// ── Workflow fixtures ─────────────────────────────────────────

/// `start -> a -> end`, with `a` worked on by agent `worker`.
pub fn linear_workflow() -> WorkflowDefinition {
    WorkflowDefinition {
        id: WorkflowId::from("linear"),
        name: "Linear".into(),
        nodes: vec![
            NodeDefinition::start("start"),
            NodeDefinition::agent("a", "worker"),
            NodeDefinition::end("end"),
        ],
        connections: vec![Connection::always("start", "a"), Connection::always("a", "end")],
    }
}

/// `start` fans out to agent nodes `a` and `b`, which both feed `end`.
pub fn fan_in_workflow() -> WorkflowDefinition {
    WorkflowDefinition {
        id: WorkflowId::from("fan-in"),
        name: "Fan-in".into(),
        nodes: vec![
            NodeDefinition::start("start"),
            NodeDefinition::agent("a", "worker"),
            NodeDefinition::agent("b", "worker"),
            NodeDefinition::end("end"),
        ],
        connections: vec![
            Connection::always("start", "a"),
            Connection::always("start", "b"),
            Connection::always("a", "end"),
            Connection::always("b", "end"),
        ],
    }
}

/// Condition that holds when the source output has `status == expected`.
pub fn status_is(expected: &str) -> Value {
    json!({
        "type": "simple",
        "field_path": "output.status",
        "operator": "equals",
        "expected_value": expected,
    })
}

/// Human `review` routes to `publish` on approval and to `archive` otherwise.
pub fn conditional_workflow() -> WorkflowDefinition {
    WorkflowDefinition {
        id: WorkflowId::from("conditional"),
        name: "Conditional".into(),
        nodes: vec![
            NodeDefinition::start("start"),
            NodeDefinition::human("review", "alice"),
            NodeDefinition::agent("publish", "worker"),
            NodeDefinition::agent("archive", "worker"),
            NodeDefinition::end("end"),
        ],
        connections: vec![
            Connection::always("start", "review"),
            Connection::when("review", "publish", status_is("approved")),
            Connection::when(
                "review",
                "archive",
                json!({
                    "type": "compound",
                    "operator": "not",
                    "conditions": [status_is("approved")],
                }),
            ),
            Connection::always("publish", "end"),
            Connection::always("archive", "end"),
        ],
    }
}

/// Agent `draft` feeds human `review`, which loops back to `draft` until
/// it approves.
pub fn review_loop_workflow() -> WorkflowDefinition {
    WorkflowDefinition {
        id: WorkflowId::from("review-loop"),
        name: "Review loop".into(),
        nodes: vec![
            NodeDefinition::start("start"),
            NodeDefinition::agent("draft", "writer"),
            NodeDefinition::human("review", "alice"),
            NodeDefinition::end("end"),
        ],
        connections: vec![
            Connection::always("start", "draft"),
            Connection::always("draft", "review"),
            Connection::when("review", "draft", status_is("changes")),
            Connection::when("review", "end", status_is("approved")),
        ],
    }
}

// ── Config fixtures ───────────────────────────────────────────

/// Config using the in-memory store.
pub fn memory_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.storage.backend = StorageBackend::Memory;
    config
}

/// Write `content` to `flowline.toml` inside a fresh temp dir.
pub fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("flowline.toml");
    std::fs::write(&path, content).expect("write config");
    (dir, path)
}

// ── Scripted agent service ────────────────────────────────────

/// What the scripted service does with one submission.
#[derive(Debug, Clone)]
pub enum Scripted {
    Complete(Value),
    Fail(String),
    /// Accept the task and never report back.
    Hang,
    Reject,
}

/// Agent service whose outcomes are queued up front by the test.
///
/// Outcomes are delivered from a spawned task, so listeners never run
/// inside `submit`. Agents without queued outcomes echo the task input.
#[derive(Default)]
pub struct ScriptedAgentService {
    script: Mutex<HashMap<String, VecDeque<Scripted>>>,
    submitted: Mutex<Vec<TaskInstance>>,
    listeners: Arc<ListenerSet>,
}

impl ScriptedAgentService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue the next outcome for `agent_id`.
    pub fn push(&self, agent_id: &str, outcome: Scripted) {
        if let Ok(mut script) = self.script.lock() {
            script.entry(agent_id.to_string()).or_default().push_back(outcome);
        }
    }

    /// Every task submitted so far, in submission order.
    pub fn submitted(&self) -> Vec<TaskInstance> {
        self.submitted.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn next(&self, agent_id: &str) -> Option<Scripted> {
        self.script.lock().ok()?.get_mut(agent_id)?.pop_front()
    }
}

impl AgentTaskService for ScriptedAgentService {
    fn submit<'a>(&'a self, task: &'a TaskInstance) -> BoxFuture<'a, Result<SubmitStatus>> {
        Box::pin(async move {
            let Some(Assignee::Agent(agent_id)) = &task.assignee else {
                return Ok(SubmitStatus::Rejected);
            };
            if let Ok(mut submitted) = self.submitted.lock() {
                submitted.push(task.clone());
            }
            let outcome = self
                .next(agent_id)
                .unwrap_or_else(|| Scripted::Complete(task.input_data.clone()));
            let listeners = self.listeners.clone();
            let task_id = task.id.clone();
            match outcome {
                Scripted::Reject => return Ok(SubmitStatus::Rejected),
                Scripted::Hang => {}
                Scripted::Complete(output) => {
                    tokio::spawn(async move { listeners.notify_completed(&task_id, &output).await });
                }
                Scripted::Fail(error) => {
                    tokio::spawn(async move { listeners.notify_failed(&task_id, &error).await });
                }
            }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixtures_are_well_formed() {
        for wf in [
            linear_workflow(),
            fan_in_workflow(),
            conditional_workflow(),
            review_loop_workflow(),
        ] {
            wf.check().unwrap();
        }
    }

    #[test]
    fn test_memory_config() {
        let config = memory_config();
        assert_eq!(config.storage.backend, StorageBackend::Memory);
    }
}
