use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::broadcast;

use flowline_core::config::AppConfig;
use flowline_core::error::FlowError;
use flowline_core::event::EngineEvent;
use flowline_core::traits::{
    NodeInstanceRepository, Repositories, TaskCompletionListener, TaskInstanceRepository,
    WorkflowInstanceRepository,
};
use flowline_core::types::*;
use flowline_engine::{ConditionEngine, Engine};
use flowline_store::MemoryStore;
use flowline_test_utils::{
    conditional_workflow, fan_in_workflow, linear_workflow, memory_config, review_loop_workflow,
    status_is, Scripted, ScriptedAgentService,
};

const WAIT: Duration = Duration::from_secs(10);

struct World {
    store: Arc<MemoryStore>,
    agents: Arc<ScriptedAgentService>,
    engine: Engine,
    events: broadcast::Receiver<EngineEvent>,
    workflow_id: WorkflowId,
}

impl World {
    fn new(definition: WorkflowDefinition) -> Self {
        Self::with_config(definition, memory_config())
    }

    fn with_config(definition: WorkflowDefinition, config: AppConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        store.seed_workflow(&definition).unwrap();
        Self::on_store(store, definition.id, config)
    }

    /// A fresh engine over an existing store, as after a restart.
    fn on_store(store: Arc<MemoryStore>, workflow_id: WorkflowId, config: AppConfig) -> Self {
        let agents = ScriptedAgentService::new();
        let engine = Engine::new(&config, Repositories::from_store(store.clone()), agents.clone());
        let events = engine.event_bus.subscribe();
        Self {
            store,
            agents,
            engine,
            events,
            workflow_id,
        }
    }

    async fn start(&self, input: Value) -> WorkflowInstanceId {
        self.engine
            .orchestrator
            .start_workflow(&self.workflow_id, "test run", input, json!({"tenant": "acme"}))
            .await
            .unwrap()
    }

    async fn next_event<F, T>(&mut self, wait: Duration, mut pick: F) -> T
    where
        F: FnMut(EngineEvent) -> Option<T>,
    {
        let found = tokio::time::timeout(wait, async {
            loop {
                match self.events.recv().await {
                    Ok(event) => {
                        if let Some(found) = pick(event) {
                            return found;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
                }
            }
        })
        .await;
        found.expect("timed out waiting for engine event")
    }

    async fn finished(&mut self, id: &WorkflowInstanceId) -> WorkflowStatus {
        self.finished_within(id, WAIT).await
    }

    async fn finished_within(&mut self, id: &WorkflowInstanceId, wait: Duration) -> WorkflowStatus {
        let id = id.clone();
        self.next_event(wait, |event| match event {
            EngineEvent::WorkflowFinished {
                workflow_instance_id,
                status,
            } if workflow_instance_id == id => Some(status),
            _ => None,
        })
        .await
    }

    async fn next_human_task(&mut self) -> TaskInstance {
        let task_id = self
            .next_event(WAIT, |event| match event {
                EngineEvent::TaskDispatched {
                    task_id,
                    task_type: TaskType::Human,
                    ..
                } => Some(task_id),
                _ => None,
            })
            .await;
        TaskInstanceRepository::get(self.store.as_ref(), &task_id)
            .await
            .unwrap()
            .unwrap()
    }

    async fn instance(&self, id: &WorkflowInstanceId) -> WorkflowInstance {
        WorkflowInstanceRepository::get(self.store.as_ref(), id)
            .await
            .unwrap()
            .unwrap()
    }

    /// Latest node-instance row per node id.
    async fn rows(&self, id: &WorkflowInstanceId) -> HashMap<String, NodeInstance> {
        self.store
            .list_for_workflow_instance(id)
            .await
            .unwrap()
            .into_iter()
            .map(|row| (row.node_id.to_string(), row))
            .collect()
    }

    async fn tasks_of(&self, row: &NodeInstance) -> Vec<TaskInstance> {
        self.store.list_for_node_instance(&row.id).await.unwrap()
    }

    async fn open_task_for(&self, id: &WorkflowInstanceId, node: &str) -> TaskInstance {
        let row = self.rows(id).await.remove(node).unwrap();
        self.engine
            .orchestrator
            .open_tasks(id)
            .await
            .unwrap()
            .into_iter()
            .find(|t| t.node_instance_id == row.id)
            .unwrap_or_else(|| panic!("no open task for {}", node))
    }

    async fn complete(&self, task: &TaskInstance, actor: &str, output: Value) -> bool {
        self.engine
            .orchestrator
            .complete_task(&task.id, actor, output, None)
            .await
            .unwrap()
    }
}

fn human_fan_in() -> WorkflowDefinition {
    WorkflowDefinition {
        id: WorkflowId::from("human-fan-in"),
        name: "Human fan-in".into(),
        nodes: vec![
            NodeDefinition::start("start"),
            NodeDefinition::human("a", "alice"),
            NodeDefinition::human("b", "bob"),
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

fn human_chain() -> WorkflowDefinition {
    WorkflowDefinition {
        id: WorkflowId::from("human-chain"),
        name: "Human chain".into(),
        nodes: vec![
            NodeDefinition::start("start"),
            NodeDefinition::human("a", "alice"),
            NodeDefinition::human("b", "alice"),
            NodeDefinition::end("end"),
        ],
        connections: vec![
            Connection::always("start", "a"),
            Connection::always("a", "b"),
            Connection::always("b", "end"),
        ],
    }
}

// ── Scenarios ─────────────────────────────────────────────────

#[tokio::test]
async fn test_linear_workflow_runs_to_completion() {
    let mut world = World::new(linear_workflow());
    world.agents.push("worker", Scripted::Complete(json!({"summary": "done"})));

    let id = world.start(json!({"doc": 7})).await;
    assert_eq!(world.finished(&id).await, WorkflowStatus::Completed);

    let rows = world.rows(&id).await;
    for node in ["start", "a", "end"] {
        assert_eq!(rows[node].status, NodeInstanceStatus::Completed, "{}", node);
    }
    // Only the processor got a task.
    assert!(world.tasks_of(&rows["start"]).await.is_empty());
    assert!(world.tasks_of(&rows["end"]).await.is_empty());
    let tasks = world.tasks_of(&rows["a"]).await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Completed);

    let instance = world.instance(&id).await;
    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert!(instance.completed_at.is_some());
    let output = instance.output_data.unwrap();
    assert_eq!(output["end"]["a"]["summary"], "done");
}

#[tokio::test]
async fn test_start_passes_workflow_input_downstream() {
    let mut world = World::new(linear_workflow());
    let id = world.start(json!({"doc": 7})).await;
    assert_eq!(world.finished(&id).await, WorkflowStatus::Completed);

    let submitted = world.agents.submitted();
    assert_eq!(submitted.len(), 1);
    let context = &submitted[0].input_data["context"];
    assert_eq!(context["immediate_upstream"]["start"]["doc"], 7);
    assert_eq!(context["global"]["tenant"], "acme");
}

#[tokio::test]
async fn test_fan_in_waits_for_every_branch() {
    let mut world = World::new(human_fan_in());
    let id = world.start(json!({})).await;

    let a = world.open_task_for(&id, "a").await;
    let b = world.open_task_for(&id, "b").await;
    assert!(world.complete(&a, "alice", json!({"from": "a"})).await);

    let rows = world.rows(&id).await;
    assert_eq!(rows["end"].status, NodeInstanceStatus::Pending);
    assert_eq!(world.instance(&id).await.status, WorkflowStatus::Running);

    assert!(world.complete(&b, "bob", json!({"from": "b"})).await);
    assert_eq!(world.finished(&id).await, WorkflowStatus::Completed);
    let output = world.instance(&id).await.output_data.unwrap();
    assert_eq!(output["end"]["a"]["from"], "a");
    assert_eq!(output["end"]["b"]["from"], "b");
}

#[tokio::test]
async fn test_agent_fan_in_completes() {
    let mut world = World::new(fan_in_workflow());
    let id = world.start(json!({})).await;
    assert_eq!(world.finished(&id).await, WorkflowStatus::Completed);
    assert_eq!(world.agents.submitted().len(), 2);
}

#[tokio::test]
async fn test_conditional_edge_routes_on_output() {
    let mut world = World::new(conditional_workflow());
    let id = world.start(json!({})).await;

    let review = world.next_human_task().await;
    assert_eq!(review.assignee, Some(Assignee::User("alice".into())));
    world.complete(&review, "alice", json!({"status": "approved"})).await;
    assert_eq!(world.finished(&id).await, WorkflowStatus::Completed);

    let rows = world.rows(&id).await;
    assert_eq!(rows["publish"].status, NodeInstanceStatus::Completed);
    assert_eq!(rows["archive"].status, NodeInstanceStatus::Skipped);
    assert!(world.tasks_of(&rows["archive"]).await.is_empty());
}

#[tokio::test]
async fn test_conditional_edge_rejection_takes_other_branch() {
    let mut world = World::new(conditional_workflow());
    let id = world.start(json!({})).await;

    let review = world.next_human_task().await;
    world.complete(&review, "alice", json!({"status": "rejected"})).await;
    assert_eq!(world.finished(&id).await, WorkflowStatus::Completed);

    let rows = world.rows(&id).await;
    assert_eq!(rows["publish"].status, NodeInstanceStatus::Skipped);
    assert_eq!(rows["archive"].status, NodeInstanceStatus::Completed);
}

#[tokio::test]
async fn test_recovery_after_restart_rebuilds_progress() {
    let first = World::new(human_chain());
    let id = first.start(json!({})).await;

    // Hold the instance so completing `a` leaves `b` ready but undispatched.
    assert!(first.engine.orchestrator.pause_workflow(&id).await.unwrap());
    let a = first.open_task_for(&id, "a").await;
    assert!(first.complete(&a, "alice", json!({"ok": true})).await);
    let rows = first.rows(&id).await;
    assert_eq!(rows["b"].status, NodeInstanceStatus::Pending);
    first.engine.orchestrator.detach();

    let mut second = World::on_store(first.store.clone(), first.workflow_id.clone(), memory_config());
    assert!(!second.engine.registry.contains(&id));
    let ctx = second.engine.registry.get_or_create(&id).await.unwrap();

    let completed = ctx.completed_nodes().await;
    assert_eq!(completed.len(), 2);
    assert!(completed.contains(&rows["start"].id));
    assert!(completed.contains(&rows["a"].id));
    assert!(ctx.pending_triggers().await.contains(&rows["b"].id));
    let recovered = second
        .next_event(WAIT, |event| match event {
            EngineEvent::ContextRecovered { ready_nodes, .. } => Some(ready_nodes),
            _ => None,
        })
        .await;
    assert_eq!(recovered, 1);

    assert!(second.engine.orchestrator.resume_workflow(&id).await.unwrap());
    let b = second.next_human_task().await;
    assert_eq!(b.node_instance_id, rows["b"].id);
    second.complete(&b, "alice", json!({})).await;
    assert_eq!(second.finished(&id).await, WorkflowStatus::Completed);
}

#[tokio::test]
async fn test_recovery_prefers_current_snapshot() {
    let first = World::new(human_chain());
    let id = first.start(json!({})).await;
    let a = first.open_task_for(&id, "a").await;
    first.complete(&a, "alice", json!({})).await;
    assert_eq!(first.engine.registry.persist_all().await, 1);
    first.engine.orchestrator.detach();

    let mut second = World::on_store(first.store.clone(), first.workflow_id.clone(), memory_config());
    let ctx = second.engine.registry.get_or_create(&id).await.unwrap();
    assert_eq!(ctx.completed_count().await, 2);
    let from_snapshot = second
        .next_event(WAIT, |event| match event {
            EngineEvent::ContextRecovered { from_snapshot, .. } => Some(from_snapshot),
            _ => None,
        })
        .await;
    assert!(from_snapshot);

    // The task dispatched before the restart can still be finished.
    let b = second.open_task_for(&id, "b").await;
    second.complete(&b, "alice", json!({})).await;
    assert_eq!(second.finished(&id).await, WorkflowStatus::Completed);
}

#[tokio::test]
async fn test_resume_active_instances_after_restart() {
    let first = World::new(linear_workflow());
    first.agents.push("worker", Scripted::Hang);
    let id = first.start(json!({})).await;
    first.engine.orchestrator.detach();

    let mut second = World::on_store(first.store.clone(), first.workflow_id.clone(), memory_config());
    assert_eq!(second.engine.orchestrator.resume_active_instances().await.unwrap(), 1);

    // The agent never answered; finish its task through the new engine.
    let rows = second.rows(&id).await;
    let task = second.tasks_of(&rows["a"]).await.remove(0);
    assert_eq!(task.status, TaskStatus::InProgress);
    second
        .engine
        .orchestrator
        .on_task_completed(&task.id, &json!({"late": true}))
        .await;
    assert_eq!(second.finished(&id).await, WorkflowStatus::Completed);
}

// ── Task outcomes ─────────────────────────────────────────────

#[tokio::test]
async fn test_duplicate_completion_is_ignored() {
    let mut world = World::new(human_chain());
    let id = world.start(json!({})).await;
    let a = world.open_task_for(&id, "a").await;

    assert!(world.complete(&a, "alice", json!({"n": 1})).await);
    assert!(!world.complete(&a, "alice", json!({"n": 2})).await);

    let rows = world.rows(&id).await;
    assert_eq!(rows["a"].output_data, Some(json!({"n": 1})));
    // `b` was dispatched exactly once.
    assert_eq!(world.tasks_of(&rows["b"]).await.len(), 1);

    let b = world.open_task_for(&id, "b").await;
    world.complete(&b, "alice", json!({})).await;
    assert_eq!(world.finished(&id).await, WorkflowStatus::Completed);
}

#[tokio::test]
async fn test_only_assignee_may_complete_human_task() {
    let world = World::new(conditional_workflow());
    let id = world.start(json!({})).await;
    let review = world.open_task_for(&id, "review").await;

    let err = world
        .engine
        .orchestrator
        .complete_task(&review.id, "mallory", json!({"status": "approved"}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Authorization(_)));

    let still_open = world.open_task_for(&id, "review").await;
    assert_eq!(still_open.id, review.id);
    assert_eq!(still_open.status, TaskStatus::Assigned);
}

#[tokio::test]
async fn test_unknown_task_is_not_found() {
    let world = World::new(linear_workflow());
    let err = world
        .engine
        .orchestrator
        .complete_task(&TaskId::from("nope"), "alice", json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::NotFound { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_hung_agent_task_times_out() {
    let mut config = memory_config();
    config.engine.task_timeout_secs = 30;
    let mut world = World::with_config(linear_workflow(), config);
    world.agents.push("worker", Scripted::Hang);

    let id = world.start(json!({})).await;
    let status = world.finished_within(&id, Duration::from_secs(3600)).await;
    assert_eq!(status, WorkflowStatus::Failed);

    let rows = world.rows(&id).await;
    assert_eq!(rows["a"].status, NodeInstanceStatus::Failed);
    let task = world.tasks_of(&rows["a"]).await.remove(0);
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error_message.unwrap().contains("timed out"));
    let instance = world.instance(&id).await;
    assert!(instance.error_message.unwrap().contains("node 'a' failed"));
}

#[tokio::test]
async fn test_rejected_submission_fails_node() {
    let mut world = World::new(linear_workflow());
    world.agents.push("worker", Scripted::Reject);
    let id = world.start(json!({})).await;
    assert_eq!(world.finished(&id).await, WorkflowStatus::Failed);
    let rows = world.rows(&id).await;
    assert_eq!(rows["end"].status, NodeInstanceStatus::Skipped);
}

#[tokio::test]
async fn test_failed_node_can_be_retried() {
    let definition = WorkflowDefinition {
        id: WorkflowId::from("flaky"),
        name: "Flaky".into(),
        nodes: vec![
            NodeDefinition::start("start"),
            NodeDefinition::agent("a", "flaky"),
            NodeDefinition::agent("b", "worker"),
            NodeDefinition::end("end"),
        ],
        connections: vec![
            Connection::always("start", "a"),
            Connection::always("start", "b"),
            Connection::always("a", "end"),
            Connection::always("b", "end"),
        ],
    };
    let mut world = World::new(definition);
    world.agents.push("flaky", Scripted::Fail("model overloaded".into()));

    let id = world.start(json!({})).await;
    assert_eq!(world.finished(&id).await, WorkflowStatus::Failed);
    let failed = world.rows(&id).await.remove("a").unwrap();
    assert_eq!(failed.status, NodeInstanceStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("model overloaded"));

    let retry = world.engine.orchestrator.retry_node(&failed.id).await.unwrap();
    assert_ne!(retry, failed.id);
    assert_eq!(world.finished(&id).await, WorkflowStatus::Completed);

    let retried = NodeInstanceRepository::get(world.store.as_ref(), &retry)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(retried.retry_count, 1);
    assert_eq!(retried.parent_instance_id, Some(failed.id));
    assert_eq!(retried.status, NodeInstanceStatus::Completed);
    assert!(world.instance(&id).await.error_message.is_none());
}

// ── Loops ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_loop_workflow_starts_on_first_node() {
    let world = World::new(review_loop_workflow());
    world.agents.push("writer", Scripted::Hang);
    let id = world.start(json!({})).await;

    let rows = world.rows(&id).await;
    assert_eq!(rows["draft"].status, NodeInstanceStatus::Running);
    assert_eq!(rows["review"].status, NodeInstanceStatus::Pending);
    assert_eq!(rows["end"].status, NodeInstanceStatus::Pending);
    assert_eq!(world.instance(&id).await.status, WorkflowStatus::Running);
    assert_eq!(world.agents.submitted().len(), 1);
}

#[tokio::test]
async fn test_review_loop_reruns_draft() {
    let mut world = World::new(review_loop_workflow());
    let id = world.start(json!({})).await;

    let review = world.next_human_task().await;
    world.complete(&review, "alice", json!({"status": "changes"})).await;
    let review = world.next_human_task().await;
    world.complete(&review, "alice", json!({"status": "approved"})).await;
    assert_eq!(world.finished(&id).await, WorkflowStatus::Completed);

    assert_eq!(world.agents.submitted().len(), 2);
    let drafts: Vec<NodeInstance> = world
        .store
        .list_for_workflow_instance(&id)
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.node_id.as_str() == "draft")
        .collect();
    assert_eq!(drafts.len(), 2);
    assert_eq!(drafts[0].loop_iteration, None);
    assert_eq!(drafts[1].loop_iteration, Some(1));
}

#[tokio::test]
async fn test_loop_cap_stops_rerunning() {
    let mut config = memory_config();
    config.engine.max_loop_iterations = 2;
    let mut world = World::with_config(review_loop_workflow(), config);
    let id = world.start(json!({})).await;

    for _ in 0..3 {
        let review = world.next_human_task().await;
        world.complete(&review, "alice", json!({"status": "changes"})).await;
    }
    let limit = world
        .next_event(WAIT, |event| match event {
            EngineEvent::LoopLimitReached { limit, node_id, .. } => Some((limit, node_id)),
            _ => None,
        })
        .await;
    assert_eq!(limit, (2, NodeId::from("draft")));
    // The original draft plus two loop-backs.
    assert_eq!(world.agents.submitted().len(), 3);
}

#[tokio::test]
async fn test_loop_rerun_survives_restart() {
    let mut first = World::new(review_loop_workflow());
    let id = first.start(json!({})).await;
    let review = first.next_human_task().await;

    // Ask for changes while paused, so the rerun of draft is left pending.
    assert!(first.engine.orchestrator.pause_workflow(&id).await.unwrap());
    assert!(first.complete(&review, "alice", json!({"status": "changes"})).await);
    let rows = first.rows(&id).await;
    assert_eq!(rows["draft"].loop_iteration, Some(1));
    assert_eq!(rows["draft"].status, NodeInstanceStatus::Pending);
    first.engine.orchestrator.detach();

    let mut second = World::on_store(first.store.clone(), first.workflow_id.clone(), memory_config());
    let ctx = second.engine.registry.get_or_create(&id).await.unwrap();
    assert!(ctx.pending_triggers().await.contains(&rows["draft"].id));

    assert!(second.engine.orchestrator.resume_workflow(&id).await.unwrap());
    let review = second.next_human_task().await;
    assert_ne!(review.node_instance_id, rows["review"].id);
    assert!(second.complete(&review, "alice", json!({"status": "approved"})).await);
    assert_eq!(second.finished(&id).await, WorkflowStatus::Completed);
    assert_eq!(second.agents.submitted().len(), 1);
}

// ── Cancellation and pause ────────────────────────────────────

#[tokio::test]
async fn test_cancel_workflow_cancels_open_work() {
    let mut world = World::new(human_fan_in());
    let id = world.start(json!({})).await;

    assert!(world.engine.orchestrator.cancel_workflow(&id).await.unwrap());
    assert_eq!(world.finished(&id).await, WorkflowStatus::Cancelled);
    assert!(!world.engine.orchestrator.cancel_workflow(&id).await.unwrap());

    let rows = world.rows(&id).await;
    for node in ["a", "b"] {
        assert_eq!(rows[node].status, NodeInstanceStatus::Cancelled);
        for task in world.tasks_of(&rows[node]).await {
            assert_eq!(task.status, TaskStatus::Cancelled);
        }
    }
    assert_eq!(rows["start"].status, NodeInstanceStatus::Completed);
}

#[tokio::test]
async fn test_cancelled_node_outranks_failure() {
    let mut world = World::new(human_fan_in());
    let id = world.start(json!({})).await;

    let a = world.open_task_for(&id, "a").await;
    world
        .engine
        .orchestrator
        .fail_task(&a.id, "alice", "cannot do it")
        .await
        .unwrap();
    let b = world.open_task_for(&id, "b").await;
    assert!(world.engine.orchestrator.cancel_task(&b.id).await.unwrap());

    assert_eq!(world.finished(&id).await, WorkflowStatus::Cancelled);
    let rows = world.rows(&id).await;
    assert_eq!(rows["a"].status, NodeInstanceStatus::Failed);
    assert_eq!(rows["b"].status, NodeInstanceStatus::Cancelled);
}

#[tokio::test]
async fn test_pause_holds_ready_nodes() {
    let mut world = World::new(human_chain());
    let id = world.start(json!({})).await;
    assert!(world.engine.orchestrator.pause_workflow(&id).await.unwrap());
    assert!(!world.engine.orchestrator.pause_workflow(&id).await.unwrap());

    let a = world.open_task_for(&id, "a").await;
    assert!(world.complete(&a, "alice", json!({})).await);
    let rows = world.rows(&id).await;
    assert!(world.tasks_of(&rows["b"]).await.is_empty());
    assert_eq!(rows["b"].status, NodeInstanceStatus::Pending);

    assert!(world.engine.orchestrator.resume_workflow(&id).await.unwrap());
    let b = world.open_task_for(&id, "b").await;
    assert_ne!(b.id, a.id);
    assert_eq!(b.node_instance_id, rows["b"].id);
    assert!(world.complete(&b, "alice", json!({})).await);
    assert_eq!(world.finished(&id).await, WorkflowStatus::Completed);

    let err = world.engine.orchestrator.pause_workflow(&id).await.unwrap_err();
    assert!(matches!(err, FlowError::Validation(_)));
}

#[test]
fn test_status_condition_fixture() {
    let conditions = ConditionEngine::default();
    let config = status_is("approved");
    assert!(conditions.evaluate(Some(&config), &json!({"output": {"status": "approved"}})));
    assert!(!conditions.evaluate(Some(&config), &json!({"output": {"status": "rejected"}})));
}
